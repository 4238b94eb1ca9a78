// packet.rs
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;

use crate::io::Direction;

pub const ETHER_HEADER_LEN: usize = 14;
pub const VLAN_HEADER_LEN: usize = 18;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;
const ETHERTYPE_VLAN: u16 = 0x8100;

const IPV4_MIN_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;
const TCP_MIN_HEADER_LEN: usize = 20;

const IP_FLAG_DONT_FRAGMENT: u16 = 0x4000;
const IP_FRAG_OFFSET_MASK: u16 = 0x1fff;

pub const IPPROTO_HOPOPTS: u8 = 0;
pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_ROUTING: u8 = 43;
pub const IPPROTO_FRAGMENT: u8 = 44;
pub const IPPROTO_ICMPV6: u8 = 58;
pub const IPPROTO_DSTOPTS: u8 = 60;

const TCP_FLAG_FIN: u8 = 0x01;
const TCP_FLAG_SYN: u8 = 0x02;
const TCP_FLAG_RST: u8 = 0x04;
const TCP_FLAG_ACK: u8 = 0x10;

/// 解码失败的原因。分发器对所有变体一视同仁：原样转发，不跟踪。
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("not an IP frame (ethertype {0:#06x})")]
    NotIp(u16),
    #[error("{layer} header truncated: need {need} bytes, have {have}")]
    Truncated {
        layer: &'static str,
        need: usize,
        have: usize,
    },
    #[error("bad IP version {found}, expected {expected}")]
    BadVersion { expected: u8, found: u8 },
    #[error("bad header length field {0}")]
    BadHeaderLength(u8),
    #[error("declared length {declared} inconsistent with {available} captured bytes")]
    LengthMismatch { declared: usize, available: usize },
    #[error("TCP segment is a non-first IP fragment")]
    Fragmented,
    #[error("unsupported IPv6 next header {0}")]
    UnsupportedHeader(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Header {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub protocol: u8,
    pub is_fragment: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv6Header {
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
    /// 扩展头链走完之后的上层协议
    pub next_header: u8,
    pub is_fragment: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpHeader {
    V4(Ipv4Header),
    V6(Ipv6Header),
}

impl IpHeader {
    pub fn src(&self) -> IpAddr {
        match self {
            IpHeader::V4(h) => IpAddr::V4(h.src),
            IpHeader::V6(h) => IpAddr::V6(h.src),
        }
    }

    pub fn dst(&self) -> IpAddr {
        match self {
            IpHeader::V4(h) => IpAddr::V4(h.dst),
            IpHeader::V6(h) => IpAddr::V6(h.dst),
        }
    }

    pub fn protocol(&self) -> u8 {
        match self {
            IpHeader::V4(h) => h.protocol,
            IpHeader::V6(h) => h.next_header,
        }
    }

    pub fn is_fragment(&self) -> bool {
        match self {
            IpHeader::V4(h) => h.is_fragment,
            IpHeader::V6(h) => h.is_fragment,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack_seq: u32,
    pub syn: bool,
    pub ack: bool,
    pub rst: bool,
    pub fin: bool,
    /// seq + 负载长度
    pub end_seq: u32,
}

impl TcpHeader {
    pub fn is_pure_syn(&self) -> bool {
        self.syn && !self.ack
    }

    pub fn has_payload(&self) -> bool {
        self.end_seq != self.seq
    }
}

// ==========================================
// 解码后的数据包：自己持有整帧的拷贝
// ==========================================
#[derive(Debug, Clone)]
pub struct Packet {
    data: Vec<u8>,
    pub from: Direction,
    /// 带了 802.1Q 标签时的 VLAN id
    pub vlan: Option<u16>,
    pub ip: IpHeader,
    pub tcp: Option<TcpHeader>,
}

impl AsRef<[u8]> for Packet {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl Packet {
    /// 把一帧以太网数据解成结构化头部。
    ///
    /// 每次读字段之前都先做长度检查；只有全部成功才会分配一份帧大小的缓冲区。
    pub fn decode(frame: &[u8], from: Direction) -> Result<Packet, DecodeError> {
        if frame.len() < ETHER_HEADER_LEN {
            return Err(DecodeError::Truncated {
                layer: "ethernet",
                need: ETHER_HEADER_LEN,
                have: frame.len(),
            });
        }

        let mut ethertype = be16(frame, 12);
        let mut l3_offset = ETHER_HEADER_LEN;
        let mut vlan = None;

        if ethertype == ETHERTYPE_VLAN {
            if frame.len() < VLAN_HEADER_LEN {
                return Err(DecodeError::Truncated {
                    layer: "vlan",
                    need: VLAN_HEADER_LEN,
                    have: frame.len(),
                });
            }
            vlan = Some(be16(frame, 14) & 0x0fff);
            ethertype = be16(frame, 16);
            l3_offset = VLAN_HEADER_LEN;
        }

        let l3 = &frame[l3_offset..];
        let (ip, tcp) = match ethertype {
            ETHERTYPE_IPV4 => parse_ipv4(l3)?,
            ETHERTYPE_IPV6 => parse_ipv6(l3)?,
            other => return Err(DecodeError::NotIp(other)),
        };

        Ok(Packet {
            data: frame.to_vec(),
            from,
            vlan,
            ip,
            tcp,
        })
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.data.len()
    }
}

fn be16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

fn be32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn parse_ipv4(buf: &[u8]) -> Result<(IpHeader, Option<TcpHeader>), DecodeError> {
    if buf.len() < IPV4_MIN_HEADER_LEN {
        return Err(DecodeError::Truncated {
            layer: "ipv4",
            need: IPV4_MIN_HEADER_LEN,
            have: buf.len(),
        });
    }

    let version = buf[0] >> 4;
    let ihl = buf[0] & 0x0f;
    if ihl < 5 {
        return Err(DecodeError::BadHeaderLength(ihl));
    }
    if version != 4 {
        return Err(DecodeError::BadVersion {
            expected: 4,
            found: version,
        });
    }

    let header_len = ihl as usize * 4;
    if buf.len() < header_len {
        return Err(DecodeError::Truncated {
            layer: "ipv4",
            need: header_len,
            have: buf.len(),
        });
    }

    let total_len = be16(buf, 2);
    let frag_off = be16(buf, 6);
    let protocol = buf[9];

    let header = Ipv4Header {
        src: Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]),
        dst: Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]),
        protocol,
        // MF 位或者非零偏移都算分片，只打标记不重组
        is_fragment: frag_off & !IP_FLAG_DONT_FRAGMENT != 0,
    };

    if protocol != IPPROTO_TCP {
        return Ok((IpHeader::V4(header), None));
    }

    if frag_off & IP_FRAG_OFFSET_MASK != 0 {
        return Err(DecodeError::Fragmented);
    }

    // 负载长度以 IP 头声明为准（以太网最小帧会补零），但不超过实际抓到的字节
    // TSO 抓包时 tot_len 可能是 0，这时只能信抓包长度
    let segment_end = match total_len as usize {
        0 => buf.len(),
        declared if declared < header_len => {
            return Err(DecodeError::LengthMismatch {
                declared,
                available: buf.len(),
            });
        }
        declared => declared.min(buf.len()),
    };

    let tcp = parse_tcp(&buf[header_len..segment_end])?;
    Ok((IpHeader::V4(header), Some(tcp)))
}

fn parse_ipv6(buf: &[u8]) -> Result<(IpHeader, Option<TcpHeader>), DecodeError> {
    if buf.len() < IPV6_HEADER_LEN {
        return Err(DecodeError::Truncated {
            layer: "ipv6",
            need: IPV6_HEADER_LEN,
            have: buf.len(),
        });
    }

    let version = buf[0] >> 4;
    if version != 6 {
        return Err(DecodeError::BadVersion {
            expected: 6,
            found: version,
        });
    }

    let payload_len = be16(buf, 4);
    if buf.len() < IPV6_HEADER_LEN + payload_len as usize {
        return Err(DecodeError::LengthMismatch {
            declared: IPV6_HEADER_LEN + payload_len as usize,
            available: buf.len(),
        });
    }

    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    src.copy_from_slice(&buf[8..24]);
    dst.copy_from_slice(&buf[24..40]);

    let mut next_header = buf[6];
    let mut ext_len = 0usize;
    let mut is_fragment = false;

    // 沿着扩展头链一直走到 TCP；每一步都先保证剩下的字节够一个最小 TCP 头
    loop {
        let need = IPV6_HEADER_LEN + TCP_MIN_HEADER_LEN + ext_len;
        if buf.len() < need {
            return Err(DecodeError::Truncated {
                layer: "ipv6 extension",
                need,
                have: buf.len(),
            });
        }

        let at = IPV6_HEADER_LEN + ext_len;
        match next_header {
            IPPROTO_HOPOPTS | IPPROTO_ROUTING | IPPROTO_DSTOPTS => {
                next_header = buf[at];
                ext_len += 8 + 8 * buf[at + 1] as usize;
            }
            IPPROTO_FRAGMENT => {
                let fragment_offset = be16(buf, at + 2) >> 3;
                if fragment_offset != 0 {
                    return Err(DecodeError::Fragmented);
                }
                is_fragment = true;
                next_header = buf[at];
                ext_len += 8;
            }
            IPPROTO_TCP => break,
            other => return Err(DecodeError::UnsupportedHeader(other)),
        }
    }

    if (payload_len as usize) < ext_len {
        return Err(DecodeError::LengthMismatch {
            declared: payload_len as usize,
            available: ext_len,
        });
    }

    let segment = &buf[IPV6_HEADER_LEN + ext_len..IPV6_HEADER_LEN + payload_len as usize];
    let tcp = parse_tcp(segment)?;

    let header = Ipv6Header {
        src: Ipv6Addr::from(src),
        dst: Ipv6Addr::from(dst),
        next_header,
        is_fragment,
    };
    Ok((IpHeader::V6(header), Some(tcp)))
}

fn parse_tcp(segment: &[u8]) -> Result<TcpHeader, DecodeError> {
    if segment.len() < TCP_MIN_HEADER_LEN {
        return Err(DecodeError::Truncated {
            layer: "tcp",
            need: TCP_MIN_HEADER_LEN,
            have: segment.len(),
        });
    }

    let data_offset = segment[12] >> 4;
    let header_len = data_offset as usize * 4;
    if data_offset < 5 || header_len > segment.len() {
        return Err(DecodeError::BadHeaderLength(data_offset));
    }

    let flags = segment[13];
    let seq = be32(segment, 4);
    let payload_len = (segment.len() - header_len) as u32;

    Ok(TcpHeader {
        src_port: be16(segment, 0),
        dst_port: be16(segment, 2),
        seq,
        ack_seq: be32(segment, 8),
        syn: flags & TCP_FLAG_SYN != 0,
        ack: flags & TCP_FLAG_ACK != 0,
        rst: flags & TCP_FLAG_RST != 0,
        fin: flags & TCP_FLAG_FIN != 0,
        end_seq: seq.wrapping_add(payload_len),
    })
}

// ==========================================
// 测试用的造包工具
// ==========================================
#[cfg(test)]
pub mod test_frames {
    use std::net::IpAddr;

    use super::Packet;
    use crate::io::Direction;

    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const ACK: u8 = 0x10;

    /// 造一个以太网 + IPv4/IPv6 + TCP 的帧，地址族跟着 `src` 走
    #[allow(clippy::too_many_arguments)]
    pub fn tcp_frame(
        src: &str,
        sport: u16,
        dst: &str,
        dport: u16,
        flags: u8,
        seq: u32,
        ack: u32,
        payload_len: usize,
    ) -> Vec<u8> {
        let src: IpAddr = src.parse().expect("bad src address");
        let dst: IpAddr = dst.parse().expect("bad dst address");

        let mut tcp = Vec::with_capacity(20 + payload_len);
        tcp.extend_from_slice(&sport.to_be_bytes());
        tcp.extend_from_slice(&dport.to_be_bytes());
        tcp.extend_from_slice(&seq.to_be_bytes());
        tcp.extend_from_slice(&ack.to_be_bytes());
        tcp.push(5 << 4);
        tcp.push(flags);
        tcp.extend_from_slice(&0xffffu16.to_be_bytes());
        tcp.extend_from_slice(&[0, 0, 0, 0]);
        tcp.resize(20 + payload_len, 0xab);

        let mut frame = ethernet(match (src, dst) {
            (IpAddr::V4(_), IpAddr::V4(_)) => 0x0800,
            (IpAddr::V6(_), IpAddr::V6(_)) => 0x86dd,
            _ => panic!("mixed address families"),
        });

        match (src, dst) {
            (IpAddr::V4(s), IpAddr::V4(d)) => {
                frame.extend_from_slice(&ipv4_header(s.octets(), d.octets(), 6, 0x4000, tcp.len()));
            }
            (IpAddr::V6(s), IpAddr::V6(d)) => {
                frame.extend_from_slice(&ipv6_header(s.octets(), d.octets(), 6, tcp.len()));
            }
            _ => unreachable!(),
        }
        frame.extend_from_slice(&tcp);
        frame
    }

    pub fn ethernet(ethertype: u16) -> Vec<u8> {
        let mut frame = vec![0x02, 0, 0, 0, 0, 0x01, 0x02, 0, 0, 0, 0, 0x02];
        frame.extend_from_slice(&ethertype.to_be_bytes());
        frame
    }

    pub fn ipv4_header(src: [u8; 4], dst: [u8; 4], proto: u8, frag_off: u16, payload: usize) -> Vec<u8> {
        let mut h = vec![0x45, 0];
        h.extend_from_slice(&((20 + payload) as u16).to_be_bytes());
        h.extend_from_slice(&[0, 0]);
        h.extend_from_slice(&frag_off.to_be_bytes());
        h.extend_from_slice(&[64, proto, 0, 0]);
        h.extend_from_slice(&src);
        h.extend_from_slice(&dst);
        h
    }

    pub fn ipv6_header(src: [u8; 16], dst: [u8; 16], next: u8, payload: usize) -> Vec<u8> {
        let mut h = vec![0x60, 0, 0, 0];
        h.extend_from_slice(&(payload as u16).to_be_bytes());
        h.extend_from_slice(&[next, 64]);
        h.extend_from_slice(&src);
        h.extend_from_slice(&dst);
        h
    }

    /// 直接解成 Packet，测试里最常用
    #[allow(clippy::too_many_arguments)]
    pub fn tcp_packet(
        from: Direction,
        src: &str,
        sport: u16,
        dst: &str,
        dport: u16,
        flags: u8,
        seq: u32,
        ack: u32,
        payload_len: usize,
    ) -> Packet {
        let frame = tcp_frame(src, sport, dst, dport, flags, seq, ack, payload_len);
        Packet::decode(&frame, from).expect("test frame must decode")
    }
}
