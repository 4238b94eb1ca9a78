// five_tuple.rs
use crate::packet::{IpHeader, Packet};

// 与方向无关的连接标识：两端按 (地址, 端口) 逐字节比较，小的放 low，大的放 high。
// A->B 和 B->A 算出来的 key 完全一样。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiveTuple<const N: usize> {
    pub addr_low: [u8; N],
    pub port_low: u16,
    pub addr_high: [u8; N],
    pub port_high: u16,
}

pub type KeyV4 = FiveTuple<4>;
pub type KeyV6 = FiveTuple<16>;

impl<const N: usize> FiveTuple<N> {
    pub fn new(src: [u8; N], src_port: u16, dst: [u8; N], dst_port: u16) -> Self {
        // 先比地址，地址相同再比端口
        if (src, src_port) <= (dst, dst_port) {
            Self {
                addr_low: src,
                port_low: src_port,
                addr_high: dst,
                port_high: dst_port,
            }
        } else {
            Self {
                addr_low: dst,
                port_low: dst_port,
                addr_high: src,
                port_high: src_port,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionKey {
    V4(KeyV4),
    V6(KeyV6),
}

impl ConnectionKey {
    /// 只接受带 TCP 头的包；没有 TCP 头属于调用方的编程错误，直接 panic。
    pub fn for_packet(packet: &Packet) -> Self {
        let Some(tcp) = packet.tcp.as_ref() else {
            panic!("connection key requested for a packet without a TCP header");
        };

        match &packet.ip {
            IpHeader::V4(ip) => ConnectionKey::V4(FiveTuple::new(
                ip.src.octets(),
                tcp.src_port,
                ip.dst.octets(),
                tcp.dst_port,
            )),
            IpHeader::V6(ip) => ConnectionKey::V6(FiveTuple::new(
                ip.src.octets(),
                tcp.src_port,
                ip.dst.octets(),
                tcp.dst_port,
            )),
        }
    }
}

impl std::fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionKey::V4(k) => write!(
                f,
                "{}:{} <-> {}:{}",
                std::net::Ipv4Addr::from(k.addr_low),
                k.port_low,
                std::net::Ipv4Addr::from(k.addr_high),
                k.port_high
            ),
            ConnectionKey::V6(k) => write!(
                f,
                "[{}]:{} <-> [{}]:{}",
                std::net::Ipv6Addr::from(k.addr_low),
                k.port_low,
                std::net::Ipv6Addr::from(k.addr_high),
                k.port_high
            ),
        }
    }
}
