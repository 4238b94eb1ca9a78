use std::net::IpAddr;

use thiserror::Error;

use crate::packet::{IPPROTO_ICMP, IPPROTO_ICMPV6, IPPROTO_TCP, IPPROTO_UDP, IpHeader, Packet};

mod parser;

// ==========================================
// 类 tcpdump 的过滤表达式：编译一次，逐包匹配
// ==========================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    #[error("unexpected end of filter expression")]
    UnexpectedEnd,
    #[error("unexpected token '{0}'")]
    UnexpectedToken(String),
    #[error("unexpected character '{0}'")]
    BadChar(char),
    #[error("invalid host address '{0}'")]
    BadAddress(String),
    #[error("invalid network '{0}'")]
    BadNet(String),
    #[error("invalid port '{0}'")]
    BadPort(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Ip,
    Ip6,
    Tcp,
    Udp,
    Icmp,
    Vlan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qualifier {
    Src,
    Dst,
    Either,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Any,
    Proto(Proto),
    Host(Qualifier, IpAddr),
    Net(Qualifier, IpAddr, u8),
    /// 闭区间
    Port(Qualifier, u16, u16),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    fn eval(&self, p: &Packet) -> bool {
        match self {
            Expr::Any => true,
            Expr::Proto(proto) => match proto {
                Proto::Ip => matches!(p.ip, IpHeader::V4(_)),
                Proto::Ip6 => matches!(p.ip, IpHeader::V6(_)),
                Proto::Tcp => p.ip.protocol() == IPPROTO_TCP,
                Proto::Udp => p.ip.protocol() == IPPROTO_UDP,
                Proto::Icmp => match p.ip {
                    IpHeader::V4(_) => p.ip.protocol() == IPPROTO_ICMP,
                    IpHeader::V6(_) => p.ip.protocol() == IPPROTO_ICMPV6,
                },
                Proto::Vlan => p.vlan.is_some(),
            },
            Expr::Host(q, addr) => qualified(*q, |src| {
                let ip = if src { p.ip.src() } else { p.ip.dst() };
                ip == *addr
            }),
            Expr::Net(q, net, prefix) => qualified(*q, |src| {
                let ip = if src { p.ip.src() } else { p.ip.dst() };
                in_prefix(ip, *net, *prefix)
            }),
            Expr::Port(q, lo, hi) => {
                // 只解析了 TCP 端口；其它协议上 port 原语不成立
                let Some(tcp) = &p.tcp else {
                    return false;
                };
                qualified(*q, |src| {
                    let port = if src { tcp.src_port } else { tcp.dst_port };
                    (*lo..=*hi).contains(&port)
                })
            }
            Expr::Not(e) => !e.eval(p),
            Expr::And(a, b) => a.eval(p) && b.eval(p),
            Expr::Or(a, b) => a.eval(p) || b.eval(p),
        }
    }
}

fn qualified(q: Qualifier, test: impl Fn(bool) -> bool) -> bool {
    match q {
        Qualifier::Src => test(true),
        Qualifier::Dst => test(false),
        Qualifier::Either => test(true) || test(false),
    }
}

fn in_prefix(ip: IpAddr, net: IpAddr, prefix: u8) -> bool {
    match (ip, net) {
        (IpAddr::V4(ip), IpAddr::V4(net)) => {
            let mask = u32::MAX.checked_shl(32 - prefix as u32).unwrap_or(0);
            u32::from(ip) & mask == u32::from(net) & mask
        }
        (IpAddr::V6(ip), IpAddr::V6(net)) => {
            let mask = u128::MAX.checked_shl(128 - prefix as u32).unwrap_or(0);
            u128::from(ip) & mask == u128::from(net) & mask
        }
        _ => false,
    }
}

/// 编译好的过滤器。编译失败的表达式用 `never()` 占位，谁都不匹配。
#[derive(Debug, Clone)]
pub struct PacketFilter {
    expr: Option<Expr>,
}

impl PacketFilter {
    pub fn compile(src: &str) -> Result<Self, FilterError> {
        Ok(Self {
            expr: Some(parser::parse(src)?),
        })
    }

    pub fn never() -> Self {
        Self { expr: None }
    }

    pub fn matches(&self, packet: &Packet) -> bool {
        self.expr.as_ref().is_some_and(|e| e.eval(packet))
    }
}
