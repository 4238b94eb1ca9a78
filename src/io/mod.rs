use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::packet::Packet;

mod interfaces;
mod pcap_dumper;
mod raw_socket;

pub use interfaces::Interfaces;
pub use pcap_dumper::PcapDumper;
pub use raw_socket::RawSocket;

#[derive(Debug, Error)]
pub enum IoError {
    #[error("invalid interface name '{0}'")]
    BadName(String),
    #[error("no such interface '{0}'")]
    NoSuchInterface(String),
    #[error("{op} on {iface} failed: {source}")]
    Socket {
        iface: String,
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("poll failed: {0}")]
    Poll(#[source] io::Error),
    #[error("cannot write packet dump {}: {source}", .path.display())]
    Dump {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// 网桥的两条腿
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Downlink,
    Uplink,
}

impl Direction {
    /// 对面那条腿
    pub fn other(self) -> Self {
        match self {
            Direction::Downlink => Direction::Uplink,
            Direction::Uplink => Direction::Downlink,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Direction::Downlink => 0,
            Direction::Uplink => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Direction::Downlink => "downlink",
            Direction::Uplink => "uplink",
        }
    }
}

// 流对象和分发器只认这个接口，真网卡和测试桩都实现它
pub trait PacketIo {
    /// 从 `to` 这条腿把整帧发出去
    fn inject(&mut self, to: Direction, frame: &[u8]) -> bool;

    /// 抓包落盘（可选）
    fn record(&mut self, _packet: &Packet) {}
}
