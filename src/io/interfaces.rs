use std::io;
use std::path::Path;
use std::time::Duration;

use log::{info, warn};

use super::{Direction, IoError, PacketIo, PcapDumper, RawSocket};
use crate::packet::Packet;

/// 网桥的一对网卡，外加可选的抓包文件
pub struct Interfaces {
    sockets: [RawSocket; 2],
    dumper: Option<PcapDumper>,
}

impl Interfaces {
    pub fn open(downlink: &str, uplink: &str, dump: Option<&Path>) -> Result<Self, IoError> {
        let sockets = [RawSocket::open(downlink)?, RawSocket::open(uplink)?];
        info!("Bridging {} (downlink) <-> {} (uplink)", downlink, uplink);

        let dumper = match dump {
            Some(path) => {
                let d = PcapDumper::create(path)?;
                info!("Recording tracked packets to {}", path.display());
                Some(d)
            }
            None => None,
        };

        Ok(Self { sockets, dumper })
    }

    /// 等到有网卡可读或者超时。被信号打断时当作没有可读。
    pub fn poll(&self, timeout: Option<Duration>) -> Result<[bool; 2], IoError> {
        let mut fds = [
            libc::pollfd {
                fd: self.sockets[0].fd(),
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: self.sockets[1].fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        let timeout_ms = match timeout {
            // 向上取整，避免 0.4ms 被截成 0 变成忙等
            Some(t) => t.as_micros().div_ceil(1000).min(i32::MAX as u128) as libc::c_int,
            None => -1,
        };

        let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok([false, false]);
            }
            return Err(IoError::Poll(err));
        }

        let ready = |fd: &libc::pollfd| fd.revents & (libc::POLLIN | libc::POLLERR) != 0;
        Ok([ready(&fds[0]), ready(&fds[1])])
    }

    pub fn receive(&self, from: Direction, buf: &mut [u8]) -> Result<Option<usize>, IoError> {
        self.sockets[from.index()].receive(buf)
    }

    pub fn flush(&mut self) {
        if let Some(d) = self.dumper.as_mut() {
            if let Err(e) = d.flush() {
                warn!("Flushing packet dump failed: {}", e);
            }
        }
    }
}

impl PacketIo for Interfaces {
    fn inject(&mut self, to: Direction, frame: &[u8]) -> bool {
        self.sockets[to.index()].inject(frame)
    }

    fn record(&mut self, packet: &Packet) {
        let Some(d) = self.dumper.as_mut() else {
            return;
        };
        if let Err(e) = d.dump(packet.as_ref()) {
            warn!("Writing packet dump failed ({}); recording disabled", e);
            self.dumper = None;
        }
    }
}
