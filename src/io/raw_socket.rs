use std::ffi::CString;
use std::io;
use std::mem;
use std::os::fd::RawFd;

use super::IoError;

// linux/if_packet.h
const PACKET_OUTGOING: u8 = 4;
const PACKET_MR_PROMISC: libc::c_ushort = 1;

#[repr(C)]
struct PacketMreq {
    mr_ifindex: libc::c_int,
    mr_type: libc::c_ushort,
    mr_alen: libc::c_ushort,
    mr_address: [libc::c_uchar; 8],
}

// ==========================================
// 绑在一块网卡上的 AF_PACKET 原始套接字 (混杂、非阻塞)
// ==========================================
pub struct RawSocket {
    name: String,
    fd: RawFd,
}

impl RawSocket {
    pub fn open(name: &str) -> Result<Self, IoError> {
        let ifindex = ifindex(name)?;
        let protocol = (libc::ETH_P_ALL as u16).to_be();

        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                protocol as i32,
            )
        };
        if fd < 0 {
            return Err(socket_error(name, "socket"));
        }
        // 先接住 fd，后面出错时 Drop 负责关掉
        let sock = Self {
            name: name.to_string(),
            fd,
        };

        let mut sll: libc::sockaddr_ll = unsafe { mem::zeroed() };
        sll.sll_family = libc::AF_PACKET as u16;
        sll.sll_protocol = protocol;
        sll.sll_ifindex = ifindex;
        let ret = unsafe {
            libc::bind(
                fd,
                &sll as *const _ as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(socket_error(name, "bind"));
        }

        let mreq = PacketMreq {
            mr_ifindex: ifindex,
            mr_type: PACKET_MR_PROMISC,
            mr_alen: 0,
            mr_address: [0; 8],
        };
        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_PACKET,
                libc::PACKET_ADD_MEMBERSHIP,
                &mreq as *const _ as *const libc::c_void,
                mem::size_of::<PacketMreq>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(socket_error(name, "promiscuous mode"));
        }

        Ok(sock)
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// 收一帧到 `buf`，返回长度；没有可读的返回 `None`。
    /// 内核标成 OUTGOING 的帧是我们自己注入的，跳过。
    pub fn receive(&self, buf: &mut [u8]) -> Result<Option<usize>, IoError> {
        loop {
            let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
            let mut addr_len = mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
            let n = unsafe {
                libc::recvfrom(
                    self.fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    0,
                    &mut addr as *mut _ as *mut libc::sockaddr,
                    &mut addr_len,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::WouldBlock => return Ok(None),
                    io::ErrorKind::Interrupted => continue,
                    _ => {
                        return Err(IoError::Socket {
                            iface: self.name.clone(),
                            op: "recvfrom",
                            source: err,
                        });
                    }
                }
            }
            if addr.sll_pkttype == PACKET_OUTGOING {
                continue;
            }
            return Ok(Some(n as usize));
        }
    }

    pub fn inject(&self, frame: &[u8]) -> bool {
        let n = unsafe { libc::send(self.fd, frame.as_ptr() as *const libc::c_void, frame.len(), 0) };
        n >= 0 && n as usize == frame.len()
    }
}

impl Drop for RawSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

fn ifindex(name: &str) -> Result<i32, IoError> {
    let cname = CString::new(name).map_err(|_| IoError::BadName(name.to_string()))?;
    let idx = unsafe { libc::if_nametoindex(cname.as_ptr()) };
    if idx == 0 {
        return Err(IoError::NoSuchInterface(name.to_string()));
    }
    Ok(idx as i32)
}

fn socket_error(iface: &str, op: &'static str) -> IoError {
    IoError::Socket {
        iface: iface.to_string(),
        op,
        source: io::Error::last_os_error(),
    }
}
