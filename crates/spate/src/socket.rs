use std::{
    io, mem,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    ptr,
    time::Duration,
};

use crate::config::Proto;

/// Thin safe wrapper over a raw BSD socket.
///
/// The engine needs option knobs std sockets do not expose (REUSEADDR before
/// bind, TOS / traffic class, send/receive timeouts), so the fd is driven
/// through `libc` directly. All methods take `&self`: syscalls on one fd are
/// thread-safe, and [`Socket::shutdown`] is exactly the cross-thread unblock
/// used by the forced-stop path. The fd closes when the socket drops.
pub(crate) struct Socket {
    fd: OwnedFd,
    v6: bool,
}

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 { Err(io::Error::last_os_error()) } else { Ok(ret) }
}

fn cvt_size(ret: libc::ssize_t) -> io::Result<usize> {
    if ret == -1 { Err(io::Error::last_os_error()) } else { Ok(ret as usize) }
}

impl Socket {
    pub fn new(v6: bool, proto: Proto) -> io::Result<Self> {
        let domain = if v6 { libc::AF_INET6 } else { libc::AF_INET };
        let ty = match proto {
            Proto::Tcp => libc::SOCK_STREAM,
            Proto::Udp => libc::SOCK_DGRAM,
        };
        let fd = cvt(unsafe { libc::socket(domain, ty | libc::SOCK_CLOEXEC, 0) })?;
        Ok(Self { fd: unsafe { OwnedFd::from_raw_fd(fd) }, v6 })
    }

    pub fn raw(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    fn setsockopt<T>(&self, level: libc::c_int, name: libc::c_int, value: &T) -> io::Result<()> {
        cvt(unsafe {
            libc::setsockopt(
                self.raw(),
                level,
                name,
                ptr::from_ref(value).cast(),
                mem::size_of::<T>() as libc::socklen_t,
            )
        })?;
        Ok(())
    }

    pub fn set_reuseaddr(&self) -> io::Result<()> {
        self.setsockopt(libc::SOL_SOCKET, libc::SO_REUSEADDR, &1_i32)
    }

    pub fn set_v6only(&self) -> io::Result<()> {
        self.setsockopt(libc::IPPROTO_IPV6, libc::IPV6_V6ONLY, &1_i32)
    }

    /// IPv4 TOS byte or IPv6 traffic class, depending on the socket family.
    pub fn set_tos(&self, tos: u8) -> io::Result<()> {
        let value = libc::c_int::from(tos);
        if self.v6 {
            self.setsockopt(libc::IPPROTO_IPV6, libc::IPV6_TCLASS, &value)
        } else {
            self.setsockopt(libc::IPPROTO_IP, libc::IP_TOS, &value)
        }
    }

    pub fn set_recv_timeout(&self, timeout: Duration) -> io::Result<()> {
        self.setsockopt(libc::SOL_SOCKET, libc::SO_RCVTIMEO, &timeval_of(timeout))
    }

    pub fn set_send_timeout(&self, timeout: Duration) -> io::Result<()> {
        self.setsockopt(libc::SOL_SOCKET, libc::SO_SNDTIMEO, &timeval_of(timeout))
    }

    pub fn bind(&self, addr: SocketAddr) -> io::Result<()> {
        let (storage, len) = sockaddr_from(addr);
        cvt(unsafe { libc::bind(self.raw(), ptr::from_ref(&storage).cast(), len) })?;
        Ok(())
    }

    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        cvt(unsafe { libc::listen(self.raw(), backlog) })?;
        Ok(())
    }

    pub fn accept(&self) -> io::Result<(Self, SocketAddr)> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let fd = cvt(unsafe {
            libc::accept(self.raw(), ptr::from_mut(&mut storage).cast(), &mut len)
        })?;
        let sock = Self { fd: unsafe { OwnedFd::from_raw_fd(fd) }, v6: self.v6 };
        let peer = sockaddr_to(&storage)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad peer address"))?;
        Ok((sock, peer))
    }

    pub fn connect(&self, addr: SocketAddr) -> io::Result<()> {
        let (storage, len) = sockaddr_from(addr);
        cvt(unsafe { libc::connect(self.raw(), ptr::from_ref(&storage).cast(), len) })?;
        Ok(())
    }

    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        cvt_size(unsafe {
            libc::send(self.raw(), buf.as_ptr().cast(), buf.len(), libc::MSG_NOSIGNAL)
        })
    }

    pub fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        let (storage, len) = sockaddr_from(addr);
        cvt_size(unsafe {
            libc::sendto(
                self.raw(),
                buf.as_ptr().cast(),
                buf.len(),
                libc::MSG_NOSIGNAL,
                ptr::from_ref(&storage).cast(),
                len,
            )
        })
    }

    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        cvt_size(unsafe { libc::recv(self.raw(), buf.as_mut_ptr().cast(), buf.len(), 0) })
    }

    /// Receives one datagram. The sender address is `None` when the kernel
    /// reports none, e.g. for the zero-length wakeup after a shutdown.
    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, Option<SocketAddr>)> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let received = cvt_size(unsafe {
            libc::recvfrom(
                self.raw(),
                buf.as_mut_ptr().cast(),
                buf.len(),
                0,
                ptr::from_mut(&mut storage).cast(),
                &mut len,
            )
        })?;
        Ok((received, sockaddr_to(&storage)))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        cvt(unsafe {
            libc::getsockname(self.raw(), ptr::from_mut(&mut storage).cast(), &mut len)
        })?;
        sockaddr_to(&storage)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad local address"))
    }

    /// Unblocks any thread sleeping in `recv`/`recvfrom`/`accept` on this
    /// socket. ENOTCONN from an unconnected UDP socket is expected and
    /// ignored; the kernel still wakes the sleeper.
    pub fn shutdown(&self) {
        unsafe { libc::shutdown(self.raw(), libc::SHUT_RDWR) };
    }
}

fn timeval_of(timeout: Duration) -> libc::timeval {
    libc::timeval {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_usec: timeout.subsec_micros() as libc::suseconds_t,
    }
}

fn sockaddr_from(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr { s_addr: u32::from_ne_bytes(v4.ip().octets()) },
                sin_zero: [0; 8],
            };
            unsafe { ptr::write(ptr::from_mut(&mut storage).cast(), sin) };
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr { s6_addr: v6.ip().octets() },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe { ptr::write(ptr::from_mut(&mut storage).cast(), sin6) };
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

fn sockaddr_to(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match libc::c_int::from(storage.ss_family) {
        libc::AF_INET => {
            let sin: &libc::sockaddr_in = unsafe { &*ptr::from_ref(storage).cast() };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            let sin6: &libc::sockaddr_in6 = unsafe { &*ptr::from_ref(storage).cast() };
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use super::*;

    #[test]
    fn sockaddr_conversion_roundtrip() {
        let v4: SocketAddr = "192.168.7.9:5001".parse().unwrap();
        let (storage, _) = sockaddr_from(v4);
        assert_eq!(sockaddr_to(&storage), Some(v4));

        let v6: SocketAddr = "[fe80::1]:6666".parse().unwrap();
        let (storage, _) = sockaddr_from(v6);
        assert_eq!(sockaddr_to(&storage), Some(v6));
    }

    #[test]
    fn bind_assigns_ephemeral_port() {
        let sock = Socket::new(false, Proto::Udp).unwrap();
        sock.set_reuseaddr().unwrap();
        sock.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let local = sock.local_addr().unwrap();
        assert_eq!(local.ip(), "127.0.0.1".parse::<IpAddr>().unwrap());
        assert_ne!(local.port(), 0);
    }

    #[test]
    fn datagram_roundtrip_on_loopback() {
        let rx = Socket::new(false, Proto::Udp).unwrap();
        rx.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let target = rx.local_addr().unwrap();

        let tx = Socket::new(false, Proto::Udp).unwrap();
        assert_eq!(tx.send_to(b"ping", target).unwrap(), 4);

        let mut buf = [0_u8; 16];
        let (received, from) = rx.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..received], b"ping");
        assert!(from.is_some());
    }

    #[test]
    fn recv_timeout_expires() {
        let sock = Socket::new(false, Proto::Udp).unwrap();
        sock.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        sock.set_recv_timeout(Duration::from_millis(50)).unwrap();
        let mut buf = [0_u8; 16];
        let err = sock.recv_from(&mut buf).unwrap_err();
        assert!(matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut));
    }
}
