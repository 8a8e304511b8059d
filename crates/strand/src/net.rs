//! Blocking-style TCP over hooked I/O
//!
//! `TcpListener` and `TcpStream` look like their `std::net` namesakes but
//! route every call through [`hook`](crate::hook), so inside a reactor
//! fiber a read, write, accept or connect that would block suspends the
//! fiber instead of the worker thread.
//!
//! Create them from reactor fibers: the hook layer only tracks sockets
//! opened on a hooked thread.

use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use strand_runtime::{hook, TimeoutKind};

// ── Socket helpers ──────────────────────────────────────────────────

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn cvt_size(ret: libc::ssize_t) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

/// `SocketAddr` to a raw `(sockaddr_storage, socklen_t)` pair
fn socket_addr_to_raw(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr = libc::in_addr { s_addr: u32::from_ne_bytes(v4.ip().octets()) };
            (storage, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_flowinfo = v6.flowinfo();
            sin6.sin6_addr = libc::in6_addr { s6_addr: v6.ip().octets() };
            sin6.sin6_scope_id = v6.scope_id();
            (storage, std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

fn raw_to_socket_addr(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => Err(io::Error::new(io::ErrorKind::InvalidInput, "unknown address family")),
    }
}

type AddrFn = unsafe extern "C" fn(libc::c_int, *mut libc::sockaddr, *mut libc::socklen_t) -> libc::c_int;

fn query_addr(fd: RawFd, f: AddrFn) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    cvt(unsafe { f(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) })?;
    raw_to_socket_addr(&storage)
}

/// Owned socket fd, closed through the hook layer
struct Socket(RawFd);

impl Socket {
    fn new(addr: &SocketAddr) -> io::Result<Self> {
        let domain = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };
        let fd = hook::socket(domain, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0);
        cvt(fd).map(|_| Socket(fd))
    }

    fn set_timeout(&self, kind: TimeoutKind, timeout: Option<Duration>) -> io::Result<()> {
        if timeout == Some(Duration::ZERO) {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "zero timeout"));
        }
        cvt(hook::set_socket_timeout(self.0, kind, timeout)).map(drop)
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        hook::close(self.0);
    }
}

// ── Listener ────────────────────────────────────────────────────────

pub struct TcpListener {
    sock: Socket,
}

impl TcpListener {
    /// Bind and listen with `SO_REUSEADDR` set
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let sock = Socket::new(&addr)?;
        let one: libc::c_int = 1;
        cvt(unsafe {
            hook::setsockopt(
                sock.0,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                (&one as *const libc::c_int).cast(),
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        })?;
        let (raw, len) = socket_addr_to_raw(&addr);
        cvt(unsafe { libc::bind(sock.0, &raw as *const _ as *const libc::sockaddr, len) })?;
        cvt(unsafe { libc::listen(sock.0, 128) })?;
        Ok(Self { sock })
    }

    /// Wait for a connection; suspends the fiber while none is pending
    pub fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let fd = unsafe {
            hook::accept(self.sock.0, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
        };
        let sock = cvt(fd).map(Socket)?;
        let peer = raw_to_socket_addr(&storage)?;
        Ok((TcpStream { sock }, peer))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        query_addr(self.sock.0, libc::getsockname)
    }

    /// Bound how long `accept` waits; `None` waits forever
    pub fn set_accept_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.sock.set_timeout(TimeoutKind::Recv, timeout)
    }
}

impl AsRawFd for TcpListener {
    fn as_raw_fd(&self) -> RawFd {
        self.sock.0
    }
}

// ── Stream ──────────────────────────────────────────────────────────

pub struct TcpStream {
    sock: Socket,
}

impl TcpStream {
    /// Connect using the configured connect timeout
    pub fn connect(addr: SocketAddr) -> io::Result<Self> {
        let sock = Socket::new(&addr)?;
        let (raw, len) = socket_addr_to_raw(&addr);
        cvt(unsafe { hook::connect(sock.0, &raw as *const _ as *const libc::sockaddr, len) })?;
        Ok(Self { sock })
    }

    pub fn connect_timeout(addr: SocketAddr, timeout: Duration) -> io::Result<Self> {
        let sock = Socket::new(&addr)?;
        let (raw, len) = socket_addr_to_raw(&addr);
        let ms = timeout.as_millis().min(u64::MAX as u128 - 1) as u64;
        cvt(unsafe {
            hook::connect_with_timeout(sock.0, &raw as *const _ as *const libc::sockaddr, len, ms)
        })?;
        Ok(Self { sock })
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        query_addr(self.sock.0, libc::getpeername)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        query_addr(self.sock.0, libc::getsockname)
    }

    /// Reads fail with `TimedOut` after `timeout`; `None` waits forever
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.sock.set_timeout(TimeoutKind::Recv, timeout)
    }

    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.sock.set_timeout(TimeoutKind::Send, timeout)
    }

    pub fn set_nodelay(&self, on: bool) -> io::Result<()> {
        let v: libc::c_int = on as libc::c_int;
        cvt(unsafe {
            hook::setsockopt(
                self.sock.0,
                libc::IPPROTO_TCP,
                libc::TCP_NODELAY,
                (&v as *const libc::c_int).cast(),
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        })
        .map(drop)
    }

    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        let how = match how {
            Shutdown::Read => libc::SHUT_RD,
            Shutdown::Write => libc::SHUT_WR,
            Shutdown::Both => libc::SHUT_RDWR,
        };
        cvt(unsafe { libc::shutdown(self.sock.0, how) }).map(drop)
    }
}

impl Read for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        cvt_size(hook::read(self.sock.0, buf))
    }

    fn read_vectored(&mut self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        cvt_size(hook::readv(self.sock.0, bufs))
    }
}

impl Write for TcpStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        cvt_size(hook::send(self.sock.0, buf, libc::MSG_NOSIGNAL))
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        cvt_size(hook::writev(self.sock.0, bufs))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsRawFd for TcpStream {
    fn as_raw_fd(&self) -> RawFd {
        self.sock.0
    }
}

impl std::fmt::Debug for TcpStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpStream").field("fd", &self.sock.0).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Runtime, RuntimeConfig};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Instant;

    fn localhost() -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
    }

    #[test]
    fn test_addr_conversion() {
        let addrs = [
            "127.0.0.1:8080".parse::<SocketAddr>().unwrap(),
            "[::1]:443".parse::<SocketAddr>().unwrap(),
        ];
        for addr in addrs {
            let (raw, _) = socket_addr_to_raw(&addr);
            assert_eq!(raw_to_socket_addr(&raw).unwrap(), addr);
        }
    }

    #[test]
    fn test_echo_between_fibers() {
        let rt = Runtime::new(RuntimeConfig::new().num_threads(2).use_caller(false)).unwrap();
        let bound = Arc::new(Mutex::new(None));
        let reply = Arc::new(Mutex::new(Vec::new()));

        let b = bound.clone();
        rt.spawn(move || {
            let listener = TcpListener::bind(localhost()).unwrap();
            *b.lock() = Some(listener.local_addr().unwrap());
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = [0u8; 64];
            let n = conn.read(&mut buf).unwrap();
            conn.write_all(&buf[..n]).unwrap();
        })
        .unwrap();

        let (b, r) = (bound.clone(), reply.clone());
        rt.spawn(move || {
            let addr = loop {
                if let Some(addr) = *b.lock() {
                    break addr;
                }
                crate::sleep(Duration::from_millis(1));
            };
            let mut stream = TcpStream::connect(addr).unwrap();
            stream.write_all(b"ping").unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).unwrap();
            r.lock().extend_from_slice(&buf);
        })
        .unwrap();

        rt.shutdown();
        assert_eq!(reply.lock().as_slice(), b"ping");
    }

    #[test]
    fn test_read_timeout_kind() {
        let rt = Runtime::new(RuntimeConfig::new().num_threads(1).use_caller(false)).unwrap();
        let outcome = rt.run(|| {
            let listener = TcpListener::bind(localhost()).unwrap();
            let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
            let (_server, _) = listener.accept().unwrap();
            client.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
            let start = Instant::now();
            let err = client.read(&mut [0u8; 8]).unwrap_err();
            (err.kind(), start.elapsed())
        });

        let (kind, elapsed) = outcome.unwrap();
        assert_eq!(kind, io::ErrorKind::TimedOut);
        assert!(elapsed >= Duration::from_millis(45));
    }
}
