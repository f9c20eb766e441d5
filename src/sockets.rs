//! Socket syscall layer.
//!
//! [`Socket`] owns a descriptor and closes it on drop; the free functions
//! operate on borrowed raw descriptors for the connection hot path.
//! Every descriptor created here is non-blocking and close-on-exec.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use socket2::{Domain, Protocol, SockAddr, Type};
use tracing::warn;

use crate::addr::InetAddr;

/// An owned TCP socket.
#[derive(Debug)]
pub struct Socket {
    inner: socket2::Socket,
}

impl Socket {
    /// Create a non-blocking, close-on-exec TCP socket in the given family.
    pub fn new_nonblocking(ipv6: bool) -> io::Result<Socket> {
        let domain = if ipv6 { Domain::IPV6 } else { Domain::IPV4 };
        let inner = socket2::Socket::new(
            domain,
            Type::STREAM.nonblocking().cloexec(),
            Some(Protocol::TCP),
        )?;
        Ok(Socket { inner })
    }

    /// Wrap an already-connected descriptor (e.g. from `accept`).
    pub fn from_owned(fd: OwnedFd) -> Socket {
        Socket { inner: fd.into() }
    }

    /// The raw descriptor. The socket keeps ownership.
    #[inline]
    pub fn fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }

    /// Release ownership of the descriptor.
    pub fn into_owned(self) -> OwnedFd {
        self.inner.into()
    }

    /// Bind to `addr`.
    pub fn bind(&self, addr: &InetAddr) -> io::Result<()> {
        self.inner.bind(&SockAddr::from(addr.socket_addr()))
    }

    /// Start listening with the system backlog.
    pub fn listen(&self) -> io::Result<()> {
        self.inner.listen(libc::SOMAXCONN)
    }

    /// Accept one pending connection, non-blocking and close-on-exec.
    pub fn accept(&self) -> io::Result<(OwnedFd, InetAddr)> {
        let (stream, peer) = self.inner.accept()?;
        stream.set_nonblocking(true)?;
        let peer = peer
            .as_socket()
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
        Ok((stream.into(), InetAddr::from(peer)))
    }

    /// Begin a connect; non-blocking sockets typically return
    /// `EINPROGRESS` here.
    pub fn connect(&self, addr: &InetAddr) -> io::Result<()> {
        self.inner.connect(&SockAddr::from(addr.socket_addr()))
    }

    /// Close the write half; the kernel sends FIN once queued data drains.
    pub fn shutdown_write(&self) -> io::Result<()> {
        self.inner.shutdown(std::net::Shutdown::Write)
    }

    /// SO_REUSEADDR.
    pub fn set_reuse_addr(&self, on: bool) {
        if let Err(e) = self.inner.set_reuse_address(on) {
            warn!(fd = self.fd(), "SO_REUSEADDR failed: {e}");
        }
    }

    /// SO_REUSEPORT.
    pub fn set_reuse_port(&self, on: bool) {
        if let Err(e) = self.inner.set_reuse_port(on) {
            warn!(fd = self.fd(), "SO_REUSEPORT failed: {e}");
        }
    }

    /// SO_KEEPALIVE.
    pub fn set_keep_alive(&self, on: bool) {
        if let Err(e) = self.inner.set_keepalive(on) {
            warn!(fd = self.fd(), "SO_KEEPALIVE failed: {e}");
        }
    }

    /// TCP_NODELAY.
    pub fn set_tcp_nodelay(&self, on: bool) {
        if let Err(e) = self.inner.set_tcp_nodelay(on) {
            warn!(fd = self.fd(), "TCP_NODELAY failed: {e}");
        }
    }

    /// Kernel TCP_INFO snapshot for this connection.
    pub fn tcp_info(&self) -> io::Result<libc::tcp_info> {
        let mut info: libc::tcp_info = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::tcp_info>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                self.fd(),
                libc::IPPROTO_TCP,
                libc::TCP_INFO,
                &mut info as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(info)
    }

    /// Human-readable TCP_INFO summary for diagnostics.
    pub fn tcp_info_string(&self) -> io::Result<String> {
        let info = self.tcp_info()?;
        Ok(format!(
            "unrecovered={} rto={} ato={} snd_mss={} rcv_mss={} lost={} retrans={} \
             rtt={} rttvar={} ssthresh={} cwnd={} total_retrans={}",
            info.tcpi_retransmits,
            info.tcpi_rto,
            info.tcpi_ato,
            info.tcpi_snd_mss,
            info.tcpi_rcv_mss,
            info.tcpi_lost,
            info.tcpi_retrans,
            info.tcpi_rtt,
            info.tcpi_rttvar,
            info.tcpi_snd_ssthresh,
            info.tcpi_snd_cwnd,
            info.tcpi_total_retrans,
        ))
    }

    /// The locally bound endpoint.
    pub fn local_addr(&self) -> InetAddr {
        local_addr(self.fd())
    }

    /// The connected peer endpoint.
    pub fn peer_addr(&self) -> InetAddr {
        peer_addr(self.fd())
    }
}

/// `read(2)`.
pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// `readv(2)`.
pub fn readv(fd: RawFd, iov: &[libc::iovec]) -> io::Result<usize> {
    let n = unsafe { libc::readv(fd, iov.as_ptr(), iov.len() as libc::c_int) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// `write(2)`.
pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Fetch and clear the pending socket error (SO_ERROR).
pub fn get_socket_error(fd: RawFd) -> i32 {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc < 0 {
        io::Error::last_os_error().raw_os_error().unwrap_or(0)
    } else {
        err
    }
}

fn sockname(fd: RawFd, peer: bool) -> Option<SocketAddr> {
    // SockAddr::try_init hands us zeroed storage to fill from the kernel.
    let res = unsafe {
        SockAddr::try_init(|storage, len| {
            let rc = if peer {
                libc::getpeername(fd, storage as *mut libc::sockaddr, len)
            } else {
                libc::getsockname(fd, storage as *mut libc::sockaddr, len)
            };
            if rc < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(())
            }
        })
    };
    res.ok().and_then(|(_, addr)| addr.as_socket())
}

/// The locally bound endpoint of `fd`; unspecified on failure.
pub fn local_addr(fd: RawFd) -> InetAddr {
    InetAddr::from(sockname(fd, false).unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0))))
}

/// The peer endpoint of `fd`; unspecified on failure.
pub fn peer_addr(fd: RawFd) -> InetAddr {
    InetAddr::from(sockname(fd, true).unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0))))
}

/// A loopback connect can race into its own ephemeral port; detect it by
/// comparing the two endpoints.
pub fn is_self_connect(fd: RawFd) -> bool {
    match (sockname(fd, false), sockname(fd, true)) {
        (Some(local), Some(peer)) => local == peer,
        _ => false,
    }
}

/// Duplicate-free owner for descriptors produced by raw syscalls.
pub fn owned_from_raw(fd: RawFd) -> OwnedFd {
    unsafe { OwnedFd::from_raw_fd(fd) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_accept_connect() {
        let listener = Socket::new_nonblocking(false).unwrap();
        listener.set_reuse_addr(true);
        listener.bind(&InetAddr::new(0, true, false)).unwrap();
        listener.listen().unwrap();
        let addr = listener.local_addr();
        assert_ne!(addr.port(), 0);

        let client = Socket::new_nonblocking(false).unwrap();
        match client.connect(&addr) {
            Ok(()) => {}
            Err(e) => assert_eq!(e.raw_os_error(), Some(libc::EINPROGRESS)),
        }

        // Loopback connects are established by the time accept retries.
        let accepted = loop {
            match listener.accept() {
                Ok(pair) => break pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                Err(e) => panic!("accept: {e}"),
            }
        };
        assert_eq!(accepted.1.socket_addr(), client.local_addr().socket_addr());
        assert_eq!(get_socket_error(client.fd()), 0);
        assert!(!is_self_connect(client.fd()));
    }

    #[test]
    fn shutdown_write_delivers_eof() {
        let listener = Socket::new_nonblocking(false).unwrap();
        listener.bind(&InetAddr::new(0, true, false)).unwrap();
        listener.listen().unwrap();
        let addr = listener.local_addr();

        let client = Socket::new_nonblocking(false).unwrap();
        let _ = client.connect(&addr);
        let (server_fd, _) = loop {
            match listener.accept() {
                Ok(pair) => break pair,
                Err(_) => std::thread::sleep(std::time::Duration::from_millis(1)),
            }
        };

        client.shutdown_write().unwrap();
        let mut buf = [0u8; 16];
        let n = loop {
            match read(server_fd.as_raw_fd(), &mut buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                Err(e) => panic!("read: {e}"),
            }
        };
        assert_eq!(n, 0);
    }
}
