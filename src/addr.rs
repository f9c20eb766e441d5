//! TCP endpoint addresses.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::str::FromStr;

use crate::error::{Error, Result};

/// A v4 or v6 TCP endpoint.
///
/// Thin wrapper over [`SocketAddr`] adding the byte-order accessors and
/// resolver the networking layer needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InetAddr(SocketAddr);

impl InetAddr {
    /// Endpoint on the wildcard (or loopback) address with the given port.
    pub fn new(port: u16, loopback: bool, ipv6: bool) -> Self {
        let ip: IpAddr = match (ipv6, loopback) {
            (false, false) => Ipv4Addr::UNSPECIFIED.into(),
            (false, true) => Ipv4Addr::LOCALHOST.into(),
            (true, false) => Ipv6Addr::UNSPECIFIED.into(),
            (true, true) => Ipv6Addr::LOCALHOST.into(),
        };
        InetAddr(SocketAddr::new(ip, port))
    }

    /// Address family as the OS constant (`AF_INET` / `AF_INET6`).
    pub fn family(&self) -> libc::sa_family_t {
        match self.0 {
            SocketAddr::V4(_) => libc::AF_INET as libc::sa_family_t,
            SocketAddr::V6(_) => libc::AF_INET6 as libc::sa_family_t,
        }
    }

    /// True for v6 endpoints.
    #[inline]
    pub fn is_ipv6(&self) -> bool {
        self.0.is_ipv6()
    }

    /// The IP component.
    #[inline]
    pub fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    /// The port in host byte order.
    #[inline]
    pub fn port(&self) -> u16 {
        self.0.port()
    }

    /// `"ip:port"` rendering, `[ip]:port` for v6.
    pub fn to_ip_port(&self) -> String {
        self.0.to_string()
    }

    /// The v4 address in network byte order; `None` for v6 endpoints.
    pub fn ip_net_endian(&self) -> Option<u32> {
        match self.0 {
            SocketAddr::V4(a) => Some(u32::from(*a.ip()).to_be()),
            SocketAddr::V6(_) => None,
        }
    }

    /// The port in network byte order.
    pub fn port_net_endian(&self) -> u16 {
        self.0.port().to_be()
    }

    /// The wrapped [`SocketAddr`].
    #[inline]
    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }

    /// Resolve a hostname to a v4 address via `gethostbyname_r`.
    pub fn resolve(host: &str) -> Result<Ipv4Addr> {
        let chost = std::ffi::CString::new(host).map_err(|_| Error::Resolve(host.to_owned()))?;
        let mut aux = vec![0u8; 8192];
        let mut hent: libc::hostent = unsafe { std::mem::zeroed() };
        let mut result: *mut libc::hostent = std::ptr::null_mut();
        let mut herrno: libc::c_int = 0;

        unsafe extern "C" {
            fn gethostbyname_r(
                name: *const libc::c_char,
                ret: *mut libc::hostent,
                buf: *mut libc::c_char,
                buflen: libc::size_t,
                result: *mut *mut libc::hostent,
                h_errnop: *mut libc::c_int,
            ) -> libc::c_int;
        }

        let rc = unsafe {
            gethostbyname_r(
                chost.as_ptr(),
                &mut hent,
                aux.as_mut_ptr() as *mut libc::c_char,
                aux.len(),
                &mut result,
                &mut herrno,
            )
        };
        if rc != 0 || result.is_null() {
            return Err(Error::Resolve(host.to_owned()));
        }
        unsafe {
            if (*result).h_addrtype != libc::AF_INET
                || (*result).h_length != 4
                || (*result).h_addr_list.is_null()
                || (*(*result).h_addr_list).is_null()
            {
                return Err(Error::Resolve(host.to_owned()));
            }
            let raw = *((*(*result).h_addr_list) as *const libc::in_addr);
            Ok(Ipv4Addr::from(u32::from_be(raw.s_addr)))
        }
    }
}

impl From<SocketAddr> for InetAddr {
    fn from(addr: SocketAddr) -> Self {
        InetAddr(addr)
    }
}

impl From<SocketAddrV4> for InetAddr {
    fn from(addr: SocketAddrV4) -> Self {
        InetAddr(addr.into())
    }
}

impl From<SocketAddrV6> for InetAddr {
    fn from(addr: SocketAddrV6) -> Self {
        InetAddr(addr.into())
    }
}

impl From<InetAddr> for SocketAddr {
    fn from(addr: InetAddr) -> Self {
        addr.0
    }
}

impl FromStr for InetAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.parse::<SocketAddr>()
            .map(InetAddr)
            .map_err(|_| Error::InvalidAddr(s.to_owned()))
    }
}

impl fmt::Display for InetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
