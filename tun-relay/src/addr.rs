//! Endpoint normalization
//!
//! The stacks hand endpoints over in several shapes: ready-made
//! `SocketAddr`s, raw address octets plus a port, or `"ip:port"` text from
//! configuration. Everything funnels through [`ToEndpoint`] into a canonical
//! `SocketAddr`, where IPv4-mapped IPv6 addresses are folded back to IPv4.
//!
//! No name resolution ever happens here.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Raw endpoint as delivered by a C-style stack: address bytes and a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEndpoint<'a> {
    pub octets: &'a [u8],
    pub port: u16,
}

impl<'a> RawEndpoint<'a> {
    pub const fn new(octets: &'a [u8], port: u16) -> Self {
        Self { octets, port }
    }
}

/// Conversion of an endpoint representation into an IP/port pair.
///
/// Returns `None` when the value is not an IP endpoint.
pub trait ToEndpoint {
    fn to_endpoint(&self) -> Option<SocketAddr>;
}

impl ToEndpoint for SocketAddr {
    fn to_endpoint(&self) -> Option<SocketAddr> {
        Some(canonical(*self))
    }
}

impl ToEndpoint for (IpAddr, u16) {
    fn to_endpoint(&self) -> Option<SocketAddr> {
        Some(canonical(SocketAddr::new(self.0, self.1)))
    }
}

impl ToEndpoint for str {
    fn to_endpoint(&self) -> Option<SocketAddr> {
        parse_addr_str(self)
    }
}

impl ToEndpoint for String {
    fn to_endpoint(&self) -> Option<SocketAddr> {
        parse_addr_str(self)
    }
}

impl ToEndpoint for RawEndpoint<'_> {
    fn to_endpoint(&self) -> Option<SocketAddr> {
        from_octets(self.octets, self.port)
    }
}

impl<T: ToEndpoint + ?Sized> ToEndpoint for &T {
    fn to_endpoint(&self) -> Option<SocketAddr> {
        (**self).to_endpoint()
    }
}

/// Resolve any supported endpoint shape into a canonical `SocketAddr`.
pub fn resolve<T: ToEndpoint + ?Sized>(value: &T) -> Option<SocketAddr> {
    value.to_endpoint()
}

/// Parse `"ip:port"` or `"[ipv6]:port"` text. Hostnames are rejected.
#[must_use]
pub fn parse_addr_str(s: &str) -> Option<SocketAddr> {
    s.trim().parse::<SocketAddr>().ok().map(canonical)
}

/// Build an endpoint from 4 or 16 raw address bytes.
#[must_use]
pub fn from_octets(octets: &[u8], port: u16) -> Option<SocketAddr> {
    let ip = match octets.len() {
        4 => {
            let mut b = [0u8; 4];
            b.copy_from_slice(octets);
            IpAddr::V4(Ipv4Addr::from(b))
        }
        16 => {
            let mut b = [0u8; 16];
            b.copy_from_slice(octets);
            IpAddr::V6(Ipv6Addr::from(b))
        }
        _ => return None,
    };
    Some(canonical(SocketAddr::new(ip, port)))
}

/// Fold IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) down to IPv4.
#[must_use]
pub fn canonical(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), v6.port()),
            None => addr,
        },
        SocketAddr::V4(_) => addr,
    }
}

/// An endpoint a flow can actually target: specified address, non-zero port.
#[must_use]
pub fn is_routable(addr: &SocketAddr) -> bool {
    !addr.ip().is_unspecified() && addr.port() != 0
}

/// Raw address bytes of an IP, 4 or 16 of them.
#[must_use]
pub fn ip_octets(ip: &IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

/// Unspecified address of the same family as `addr`, port zero.
#[must_use]
pub fn unspecified_like(addr: &SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}
