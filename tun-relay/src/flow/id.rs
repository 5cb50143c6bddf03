use std::fmt;
use std::net::SocketAddr;

use crate::addr;

/// Transport protocol of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
        }
    }
}

/// Identity of one flow.
///
/// `local` is the application's endpoint as seen on the TUN side; `remote`
/// is the destination the application addressed. Both are canonicalized on
/// construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowId {
    pub protocol: Protocol,
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

impl FlowId {
    pub fn new(protocol: Protocol, local: SocketAddr, remote: SocketAddr) -> Self {
        Self {
            protocol,
            local: addr::canonical(local),
            remote: addr::canonical(remote),
        }
    }

    pub fn tcp(local: SocketAddr, remote: SocketAddr) -> Self {
        Self::new(Protocol::Tcp, local, remote)
    }

    pub fn udp(local: SocketAddr, remote: SocketAddr) -> Self {
        Self::new(Protocol::Udp, local, remote)
    }

    /// Table key for a UDP conversation rooted at `local`.
    ///
    /// One UDP socket may address many destinations, so only the local side
    /// takes part in the key.
    pub fn udp_session(local: SocketAddr) -> Self {
        let local = addr::canonical(local);
        Self {
            protocol: Protocol::Udp,
            local,
            remote: addr::unspecified_like(&local),
        }
    }

    /// Key under which this flow is stored in a [`FlowTable`](super::FlowTable).
    #[must_use]
    pub fn table_key(&self) -> Self {
        match self.protocol {
            Protocol::Tcp => *self,
            Protocol::Udp => Self::udp_session(self.local),
        }
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.protocol, self.local, self.remote)
    }
}
