//! Dispatcher: the [`TransportHandler`] every stack backend calls into
//!
//! Both entry points validate the endpoints, then hand off to a relay
//! without waiting on any I/O. TCP gets a [`TcpRelay`]-owned task; UDP is
//! queued on its flow by [`UdpRelay::dispatch`].

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::{debug, trace};

use crate::addr;
use crate::error::RelayError;
use crate::relay::{TcpRelay, UdpRelay};
use crate::stack::{TcpConn, TransportHandler, UdpPacket};

pub struct Dispatcher {
    tcp: Arc<TcpRelay>,
    udp: Arc<UdpRelay>,
    runtime: Handle,
}

impl Dispatcher {
    /// Relay tasks are spawned on `runtime`, so the stack may call in from
    /// threads that are not part of it.
    pub fn new(tcp: Arc<TcpRelay>, udp: Arc<UdpRelay>, runtime: Handle) -> Self {
        Self { tcp, udp, runtime }
    }

    pub fn tcp_relay(&self) -> &Arc<TcpRelay> {
        &self.tcp
    }

    pub fn udp_relay(&self) -> &Arc<UdpRelay> {
        &self.udp
    }
}

/// Reject endpoints a flow cannot be built on.
pub fn validate_endpoint(endpoint: SocketAddr) -> Result<SocketAddr, RelayError> {
    let endpoint = addr::canonical(endpoint);
    if addr::is_routable(&endpoint) {
        Ok(endpoint)
    } else {
        Err(RelayError::invalid_address(endpoint.to_string()))
    }
}

impl TransportHandler for Dispatcher {
    fn handle_tcp(&self, conn: TcpConn) {
        let checked = validate_endpoint(conn.local_addr())
            .and_then(|_| validate_endpoint(conn.remote_addr()));
        if let Err(e) = checked {
            debug!(flow = %conn.flow_id(), error = %e, "rejecting tcp connection");
            self.runtime.spawn(conn.close());
            return;
        }

        self.tcp.spawn(conn, &self.runtime);
    }

    fn handle_udp(&self, mut packet: UdpPacket) {
        match (validate_endpoint(packet.src), validate_endpoint(packet.dst)) {
            (Ok(src), Ok(dst)) => {
                packet.src = src;
                packet.dst = dst;
                self.udp.dispatch(packet);
            }
            (Err(e), _) | (_, Err(e)) => {
                trace!(src = %packet.src, dst = %packet.dst, error = %e, "dropping udp datagram");
            }
        }
    }
}
