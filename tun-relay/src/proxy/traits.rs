//! Proxy dial contracts consumed by the relays

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::addr;
use crate::error::RelayError;

/// Byte stream returned by a proxy dial
pub trait ProxyIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> ProxyIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Boxed proxy stream
pub type ProxyStream = Box<dyn ProxyIo>;

/// Message-framed connection to the proxy's UDP relay endpoint.
///
/// One `send` is one envelope on the wire and one `recv` yields one
/// envelope. `close` is idempotent and wakes a pending `recv`.
#[async_trait]
pub trait DatagramConn: Send + Sync {
    async fn send(&self, buf: &[u8]) -> io::Result<usize>;

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Dialer for proxied connections.
#[async_trait]
pub trait ProxyDialer: Send + Sync {
    /// Open a stream to `target` through the proxy.
    async fn dial_tcp(&self, target: SocketAddr) -> Result<ProxyStream, RelayError>;

    /// Open a datagram connection to the proxy's UDP relay endpoint.
    async fn dial_udp(&self) -> Result<Arc<dyn DatagramConn>, RelayError>;

    /// [`dial_tcp`](Self::dial_tcp) for a textual `"ip:port"` target.
    async fn dial_tcp_str(&self, address: &str) -> Result<ProxyStream, RelayError> {
        let target =
            addr::parse_addr_str(address).ok_or_else(|| RelayError::invalid_address(address))?;
        self.dial_tcp(target).await
    }
}

/// [`DatagramConn`] over a connected `UdpSocket`.
#[derive(Debug)]
pub struct UdpDatagramConn {
    socket: UdpSocket,
    peer: SocketAddr,
    closed: AtomicBool,
    cancel: CancellationToken,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
}

impl UdpDatagramConn {
    /// Wrap a socket that is already connected to its peer.
    pub fn new(socket: UdpSocket, peer: SocketAddr) -> Self {
        Self {
            socket,
            peer,
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    pub fn packets_received(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }

    fn closed_error() -> io::Error {
        io::Error::new(io::ErrorKind::NotConnected, "datagram connection closed")
    }
}

#[async_trait]
impl DatagramConn for UdpDatagramConn {
    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        if self.is_closed() {
            return Err(Self::closed_error());
        }
        let n = tokio::select! {
            r = self.socket.send(buf) => r?,
            () = self.cancel.cancelled() => return Err(Self::closed_error()),
        };
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        Ok(n)
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.is_closed() {
            return Err(Self::closed_error());
        }
        let n = tokio::select! {
            r = self.socket.recv(buf) => r?,
            () = self.cancel.cancelled() => return Err(Self::closed_error()),
        };
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        Ok(n)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.cancel.cancel();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
