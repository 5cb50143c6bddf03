//! Stack adapters
//!
//! A user-space TCP/IP stack terminates the TUN traffic and hands the relay
//! two kinds of events: a new TCP connection, and a UDP datagram from some
//! local endpoint. Both reach a [`TransportHandler`] registered once per
//! adapter.
//!
//! Two backends implement [`StackBackend`]:
//!
//! - [`NetstackBackend`]: drives the `ipstack` crate over any async packet
//!   device (a TUN device or a [`PacketChannel`])
//! - [`LwipBackend`]: callback driven; the host calls
//!   [`LwipBackend::on_tcp_accept`] and [`LwipBackend::on_udp_recv`] from its
//!   own stack threads

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::error::AdapterError;
use crate::flow::FlowId;

pub mod link;
mod lwip;
#[cfg(feature = "netstack")]
mod netstack;

pub use link::PacketChannel;
pub use lwip::{LwipBackend, UdpPcb};
#[cfg(feature = "netstack")]
pub use netstack::NetstackBackend;

/// Byte stream of a TCP connection terminated by the stack
pub trait StackIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> StackIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// A TCP connection accepted by the stack.
///
/// `local` is the application's endpoint, `remote` the destination it
/// connected to. Reading yields what the application sent.
pub struct TcpConn {
    local: SocketAddr,
    remote: SocketAddr,
    io: Box<dyn StackIo>,
}

impl TcpConn {
    pub fn new(local: SocketAddr, remote: SocketAddr, io: impl StackIo + 'static) -> Self {
        Self {
            local,
            remote,
            io: Box::new(io),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn flow_id(&self) -> FlowId {
        FlowId::tcp(self.local, self.remote)
    }

    pub fn into_io(self) -> Box<dyn StackIo> {
        self.io
    }

    /// Shut the connection down. The application sees the stream end.
    pub async fn close(mut self) {
        let _ = self.io.shutdown().await;
    }
}

impl fmt::Debug for TcpConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConn")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for TcpConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut *self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.io).poll_shutdown(cx)
    }
}

/// Stack-side handle of a local UDP endpoint.
///
/// Replies are written "from" a remote address so the application sees
/// them arrive from the peer it addressed. `close` is idempotent.
#[async_trait]
pub trait UdpLocal: Send + Sync {
    /// The application's endpoint this handle delivers to
    fn local_addr(&self) -> SocketAddr;

    /// Deliver `payload` to the application as if sent by `from`.
    ///
    /// Fails with `NotConnected` when the stack no longer tracks `from` for
    /// this endpoint; other errors mean the handle itself is unusable.
    async fn write_from(&self, payload: &[u8], from: SocketAddr) -> io::Result<usize>;

    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// One datagram sent by the application
#[derive(Clone)]
pub struct UdpPacket {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub payload: Bytes,
    pub conn: Arc<dyn UdpLocal>,
}

impl UdpPacket {
    pub fn flow_id(&self) -> FlowId {
        FlowId::udp(self.src, self.dst)
    }
}

impl fmt::Debug for UdpPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpPacket")
            .field("src", &self.src)
            .field("dst", &self.dst)
            .field("len", &self.payload.len())
            .finish_non_exhaustive()
    }
}

/// Receiver of stack events.
///
/// Called on the stack's own tasks or threads; implementations hand the
/// event off to a spawned task and return without blocking.
pub trait TransportHandler: Send + Sync {
    fn handle_tcp(&self, conn: TcpConn);

    fn handle_udp(&self, packet: UdpPacket);
}

/// A user-space stack that delivers events to one [`TransportHandler`]
pub trait StackBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Register the handler. Succeeds once per backend.
    fn register_handler(&self, handler: Arc<dyn TransportHandler>) -> Result<(), AdapterError>;

    fn is_registered(&self) -> bool;
}

/// Write-once handler registration shared by the backends
#[derive(Default)]
pub(crate) struct HandlerSlot {
    handler: OnceLock<Arc<dyn TransportHandler>>,
}

impl HandlerSlot {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, handler: Arc<dyn TransportHandler>) -> Result<(), AdapterError> {
        self.handler
            .set(handler)
            .map_err(|_| AdapterError::HandlerAlreadyRegistered)
    }

    pub(crate) fn get(&self) -> Result<&Arc<dyn TransportHandler>, AdapterError> {
        self.handler.get().ok_or(AdapterError::HandlerNotRegistered)
    }

    pub(crate) fn is_set(&self) -> bool {
        self.handler.get().is_some()
    }
}
