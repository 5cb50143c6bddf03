//! Callback-driven backend for hosts that embed their own stack (lwIP style)
//!
//! The host owns the TCP/IP stack and calls into this adapter from its own
//! threads:
//!
//! - [`LwipBackend::on_tcp_accept`] when a TCP connection completes its
//!   handshake, passing a byte stream bridged to the host's PCB
//! - [`LwipBackend::on_udp_recv`] for every UDP datagram, passing the
//!   payload as one or more chained segments
//!
//! Replies to UDP endpoints go back through the host's [`UdpPcb`].

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tracing::trace;

use super::{HandlerSlot, StackBackend, StackIo, TcpConn, TransportHandler, UdpLocal, UdpPacket};
use crate::addr::{self, ToEndpoint};
use crate::error::AdapterError;
use crate::io::BufferPool;

/// Host UDP control block bound to one local endpoint.
pub trait UdpPcb: Send + Sync {
    /// Emit a datagram towards the application at `to`, sourced from `from`.
    fn send_from(&self, payload: &[u8], from: SocketAddr, to: SocketAddr) -> io::Result<usize>;

    /// Release the control block. Called at most once.
    fn release(&self);
}

type LocalMap = DashMap<SocketAddr, Arc<LwipUdpLocal>>;

/// Stack adapter for callback-driven hosts
pub struct LwipBackend {
    handler: HandlerSlot,
    pool: Arc<BufferPool>,
    locals: Arc<LocalMap>,
}

impl LwipBackend {
    /// `pool` provides the scratch buffers used to join chained segments.
    pub fn new(pool: Arc<BufferPool>) -> Self {
        Self {
            handler: HandlerSlot::new(),
            pool,
            locals: Arc::new(DashMap::new()),
        }
    }

    /// Local UDP endpoints currently bound to a control block
    pub fn udp_endpoints(&self) -> usize {
        self.locals.len()
    }

    /// A TCP connection from `local` to `remote` was accepted by the host.
    pub fn on_tcp_accept<L, R>(
        &self,
        local: &L,
        remote: &R,
        stream: impl StackIo + 'static,
    ) -> Result<(), AdapterError>
    where
        L: ToEndpoint + ?Sized,
        R: ToEndpoint + ?Sized,
    {
        let handler = self.handler.get()?;
        let local = endpoint(local, "tcp local")?;
        let remote = endpoint(remote, "tcp remote")?;
        handler.handle_tcp(TcpConn::new(local, remote, stream));
        Ok(())
    }

    /// A UDP datagram from `src` to `dst` arrived on `pcb`.
    ///
    /// `segments` is the host's buffer chain; it is copied before this
    /// returns. Returns the payload length handed to the relay.
    pub fn on_udp_recv<S, D>(
        &self,
        pcb: Arc<dyn UdpPcb>,
        segments: &[&[u8]],
        src: &S,
        dst: &D,
    ) -> Result<usize, AdapterError>
    where
        S: ToEndpoint + ?Sized,
        D: ToEndpoint + ?Sized,
    {
        let handler = self.handler.get()?;
        let src = endpoint(src, "udp source")?;
        let dst = endpoint(dst, "udp destination")?;

        let payload = self.coalesce(segments);
        let len = payload.len();
        let conn = self.bind(src, pcb);
        trace!(%src, %dst, len, segments = segments.len(), "udp datagram from host");
        handler.handle_udp(UdpPacket {
            src,
            dst,
            payload,
            conn,
        });
        Ok(len)
    }

    /// The host dropped the control block of `local` on its own.
    pub fn on_udp_close<E: ToEndpoint + ?Sized>(&self, local: &E) -> bool {
        let Some(local) = addr::resolve(local) else {
            return false;
        };
        match self.locals.remove(&local) {
            Some((_, handle)) => {
                // Host already released the PCB; only mark the handle dead.
                handle.closed.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    fn coalesce(&self, segments: &[&[u8]]) -> Bytes {
        match segments {
            [] => Bytes::new(),
            [single] => Bytes::copy_from_slice(single),
            chain => {
                let mut scratch = self.pool.get();
                let joined = scratch.as_vec_mut();
                for segment in chain {
                    joined.extend_from_slice(segment);
                }
                let len = joined.len();
                scratch.copy_to_bytes(len)
            }
        }
    }

    fn bind(&self, local: SocketAddr, pcb: Arc<dyn UdpPcb>) -> Arc<dyn UdpLocal> {
        let mut slot = self.locals.entry(local).or_insert_with(|| {
            Arc::new(LwipUdpLocal::new(local, Arc::clone(&pcb), &self.locals))
        });
        if slot.is_closed() || !same_pcb(&slot.pcb, &pcb) {
            *slot = Arc::new(LwipUdpLocal::new(local, pcb, &self.locals));
        }
        Arc::clone(&*slot) as Arc<dyn UdpLocal>
    }
}

impl StackBackend for LwipBackend {
    fn name(&self) -> &'static str {
        "lwip"
    }

    fn register_handler(&self, handler: Arc<dyn TransportHandler>) -> Result<(), AdapterError> {
        self.handler.register(handler)
    }

    fn is_registered(&self) -> bool {
        self.handler.is_set()
    }
}

fn endpoint<E: ToEndpoint + ?Sized>(value: &E, what: &str) -> Result<SocketAddr, AdapterError> {
    addr::resolve(value).ok_or_else(|| AdapterError::InvalidEndpoint(what.to_string()))
}

fn same_pcb(a: &Arc<dyn UdpPcb>, b: &Arc<dyn UdpPcb>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Local UDP endpoint backed by a host control block
struct LwipUdpLocal {
    addr: SocketAddr,
    pcb: Arc<dyn UdpPcb>,
    closed: AtomicBool,
    registry: Weak<LocalMap>,
}

impl LwipUdpLocal {
    fn new(addr: SocketAddr, pcb: Arc<dyn UdpPcb>, registry: &Arc<LocalMap>) -> Self {
        Self {
            addr,
            pcb,
            closed: AtomicBool::new(false),
            registry: Arc::downgrade(registry),
        }
    }
}

#[async_trait]
impl UdpLocal for LwipUdpLocal {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn write_from(&self, payload: &[u8], from: SocketAddr) -> io::Result<usize> {
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "udp pcb released"));
        }
        self.pcb.send_from(payload, from, self.addr)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pcb.release();
        if let Some(registry) = self.registry.upgrade() {
            registry.remove_if(&self.addr, |_, current| {
                std::ptr::eq(Arc::as_ptr(current), self as *const Self)
            });
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
