//! UDP relay
//!
//! Every local UDP endpoint gets one [`UdpFlow`] in the flow table and one
//! datagram connection to the proxy's UDP relay endpoint. Two tasks serve a
//! flow:
//!
//! - the driver dials the proxy (unless [`UdpRelay::connect`] already did),
//!   then drains the flow's queue, wrapping each datagram in an envelope
//!   (target = datagram destination, source = local endpoint)
//! - the inbound reader decodes envelopes from the proxy and writes each
//!   payload back to the application from the envelope's target
//!
//! Datagrams to port 53 are first looked up in the DNS cache. A hit is
//! answered locally and never reaches the proxy; replies from port 53 are
//! offered to the cache.
//!
//! A dial, encode or write failure, or a malformed envelope, closes the
//! flow. The next datagram from the same endpoint starts a new one.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::RelayStats;
use crate::dns::{is_dns_port, DnsCache};
use crate::envelope::Envelope;
use crate::error::{EnvelopeError, RelayError};
use crate::flow::{FlowId, FlowTable, ManagedFlow};
use crate::io::{BufferPool, PooledBuffer};
use crate::proxy::{DatagramConn, ProxyDialer};
use crate::stack::{UdpLocal, UdpPacket};

/// Default per-read/write deadline
pub const DEFAULT_UDP_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Default datagrams buffered per flow
pub const DEFAULT_UDP_QUEUE_DEPTH: usize = 256;

#[derive(Debug)]
struct Outbound {
    dst: SocketAddr,
    payload: Bytes,
}

/// State of one local UDP endpoint's session with the proxy
pub struct UdpFlow {
    key: FlowId,
    local: RwLock<Arc<dyn UdpLocal>>,
    queue: mpsc::Sender<Outbound>,
    proxy: Mutex<Option<Arc<dyn DatagramConn>>>,
    cancel: CancellationToken,
    retired: AtomicBool,
    local_closed: AtomicBool,
}

impl UdpFlow {
    fn new(
        key: FlowId,
        local: Arc<dyn UdpLocal>,
        depth: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (queue, rx) = mpsc::channel(depth.max(1));
        let flow = Arc::new(Self {
            key,
            local: RwLock::new(local),
            queue,
            proxy: Mutex::new(None),
            cancel: CancellationToken::new(),
            retired: AtomicBool::new(false),
            local_closed: AtomicBool::new(false),
        });
        (flow, rx)
    }

    pub fn key(&self) -> FlowId {
        self.key
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.key.local
    }

    pub fn local(&self) -> Arc<dyn UdpLocal> {
        Arc::clone(&self.local.read())
    }

    /// Whether the flow's proxy side has been released
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    pub fn has_proxy(&self) -> bool {
        self.proxy.lock().is_some()
    }

    /// Follow the stack when it hands the same endpoint over on a new handle.
    fn rebind(&self, local: &Arc<dyn UdpLocal>) {
        let current = self.local.read();
        if same_handle(&current, local) {
            return;
        }
        drop(current);
        *self.local.write() = Arc::clone(local);
    }

    /// Install the dialed proxy connection. Fails, closing `proxy`, when the
    /// flow was retired while the dial was in flight.
    fn attach_proxy(&self, proxy: Arc<dyn DatagramConn>) -> bool {
        let mut slot = self.proxy.lock();
        if self.is_retired() {
            drop(slot);
            proxy.close();
            return false;
        }
        *slot = Some(proxy);
        true
    }
}

impl ManagedFlow for UdpFlow {
    fn release_proxy(&self) {
        if self.retired.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let proxy = self.proxy.lock().take();
        if let Some(proxy) = proxy {
            proxy.close();
        }
    }

    fn close(&self) {
        self.release_proxy();
        if !self.local_closed.swap(true, Ordering::SeqCst) {
            self.local().close();
        }
    }
}

fn same_handle(a: &Arc<dyn UdpLocal>, b: &Arc<dyn UdpLocal>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Relays UDP datagrams through the proxy's UDP endpoint
pub struct UdpRelay {
    table: Arc<FlowTable<UdpFlow>>,
    dialer: Arc<dyn ProxyDialer>,
    dns: Option<Arc<dyn DnsCache>>,
    pool: Arc<BufferPool>,
    stats: Arc<RelayStats>,
    runtime: Handle,
    io_timeout: Duration,
    queue_depth: usize,
}

impl UdpRelay {
    /// `pool` buffers bound the envelopes accepted from the proxy; a larger
    /// one is dropped.
    pub fn new(
        table: Arc<FlowTable<UdpFlow>>,
        dialer: Arc<dyn ProxyDialer>,
        pool: Arc<BufferPool>,
        stats: Arc<RelayStats>,
        runtime: Handle,
    ) -> Self {
        Self {
            table,
            dialer,
            dns: None,
            pool,
            stats,
            runtime,
            io_timeout: DEFAULT_UDP_IO_TIMEOUT,
            queue_depth: DEFAULT_UDP_QUEUE_DEPTH,
        }
    }

    #[must_use]
    pub fn with_dns_cache(mut self, cache: Arc<dyn DnsCache>) -> Self {
        self.dns = Some(cache);
        self
    }

    #[must_use]
    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }

    pub fn table(&self) -> &Arc<FlowTable<UdpFlow>> {
        &self.table
    }

    /// Forward one datagram from the application. Never blocks.
    pub fn dispatch(self: &Arc<Self>, packet: UdpPacket) {
        if is_dns_port(packet.dst.port()) {
            if let Some(answer) = self.cached_answer(&packet.payload) {
                RelayStats::incr(&self.stats.dns_cache_hits);
                trace!(src = %packet.src, dst = %packet.dst, "dns answered from cache");
                let conn = packet.conn;
                let from = packet.dst;
                self.runtime.spawn(async move {
                    if let Err(e) = conn.write_from(&answer, from).await {
                        debug!(local = %conn.local_addr(), error = %e, "writing cached dns answer failed");
                    }
                });
                return;
            }
        }

        let key = FlowId::udp_session(packet.src);
        let mut queue_rx = None;
        let (flow, created) = self.table.get_or_insert_with(key, || {
            let (flow, rx) = UdpFlow::new(key, Arc::clone(&packet.conn), self.queue_depth);
            queue_rx = Some(rx);
            flow
        });

        if let (true, Some(rx)) = (created, queue_rx) {
            RelayStats::incr(&self.stats.udp_flows_opened);
            debug!(flow = %key, "udp flow opened");
            self.runtime
                .spawn(Arc::clone(self).drive(Arc::clone(&flow), rx, None));
        } else {
            flow.rebind(&packet.conn);
        }

        self.enqueue(&flow, packet.dst, packet.payload);
    }

    /// Dial the proxy for `local` now and install the flow, replacing (and
    /// releasing the proxy side of) any flow already serving that endpoint.
    pub async fn connect(
        self: &Arc<Self>,
        local: Arc<dyn UdpLocal>,
    ) -> Result<Arc<UdpFlow>, RelayError> {
        let key = FlowId::udp_session(local.local_addr());
        let proxy = match time::timeout(self.io_timeout, self.dialer.dial_udp()).await {
            Ok(Ok(proxy)) => proxy,
            Ok(Err(e)) => {
                RelayStats::incr(&self.stats.udp_dial_failures);
                return Err(e);
            }
            Err(_) => {
                RelayStats::incr(&self.stats.udp_dial_failures);
                return Err(RelayError::timeout(format!("udp proxy dial for {key}")));
            }
        };

        let (flow, rx) = UdpFlow::new(key, local, self.queue_depth);
        self.table.upsert(key, Arc::clone(&flow));
        RelayStats::incr(&self.stats.udp_flows_opened);
        debug!(flow = %key, "udp flow connected");
        self.runtime
            .spawn(Arc::clone(self).drive(Arc::clone(&flow), rx, Some(proxy)));
        Ok(flow)
    }

    /// Close the flow of `local`, if any.
    pub fn close(&self, local: SocketAddr) -> bool {
        self.table.close(&FlowId::udp_session(local))
    }

    fn cached_answer(&self, query: &[u8]) -> Option<PooledBuffer> {
        let answer = self.dns.as_ref()?.query(query)?;
        let mut buf = self.pool.get();
        answer.pack_into(buf.as_vec_mut())?;
        Some(buf)
    }

    fn enqueue(&self, flow: &Arc<UdpFlow>, dst: SocketAddr, payload: Bytes) {
        match flow.queue.try_send(Outbound { dst, payload }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                RelayStats::incr(&self.stats.udp_dropped);
                trace!(flow = %flow.key, "udp queue full, dropping datagram");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                RelayStats::incr(&self.stats.udp_dropped);
                trace!(flow = %flow.key, "udp flow closed, dropping datagram");
            }
        }
    }

    /// Tear `flow` down after a failure. A flow that was already superseded
    /// only loses its proxy side; the stack handle belongs to its successor.
    fn close_flow(&self, flow: &Arc<UdpFlow>) {
        if self.table.remove_if_same(&flow.key, flow) {
            flow.close();
        } else {
            flow.release_proxy();
        }
    }

    async fn dial(&self, flow: &Arc<UdpFlow>) -> Option<Arc<dyn DatagramConn>> {
        let dialed = tokio::select! {
            r = time::timeout(self.io_timeout, self.dialer.dial_udp()) => r,
            () = flow.cancel.cancelled() => return None,
        };
        let error = match dialed {
            Ok(Ok(proxy)) => return Some(proxy),
            Ok(Err(e)) => e,
            Err(_) => RelayError::timeout("udp proxy dial"),
        };
        RelayStats::incr(&self.stats.udp_dial_failures);
        debug!(flow = %flow.key, error = %error, "udp proxy dial failed, closing flow");
        self.close_flow(flow);
        None
    }

    async fn drive(
        self: Arc<Self>,
        flow: Arc<UdpFlow>,
        mut queue: mpsc::Receiver<Outbound>,
        proxy: Option<Arc<dyn DatagramConn>>,
    ) {
        let proxy = match proxy {
            Some(proxy) => proxy,
            None => match self.dial(&flow).await {
                Some(proxy) => proxy,
                None => return,
            },
        };
        if !flow.attach_proxy(Arc::clone(&proxy)) {
            return;
        }
        self.runtime.spawn(
            Arc::clone(&self).read_inbound(Arc::clone(&flow), Arc::clone(&proxy)),
        );

        let mut scratch = self.pool.get();
        loop {
            let next = tokio::select! {
                next = queue.recv() => next,
                () = flow.cancel.cancelled() => None,
            };
            let Some(Outbound { dst, payload }) = next else {
                break;
            };

            let wire = scratch.as_vec_mut();
            if let Err(e) = Envelope::new(dst, flow.local_addr(), &payload).encode_into(wire) {
                debug!(flow = %flow.key, %dst, error = %e, "envelope encode failed, closing flow");
                self.close_flow(&flow);
                break;
            }

            let sent = tokio::select! {
                r = time::timeout(self.io_timeout, proxy.send(&wire[..])) => r,
                () = flow.cancel.cancelled() => break,
            };
            let error = match sent {
                Ok(Ok(_)) => {
                    self.table.touch(&flow.key);
                    RelayStats::incr(&self.stats.udp_datagrams_up);
                    RelayStats::add(&self.stats.udp_bytes_up, payload.len() as u64);
                    trace!(flow = %flow.key, %dst, len = payload.len(), "datagram sent to proxy");
                    continue;
                }
                Ok(Err(e)) => RelayError::Io(e),
                Err(_) => RelayError::timeout("udp proxy write"),
            };
            debug!(flow = %flow.key, error = %error, "udp proxy write failed, closing flow");
            self.close_flow(&flow);
            break;
        }
    }

    async fn read_inbound(self: Arc<Self>, flow: Arc<UdpFlow>, proxy: Arc<dyn DatagramConn>) {
        let mut buf = self.pool.get();
        loop {
            let read = tokio::select! {
                r = time::timeout(self.io_timeout, proxy.recv(&mut buf[..])) => r,
                () = flow.cancel.cancelled() => break,
            };
            let n = match read {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    debug!(flow = %flow.key, error = %e, "udp proxy read failed, closing flow");
                    self.close_flow(&flow);
                    break;
                }
                // Quiet flow; expiry is the sweeper's call.
                Err(_) => continue,
            };

            let envelope = match Envelope::decode(&buf[..n]) {
                Ok(envelope) => envelope,
                // Filled the buffer: the datagram was cut short, not malformed.
                Err(EnvelopeError::Truncated { .. }) if n == buf.len() => {
                    RelayStats::incr(&self.stats.udp_dropped);
                    trace!(flow = %flow.key, len = n, "oversized envelope from proxy, dropping");
                    continue;
                }
                Err(e) => {
                    RelayStats::incr(&self.stats.udp_malformed);
                    debug!(flow = %flow.key, error = %e, "malformed envelope from proxy, closing flow");
                    self.close_flow(&flow);
                    break;
                }
            };
            if envelope.source != flow.local_addr() {
                trace!(
                    flow = %flow.key,
                    source = %envelope.source,
                    "envelope source differs from flow endpoint"
                );
            }

            let local = flow.local();
            let written =
                time::timeout(self.io_timeout, local.write_from(envelope.payload, envelope.target))
                    .await;
            match written {
                Ok(Ok(_)) => {}
                Ok(Err(e)) if e.kind() == io::ErrorKind::NotConnected => {
                    RelayStats::incr(&self.stats.udp_dropped);
                    trace!(flow = %flow.key, from = %envelope.target, "peer no longer tracked, dropping reply");
                    continue;
                }
                Ok(Err(e)) => {
                    debug!(flow = %flow.key, error = %e, "writing reply to stack failed, closing flow");
                    self.close_flow(&flow);
                    break;
                }
                Err(_) => {
                    debug!(flow = %flow.key, "writing reply to stack timed out, closing flow");
                    self.close_flow(&flow);
                    break;
                }
            }

            self.table.touch(&flow.key);
            RelayStats::incr(&self.stats.udp_datagrams_down);
            RelayStats::add(&self.stats.udp_bytes_down, envelope.payload.len() as u64);
            if is_dns_port(envelope.target.port()) {
                if let Some(cache) = &self.dns {
                    cache.store(envelope.payload);
                }
            }
        }
    }
}
