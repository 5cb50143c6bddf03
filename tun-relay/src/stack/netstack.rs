//! `ipstack` backend
//!
//! ```text
//! +---------------+     +-----------------+     +-------------------+
//! | packet device | <-> | ipstack::IpStack| --> | TransportHandler  |
//! | (TUN / link)  |     |   accept loop   |     |  handle_tcp/udp   |
//! +---------------+     +-----------------+     +-------------------+
//! ```
//!
//! ipstack yields one UDP stream per (local, peer) pair. The relay keys UDP
//! flows by the local endpoint alone, so every stream of one local endpoint
//! shares a [`NetstackUdpLocal`] that routes replies to the stream of the
//! matching peer.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{HandlerSlot, StackBackend, TcpConn, TransportHandler, UdpLocal, UdpPacket};
use crate::addr;
use crate::error::AdapterError;

/// Largest UDP payload ipstack can hand over
const MAX_DATAGRAM_SIZE: usize = 65535;

/// Replies queued per ipstack UDP stream
const REPLY_QUEUE_DEPTH: usize = 64;

/// Back-off after an accept error
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Stack adapter over the `ipstack` user-space TCP/IP stack
pub struct NetstackBackend {
    handler: HandlerSlot,
    running: AtomicBool,
    locals: DashMap<SocketAddr, Arc<NetstackUdpLocal>>,
}

impl NetstackBackend {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handler: HandlerSlot::new(),
            running: AtomicBool::new(false),
            locals: DashMap::new(),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Local UDP endpoints with at least one live ipstack stream
    pub fn udp_endpoints(&self) -> usize {
        self.locals.len()
    }

    /// Run the stack over `device` until `shutdown` fires.
    ///
    /// A handler must be registered first. Only one `run` may be active per
    /// backend.
    pub async fn run<D>(
        self: Arc<Self>,
        device: D,
        mtu: u16,
        shutdown: CancellationToken,
    ) -> Result<(), AdapterError>
    where
        D: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let handler = Arc::clone(self.handler.get()?);
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(AdapterError::AlreadyRunning);
        }

        let mut ipstack_config = ipstack::IpStackConfig::default();
        ipstack_config.mtu(mtu);
        let mut ip_stack = ipstack::IpStack::new(ipstack_config, device);
        info!(mtu, "netstack backend started");

        loop {
            tokio::select! {
                accepted = ip_stack.accept() => match accepted {
                    Ok(stream) => self.handle_stream(stream, &handler),
                    Err(e) => {
                        warn!(error = ?e, "ipstack accept error");
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                },
                () = shutdown.cancelled() => break,
            }
        }

        for entry in self.locals.iter() {
            entry.value().close();
        }
        self.locals.clear();
        self.running.store(false, Ordering::SeqCst);
        info!("netstack backend stopped");
        Ok(())
    }

    fn handle_stream(
        self: &Arc<Self>,
        stream: ipstack::stream::IpStackStream,
        handler: &Arc<dyn TransportHandler>,
    ) {
        match stream {
            ipstack::stream::IpStackStream::Tcp(tcp_stream) => {
                let local = tcp_stream.local_addr();
                let remote = tcp_stream.peer_addr();
                trace!(%local, %remote, "tcp connection accepted");
                handler.handle_tcp(TcpConn::new(local, remote, tcp_stream));
            }
            ipstack::stream::IpStackStream::Udp(udp_stream) => {
                tokio::spawn(Arc::clone(self).pump_udp(udp_stream, Arc::clone(handler)));
            }
            ipstack::stream::IpStackStream::UnknownTransport(unknown) => {
                trace!(
                    src = %unknown.src_addr(),
                    dst = %unknown.dst_addr(),
                    "ignoring non tcp/udp packet"
                );
            }
            ipstack::stream::IpStackStream::UnknownNetwork(packet) => {
                trace!(len = packet.len(), "ignoring non ip packet");
            }
        }
    }

    /// Attach `peer` to the handle of `local`, replacing a handle that was
    /// closed. Runs under the map's shard lock so a concurrent release
    /// cannot drop the handle in between.
    fn attach(
        &self,
        local: SocketAddr,
        peer: SocketAddr,
        replies: mpsc::Sender<Bytes>,
    ) -> Arc<NetstackUdpLocal> {
        let mut slot = self
            .locals
            .entry(local)
            .or_insert_with(|| Arc::new(NetstackUdpLocal::new(local)));
        if slot.is_closed() {
            *slot = Arc::new(NetstackUdpLocal::new(local));
        }
        slot.peers.lock().insert(addr::canonical(peer), replies);
        Arc::clone(&*slot)
    }

    fn detach(&self, handle: &Arc<NetstackUdpLocal>, peer: SocketAddr) {
        handle.peers.lock().remove(&addr::canonical(peer));
        self.locals.remove_if(&handle.addr, |_, current| {
            Arc::ptr_eq(current, handle) && (current.is_closed() || current.peers.lock().is_empty())
        });
    }

    async fn pump_udp(
        self: Arc<Self>,
        mut udp_stream: ipstack::stream::IpStackUdpStream,
        handler: Arc<dyn TransportHandler>,
    ) {
        let local = udp_stream.local_addr();
        let peer = udp_stream.peer_addr();
        let (reply_tx, mut reply_rx) = mpsc::channel::<Bytes>(REPLY_QUEUE_DEPTH);
        let handle = self.attach(local, peer, reply_tx);
        let conn: Arc<dyn UdpLocal> = Arc::clone(&handle) as Arc<dyn UdpLocal>;
        trace!(%local, %peer, "udp stream opened");

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            tokio::select! {
                read = udp_stream.read(&mut buf) => match read {
                    Ok(0) => break,
                    Ok(n) => handler.handle_udp(UdpPacket {
                        src: local,
                        dst: peer,
                        payload: Bytes::copy_from_slice(&buf[..n]),
                        conn: Arc::clone(&conn),
                    }),
                    Err(e) => {
                        debug!(%local, %peer, error = %e, "udp stream read failed");
                        break;
                    }
                },
                reply = reply_rx.recv() => match reply {
                    Some(payload) => {
                        if let Err(e) = udp_stream.write_all(&payload).await {
                            debug!(%local, %peer, error = %e, "udp stream write failed");
                            break;
                        }
                    }
                    None => break,
                },
                () = handle.cancel.cancelled() => break,
            }
        }

        self.detach(&handle, peer);
        trace!(%local, %peer, "udp stream closed");
    }
}

impl StackBackend for NetstackBackend {
    fn name(&self) -> &'static str {
        "netstack"
    }

    fn register_handler(&self, handler: Arc<dyn TransportHandler>) -> Result<(), AdapterError> {
        self.handler.register(handler)
    }

    fn is_registered(&self) -> bool {
        self.handler.is_set()
    }
}

/// Local UDP endpoint as seen through ipstack
struct NetstackUdpLocal {
    addr: SocketAddr,
    peers: Mutex<HashMap<SocketAddr, mpsc::Sender<Bytes>>>,
    cancel: CancellationToken,
}

impl NetstackUdpLocal {
    fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            peers: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl UdpLocal for NetstackUdpLocal {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn write_from(&self, payload: &[u8], from: SocketAddr) -> io::Result<usize> {
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "udp endpoint closed"));
        }
        let sender = self.peers.lock().get(&addr::canonical(from)).cloned();
        let not_tracked = || {
            io::Error::new(
                io::ErrorKind::NotConnected,
                format!("no stream from {from} to {}", self.addr),
            )
        };
        let sender = sender.ok_or_else(not_tracked)?;
        sender
            .send(Bytes::copy_from_slice(payload))
            .await
            .map_err(|_| not_tracked())?;
        Ok(payload.len())
    }

    fn close(&self) {
        self.cancel.cancel();
    }

    fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
