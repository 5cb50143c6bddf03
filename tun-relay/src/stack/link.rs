//! In-memory packet link
//!
//! [`PacketChannel`] is the device side of a link: it implements
//! `AsyncRead + AsyncWrite` with one IP packet per read and per write, which
//! is what a user-space stack expects from a TUN device. [`PacketLink`] is
//! the host side, used by embedders that receive raw packets from somewhere
//! other than a TUN file descriptor (a mobile VPN service, a test harness).
//!
//! ```ignore
//! let (channel, link) = PacketChannel::create_pair(1024);
//! backend.run(channel, mtu).await?;
//!
//! link.inject(packet_from_host).await?;
//! let reply = link.next_packet().await;
//! ```

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;
use tracing::trace;

/// Counters shared by both ends of a link
#[derive(Debug, Default)]
pub struct LinkStats {
    packets_in: AtomicU64,
    packets_out: AtomicU64,
    oversized: AtomicU64,
}

impl LinkStats {
    pub fn snapshot(&self) -> LinkStatsSnapshot {
        LinkStatsSnapshot {
            packets_in: self.packets_in.load(Ordering::Relaxed),
            packets_out: self.packets_out.load(Ordering::Relaxed),
            oversized: self.oversized.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LinkStatsSnapshot {
    /// Packets delivered into the stack
    pub packets_in: u64,
    /// Packets emitted by the stack
    pub packets_out: u64,
    /// Inbound packets dropped for not fitting the reader's buffer
    pub oversized: u64,
}

/// Device end of an in-memory link.
pub struct PacketChannel {
    rx: mpsc::Receiver<Bytes>,
    tx: PollSender<Bytes>,
    stats: Arc<LinkStats>,
}

/// Host end of an in-memory link.
#[derive(Debug)]
pub struct PacketLink {
    inbound: mpsc::Sender<Bytes>,
    outbound: mpsc::Receiver<Bytes>,
    stats: Arc<LinkStats>,
}

impl PacketChannel {
    /// Build both ends with `depth` packets of buffering per direction.
    pub fn create_pair(depth: usize) -> (Self, PacketLink) {
        let depth = depth.max(1);
        let (in_tx, in_rx) = mpsc::channel(depth);
        let (out_tx, out_rx) = mpsc::channel(depth);
        let stats = Arc::new(LinkStats::default());
        let channel = Self {
            rx: in_rx,
            tx: PollSender::new(out_tx),
            stats: Arc::clone(&stats),
        };
        let link = PacketLink {
            inbound: in_tx,
            outbound: out_rx,
            stats,
        };
        (channel, link)
    }

    pub fn stats(&self) -> &Arc<LinkStats> {
        &self.stats
    }
}

impl PacketLink {
    /// Hand one IP packet to the stack.
    pub async fn inject(&self, packet: impl Into<Bytes>) -> io::Result<()> {
        self.inbound
            .send(packet.into())
            .await
            .map_err(|_| link_closed())
    }

    /// Like [`inject`](Self::inject) but fails instead of waiting when the
    /// link is full.
    pub fn try_inject(&self, packet: impl Into<Bytes>) -> io::Result<()> {
        self.inbound.try_send(packet.into()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                io::Error::new(io::ErrorKind::WouldBlock, "packet link full")
            }
            mpsc::error::TrySendError::Closed(_) => link_closed(),
        })
    }

    /// Next packet emitted by the stack; `None` once the device end is gone.
    pub async fn next_packet(&mut self) -> Option<Bytes> {
        self.outbound.recv().await
    }

    pub fn stats(&self) -> &Arc<LinkStats> {
        &self.stats
    }
}

fn link_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "packet link closed")
}

impl AsyncRead for PacketChannel {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(packet)) => {
                    // A partial IP packet is garbage to the stack; drop it whole.
                    if packet.len() > buf.remaining() {
                        this.stats.oversized.fetch_add(1, Ordering::Relaxed);
                        trace!(
                            len = packet.len(),
                            room = buf.remaining(),
                            "dropping oversized packet"
                        );
                        continue;
                    }
                    buf.put_slice(&packet);
                    this.stats.packets_in.fetch_add(1, Ordering::Relaxed);
                    return Poll::Ready(Ok(()));
                }
                // Host end dropped: EOF
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for PacketChannel {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        match this.tx.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let len = buf.len();
                this.tx
                    .send_item(Bytes::copy_from_slice(buf))
                    .map_err(|_| link_closed())?;
                this.stats.packets_out.fetch_add(1, Ordering::Relaxed);
                Poll::Ready(Ok(len))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(link_closed())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.tx.close();
        Poll::Ready(Ok(()))
    }
}
