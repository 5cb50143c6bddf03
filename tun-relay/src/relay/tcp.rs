//! TCP relay: dial, then copy both directions until one of them ends
//!
//! ```text
//! Dialing --dial ok--> Relaying --either loop ends--> Closed
//!    |                                                  ^
//!    +-------------------dial failed--------------------+
//! ```
//!
//! A failed dial drops the local connection; the application sees it reset.
//! Nothing is retried. [`TcpRelay::shutdown`] cancels every relay it
//! spawned and waits for them to finish.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::runtime::Handle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

use super::RelayStats;
use crate::error::RelayError;
use crate::flow::FlowId;
use crate::io::{copy_with_deadline, BufferPool, CopyEnd};
use crate::proxy::ProxyDialer;
use crate::stack::TcpConn;

/// Lifecycle of one relayed TCP connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpRelayState {
    /// Waiting on the proxy dial
    Dialing,
    /// Both copy loops running
    Relaying,
    /// Torn down
    Closed,
}

impl TcpRelayState {
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Dialing, Self::Relaying) | (Self::Dialing, Self::Closed) | (Self::Relaying, Self::Closed)
        )
    }
}

impl fmt::Display for TcpRelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dialing => write!(f, "dialing"),
            Self::Relaying => write!(f, "relaying"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Copy direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Application to proxy
    Up,
    /// Proxy to application
    Down,
}

/// Summary of a finished relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOutcome {
    pub bytes_up: u64,
    pub bytes_down: u64,
    /// Direction whose loop ended first and tore the relay down; `None`
    /// when the relay was cancelled
    pub first: Option<Direction>,
    pub end: CopyEnd,
}

/// Bound on the shutdown of each side after a loop ends
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Run both copy loops between `local` and `proxy` until one ends or
/// `cancel` fires, then shut both write sides down.
///
/// Every read and write is bounded by `io_timeout`.
pub async fn relay_streams<L, P>(
    local: L,
    proxy: P,
    pool: &Arc<BufferPool>,
    io_timeout: Duration,
    cancel: &CancellationToken,
) -> RelayOutcome
where
    L: AsyncRead + AsyncWrite + Unpin,
    P: AsyncRead + AsyncWrite + Unpin,
{
    let (mut local_rd, mut local_wr) = tokio::io::split(local);
    let (mut proxy_rd, mut proxy_wr) = tokio::io::split(proxy);
    let mut up_buf = pool.get();
    let mut down_buf = pool.get();
    let up = AtomicU64::new(0);
    let down = AtomicU64::new(0);

    let (first, end) = tokio::select! {
        r = copy_with_deadline(&mut local_rd, &mut proxy_wr, &mut up_buf[..], io_timeout, &up) => {
            (Some(Direction::Up), r.end)
        }
        r = copy_with_deadline(&mut proxy_rd, &mut local_wr, &mut down_buf[..], io_timeout, &down) => {
            (Some(Direction::Down), r.end)
        }
        () = cancel.cancelled() => (None, CopyEnd::Cancelled),
    };

    let _ = time::timeout(SHUTDOWN_GRACE, local_wr.shutdown()).await;
    let _ = time::timeout(SHUTDOWN_GRACE, proxy_wr.shutdown()).await;

    RelayOutcome {
        bytes_up: up.load(Ordering::Relaxed),
        bytes_down: down.load(Ordering::Relaxed),
        first,
        end,
    }
}

/// Relays accepted TCP connections through a [`ProxyDialer`]
pub struct TcpRelay {
    dialer: Arc<dyn ProxyDialer>,
    pool: Arc<BufferPool>,
    io_timeout: Duration,
    stats: Arc<RelayStats>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl TcpRelay {
    pub fn new(
        dialer: Arc<dyn ProxyDialer>,
        pool: Arc<BufferPool>,
        io_timeout: Duration,
        stats: Arc<RelayStats>,
    ) -> Self {
        Self {
            dialer,
            pool,
            io_timeout,
            stats,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Serve `conn` on a task owned by this relay.
    pub fn spawn(self: &Arc<Self>, conn: TcpConn, runtime: &Handle) {
        let relay = Arc::clone(self);
        self.tasks.spawn_on(
            async move {
                // Failures are logged and counted by `serve`.
                let _ = relay.serve(conn).await;
            },
            runtime,
        );
    }

    /// Relay tasks still running
    pub fn active(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Cancel every relay and wait for their tasks to finish. Connections
    /// handed in afterwards are closed without a dial. Returns the number of
    /// relays that were still running.
    pub async fn shutdown(&self) -> usize {
        let running = self.tasks.len();
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        running
    }

    /// Relay `conn` until it ends. Returns the dial error when the proxy
    /// could not be reached; `conn` has been closed either way.
    pub async fn serve(&self, conn: TcpConn) -> Result<RelayOutcome, RelayError> {
        let id = conn.flow_id();
        if self.shutdown.is_cancelled() {
            trace!(flow = %id, "relay shut down, dropping connection");
            conn.close().await;
            return Err(RelayError::Shutdown);
        }
        let mut state = TcpRelayState::Dialing;
        RelayStats::incr(&self.stats.tcp_opened);
        trace!(flow = %id, %state, "tcp relay started");

        let dialed = tokio::select! {
            r = self.dial(&id) => r,
            () = self.shutdown.cancelled() => {
                conn.close().await;
                advance(&id, &mut state, TcpRelayState::Closed);
                return Err(RelayError::Shutdown);
            }
        };
        let proxy = match dialed {
            Ok(proxy) => proxy,
            Err(e) => {
                RelayStats::incr(&self.stats.tcp_dial_failures);
                warn!(flow = %id, error = %e, "proxy dial failed, dropping connection");
                conn.close().await;
                advance(&id, &mut state, TcpRelayState::Closed);
                return Err(e);
            }
        };

        advance(&id, &mut state, TcpRelayState::Relaying);
        self.stats.tcp_active.fetch_add(1, Ordering::Relaxed);

        let outcome = relay_streams(conn, proxy, &self.pool, self.io_timeout, &self.shutdown).await;

        self.stats.tcp_active.fetch_sub(1, Ordering::Relaxed);
        RelayStats::add(&self.stats.tcp_bytes_up, outcome.bytes_up);
        RelayStats::add(&self.stats.tcp_bytes_down, outcome.bytes_down);
        advance(&id, &mut state, TcpRelayState::Closed);
        debug!(
            flow = %id,
            up = outcome.bytes_up,
            down = outcome.bytes_down,
            first = ?outcome.first,
            end = ?outcome.end,
            "tcp relay closed"
        );
        Ok(outcome)
    }

    async fn dial(&self, id: &FlowId) -> Result<crate::proxy::ProxyStream, RelayError> {
        match time::timeout(self.io_timeout, self.dialer.dial_tcp(id.remote)).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::timeout(format!("proxy dial for {}", id.remote))),
        }
    }
}

fn advance(id: &FlowId, state: &mut TcpRelayState, next: TcpRelayState) {
    debug_assert!(state.can_transition_to(next), "{state} -> {next}");
    trace!(flow = %id, from = %state, to = %next, "tcp relay state");
    *state = next;
}
