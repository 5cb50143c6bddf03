//! Per-flow relays between stack connections and the proxy
//!
//! - [`TcpRelay`]: dial through the proxy, then two deadline-bounded copy
//!   loops until either side finishes
//! - [`UdpRelay`]: one proxy datagram connection per local endpoint,
//!   envelopes in both directions, DNS answers served from cache

mod tcp;
mod udp;

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

pub use tcp::{relay_streams, Direction, RelayOutcome, TcpRelay, TcpRelayState};
pub use udp::{UdpFlow, UdpRelay, DEFAULT_UDP_IO_TIMEOUT, DEFAULT_UDP_QUEUE_DEPTH};

#[cfg(test)]
pub(crate) use udp::tests as udp_tests;

/// Counters shared by both relays
#[derive(Debug, Default)]
pub struct RelayStats {
    pub(crate) tcp_opened: AtomicU64,
    pub(crate) tcp_active: AtomicU64,
    pub(crate) tcp_dial_failures: AtomicU64,
    pub(crate) tcp_bytes_up: AtomicU64,
    pub(crate) tcp_bytes_down: AtomicU64,
    pub(crate) udp_flows_opened: AtomicU64,
    pub(crate) udp_dial_failures: AtomicU64,
    pub(crate) udp_datagrams_up: AtomicU64,
    pub(crate) udp_datagrams_down: AtomicU64,
    pub(crate) udp_bytes_up: AtomicU64,
    pub(crate) udp_bytes_down: AtomicU64,
    pub(crate) udp_dropped: AtomicU64,
    pub(crate) udp_malformed: AtomicU64,
    pub(crate) dns_cache_hits: AtomicU64,
}

impl RelayStats {
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RelayStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        RelayStatsSnapshot {
            tcp_opened: load(&self.tcp_opened),
            tcp_active: load(&self.tcp_active),
            tcp_dial_failures: load(&self.tcp_dial_failures),
            tcp_bytes_up: load(&self.tcp_bytes_up),
            tcp_bytes_down: load(&self.tcp_bytes_down),
            udp_flows_opened: load(&self.udp_flows_opened),
            udp_dial_failures: load(&self.udp_dial_failures),
            udp_datagrams_up: load(&self.udp_datagrams_up),
            udp_datagrams_down: load(&self.udp_datagrams_down),
            udp_bytes_up: load(&self.udp_bytes_up),
            udp_bytes_down: load(&self.udp_bytes_down),
            udp_dropped: load(&self.udp_dropped),
            udp_malformed: load(&self.udp_malformed),
            dns_cache_hits: load(&self.dns_cache_hits),
        }
    }
}

/// Point-in-time copy of [`RelayStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelayStatsSnapshot {
    pub tcp_opened: u64,
    pub tcp_active: u64,
    pub tcp_dial_failures: u64,
    /// Application to proxy
    pub tcp_bytes_up: u64,
    /// Proxy to application
    pub tcp_bytes_down: u64,
    pub udp_flows_opened: u64,
    pub udp_dial_failures: u64,
    pub udp_datagrams_up: u64,
    pub udp_datagrams_down: u64,
    pub udp_bytes_up: u64,
    pub udp_bytes_down: u64,
    /// Datagrams dropped on a full queue or a lost peer
    pub udp_dropped: u64,
    /// Envelopes from the proxy that failed to decode
    pub udp_malformed: u64,
    /// DNS queries answered locally
    pub dns_cache_hits: u64,
}
