//! Relay engine: the context object that owns everything a running
//! instance needs
//!
//! ```text
//!                 +------------------- Engine --------------------+
//! StackBackend -> | Dispatcher -> TcpRelay                         |
//!                 |            -> UdpRelay -> FlowTable <- Sweeper |
//!                 |   BufferPools, DnsCache, ProxyDialer, stats    |
//!                 +------------------------------------------------+
//! ```
//!
//! Nothing here is process-global; several engines can run side by side.
//!
//! # Example
//!
//! ```no_run
//! use tun_relay::config::Config;
//! use tun_relay::engine::EngineBuilder;
//! use tun_relay::stack::NetstackBackend;
//!
//! # async fn run(device: tokio::io::DuplexStream) -> anyhow::Result<()> {
//! let config = Config::default_config();
//! let engine = EngineBuilder::new(config).build()?;
//! engine.start();
//!
//! let backend = NetstackBackend::new();
//! engine.attach(backend.as_ref())?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::runtime::Handle;
use tracing::info;

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::dns::{CacheStatsSnapshot, DnsAnswerCache, DnsCache};
use crate::envelope::MAX_HEADER_LEN;
use crate::error::{AdapterError, TunRelayError};
use crate::flow::{FlowTable, IdleSweeper};
use crate::io::{BufferPool, BufferPoolStatsSnapshot};
use crate::proxy::{ProxyDialer, Socks5Dialer};
use crate::relay::{RelayStats, RelayStatsSnapshot, TcpRelay, UdpFlow, UdpRelay};
use crate::socket::Protector;
use crate::stack::{StackBackend, TransportHandler};

/// Builder for [`Engine`].
///
/// Without an explicit dialer the engine dials the SOCKS5 proxy named in
/// the configuration. Without an explicit cache it builds one from the
/// `dns` section when that is enabled.
pub struct EngineBuilder {
    config: Config,
    dialer: Option<Arc<dyn ProxyDialer>>,
    protect: Option<Protector>,
    dns: Option<Arc<dyn DnsCache>>,
    runtime: Option<Handle>,
}

impl EngineBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            dialer: None,
            protect: None,
            dns: None,
            runtime: None,
        }
    }

    #[must_use]
    pub fn dialer(mut self, dialer: Arc<dyn ProxyDialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    /// Protect callback handed to the default SOCKS5 dialer
    #[must_use]
    pub fn protect(mut self, protect: Protector) -> Self {
        self.protect = Some(protect);
        self
    }

    #[must_use]
    pub fn dns_cache(mut self, cache: Arc<dyn DnsCache>) -> Self {
        self.dns = Some(cache);
        self
    }

    /// Runtime relay tasks are spawned on. Defaults to the current one.
    #[must_use]
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// # Errors
    ///
    /// Fails when the configuration does not validate, or when no runtime
    /// was given and none is current.
    pub fn build(self) -> Result<Engine, TunRelayError> {
        self.config.validate()?;
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current()
                .map_err(|e| AdapterError::Stack(format!("no tokio runtime: {e}")))?,
        };

        let config = self.config;
        let dialer = match self.dialer {
            Some(dialer) => dialer,
            None => Arc::new(Socks5Dialer::new(config.proxy.socks5_config(), self.protect)),
        };

        let mut owned_cache = None;
        let dns = match self.dns {
            Some(cache) => Some(cache),
            None if config.dns.enabled => {
                let cache = Arc::new(DnsAnswerCache::new(config.dns.clone()));
                owned_cache = Some(Arc::clone(&cache));
                Some(cache as Arc<dyn DnsCache>)
            }
            None => None,
        };

        let stats = Arc::new(RelayStats::default());
        let pool = Arc::new(BufferPool::new(
            config.buffer.pool_capacity,
            config.buffer.buffer_size,
        ));
        // Large enough for any reply the TUN side can carry.
        let datagram_size = (usize::from(config.tun.mtu) + MAX_HEADER_LEN).max(config.buffer.buffer_size);
        let datagram_pool = Arc::new(BufferPool::new(config.buffer.pool_capacity, datagram_size));
        let table = Arc::new(FlowTable::new(config.relay.udp_idle_ticks));

        let tcp = Arc::new(TcpRelay::new(
            Arc::clone(&dialer),
            Arc::clone(&pool),
            config.relay.io_timeout(),
            Arc::clone(&stats),
        ));
        let mut udp = UdpRelay::new(
            Arc::clone(&table),
            dialer,
            Arc::clone(&datagram_pool),
            Arc::clone(&stats),
            runtime.clone(),
        )
        .with_io_timeout(config.relay.io_timeout())
        .with_queue_depth(config.relay.udp_queue_depth);
        if let Some(cache) = dns {
            udp = udp.with_dns_cache(cache);
        }
        let udp = Arc::new(udp);
        let dispatcher = Arc::new(Dispatcher::new(tcp, Arc::clone(&udp), runtime.clone()));

        Ok(Engine {
            table,
            sweeper: IdleSweeper::new(),
            sweep_interval: config.relay.sweep_interval(),
            dispatcher,
            udp,
            stats,
            pool,
            datagram_pool,
            dns_cache: owned_cache,
            runtime,
        })
    }
}

/// A running relay instance
pub struct Engine {
    table: Arc<FlowTable<UdpFlow>>,
    sweeper: IdleSweeper,
    sweep_interval: Duration,
    dispatcher: Arc<Dispatcher>,
    udp: Arc<UdpRelay>,
    stats: Arc<RelayStats>,
    pool: Arc<BufferPool>,
    datagram_pool: Arc<BufferPool>,
    dns_cache: Option<Arc<DnsAnswerCache>>,
    runtime: Handle,
}

impl Engine {
    /// Start the idle sweeper. Returns `false` if it was already started.
    pub fn start(&self) -> bool {
        let _guard = self.runtime.enter();
        let started = self.sweeper.start(Arc::clone(&self.table), self.sweep_interval);
        if started {
            info!(
                idle_ticks = self.table.ceiling(),
                sweep_interval_secs = self.sweep_interval.as_secs(),
                "relay engine started"
            );
        }
        started
    }

    pub fn is_started(&self) -> bool {
        self.sweeper.is_started()
    }

    /// The handler stack backends deliver events to
    pub fn handler(&self) -> Arc<dyn TransportHandler> {
        Arc::clone(&self.dispatcher) as Arc<dyn TransportHandler>
    }

    /// Register this engine's handler on `backend`.
    ///
    /// # Errors
    ///
    /// `HandlerAlreadyRegistered` when the backend already has a handler.
    pub fn attach(&self, backend: &dyn StackBackend) -> Result<(), AdapterError> {
        backend.register_handler(self.handler())?;
        info!(backend = backend.name(), "stack backend attached");
        Ok(())
    }

    pub fn udp_relay(&self) -> &Arc<UdpRelay> {
        &self.udp
    }

    pub fn flow_table(&self) -> &Arc<FlowTable<UdpFlow>> {
        &self.table
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Stop the sweeper, cancel every TCP relay and wait for it, then close
    /// every UDP flow. Returns the number of flows closed.
    pub async fn shutdown(&self) -> usize {
        self.sweeper.shutdown().await;
        let tcp = self.dispatcher.tcp_relay().shutdown().await;
        let udp = self.table.close_all();
        info!(tcp, udp, "relay engine stopped");
        tcp + udp
    }

    pub fn stats(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            relay: self.stats.snapshot(),
            udp_flows_active: self.table.len(),
            udp_flows_expired: self.sweeper.expired(),
            buffer_pool: self.pool.stats().snapshot(),
            datagram_pool: self.datagram_pool.stats().snapshot(),
            dns_cache: self.dns_cache.as_ref().map(|c| c.stats().snapshot()),
        }
    }
}

/// Serialisable view of an engine's counters
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatsSnapshot {
    pub relay: RelayStatsSnapshot,
    pub udp_flows_active: usize,
    pub udp_flows_expired: u64,
    pub buffer_pool: BufferPoolStatsSnapshot,
    pub datagram_pool: BufferPoolStatsSnapshot,
    /// Present when the engine built its own cache
    pub dns_cache: Option<CacheStatsSnapshot>,
}
