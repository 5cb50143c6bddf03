//! Configuration types for tun-relay
//!
//! Configuration is loaded from JSON. Every section except `proxy` has
//! defaults, so a minimal file only names the proxy endpoints.

use std::net::SocketAddr;
use std::time::Duration;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::envelope::MAX_HEADER_LEN;
use crate::error::ConfigError;
use crate::proxy::Socks5Config;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Proxy endpoints and credentials
    pub proxy: ProxyConfig,

    /// Relay timeouts and idle accounting
    #[serde(default)]
    pub relay: RelayConfig,

    /// Relay buffer pool
    #[serde(default)]
    pub buffer: BufferConfig,

    /// DNS answer cache
    #[serde(default)]
    pub dns: DnsCacheConfig,

    /// TUN device
    #[serde(default)]
    pub tun: TunConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.proxy.validate()?;
        self.relay.validate()?;
        self.buffer.validate()?;
        self.dns.validate()?;
        self.tun.validate()?;
        self.log.validate()?;
        Ok(())
    }

    /// Configuration pointing at a SOCKS5 proxy on localhost
    #[must_use]
    pub fn default_config() -> Self {
        Self {
            proxy: ProxyConfig::default(),
            relay: RelayConfig::default(),
            buffer: BufferConfig::default(),
            dns: DnsCacheConfig::default(),
            tun: TunConfig::default(),
            log: LogConfig::default(),
        }
    }
}

/// Proxy endpoints
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// SOCKS5 server used for TCP flows
    pub socks5_addr: SocketAddr,

    /// Envelope relay endpoint used for UDP flows
    pub udp_relay_addr: SocketAddr,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// TCP connect plus SOCKS5 negotiation bound, seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::validation("proxy.connect_timeout_secs must be > 0"));
        }
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => {
                if u.len() > 255 || p.len() > 255 {
                    return Err(ConfigError::validation(
                        "proxy username and password must be at most 255 bytes",
                    ));
                }
            }
            (None, None) => {}
            _ => {
                return Err(ConfigError::validation(
                    "proxy.username and proxy.password must be set together",
                ))
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Dialer settings for [`Socks5Dialer`](crate::proxy::Socks5Dialer)
    #[must_use]
    pub fn socks5_config(&self) -> Socks5Config {
        let config = Socks5Config::new(self.socks5_addr, self.udp_relay_addr)
            .with_connect_timeout(self.connect_timeout());
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => config.with_auth(u.clone(), p.clone()),
            _ => config,
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            socks5_addr: SocketAddr::from(([127, 0, 0, 1], 1080)),
            udp_relay_addr: SocketAddr::from(([127, 0, 0, 1], 1080)),
            username: None,
            password: None,
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// Relay behaviour
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelayConfig {
    /// Per read/write deadline on TCP relays and the UDP inbound reader
    #[serde(default = "default_io_timeout_secs")]
    pub io_timeout_secs: u64,

    /// Sweeps a UDP flow may stay idle before it is closed
    #[serde(default = "default_udp_idle_ticks")]
    pub udp_idle_ticks: u32,

    /// Interval between idle sweeps
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Datagrams buffered per UDP flow while its proxy socket is busy
    #[serde(default = "default_udp_queue_depth")]
    pub udp_queue_depth: usize,
}

impl RelayConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.io_timeout_secs == 0 {
            return Err(ConfigError::validation("relay.io_timeout_secs must be > 0"));
        }
        if self.udp_idle_ticks == 0 {
            return Err(ConfigError::validation("relay.udp_idle_ticks must be > 0"));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::validation("relay.sweep_interval_secs must be > 0"));
        }
        if self.udp_queue_depth == 0 {
            return Err(ConfigError::validation("relay.udp_queue_depth must be > 0"));
        }
        Ok(())
    }

    #[must_use]
    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            io_timeout_secs: default_io_timeout_secs(),
            udp_idle_ticks: default_udp_idle_ticks(),
            sweep_interval_secs: default_sweep_interval_secs(),
            udp_queue_depth: default_udp_queue_depth(),
        }
    }
}

/// Buffer pool sizing
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BufferConfig {
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,

    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl BufferConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_capacity == 0 {
            return Err(ConfigError::validation("buffer.pool_capacity must be > 0"));
        }
        if self.buffer_size <= MAX_HEADER_LEN {
            return Err(ConfigError::ValidationError(format!(
                "buffer.buffer_size must exceed the envelope header ({MAX_HEADER_LEN} bytes)"
            )));
        }
        Ok(())
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            pool_capacity: default_pool_capacity(),
            buffer_size: default_buffer_size(),
        }
    }
}

/// DNS answer cache settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DnsCacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_dns_max_entries")]
    pub max_entries: usize,

    /// Lower bound applied to answer TTLs
    #[serde(default = "default_min_ttl_secs")]
    pub min_ttl_secs: u32,

    /// Upper bound applied to answer TTLs
    #[serde(default = "default_max_ttl_secs")]
    pub max_ttl_secs: u32,
}

impl DnsCacheConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.max_entries == 0 {
            return Err(ConfigError::validation("dns.max_entries must be > 0"));
        }
        if self.min_ttl_secs > self.max_ttl_secs {
            return Err(ConfigError::validation(
                "dns.min_ttl_secs must not exceed dns.max_ttl_secs",
            ));
        }
        Ok(())
    }
}

impl Default for DnsCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: default_dns_max_entries(),
            min_ttl_secs: default_min_ttl_secs(),
            max_ttl_secs: default_max_ttl_secs(),
        }
    }
}

/// TUN device settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TunConfig {
    #[serde(default = "default_tun_name")]
    pub name: String,

    /// Interface address with prefix length
    #[serde(default = "default_tun_address")]
    pub address: IpNet,

    #[serde(default = "default_mtu")]
    pub mtu: u16,
}

impl TunConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::validation("tun.name must not be empty"));
        }
        if self.mtu < 576 {
            return Err(ConfigError::ValidationError(format!(
                "tun.mtu {} is below the IPv4 minimum of 576",
                self.mtu
            )));
        }
        Ok(())
    }
}

impl Default for TunConfig {
    fn default() -> Self {
        Self {
            name: default_tun_name(),
            address: default_tun_address(),
            mtu: default_mtu(),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Filter directive, e.g. `info` or `tun_relay=debug,warn`
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl LogConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.level.trim().is_empty() {
            return Err(ConfigError::validation("log.level must not be empty"));
        }
        Ok(())
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

const fn default_true() -> bool {
    true
}

const fn default_connect_timeout_secs() -> u64 {
    10
}

const fn default_io_timeout_secs() -> u64 {
    30
}

const fn default_udp_idle_ticks() -> u32 {
    crate::flow::DEFAULT_IDLE_TICKS
}

const fn default_sweep_interval_secs() -> u64 {
    5
}

const fn default_udp_queue_depth() -> usize {
    256
}

const fn default_pool_capacity() -> usize {
    crate::io::DEFAULT_POOL_CAPACITY
}

const fn default_buffer_size() -> usize {
    crate::io::DEFAULT_BUFFER_SIZE
}

const fn default_dns_max_entries() -> usize {
    4096
}

const fn default_min_ttl_secs() -> u32 {
    60
}

const fn default_max_ttl_secs() -> u32 {
    86400
}

fn default_tun_name() -> String {
    "tun0".into()
}

fn default_tun_address() -> IpNet {
    let addr = std::net::Ipv4Addr::new(198, 18, 0, 1);
    ipnet::Ipv4Net::new(addr, 15).map_or_else(|_| IpNet::from(std::net::IpAddr::V4(addr)), IpNet::from)
}

const fn default_mtu() -> u16 {
    1500
}

fn default_log_level() -> String {
    "info".into()
}
