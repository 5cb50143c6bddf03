//! Configuration module for tun-relay
//!
//! # Example
//!
//! ```no_run
//! use tun_relay::config::load_config;
//!
//! let config = load_config("/etc/tun-relay/config.json").unwrap();
//! println!("SOCKS5 server: {}", config.proxy.socks5_addr);
//! ```

mod loader;
mod types;

pub use loader::{
    apply_env_overrides, create_default_config, load_config, load_config_str, load_config_with_env,
};
pub use types::{
    BufferConfig, Config, DnsCacheConfig, LogConfig, LogFormat, ProxyConfig, RelayConfig,
    TunConfig,
};
