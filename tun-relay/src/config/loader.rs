//! Configuration loading and management
//!
//! This module handles loading configuration from files and environment variables.

use std::path::Path;
use std::str::FromStr;

use tracing::{debug, info};

use super::types::Config;
use crate::error::ConfigError;

/// Load configuration from a JSON file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read, parsed, or validated.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;
    let config: Config = serde_json::from_str(&contents).map_err(|e| {
        ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}"))
    })?;
    config.validate()?;

    info!(
        socks5 = %config.proxy.socks5_addr,
        udp_relay = %config.proxy.udp_relay_addr,
        "Configuration loaded"
    );
    Ok(config)
}

/// Load configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

fn env_override<T: FromStr>(name: &str, what: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().map(Some).map_err(|_| ConfigError::EnvError {
            name: name.into(),
            reason: format!("Invalid {what}: {raw}"),
        }),
        Err(_) => Ok(None),
    }
}

/// Apply environment overrides to an already loaded configuration.
///
/// Environment variables:
/// - `TUN_RELAY_SOCKS5_ADDR`: SOCKS5 server address
/// - `TUN_RELAY_UDP_RELAY_ADDR`: UDP envelope relay address
/// - `TUN_RELAY_LOG_LEVEL`: log filter
/// - `TUN_RELAY_IO_TIMEOUT_SECS`: relay I/O deadline
///
/// # Errors
///
/// Returns `ConfigError` if a variable does not parse or the result fails
/// validation.
pub fn apply_env_overrides(config: &mut Config) -> Result<(), ConfigError> {
    if let Some(addr) = env_override("TUN_RELAY_SOCKS5_ADDR", "socket address")? {
        config.proxy.socks5_addr = addr;
        debug!("SOCKS5 address overridden to {}", addr);
    }
    if let Some(addr) = env_override("TUN_RELAY_UDP_RELAY_ADDR", "socket address")? {
        config.proxy.udp_relay_addr = addr;
        debug!("UDP relay address overridden to {}", addr);
    }
    if let Ok(level) = std::env::var("TUN_RELAY_LOG_LEVEL") {
        config.log.level = level;
        debug!("Log level overridden to {}", config.log.level);
    }
    if let Some(secs) = env_override("TUN_RELAY_IO_TIMEOUT_SECS", "number")? {
        config.relay.io_timeout_secs = secs;
        debug!("I/O timeout overridden to {}s", secs);
    }
    config.validate()
}

/// Load configuration with environment variable overrides
///
/// # Errors
///
/// Returns `ConfigError` if loading or parsing fails.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;
    apply_env_overrides(&mut config)?;
    Ok(config)
}

/// Create a default configuration file at the given path
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be written.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let config = Config::default_config();
    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| ConfigError::ParseError(format!("Failed to serialize config: {e}")))?;
    std::fs::write(path, json)?;
    Ok(())
}
