//! Error types for tun-relay
//!
//! Errors are grouped by subsystem. Each group answers `is_recoverable`, which
//! the relays use to decide between logging at `debug` (peer went away, a
//! deadline fired) and `warn` (something is misconfigured).

use std::io;

use thiserror::Error;

/// Top-level error type for tun-relay
#[derive(Debug, Error)]
pub enum TunRelayError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Flow relay errors (dial, protect, timeouts)
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    /// Stack adapter errors
    #[error("Stack adapter error: {0}")]
    Adapter(#[from] AdapterError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TunRelayError {
    /// Check if this error is recoverable (can retry operation)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(e) => e.is_recoverable(),
            Self::Relay(e) => e.is_recoverable(),
            Self::Adapter(e) => e.is_recoverable(),
            Self::Io(e) => is_transient_io(e),
        }
    }
}

fn is_transient_io(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::ConnectionReset
    )
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }
}

/// UDP envelope codec errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    /// Target or source address missing or unspecified
    #[error("Invalid envelope address: {0}")]
    InvalidAddress(String),

    /// Payload does not fit the 32-bit length field
    #[error("Payload too large: {len} bytes")]
    PayloadTooLarge { len: usize },

    /// Input ends before a declared field
    #[error("Truncated envelope: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    /// A field holds a value the format does not allow
    #[error("Malformed envelope: {0}")]
    Malformed(String),
}

impl EnvelopeError {
    pub fn truncated(needed: usize, available: usize) -> Self {
        Self::Truncated { needed, available }
    }
}

/// Per-flow relay errors
#[derive(Debug, Error)]
pub enum RelayError {
    /// Proxy dial failed
    #[error("Failed to dial {addr}: {reason}")]
    DialFailure { addr: String, reason: String },

    /// The protect callback rejected the socket
    #[error("Socket protection failed for fd {fd}: code {code}")]
    ProtectionFailed { fd: i32, code: i32 },

    /// Address could not be parsed or is unspecified
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// A dial or I/O deadline expired
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// The peer closed the connection
    #[error("Connection closed by peer")]
    ClosedByPeer,

    /// Envelope encode/decode failure
    #[error("Envelope error: {0}")]
    Codec(#[from] EnvelopeError),

    /// I/O error on an established connection
    #[error("Relay I/O error: {0}")]
    Io(#[from] io::Error),

    /// The relay was shut down before the flow could be served
    #[error("Relay shut down")]
    Shutdown,
}

impl RelayError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::DialFailure { .. } => true,
            Self::ProtectionFailed { .. } => false,
            Self::InvalidAddress(_) => false,
            Self::Timeout(_) => true,
            Self::ClosedByPeer => true,
            Self::Codec(_) => true,
            Self::Io(e) => is_transient_io(e),
            Self::Shutdown => false,
        }
    }

    pub fn dial_failure(addr: impl ToString, reason: impl ToString) -> Self {
        Self::DialFailure {
            addr: addr.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn invalid_address(addr: impl Into<String>) -> Self {
        Self::InvalidAddress(addr.into())
    }

    pub fn timeout(what: impl Into<String>) -> Self {
        Self::Timeout(what.into())
    }
}

/// Stack adapter errors
#[derive(Debug, Error)]
pub enum AdapterError {
    /// A transport handler was already registered on this adapter
    #[error("Transport handler already registered")]
    HandlerAlreadyRegistered,

    /// An event arrived before any handler was registered
    #[error("No transport handler registered")]
    HandlerNotRegistered,

    /// The adapter is already running
    #[error("Stack adapter already running")]
    AlreadyRunning,

    /// The stack delivered an endpoint that is not a valid IP address
    #[error("Invalid endpoint from stack: {0}")]
    InvalidEndpoint(String),

    /// Failure reported by the underlying stack
    #[error("Stack failure: {0}")]
    Stack(String),

    #[error("Stack I/O error: {0}")]
    Io(#[from] io::Error),
}

impl AdapterError {
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::HandlerAlreadyRegistered | Self::AlreadyRunning => false,
            Self::HandlerNotRegistered => true,
            Self::InvalidEndpoint(_) => true,
            Self::Stack(_) => false,
            Self::Io(e) => is_transient_io(e),
        }
    }
}

/// Result alias using [`TunRelayError`]
pub type Result<T> = std::result::Result<T, TunRelayError>;
