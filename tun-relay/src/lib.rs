//! tun-relay: TUN-to-SOCKS5 flow relay
//!
//! Takes the TCP connections and UDP datagrams a user-space TCP/IP stack
//! terminates off a TUN device and relays each one through a SOCKS5 proxy.
//!
//! # Architecture
//!
//! ```text
//! TUN device -> stack backend -> Dispatcher -+-> TcpRelay -> SOCKS5 CONNECT
//!  (ipstack or lwip callbacks)               |
//!                                            +-> UdpRelay -> envelope datagrams
//!                                                  |  ^
//!                                          FlowTable  DNS answer cache
//! ```
//!
//! UDP flows are keyed by local endpoint and expire after a number of idle
//! sweeper ticks. DNS queries whose answer is cached are answered locally
//! without touching the proxy.
//!
//! # Quick Start
//!
//! ```no_run
//! use tokio_util::sync::CancellationToken;
//! use tun_relay::config::load_config;
//! use tun_relay::engine::EngineBuilder;
//! use tun_relay::stack::{NetstackBackend, PacketChannel};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("/etc/tun-relay/config.json")?;
//! let mtu = config.tun.mtu;
//! let engine = EngineBuilder::new(config).build()?;
//! engine.start();
//!
//! let backend = NetstackBackend::new();
//! engine.attach(backend.as_ref())?;
//!
//! // Any packet device works; a channel pair stands in for a TUN here.
//! let (device, _link) = PacketChannel::create_pair(256);
//! backend.run(device, mtu, CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`addr`]: endpoint conversion and canonicalisation
//! - [`config`]: configuration types and loading
//! - [`dispatch`]: the transport handler stack backends call into
//! - [`dns`]: DNS answer cache
//! - [`engine`]: wiring and lifecycle of a relay instance
//! - [`envelope`]: UDP envelope codec
//! - [`error`]: error types
//! - [`flow`]: flow identities, table and idle sweeper
//! - [`io`]: buffer pool and deadline-bounded copy
//! - [`proxy`]: proxy dialer abstraction and SOCKS5
//! - [`relay`]: TCP and UDP relays
//! - [`socket`]: protected raw dialing
//! - [`stack`]: user-space stack adapters

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod addr;
pub mod config;
pub mod dispatch;
pub mod dns;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod flow;
pub mod io;
pub mod proxy;
pub mod relay;
pub mod socket;
pub mod stack;

// Re-export commonly used types at the crate root
pub use config::{Config, ProxyConfig, RelayConfig};
pub use dispatch::Dispatcher;
pub use engine::{Engine, EngineBuilder, EngineStatsSnapshot};
pub use envelope::Envelope;
pub use error::{AdapterError, ConfigError, EnvelopeError, RelayError, TunRelayError};
pub use flow::{FlowId, FlowTable, IdleSweeper};
pub use proxy::{ProxyDialer, Socks5Dialer};
pub use stack::{StackBackend, TcpConn, TransportHandler, UdpLocal, UdpPacket};

/// Version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
