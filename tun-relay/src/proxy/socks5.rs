//! SOCKS5 proxy dialer (RFC 1928, RFC 1929)
//!
//! TCP flows are carried over a fresh SOCKS5 `CONNECT` per flow. UDP flows go
//! to the proxy's envelope relay endpoint as a connected datagram socket;
//! each datagram carries its own addressing (see [`crate::envelope`]), so no
//! `UDP ASSOCIATE` control channel is needed.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tun_relay::proxy::{ProxyDialer, Socks5Config, Socks5Dialer};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Socks5Config::new(
//!     "127.0.0.1:1080".parse()?,
//!     "127.0.0.1:1081".parse()?,
//! );
//! let dialer = Socks5Dialer::new(config, None);
//! let stream = dialer.dial_tcp("93.184.216.34:443".parse()?).await?;
//! # drop(stream);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, trace};

use super::traits::{DatagramConn, ProxyDialer, ProxyStream, UdpDatagramConn};
use crate::error::RelayError;
use crate::socket::{self, Protector};

/// SOCKS5 protocol version
pub const SOCKS5_VERSION: u8 = 0x05;

pub const AUTH_METHOD_NONE: u8 = 0x00;
pub const AUTH_METHOD_PASSWORD: u8 = 0x02;
pub const AUTH_METHOD_NO_ACCEPTABLE: u8 = 0xFF;

/// Username/password sub-negotiation version (RFC 1929)
pub const AUTH_PASSWORD_VERSION: u8 = 0x01;

pub const CMD_CONNECT: u8 = 0x01;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const REPLY_SUCCEEDED: u8 = 0x00;

/// Human-readable text for a SOCKS5 reply code
#[must_use]
pub const fn reply_message(code: u8) -> &'static str {
    match code {
        0x00 => "succeeded",
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// SOCKS5 negotiation errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Socks5Error {
    /// Invalid protocol version
    InvalidVersion { expected: u8, actual: u8 },
    /// No acceptable authentication method
    NoAcceptableMethod,
    /// Authentication failed
    AuthFailed,
    /// Server returned error reply
    ServerReply { code: u8, message: String },
    /// Invalid address type
    InvalidAddressType(u8),
    /// Protocol error (malformed message)
    ProtocolError(String),
    /// Connection error
    ConnectionError(String),
    /// Timeout during handshake
    HandshakeTimeout,
}

impl fmt::Display for Socks5Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidVersion { expected, actual } => {
                write!(f, "Invalid SOCKS version: expected {expected}, got {actual}")
            }
            Self::NoAcceptableMethod => write!(f, "No acceptable authentication method"),
            Self::AuthFailed => write!(f, "SOCKS5 authentication failed"),
            Self::ServerReply { code, message } => {
                write!(f, "SOCKS5 server error (code {code:#04x}): {message}")
            }
            Self::InvalidAddressType(atyp) => write!(f, "Invalid address type: {atyp:#04x}"),
            Self::ProtocolError(msg) => write!(f, "SOCKS5 protocol error: {msg}"),
            Self::ConnectionError(msg) => write!(f, "SOCKS5 connection error: {msg}"),
            Self::HandshakeTimeout => write!(f, "SOCKS5 handshake timeout"),
        }
    }
}

impl std::error::Error for Socks5Error {}

fn io_err(what: &str) -> impl FnOnce(std::io::Error) -> Socks5Error + '_ {
    move |e| Socks5Error::ConnectionError(format!("{what} failed: {e}"))
}

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for [`Socks5Dialer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5Config {
    /// SOCKS5 server for TCP `CONNECT`
    pub server_addr: SocketAddr,
    /// Envelope relay endpoint for UDP flows
    pub udp_relay_addr: SocketAddr,
    /// Optional username/password
    pub auth: Option<(String, String)>,
    /// Bound on TCP connect plus SOCKS5 negotiation
    pub connect_timeout: Duration,
}

impl Socks5Config {
    pub fn new(server_addr: SocketAddr, udp_relay_addr: SocketAddr) -> Self {
        Self {
            server_addr,
            udp_relay_addr,
            auth: None,
            connect_timeout: Duration::from_secs(10),
        }
    }

    #[must_use]
    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some((username.into(), password.into()));
        self
    }

    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn has_auth(&self) -> bool {
        self.auth.is_some()
    }
}

// ============================================================================
// Protocol Helpers
// ============================================================================

/// Method selection followed by optional RFC 1929 authentication.
pub async fn handshake<S>(stream: &mut S, auth: Option<&(String, String)>) -> Result<(), Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let methods: &[u8] = if auth.is_some() {
        &[SOCKS5_VERSION, 2, AUTH_METHOD_NONE, AUTH_METHOD_PASSWORD]
    } else {
        &[SOCKS5_VERSION, 1, AUTH_METHOD_NONE]
    };
    trace!("Sending SOCKS5 method selection: {:?}", methods);
    stream.write_all(methods).await.map_err(io_err("write methods"))?;

    let mut response = [0u8; 2];
    stream
        .read_exact(&mut response)
        .await
        .map_err(io_err("read method response"))?;

    if response[0] != SOCKS5_VERSION {
        return Err(Socks5Error::InvalidVersion {
            expected: SOCKS5_VERSION,
            actual: response[0],
        });
    }

    match response[1] {
        AUTH_METHOD_NONE => Ok(()),
        AUTH_METHOD_PASSWORD => {
            let (username, password) = auth.ok_or(Socks5Error::AuthFailed)?;
            authenticate(stream, username, password).await
        }
        AUTH_METHOD_NO_ACCEPTABLE => Err(Socks5Error::NoAcceptableMethod),
        other => Err(Socks5Error::ProtocolError(format!(
            "unsupported auth method: {other:#04x}"
        ))),
    }
}

async fn authenticate<S>(stream: &mut S, username: &str, password: &str) -> Result<(), Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ulen = u8::try_from(username.len())
        .map_err(|_| Socks5Error::ProtocolError("username too long (max 255)".into()))?;
    let plen = u8::try_from(password.len())
        .map_err(|_| Socks5Error::ProtocolError("password too long (max 255)".into()))?;

    // VER | ULEN | USERNAME | PLEN | PASSWORD
    let mut request = Vec::with_capacity(3 + username.len() + password.len());
    request.push(AUTH_PASSWORD_VERSION);
    request.push(ulen);
    request.extend_from_slice(username.as_bytes());
    request.push(plen);
    request.extend_from_slice(password.as_bytes());
    stream.write_all(&request).await.map_err(io_err("write auth"))?;

    let mut response = [0u8; 2];
    stream
        .read_exact(&mut response)
        .await
        .map_err(io_err("read auth response"))?;

    if response[0] != AUTH_PASSWORD_VERSION {
        return Err(Socks5Error::ProtocolError(format!(
            "invalid auth version: {:#04x}",
            response[0]
        )));
    }
    if response[1] != 0x00 {
        return Err(Socks5Error::AuthFailed);
    }
    trace!("SOCKS5 authentication successful");
    Ok(())
}

/// Build a `CONNECT` request for `addr`
#[must_use]
pub fn build_connect_request(addr: SocketAddr) -> Vec<u8> {
    let mut request = Vec::with_capacity(22);
    request.extend_from_slice(&[SOCKS5_VERSION, CMD_CONNECT, 0x00]);
    match addr {
        SocketAddr::V4(v4) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&v4.ip().octets());
        }
        SocketAddr::V6(v6) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&v6.ip().octets());
        }
    }
    request.extend_from_slice(&addr.port().to_be_bytes());
    request
}

/// Read a `CONNECT` reply and return the bound address.
pub async fn read_connect_reply<S>(stream: &mut S) -> Result<SocketAddr, Socks5Error>
where
    S: AsyncRead + Unpin,
{
    // VER | REP | RSV | ATYP
    let mut header = [0u8; 4];
    stream
        .read_exact(&mut header)
        .await
        .map_err(io_err("read reply header"))?;

    if header[0] != SOCKS5_VERSION {
        return Err(Socks5Error::InvalidVersion {
            expected: SOCKS5_VERSION,
            actual: header[0],
        });
    }
    if header[1] != REPLY_SUCCEEDED {
        return Err(Socks5Error::ServerReply {
            code: header[1],
            message: reply_message(header[1]).to_string(),
        });
    }

    let bound = match header[3] {
        ATYP_IPV4 => {
            let mut buf = [0u8; 6];
            stream.read_exact(&mut buf).await.map_err(io_err("read IPv4 bound address"))?;
            let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
            SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be_bytes([buf[4], buf[5]])))
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 18];
            stream.read_exact(&mut buf).await.map_err(io_err("read IPv6 bound address"))?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[..16]);
            let port = u16::from_be_bytes([buf[16], buf[17]]);
            SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(octets), port, 0, 0))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await.map_err(io_err("read domain length"))?;
            // Domain plus port; the name itself is not needed.
            let mut rest = vec![0u8; usize::from(len[0]) + 2];
            stream.read_exact(&mut rest).await.map_err(io_err("read bound domain"))?;
            let port = u16::from_be_bytes([rest[rest.len() - 2], rest[rest.len() - 1]]);
            SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))
        }
        other => return Err(Socks5Error::InvalidAddressType(other)),
    };

    trace!("SOCKS5 bound address: {}", bound);
    Ok(bound)
}

// ============================================================================
// Dialer
// ============================================================================

/// [`ProxyDialer`] backed by a SOCKS5 server.
pub struct Socks5Dialer {
    config: Socks5Config,
    protect: Option<Protector>,
}

impl Socks5Dialer {
    pub fn new(config: Socks5Config, protect: Option<Protector>) -> Self {
        Self { config, protect }
    }

    pub fn config(&self) -> &Socks5Config {
        &self.config
    }

    async fn negotiate(&self, target: SocketAddr) -> Result<tokio::net::TcpStream, RelayError> {
        let server = self.config.server_addr;
        let mut stream = socket::dial_tcp(
            server,
            self.protect.as_deref(),
            self.config.connect_timeout,
        )
        .await?;

        handshake(&mut stream, self.config.auth.as_ref())
            .await
            .map_err(|e| RelayError::dial_failure(server, e))?;

        stream
            .write_all(&build_connect_request(target))
            .await
            .map_err(|e| RelayError::dial_failure(target, format!("write CONNECT failed: {e}")))?;
        let bound = read_connect_reply(&mut stream)
            .await
            .map_err(|e| RelayError::dial_failure(target, e))?;

        debug!(%target, %bound, "SOCKS5 CONNECT established");
        Ok(stream)
    }
}

impl fmt::Debug for Socks5Dialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socks5Dialer")
            .field("server_addr", &self.config.server_addr)
            .field("udp_relay_addr", &self.config.udp_relay_addr)
            .field("has_auth", &self.config.has_auth())
            .field("protected", &self.protect.is_some())
            .finish()
    }
}

#[async_trait]
impl ProxyDialer for Socks5Dialer {
    async fn dial_tcp(&self, target: SocketAddr) -> Result<ProxyStream, RelayError> {
        match timeout(self.config.connect_timeout, self.negotiate(target)).await {
            Ok(Ok(stream)) => Ok(Box::new(stream)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RelayError::dial_failure(target, Socks5Error::HandshakeTimeout)),
        }
    }

    async fn dial_udp(&self) -> Result<Arc<dyn DatagramConn>, RelayError> {
        let relay = self.config.udp_relay_addr;
        let socket = socket::dial_udp(relay, self.protect.as_deref()).await?;
        trace!(%relay, "UDP relay socket connected");
        Ok(Arc::new(UdpDatagramConn::new(socket, relay)))
    }
}
