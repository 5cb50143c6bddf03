//! Integration tests for tun-relay
//!
//! These drive the public API against mock proxies on loopback: a SOCKS5
//! server that echoes after `CONNECT`, and an envelope relay whose replies
//! are produced by a per-test closure.
//!
//! # Test Organization
//!
//! - `socks5_dialer`: SOCKS5 negotiation, auth and failure handling
//! - `e2e_tcp`: TCP connections through a built engine
//! - `e2e_udp`: UDP flows, DNS short-circuit and flow lifecycle
//! - `flow_table`: table and sweeper behaviour with custom flows
//!
//! # Running Tests
//!
//! ```bash
//! cargo test --test integration_tests
//! cargo test --test integration_tests socks5
//! ```

pub mod e2e_tcp;
pub mod e2e_udp;
pub mod flow_table;
pub mod socks5_dialer;

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use tun_relay::config::Config;
use tun_relay::envelope::Envelope;
use tun_relay::stack::UdpPcb;

// ============================================================================
// SOCKS5 Protocol Constants
// ============================================================================

pub const SOCKS5_VERSION: u8 = 0x05;
pub const AUTH_METHOD_NONE: u8 = 0x00;
pub const AUTH_METHOD_PASSWORD: u8 = 0x02;
pub const AUTH_METHOD_NO_ACCEPTABLE: u8 = 0xFF;
pub const AUTH_PASSWORD_VERSION: u8 = 0x01;
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_IPV6: u8 = 0x04;
pub const REPLY_SUCCEEDED: u8 = 0x00;
pub const REPLY_CONNECTION_REFUSED: u8 = 0x05;

// ============================================================================
// Mock SOCKS5 Server
// ============================================================================

/// Behaviour of [`MockSocks5`]
#[derive(Clone)]
pub struct MockServerConfig {
    /// Expected `(username, password)`; `None` accepts no-auth clients
    pub credentials: Option<(String, String)>,
    /// Reply code sent after `CONNECT`
    pub reply_code: u8,
    /// Delay before answering the method selection
    pub response_delay: Duration,
    /// Answer the method selection with a SOCKS4 version byte
    pub send_malformed: bool,
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            credentials: None,
            reply_code: REPLY_SUCCEEDED,
            response_delay: Duration::ZERO,
            send_malformed: false,
        }
    }
}

/// SOCKS5 server that echoes every byte once `CONNECT` succeeds
pub struct MockSocks5 {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU32>,
    pub targets: Arc<Mutex<Vec<SocketAddr>>>,
}

impl MockSocks5 {
    pub async fn spawn(config: MockServerConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicU32::new(0));
        let targets = Arc::new(Mutex::new(Vec::new()));

        let count = Arc::clone(&connections);
        let seen = Arc::clone(&targets);
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                count.fetch_add(1, Ordering::SeqCst);
                let config = config.clone();
                let seen = Arc::clone(&seen);
                tokio::spawn(async move {
                    let _ = serve_socks5(socket, config, seen).await;
                });
            }
        });

        Self {
            addr,
            connections,
            targets,
        }
    }

    pub fn connection_count(&self) -> u32 {
        self.connections.load(Ordering::SeqCst)
    }
}

async fn serve_socks5(
    mut socket: TcpStream,
    config: MockServerConfig,
    targets: Arc<Mutex<Vec<SocketAddr>>>,
) -> io::Result<()> {
    // VER | NMETHODS | METHODS
    let mut header = [0u8; 2];
    socket.read_exact(&mut header).await?;
    let mut methods = vec![0u8; usize::from(header[1])];
    socket.read_exact(&mut methods).await?;

    if !config.response_delay.is_zero() {
        tokio::time::sleep(config.response_delay).await;
    }
    if config.send_malformed {
        socket.write_all(&[0x04, AUTH_METHOD_NONE]).await?;
        return Ok(());
    }

    match &config.credentials {
        Some((user, pass)) => {
            if !methods.contains(&AUTH_METHOD_PASSWORD) {
                socket
                    .write_all(&[SOCKS5_VERSION, AUTH_METHOD_NO_ACCEPTABLE])
                    .await?;
                return Ok(());
            }
            socket.write_all(&[SOCKS5_VERSION, AUTH_METHOD_PASSWORD]).await?;

            // VER | ULEN | USERNAME | PLEN | PASSWORD
            let mut ver_ulen = [0u8; 2];
            socket.read_exact(&mut ver_ulen).await?;
            let mut username = vec![0u8; usize::from(ver_ulen[1])];
            socket.read_exact(&mut username).await?;
            let mut plen = [0u8; 1];
            socket.read_exact(&mut plen).await?;
            let mut password = vec![0u8; usize::from(plen[0])];
            socket.read_exact(&mut password).await?;

            let ok = username == user.as_bytes() && password == pass.as_bytes();
            let status = if ok { 0x00 } else { 0x01 };
            socket.write_all(&[AUTH_PASSWORD_VERSION, status]).await?;
            if !ok {
                return Ok(());
            }
        }
        None => {
            socket.write_all(&[SOCKS5_VERSION, AUTH_METHOD_NONE]).await?;
        }
    }

    // VER | CMD | RSV | ATYP | DST.ADDR | DST.PORT
    let mut request = [0u8; 4];
    socket.read_exact(&mut request).await?;
    let target = match request[3] {
        ATYP_IPV4 => {
            let mut buf = [0u8; 6];
            socket.read_exact(&mut buf).await?;
            let ip = std::net::Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
            SocketAddr::new(ip.into(), u16::from_be_bytes([buf[4], buf[5]]))
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 18];
            socket.read_exact(&mut buf).await?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[..16]);
            let ip = std::net::Ipv6Addr::from(octets);
            SocketAddr::new(ip.into(), u16::from_be_bytes([buf[16], buf[17]]))
        }
        _ => return Ok(()),
    };
    targets.lock().push(target);

    socket
        .write_all(&[SOCKS5_VERSION, config.reply_code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await?;
    if config.reply_code != REPLY_SUCCEEDED {
        return Ok(());
    }

    let (mut rd, mut wr) = socket.split();
    tokio::io::copy(&mut rd, &mut wr).await?;
    Ok(())
}

// ============================================================================
// Mock Envelope Relay
// ============================================================================

/// UDP endpoint speaking the envelope format
pub struct MockUdpRelay {
    pub addr: SocketAddr,
    /// Envelopes received so far
    pub received: Arc<AtomicU32>,
    /// Decoded `(target, source, payload)` of every envelope
    pub seen: Arc<Mutex<Vec<(SocketAddr, SocketAddr, Vec<u8>)>>>,
}

impl MockUdpRelay {
    /// Relay that mirrors each envelope's header and answers with
    /// `respond(envelope)`; `None` stays silent.
    pub async fn spawn<F>(respond: F) -> Self
    where
        F: Fn(&Envelope<'_>) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let received = Arc::new(AtomicU32::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let count = Arc::clone(&received);
        let log = Arc::clone(&seen);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            while let Ok((n, from)) = socket.recv_from(&mut buf).await {
                let Ok(envelope) = Envelope::decode(&buf[..n]) else {
                    continue;
                };
                count.fetch_add(1, Ordering::SeqCst);
                log.lock()
                    .push((envelope.target, envelope.source, envelope.payload.to_vec()));

                if let Some(reply) = respond(&envelope) {
                    let wire = Envelope::new(envelope.target, envelope.source, &reply)
                        .to_bytes()
                        .unwrap();
                    let _ = socket.send_to(&wire, from).await;
                }
            }
        });

        Self {
            addr,
            received,
            seen,
        }
    }

    /// Relay that answers every payload with itself
    pub async fn echo() -> Self {
        Self::spawn(|envelope| Some(envelope.payload.to_vec())).await
    }

    pub fn received(&self) -> u32 {
        self.received.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Host Stack Doubles
// ============================================================================

/// Control block that records what the relay writes back
#[derive(Default)]
pub struct RecordingPcb {
    pub sent: Mutex<Vec<(Vec<u8>, SocketAddr, SocketAddr)>>,
    pub releases: AtomicU32,
}

impl RecordingPcb {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn release_count(&self) -> u32 {
        self.releases.load(Ordering::SeqCst)
    }
}

impl UdpPcb for RecordingPcb {
    fn send_from(&self, payload: &[u8], from: SocketAddr, to: SocketAddr) -> io::Result<usize> {
        self.sent.lock().push((payload.to_vec(), from, to));
        Ok(payload.len())
    }

    fn release(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Configuration pointing at the given mock proxy endpoints
pub fn test_config(socks5: SocketAddr, udp_relay: SocketAddr) -> Config {
    let mut config = Config::default_config();
    config.proxy.socks5_addr = socks5;
    config.proxy.udp_relay_addr = udp_relay;
    config.proxy.connect_timeout_secs = 2;
    config.relay.io_timeout_secs = 5;
    config
}

/// Poll `cond` until it holds, failing the test after five seconds
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
