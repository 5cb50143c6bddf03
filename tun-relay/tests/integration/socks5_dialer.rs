//! SOCKS5 dialer integration tests
//!
//! # Test Categories
//!
//! 1. **Protocol Tests**: `CONNECT` for IPv4 and IPv6 targets
//! 2. **Authentication Tests**: username/password accepted and rejected
//! 3. **Error Handling Tests**: refused replies, malformed servers, timeouts
//! 4. **Datagram Tests**: envelope exchange with the UDP relay endpoint
//! 5. **Protect Tests**: the protect hook sees every proxy socket

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use tun_relay::envelope::Envelope;
use tun_relay::error::RelayError;
use tun_relay::proxy::{ProxyDialer, Socks5Config, Socks5Dialer};
use tun_relay::socket::Protector;

use super::{MockServerConfig, MockSocks5, MockUdpRelay, REPLY_CONNECTION_REFUSED};

fn dialer(server: SocketAddr) -> Socks5Dialer {
    let config = Socks5Config::new(server, "127.0.0.1:9".parse().unwrap())
        .with_connect_timeout(Duration::from_secs(2));
    Socks5Dialer::new(config, None)
}

async fn assert_echo(dialer: &Socks5Dialer, target: SocketAddr, msg: &[u8]) {
    let mut stream = dialer.dial_tcp(target).await.unwrap();
    stream.write_all(msg).await.unwrap();
    let mut buf = vec![0u8; msg.len()];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, msg);
}

// ============================================================================
// Protocol Tests
// ============================================================================

#[tokio::test]
async fn test_connect_ipv4_target() {
    let server = MockSocks5::spawn(MockServerConfig::default()).await;
    let target: SocketAddr = "93.184.216.34:443".parse().unwrap();

    assert_echo(&dialer(server.addr), target, b"GET / HTTP/1.1\r\n\r\n").await;
    assert_eq!(server.targets.lock().as_slice(), &[target]);
}

#[tokio::test]
async fn test_connect_ipv6_target() {
    let server = MockSocks5::spawn(MockServerConfig::default()).await;
    let target: SocketAddr = "[2001:db8::1]:8443".parse().unwrap();

    assert_echo(&dialer(server.addr), target, b"v6").await;
    assert_eq!(server.targets.lock().as_slice(), &[target]);
}

#[tokio::test]
async fn test_textual_target() {
    let server = MockSocks5::spawn(MockServerConfig::default()).await;
    let dialer = dialer(server.addr);

    let mut stream = dialer.dial_tcp_str("10.1.2.3:22").await.unwrap();
    stream.write_all(b"ssh").await.unwrap();
    let mut buf = [0u8; 3];
    stream.read_exact(&mut buf).await.unwrap();

    let err = dialer.dial_tcp_str("not an address").await.err().unwrap();
    assert!(matches!(err, RelayError::InvalidAddress(_)));
    assert_eq!(server.connection_count(), 1);
}

// ============================================================================
// Authentication Tests
// ============================================================================

#[tokio::test]
async fn test_password_auth_accepted() {
    let server = MockSocks5::spawn(MockServerConfig {
        credentials: Some(("user".into(), "pass".into())),
        ..Default::default()
    })
    .await;
    let config = Socks5Config::new(server.addr, "127.0.0.1:9".parse().unwrap())
        .with_auth("user", "pass");
    let dialer = Socks5Dialer::new(config, None);

    assert_echo(&dialer, "1.2.3.4:80".parse().unwrap(), b"ok").await;
}

#[tokio::test]
async fn test_password_auth_rejected() {
    let server = MockSocks5::spawn(MockServerConfig {
        credentials: Some(("user".into(), "pass".into())),
        ..Default::default()
    })
    .await;
    let config = Socks5Config::new(server.addr, "127.0.0.1:9".parse().unwrap())
        .with_auth("user", "wrong");
    let dialer = Socks5Dialer::new(config, None);

    let err = dialer.dial_tcp("1.2.3.4:80".parse().unwrap()).await.err().unwrap();
    assert!(matches!(err, RelayError::DialFailure { .. }));
    assert!(server.targets.lock().is_empty());
}

#[tokio::test]
async fn test_auth_required_but_not_configured() {
    let server = MockSocks5::spawn(MockServerConfig {
        credentials: Some(("user".into(), "pass".into())),
        ..Default::default()
    })
    .await;

    let err = dialer(server.addr)
        .dial_tcp("1.2.3.4:80".parse().unwrap())
        .await
        .err()
        .unwrap();
    assert!(err.to_string().contains("No acceptable authentication method"));
}

// ============================================================================
// Error Handling Tests
// ============================================================================

#[tokio::test]
async fn test_refused_reply_is_dial_failure() {
    let server = MockSocks5::spawn(MockServerConfig {
        reply_code: REPLY_CONNECTION_REFUSED,
        ..Default::default()
    })
    .await;

    let err = dialer(server.addr)
        .dial_tcp("1.2.3.4:80".parse().unwrap())
        .await
        .err()
        .unwrap();
    match err {
        RelayError::DialFailure { addr, reason } => {
            assert_eq!(addr, "1.2.3.4:80");
            assert!(reason.contains("0x05"), "{reason}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_malformed_server_is_rejected() {
    let server = MockSocks5::spawn(MockServerConfig {
        send_malformed: true,
        ..Default::default()
    })
    .await;

    let err = dialer(server.addr)
        .dial_tcp("1.2.3.4:80".parse().unwrap())
        .await
        .err()
        .unwrap();
    assert!(err.to_string().contains("Invalid SOCKS version"));
}

#[tokio::test]
async fn test_slow_server_hits_connect_timeout() {
    let server = MockSocks5::spawn(MockServerConfig {
        response_delay: Duration::from_secs(3),
        ..Default::default()
    })
    .await;
    let config = Socks5Config::new(server.addr, "127.0.0.1:9".parse().unwrap())
        .with_connect_timeout(Duration::from_millis(200));
    let dialer = Socks5Dialer::new(config, None);

    let started = std::time::Instant::now();
    let err = dialer.dial_tcp("1.2.3.4:80".parse().unwrap()).await.err().unwrap();
    assert!(err.to_string().contains("timeout"), "{err}");
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_unreachable_server() {
    // Bind then drop to get a port nothing listens on.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = dialer(addr).dial_tcp("1.2.3.4:80".parse().unwrap()).await.err().unwrap();
    assert!(matches!(err, RelayError::DialFailure { .. }));
}

// ============================================================================
// Datagram Tests
// ============================================================================

#[tokio::test]
async fn test_datagram_exchange_with_relay() {
    let relay = MockUdpRelay::echo().await;
    let config = Socks5Config::new("127.0.0.1:9".parse().unwrap(), relay.addr);
    let dialer = Socks5Dialer::new(config, None);

    let conn = dialer.dial_udp().await.unwrap();
    let target: SocketAddr = "1.1.1.1:53".parse().unwrap();
    let source: SocketAddr = "10.0.0.2:5000".parse().unwrap();
    let wire = Envelope::new(target, source, b"query").to_bytes().unwrap();
    conn.send(&wire).await.unwrap();

    let mut buf = vec![0u8; 2048];
    let n = tokio::time::timeout(Duration::from_secs(5), conn.recv(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let reply = Envelope::decode(&buf[..n]).unwrap();
    assert_eq!(reply.target, target);
    assert_eq!(reply.source, source);
    assert_eq!(reply.payload, b"query");

    conn.close();
    assert!(conn.is_closed());
}

// ============================================================================
// Protect Tests
// ============================================================================

#[cfg(unix)]
#[tokio::test]
async fn test_protect_hook_sees_proxy_sockets() {
    let server = MockSocks5::spawn(MockServerConfig::default()).await;
    let relay = MockUdpRelay::echo().await;
    let calls = Arc::new(AtomicU32::new(0));

    let seen = Arc::clone(&calls);
    let protect: Protector = Arc::new(move |fd: i32| {
        assert!(fd >= 0);
        seen.fetch_add(1, Ordering::SeqCst);
        0
    });
    let dialer = Socks5Dialer::new(Socks5Config::new(server.addr, relay.addr), Some(protect));

    assert_echo(&dialer, "1.2.3.4:80".parse().unwrap(), b"p").await;
    dialer.dial_udp().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[cfg(unix)]
#[tokio::test]
async fn test_protect_failure_aborts_dial() {
    let server = MockSocks5::spawn(MockServerConfig::default()).await;
    let protect: Protector = Arc::new(|_fd: i32| -1);
    let dialer = Socks5Dialer::new(
        Socks5Config::new(server.addr, "127.0.0.1:9".parse().unwrap()),
        Some(protect),
    );

    let err = dialer.dial_tcp("1.2.3.4:80".parse().unwrap()).await.err().unwrap();
    assert!(matches!(err, RelayError::ProtectionFailed { code: -1, .. }));
    assert_eq!(server.connection_count(), 0);
}
