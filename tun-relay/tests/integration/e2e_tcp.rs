//! TCP end to end: host stack -> engine -> SOCKS5 mock -> echo
//!
//! Connections enter through the callback-driven [`LwipBackend`], the way a
//! host stack would hand them over, and are relayed by an engine using the
//! real SOCKS5 dialer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use tun_relay::engine::{Engine, EngineBuilder};
use tun_relay::error::AdapterError;
use tun_relay::stack::LwipBackend;

use super::{test_config, wait_until, MockServerConfig, MockSocks5, REPLY_CONNECTION_REFUSED};

const LOCAL: &str = "10.0.0.2:40000";
const REMOTE: &str = "93.184.216.34:80";

async fn setup(server: MockServerConfig) -> (MockSocks5, Engine, LwipBackend) {
    let socks = MockSocks5::spawn(server.clone()).await;
    let mut config = test_config(socks.addr, "127.0.0.1:9".parse().unwrap());
    if let Some((user, pass)) = server.credentials {
        config.proxy.username = Some(user);
        config.proxy.password = Some(pass);
    }

    let engine = EngineBuilder::new(config).build().unwrap();
    engine.start();
    let backend = LwipBackend::new(Arc::clone(engine.buffer_pool()));
    engine.attach(&backend).unwrap();
    (socks, engine, backend)
}

#[tokio::test]
async fn test_tcp_echo_through_socks5() {
    let (socks, engine, backend) = setup(MockServerConfig::default()).await;
    let (mut app, stack_side) = tokio::io::duplex(4096);

    backend.on_tcp_accept(LOCAL, REMOTE, stack_side).unwrap();

    app.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    tokio::time::timeout(Duration::from_secs(5), app.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"hello");

    let remote: SocketAddr = REMOTE.parse().unwrap();
    assert_eq!(socks.targets.lock().as_slice(), &[remote]);

    drop(app);
    wait_until(|| {
        let stats = engine.stats().relay;
        stats.tcp_active == 0 && stats.tcp_bytes_up == 5
    })
    .await;
    let stats = engine.stats().relay;
    assert_eq!(stats.tcp_opened, 1);
    assert_eq!(stats.tcp_bytes_down, 5);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_tcp_through_authenticated_proxy() {
    let server = MockServerConfig {
        credentials: Some(("relay".into(), "secret".into())),
        ..Default::default()
    };
    let (_socks, engine, backend) = setup(server).await;
    let (mut app, stack_side) = tokio::io::duplex(4096);

    backend.on_tcp_accept(LOCAL, REMOTE, stack_side).unwrap();

    app.write_all(b"authed").await.unwrap();
    let mut buf = [0u8; 6];
    tokio::time::timeout(Duration::from_secs(5), app.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"authed");
    engine.shutdown().await;
}

#[tokio::test]
async fn test_refused_connect_closes_local_side() {
    let server = MockServerConfig {
        reply_code: REPLY_CONNECTION_REFUSED,
        ..Default::default()
    };
    let (socks, engine, backend) = setup(server).await;
    let (mut app, stack_side) = tokio::io::duplex(4096);

    backend.on_tcp_accept(LOCAL, REMOTE, stack_side).unwrap();

    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(5), app.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);
    assert_eq!(socks.connection_count(), 1);
    assert_eq!(engine.stats().relay.tcp_dial_failures, 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_connections_stay_separate() {
    let (socks, engine, backend) = setup(MockServerConfig::default()).await;

    let mut apps = Vec::new();
    for i in 0..16u16 {
        let (app, stack_side) = tokio::io::duplex(4096);
        let local = format!("10.0.0.2:{}", 40000 + i);
        backend.on_tcp_accept(local.as_str(), REMOTE, stack_side).unwrap();
        apps.push(app);
    }

    let tasks: Vec<_> = apps
        .into_iter()
        .enumerate()
        .map(|(i, mut app)| {
            tokio::spawn(async move {
                let msg = format!("connection-{i:02}");
                app.write_all(msg.as_bytes()).await.unwrap();
                let mut buf = vec![0u8; msg.len()];
                app.read_exact(&mut buf).await.unwrap();
                assert_eq!(buf, msg.as_bytes());
            })
        })
        .collect();
    for task in tasks {
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    assert_eq!(socks.connection_count(), 16);
    assert_eq!(engine.stats().relay.tcp_opened, 16);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_host_callbacks_reject_bad_input() {
    let socks = MockSocks5::spawn(MockServerConfig::default()).await;
    let engine = EngineBuilder::new(test_config(socks.addr, "127.0.0.1:9".parse().unwrap()))
        .build()
        .unwrap();
    let backend = LwipBackend::new(Arc::clone(engine.buffer_pool()));

    let (_app, stack_side) = tokio::io::duplex(64);
    let err = backend.on_tcp_accept(LOCAL, REMOTE, stack_side).unwrap_err();
    assert!(matches!(err, AdapterError::HandlerNotRegistered));

    engine.attach(&backend).unwrap();
    let (_app, stack_side) = tokio::io::duplex(64);
    let err = backend.on_tcp_accept("not-an-endpoint", REMOTE, stack_side).unwrap_err();
    assert!(matches!(err, AdapterError::InvalidEndpoint(_)));
    assert_eq!(socks.connection_count(), 0);
}

#[cfg(feature = "netstack")]
#[tokio::test]
async fn test_netstack_backend_stops_on_cancel() {
    use tokio_util::sync::CancellationToken;
    use tun_relay::stack::{NetstackBackend, PacketChannel};

    let engine = EngineBuilder::new(test_config(
        "127.0.0.1:9".parse().unwrap(),
        "127.0.0.1:9".parse().unwrap(),
    ))
    .build()
    .unwrap();
    let backend = NetstackBackend::new();
    engine.attach(backend.as_ref()).unwrap();

    let (device, _link) = PacketChannel::create_pair(64);
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(Arc::clone(&backend).run(device, 1500, shutdown.clone()));

    wait_until(|| backend.is_running()).await;
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(backend.udp_endpoints(), 0);
}
