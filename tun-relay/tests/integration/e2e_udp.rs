//! UDP end to end: host stack -> engine -> envelope relay mock
//!
//! Datagrams enter through [`LwipBackend::on_udp_recv`] and replies come
//! back through the recording control block.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use hickory_proto::op::{Message, MessageType, Query, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record, RecordType};

use tun_relay::config::Config;
use tun_relay::engine::{Engine, EngineBuilder};
use tun_relay::envelope::Envelope;
use tun_relay::stack::{LwipBackend, UdpPcb};

use super::{test_config, wait_until, MockUdpRelay, RecordingPcb};

const APP: &str = "10.0.0.2:5000";
const TARGET: &str = "1.1.1.1:9000";
const RESOLVER: &str = "8.8.8.8:53";

fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

fn setup_with(relay: &MockUdpRelay, tweak: impl FnOnce(&mut Config)) -> (Engine, LwipBackend) {
    let mut config = test_config(addr("127.0.0.1:9"), relay.addr);
    tweak(&mut config);
    let engine = EngineBuilder::new(config).build().unwrap();
    engine.start();
    let backend = LwipBackend::new(Arc::clone(engine.buffer_pool()));
    engine.attach(&backend).unwrap();
    (engine, backend)
}

fn setup(relay: &MockUdpRelay) -> (Engine, LwipBackend) {
    setup_with(relay, |_| {})
}

fn send(backend: &LwipBackend, pcb: &Arc<RecordingPcb>, segments: &[&[u8]], dst: &str) {
    let pcb = Arc::clone(pcb) as Arc<dyn UdpPcb>;
    backend.on_udp_recv(pcb, segments, APP, dst).unwrap();
}

fn dns_query(id: u16, domain: &str) -> Vec<u8> {
    let mut msg = Message::new();
    msg.set_id(id);
    msg.set_recursion_desired(true);
    msg.add_query(Query::query(Name::from_ascii(domain).unwrap(), RecordType::A));
    msg.to_vec().unwrap()
}

/// Resolver behaviour for the mock relay: answer A queries with a fixed
/// address, echo anything else.
fn resolve(envelope: &Envelope<'_>) -> Option<Vec<u8>> {
    if envelope.target.port() != 53 {
        return Some(envelope.payload.to_vec());
    }
    let query = Message::from_vec(envelope.payload).ok()?;
    let mut response = Message::new();
    response.set_id(query.id());
    response.set_message_type(MessageType::Response);
    response.set_response_code(ResponseCode::NoError);
    for q in query.queries() {
        response.add_query(q.clone());
        response.add_answer(Record::from_rdata(
            q.name().clone(),
            300,
            RData::A(A(Ipv4Addr::new(93, 184, 216, 34))),
        ));
    }
    response.to_vec().ok()
}

#[tokio::test]
async fn test_udp_round_trip() {
    let relay = MockUdpRelay::echo().await;
    let (engine, backend) = setup(&relay);
    let pcb = RecordingPcb::new();

    send(&backend, &pcb, &[b"ping"], TARGET);

    wait_until(|| pcb.sent_count() == 1).await;
    let (payload, from, to) = pcb.sent.lock()[0].clone();
    assert_eq!(payload, b"ping");
    assert_eq!(from, addr(TARGET));
    assert_eq!(to, addr(APP));

    let seen = relay.seen.lock().clone();
    assert_eq!(seen, vec![(addr(TARGET), addr(APP), b"ping".to_vec())]);

    let stats = engine.stats().relay;
    assert_eq!(stats.udp_flows_opened, 1);
    assert_eq!(stats.udp_datagrams_up, 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_segment_chain_is_relayed_whole() {
    let relay = MockUdpRelay::echo().await;
    let (engine, backend) = setup(&relay);
    let pcb = RecordingPcb::new();

    send(&backend, &pcb, &[b"he", b"ll", b"o"], TARGET);

    wait_until(|| pcb.sent_count() == 1).await;
    assert_eq!(relay.seen.lock()[0].2, b"hello");
    assert_eq!(pcb.sent.lock()[0].0, b"hello");
    engine.shutdown().await;
}

#[tokio::test]
async fn test_one_flow_per_local_endpoint() {
    let relay = MockUdpRelay::echo().await;
    let (engine, backend) = setup(&relay);
    let pcb = RecordingPcb::new();

    send(&backend, &pcb, &[b"a"], "1.1.1.1:9000");
    send(&backend, &pcb, &[b"b"], "9.9.9.9:9001");

    wait_until(|| pcb.sent_count() == 2).await;
    let mut sources: Vec<_> = pcb.sent.lock().iter().map(|(p, from, _)| (p.clone(), *from)).collect();
    sources.sort();
    assert_eq!(
        sources,
        vec![
            (b"a".to_vec(), addr("1.1.1.1:9000")),
            (b"b".to_vec(), addr("9.9.9.9:9001")),
        ]
    );
    assert_eq!(engine.stats().relay.udp_flows_opened, 1);
    assert_eq!(engine.stats().udp_flows_active, 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_dns_answer_served_from_cache() {
    let relay = MockUdpRelay::spawn(resolve).await;
    let (engine, backend) = setup(&relay);
    let pcb = RecordingPcb::new();

    send(&backend, &pcb, &[&dns_query(0x1111, "example.com.")], RESOLVER);
    wait_until(|| {
        engine
            .stats()
            .dns_cache
            .is_some_and(|dns| dns.inserts == 1)
    })
    .await;
    assert_eq!(relay.received(), 1);

    send(&backend, &pcb, &[&dns_query(0x2222, "example.com.")], RESOLVER);
    wait_until(|| pcb.sent_count() == 2).await;

    assert_eq!(relay.received(), 1);
    let (answer, from, to) = pcb.sent.lock()[1].clone();
    assert_eq!(from, addr(RESOLVER));
    assert_eq!(to, addr(APP));
    let answer = Message::from_vec(&answer).unwrap();
    assert_eq!(answer.id(), 0x2222);
    assert_eq!(answer.answers().len(), 1);
    assert_eq!(engine.stats().relay.dns_cache_hits, 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_dns_cache_disabled_always_relays() {
    let relay = MockUdpRelay::spawn(resolve).await;
    let (engine, backend) = setup_with(&relay, |config| config.dns.enabled = false);
    let pcb = RecordingPcb::new();

    send(&backend, &pcb, &[&dns_query(1, "example.com.")], RESOLVER);
    wait_until(|| pcb.sent_count() == 1).await;
    send(&backend, &pcb, &[&dns_query(2, "example.com.")], RESOLVER);
    wait_until(|| pcb.sent_count() == 2).await;

    assert_eq!(relay.received(), 2);
    assert!(engine.stats().dns_cache.is_none());
    engine.shutdown().await;
}

#[tokio::test]
async fn test_idle_flow_expires_and_releases_pcb() {
    let relay = MockUdpRelay::echo().await;
    let (engine, backend) = setup_with(&relay, |config| {
        config.relay.udp_idle_ticks = 1;
        config.relay.sweep_interval_secs = 1;
    });
    let pcb = RecordingPcb::new();

    send(&backend, &pcb, &[b"once"], TARGET);
    wait_until(|| pcb.sent_count() == 1).await;

    wait_until(|| engine.stats().udp_flows_active == 0).await;
    assert_eq!(engine.stats().udp_flows_expired, 1);
    assert_eq!(pcb.release_count(), 1);
    assert_eq!(backend.udp_endpoints(), 0);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_live_flows() {
    let relay = MockUdpRelay::echo().await;
    let (engine, backend) = setup(&relay);
    let pcb = RecordingPcb::new();

    send(&backend, &pcb, &[b"x"], TARGET);
    wait_until(|| pcb.sent_count() == 1).await;

    assert_eq!(engine.shutdown().await, 1);
    assert_eq!(pcb.release_count(), 1);
    assert_eq!(engine.stats().udp_flows_active, 0);
}

#[tokio::test]
async fn test_replies_follow_rebound_pcb() {
    let relay = MockUdpRelay::echo().await;
    let (engine, backend) = setup(&relay);
    let first = RecordingPcb::new();
    let second = RecordingPcb::new();

    send(&backend, &first, &[b"one"], TARGET);
    wait_until(|| first.sent_count() == 1).await;

    assert!(backend.on_udp_close(APP));
    send(&backend, &second, &[b"two"], TARGET);
    wait_until(|| second.sent_count() == 1).await;

    assert_eq!(second.sent.lock()[0].0, b"two");
    assert_eq!(first.sent_count(), 1);
    assert_eq!(first.release_count(), 0);
    assert_eq!(engine.stats().relay.udp_flows_opened, 1);
    engine.shutdown().await;
}
