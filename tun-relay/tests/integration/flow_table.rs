//! Flow table behaviour under concurrent use, with a counting flow type

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tun_relay::flow::{FlowId, FlowTable, IdleSweeper, ManagedFlow};

#[derive(Default)]
struct Probe {
    proxy_releases: AtomicU32,
    closes: AtomicU32,
}

impl Probe {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn closes(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }

    fn proxy_releases(&self) -> u32 {
        self.proxy_releases.load(Ordering::SeqCst)
    }
}

impl ManagedFlow for Probe {
    fn release_proxy(&self) {
        self.proxy_releases.fetch_add(1, Ordering::SeqCst);
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

fn session(s: &str) -> FlowId {
    FlowId::udp_session(s.parse::<SocketAddr>().unwrap())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_datagrams_create_one_flow() {
    let table: Arc<FlowTable<Probe>> = Arc::new(FlowTable::new(10));
    let created = Arc::new(AtomicU32::new(0));

    let tasks: Vec<_> = (0..32)
        .map(|_| {
            let table = Arc::clone(&table);
            let created = Arc::clone(&created);
            tokio::spawn(async move {
                let (_, inserted) = table.get_or_insert_with(session("10.0.0.2:5000"), || {
                    created.fetch_add(1, Ordering::SeqCst);
                    Probe::new()
                });
                inserted
            })
        })
        .collect();

    let mut inserted = 0;
    for task in tasks {
        if task.await.unwrap() {
            inserted += 1;
        }
    }
    assert_eq!(inserted, 1);
    assert_eq!(created.load(Ordering::SeqCst), 1);
    assert_eq!(table.len(), 1);
}

#[test]
fn test_mapped_and_plain_ipv4_share_a_key() {
    let table: FlowTable<Probe> = FlowTable::new(10);
    table.upsert(session("10.0.0.2:5000"), Probe::new());
    assert!(table.get(&session("[::ffff:10.0.0.2]:5000")).is_some());
}

#[test]
fn test_replacement_releases_only_the_proxy() {
    let table = FlowTable::new(10);
    let old = Probe::new();
    let new = Probe::new();

    table.upsert(session("10.0.0.2:5000"), Arc::clone(&old));
    let previous = table.upsert(session("10.0.0.2:5000"), Arc::clone(&new)).unwrap();

    assert!(Arc::ptr_eq(&previous, &old));
    assert_eq!(old.proxy_releases(), 1);
    assert_eq!(old.closes(), 0);

    // The old flow's teardown must not evict its replacement.
    assert!(!table.remove_if_same(&session("10.0.0.2:5000"), &old));
    assert!(Arc::ptr_eq(&table.get(&session("10.0.0.2:5000")).unwrap(), &new));
}

#[test]
fn test_close_all_closes_each_flow_once() {
    let table = FlowTable::new(10);
    let probes: Vec<_> = (0..5).map(|_| Probe::new()).collect();
    for (i, probe) in probes.iter().enumerate() {
        table.upsert(session(&format!("10.0.0.{}:5000", i + 2)), Arc::clone(probe));
    }

    assert_eq!(table.close_all(), 5);
    assert_eq!(table.close_all(), 0);
    assert!(table.is_empty());
    assert!(probes.iter().all(|p| p.closes() == 1));
}

#[tokio::test(start_paused = true)]
async fn test_busy_flow_survives_while_quiet_one_expires() {
    let table = Arc::new(FlowTable::new(3));
    let busy = Probe::new();
    let quiet = Probe::new();
    table.upsert(session("10.0.0.2:5000"), Arc::clone(&busy));
    table.upsert(session("10.0.0.3:5000"), Arc::clone(&quiet));

    let sweeper = IdleSweeper::new();
    sweeper.start(Arc::clone(&table), Duration::from_secs(1));

    for _ in 0..6 {
        tokio::time::sleep(Duration::from_millis(900)).await;
        table.touch(&session("10.0.0.2:5000"));
    }

    assert_eq!(quiet.closes(), 1);
    assert_eq!(busy.closes(), 0);
    assert_eq!(table.len(), 1);
    assert_eq!(sweeper.expired(), 1);

    sweeper.shutdown().await;
    assert_eq!(table.close_all(), 1);
    assert_eq!(busy.closes(), 1);
}
