//! End-to-end rounds against local sockets
//!
//! These tests drive the scheduler with the real protocol checks and an
//! in-memory store.

mod common;

use std::sync::Arc;
use std::time::Duration;

use probe_engine::settings::{KEY_CONCURRENCY, KEY_PROXY_ENABLED, KEY_PROXY_URL};
use probe_engine::{
    Asset, AssetStatus, LivenessProbe, MemoryStore, ProbeDefaults, ProbeEvent, ProgressSnapshot, Protocol,
    Scheduler,
};
use tokio::time::timeout;

fn asset(id: i64, ip: &str, port: u16, protocol: &str) -> Asset {
    Asset::new(id, format!("asset-{id}"), ip.parse().unwrap(), port, Protocol::parse(protocol))
}

fn scheduler(store: Arc<MemoryStore>) -> Scheduler {
    let probe = Arc::new(LivenessProbe::new().expect("probe should build"));
    Scheduler::new(probe, store.clone(), store.clone(), store, ProbeDefaults::default())
}

#[tokio::test]
async fn test_mixed_round_tcp_and_https() {
    let _ = tracing_subscriber::fmt::try_init();

    let open = common::spawn_tcp_acceptor().await;
    let closed = common::closed_port().await;
    let https_500 = common::spawn_https_responder(500).await;

    let store = Arc::new(MemoryStore::with_assets(vec![
        asset(1, "127.0.0.1", open, "tcp"),
        asset(2, "127.0.0.1", closed, "tcp"),
        asset(3, "127.0.0.1", https_500, "https"),
    ]));
    store.set_config(KEY_CONCURRENCY, "2");
    store.set_config(KEY_PROXY_ENABLED, "false");

    let scheduler = scheduler(store.clone());
    let outcome = scheduler.run_once().await.unwrap();

    assert!(outcome.is_completed());
    assert_eq!(scheduler.progress(), ProgressSnapshot { processed: 3, total: 3, alive: 2 });

    let statuses: Vec<AssetStatus> = store.assets().iter().map(|a| a.status).collect();
    assert_eq!(statuses, vec![AssetStatus::Alive, AssetStatus::Dead, AssetStatus::Alive]);
    assert!(store.assets().iter().all(|a| a.last_check.is_some()));

    let history = store.history();
    assert_eq!(history.len(), 1);
    assert_eq!((history[0].total_count, history[0].alive_count), (3, 2));
}

#[tokio::test]
async fn test_looping_emits_events_per_probe() {
    let open = common::spawn_tcp_acceptor().await;
    let closed = common::closed_port().await;

    let store = Arc::new(MemoryStore::with_assets(vec![
        asset(1, "127.0.0.1", open, "ssh"),
        asset(2, "127.0.0.1", closed, "rdp"),
    ]));
    let scheduler = scheduler(store.clone());
    let mut rx = scheduler.subscribe();

    scheduler.start(Some(Duration::from_secs(3600))).await.unwrap();

    let mut updates = Vec::new();
    let mut last_progress = None;
    timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await.unwrap() {
                ProbeEvent::AssetUpdated(asset) => updates.push((asset.id, asset.status)),
                ProbeEvent::Progress(snapshot) => last_progress = Some(snapshot),
                ProbeEvent::RoundComplete { total, alive } => {
                    assert_eq!((total, alive), (2, 1));
                    break;
                }
                _ => {}
            }
        }
    })
    .await
    .expect("round did not complete");

    scheduler.stop();
    assert!(!scheduler.is_running());

    updates.sort_by_key(|(id, _)| *id);
    assert_eq!(updates, vec![(1, AssetStatus::Alive), (2, AssetStatus::Dead)]);
    assert_eq!(last_progress, Some(ProgressSnapshot { processed: 2, total: 2, alive: 1 }));
}

#[tokio::test]
async fn test_round_through_forward_proxy() {
    let proxy = common::spawn_responder(200).await;

    // Documentation-range targets: only the proxy can make them look alive.
    let store = Arc::new(MemoryStore::with_assets(vec![
        asset(1, "192.0.2.1", 22, "ssh"),
        asset(2, "192.0.2.2", 0, "icmp"),
        asset(3, "192.0.2.3", 80, "http"),
    ]));
    store.set_config(KEY_PROXY_URL, &format!("http://127.0.0.1:{proxy}"));
    store.set_config(KEY_PROXY_ENABLED, "true");

    let scheduler = scheduler(store.clone());
    assert!(scheduler.run_once().await.unwrap().is_completed());

    let statuses: Vec<AssetStatus> = store.assets().iter().map(|a| a.status).collect();
    assert_eq!(statuses, vec![AssetStatus::Alive, AssetStatus::Dead, AssetStatus::Alive]);
}

#[tokio::test]
async fn test_proxy_refusing_connect_marks_dead() {
    let proxy = common::spawn_responder(407).await;

    let store = Arc::new(MemoryStore::with_assets(vec![asset(1, "192.0.2.1", 3306, "mysql")]));
    store.set_config(KEY_PROXY_URL, &format!("http://127.0.0.1:{proxy}"));
    store.set_config(KEY_PROXY_ENABLED, "true");

    let scheduler = scheduler(store.clone());
    scheduler.run_once().await.unwrap();

    assert_eq!(store.assets()[0].status, AssetStatus::Dead);
    assert_eq!(scheduler.progress(), ProgressSnapshot { processed: 1, total: 1, alive: 0 });
}
