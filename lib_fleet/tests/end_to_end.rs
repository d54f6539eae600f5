//! # End-to-end Engine Tests
//!
//! Drives a full [`SyncContext`] through in-process transports: live events
//! are fed through a [`ChannelEventSource`], rows land in a [`MemoryStore`]
//! and dashboard pushes are read straight off hub subscriptions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use lib_fleet::configs::{EndpointConfig, SyncConfig};
use lib_fleet::core::{Outbound, PointInTimeSource, ScopeView, StateUpdate, UpdateKind};
use lib_fleet::ingestors::ChannelEventSource;
use lib_fleet::model::{Endpoint, EndpointInfo, EndpointStatus, InstanceSample, Scope};
use lib_fleet::persistence::MemoryStore;
use lib_fleet::{SyncContext, SyncError};

/// Polling source that is never reachable, so only live events produce pushes.
#[derive(Default)]
struct UnreachableApi {
    calls: AtomicU64,
}

#[async_trait]
impl PointInTimeSource for UnreachableApi {
    async fn endpoint_info(&self, _endpoint: &Endpoint) -> Result<EndpointInfo, SyncError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(SyncError::TransientNetwork("unreachable".into()))
    }

    async fn instance_sample(
        &self,
        _endpoint: &Endpoint,
        _instance_id: &str,
    ) -> Result<InstanceSample, SyncError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(SyncError::TransientNetwork("unreachable".into()))
    }
}

struct Harness {
    ctx: SyncContext,
    store: Arc<MemoryStore>,
    source: Arc<ChannelEventSource>,
}

fn harness() -> Harness {
    let mut config = SyncConfig {
        endpoints: vec![EndpointConfig {
            id: "E1".into(),
            base_url: "http://e1.local:9090/api".into(),
            api_key: "secret".into(),
            enabled: true,
        }],
        ..Default::default()
    };
    config.monitor.poll_interval_secs = 3600;
    config.ingestion.reconnect_base_ms = 10;
    config.ingestion.reconnect_max_ms = 50;

    let store = Arc::new(MemoryStore::new());
    let source = Arc::new(ChannelEventSource::new());
    let ctx = SyncContext::initialize(
        config,
        store.clone(),
        source.clone(),
        Arc::new(UnreachableApi::default()),
    )
    .expect("valid config");
    Harness { ctx, store, source }
}

async fn next_update(rx: &mut mpsc::Receiver<Outbound>) -> Arc<StateUpdate> {
    loop {
        let item = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no update within 5s")
            .expect("subscription closed");
        if let Outbound::Update(update) = item {
            return update;
        }
    }
}

async fn next_of_kind(rx: &mut mpsc::Receiver<Outbound>, kind: UpdateKind) -> Arc<StateUpdate> {
    loop {
        let update = next_update(rx).await;
        if update.kind == kind {
            return update;
        }
    }
}

/// Flushes until `done` holds; the writer pool may still be holding the last event.
async fn flush_until(h: &Harness, done: impl Fn(&MemoryStore) -> bool) {
    for _ in 0..50 {
        h.ctx.flush().await.expect("flush");
        if done(&h.store) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("condition not reached after repeated flushes");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_update_reaches_state_storage_and_one_subscriber() {
    let h = harness();
    let feed = h.source.feed("E1");
    let mut sub = h.ctx.subscribe(Scope::Instance("I1".into()));
    let mut other = h.ctx.subscribe(Scope::Instance("I2".into()));
    h.ctx.start().await.unwrap();

    feed.send(Ok(
        r#"{"type":"update","instance":{"id":"I1","type":"server","status":"running","tcprx":100}}"#
            .into(),
    ))
    .unwrap();

    let update = next_update(&mut sub.receiver).await;
    assert_eq!(update.kind, UpdateKind::Instance);
    assert_eq!(update.instance_id.as_deref(), Some("I1"));
    assert_eq!(update.data["counters"]["tcpRx"], 100);

    match h.ctx.get_by_scope(&Scope::Instance("I1".into())) {
        Some(ScopeView::Instance(inst)) => {
            assert_eq!(inst.endpoint_id, "E1");
            assert_eq!(inst.counters.tcp_rx, 100);
        }
        other => panic!("unexpected view: {:?}", other),
    }
    let endpoint = h.ctx.get_all().remove(0).endpoint;
    assert_eq!(endpoint.status, EndpointStatus::Online);

    flush_until(&h, |s| !s.traffic_rows().is_empty()).await;
    let rows = h.store.traffic_rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].instance_id, "I1");
    assert_eq!(rows[0].increment.tcp_rx, 100);
    assert_eq!(rows[0].total.tcp_rx, 100);
    assert!(h.store.instance("E1", "I1").is_some());

    // Exactly one push, and nothing for the unrelated scope.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(sub.receiver.try_recv().is_err());
    assert!(other.receiver.try_recv().is_err());

    let m = h.ctx.metrics();
    assert_eq!(m.events_ingested, 1);
    assert_eq!(m.writes_dropped, 0);
    assert_eq!(m.updates_delivered, 1);

    assert!(h.ctx.shutdown(Duration::from_secs(5)).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delete_soft_deletes_and_notifies() {
    let h = harness();
    let feed = h.source.feed("E1");
    let mut sub = h.ctx.subscribe(Scope::Endpoint("E1".into()));
    h.ctx.start().await.unwrap();

    feed.send(Ok(r#"{"type":"create","instance":{"id":"I1","type":"client","tcprx":5}}"#.into()))
        .unwrap();
    next_of_kind(&mut sub.receiver, UpdateKind::Instance).await;
    flush_until(&h, |s| s.instance("E1", "I1").is_some()).await;

    feed.send(Ok(r#"{"type":"delete","instance":{"id":"I1"}}"#.into()))
        .unwrap();
    let removed = next_of_kind(&mut sub.receiver, UpdateKind::InstanceRemoved).await;
    assert_eq!(removed.data["id"], "I1");
    assert!(h.ctx.get_by_scope(&Scope::Instance("I1".into())).is_none());

    flush_until(&h, |s| {
        s.instance("E1", "I1")
            .is_some_and(|r| r.deleted_at.is_some())
    })
    .await;

    h.ctx.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_events_are_dropped_and_broken_streams_reconnect() {
    let h = harness();
    let first = h.source.feed("E1");
    let second = h.source.feed("E1");
    let mut sub = h.ctx.subscribe(Scope::Instance("I1".into()));
    h.ctx.start().await.unwrap();

    first.send(Ok("{not json".into())).unwrap();
    first
        .send(Ok(r#"{"type":"update","instance":{"id":"I1","tcprx":1}}"#.into()))
        .unwrap();
    assert_eq!(next_update(&mut sub.receiver).await.data["counters"]["tcpRx"], 1);
    drop(first);

    second
        .send(Ok(r#"{"type":"update","instance":{"id":"I1","tcprx":7}}"#.into()))
        .unwrap();
    assert_eq!(next_update(&mut sub.receiver).await.data["counters"]["tcpRx"], 7);

    let m = h.ctx.metrics();
    assert_eq!(m.events_malformed, 1);
    assert!(m.stream_breaks >= 1);
    assert!(h.source.opens() >= 2);

    h.ctx.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_flushes_pending_rows() {
    let h = harness();
    let feed = h.source.feed("E1");
    let mut sub = h.ctx.subscribe(Scope::Instance("I9".into()));
    h.ctx.start().await.unwrap();

    feed.send(Ok(r#"{"type":"log","instance":{"id":"I9"},"logs":"listening"}"#.into()))
        .unwrap();
    assert_eq!(next_update(&mut sub.receiver).await.kind, UpdateKind::Log);

    assert!(h.ctx.shutdown(Duration::from_secs(5)).await);
    assert!(h.store.logs().iter().any(|l| l.message == "listening"));
}
