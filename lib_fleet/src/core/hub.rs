//! # Broadcast Hub
//!
//! Fans state-change notifications out to dashboard clients grouped by scope.
//!
//! ## Core Design Principles:
//!
//! 1.  **Zero-Copy Fan-out**: An update is wrapped in an `Arc` once; every
//!     subscriber of every matching scope receives a clone of the pointer, not
//!     of the payload.
//!
//! 2.  **Never Block**: Each client owns a bounded outbound buffer and the hub
//!     only ever uses `try_send`. A client whose buffer is full is treated as
//!     dead and evicted on the spot (slow-consumer eviction), so one stalled
//!     browser tab can never delay delivery to anybody else.
//!
//! 3.  **Liveness**: The dispatch loop periodically queues a ping marker for
//!     every client. The session answers with a WebSocket ping and reports the
//!     pong back through [`Hub::touch`]. Clients silent for longer than the
//!     pong timeout are closed and unregistered.
//!
//! 4.  **Scope Lifecycle Hooks**: When a scope gains its first subscriber or
//!     loses its last one, the registered [`ScopeObserver`] is told, after the
//!     hub lock has been released. The monitor pool uses this to start and
//!     stop per-scope pollers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::configs::HubConfig;
use crate::errors::SyncError;
use crate::metrics::SyncMetrics;
use crate::model::{EndpointId, InstanceId, Scope};

pub type ClientId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum UpdateKind {
    /// Instance fields or counters changed.
    Instance,
    InstanceRemoved,
    EndpointStatus,
    EndpointInfo,
    Log,
    /// Point-in-time data fetched by a monitor poller.
    Poll,
}

/// The envelope pushed to dashboard clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateUpdate {
    pub kind: UpdateKind,
    pub endpoint_id: EndpointId,
    pub instance_id: Option<InstanceId>,
    pub data: serde_json::Value,
    pub ts: DateTime<Utc>,
}

impl StateUpdate {
    /// Scopes that should see this update: the endpoint, plus the instance if any.
    pub fn scopes(&self) -> Vec<Scope> {
        let mut scopes = vec![Scope::Endpoint(self.endpoint_id.clone())];
        if let Some(id) = &self.instance_id {
            scopes.push(Scope::Instance(id.clone()));
        }
        scopes
    }
}

/// Items placed in a client's outbound buffer.
#[derive(Debug, Clone)]
pub enum Outbound {
    Update(Arc<StateUpdate>),
    Ping,
}

/// Notified when a scope gains its first subscriber or loses its last one.
pub trait ScopeObserver: Send + Sync {
    fn scope_activated(&self, scope: &Scope);
    fn scope_idle(&self, scope: &Scope);
}

/// The receiving side handed to a connected client.
pub struct Subscription {
    pub id: ClientId,
    pub scope: Scope,
    pub receiver: mpsc::Receiver<Outbound>,
}

struct ClientHandle {
    sender: mpsc::Sender<Outbound>,
    last_pong: Instant,
}

#[derive(Default)]
struct Groups {
    by_scope: HashMap<Scope, HashMap<ClientId, ClientHandle>>,
    scope_of: HashMap<ClientId, Scope>,
}

impl Groups {
    /// Removes a client. Returns its scope and whether that scope became empty.
    fn remove(&mut self, id: ClientId) -> Option<(Scope, bool)> {
        let scope = self.scope_of.remove(&id)?;
        let mut emptied = false;
        if let Some(group) = self.by_scope.get_mut(&scope) {
            group.remove(&id);
            if group.is_empty() {
                self.by_scope.remove(&scope);
                emptied = true;
            }
        }
        Some((scope, emptied))
    }
}

pub struct Hub {
    groups: Mutex<Groups>,
    next_id: AtomicU64,
    config: HubConfig,
    metrics: Arc<SyncMetrics>,
    publish_tx: mpsc::Sender<StateUpdate>,
    publish_rx: Mutex<Option<mpsc::Receiver<StateUpdate>>>,
    observer: RwLock<Option<Weak<dyn ScopeObserver>>>,
}

impl Hub {
    pub fn new(config: HubConfig, metrics: Arc<SyncMetrics>) -> Self {
        let (publish_tx, publish_rx) = mpsc::channel(config.publish_queue.max(1));
        Self {
            groups: Mutex::new(Groups::default()),
            next_id: AtomicU64::new(1),
            config,
            metrics,
            publish_tx,
            publish_rx: Mutex::new(Some(publish_rx)),
            observer: RwLock::new(None),
        }
    }

    pub fn set_observer(&self, observer: Weak<dyn ScopeObserver>) {
        let mut guard = self.observer.write().unwrap_or_else(|e| e.into_inner());
        *guard = Some(observer);
    }

    fn lock(&self) -> MutexGuard<'_, Groups> {
        self.groups.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn observer(&self) -> Option<Arc<dyn ScopeObserver>> {
        let guard = self.observer.read().unwrap_or_else(|e| e.into_inner());
        guard.as_ref().and_then(Weak::upgrade)
    }

    fn notify_idle(&self, scopes: &[Scope]) {
        if scopes.is_empty() {
            return;
        }
        if let Some(obs) = self.observer() {
            for scope in scopes {
                obs.scope_idle(scope);
            }
        }
    }

    /// Adds a client to the fan-out group of `scope`.
    pub fn register(&self, scope: Scope) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.config.client_buffer.max(1));
        let first = {
            let mut groups = self.lock();
            groups.scope_of.insert(id, scope.clone());
            let group = groups.by_scope.entry(scope.clone()).or_default();
            group.insert(
                id,
                ClientHandle {
                    sender,
                    last_pong: Instant::now(),
                },
            );
            group.len() == 1
        };
        tracing::info!(client = id, %scope, "dashboard client registered");
        if first {
            if let Some(obs) = self.observer() {
                obs.scope_activated(&scope);
            }
        }
        Subscription { id, scope, receiver }
    }

    /// Removes a client and closes its send path. Safe to call more than once.
    pub fn unregister(&self, id: ClientId) -> bool {
        let removed = self.lock().remove(id);
        match removed {
            Some((scope, emptied)) => {
                tracing::info!(client = id, %scope, "dashboard client unregistered");
                if emptied {
                    self.notify_idle(&[scope]);
                }
                true
            }
            None => false,
        }
    }

    /// Records a liveness response from a client.
    pub fn touch(&self, id: ClientId) {
        let mut groups = self.lock();
        let Some(scope) = groups.scope_of.get(&id).cloned() else {
            return;
        };
        if let Some(handle) = groups.by_scope.get_mut(&scope).and_then(|g| g.get_mut(&id)) {
            handle.last_pong = Instant::now();
        }
    }

    pub fn subscriber_count(&self, scope: &Scope) -> usize {
        self.lock().by_scope.get(scope).map_or(0, |g| g.len())
    }

    pub fn client_count(&self) -> usize {
        self.lock().scope_of.len()
    }

    pub fn is_registered(&self, id: ClientId) -> bool {
        self.lock().scope_of.contains_key(&id)
    }

    /// Queues an update for the dispatch loop. Drops it if the queue is full.
    pub fn publish(&self, update: StateUpdate) -> bool {
        match self.publish_tx.try_send(update) {
            Ok(()) => true,
            Err(_) => {
                self.metrics.updates_dropped.incr();
                false
            }
        }
    }

    /// Fans an update out to every subscriber of its scopes right away.
    /// Returns how many clients received it.
    pub fn dispatch(&self, update: StateUpdate) -> usize {
        let scopes = update.scopes();
        let frame = Arc::new(update);
        let mut delivered = 0;
        let mut emptied = Vec::new();
        {
            let mut groups = self.lock();
            let mut dead = Vec::new();
            for scope in &scopes {
                let Some(group) = groups.by_scope.get(scope) else {
                    continue;
                };
                for (id, client) in group {
                    match client.sender.try_send(Outbound::Update(Arc::clone(&frame))) {
                        Ok(()) => delivered += 1,
                        Err(TrySendError::Full(_)) => {
                            let err = SyncError::SlowConsumer(*id);
                            tracing::warn!(client = id, %scope, "{}", err);
                            self.metrics.clients_evicted.incr();
                            dead.push(*id);
                        }
                        Err(TrySendError::Closed(_)) => dead.push(*id),
                    }
                }
            }
            for id in dead {
                if let Some((scope, true)) = groups.remove(id) {
                    emptied.push(scope);
                }
            }
        }
        self.metrics.updates_delivered.add(delivered as u64);
        self.notify_idle(&emptied);
        delivered
    }

    /// Queues a ping marker for every client, evicting those whose buffer is full.
    pub fn ping_all(&self) {
        let mut emptied = Vec::new();
        {
            let mut groups = self.lock();
            let mut dead = Vec::new();
            for group in groups.by_scope.values() {
                for (id, client) in group {
                    match client.sender.try_send(Outbound::Ping) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            self.metrics.clients_evicted.incr();
                            dead.push(*id);
                        }
                        Err(TrySendError::Closed(_)) => dead.push(*id),
                    }
                }
            }
            for id in dead {
                if let Some((scope, true)) = groups.remove(id) {
                    emptied.push(scope);
                }
            }
        }
        self.notify_idle(&emptied);
    }

    /// Unregisters clients that have not answered a ping within `timeout`.
    pub fn reap_stale(&self, timeout: std::time::Duration) -> Vec<ClientId> {
        let now = Instant::now();
        let mut reaped = Vec::new();
        let mut emptied = Vec::new();
        {
            let mut groups = self.lock();
            for group in groups.by_scope.values() {
                for (id, client) in group {
                    if now.duration_since(client.last_pong) > timeout {
                        reaped.push(*id);
                    }
                }
            }
            for id in &reaped {
                if let Some((scope, true)) = groups.remove(*id) {
                    emptied.push(scope);
                }
            }
        }
        if !reaped.is_empty() {
            self.metrics.clients_timed_out.add(reaped.len() as u64);
            tracing::warn!(clients = ?reaped, "closing clients that missed their liveness deadline");
        }
        self.notify_idle(&emptied);
        reaped
    }

    /// Drops every client. Their receivers see the channel close.
    pub fn close_all(&self) {
        let scopes: Vec<Scope> = {
            let mut groups = self.lock();
            groups.scope_of.clear();
            groups.by_scope.drain().map(|(scope, _)| scope).collect()
        };
        self.notify_idle(&scopes);
    }

    /// The dispatch loop: drains the publish queue and drives liveness pings.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let receiver = self
            .publish_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(mut rx) = receiver else {
            tracing::warn!("hub dispatch loop already running");
            return;
        };

        let mut ping = tokio::time::interval(self.config.ping_interval());
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ping.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("hub dispatch loop received shutdown signal");
                    break;
                }
                msg = rx.recv() => match msg {
                    Some(update) => {
                        self.dispatch(update);
                    }
                    None => break,
                },
                _ = ping.tick() => {
                    self.reap_stale(self.config.pong_timeout());
                    self.ping_all();
                }
            }
        }

        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    fn hub(client_buffer: usize) -> Hub {
        let cfg = HubConfig {
            client_buffer,
            publish_queue: 16,
            ping_interval_secs: 1,
            pong_timeout_secs: 3,
        };
        Hub::new(cfg, Arc::new(SyncMetrics::new()))
    }

    fn update(endpoint: &str, instance: Option<&str>, n: u64) -> StateUpdate {
        StateUpdate {
            kind: UpdateKind::Instance,
            endpoint_id: endpoint.into(),
            instance_id: instance.map(String::from),
            data: serde_json::json!({ "n": n }),
            ts: Utc::now(),
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: StdMutex<Vec<String>>,
    }

    impl ScopeObserver for Recorder {
        fn scope_activated(&self, scope: &Scope) {
            self.events.lock().unwrap().push(format!("up {}", scope));
        }
        fn scope_idle(&self, scope: &Scope) {
            self.events.lock().unwrap().push(format!("down {}", scope));
        }
    }

    #[tokio::test]
    async fn updates_reach_instance_and_parent_endpoint_scopes() {
        let hub = hub(8);
        let mut inst = hub.register(Scope::Instance("i1".into()));
        let mut ep = hub.register(Scope::Endpoint("e1".into()));
        let mut other = hub.register(Scope::Instance("i2".into()));

        assert_eq!(hub.dispatch(update("e1", Some("i1"), 1)), 2);

        assert!(matches!(inst.receiver.try_recv(), Ok(Outbound::Update(_))));
        assert!(matches!(ep.receiver.try_recv(), Ok(Outbound::Update(_))));
        assert!(other.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn slow_consumer_is_evicted_without_affecting_others() {
        let hub = hub(2);
        let stalled = hub.register(Scope::Instance("i1".into()));
        let mut healthy = hub.register(Scope::Instance("i1".into()));
        let mut elsewhere = hub.register(Scope::Endpoint("e1".into()));

        for n in 0..5 {
            hub.dispatch(update("e1", Some("i1"), n));
            while let Ok(_) = healthy.receiver.try_recv() {}
            while let Ok(_) = elsewhere.receiver.try_recv() {}
        }

        assert!(!hub.is_registered(stalled.id));
        assert!(hub.is_registered(healthy.id));
        assert!(hub.is_registered(elsewhere.id));
        assert_eq!(hub.metrics.clients_evicted.get(), 1);
        assert_eq!(hub.subscriber_count(&Scope::Instance("i1".into())), 1);
    }

    #[tokio::test]
    async fn evicted_client_sees_closed_channel_after_buffered_items() {
        let hub = hub(1);
        let mut sub = hub.register(Scope::Endpoint("e1".into()));
        hub.dispatch(update("e1", None, 1));
        hub.dispatch(update("e1", None, 2));
        assert!(matches!(sub.receiver.recv().await, Some(Outbound::Update(_))));
        assert!(sub.receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn observer_sees_first_and_last_subscriber() {
        let hub = hub(4);
        let rec: Arc<Recorder> = Arc::new(Recorder::default());
        let obs: Arc<dyn ScopeObserver> = rec.clone();
        hub.set_observer(Arc::downgrade(&obs));

        let a = hub.register(Scope::Instance("i1".into()));
        let b = hub.register(Scope::Instance("i1".into()));
        hub.unregister(a.id);
        hub.unregister(b.id);
        assert!(!hub.unregister(b.id));

        let events = rec.events.lock().unwrap().clone();
        assert_eq!(events, vec!["up instance:i1", "down instance:i1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_clients_are_reaped() {
        let hub = hub(8);
        let quiet = hub.register(Scope::Endpoint("e1".into()));
        let chatty = hub.register(Scope::Endpoint("e1".into()));

        tokio::time::advance(Duration::from_secs(2)).await;
        hub.touch(chatty.id);
        tokio::time::advance(Duration::from_secs(2)).await;

        let reaped = hub.reap_stale(Duration::from_secs(3));
        assert_eq!(reaped, vec![quiet.id]);
        assert!(hub.is_registered(chatty.id));
    }

    #[tokio::test]
    async fn dispatch_loop_delivers_published_updates() {
        let hub = Arc::new(hub(8));
        let mut sub = hub.register(Scope::Instance("i1".into()));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&hub).run(cancel.clone()));

        assert!(hub.publish(update("e1", Some("i1"), 7)));
        match tokio::time::timeout(Duration::from_secs(1), sub.receiver.recv()).await {
            Ok(Some(Outbound::Update(u))) => assert_eq!(u.data["n"], 7),
            other => panic!("expected an update, got {:?}", other.map(|o| o.is_some())),
        }

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(hub.client_count(), 0);
    }
}
