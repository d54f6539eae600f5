//! # Monitor Registry
//!
//! Starts and stops per-scope poll loops as dashboard clients come and go.
//!
//! A scope's poller starts when the hub reports its first subscriber. When the
//! last subscriber leaves, a linger task waits for the grace period before
//! stopping the poller, so a quick page reload does not tear the loop down
//! and immediately rebuild it. A subscriber arriving during the grace period
//! cancels the linger and keeps the existing poller.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::{sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::core::hub::ScopeObserver;
use crate::core::router::EventRouter;
use crate::core::supervisor::Supervisor;
use crate::errors::SyncError;
use crate::metrics::SyncMetrics;
use crate::model::{
    CanonicalEvent, Endpoint, EndpointInfo, EventKind, EventOrigin, EventPayload, FieldUpdate,
    InstanceSample, Scope,
};

/// Point-in-time queries against a remote endpoint.
#[async_trait]
pub trait PointInTimeSource: Send + Sync {
    async fn endpoint_info(&self, endpoint: &Endpoint) -> Result<EndpointInfo, SyncError>;
    async fn instance_sample(
        &self,
        endpoint: &Endpoint,
        instance_id: &str,
    ) -> Result<InstanceSample, SyncError>;
}

struct Slot {
    poller: CancellationToken,
    linger: Option<CancellationToken>,
}

pub struct MonitorRegistry {
    slots: Arc<Mutex<HashMap<Scope, Slot>>>,
    router: Arc<EventRouter>,
    source: Arc<dyn PointInTimeSource>,
    supervisor: Supervisor,
    metrics: Arc<SyncMetrics>,
    poll_interval: Duration,
    grace: Duration,
}

impl MonitorRegistry {
    pub fn new(
        router: Arc<EventRouter>,
        source: Arc<dyn PointInTimeSource>,
        supervisor: Supervisor,
        metrics: Arc<SyncMetrics>,
        poll_interval: Duration,
        grace: Duration,
    ) -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            router,
            source,
            supervisor,
            metrics,
            poll_interval,
            grace,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Scope, Slot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Scopes with a running poller, lingering ones included.
    pub fn active_scopes(&self) -> Vec<Scope> {
        let mut scopes: Vec<Scope> = self.lock().keys().cloned().collect();
        scopes.sort();
        scopes
    }

    pub fn is_lingering(&self, scope: &Scope) -> bool {
        self.lock().get(scope).is_some_and(|s| s.linger.is_some())
    }

    fn spawn_poller(&self, scope: Scope, cancel: CancellationToken) {
        let router = Arc::clone(&self.router);
        let source = Arc::clone(&self.source);
        let metrics = Arc::clone(&self.metrics);
        let every = self.poll_interval;
        self.supervisor.spawn("monitor-poller", async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match poll_once(&router, source.as_ref(), &scope).await {
                            Ok(()) => metrics.polls.incr(),
                            Err(e) => {
                                metrics.poll_errors.incr();
                                tracing::warn!(%scope, "monitor poll failed: {}", e);
                            }
                        }
                    }
                }
            }
            tracing::debug!(%scope, "monitor poller stopped");
        });
    }

    fn spawn_linger(&self, scope: Scope, linger: CancellationToken) {
        let slots = Arc::clone(&self.slots);
        let grace = self.grace;
        self.supervisor.spawn("monitor-linger", async move {
            tokio::select! {
                _ = linger.cancelled() => {
                    tracing::debug!(%scope, "linger cancelled");
                }
                _ = sleep(grace) => {
                    let mut lock = slots.lock().unwrap_or_else(|e| e.into_inner());
                    // A subscriber may have returned just as the timer fired
                    if linger.is_cancelled() {
                        return;
                    }
                    if let Some(slot) = lock.remove(&scope) {
                        slot.poller.cancel();
                        tracing::info!(%scope, "linger expired, monitor stopped");
                    }
                }
            }
        });
    }
}

impl ScopeObserver for MonitorRegistry {
    fn scope_activated(&self, scope: &Scope) {
        let mut slots = self.lock();
        if let Some(slot) = slots.get_mut(scope) {
            if let Some(linger) = slot.linger.take() {
                linger.cancel();
            }
            return;
        }
        let poller = self.supervisor.child_token();
        slots.insert(
            scope.clone(),
            Slot {
                poller: poller.clone(),
                linger: None,
            },
        );
        drop(slots);
        tracing::info!(%scope, "monitor started");
        self.spawn_poller(scope.clone(), poller);
    }

    fn scope_idle(&self, scope: &Scope) {
        let mut slots = self.lock();
        let Some(slot) = slots.get_mut(scope) else {
            return;
        };
        if slot.linger.is_some() {
            return;
        }
        let linger = self.supervisor.child_token();
        slot.linger = Some(linger.clone());
        drop(slots);
        self.spawn_linger(scope.clone(), linger);
    }
}

/// One poll of a scope: fetch, fold into the store, publish.
pub async fn poll_once(
    router: &EventRouter,
    source: &dyn PointInTimeSource,
    scope: &Scope,
) -> Result<(), SyncError> {
    let store = router.store();
    match scope {
        Scope::Endpoint(id) => {
            let endpoint = store
                .get_endpoint(id)
                .ok_or_else(|| SyncError::UnknownEndpoint(id.clone()))?;
            let info = source.endpoint_info(&endpoint).await?;
            router.apply(FieldUpdate::EndpointInfo {
                endpoint_id: id.clone(),
                info,
            })
        }
        Scope::Instance(id) => {
            let instance = store
                .find_instance(id)
                .ok_or_else(|| SyncError::UnknownInstance(id.clone()))?;
            let endpoint = store
                .get_endpoint(&instance.endpoint_id)
                .ok_or_else(|| SyncError::UnknownEndpoint(instance.endpoint_id.clone()))?;
            let sample = source.instance_sample(&endpoint, id).await?;
            router.route(CanonicalEvent {
                kind: EventKind::Update,
                origin: EventOrigin::Poll,
                endpoint_id: endpoint.id,
                instance_id: Some(id.clone()),
                payload: EventPayload::Instance(sample),
                timestamp: Utc::now(),
            })?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::{HubConfig, WriterConfig};
    use crate::core::hub::Hub;
    use crate::core::state_store::StateStore;
    use crate::model::TrafficCounters;
    use crate::persistence::memory::MemoryStore;
    use crate::persistence::writer::BatchWriter;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct FakeApi {
        calls: AtomicU64,
    }

    #[async_trait]
    impl PointInTimeSource for FakeApi {
        async fn endpoint_info(&self, _: &Endpoint) -> Result<EndpointInfo, SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(EndpointInfo {
                version: Some("1.4.0".into()),
                ..Default::default()
            })
        }

        async fn instance_sample(&self, _: &Endpoint, _: &str) -> Result<InstanceSample, SyncError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(InstanceSample {
                counters: Some(TrafficCounters { tcp_rx: n * 10, ..Default::default() }),
                ping: Some(8),
                ..Default::default()
            })
        }
    }

    fn registry(api: Arc<FakeApi>) -> (Arc<MonitorRegistry>, Arc<EventRouter>, Supervisor) {
        let metrics = Arc::new(SyncMetrics::new());
        let store = Arc::new(StateStore::new(2));
        store.register_endpoint(Endpoint::new("e1", "http://h/api", "k"));
        let writer = Arc::new(BatchWriter::new(
            WriterConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::clone(&store),
            Arc::clone(&metrics),
        ));
        let hub = Arc::new(Hub::new(HubConfig::default(), Arc::clone(&metrics)));
        let router = Arc::new(EventRouter::new(store, writer, hub));
        let sup = Supervisor::new();
        let reg = Arc::new(MonitorRegistry::new(
            Arc::clone(&router),
            api,
            sup.clone(),
            metrics,
            Duration::from_secs(1),
            Duration::from_secs(10),
        ));
        (reg, router, sup)
    }

    #[tokio::test(start_paused = true)]
    async fn poller_runs_while_scope_is_watched() {
        let api = Arc::new(FakeApi::default());
        let (reg, router, _sup) = registry(Arc::clone(&api));
        let scope = Scope::Endpoint("e1".into());

        reg.scope_activated(&scope);
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert!(api.calls.load(Ordering::SeqCst) >= 3);
        let info = router.store().get_endpoint("e1").unwrap().info.unwrap();
        assert_eq!(info.version.as_deref(), Some("1.4.0"));
    }

    #[tokio::test(start_paused = true)]
    async fn linger_stops_poller_after_grace() {
        let api = Arc::new(FakeApi::default());
        let (reg, _router, _sup) = registry(Arc::clone(&api));
        let scope = Scope::Endpoint("e1".into());

        reg.scope_activated(&scope);
        tokio::time::sleep(Duration::from_millis(10)).await;
        reg.scope_idle(&scope);
        assert!(reg.is_lingering(&scope));

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(reg.active_scopes().is_empty());
        let after = api.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(api.calls.load(Ordering::SeqCst), after);
    }

    #[tokio::test(start_paused = true)]
    async fn returning_subscriber_cancels_linger() {
        let api = Arc::new(FakeApi::default());
        let (reg, _router, _sup) = registry(api);
        let scope = Scope::Endpoint("e1".into());

        reg.scope_activated(&scope);
        reg.scope_idle(&scope);
        tokio::time::sleep(Duration::from_secs(5)).await;
        reg.scope_activated(&scope);
        assert!(!reg.is_lingering(&scope));

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(reg.active_scopes(), vec![scope]);
    }

    #[tokio::test]
    async fn instance_poll_routes_a_sample() {
        let api = Arc::new(FakeApi::default());
        let (_reg, router, _sup) = registry(Arc::clone(&api));
        // The endpoint clock is well ahead of ours.
        let remote = Utc::now() + chrono::Duration::minutes(10);
        router
            .route(CanonicalEvent {
                kind: EventKind::Create,
                origin: EventOrigin::Stream,
                endpoint_id: "e1".into(),
                instance_id: Some("i1".into()),
                payload: EventPayload::Instance(InstanceSample::default()),
                timestamp: remote,
            })
            .unwrap();

        poll_once(&router, api.as_ref(), &Scope::Instance("i1".into())).await.unwrap();
        let inst = router.store().get_instance("e1", "i1").unwrap();
        assert_eq!(inst.counters.tcp_rx, 10);
        assert_eq!(inst.ping, Some(8));
        assert_eq!(inst.sampled_at, Some(remote));
        assert!(inst.polled_at.is_some());

        let err = poll_once(&router, api.as_ref(), &Scope::Instance("nope".into())).await;
        assert!(matches!(err, Err(SyncError::UnknownInstance(_))));
    }
}
