//! # Engine Context
//!
//! [`SyncContext`] owns every component of the engine and wires them together
//! explicitly. Nothing in the crate is a global: a process can run several
//! contexts side by side, and tests build one per case.
//!
//! Lifecycle:
//!
//! 1. [`SyncContext::initialize`] validates the configuration and constructs
//!    the components. No task is spawned yet.
//! 2. [`SyncContext::start`] spawns the hub, the writer pool, the per-endpoint
//!    stream workers, the startup cleanup and the cron jobs.
//! 3. [`SyncContext::shutdown`] cancels everything, waits (bounded) for the
//!    tasks to stop and performs a last flush.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::configs::config_sync::{EndpointConfig, SyncConfig};
use crate::core::{
    ClientId, EndpointView, EventRouter, Hub, MonitorRegistry, PointInTimeSource, ScopeObserver,
    ScopeView, StateStore, Subscription, Supervisor,
};
use crate::errors::SyncError;
use crate::ingestors::{ConnectionStatus, EventSource, IngestionManager, SseEventSource};
use crate::metrics::{MetricsSnapshot, SyncMetrics};
use crate::model::{Endpoint, Scope};
use crate::persistence::{open_store, BatchWriter, DurableStore, FlushReport};
use crate::retention::{CleanupScheduler, RunReport};
use crate::retrieve::HttpEndpointApi;

pub struct SyncContext {
    config: SyncConfig,
    supervisor: Supervisor,
    metrics: Arc<SyncMetrics>,
    state: Arc<StateStore>,
    hub: Arc<Hub>,
    writer: Arc<BatchWriter>,
    router: Arc<EventRouter>,
    monitors: Arc<MonitorRegistry>,
    ingestion: Arc<IngestionManager>,
    cleanup: Arc<CleanupScheduler>,
    started: AtomicBool,
}

impl SyncContext {
    /// Builds a context on explicit transports and storage.
    pub fn initialize(
        config: SyncConfig,
        store: Arc<dyn DurableStore>,
        source: Arc<dyn EventSource>,
        api: Arc<dyn PointInTimeSource>,
    ) -> Result<Self, SyncError> {
        config.validate()?;

        let supervisor = Supervisor::new();
        let metrics = Arc::new(SyncMetrics::new());
        let state = Arc::new(StateStore::new(config.state.shards));
        let hub = Arc::new(Hub::new(config.hub.clone(), Arc::clone(&metrics)));
        let writer = Arc::new(BatchWriter::new(
            config.writer.clone(),
            Arc::clone(&store),
            Arc::clone(&state),
            Arc::clone(&metrics),
        ));
        let router = Arc::new(EventRouter::new(
            Arc::clone(&state),
            Arc::clone(&writer),
            Arc::clone(&hub),
        ));

        let monitors = Arc::new(MonitorRegistry::new(
            Arc::clone(&router),
            api,
            supervisor.clone(),
            Arc::clone(&metrics),
            Duration::from_secs(config.monitor.poll_interval_secs),
            Duration::from_secs(config.monitor.grace_secs),
        ));
        let observer: Arc<dyn ScopeObserver> = monitors.clone();
        hub.set_observer(Arc::downgrade(&observer));

        let ingestion = Arc::new(IngestionManager::new(
            config.ingestion.clone(),
            Arc::clone(&router),
            source,
            supervisor.clone(),
            Arc::clone(&metrics),
        ));
        let cleanup = Arc::new(CleanupScheduler::new(
            store,
            config.retention.clone(),
            Arc::clone(&metrics),
            supervisor.child_token(),
        ));

        for ep in &config.endpoints {
            ingestion.register_endpoint(ep.to_endpoint(), false)?;
        }

        info!(
            "Sync context initialized with {} endpoints, {} state shards",
            config.endpoints.len(),
            config.state.shards
        );

        Ok(Self {
            config,
            supervisor,
            metrics,
            state,
            hub,
            writer,
            router,
            monitors,
            ingestion,
            cleanup,
            started: AtomicBool::new(false),
        })
    }

    /// Builds a context on the production transports: SSE for live events,
    /// the endpoint REST API for polling, and the configured durable store.
    pub async fn bootstrap(config: SyncConfig) -> Result<Self, SyncError> {
        config.validate()?;
        let store = open_store(&config.store).await?;
        let connect_timeout = Duration::from_secs(config.ingestion.connect_timeout_secs);
        let source = Arc::new(SseEventSource::new(
            connect_timeout,
            config.ingestion.events_path.clone(),
            config.ingestion.max_frame_bytes,
        )?);
        let api = Arc::new(HttpEndpointApi::new(connect_timeout));
        info!("Durable store: {}", store.name());
        Self::initialize(config, store, source, api)
    }

    /// Spawns every background loop. Enabled endpoints start connecting.
    /// Calling it twice is an error.
    pub async fn start(&self) -> Result<(), SyncError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SyncError::Configuration("sync context already started".into()));
        }

        let hub = Arc::clone(&self.hub);
        let cancel = self.supervisor.token();
        self.supervisor.spawn("broadcast-hub", hub.run(cancel));

        self.writer.start(&self.supervisor);

        for ep in &self.config.endpoints {
            if ep.enabled {
                self.ingestion.connect(&ep.id)?;
            } else {
                info!("Endpoint {} is disabled, not connecting", ep.id);
            }
        }

        let cleanup = Arc::clone(&self.cleanup);
        self.supervisor.spawn("startup-cleanup", async move {
            if let Some(run) = cleanup.run_startup().await {
                info!(
                    "Startup cleanup removed {} rows ({} strategies failed)",
                    run.total_deleted,
                    run.failed().count()
                );
            }
        });
        self.cleanup.start(&self.supervisor).await?;

        info!("Sync context started");
        Ok(())
    }

    /// Stops every loop within `limit`, then flushes what is left.
    /// Returns false if some task outlived the limit or the last flush failed.
    pub async fn shutdown(&self, limit: Duration) -> bool {
        info!("Sync context shutting down");
        let mut clean = self.supervisor.shutdown(limit).await;
        self.cleanup.stop().await;
        match self.writer.flush_now().await {
            Ok(report) => info!(
                "Final flush wrote {} rows ({} status rows)",
                report.rows, report.status_rows
            ),
            Err(e) => {
                error!("Final flush failed: {}", e);
                clean = false;
            }
        }
        clean
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.router
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn monitors(&self) -> &Arc<MonitorRegistry> {
        &self.monitors
    }

    // --- Dashboard access ---

    /// Registers a dashboard client on one scope.
    pub fn subscribe(&self, scope: Scope) -> Subscription {
        self.hub.register(scope)
    }

    pub fn unsubscribe(&self, id: ClientId) -> bool {
        self.hub.unregister(id)
    }

    /// Records liveness of a client (a pong or any inbound frame).
    pub fn touch(&self, id: ClientId) {
        self.hub.touch(id)
    }

    pub fn get_all(&self) -> Vec<EndpointView> {
        self.state.get_all()
    }

    pub fn get_by_scope(&self, scope: &Scope) -> Option<ScopeView> {
        self.state.get_by_scope(scope)
    }

    // --- Operator actions ---

    pub fn connect(&self, endpoint_id: &str) -> Result<(), SyncError> {
        self.ingestion.connect(endpoint_id)
    }

    /// Stops an endpoint's stream. A manual disconnect survives reconnect sweeps.
    pub fn disconnect(&self, endpoint_id: &str, manual: bool) -> Result<(), SyncError> {
        self.ingestion.disconnect(endpoint_id, manual)
    }

    /// Adds an endpoint at runtime, connecting it if enabled and the context runs.
    pub fn register_endpoint(&self, endpoint: &EndpointConfig) -> Result<(), SyncError> {
        let connect = endpoint.enabled && self.started.load(Ordering::SeqCst);
        self.ingestion.register_endpoint(endpoint.to_endpoint(), connect)
    }

    /// Stops and forgets an endpoint, then removes its durable row. Child rows
    /// are left for the orphan cleanup.
    pub async fn remove_endpoint(&self, endpoint_id: &str) -> Result<Endpoint, SyncError> {
        let removed = self
            .ingestion
            .remove_endpoint(endpoint_id)
            .ok_or_else(|| SyncError::UnknownEndpoint(endpoint_id.to_string()))?;
        if let Err(e) = self.writer.delete_endpoint(endpoint_id).await {
            warn!("Endpoint {} removed from memory but not from storage: {}", endpoint_id, e);
            return Err(e);
        }
        Ok(removed)
    }

    pub fn connection_status(&self, endpoint_id: &str) -> Option<ConnectionStatus> {
        self.ingestion.status(endpoint_id)
    }

    pub fn connection_statuses(&self) -> Vec<ConnectionStatus> {
        self.ingestion.statuses()
    }

    // --- Persistence and retention ---

    /// Drains the write queue and flushes immediately.
    pub async fn flush(&self) -> Result<FlushReport, SyncError> {
        self.writer.flush_now().await
    }

    /// Runs every cleanup strategy now. `None` if a run is already in progress.
    pub async fn run_cleanup(&self) -> Option<RunReport> {
        self.cleanup.run_all().await
    }

    /// Counters plus the persistence queue gauges.
    pub fn metrics(&self) -> MetricsSnapshot {
        let mut snapshot = self.metrics.snapshot();
        snapshot.write_queue_depth = self.writer.queue_depth() as u64;
        snapshot.write_queue_capacity = self.writer.capacity() as u64;
        snapshot
    }
}
