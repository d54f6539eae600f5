//! # Stream Ingestion Manager
//!
//! Keeps exactly one live event connection per registered endpoint.
//!
//! ```text
//!   Idle ──connect──▶ Connecting ──▶ Connected ──▶ Disconnected ─┐
//!    ▲                    │                                      │
//!    │                    └────────▶ Failed ─────────────────────┤
//!    │                                                           ▼
//!    └──────── manual disconnect ◀──────────────────────── Connecting (auto)
//! ```
//!
//! * A worker task owns the connection of one endpoint. Starting a new worker
//!   first waits for the previous one to finish, so two connections to the
//!   same endpoint never overlap.
//! * After a failure the next attempt is scheduled at
//!   `last_attempt + min(base * 2^attempts, max)`. `attempts` goes back to
//!   zero only when a connection is established.
//! * A manual disconnect sets a flag that keeps the worker stopped until an
//!   operator calls `connect` again. Transient failures never set it.
//! * A payload that fails to decode is logged, counted and dropped; the
//!   connection stays up.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::configs::IngestionConfig;
use crate::core::router::EventRouter;
use crate::core::supervisor::Supervisor;
use crate::errors::SyncError;
use crate::ingestors::source::{EventSource, EventStream};
use crate::ingestors::sse::normalize;
use crate::metrics::SyncMetrics;
use crate::model::{Endpoint, EndpointId, EndpointStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

/// Connection bookkeeping of one endpoint, as exposed to operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub endpoint_id: EndpointId,
    pub state: ConnectionState,
    pub attempts: u32,
    pub manual_stop: bool,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Link {
    state: ConnectionState,
    attempts: u32,
    manual_stop: bool,
    last_attempt: Option<Instant>,
    last_attempt_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    worker: Option<Worker>,
    /// A stopped worker that may still be unwinding.
    retiring: Option<JoinHandle<()>>,
}

enum StreamEnd {
    Cancelled,
    Closed,
    Broken(SyncError),
}

/// Delay before reconnect attempt number `attempts`.
pub fn backoff(config: &IngestionConfig, attempts: u32) -> Duration {
    let factor = 1u64 << attempts.min(20);
    Duration::from_millis(
        config
            .reconnect_base_ms
            .saturating_mul(factor)
            .min(config.reconnect_max_ms),
    )
}

pub struct IngestionManager {
    links: Mutex<HashMap<EndpointId, Link>>,
    router: Arc<EventRouter>,
    source: Arc<dyn EventSource>,
    supervisor: Supervisor,
    config: IngestionConfig,
    metrics: Arc<SyncMetrics>,
}

impl IngestionManager {
    pub fn new(
        config: IngestionConfig,
        router: Arc<EventRouter>,
        source: Arc<dyn EventSource>,
        supervisor: Supervisor,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        Self {
            links: Mutex::new(HashMap::new()),
            router,
            source,
            supervisor,
            config,
            metrics,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<EndpointId, Link>> {
        self.links.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_link<R>(&self, endpoint_id: &str, f: impl FnOnce(&mut Link) -> R) -> Option<R> {
        self.lock().get_mut(endpoint_id).map(f)
    }

    /// Adds an endpoint to the store and the connection table.
    pub fn register_endpoint(self: &Arc<Self>, endpoint: Endpoint, connect: bool) -> Result<(), SyncError> {
        let id = endpoint.id.clone();
        if self.router.store().register_endpoint(endpoint) {
            tracing::info!(endpoint = %id, "endpoint registered");
        }
        self.lock().entry(id.clone()).or_default();
        if connect {
            self.connect(&id)?;
        }
        Ok(())
    }

    /// Stops the connection and forgets the endpoint.
    pub fn remove_endpoint(&self, endpoint_id: &str) -> Option<Endpoint> {
        if let Some(link) = self.lock().remove(endpoint_id) {
            if let Some(worker) = link.worker {
                worker.cancel.cancel();
            }
        }
        let removed = self.router.store().remove_endpoint(endpoint_id);
        if removed.is_some() {
            tracing::info!(endpoint = endpoint_id, "endpoint removed");
        }
        removed
    }

    /// Starts (or keeps) the live connection of an endpoint. Clears a manual stop.
    /// Returns immediately; the connection is made in the background.
    pub fn connect(self: &Arc<Self>, endpoint_id: &str) -> Result<(), SyncError> {
        if self.router.store().get_endpoint(endpoint_id).is_none() {
            return Err(SyncError::UnknownEndpoint(endpoint_id.to_string()));
        }

        let mut links = self.lock();
        let link = links.entry(endpoint_id.to_string()).or_default();
        link.manual_stop = false;
        if link.worker.as_ref().is_some_and(|w| !w.handle.is_finished()) {
            return Ok(());
        }

        let previous = link.retiring.take();
        let cancel = self.supervisor.child_token();
        let manager = Arc::clone(self);
        let id = endpoint_id.to_string();
        let token = cancel.clone();
        let handle = self.supervisor.spawn("ingestion-worker", async move {
            if let Some(prev) = previous {
                let _ = prev.await;
            }
            manager.run_link(id, token).await;
        });
        link.worker = Some(Worker { cancel, handle });
        link.state = ConnectionState::Connecting;
        tracing::info!(endpoint = endpoint_id, "connect requested");
        Ok(())
    }

    /// Stops the live connection. With `manual`, auto-reconnect stays off until
    /// the next `connect`. Calling it again is harmless.
    pub fn disconnect(&self, endpoint_id: &str, manual: bool) -> Result<(), SyncError> {
        if self.router.store().get_endpoint(endpoint_id).is_none() {
            return Err(SyncError::UnknownEndpoint(endpoint_id.to_string()));
        }
        {
            let mut links = self.lock();
            let link = links.entry(endpoint_id.to_string()).or_default();
            if manual {
                link.manual_stop = true;
            }
            if let Some(worker) = link.worker.take() {
                worker.cancel.cancel();
                link.retiring = Some(worker.handle);
                tracing::info!(endpoint = endpoint_id, manual, "disconnected");
            }
            link.state = ConnectionState::Idle;
        }
        let status = if manual {
            EndpointStatus::Disconnected
        } else {
            EndpointStatus::Offline
        };
        self.router.set_status(endpoint_id, status);
        Ok(())
    }

    /// Connects every known endpoint that was not stopped by an operator.
    pub fn connect_all(self: &Arc<Self>) {
        for id in self.router.store().endpoint_ids() {
            let manual = self.with_link(&id, |l| l.manual_stop).unwrap_or(false);
            if manual {
                continue;
            }
            if let Err(e) = self.connect(&id) {
                tracing::warn!(endpoint = %id, "cannot connect: {}", e);
            }
        }
    }

    pub fn status(&self, endpoint_id: &str) -> Option<ConnectionStatus> {
        self.lock()
            .get(endpoint_id)
            .map(|link| Self::status_of(endpoint_id, link))
    }

    pub fn statuses(&self) -> Vec<ConnectionStatus> {
        let mut all: Vec<ConnectionStatus> = self
            .lock()
            .iter()
            .map(|(id, link)| Self::status_of(id, link))
            .collect();
        all.sort_by(|a, b| a.endpoint_id.cmp(&b.endpoint_id));
        all
    }

    fn status_of(endpoint_id: &str, link: &Link) -> ConnectionStatus {
        ConnectionStatus {
            endpoint_id: endpoint_id.to_string(),
            state: link.state,
            attempts: link.attempts,
            manual_stop: link.manual_stop,
            last_attempt: link.last_attempt_at,
            last_error: link.last_error.clone(),
        }
    }

    /// How long to wait before the next attempt, based on the last one.
    fn pending_delay(&self, endpoint_id: &str) -> Duration {
        self.with_link(endpoint_id, |link| match link.last_attempt {
            None => Duration::ZERO,
            Some(last) => {
                let due = last + backoff(&self.config, link.attempts);
                due.saturating_duration_since(Instant::now())
            }
        })
        .unwrap_or(Duration::ZERO)
    }

    /// Records a transition the worker observed, unless the worker has been
    /// stopped in the meantime. `disconnect` cancels under the same lock, so a
    /// stale worker can never overwrite the status it set.
    fn transition(
        &self,
        endpoint_id: &str,
        cancel: &CancellationToken,
        status: EndpointStatus,
        f: impl FnOnce(&mut Link),
    ) -> bool {
        let mut links = self.lock();
        let Some(link) = links.get_mut(endpoint_id) else {
            return false;
        };
        if cancel.is_cancelled() || link.manual_stop {
            return false;
        }
        f(link);
        self.router.set_status(endpoint_id, status);
        true
    }

    async fn run_link(self: Arc<Self>, endpoint_id: EndpointId, cancel: CancellationToken) {
        loop {
            let delay = self.pending_delay(&endpoint_id);
            if !delay.is_zero() {
                tracing::debug!(endpoint = %endpoint_id, ?delay, "waiting before reconnect");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            if cancel.is_cancelled() {
                break;
            }

            let Some(endpoint) = self.router.store().get_endpoint(&endpoint_id) else {
                break;
            };
            self.with_link(&endpoint_id, |link| {
                link.state = ConnectionState::Connecting;
                link.last_attempt = Some(Instant::now());
                link.last_attempt_at = Some(Utc::now());
            });
            self.metrics.connect_attempts.incr();

            let timeout = Duration::from_secs(self.config.connect_timeout_secs.max(1));
            let opened = tokio::select! {
                _ = cancel.cancelled() => break,
                r = tokio::time::timeout(timeout, self.source.open(&endpoint)) => match r {
                    Ok(res) => res,
                    Err(_) => Err(SyncError::TransientNetwork(format!("connect timed out after {:?}", timeout))),
                },
            };

            match opened {
                Ok(stream) => {
                    let live = self.transition(&endpoint_id, &cancel, EndpointStatus::Online, |link| {
                        link.state = ConnectionState::Connected;
                        link.attempts = 0;
                        link.last_error = None;
                    });
                    if !live {
                        break;
                    }
                    tracing::info!(endpoint = %endpoint_id, "event stream connected");

                    let end = self.pump(&endpoint_id, stream, &cancel).await;
                    let reason = match end {
                        StreamEnd::Cancelled => break,
                        StreamEnd::Closed => None,
                        StreamEnd::Broken(e) => Some(e.to_string()),
                    };
                    self.metrics.stream_breaks.incr();
                    tracing::warn!(endpoint = %endpoint_id, reason = ?reason, "event stream ended");
                    let live = self.transition(&endpoint_id, &cancel, EndpointStatus::Offline, |link| {
                        link.state = ConnectionState::Disconnected;
                        link.last_error = reason;
                    });
                    if !live {
                        break;
                    }
                }
                Err(e) => {
                    self.metrics.connect_failures.incr();
                    let mut attempts = 0;
                    let live = self.transition(&endpoint_id, &cancel, EndpointStatus::Fail, |link| {
                        link.state = ConnectionState::Failed;
                        link.attempts = link.attempts.saturating_add(1);
                        link.last_error = Some(e.to_string());
                        attempts = link.attempts;
                    });
                    if !live {
                        break;
                    }
                    tracing::warn!(
                        endpoint = %endpoint_id,
                        attempts,
                        retry_in = ?backoff(&self.config, attempts),
                        "connect failed: {}",
                        e
                    );
                }
            }
        }
        tracing::debug!(endpoint = %endpoint_id, "ingestion worker stopped");
    }

    async fn pump(&self, endpoint_id: &EndpointId, mut stream: EventStream, cancel: &CancellationToken) -> StreamEnd {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return StreamEnd::Cancelled,
                item = stream.next() => match item {
                    None => return StreamEnd::Closed,
                    Some(Err(e)) => return StreamEnd::Broken(e),
                    Some(Ok(data)) => self.handle_payload(endpoint_id, &data),
                },
            }
        }
    }

    fn handle_payload(&self, endpoint_id: &EndpointId, data: &str) {
        let event = match normalize(endpoint_id, data) {
            Ok(event) => event,
            Err(e) => {
                self.metrics.events_malformed.incr();
                tracing::warn!(endpoint = %endpoint_id, "dropping event: {}", e);
                return;
            }
        };
        self.metrics.events_ingested.incr();
        if let Err(e) = self.router.route(event) {
            tracing::warn!(endpoint = %endpoint_id, "event not applied: {}", e);
        }
    }
}
