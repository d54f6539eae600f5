//! # Batch Persistence Writer
//!
//! Decouples ingestion from the durable store.
//!
//! ```text
//!  route() ──try_send──▶ [ queue k ] ──▶ worker k (k = hash of instance) ──▶ accumulator
//!                                                               │
//!                      size threshold or flush timer ◀──────────┘
//!                                  │
//!                                  ▼
//!                 accumulator + dirty status rows ──▶ DurableStore
//! ```
//!
//! * Every worker owns one bounded queue. Writes are routed by (endpoint,
//!   instance), so one instance is always handled by the same worker, in order.
//! * Enqueue never waits. When the target queue is full the event is dropped
//!   and `writes_dropped` goes up.
//! * Writes of the same (endpoint, instance, bucket) key are merged before
//!   they reach the store.
//! * A failed flush is logged and counted. It is not retried; the dirty
//!   markers it would have cleared stay set, so the next flush carries the
//!   status rows again.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::configs::WriterConfig;
use crate::core::state_store::StateStore;
use crate::core::supervisor::Supervisor;
use crate::errors::SyncError;
use crate::metrics::SyncMetrics;
use crate::model::{CanonicalEvent, EndpointId, EventKind, EventPayload, InstanceId, TrafficCounters};
use crate::persistence::store::{
    DurableStore, EventRow, LogRow, MonitorSampleRow, SoftDelete, TrafficRow, WriteBatch,
};

/// One applied event on its way to the durable store.
#[derive(Debug, Clone)]
pub struct PendingWrite {
    pub event: CanonicalEvent,
    /// Counter increase the event contributed.
    pub delta: TrafficCounters,
    /// Absolute counters of the instance after the event.
    pub totals: Option<TrafficCounters>,
}

/// Start of the time bucket `ts` falls into.
pub fn bucket_start(ts: DateTime<Utc>, bucket_secs: u64) -> DateTime<Utc> {
    let width = bucket_secs.max(1) as i64;
    let secs = ts.timestamp();
    DateTime::<Utc>::from_timestamp(secs - secs.rem_euclid(width), 0).unwrap_or(ts)
}

#[derive(Default)]
struct Accumulator {
    traffic: HashMap<(EndpointId, InstanceId, DateTime<Utc>), TrafficRow>,
    samples: Vec<MonitorSampleRow>,
    logs: Vec<LogRow>,
    events: Vec<EventRow>,
    deletions: Vec<SoftDelete>,
    pending: usize,
}

impl Accumulator {
    /// Folds one write in. Returns how many writes are buffered.
    fn push(&mut self, write: PendingWrite, bucket_secs: u64, audit: bool) -> usize {
        let PendingWrite { event, delta, totals } = write;

        if audit {
            self.events.push(EventRow {
                endpoint_id: event.endpoint_id.clone(),
                instance_id: event.instance_id.clone(),
                kind: event.kind,
                payload: serde_json::to_value(&event.payload).unwrap_or(serde_json::Value::Null),
                event_time: event.timestamp,
            });
        }

        match (event.kind, &event.instance_id) {
            (EventKind::Initial | EventKind::Create | EventKind::Update, Some(iid)) => {
                if let Some(sample) = event.sample() {
                    if let Some(counters) = sample.counters {
                        let bucket = bucket_start(event.timestamp, bucket_secs);
                        let row = TrafficRow {
                            endpoint_id: event.endpoint_id.clone(),
                            instance_id: iid.clone(),
                            bucket,
                            increment: delta,
                            total: totals.unwrap_or(counters),
                            sampled_at: event.timestamp,
                        };
                        let key = (row.endpoint_id.clone(), row.instance_id.clone(), bucket);
                        match self.traffic.get_mut(&key) {
                            Some(existing) => existing.merge(&row),
                            None => {
                                self.traffic.insert(key, row);
                            }
                        }
                    }
                    if sample.ping.is_some() || sample.pool.is_some() {
                        self.samples.push(MonitorSampleRow {
                            endpoint_id: event.endpoint_id.clone(),
                            instance_id: iid.clone(),
                            ping: sample.ping,
                            pool: sample.pool,
                            sampled_at: event.timestamp,
                        });
                    }
                }
            }
            (EventKind::Delete, Some(iid)) => self.deletions.push(SoftDelete {
                endpoint_id: event.endpoint_id.clone(),
                instance_id: iid.clone(),
                deleted_at: event.timestamp,
            }),
            (EventKind::Log, _) => {
                if let EventPayload::Log(message) = &event.payload {
                    self.logs.push(LogRow {
                        endpoint_id: event.endpoint_id.clone(),
                        instance_id: event.instance_id.clone(),
                        message: message.clone(),
                        logged_at: event.timestamp,
                    });
                }
            }
            _ => {}
        }

        self.pending += 1;
        self.pending
    }

    fn take(&mut self) -> WriteBatch {
        let acc = std::mem::take(self);
        WriteBatch {
            traffic: acc.traffic.into_values().collect(),
            samples: acc.samples,
            logs: acc.logs,
            events: acc.events,
            deletions: acc.deletions,
            endpoints: Vec::new(),
            instances: Vec::new(),
        }
    }
}

/// Outcome of one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub rows: u64,
    pub status_rows: usize,
}

/// Queue of one worker. The worker holds `rx` for as long as it runs.
struct Shard {
    tx: mpsc::Sender<PendingWrite>,
    rx: Mutex<mpsc::Receiver<PendingWrite>>,
}

pub struct BatchWriter {
    shards: Vec<Shard>,
    buffer: Mutex<Accumulator>,
    flush_gate: Mutex<()>,
    store: Arc<dyn DurableStore>,
    state: Arc<StateStore>,
    config: WriterConfig,
    metrics: Arc<SyncMetrics>,
}

impl BatchWriter {
    pub fn new(
        config: WriterConfig,
        store: Arc<dyn DurableStore>,
        state: Arc<StateStore>,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        let shards = (0..config.workers.max(1))
            .map(|_| {
                let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
                Shard { tx, rx: Mutex::new(rx) }
            })
            .collect();
        Self {
            shards,
            buffer: Mutex::new(Accumulator::default()),
            flush_gate: Mutex::new(()),
            store,
            state,
            config,
            metrics,
        }
    }

    fn shard_of(&self, endpoint_id: &str, instance_id: Option<&str>) -> usize {
        let mut hasher = DefaultHasher::new();
        endpoint_id.hash(&mut hasher);
        instance_id.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    /// Hands a write to its worker without waiting. Returns false if it was dropped.
    pub fn enqueue(&self, write: PendingWrite) -> bool {
        let idx = self.shard_of(&write.event.endpoint_id, write.event.instance_id.as_deref());
        match self.shards[idx].tx.try_send(write) {
            Ok(()) => {
                self.metrics.writes_enqueued.incr();
                true
            }
            Err(TrySendError::Full(w)) => {
                self.metrics.writes_dropped.incr();
                tracing::warn!(
                    endpoint = %w.event.endpoint_id,
                    worker = idx,
                    capacity = self.config.queue_capacity,
                    "persistence queue full, dropping event"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.metrics.writes_dropped.incr();
                false
            }
        }
    }

    /// Writes waiting across all worker queues.
    pub fn queue_depth(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.tx.max_capacity() - s.tx.capacity())
            .sum()
    }

    /// Combined capacity of all worker queues.
    pub fn capacity(&self) -> usize {
        self.shards.iter().map(|s| s.tx.max_capacity()).sum()
    }

    /// Spawns the worker pool and the flush timer under the supervisor.
    pub fn start(self: &Arc<Self>, supervisor: &Supervisor) {
        for idx in 0..self.shards.len() {
            let writer = Arc::clone(self);
            let cancel = supervisor.token();
            supervisor.spawn("persistence-worker", async move {
                writer.worker(idx, cancel).await;
            });
        }
        let writer = Arc::clone(self);
        let cancel = supervisor.token();
        supervisor.spawn("persistence-timer", async move {
            writer.timer(cancel).await;
        });
    }

    async fn worker(&self, idx: usize, cancel: CancellationToken) {
        let Some(shard) = self.shards.get(idx) else {
            return;
        };
        let mut rx = shard.rx.lock().await;
        tracing::debug!(worker = idx, "persistence worker started");
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => None,
                item = rx.recv() => item,
            };
            let Some(write) = next else { break };

            let buffered = self
                .buffer
                .lock()
                .await
                .push(write, self.config.bucket_secs, self.config.audit_events);
            if buffered >= self.config.batch_size.max(1) {
                let _ = self.flush().await;
            }
        }
        tracing::debug!(worker = idx, "persistence worker stopped");
    }

    async fn timer(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.flush_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let _ = self.flush().await;
                }
            }
        }
    }

    /// Writes the accumulator and every dirty status row in one batch.
    pub async fn flush(&self) -> Result<FlushReport, SyncError> {
        let _gate = self.flush_gate.lock().await;

        let mut batch = self.buffer.lock().await.take();
        let dirty = self.state.dirty_snapshot();
        batch.endpoints = dirty.endpoints.iter().map(|(e, _)| e.clone()).collect();
        batch.instances = dirty.instances.iter().map(|(i, _)| i.clone()).collect();
        if batch.is_empty() {
            return Ok(FlushReport::default());
        }

        let started = std::time::Instant::now();
        match self.store.write_batch(&batch).await {
            Ok(rows) => {
                self.state.clear_dirty(&dirty);
                self.metrics.flushes.incr();
                self.metrics.rows_written.add(rows);
                tracing::debug!(
                    rows,
                    status_rows = dirty.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "flushed batch"
                );
                Ok(FlushReport { rows, status_rows: dirty.len() })
            }
            Err(e) => {
                self.metrics.flush_errors.incr();
                tracing::error!(
                    store = self.store.name(),
                    rows = batch.row_count(),
                    "batch write failed, abandoning batch: {}",
                    e
                );
                Err(e.into())
            }
        }
    }

    /// Deletes an endpoint row once no flush is in flight. The endpoint must
    /// already be gone from the state store, so no later flush can write it back.
    pub async fn delete_endpoint(&self, endpoint_id: &str) -> Result<(), SyncError> {
        let _gate = self.flush_gate.lock().await;
        self.store.delete_endpoint(endpoint_id).await?;
        Ok(())
    }

    /// Drains whatever is still queued and flushes it. Used on shutdown after
    /// the workers have stopped; while workers are running the queue is left to them.
    pub async fn flush_now(&self) -> Result<FlushReport, SyncError> {
        for shard in &self.shards {
            let Ok(mut rx) = shard.rx.try_lock() else {
                continue;
            };
            let mut buffer = self.buffer.lock().await;
            while let Ok(write) = rx.try_recv() {
                buffer.push(write, self.config.bucket_secs, self.config.audit_events);
            }
        }
        self.flush().await
    }
}
