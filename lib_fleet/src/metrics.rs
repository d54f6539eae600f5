//! # Engine Counters
//!
//! Lock-free counters shared by every component of the engine. Recoverable
//! errors never propagate to callers; they surface here instead, so operators
//! can see backpressure (queue-full drops), slow-consumer evictions and failed
//! flushes before data loss becomes silent.
//!
//! ## `Ordering::Relaxed`
//! Each counter is independent and only needs to be eventually consistent with
//! itself. No other memory operation is synchronized through these atomics, so
//! the cheapest ordering is sufficient.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// A monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn incr(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// All engine counters, grouped by the component that owns them.
#[derive(Debug, Default)]
pub struct SyncMetrics {
    // ingestion
    pub events_ingested: Counter,
    pub events_malformed: Counter,
    pub connect_attempts: Counter,
    pub connect_failures: Counter,
    pub stream_breaks: Counter,
    // persistence
    pub writes_enqueued: Counter,
    pub writes_dropped: Counter,
    pub flushes: Counter,
    pub flush_errors: Counter,
    pub rows_written: Counter,
    // hub
    pub updates_delivered: Counter,
    pub updates_dropped: Counter,
    pub clients_evicted: Counter,
    pub clients_timed_out: Counter,
    // monitors
    pub polls: Counter,
    pub poll_errors: Counter,
    // retention
    pub cleanup_rows_deleted: Counter,
    pub cleanup_errors: Counter,
}

/// A point-in-time copy of [`SyncMetrics`], suitable for JSON export.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub events_ingested: u64,
    pub events_malformed: u64,
    pub connect_attempts: u64,
    pub connect_failures: u64,
    pub stream_breaks: u64,
    pub writes_enqueued: u64,
    pub writes_dropped: u64,
    pub flushes: u64,
    pub flush_errors: u64,
    pub rows_written: u64,
    pub updates_delivered: u64,
    pub updates_dropped: u64,
    pub clients_evicted: u64,
    pub clients_timed_out: u64,
    pub polls: u64,
    pub poll_errors: u64,
    pub cleanup_rows_deleted: u64,
    pub cleanup_errors: u64,
    /// Events waiting in the persistence queue when the snapshot was taken.
    pub write_queue_depth: u64,
    /// Capacity of the persistence queue.
    pub write_queue_capacity: u64,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies every counter. Queue gauges are filled in by the caller that owns the queue.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_ingested: self.events_ingested.get(),
            events_malformed: self.events_malformed.get(),
            connect_attempts: self.connect_attempts.get(),
            connect_failures: self.connect_failures.get(),
            stream_breaks: self.stream_breaks.get(),
            writes_enqueued: self.writes_enqueued.get(),
            writes_dropped: self.writes_dropped.get(),
            flushes: self.flushes.get(),
            flush_errors: self.flush_errors.get(),
            rows_written: self.rows_written.get(),
            updates_delivered: self.updates_delivered.get(),
            updates_dropped: self.updates_dropped.get(),
            clients_evicted: self.clients_evicted.get(),
            clients_timed_out: self.clients_timed_out.get(),
            polls: self.polls.get(),
            poll_errors: self.poll_errors.get(),
            cleanup_rows_deleted: self.cleanup_rows_deleted.get(),
            cleanup_errors: self.cleanup_errors.get(),
            write_queue_depth: 0,
            write_queue_capacity: 0,
        }
    }
}
