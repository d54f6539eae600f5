//! Durable store seam and the row types that cross it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::StoreError;
use crate::model::{Endpoint, EndpointId, EventKind, InstanceId, TrafficCounters, TunnelInstance};

/// Traffic accounting row keyed by (endpoint, instance, bucket).
///
/// `increment` fields add up across writes of the same key, `total` fields are
/// replaced by the most recent absolute sample.
#[derive(Debug, Clone, PartialEq)]
pub struct TrafficRow {
    pub endpoint_id: EndpointId,
    pub instance_id: InstanceId,
    pub bucket: DateTime<Utc>,
    pub increment: TrafficCounters,
    pub total: TrafficCounters,
    pub sampled_at: DateTime<Utc>,
}

impl TrafficRow {
    /// Folds a later write of the same key into this row.
    pub fn merge(&mut self, other: &TrafficRow) {
        self.increment.accumulate(&other.increment);
        if other.sampled_at >= self.sampled_at {
            self.total = other.total;
            self.sampled_at = other.sampled_at;
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorSampleRow {
    pub endpoint_id: EndpointId,
    pub instance_id: InstanceId,
    pub ping: Option<i64>,
    pub pool: Option<i64>,
    pub sampled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogRow {
    pub endpoint_id: EndpointId,
    pub instance_id: Option<InstanceId>,
    pub message: String,
    pub logged_at: DateTime<Utc>,
}

/// Audit copy of a canonical event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRow {
    pub endpoint_id: EndpointId,
    pub instance_id: Option<InstanceId>,
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub event_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SoftDelete {
    pub endpoint_id: EndpointId,
    pub instance_id: InstanceId,
    pub deleted_at: DateTime<Utc>,
}

/// Everything one flush writes, in one call.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub traffic: Vec<TrafficRow>,
    pub samples: Vec<MonitorSampleRow>,
    pub logs: Vec<LogRow>,
    pub events: Vec<EventRow>,
    pub deletions: Vec<SoftDelete>,
    /// Dirty endpoint status rows.
    pub endpoints: Vec<Endpoint>,
    /// Dirty instance status rows.
    pub instances: Vec<TunnelInstance>,
}

impl WriteBatch {
    pub fn is_empty(&self) -> bool {
        self.row_count() == 0
    }

    pub fn row_count(&self) -> usize {
        self.traffic.len()
            + self.samples.len()
            + self.logs.len()
            + self.events.len()
            + self.deletions.len()
            + self.endpoints.len()
            + self.instances.len()
    }
}

/// Predicate selecting the rows a retention strategy removes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeletionTarget {
    RealtimeEventsBefore(DateTime<Utc>),
    /// Child rows whose endpoint no longer exists.
    Orphans,
    TrafficStatsBefore(DateTime<Utc>),
    MonitorSamplesBefore(DateTime<Utc>),
    LogsBefore(DateTime<Utc>),
    /// Instances soft-deleted before the cutoff.
    SoftDeletedBefore(DateTime<Utc>),
}

/// A durable store engine.
#[async_trait]
pub trait DurableStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Writes a batch atomically where the engine allows it. Returns rows written.
    async fn write_batch(&self, batch: &WriteBatch) -> Result<u64, StoreError>;

    /// Removes an endpoint row. Its children become orphans.
    async fn delete_endpoint(&self, endpoint_id: &str) -> Result<(), StoreError>;

    async fn count_matching(&self, target: &DeletionTarget) -> Result<u64, StoreError>;

    /// Deletes at most `limit` rows matching `target`. Returns rows deleted.
    async fn delete_batch(&self, target: &DeletionTarget, limit: usize) -> Result<u64, StoreError>;

    /// Compaction and statistics refresh.
    async fn maintain(&self) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn merge_adds_increments_and_keeps_latest_total() {
        let t0 = Utc::now();
        let row = |inc: u64, total: u64, at| TrafficRow {
            endpoint_id: "e1".into(),
            instance_id: "i1".into(),
            bucket: t0,
            increment: TrafficCounters { tcp_rx: inc, ..Default::default() },
            total: TrafficCounters { tcp_rx: total, ..Default::default() },
            sampled_at: at,
        };
        let mut acc = row(100, 100, t0);
        acc.merge(&row(50, 150, t0 + Duration::seconds(2)));
        acc.merge(&row(5, 120, t0 + Duration::seconds(1)));
        assert_eq!(acc.increment.tcp_rx, 155);
        assert_eq!(acc.total.tcp_rx, 150);
    }
}
