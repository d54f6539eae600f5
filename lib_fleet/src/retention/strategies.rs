//! Cleanup strategies.
//!
//! Every strategy is a predicate over one data class plus a batch size. The
//! batch loop re-counts matching rows and deletes at most one batch per
//! statement until nothing matches, so a run never holds long locks and
//! running it again right after converges to zero deletions.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::configs::{RetentionClass, RetentionPolicy};
use crate::errors::SyncError;
use crate::persistence::store::{DeletionTarget, DurableStore};

pub trait CleanupStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    /// Lower runs first.
    fn priority(&self) -> u8;
    fn batch_size(&self) -> usize;
    fn target(&self, now: DateTime<Utc>) -> DeletionTarget;
}

/// Rows older than a retention window.
pub struct AgedRows {
    name: &'static str,
    priority: u8,
    class: RetentionClass,
    target: fn(DateTime<Utc>) -> DeletionTarget,
}

impl CleanupStrategy for AgedRows {
    fn name(&self) -> &'static str {
        self.name
    }

    fn priority(&self) -> u8 {
        self.priority
    }

    fn batch_size(&self) -> usize {
        self.class.batch_size
    }

    fn target(&self, now: DateTime<Utc>) -> DeletionTarget {
        (self.target)(now - self.class.window())
    }
}

/// Child rows whose endpoint is gone.
pub struct OrphanRows {
    batch_size: usize,
}

impl CleanupStrategy for OrphanRows {
    fn name(&self) -> &'static str {
        "orphan_rows"
    }

    fn priority(&self) -> u8 {
        2
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn target(&self, _now: DateTime<Utc>) -> DeletionTarget {
        DeletionTarget::Orphans
    }
}

fn aged(
    name: &'static str,
    priority: u8,
    class: RetentionClass,
    target: fn(DateTime<Utc>) -> DeletionTarget,
) -> Box<dyn CleanupStrategy> {
    Box::new(AgedRows {
        name,
        priority,
        class,
        target,
    })
}

/// The built-in strategies, in priority order.
pub fn default_strategies(policy: &RetentionPolicy) -> Vec<Box<dyn CleanupStrategy>> {
    vec![
        aged("realtime_events", 1, policy.realtime_events, DeletionTarget::RealtimeEventsBefore),
        Box::new(OrphanRows {
            batch_size: policy.orphan_batch_size,
        }),
        aged("traffic_stats", 3, policy.traffic_stats, DeletionTarget::TrafficStatsBefore),
        aged("monitor_samples", 4, policy.monitor_samples, DeletionTarget::MonitorSamplesBefore),
        aged("logs", 5, policy.logs, DeletionTarget::LogsBefore),
        aged("soft_deleted", 6, policy.soft_deleted, DeletionTarget::SoftDeletedBefore),
    ]
}

/// What one strategy did during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyReport {
    pub name: &'static str,
    pub rows_deleted: u64,
    pub batches: u64,
    #[serde(serialize_with = "as_millis")]
    pub duration: Duration,
    pub error: Option<String>,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Runs one strategy to completion, or until `max_batches` or cancellation.
pub async fn run_strategy(
    strategy: &dyn CleanupStrategy,
    store: &dyn DurableStore,
    now: DateTime<Utc>,
    max_batches: u64,
    cancel: &CancellationToken,
) -> StrategyReport {
    let started = Instant::now();
    let target = strategy.target(now);
    let batch = strategy.batch_size().max(1);
    let mut rows_deleted = 0u64;
    let mut batches = 0u64;

    let result: Result<(), SyncError> = async {
        loop {
            if cancel.is_cancelled() || batches >= max_batches {
                break;
            }
            if store.count_matching(&target).await? == 0 {
                break;
            }
            let n = store.delete_batch(&target, batch).await?;
            if n == 0 {
                break;
            }
            rows_deleted += n;
            batches += 1;
        }
        Ok(())
    }
    .await;

    let error = result.err().map(|e| {
        SyncError::RetentionStrategy {
            strategy: strategy.name().to_string(),
            reason: e.to_string(),
        }
        .to_string()
    });
    StrategyReport {
        name: strategy.name(),
        rows_deleted,
        batches,
        duration: started.elapsed(),
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Endpoint, TrafficCounters};
    use crate::persistence::memory::MemoryStore;
    use crate::persistence::store::{TrafficRow, WriteBatch};

    fn seeded(rows: i64) -> MemoryStore {
        let store = MemoryStore::new();
        let old = Utc::now() - chrono::Duration::days(200);
        let traffic = (0..rows)
            .map(|h| TrafficRow {
                endpoint_id: "e1".into(),
                instance_id: "i1".into(),
                bucket: old + chrono::Duration::hours(h),
                increment: TrafficCounters::default(),
                total: TrafficCounters::default(),
                sampled_at: old,
            })
            .collect();
        store.insert_rows(WriteBatch {
            endpoints: vec![Endpoint::new("e1", "http://h/api", "")],
            traffic,
            ..Default::default()
        });
        store
    }

    fn stats_strategy(batch_size: usize) -> Box<dyn CleanupStrategy> {
        let mut policy = RetentionPolicy::default();
        policy.traffic_stats.batch_size = batch_size;
        default_strategies(&policy)
            .into_iter()
            .find(|s| s.name() == "traffic_stats")
            .unwrap()
    }

    #[test]
    fn strategies_come_in_priority_order() {
        let names: Vec<_> = default_strategies(&RetentionPolicy::default())
            .iter()
            .map(|s| (s.priority(), s.name()))
            .collect();
        assert_eq!(names[0], (1, "realtime_events"));
        assert_eq!(names[1], (2, "orphan_rows"));
        assert_eq!(names[5], (6, "soft_deleted"));
    }

    #[tokio::test]
    async fn deletes_in_batches_and_converges() {
        let store = seeded(25);
        let strategy = stats_strategy(10);
        let cancel = CancellationToken::new();

        let first = run_strategy(strategy.as_ref(), &store, Utc::now(), 100, &cancel).await;
        assert_eq!(first.rows_deleted, 25);
        assert_eq!(first.batches, 3);
        assert!(first.error.is_none());

        let again = run_strategy(strategy.as_ref(), &store, Utc::now(), 100, &cancel).await;
        assert_eq!(again.rows_deleted, 0);
        assert_eq!(again.batches, 0);
    }

    #[tokio::test]
    async fn batch_cap_bounds_a_run() {
        let store = seeded(25);
        let strategy = stats_strategy(10);
        let report =
            run_strategy(strategy.as_ref(), &store, Utc::now(), 1, &CancellationToken::new()).await;
        assert_eq!(report.rows_deleted, 10);
    }

    #[tokio::test]
    async fn store_failure_is_reported_not_raised() {
        let store = seeded(5);
        store.set_fail_deletes(true);
        let strategy = stats_strategy(10);
        let report =
            run_strategy(strategy.as_ref(), &store, Utc::now(), 100, &CancellationToken::new()).await;
        assert_eq!(report.rows_deleted, 0);
        assert!(report.error.unwrap().contains("traffic_stats"));
    }
}
