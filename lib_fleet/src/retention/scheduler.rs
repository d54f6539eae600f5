//! Cleanup scheduling.
//!
//! [`CleanupScheduler`] runs every strategy in priority order. Runs are
//! triggered once at startup (bounded by a timeout) and then by cron jobs;
//! a trigger that fires while a run is still going is skipped.

use std::sync::{Arc, Weak};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobBuilder, JobScheduler, JobSchedulerError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::configs::RetentionPolicy;
use crate::core::Supervisor;
use crate::errors::SyncError;
use crate::metrics::SyncMetrics;
use crate::persistence::store::DurableStore;
use crate::retention::strategies::{default_strategies, run_strategy, CleanupStrategy, StrategyReport};

/// Outcome of one pass over all strategies.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub reports: Vec<StrategyReport>,
    pub total_deleted: u64,
}

impl RunReport {
    pub fn failed(&self) -> impl Iterator<Item = &StrategyReport> {
        self.reports.iter().filter(|r| r.error.is_some())
    }
}

fn cron_error(what: &str, e: JobSchedulerError) -> SyncError {
    SyncError::Configuration(format!("{} scheduler: {}", what, e))
}

pub struct CleanupScheduler {
    store: Arc<dyn DurableStore>,
    strategies: Vec<Box<dyn CleanupStrategy>>,
    policy: RetentionPolicy,
    metrics: Arc<SyncMetrics>,
    cancel: CancellationToken,
    running: Mutex<()>,
    cron: Mutex<Option<JobScheduler>>,
}

impl CleanupScheduler {
    pub fn new(
        store: Arc<dyn DurableStore>,
        policy: RetentionPolicy,
        metrics: Arc<SyncMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        let strategies = default_strategies(&policy);
        Self::with_strategies(store, strategies, policy, metrics, cancel)
    }

    pub fn with_strategies(
        store: Arc<dyn DurableStore>,
        mut strategies: Vec<Box<dyn CleanupStrategy>>,
        policy: RetentionPolicy,
        metrics: Arc<SyncMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        strategies.sort_by_key(|s| s.priority());
        Self {
            store,
            strategies,
            policy,
            metrics,
            cancel,
            running: Mutex::new(()),
            cron: Mutex::new(None),
        }
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Runs every strategy once. Returns `None` if another run is in progress.
    /// A failing strategy is recorded in its report and does not stop the others.
    pub async fn run_all(&self) -> Option<RunReport> {
        let Ok(_guard) = self.running.try_lock() else {
            debug!("Cleanup run already in progress, skipping");
            return None;
        };

        let now = Utc::now();
        let mut run = RunReport::default();
        for strategy in &self.strategies {
            if self.cancel.is_cancelled() {
                break;
            }
            let report = run_strategy(
                strategy.as_ref(),
                self.store.as_ref(),
                now,
                self.policy.max_batches_per_run,
                &self.cancel,
            )
            .await;

            self.metrics.cleanup_rows_deleted.add(report.rows_deleted);
            match &report.error {
                Some(e) => {
                    self.metrics.cleanup_errors.incr();
                    error!("{}", e);
                }
                None if report.rows_deleted > 0 => info!(
                    "Cleanup {} deleted {} rows in {} batches ({:?})",
                    report.name, report.rows_deleted, report.batches, report.duration
                ),
                None => {}
            }
            run.total_deleted += report.rows_deleted;
            run.reports.push(report);
        }
        Some(run)
    }

    /// The startup pass. Gives up after the configured timeout so a large
    /// backlog cannot hold back the rest of startup.
    pub async fn run_startup(&self) -> Option<RunReport> {
        let limit = self.policy.startup_timeout();
        match tokio::time::timeout(limit, self.run_all()).await {
            Ok(report) => report,
            Err(_) => {
                warn!("Startup cleanup did not finish within {:?}", limit);
                None
            }
        }
    }

    pub async fn maintain(&self) -> Result<(), SyncError> {
        self.store.maintain().await?;
        info!("Storage maintenance on {} completed", self.store.name());
        Ok(())
    }

    fn cron_job(
        schedule: &str,
        me: Weak<Self>,
        maintenance: bool,
    ) -> Result<Job, JobSchedulerError> {
        JobBuilder::new()
            .with_cron_job_type()
            .with_schedule(schedule)?
            .with_run_async(Box::new(move |uuid, mut l| {
                let me = me.clone();
                Box::pin(async move {
                    let Some(me) = me.upgrade() else {
                        return;
                    };
                    if maintenance {
                        if let Err(e) = me.maintain().await {
                            error!("Storage maintenance failed: {}", e);
                        }
                    } else {
                        me.run_all().await;
                    }
                    if let Ok(Some(ts)) = l.next_tick_for_job(uuid).await {
                        let job = if maintenance { "maintenance" } else { "cleanup" };
                        debug!("Next {} run at {:?}", job, ts);
                    }
                })
            }))
            .build()
    }

    /// Installs the cron jobs and ties their lifetime to the supervisor.
    pub async fn start(self: &Arc<Self>, supervisor: &Supervisor) -> Result<(), SyncError> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| cron_error("cleanup", e))?;

        let cleanup = Self::cron_job(&self.policy.cleanup_schedule, Arc::downgrade(self), false)
            .map_err(|e| cron_error("cleanup", e))?;
        let maintenance =
            Self::cron_job(&self.policy.maintenance_schedule, Arc::downgrade(self), true)
                .map_err(|e| cron_error("maintenance", e))?;
        scheduler.add(cleanup).await.map_err(|e| cron_error("cleanup", e))?;
        scheduler
            .add(maintenance)
            .await
            .map_err(|e| cron_error("maintenance", e))?;
        scheduler.start().await.map_err(|e| cron_error("cleanup", e))?;
        *self.cron.lock().await = Some(scheduler);
        info!(
            "Cleanup scheduled at '{}', maintenance at '{}'",
            self.policy.cleanup_schedule, self.policy.maintenance_schedule
        );

        let me = Arc::clone(self);
        supervisor.spawn("cleanup-scheduler", async move {
            me.cancel.cancelled().await;
            me.stop().await;
        });
        Ok(())
    }

    pub async fn stop(&self) {
        if let Some(mut scheduler) = self.cron.lock().await.take() {
            if let Err(e) = scheduler.shutdown().await {
                warn!("Cleanup scheduler shutdown: {}", e);
            }
        }
    }

    pub async fn is_scheduled(&self) -> bool {
        self.cron.lock().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::RetentionClass;
    use crate::model::{Endpoint, TrafficCounters};
    use crate::persistence::memory::MemoryStore;
    use crate::persistence::store::{DeletionTarget, LogRow, TrafficRow, WriteBatch};
    use chrono::DateTime;

    fn seeded() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let old = Utc::now() - chrono::Duration::days(400);
        store.insert_rows(WriteBatch {
            endpoints: vec![Endpoint::new("e1", "http://h/api", "")],
            traffic: (0..7)
                .map(|h| TrafficRow {
                    endpoint_id: if h < 3 { "gone".into() } else { "e1".into() },
                    instance_id: "i1".into(),
                    bucket: Utc::now() - chrono::Duration::hours(h),
                    increment: TrafficCounters::default(),
                    total: TrafficCounters::default(),
                    sampled_at: Utc::now(),
                })
                .collect(),
            logs: (0..4)
                .map(|_| LogRow {
                    endpoint_id: "e1".into(),
                    instance_id: Some("i1".into()),
                    message: "old".into(),
                    logged_at: old,
                })
                .collect(),
            ..Default::default()
        });
        store
    }

    fn scheduler(store: Arc<MemoryStore>) -> (Arc<CleanupScheduler>, Arc<SyncMetrics>) {
        let metrics = Arc::new(SyncMetrics::new());
        let sched = CleanupScheduler::new(
            store,
            RetentionPolicy::default(),
            Arc::clone(&metrics),
            CancellationToken::new(),
        );
        (Arc::new(sched), metrics)
    }

    struct Broken;

    impl CleanupStrategy for Broken {
        fn name(&self) -> &'static str {
            "broken"
        }
        fn priority(&self) -> u8 {
            0
        }
        fn batch_size(&self) -> usize {
            10
        }
        fn target(&self, now: DateTime<Utc>) -> DeletionTarget {
            DeletionTarget::LogsBefore(now)
        }
    }

    #[tokio::test]
    async fn run_all_removes_orphans_and_expired_rows() {
        let store = seeded();
        let (sched, metrics) = scheduler(Arc::clone(&store));

        let run = sched.run_all().await.unwrap();
        assert_eq!(run.total_deleted, 7);
        assert_eq!(run.failed().count(), 0);
        assert_eq!(store.traffic_rows().len(), 4);
        assert!(store.logs().is_empty());
        assert_eq!(metrics.cleanup_rows_deleted.get(), 7);

        let again = sched.run_all().await.unwrap();
        assert_eq!(again.total_deleted, 0);
    }

    #[tokio::test]
    async fn overlapping_runs_are_skipped() {
        let (sched, _) = scheduler(seeded());
        let _held = sched.running.try_lock().unwrap();
        assert!(sched.run_all().await.is_none());
    }

    #[tokio::test]
    async fn one_failing_strategy_does_not_stop_the_rest() {
        let store = seeded();
        store.set_fail_deletes(true);
        let metrics = Arc::new(SyncMetrics::new());
        let mut strategies = default_strategies(&RetentionPolicy::default());
        strategies.push(Box::new(Broken));
        let sched = CleanupScheduler::with_strategies(
            store,
            strategies,
            RetentionPolicy::default(),
            Arc::clone(&metrics),
            CancellationToken::new(),
        );
        assert_eq!(sched.strategy_names()[0], "broken");

        let run = sched.run_all().await.unwrap();
        assert_eq!(run.reports.len(), 7);
        assert!(run.failed().count() >= 2);
        assert_eq!(metrics.cleanup_errors.get(), run.failed().count() as u64);
    }

    #[tokio::test]
    async fn windows_come_from_the_policy() {
        let store = seeded();
        let mut policy = RetentionPolicy::default();
        policy.logs = RetentionClass::new(24 * 500, 100);
        let sched = CleanupScheduler::new(
            Arc::clone(&store) as Arc<dyn DurableStore>,
            policy,
            Arc::new(SyncMetrics::new()),
            CancellationToken::new(),
        );
        sched.run_all().await.unwrap();
        assert_eq!(store.logs().len(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cron_jobs_install_and_stop() {
        let store = seeded();
        let (sched, _) = scheduler(Arc::clone(&store));
        let supervisor = Supervisor::new();
        sched.start(&supervisor).await.unwrap();
        assert!(sched.is_scheduled().await);

        sched.maintain().await.unwrap();
        assert_eq!(store.maintenance_runs(), 1);

        sched.stop().await;
        assert!(!sched.is_scheduled().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bad_schedule_is_a_configuration_error() {
        let mut policy = RetentionPolicy::default();
        policy.cleanup_schedule = "every tuesday".into();
        let sched = Arc::new(CleanupScheduler::new(
            seeded(),
            policy,
            Arc::new(SyncMetrics::new()),
            CancellationToken::new(),
        ));
        let err = sched.start(&Supervisor::new()).await.unwrap_err();
        assert!(matches!(err, SyncError::Configuration(_)));
    }
}
