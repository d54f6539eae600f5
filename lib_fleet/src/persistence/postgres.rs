//! # PostgreSQL Store Engine
//!
//! A `deadpool_postgres` pool over `tokio_postgres`. The schema is created on
//! connect if missing. Batches are written in one transaction; traffic rows use
//! `ON CONFLICT` so delta fields add up and absolute fields follow the newest
//! sample. Retention deletes are bounded with a `ctid` sub-select so each
//! statement touches at most `limit` rows.

use async_trait::async_trait;
use deadpool_postgres::{Config as DeadpoolConfig, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use tokio_postgres::NoTls;

use crate::configs::StoreConfig;
use crate::errors::StoreError;
use crate::persistence::store::{DeletionTarget, DurableStore, WriteBatch};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS endpoints (
    id          TEXT PRIMARY KEY,
    base_url    TEXT NOT NULL,
    status      TEXT NOT NULL,
    last_seen   TIMESTAMPTZ,
    info        JSONB,
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE TABLE IF NOT EXISTS instances (
    endpoint_id TEXT NOT NULL,
    id          TEXT NOT NULL,
    role        TEXT,
    status      TEXT NOT NULL DEFAULT 'unknown',
    url         TEXT,
    tcp_rx      BIGINT NOT NULL DEFAULT 0,
    tcp_tx      BIGINT NOT NULL DEFAULT 0,
    udp_rx      BIGINT NOT NULL DEFAULT 0,
    udp_tx      BIGINT NOT NULL DEFAULT 0,
    ping        BIGINT,
    pool        BIGINT,
    sampled_at  TIMESTAMPTZ,
    deleted_at  TIMESTAMPTZ,
    PRIMARY KEY (endpoint_id, id)
);
CREATE TABLE IF NOT EXISTS traffic_stats (
    endpoint_id      TEXT NOT NULL,
    instance_id      TEXT NOT NULL,
    bucket           TIMESTAMPTZ NOT NULL,
    tcp_rx_increment BIGINT NOT NULL DEFAULT 0,
    tcp_tx_increment BIGINT NOT NULL DEFAULT 0,
    udp_rx_increment BIGINT NOT NULL DEFAULT 0,
    udp_tx_increment BIGINT NOT NULL DEFAULT 0,
    tcp_rx_total     BIGINT NOT NULL DEFAULT 0,
    tcp_tx_total     BIGINT NOT NULL DEFAULT 0,
    udp_rx_total     BIGINT NOT NULL DEFAULT 0,
    udp_tx_total     BIGINT NOT NULL DEFAULT 0,
    sampled_at       TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (endpoint_id, instance_id, bucket)
);
CREATE TABLE IF NOT EXISTS monitor_samples (
    id          BIGSERIAL PRIMARY KEY,
    endpoint_id TEXT NOT NULL,
    instance_id TEXT NOT NULL,
    ping        BIGINT,
    pool        BIGINT,
    sampled_at  TIMESTAMPTZ NOT NULL
);
CREATE TABLE IF NOT EXISTS realtime_events (
    id          BIGSERIAL PRIMARY KEY,
    endpoint_id TEXT NOT NULL,
    instance_id TEXT,
    kind        TEXT NOT NULL,
    payload     JSONB NOT NULL,
    event_time  TIMESTAMPTZ NOT NULL
);
CREATE TABLE IF NOT EXISTS logs (
    id          BIGSERIAL PRIMARY KEY,
    endpoint_id TEXT NOT NULL,
    instance_id TEXT,
    message     TEXT NOT NULL,
    logged_at   TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_traffic_stats_bucket ON traffic_stats (bucket);
CREATE INDEX IF NOT EXISTS idx_monitor_samples_time ON monitor_samples (sampled_at);
CREATE INDEX IF NOT EXISTS idx_realtime_events_time ON realtime_events (event_time);
CREATE INDEX IF NOT EXISTS idx_logs_time ON logs (logged_at);
CREATE INDEX IF NOT EXISTS idx_instances_deleted ON instances (deleted_at) WHERE deleted_at IS NOT NULL;
"#;

const UPSERT_ENDPOINT: &str = "
INSERT INTO endpoints (id, base_url, status, last_seen, info, updated_at)
VALUES ($1, $2, $3, $4, $5, now())
ON CONFLICT (id) DO UPDATE SET
    base_url = EXCLUDED.base_url,
    status = EXCLUDED.status,
    last_seen = EXCLUDED.last_seen,
    info = COALESCE(EXCLUDED.info, endpoints.info),
    updated_at = now()";

const UPSERT_INSTANCE: &str = "
INSERT INTO instances (endpoint_id, id, role, status, url, tcp_rx, tcp_tx, udp_rx, udp_tx, ping, pool, sampled_at, deleted_at)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, NULL)
ON CONFLICT (endpoint_id, id) DO UPDATE SET
    role = EXCLUDED.role,
    status = EXCLUDED.status,
    url = EXCLUDED.url,
    tcp_rx = EXCLUDED.tcp_rx,
    tcp_tx = EXCLUDED.tcp_tx,
    udp_rx = EXCLUDED.udp_rx,
    udp_tx = EXCLUDED.udp_tx,
    ping = EXCLUDED.ping,
    pool = EXCLUDED.pool,
    sampled_at = EXCLUDED.sampled_at,
    deleted_at = NULL";

const SOFT_DELETE_INSTANCE: &str = "
INSERT INTO instances (endpoint_id, id, deleted_at)
VALUES ($1, $2, $3)
ON CONFLICT (endpoint_id, id) DO UPDATE SET deleted_at = EXCLUDED.deleted_at";

const UPSERT_TRAFFIC: &str = "
INSERT INTO traffic_stats (
    endpoint_id, instance_id, bucket,
    tcp_rx_increment, tcp_tx_increment, udp_rx_increment, udp_tx_increment,
    tcp_rx_total, tcp_tx_total, udp_rx_total, udp_tx_total, sampled_at)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
ON CONFLICT (endpoint_id, instance_id, bucket) DO UPDATE SET
    tcp_rx_increment = traffic_stats.tcp_rx_increment + EXCLUDED.tcp_rx_increment,
    tcp_tx_increment = traffic_stats.tcp_tx_increment + EXCLUDED.tcp_tx_increment,
    udp_rx_increment = traffic_stats.udp_rx_increment + EXCLUDED.udp_rx_increment,
    udp_tx_increment = traffic_stats.udp_tx_increment + EXCLUDED.udp_tx_increment,
    tcp_rx_total = CASE WHEN EXCLUDED.sampled_at >= traffic_stats.sampled_at THEN EXCLUDED.tcp_rx_total ELSE traffic_stats.tcp_rx_total END,
    tcp_tx_total = CASE WHEN EXCLUDED.sampled_at >= traffic_stats.sampled_at THEN EXCLUDED.tcp_tx_total ELSE traffic_stats.tcp_tx_total END,
    udp_rx_total = CASE WHEN EXCLUDED.sampled_at >= traffic_stats.sampled_at THEN EXCLUDED.udp_rx_total ELSE traffic_stats.udp_rx_total END,
    udp_tx_total = CASE WHEN EXCLUDED.sampled_at >= traffic_stats.sampled_at THEN EXCLUDED.udp_tx_total ELSE traffic_stats.udp_tx_total END,
    sampled_at = GREATEST(traffic_stats.sampled_at, EXCLUDED.sampled_at)";

const INSERT_SAMPLE: &str =
    "INSERT INTO monitor_samples (endpoint_id, instance_id, ping, pool, sampled_at) VALUES ($1, $2, $3, $4, $5)";
const INSERT_LOG: &str =
    "INSERT INTO logs (endpoint_id, instance_id, message, logged_at) VALUES ($1, $2, $3, $4)";
const INSERT_EVENT: &str =
    "INSERT INTO realtime_events (endpoint_id, instance_id, kind, payload, event_time) VALUES ($1, $2, $3, $4, $5)";

/// Child tables checked for rows whose endpoint is gone.
const CHILD_TABLES: [&str; 5] = ["instances", "traffic_stats", "monitor_samples", "logs", "realtime_events"];

const MAINTAINED_TABLES: [&str; 6] = [
    "endpoints",
    "instances",
    "traffic_stats",
    "monitor_samples",
    "realtime_events",
    "logs",
];

fn db_int(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

/// Table and WHERE clause for time-based targets. The cutoff is bound as `$1`.
fn time_predicate(target: &DeletionTarget) -> Option<(&'static str, &'static str)> {
    match target {
        DeletionTarget::RealtimeEventsBefore(_) => Some(("realtime_events", "event_time < $1")),
        DeletionTarget::TrafficStatsBefore(_) => Some(("traffic_stats", "bucket < $1")),
        DeletionTarget::MonitorSamplesBefore(_) => Some(("monitor_samples", "sampled_at < $1")),
        DeletionTarget::LogsBefore(_) => Some(("logs", "logged_at < $1")),
        DeletionTarget::SoftDeletedBefore(_) => {
            Some(("instances", "deleted_at IS NOT NULL AND deleted_at < $1"))
        }
        DeletionTarget::Orphans => None,
    }
}

fn cutoff(target: &DeletionTarget) -> Option<chrono::DateTime<chrono::Utc>> {
    match target {
        DeletionTarget::RealtimeEventsBefore(t)
        | DeletionTarget::TrafficStatsBefore(t)
        | DeletionTarget::MonitorSamplesBefore(t)
        | DeletionTarget::LogsBefore(t)
        | DeletionTarget::SoftDeletedBefore(t) => Some(*t),
        DeletionTarget::Orphans => None,
    }
}

fn orphan_clause(table: &str) -> String {
    format!(
        "NOT EXISTS (SELECT 1 FROM endpoints e WHERE e.id = {}.endpoint_id)",
        table
    )
}

pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    /// Builds the pool and bootstraps the schema.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let url = config
            .database_url
            .clone()
            .ok_or_else(|| StoreError::Unavailable("no database URL configured".into()))?;

        let mut pg_pool_config = DeadpoolConfig::new();
        pg_pool_config.url = Some(url);
        pg_pool_config.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        if let Some(size) = config.pool_size {
            pg_pool_config.pool = Some(PoolConfig::new(size));
        }

        let pool = pg_pool_config
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| StoreError::Pool(format!("failed to create database pool: {}", e)))?;
        let store = Self { pool };
        store.bootstrap().await?;
        tracing::info!("PostgreSQL store ready");
        Ok(store)
    }

    async fn bootstrap(&self) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        client.batch_execute(SCHEMA).await?;
        Ok(())
    }
}

#[async_trait]
impl DurableStore for PgStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn write_batch(&self, batch: &WriteBatch) -> Result<u64, StoreError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let mut rows = 0u64;

        let stmt = tx.prepare_cached(SOFT_DELETE_INSTANCE).await?;
        for del in &batch.deletions {
            rows += tx
                .execute(&stmt, &[&del.endpoint_id, &del.instance_id, &del.deleted_at])
                .await?;
        }

        let stmt = tx.prepare_cached(UPSERT_ENDPOINT).await?;
        for ep in &batch.endpoints {
            let info = ep.info.as_ref().and_then(|i| serde_json::to_value(i).ok());
            rows += tx
                .execute(
                    &stmt,
                    &[&ep.id, &ep.base_url, &ep.status.as_str(), &ep.last_seen, &info],
                )
                .await?;
        }

        let stmt = tx.prepare_cached(UPSERT_INSTANCE).await?;
        for inst in &batch.instances {
            let role = inst.role.map(|r| r.as_str());
            rows += tx
                .execute(
                    &stmt,
                    &[
                        &inst.endpoint_id,
                        &inst.id,
                        &role,
                        &inst.status,
                        &inst.url,
                        &db_int(inst.counters.tcp_rx),
                        &db_int(inst.counters.tcp_tx),
                        &db_int(inst.counters.udp_rx),
                        &db_int(inst.counters.udp_tx),
                        &inst.ping,
                        &inst.pool,
                        &inst.sampled_at,
                    ],
                )
                .await?;
        }

        let stmt = tx.prepare_cached(UPSERT_TRAFFIC).await?;
        for row in &batch.traffic {
            rows += tx
                .execute(
                    &stmt,
                    &[
                        &row.endpoint_id,
                        &row.instance_id,
                        &row.bucket,
                        &db_int(row.increment.tcp_rx),
                        &db_int(row.increment.tcp_tx),
                        &db_int(row.increment.udp_rx),
                        &db_int(row.increment.udp_tx),
                        &db_int(row.total.tcp_rx),
                        &db_int(row.total.tcp_tx),
                        &db_int(row.total.udp_rx),
                        &db_int(row.total.udp_tx),
                        &row.sampled_at,
                    ],
                )
                .await?;
        }

        let stmt = tx.prepare_cached(INSERT_SAMPLE).await?;
        for s in &batch.samples {
            rows += tx
                .execute(&stmt, &[&s.endpoint_id, &s.instance_id, &s.ping, &s.pool, &s.sampled_at])
                .await?;
        }

        let stmt = tx.prepare_cached(INSERT_LOG).await?;
        for l in &batch.logs {
            rows += tx
                .execute(&stmt, &[&l.endpoint_id, &l.instance_id, &l.message, &l.logged_at])
                .await?;
        }

        let stmt = tx.prepare_cached(INSERT_EVENT).await?;
        for e in &batch.events {
            rows += tx
                .execute(
                    &stmt,
                    &[&e.endpoint_id, &e.instance_id, &e.kind.as_str(), &e.payload, &e.event_time],
                )
                .await?;
        }

        tx.commit().await?;
        Ok(rows)
    }

    async fn delete_endpoint(&self, endpoint_id: &str) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        client
            .execute("DELETE FROM endpoints WHERE id = $1", &[&endpoint_id])
            .await?;
        Ok(())
    }

    async fn count_matching(&self, target: &DeletionTarget) -> Result<u64, StoreError> {
        let client = self.pool.get().await?;
        match (time_predicate(target), cutoff(target)) {
            (Some((table, predicate)), Some(cut)) => {
                let sql = format!("SELECT COUNT(*) FROM {} WHERE {}", table, predicate);
                let row = client.query_one(&sql, &[&cut]).await?;
                Ok(row.get::<_, i64>(0).max(0) as u64)
            }
            _ => {
                let mut total = 0u64;
                for table in CHILD_TABLES {
                    let sql = format!("SELECT COUNT(*) FROM {} WHERE {}", table, orphan_clause(table));
                    let row = client.query_one(&sql, &[]).await?;
                    total += row.get::<_, i64>(0).max(0) as u64;
                }
                Ok(total)
            }
        }
    }

    async fn delete_batch(&self, target: &DeletionTarget, limit: usize) -> Result<u64, StoreError> {
        let client = self.pool.get().await?;
        let limit = limit as i64;
        match (time_predicate(target), cutoff(target)) {
            (Some((table, predicate)), Some(cut)) => {
                let sql = format!(
                    "DELETE FROM {t} WHERE ctid IN (SELECT ctid FROM {t} WHERE {p} LIMIT $2)",
                    t = table,
                    p = predicate
                );
                Ok(client.execute(&sql, &[&cut, &limit]).await?)
            }
            _ => {
                let mut left = limit;
                let mut deleted = 0u64;
                for table in CHILD_TABLES {
                    if left <= 0 {
                        break;
                    }
                    let sql = format!(
                        "DELETE FROM {t} WHERE ctid IN (SELECT ctid FROM {t} WHERE {p} LIMIT $1)",
                        t = table,
                        p = orphan_clause(table)
                    );
                    let n = client.execute(&sql, &[&left]).await?;
                    deleted += n;
                    left -= n as i64;
                }
                Ok(deleted)
            }
        }
    }

    async fn maintain(&self) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        // VACUUM refuses to run inside a transaction block, so one statement per call
        for table in MAINTAINED_TABLES {
            client.batch_execute(&format!("VACUUM ANALYZE {}", table)).await?;
        }
        Ok(())
    }
}
