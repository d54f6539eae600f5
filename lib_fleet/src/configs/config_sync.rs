use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::SyncError;
use crate::ingestors::sse::DEFAULT_MAX_FRAME_BYTES;
use crate::model::Endpoint;

/// A tunnel-proxy endpoint supplied by the external registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
    pub id: String,
    /// Base URL of the endpoint API, e.g. `http://10.0.0.5:9090/api`.
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    /// Disabled endpoints are registered but not connected at startup.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl EndpointConfig {
    pub fn to_endpoint(&self) -> Endpoint {
        Endpoint::new(&self.id, &self.base_url, &self.api_key)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct StateConfig {
    /// Number of lock shards the state store spreads endpoints over.
    pub shards: usize,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self { shards: 16 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct IngestionConfig {
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub connect_timeout_secs: u64,
    /// Path of the event stream, relative to the endpoint base URL.
    pub events_path: String,
    /// Longest SSE line or frame accepted before the stream is dropped.
    pub max_frame_bytes: usize,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 60_000,
            connect_timeout_secs: 10,
            events_path: String::from("events"),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct WriterConfig {
    /// Capacity of each worker's queue. Writes of one instance always land on
    /// the same worker.
    pub queue_capacity: usize,
    pub workers: usize,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    /// Width of the traffic-stats time bucket.
    pub bucket_secs: u64,
    /// Write an audit row for every canonical event.
    pub audit_events: bool,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            workers: 2,
            batch_size: 500,
            flush_interval_ms: 5_000,
            bucket_secs: 3_600,
            audit_events: true,
        }
    }
}

impl WriterConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct HubConfig {
    /// Outbound buffer per dashboard client. A full buffer evicts the client.
    pub client_buffer: usize,
    /// Capacity of the queue between publishers and the dispatch loop.
    pub publish_queue: usize,
    pub ping_interval_secs: u64,
    pub pong_timeout_secs: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            client_buffer: 256,
            publish_queue: 4_096,
            ping_interval_secs: 30,
            pong_timeout_secs: 75,
        }
    }
}

impl HubConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitorConfig {
    pub poll_interval_secs: u64,
    /// How long a scope may stay without subscribers before its poller stops.
    pub grace_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            grace_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreConfig {
    /// PostgreSQL connection URL. Without it the engine keeps rows in memory.
    pub database_url: Option<String>,
    pub pool_size: Option<usize>,
}

/// Retention window and batch size of one data class.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetentionClass {
    pub window_hours: u64,
    pub batch_size: usize,
}

impl RetentionClass {
    pub const fn new(window_hours: u64, batch_size: usize) -> Self {
        Self { window_hours, batch_size }
    }

    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.window_hours as i64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RetentionPolicy {
    pub realtime_events: RetentionClass,
    pub traffic_stats: RetentionClass,
    pub monitor_samples: RetentionClass,
    pub logs: RetentionClass,
    pub soft_deleted: RetentionClass,
    pub orphan_batch_size: usize,
    /// Six-field cron expression (with seconds) for the recurring cleanup run.
    pub cleanup_schedule: String,
    /// Six-field cron expression for compaction and statistics refresh.
    pub maintenance_schedule: String,
    pub startup_timeout_secs: u64,
    /// Upper bound on delete batches per strategy run.
    pub max_batches_per_run: u64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            realtime_events: RetentionClass::new(24, 1_000),
            traffic_stats: RetentionClass::new(24 * 90, 1_000),
            monitor_samples: RetentionClass::new(24 * 7, 1_000),
            logs: RetentionClass::new(24 * 7, 1_000),
            soft_deleted: RetentionClass::new(24 * 30, 500),
            orphan_batch_size: 1_000,
            cleanup_schedule: String::from("0 */10 * * * *"),
            maintenance_schedule: String::from("0 30 3 * * *"),
            startup_timeout_secs: 60,
            max_batches_per_run: 10_000,
        }
    }
}

impl RetentionPolicy {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        let classes = [
            ("realtimeEvents", &self.realtime_events),
            ("trafficStats", &self.traffic_stats),
            ("monitorSamples", &self.monitor_samples),
            ("logs", &self.logs),
            ("softDeleted", &self.soft_deleted),
        ];
        for (name, class) in classes {
            if class.window_hours == 0 {
                return Err(SyncError::Configuration(format!(
                    "retention.{}.windowHours must be greater than zero",
                    name
                )));
            }
            check_batch(&format!("retention.{}.batchSize", name), class.batch_size)?;
        }
        check_batch("retention.orphanBatchSize", self.orphan_batch_size)?;
        check_cron("retention.cleanupSchedule", &self.cleanup_schedule)?;
        check_cron("retention.maintenanceSchedule", &self.maintenance_schedule)?;
        if self.startup_timeout_secs == 0 {
            return Err(SyncError::Configuration(
                "retention.startupTimeoutSecs must be greater than zero".into(),
            ));
        }
        if self.max_batches_per_run == 0 {
            return Err(SyncError::Configuration(
                "retention.maxBatchesPerRun must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

fn check_batch(name: &str, size: usize) -> Result<(), SyncError> {
    if size == 0 || size > 100_000 {
        return Err(SyncError::Configuration(format!(
            "{} must be between 1 and 100000, got {}",
            name, size
        )));
    }
    Ok(())
}

fn check_cron(name: &str, expr: &str) -> Result<(), SyncError> {
    let fields = expr.split_whitespace().count();
    if !(6..=7).contains(&fields) {
        return Err(SyncError::Configuration(format!(
            "{} must be a 6 or 7 field cron expression, got '{}'",
            name, expr
        )));
    }
    Ok(())
}

/// The full engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    pub endpoints: Vec<EndpointConfig>,
    pub state: StateConfig,
    pub ingestion: IngestionConfig,
    pub writer: WriterConfig,
    pub hub: HubConfig,
    pub monitor: MonitorConfig,
    pub retention: RetentionPolicy,
    pub store: StoreConfig,
}

impl SyncConfig {
    /// Reads a JSON configuration file. Absent sections take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, SyncError> {
        let text = fs::read_to_string(path).map_err(|e| {
            SyncError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, SyncError> {
        serde_json::from_str(text).map_err(|e| SyncError::Configuration(e.to_string()))
    }

    /// Checks every section. Called once before the engine starts.
    pub fn validate(&self) -> Result<(), SyncError> {
        let mut seen = HashSet::new();
        for ep in &self.endpoints {
            if ep.id.trim().is_empty() {
                return Err(SyncError::Configuration("endpoint id must not be empty".into()));
            }
            if !seen.insert(ep.id.as_str()) {
                return Err(SyncError::Configuration(format!("duplicate endpoint id '{}'", ep.id)));
            }
            url::Url::parse(&ep.base_url).map_err(|e| {
                SyncError::Configuration(format!("endpoint '{}' has invalid baseUrl: {}", ep.id, e))
            })?;
        }

        if self.state.shards == 0 {
            return Err(SyncError::Configuration("state.shards must be greater than zero".into()));
        }

        let ing = &self.ingestion;
        if ing.reconnect_base_ms == 0 || ing.reconnect_max_ms < ing.reconnect_base_ms {
            return Err(SyncError::Configuration(
                "ingestion.reconnectMaxMs must be >= reconnectBaseMs > 0".into(),
            ));
        }
        if ing.connect_timeout_secs == 0 {
            return Err(SyncError::Configuration(
                "ingestion.connectTimeoutSecs must be greater than zero".into(),
            ));
        }
        if ing.max_frame_bytes < 1024 {
            return Err(SyncError::Configuration(
                "ingestion.maxFrameBytes must be at least 1024".into(),
            ));
        }

        let w = &self.writer;
        if w.queue_capacity == 0 || w.workers == 0 || w.batch_size == 0 {
            return Err(SyncError::Configuration(
                "writer.queueCapacity, writer.workers and writer.batchSize must be greater than zero".into(),
            ));
        }
        if w.flush_interval_ms == 0 || w.bucket_secs == 0 {
            return Err(SyncError::Configuration(
                "writer.flushIntervalMs and writer.bucketSecs must be greater than zero".into(),
            ));
        }

        let h = &self.hub;
        if h.client_buffer == 0 || h.publish_queue == 0 {
            return Err(SyncError::Configuration(
                "hub.clientBuffer and hub.publishQueue must be greater than zero".into(),
            ));
        }
        if h.ping_interval_secs == 0 || h.pong_timeout_secs <= h.ping_interval_secs {
            return Err(SyncError::Configuration(
                "hub.pongTimeoutSecs must exceed hub.pingIntervalSecs > 0".into(),
            ));
        }

        if self.monitor.poll_interval_secs == 0 {
            return Err(SyncError::Configuration(
                "monitor.pollIntervalSecs must be greater than zero".into(),
            ));
        }

        self.retention.validate()
    }
}
