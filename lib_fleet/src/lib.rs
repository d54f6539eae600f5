//! # lib_fleet
//!
//! The real-time state synchronization engine behind the fleet control plane.
//! It keeps one live event stream open per tunnel-proxy endpoint, folds the
//! stream into an authoritative in-memory view, fans state changes out to
//! dashboard subscribers, writes everything back to durable storage in
//! batches, and prunes that storage on a schedule.
//!
//! ## Layout
//!
//! - **`model`**: endpoints, tunnel instances, canonical events and typed field updates.
//! - **`core`**: the state store, the broadcast hub, the monitor registry and the
//!   task supervisor.
//! - **`ingestors`**: SSE decoding, wire normalization and the per-endpoint
//!   stream workers.
//! - **`persistence`**: the durable store seam, its engines and the batch writer.
//! - **`retention`**: cleanup strategies and the cron-driven scheduler.
//! - **`retrieve`**: the HTTP client used for point-in-time endpoint queries.
//! - **`configs`** / **`loggers`** / **`metrics`** / **`errors`**: the ambient stack.
//! - **`context`**: the explicitly constructed object wiring everything together.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

pub mod configs;
pub mod context;
pub mod core;
pub mod errors;
pub mod ingestors;
pub mod loggers;
pub mod metrics;
pub mod model;
pub mod persistence;
pub mod retention;
pub mod retrieve;

pub use configs::config_sync::SyncConfig;
pub use context::SyncContext;
pub use errors::{StoreError, SyncError};
pub use metrics::{MetricsSnapshot, SyncMetrics};
