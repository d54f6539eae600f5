//! # Core Engine Module
//!
//! The in-process heart of the synchronization engine.
//!
//! ## Core Components:
//!
//! - **`state_store`**: The authoritative sharded cache of endpoints and
//!   instances, with per-entity dirty markers drained by the batch writer.
//!
//! - **`hub`**: The zero-copy broadcaster. Dashboard clients subscribe to one
//!   scope each; updates are fanned out through bounded per-client buffers and
//!   slow consumers are evicted rather than waited for.
//!
//! - **`router`**: The single path every state change takes, store first, then
//!   writer and hub.
//!
//! - **`registry`**: Per-scope monitor pollers with a reference-counted linger,
//!   so scopes that flap between watched and unwatched do not churn pollers.
//!
//! - **`supervisor`**: The shutdown coordinator every background loop is
//!   spawned through.

/// Sharded in-memory cache with dirty tracking.
pub mod state_store;
/// Scope-grouped fan-out to dashboard clients.
pub mod hub;
/// Store, writer and hub routing for every state change.
pub mod router;
/// Lazily started per-scope monitor pollers.
pub mod registry;
/// Cancellation and task tracking for all background loops.
pub mod supervisor;

// --- Public API Re-exports ---
pub use hub::{ClientId, Hub, Outbound, ScopeObserver, StateUpdate, Subscription, UpdateKind};
pub use registry::{MonitorRegistry, PointInTimeSource};
pub use router::EventRouter;
pub use state_store::{DirtySnapshot, EndpointView, ScopeView, StateStore, UpsertOutcome};
pub use supervisor::Supervisor;
