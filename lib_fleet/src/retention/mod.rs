//! # Retention
//!
//! Bounded, batched deletion of expired and orphaned rows, run at startup and
//! on a cron schedule.

pub mod scheduler;
pub mod strategies;

pub use scheduler::{CleanupScheduler, RunReport};
pub use strategies::{default_strategies, run_strategy, CleanupStrategy, StrategyReport};
