//! # Configuration Module
//!
//! Typed configuration for every engine component, loaded from JSON and
//! validated once at startup. Invalid values are the only fatal errors the
//! engine produces.

/// Engine configuration, per-component sections and the retention policy.
pub mod config_sync;

pub use config_sync::*;
