//! # Error Taxonomy
//!
//! Every failure the engine can produce falls into one of a handful of classes.
//! All of them except `Configuration` are recoverable and are absorbed at the
//! boundary of the component that raised them; callers of the state store and
//! the hub never see ingestion or persistence errors.

use thiserror::Error;

/// Errors raised by the synchronization engine.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Broken pipe, reset, refused connection, write-after-close. Reconnect with backoff.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// A single wire event could not be decoded. The event is dropped, the connection kept.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// A batch could not be written. The batch is abandoned and superseded by the next flush.
    #[error("persistence write failed: {0}")]
    PersistenceWrite(#[from] StoreError),

    /// A dashboard client could not keep up and was evicted.
    #[error("slow consumer evicted: client {0}")]
    SlowConsumer(u64),

    /// A single retention strategy failed. Its siblings still run.
    #[error("retention strategy '{strategy}' failed: {reason}")]
    RetentionStrategy { strategy: String, reason: String },

    /// Invalid configuration. Fatal at startup only.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Lookup of an endpoint that is not registered.
    #[error("unknown endpoint: {0}")]
    UnknownEndpoint(String),

    /// Lookup of an instance that is not cached.
    #[error("unknown instance: {0}")]
    UnknownInstance(String),
}

impl SyncError {
    /// Whether the error should lead to a reconnect rather than being ignored.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::TransientNetwork(_))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        SyncError::TransientNetwork(e.to_string())
    }
}

impl From<reqwest_middleware::Error> for SyncError {
    fn from(e: reqwest_middleware::Error) -> Self {
        SyncError::TransientNetwork(e.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(e: url::ParseError) -> Self {
        SyncError::Configuration(format!("invalid URL: {}", e))
    }
}

/// Errors raised by a durable store engine.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to get connection from pool: {0}")]
    Pool(String),
    #[error("query execution failed: {0}")]
    Query(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[cfg(feature = "postgres")]
impl From<tokio_postgres::Error> for StoreError {
    fn from(e: tokio_postgres::Error) -> Self {
        StoreError::Query(e.to_string())
    }
}

#[cfg(feature = "postgres")]
impl From<deadpool_postgres::PoolError> for StoreError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        StoreError::Pool(e.to_string())
    }
}
