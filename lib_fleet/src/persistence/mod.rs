//! # Persistence
//!
//! The durable side of the engine. Nothing here is on the ingestion hot path:
//! events reach the store through the bounded queue of the [`BatchWriter`].
//!
//! - **`store`**: the [`DurableStore`] seam, its row types and deletion targets.
//! - **`memory`**: in-process engine, used without a database and in tests.
//! - **`postgres`**: `deadpool-postgres` engine (feature `postgres`).
//! - **`writer`**: bounded queue, worker pool, accumulation and flush.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod store;
pub mod writer;

use std::sync::Arc;

use crate::configs::StoreConfig;
use crate::errors::StoreError;

pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PgStore;
pub use store::{DeletionTarget, DurableStore, WriteBatch};
pub use writer::{BatchWriter, FlushReport, PendingWrite};

/// Picks the engine for the given configuration: PostgreSQL when a database
/// URL is set, the in-process engine otherwise.
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn DurableStore>, StoreError> {
    match &config.database_url {
        #[cfg(feature = "postgres")]
        Some(_) => Ok(Arc::new(PgStore::connect(config).await?)),
        #[cfg(not(feature = "postgres"))]
        Some(_) => Err(StoreError::Unavailable(
            "database URL set but the postgres feature is disabled".into(),
        )),
        None => {
            tracing::warn!("no database configured, state is kept in process memory only");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}
