//! `PostgreSQL` stores for eventstore-tools.
//!
//! This crate provides the relational side of the subscription machinery:
//!
//! - Checkpoint rows with a monotonic, fencing update
//! - Initial-position rows (first write wins)
//! - Idempotency records (`INSERT ... ON CONFLICT DO NOTHING` as the dedup gate)
//! - Aggregate snapshots
//! - A transaction manager that lets all of the above join one ambient
//!   transaction per handled record
//!
//! # Example
//!
//! ```ignore
//! use eventstore_tools_postgres::{PostgresConfig, PostgresCheckpointStore, PostgresTransactionManager};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = PostgresConfig::from_env().connect().await?;
//!     eventstore_tools_postgres::migrate(&pool).await?;
//!
//!     let checkpoints = PostgresCheckpointStore::new(pool.clone());
//!     let transactions = PostgresTransactionManager::new(pool);
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod checkpoint;
mod config;
mod executor;
mod idempotency;
mod snapshot;
mod transaction;

pub use checkpoint::{PostgresCheckpointStore, PostgresInitialPositionStore};
pub use config::{ENV_PREFIX, PostgresConfig};
pub use idempotency::PostgresIdempotencyStore;
pub use snapshot::PostgresSnapshotStore;
pub use transaction::PostgresTransactionManager;

use eventstore_tools_core::store::StoreError;
use sqlx::PgPool;

/// Create or upgrade the tables used by the stores of this crate.
///
/// # Errors
///
/// Returns [`StoreError::Database`] if a migration fails.
pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| StoreError::Database(format!("Migration failed: {e}")))?;
    tracing::info!("Applied eventstore-tools migrations");
    Ok(())
}

pub(crate) fn database_error(error: &sqlx::Error) -> StoreError {
    StoreError::Database(error.to_string())
}
