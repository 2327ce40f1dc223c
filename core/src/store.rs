//! Errors shared by the relational store contracts.

use thiserror::Error;

/// Failure of a checkpoint, idempotency, initial-position or snapshot store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The underlying database rejected or failed the statement.
    #[error("Database error: {0}")]
    Database(String),

    /// A stored value could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A sequence does not fit the signed column that stores it.
    #[error("Sequence {0} does not fit a stored position")]
    SequenceOutOfRange(u64),
}

/// `sequence` as held in a signed `BIGINT` column.
///
/// # Errors
///
/// Returns [`StoreError::SequenceOutOfRange`] above `i64::MAX`.
pub fn stored_sequence(sequence: u64) -> Result<i64, StoreError> {
    i64::try_from(sequence).map_err(|_| StoreError::SequenceOutOfRange(sequence))
}
