//! Error types for dispatch and subscription management.

use eventstore_tools_core::BoxError;
use eventstore_tools_core::event_log::{EventLogError, SubscriptionDropReason};
use eventstore_tools_core::store::StoreError;
use eventstore_tools_core::transaction::TransactionError;
use std::error::Error;
use thiserror::Error;
use uuid::Uuid;

/// Failure while dispatching one record to a handler.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// The method was registered with a configuration it cannot run with.
    #[error("Handler method {method} is not supported: {reason}")]
    UnsupportedMethod {
        /// Method name.
        method: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The payload or metadata did not match the method's parameters.
    #[error("Failed to decode {event_type} for {method}: {source}")]
    Decode {
        /// Method name.
        method: String,
        /// Record type tag.
        event_type: String,
        /// Decoder error.
        #[source]
        source: BoxError,
    },

    /// The method body failed, after retries.
    #[error("Handler method {method} failed: {source}")]
    Handler {
        /// Method name.
        method: String,
        /// Error returned by the method.
        #[source]
        source: BoxError,
    },

    /// Another consumer already moved the checkpoint to or past this record.
    #[error(
        "Checkpoint for group {group_name} on {stream_name} is already at or past {sequence}; \
         another consumer is processing this group"
    )]
    CheckpointOutdated {
        /// Consumer group.
        group_name: String,
        /// Subscribed stream.
        stream_name: String,
        /// Sequence that could not be written.
        sequence: i64,
    },

    /// Checkpoint or idempotency store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The surrounding transaction could not begin, commit or roll back.
    #[error(transparent)]
    Transaction(#[from] TransactionError),

    /// The record was processed but the server was not told.
    #[error("Failed to acknowledge event {event_id}: {source}")]
    AcknowledgementFailed {
        /// Acknowledged event id.
        event_id: Uuid,
        /// Client error.
        #[source]
        source: EventLogError,
    },
}

/// Failure while ensuring or starting a subscription.
#[derive(Error, Debug)]
pub enum SubscriptionError {
    /// Event log client failure.
    #[error(transparent)]
    EventLog(#[from] EventLogError),

    /// Bookkeeping store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Bookkeeping transaction failure.
    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

/// How a closed subscription is treated.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FailureType {
    /// Infrastructure trouble; resubscribe.
    ClientError,
    /// Application failure; drop the handler.
    UnexpectedError,
}

/// Classify why a subscription closed.
///
/// Recoverable drop reasons and errors raised by the event log client are
/// client errors. A handler method that failed because its own call to the
/// event log failed counts as a client error too. Everything else is
/// unexpected.
#[must_use]
pub fn classify_failure(
    reason: SubscriptionDropReason,
    error: Option<&(dyn Error + 'static)>,
) -> FailureType {
    if reason.is_recoverable() {
        return FailureType::ClientError;
    }
    let Some(error) = error else {
        return FailureType::UnexpectedError;
    };
    if error.is::<EventLogError>() {
        return FailureType::ClientError;
    }
    match error.downcast_ref::<DispatchError>() {
        Some(DispatchError::AcknowledgementFailed { .. }) => FailureType::ClientError,
        Some(DispatchError::Handler { source, .. }) if source.is::<EventLogError>() => {
            FailureType::ClientError
        }
        _ => FailureType::UnexpectedError,
    }
}
