//! # Eventstore Tools Core
//!
//! Contracts and data types for event-sourced aggregates and durable stream
//! subscriptions.
//!
//! This crate has no runtime behaviour of its own. It names the collaborators
//! the runtime coordinates and the values that flow between them:
//!
//! - **Event log** ([`event_log`]): append-only streams with optimistic
//!   versioning, stream metadata, catch-up and persistent subscriptions.
//! - **Checkpoints** ([`checkpoint`]): last processed position per consumer
//!   group and stream, updated monotonically.
//! - **Idempotency records** ([`idempotency`]): proof that a consumer group
//!   handled a record.
//! - **Initial positions** ([`position`]): where a new subscription starts and
//!   which records count as replayed.
//! - **Aggregates and snapshots** ([`aggregate`], [`snapshot`]).
//! - **Transactions** ([`transaction`]) and **leadership** ([`leadership`]).
//!
//! ## Architecture Principles
//!
//! - At-least-once delivery, exactly-once effects through deduplication
//! - Ordering per stream and handler is never traded for throughput
//! - Every collaborator is a trait object so tests can swap in memory fakes

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
pub use uuid::Uuid;

pub mod aggregate;
pub mod checkpoint;
pub mod error;
pub mod event;
pub mod event_log;
pub mod idempotency;
pub mod leadership;
pub mod metadata;
pub mod position;
pub mod record;
pub mod snapshot;
pub mod store;
pub mod stream;
pub mod transaction;

pub use error::BoxError;

/// Environment module - injected dependencies
///
/// External dependencies that vary between production and tests are
/// abstracted behind traits.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```ignore
    /// // Test - fixed time for deterministic tests
    /// struct FixedClock { time: DateTime<Utc> }
    /// impl Clock for FixedClock {
    ///     fn now(&self) -> DateTime<Utc> {
    ///         self.time
    ///     }
    /// }
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
