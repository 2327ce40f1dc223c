//! # Eventstore Tools Testing
//!
//! In-memory collaborators and helpers for testing code built on
//! eventstore-tools.
//!
//! This crate provides:
//! - [`InMemoryEventLog`]: streams, link streams, catch-up and persistent
//!   subscriptions in process
//! - In-memory checkpoint, initial-position, idempotency and snapshot stores
//! - [`RecordingTransactionManager`] and [`ScriptedLeadership`]
//! - Deterministic time through [`FixedClock`]
//!
//! ## Example
//!
//! ```ignore
//! use eventstore_tools_testing::{InMemoryEventLog, InMemoryCheckpointStore};
//!
//! #[tokio::test]
//! async fn projector_catches_up() {
//!     let log = Arc::new(InMemoryEventLog::new());
//!     log.append_json("Order-1", "OrderPlaced", &json!({"total": 10}))?;
//!
//!     let manager = CatchUpSubscriptions::new(context(&log), handlers(), None);
//!     manager.start_subscriptions().await?;
//! }
//! ```

use chrono::{DateTime, Utc};
use eventstore_tools_core::environment::Clock;

pub mod event_log;
pub mod stores;
pub mod transaction;

/// Mock implementations of Environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use eventstore_tools_core::leadership::LeadershipContext;
    use futures::future::BoxFuture;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use eventstore_tools_testing::mocks::FixedClock;
    /// use eventstore_tools_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }

    /// Leadership context that only counts how often leadership was yielded.
    #[derive(Clone, Debug, Default)]
    pub struct ScriptedLeadership {
        yields: Arc<AtomicUsize>,
    }

    impl ScriptedLeadership {
        /// Create a context with no yields recorded.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Number of `yield_leadership` calls.
        #[must_use]
        pub fn yields(&self) -> usize {
            self.yields.load(Ordering::SeqCst)
        }
    }

    impl LeadershipContext for ScriptedLeadership {
        fn yield_leadership(&self) -> BoxFuture<'_, ()> {
            Box::pin(async move {
                self.yields.fetch_add(1, Ordering::SeqCst);
            })
        }
    }
}

/// Test helpers.
pub mod helpers {
    use std::time::Duration;

    /// Install a `tracing` subscriber honouring `RUST_LOG`, once per process.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    /// Poll `condition` until it holds; `false` when `timeout` elapsed first.
    pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        tokio::time::timeout(timeout, async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .is_ok()
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use proptest::prelude::*;

    /// Delivery orders of `len` records with redeliveries: every index
    /// appears at least once, some appear again later.
    pub fn redelivery_order(len: usize) -> impl Strategy<Value = Vec<usize>> {
        proptest::collection::vec(0..len.max(1), 0..len * 2).prop_map(move |extra| {
            let mut order: Vec<usize> = (0..len).collect();
            for (offset, index) in extra.into_iter().enumerate() {
                let at = (index + offset).min(order.len());
                order.insert(at, index);
            }
            order
        })
    }
}

// Re-export commonly used items
pub use event_log::InMemoryEventLog;
pub use helpers::{init_tracing, wait_until};
pub use mocks::{FixedClock, ScriptedLeadership, test_clock};
pub use stores::{
    InMemoryCheckpointStore, InMemoryIdempotencyStore, InMemoryInitialPositionStore,
    InMemorySnapshotStore,
};
pub use transaction::RecordingTransactionManager;
