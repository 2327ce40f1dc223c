//! # Eventstore Tools Runtime
//!
//! Aggregate repositories and durable subscriptions over the contracts of
//! `eventstore-tools-core`.
//!
//! ## Core Components
//!
//! - **Repository**: rehydrates aggregates from their streams and appends
//!   their pending events under optimistic concurrency
//! - **Dispatcher**: routes each delivered record to the handler methods
//!   registered for its type tag
//! - **Features**: transaction, checkpoint and idempotency wrapping around
//!   every dispatched record
//! - **Subscription managers**: ensure, start, resubscribe and drop catch-up
//!   and persistent subscriptions per handler
//! - **Publisher**: appends single events to one stream, stamped with the
//!   current trace context
//!
//! ## Example
//!
//! ```ignore
//! use eventstore_tools_runtime::{CatchUpSubscriptions, RegisteredHandler, SubscriptionContext};
//!
//! let manager = CatchUpSubscriptions::new(
//!     context,
//!     vec![RegisteredHandler::new(OrderProjection::new(pool))],
//!     None,
//! );
//! manager.start_subscriptions().await?;
//! ```

/// Catch-up subscriptions with local checkpoints
pub mod catchup;

/// Subscription settings
pub mod config;

/// Per-record dispatch to handler methods
pub mod dispatcher;

/// Dispatch and subscription errors
pub mod error;

/// Per-method interceptors
pub mod extension;

/// Per-record wrapping: transaction, checkpoint, idempotency
pub mod feature;

/// Handler registration
pub mod handler;

/// Idempotency gate
pub mod idempotency;

/// Operational façade
pub mod management;

/// Prometheus metrics for observability
pub mod metrics;

/// Persistent subscriptions
pub mod persistent;

/// Single-stream event publishing
pub mod publisher;

/// Aggregate repositories
pub mod repository;

/// Retry logic with backoff
pub mod retry;

/// Subscription handle cells
pub mod subscription_state;

/// Shared subscription lifecycle
pub mod subscriptions;

/// Trace context in record metadata
pub mod trace_context;

pub use catchup::CatchUpSubscriptions;
pub use config::SubscriptionProperties;
pub use dispatcher::Dispatcher;
pub use error::{DispatchError, FailureType, SubscriptionError, classify_failure};
pub use extension::{LoggingExtension, MethodExtension, TracingExtension};
pub use handler::{EventHandler, HandlerRegistry, Metadata, MethodConfig, RegisteredHandler};
pub use idempotency::{EventIdempotencyStorage, StoreOutcome};
pub use management::{HandlerManagement, ManagementError, SkipEventRequest};
pub use persistent::PersistentSubscriptions;
pub use publisher::{EventPublisher, PublishError, PublisherProperties};
pub use repository::{AggregateRepository, RepositoryError, SnapshottingRepository};
pub use retry::RetryPolicy;
pub use subscriptions::{SubscriptionContext, SubscriptionManager};
pub use trace_context::TracingMetadataSource;
