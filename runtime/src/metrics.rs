//! Prometheus metrics for subscriptions and repositories.
//!
//! Metrics are emitted through the `metrics` facade. Nothing is recorded
//! unless the host application installs a recorder, for example with
//! [`PrometheusRecorder::install`].
//!
//! # Example
//!
//! ```rust,no_run
//! use eventstore_tools_runtime::metrics::PrometheusRecorder;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut recorder = PrometheusRecorder::new();
//! recorder.install()?;
//!
//! // Serve this from the application's own scrape endpoint.
//! let text = recorder.render();
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Live catch-up subscription handles, per handler.
pub const CATCHUP_CONNECTIONS: &str = "eventstore_tools_catchup_subscriptions_connections";
/// Time spent loading one aggregate.
pub const AGGREGATE_REHYDRATION: &str = "eventstore_tools_aggregate_rehydration_seconds";
/// Records that reached a handler method.
pub const EVENTS_HANDLED: &str = "eventstore_tools_events_handled_total";
/// Records suppressed by the idempotency gate.
pub const EVENTS_DUPLICATE: &str = "eventstore_tools_events_duplicate_total";
/// Automatic resubscriptions after a client error.
pub const SUBSCRIPTION_RESUBSCRIBES: &str = "eventstore_tools_subscription_resubscribes_total";
/// Snapshot reads or writes that failed and were ignored.
pub const SNAPSHOT_FAILURES: &str = "eventstore_tools_snapshot_failures_total";

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus recorder for the host application.
///
/// Only renders the scrape text; serving it over HTTP is left to the
/// application.
#[derive(Default)]
pub struct PrometheusRecorder {
    handle: Option<PrometheusHandle>,
}

impl PrometheusRecorder {
    /// Create a recorder that is not installed yet.
    #[must_use]
    pub const fn new() -> Self {
        Self { handle: None }
    }

    /// Describe all metrics and install the recorder globally.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed. A recorder
    /// that was already installed by someone else is not an error.
    pub fn install(&mut self) -> Result<(), MetricsError> {
        describe_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("rehydration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!("Prometheus recorder installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus text format.
    ///
    /// Empty when this recorder was never installed.
    #[must_use]
    pub fn render(&self) -> String {
        self.handle
            .as_ref()
            .map(PrometheusHandle::render)
            .unwrap_or_default()
    }
}

/// Register all metric descriptions.
pub fn describe_metrics() {
    describe_gauge!(
        CATCHUP_CONNECTIONS,
        "Whether a catch-up subscription handle is live (1) or not (0)"
    );
    describe_histogram!(
        AGGREGATE_REHYDRATION,
        metrics::Unit::Seconds,
        "Time taken to load an aggregate from its stream"
    );
    describe_counter!(
        EVENTS_HANDLED,
        "Total number of records dispatched to handler methods"
    );
    describe_counter!(
        EVENTS_DUPLICATE,
        "Total number of records skipped because they were already handled"
    );
    describe_counter!(
        SUBSCRIPTION_RESUBSCRIBES,
        "Total number of resubscriptions after a client error"
    );
    describe_counter!(
        SNAPSHOT_FAILURES,
        "Total number of snapshot reads or writes that failed"
    );
}

/// Subscription metrics recorder.
pub struct SubscriptionMetrics;

impl SubscriptionMetrics {
    /// Record whether a catch-up handler currently holds a live handle.
    pub fn record_connection(handler: &str, group_name: &str, stream_name: &str, live: bool) {
        gauge!(
            CATCHUP_CONNECTIONS,
            "handler" => handler.to_string(),
            "group_name" => group_name.to_string(),
            "stream_name" => stream_name.to_string()
        )
        .set(if live { 1.0 } else { 0.0 });
    }

    /// Record a resubscription.
    pub fn record_resubscribe(handler: &str) {
        counter!(SUBSCRIPTION_RESUBSCRIBES, "handler" => handler.to_string()).increment(1);
    }
}

/// Dispatch metrics recorder.
pub struct DispatchMetrics;

impl DispatchMetrics {
    /// Record a record handed to the handler methods.
    pub fn record_handled(handler: &str) {
        counter!(EVENTS_HANDLED, "handler" => handler.to_string()).increment(1);
    }

    /// Record a duplicate delivery.
    pub fn record_duplicate(handler: &str) {
        counter!(EVENTS_DUPLICATE, "handler" => handler.to_string()).increment(1);
    }
}

/// Repository metrics recorder.
pub struct RepositoryMetrics;

impl RepositoryMetrics {
    /// Record an aggregate load.
    pub fn record_rehydration(aggregate_type: &'static str, duration: Duration) {
        histogram!(AGGREGATE_REHYDRATION, "aggregate_type" => aggregate_type)
            .record(duration.as_secs_f64());
    }

    /// Record a failed snapshot read or write.
    pub fn record_snapshot_failure(aggregate_type: &'static str) {
        counter!(SNAPSHOT_FAILURES, "aggregate_type" => aggregate_type).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorder_starts_uninstalled() {
        let recorder = PrometheusRecorder::new();
        assert!(recorder.handle().is_none());
        assert!(recorder.render().is_empty());
    }

    #[test]
    fn install_tolerates_existing_recorder() {
        let mut first = PrometheusRecorder::new();
        assert!(first.install().is_ok());

        let mut second = PrometheusRecorder::new();
        assert!(second.install().is_ok());
    }

    #[test]
    fn recording_without_recorder_is_a_noop() {
        SubscriptionMetrics::record_connection("h", "g", "s", true);
        DispatchMetrics::record_handled("h");
        DispatchMetrics::record_duplicate("h");
        RepositoryMetrics::record_rehydration("Order", Duration::from_millis(3));
        RepositoryMetrics::record_snapshot_failure("Order");
    }
}
