//! Fire-and-forget event publishing.
//!
//! [`EventPublisher`] appends single events to one configured stream without
//! a version check. Every record carries the metadata of the publisher's
//! [`MetadataSource`], by default the current trace context.

use crate::trace_context::TracingMetadataSource;
use eventstore_tools_core::event::{DomainEvent, EventError};
use eventstore_tools_core::event_log::{EventLogClient, EventLogError};
use eventstore_tools_core::metadata::{MetadataSource, merge_metadata};
use eventstore_tools_core::record::{AppendResult, NewRecord, RecordMetadata};
use eventstore_tools_core::stream::{ExpectedVersion, StreamId};
use serde::{Deserialize, Serialize};
use std::env;
use std::sync::Arc;
use thiserror::Error;

/// Prefix of every environment variable read by [`PublisherProperties::from_env`].
pub const ENV_PREFIX: &str = "EVENTSTORE_PUBLISHER_";

/// Errors of [`EventPublisher`].
#[derive(Error, Debug)]
pub enum PublishError {
    /// The event or its metadata could not be encoded.
    #[error("Failed to encode event: {0}")]
    Encode(#[source] EventError),

    /// The event log rejected the append.
    #[error(transparent)]
    EventLog(#[from] EventLogError),
}

/// Publisher settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherProperties {
    /// Whether a publisher is built at all.
    pub enabled: bool,
    /// Stream every event is appended to.
    pub stream_name: Option<String>,
}

impl PublisherProperties {
    /// Load `EVENTSTORE_PUBLISHER_ENABLED` and `EVENTSTORE_PUBLISHER_STREAM_NAME`.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load the settings through `lookup`, which receives full variable names.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |key: &str| lookup(&format!("{ENV_PREFIX}{key}"));
        Self {
            enabled: read("ENABLED").and_then(|s| s.parse().ok()).unwrap_or(false),
            stream_name: read("STREAM_NAME").filter(|s| !s.trim().is_empty()),
        }
    }
}

/// Appends events to a single stream.
#[derive(Clone)]
pub struct EventPublisher {
    client: Arc<dyn EventLogClient>,
    stream_id: StreamId,
    metadata: Arc<dyn MetadataSource>,
}

impl EventPublisher {
    /// Publisher on `stream_id` that stamps the current trace context.
    #[must_use]
    pub fn new(client: Arc<dyn EventLogClient>, stream_id: impl Into<StreamId>) -> Self {
        Self {
            client,
            stream_id: stream_id.into(),
            metadata: Arc::new(TracingMetadataSource),
        }
    }

    /// Publisher described by `properties`; `None` while disabled or without
    /// a stream name.
    #[must_use]
    pub fn from_properties(
        client: Arc<dyn EventLogClient>,
        properties: &PublisherProperties,
    ) -> Option<Self> {
        if !properties.enabled {
            return None;
        }
        let Some(stream_name) = properties.stream_name.as_deref() else {
            tracing::warn!("Event publisher is enabled without a stream name");
            return None;
        };
        Some(Self::new(client, stream_name))
    }

    /// Replace the metadata source.
    #[must_use]
    pub fn with_metadata_source(mut self, source: Arc<dyn MetadataSource>) -> Self {
        self.metadata = source;
        self
    }

    /// Target stream.
    #[must_use]
    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    /// Append `event` with the source metadata.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError`] if encoding or the append fails.
    pub async fn publish<E: DomainEvent>(&self, event: &E) -> Result<AppendResult, PublishError> {
        self.publish_with_metadata(event, &RecordMetadata::new()).await
    }

    /// Append `event` with `metadata` laid over the source metadata.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError`] if encoding or the append fails.
    pub async fn publish_with_metadata<E: DomainEvent>(
        &self,
        event: &E,
        metadata: &RecordMetadata,
    ) -> Result<AppendResult, PublishError> {
        let data = event.to_json().map_err(PublishError::Encode)?;
        let defaults = self.metadata.metadata(self.stream_id.as_str());
        let record = NewRecord::new(E::EVENT_TYPE, data)
            .with_metadata(&merge_metadata(&defaults, metadata))
            .map_err(|source| {
                PublishError::Encode(EventError::Serialization {
                    event_type: E::EVENT_TYPE.to_string(),
                    source,
                })
            })?;
        let event_id = record.event_id;

        match self
            .client
            .append(self.stream_id.clone(), ExpectedVersion::Any, vec![record])
            .await
        {
            Ok(result) => {
                tracing::debug!(
                    stream_id = %self.stream_id,
                    event_type = E::EVENT_TYPE,
                    %event_id,
                    "Published event"
                );
                Ok(result)
            }
            Err(err) => {
                tracing::error!(
                    stream_id = %self.stream_id,
                    event_type = E::EVENT_TYPE,
                    %event_id,
                    error = %err,
                    "Failed to publish event"
                );
                Err(err.into())
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use eventstore_tools_core::metadata::{AggregateIdMetadataSource, CompositeMetadataSource};
    use eventstore_tools_testing::InMemoryEventLog;
    use serde_json::json;
    use std::collections::HashMap;

    #[derive(Debug, Serialize, Deserialize)]
    struct OrderShipped {
        order_id: String,
    }

    impl DomainEvent for OrderShipped {
        const EVENT_TYPE: &'static str = "OrderShipped";
    }

    fn shipped() -> OrderShipped {
        OrderShipped { order_id: "42".into() }
    }

    #[tokio::test]
    async fn publishes_to_the_configured_stream() {
        let log = Arc::new(InMemoryEventLog::new());
        let publisher = EventPublisher::new(log.clone(), "Shipping");

        publisher.publish(&shipped()).await.unwrap();
        publisher.publish(&shipped()).await.unwrap();

        let records = log.records("Shipping");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].event_type, "OrderShipped");
        assert_eq!(
            serde_json::from_slice::<serde_json::Value>(&records[1].data).unwrap(),
            json!({ "order_id": "42" })
        );
    }

    #[tokio::test]
    async fn event_metadata_overrides_source_metadata() {
        let log = Arc::new(InMemoryEventLog::new());
        let source = CompositeMetadataSource::new(vec![
            Arc::new(TracingMetadataSource),
            Arc::new(AggregateIdMetadataSource),
        ]);
        let publisher = EventPublisher::new(log.clone(), "Shipping").with_metadata_source(Arc::new(source));

        let mut metadata = RecordMetadata::new();
        metadata.insert("correlationId".into(), json!("c-1"));
        metadata.insert("aggregateId".into(), json!("order-42"));
        publisher.publish_with_metadata(&shipped(), &metadata).await.unwrap();

        let stored = log.records("Shipping")[0].metadata_map();
        assert_eq!(stored.get("correlationId"), Some(&json!("c-1")));
        assert_eq!(stored.get("aggregateId"), Some(&json!("order-42")));
    }

    #[tokio::test]
    async fn append_failures_are_returned() {
        let log = Arc::new(InMemoryEventLog::new());
        log.delete_stream("Shipping");
        let publisher = EventPublisher::new(log.clone(), "Shipping");

        let result = publisher.publish(&shipped()).await;
        assert!(matches!(
            result,
            Err(PublishError::EventLog(EventLogError::StreamDeleted(_)))
        ));
    }

    #[test]
    fn publisher_is_built_only_when_enabled_with_a_stream() {
        let log: Arc<dyn EventLogClient> = Arc::new(InMemoryEventLog::new());
        let vars = HashMap::from([
            ("EVENTSTORE_PUBLISHER_ENABLED", "true"),
            ("EVENTSTORE_PUBLISHER_STREAM_NAME", "Shipping"),
        ]);
        let properties = PublisherProperties::from_lookup(|name| vars.get(name).map(ToString::to_string));
        let publisher = EventPublisher::from_properties(Arc::clone(&log), &properties).unwrap();
        assert_eq!(publisher.stream_id().as_str(), "Shipping");

        let disabled = PublisherProperties { enabled: false, ..properties.clone() };
        assert!(EventPublisher::from_properties(Arc::clone(&log), &disabled).is_none());

        let nameless = PublisherProperties { stream_name: None, ..properties };
        assert!(EventPublisher::from_properties(log, &nameless).is_none());
    }
}
