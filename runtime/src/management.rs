//! Operational façade over the registered handlers.
//!
//! Meant to sit behind an internal admin endpoint of the host application.
//! Skipping an event inserts the idempotency record the handler would have
//! written, so the next delivery of that event is treated as a duplicate.

use crate::handler::RegisteredHandler;
use crate::idempotency::{EventIdempotencyStorage, StoreOutcome};
use crate::subscriptions::SubscriptionManager;
use eventstore_tools_core::idempotency::IdempotencyRecord;
use eventstore_tools_core::store::StoreError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Stream id recorded for manually skipped events when none is given.
pub const UNKNOWN_EVENT_STREAM_ID: &str = "UNKNOWN_MANUALLY_INSERTED";

/// Errors of [`HandlerManagement`].
#[derive(Error, Debug)]
pub enum ManagementError {
    /// No handler is registered under the name.
    #[error("Handler with name '{name}' not found. Available handlers: {available:?}")]
    HandlerNotFound {
        /// Requested name.
        name: String,
        /// Registered names.
        available: Vec<String>,
    },

    /// Neither id was provided.
    #[error("Either csharpEventId or javaEventId must be provided")]
    MissingEventId,

    /// An id is not a valid UUID.
    #[error("Invalid event id '{value}': {source}")]
    InvalidEventId {
        /// Raw id.
        value: String,
        /// Parse failure.
        #[source]
        source: uuid::Error,
    },

    /// The idempotency store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Request to mark one event as handled without handling it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkipEventRequest {
    /// Event id in RFC 4122 byte order.
    #[serde(default)]
    pub java_event_id: Option<String>,
    /// Event id in .NET `Guid` byte order; used when `java_event_id` is absent.
    #[serde(default)]
    pub csharp_event_id: Option<String>,
    /// Stream the event was appended to.
    #[serde(default = "unknown_event_stream_id")]
    pub event_stream_id: String,
    /// Type tag of the event.
    pub event_type: String,
}

fn unknown_event_stream_id() -> String {
    UNKNOWN_EVENT_STREAM_ID.to_string()
}

impl SkipEventRequest {
    /// Request for `event_type` with no id yet.
    #[must_use]
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            java_event_id: None,
            csharp_event_id: None,
            event_stream_id: unknown_event_stream_id(),
            event_type: event_type.into(),
        }
    }

    /// Resolved event id, preferring `java_event_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ManagementError::MissingEventId`] when no id is set and
    /// [`ManagementError::InvalidEventId`] when the id does not parse.
    pub fn event_id(&self) -> Result<Uuid, ManagementError> {
        let parse = |value: &str| {
            Uuid::parse_str(value).map_err(|source| ManagementError::InvalidEventId {
                value: value.to_string(),
                source,
            })
        };
        match (&self.java_event_id, &self.csharp_event_id) {
            (Some(java), _) => parse(java),
            (None, Some(csharp)) => parse(csharp).map(guid_to_uuid),
            (None, None) => Err(ManagementError::MissingEventId),
        }
    }
}

/// Convert a .NET `Guid` read as RFC 4122 text into the UUID it denotes.
///
/// .NET stores the first three groups little endian, so their bytes are
/// reversed; the last eight bytes are kept.
///
/// # Examples
///
/// ```
/// use eventstore_tools_runtime::management::guid_to_uuid;
/// use uuid::Uuid;
///
/// let guid = Uuid::parse_str("33221100-5544-7766-8899-aabbccddeeff").unwrap();
/// assert_eq!(
///     guid_to_uuid(guid).to_string(),
///     "00112233-4455-6677-8899-aabbccddeeff"
/// );
/// ```
#[must_use]
pub fn guid_to_uuid(guid: Uuid) -> Uuid {
    let mut bytes = *guid.as_bytes();
    bytes[0..4].reverse();
    bytes[4..6].reverse();
    bytes[6..8].reverse();
    Uuid::from_bytes(bytes)
}

/// Lists handlers and force-skips events for them.
#[derive(Clone)]
pub struct HandlerManagement {
    handlers: Vec<Arc<RegisteredHandler>>,
    idempotency: EventIdempotencyStorage,
}

impl HandlerManagement {
    /// Façade over `handlers`.
    #[must_use]
    pub fn new(handlers: Vec<Arc<RegisteredHandler>>, idempotency: EventIdempotencyStorage) -> Self {
        Self {
            handlers,
            idempotency,
        }
    }

    /// Façade over the handlers of every manager.
    #[must_use]
    pub fn for_managers(
        managers: &[&dyn SubscriptionManager],
        idempotency: EventIdempotencyStorage,
    ) -> Self {
        let handlers = managers
            .iter()
            .flat_map(|manager| manager.handlers())
            .collect();
        Self::new(handlers, idempotency)
    }

    /// Names of the registered handlers.
    #[must_use]
    pub fn handler_names(&self) -> Vec<String> {
        self.handlers
            .iter()
            .map(|handler| handler.name().to_string())
            .collect()
    }

    /// Mark an event as handled by `handler_name`.
    ///
    /// Returns the inserted record; skipping an already handled event
    /// returns the record that would have been inserted.
    ///
    /// # Errors
    ///
    /// Returns [`ManagementError::HandlerNotFound`] for an unknown handler,
    /// an id error from [`SkipEventRequest::event_id`], or
    /// [`ManagementError::Store`] when the insert fails.
    pub async fn skip_event(
        &self,
        handler_name: &str,
        request: SkipEventRequest,
    ) -> Result<IdempotencyRecord, ManagementError> {
        let handler = self
            .handlers
            .iter()
            .find(|handler| handler.name() == handler_name)
            .ok_or_else(|| ManagementError::HandlerNotFound {
                name: handler_name.to_string(),
                available: self.handler_names(),
            })?;
        let event_id = request.event_id()?;

        let record = IdempotencyRecord {
            event_id,
            stream_name: handler.stream_name().to_string(),
            event_stream_id: request.event_stream_id,
            group_name: handler.group_name().to_string(),
            event_type: request.event_type,
            created_at: self.idempotency.clock().now(),
        };
        let outcome = self.idempotency.insert(&record).await?;
        tracing::info!(
            handler = handler_name,
            %event_id,
            event_type = %record.event_type,
            already_handled = outcome == StoreOutcome::AlreadyHandled,
            "Manually skipped event"
        );
        Ok(record)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::handler::{EventHandler, HandlerRegistry};
    use eventstore_tools_core::idempotency::IdempotencyStore;
    use eventstore_tools_testing::{InMemoryIdempotencyStore, test_clock};

    struct Invoices;

    impl EventHandler for Invoices {
        fn stream_name(&self) -> &str {
            "$ce-Order"
        }

        fn group_name(&self) -> &str {
            "invoices"
        }

        fn register(_registry: &mut HandlerRegistry<Self>) {}
    }

    fn management(store: &Arc<InMemoryIdempotencyStore>) -> HandlerManagement {
        HandlerManagement::new(
            vec![Arc::new(RegisteredHandler::new(Invoices))],
            EventIdempotencyStorage::with_clock(
                Arc::clone(store) as Arc<dyn IdempotencyStore>,
                Arc::new(test_clock()),
            ),
        )
    }

    #[test]
    fn request_defaults() {
        let request: SkipEventRequest =
            serde_json::from_str(r#"{"javaEventId":"00112233-4455-6677-8899-aabbccddeeff","eventType":"OrderPlaced"}"#)
                .unwrap();
        assert_eq!(request.event_stream_id, UNKNOWN_EVENT_STREAM_ID);
        assert_eq!(request.csharp_event_id, None);
    }

    #[test]
    fn java_id_wins_over_csharp_id() {
        let mut request = SkipEventRequest::new("OrderPlaced");
        request.java_event_id = Some("00112233-4455-6677-8899-aabbccddeeff".into());
        request.csharp_event_id = Some("ffffffff-ffff-ffff-ffff-ffffffffffff".into());
        assert_eq!(
            request.event_id().unwrap().to_string(),
            "00112233-4455-6677-8899-aabbccddeeff"
        );
    }

    #[test]
    fn csharp_id_is_converted() {
        let mut request = SkipEventRequest::new("OrderPlaced");
        request.csharp_event_id = Some("35fc626d-d1a8-ff45-801f-953b34c9a459".into());
        assert_eq!(
            request.event_id().unwrap().to_string(),
            "6d62fc35-a8d1-45ff-801f-953b34c9a459"
        );
    }

    #[test]
    fn missing_and_invalid_ids() {
        let request = SkipEventRequest::new("OrderPlaced");
        assert!(matches!(request.event_id(), Err(ManagementError::MissingEventId)));

        let mut request = SkipEventRequest::new("OrderPlaced");
        request.java_event_id = Some("not-a-uuid".into());
        assert!(matches!(
            request.event_id(),
            Err(ManagementError::InvalidEventId { .. })
        ));
    }

    #[tokio::test]
    async fn skip_event_inserts_record_for_handler_group() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let management = management(&store);
        let mut request = SkipEventRequest::new("OrderPlaced");
        request.java_event_id = Some("00112233-4455-6677-8899-aabbccddeeff".into());

        let record = management.skip_event("Invoices", request).await.unwrap();
        assert_eq!(record.group_name, "invoices");
        assert_eq!(record.stream_name, "$ce-Order");
        assert_eq!(record.event_stream_id, UNKNOWN_EVENT_STREAM_ID);
        assert!(store.find(&record.key()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unknown_handler_lists_available_names() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let error = management(&store)
            .skip_event("Shipping", SkipEventRequest::new("OrderPlaced"))
            .await
            .unwrap_err();

        let ManagementError::HandlerNotFound { name, available } = error else {
            unreachable!("unexpected error: {error}");
        };
        assert_eq!(name, "Shipping");
        assert_eq!(available, vec!["Invoices".to_string()]);
    }
}
