//! Domain event traits.
//!
//! Every record in the log carries a type tag. A [`DomainEvent`] binds one Rust
//! type to one tag; an [`EventSet`] is the closed set of events an aggregate
//! produces, typically an enum with one variant per event type.
//!
//! Payloads are JSON so that records stay readable by consumers written in
//! other languages.
//!
//! # Example
//!
//! ```
//! use eventstore_tools_core::event::DomainEvent;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
//! #[serde(rename_all = "camelCase")]
//! struct OrderPlaced {
//!     order_id: String,
//! }
//!
//! impl DomainEvent for OrderPlaced {
//!     const EVENT_TYPE: &'static str = "OrderPlaced";
//! }
//!
//! let bytes = OrderPlaced { order_id: "42".into() }.to_json().unwrap();
//! assert_eq!(bytes, br#"{"orderId":"42"}"#);
//! ```

use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

/// Error types for event encoding.
#[derive(Error, Debug)]
pub enum EventError {
    /// Failed to serialize event to bytes.
    #[error("Failed to serialize event {event_type}: {source}")]
    Serialization {
        /// Tag of the event that failed.
        event_type: String,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Failed to deserialize event from bytes.
    #[error("Failed to deserialize event {event_type}: {source}")]
    Deserialization {
        /// Tag of the record that failed.
        event_type: String,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

/// A single event type with a stable tag.
///
/// The tag is what handler tables and aggregates match records against, so it
/// must never change once records with it exist.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Type tag stored with every record of this event.
    const EVENT_TYPE: &'static str;

    /// Serialize this event to its JSON payload.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Serialization`] if serialization fails.
    fn to_json(&self) -> Result<Vec<u8>, EventError> {
        serde_json::to_vec(self).map_err(|source| EventError::Serialization {
            event_type: Self::EVENT_TYPE.to_string(),
            source,
        })
    }

    /// Deserialize an event from its JSON payload.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Deserialization`] if the bytes do not match the
    /// event's shape.
    fn from_json(bytes: &[u8]) -> Result<Self, EventError> {
        serde_json::from_slice(bytes).map_err(|source| EventError::Deserialization {
            event_type: Self::EVENT_TYPE.to_string(),
            source,
        })
    }
}

/// Closed set of events one aggregate type emits and applies.
///
/// Usually derived with `#[derive(EventSet)]` on an enum whose variants each
/// wrap one [`DomainEvent`].
pub trait EventSet: Sized + Send + Sync + 'static {
    /// Tag of this particular event.
    fn event_type(&self) -> &'static str;

    /// Serialize the wrapped event to its JSON payload.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Serialization`] if serialization fails.
    fn encode(&self) -> Result<Vec<u8>, EventError>;

    /// Decode a record payload by tag.
    ///
    /// Returns `Ok(None)` for tags that are not part of this set; aggregates
    /// ignore such records.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Deserialization`] when the tag is known but the
    /// payload does not match.
    fn decode(event_type: &str, data: &[u8]) -> Result<Option<Self>, EventError>;

    /// All tags of this set.
    fn event_types() -> &'static [&'static str];
}
