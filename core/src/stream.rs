//! Stream identification and optimistic concurrency types.
//!
//! A stream is an append-only, strictly ordered sequence of records. It is the
//! unit of optimistic concurrency: every append states which version it expects
//! the stream to be at.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for `StreamId` parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid stream ID: {0}")]
pub struct ParseStreamIdError(String);

/// Name of a stream in the event log.
///
/// Aggregate streams follow the `{AggregateType}-{id}` convention, see
/// [`StreamId::for_aggregate`]. Subscription handlers may also consume
/// system or projection streams such as `$ce-Order`.
///
/// # Validation
///
/// - `FromStr::from_str()`: rejects empty strings
/// - `From::from()` and `new()`: no validation (trusted input)
///
/// # Examples
///
/// ```
/// use eventstore_tools_core::stream::StreamId;
///
/// let stream_id = StreamId::new("Order-42");
/// assert_eq!(stream_id.as_str(), "Order-42");
///
/// let parsed: StreamId = "Customer-abc".parse().unwrap();
/// assert_eq!(parsed, StreamId::new("Customer-abc"));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(String);

/// Replacement for `/` inside aggregate ids, which the log reserves.
pub const SLASH_REPLACEMENT: &str = "__slash__";

impl StreamId {
    /// Create a new `StreamId` from a string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Stream holding the events of one aggregate instance.
    ///
    /// # Examples
    ///
    /// ```
    /// use eventstore_tools_core::stream::StreamId;
    ///
    /// let id = StreamId::for_aggregate("Order", "eu/42");
    /// assert_eq!(id.as_str(), "Order-eu__slash__42");
    /// ```
    #[must_use]
    pub fn for_aggregate(aggregate_type: &str, aggregate_id: &str) -> Self {
        Self(format!(
            "{aggregate_type}-{}",
            aggregate_id.replace('/', SLASH_REPLACEMENT)
        ))
    }

    /// Get the stream ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert the `StreamId` into its inner `String`.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for StreamId {
    type Err = ParseStreamIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseStreamIdError("Stream ID cannot be empty".to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl From<String> for StreamId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for StreamId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for StreamId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Precondition attached to an append or a metadata write.
///
/// Sequences are zero based, so a stream holding one record is at
/// `Exact(0)`. A stream that was never written to is at `NoStream`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExpectedVersion {
    /// Skip the concurrency check.
    Any,
    /// The stream must not exist yet.
    NoStream,
    /// The last record of the stream must carry this sequence.
    Exact(u64),
}

impl ExpectedVersion {
    /// Expected version matching a last-committed sequence, `None` meaning
    /// that nothing was committed yet.
    ///
    /// # Examples
    ///
    /// ```
    /// use eventstore_tools_core::stream::ExpectedVersion;
    ///
    /// assert_eq!(ExpectedVersion::from_last(None), ExpectedVersion::NoStream);
    /// assert_eq!(ExpectedVersion::from_last(Some(3)), ExpectedVersion::Exact(3));
    /// ```
    #[must_use]
    pub const fn from_last(last: Option<u64>) -> Self {
        match last {
            Some(sequence) => Self::Exact(sequence),
            None => Self::NoStream,
        }
    }

    /// Whether a stream whose last sequence is `current` satisfies this
    /// precondition.
    #[must_use]
    pub const fn matches(self, current: Option<u64>) -> bool {
        match (self, current) {
            (Self::Any, _) | (Self::NoStream, None) => true,
            (Self::Exact(expected), Some(actual)) => expected == actual,
            _ => false,
        }
    }
}

impl fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "any"),
            Self::NoStream => write!(f, "no stream"),
            Self::Exact(sequence) => write!(f, "{sequence}"),
        }
    }
}

/// Per-stream metadata the log keeps next to the records.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMetadata {
    /// Records below this sequence are soft-deleted for new readers.
    pub truncate_before: Option<u64>,
}

impl StreamMetadata {
    /// First sequence a reader should load.
    #[must_use]
    pub fn first_readable_sequence(&self) -> u64 {
        self.truncate_before.unwrap_or(0)
    }
}

/// Stream metadata together with its own version, as returned by the log.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamMetadataResult {
    /// Current metadata, default when never written.
    pub metadata: StreamMetadata,
    /// Version of the metadata record itself, `None` when never written.
    pub meta_version: Option<u64>,
}
