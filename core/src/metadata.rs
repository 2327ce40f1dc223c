//! Default metadata attached to aggregate events on save.

use crate::record::RecordMetadata;
use serde_json::Value;
use std::sync::Arc;

/// Metadata key carrying the aggregate id.
pub const AGGREGATE_ID_KEY: &str = "aggregateId";

/// Supplies default metadata for the events of one aggregate.
pub trait MetadataSource: Send + Sync {
    /// Metadata for events of `aggregate_id`.
    fn metadata(&self, aggregate_id: &str) -> RecordMetadata;
}

/// No default metadata.
#[derive(Clone, Copy, Debug, Default)]
pub struct EmptyMetadataSource;

impl MetadataSource for EmptyMetadataSource {
    fn metadata(&self, _aggregate_id: &str) -> RecordMetadata {
        RecordMetadata::new()
    }
}

/// Adds the aggregate id under [`AGGREGATE_ID_KEY`].
#[derive(Clone, Copy, Debug, Default)]
pub struct AggregateIdMetadataSource;

impl MetadataSource for AggregateIdMetadataSource {
    fn metadata(&self, aggregate_id: &str) -> RecordMetadata {
        let mut metadata = RecordMetadata::new();
        metadata.insert(
            AGGREGATE_ID_KEY.to_string(),
            Value::String(aggregate_id.to_string()),
        );
        metadata
    }
}

/// Merges several sources; later sources win on key collisions.
#[derive(Clone, Default)]
pub struct CompositeMetadataSource {
    sources: Vec<Arc<dyn MetadataSource>>,
}

impl CompositeMetadataSource {
    /// Compose `sources` in order.
    #[must_use]
    pub fn new(sources: Vec<Arc<dyn MetadataSource>>) -> Self {
        Self { sources }
    }
}

impl MetadataSource for CompositeMetadataSource {
    fn metadata(&self, aggregate_id: &str) -> RecordMetadata {
        self.sources
            .iter()
            .fold(RecordMetadata::new(), |mut merged, source| {
                merged.extend(source.metadata(aggregate_id));
                merged
            })
    }
}

/// Merge per-event metadata over defaults; per-event values win.
#[must_use]
pub fn merge_metadata(defaults: &RecordMetadata, per_event: &RecordMetadata) -> RecordMetadata {
    let mut merged = defaults.clone();
    merged.extend(per_event.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}
