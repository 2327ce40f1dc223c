//! W3C trace context carried in record metadata.
//!
//! Code that appends records stores the `traceparent` and `tracestate` of the
//! current span in the record metadata, either through
//! [`TracingMetadataSource`] or [`inject_trace_context`].
//! [`TracingExtension`](crate::extension::TracingExtension) parents the
//! handler span on the stored context when the record is delivered, so a
//! trace follows an event from the writer to every consumer.
//!
//! Spans only carry a context when the host application installs a
//! `tracing-opentelemetry` layer. Without one nothing is written and
//! nothing is extracted.

use eventstore_tools_core::metadata::MetadataSource;
use eventstore_tools_core::record::RecordMetadata;
use opentelemetry::Context;
use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
use opentelemetry::trace::TraceContextExt;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use serde_json::Value;
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// Metadata key of the W3C `traceparent` value.
pub const TRACEPARENT_KEY: &str = "traceparent";

struct MetadataInjector<'a>(&'a mut RecordMetadata);

impl Injector for MetadataInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key.to_string(), Value::String(value));
    }
}

struct MetadataExtractor<'a>(&'a RecordMetadata);

impl Extractor for MetadataExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }
}

/// Write the trace context of `span` into `metadata`.
pub fn inject_trace_context(span: &Span, metadata: &mut RecordMetadata) {
    let context = span.context();
    TraceContextPropagator::new().inject_context(&context, &mut MetadataInjector(metadata));
}

/// Trace context stored in `metadata`, if any.
#[must_use]
pub fn extract_trace_context(metadata: &RecordMetadata) -> Option<Context> {
    let context = TraceContextPropagator::new().extract(&MetadataExtractor(metadata));
    let valid = context.span().span_context().is_valid();
    if valid { Some(context) } else { None }
}

/// Adds the trace context of the current span to event metadata.
///
/// Compose it with other sources through
/// [`CompositeMetadataSource`](eventstore_tools_core::metadata::CompositeMetadataSource).
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingMetadataSource;

impl MetadataSource for TracingMetadataSource {
    fn metadata(&self, _aggregate_id: &str) -> RecordMetadata {
        let mut metadata = RecordMetadata::new();
        inject_trace_context(&Span::current(), &mut metadata);
        metadata
    }
}
