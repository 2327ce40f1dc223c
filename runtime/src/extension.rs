//! Per-method extensions.
//!
//! An extension wraps every invocation of a handler method, retries
//! included. Extensions are listed outermost first and composed with a fold;
//! each receives the rest of the chain as `next` and must await it at most
//! once.

use crate::trace_context::extract_trace_context;
use eventstore_tools_core::BoxError;
use eventstore_tools_core::record::StreamRecord;
use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::Instrument;
use tracing::field::{Empty, display};
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// Future of one method invocation.
pub type MethodFuture<'a> = BoxFuture<'a, Result<(), BoxError>>;

/// What an extension knows about the invocation it wraps.
#[derive(Debug, Clone, Copy)]
pub struct MethodContext<'a> {
    /// Handler name.
    pub handler: &'a str,
    /// Method name, as registered.
    pub method: &'a str,
    /// Record being delivered.
    pub record: &'a StreamRecord,
}

/// Cross-cutting behaviour around a handler method.
pub trait MethodExtension: Send + Sync {
    /// Wrap `next`, the remaining chain.
    fn wrap<'a>(&'a self, ctx: &'a MethodContext<'a>, next: MethodFuture<'a>) -> MethodFuture<'a>;
}

/// Opens a `handle_event` span per invocation and records the error on
/// failure. The span continues the trace stored in the record metadata, see
/// [`crate::trace_context`].
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingExtension;

impl MethodExtension for TracingExtension {
    fn wrap<'a>(&'a self, ctx: &'a MethodContext<'a>, next: MethodFuture<'a>) -> MethodFuture<'a> {
        let span = tracing::info_span!(
            "handle_event",
            handler = ctx.handler,
            method = ctx.method,
            event_type = %ctx.record.event_type,
            event_id = %ctx.record.event_id,
            stream_id = %ctx.record.stream_id,
            sequence = ctx.record.sequence,
            error = Empty,
        );
        if let Some(parent) = extract_trace_context(&ctx.record.metadata_map()) {
            span.set_parent(parent);
        }

        Box::pin(
            async move {
                let result = next.await;
                if let Err(err) = &result {
                    tracing::Span::current().record("error", display(err));
                }
                result
            }
            .instrument(span),
        )
    }
}

/// Logs each invocation with the record payload.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingExtension;

impl MethodExtension for LoggingExtension {
    fn wrap<'a>(&'a self, ctx: &'a MethodContext<'a>, next: MethodFuture<'a>) -> MethodFuture<'a> {
        Box::pin(async move {
            let record = ctx.record;
            let payload = String::from_utf8_lossy(&record.data);
            tracing::info!(
                handler = ctx.handler,
                method = ctx.method,
                "Handling {} event: {}",
                record.event_type,
                payload
            );

            let result = next.await;
            if let Err(err) = &result {
                tracing::warn!(
                    handler = ctx.handler,
                    method = ctx.method,
                    event_id = %record.event_id,
                    event_type = %record.event_type,
                    stream_id = %record.stream_id,
                    data = %payload,
                    error = %err,
                    "Handler method failed"
                );
            }
            result
        })
    }
}

/// Wrap `inner` in `extensions`, the first one outermost.
pub fn apply_extensions<'a>(
    extensions: &'a [Arc<dyn MethodExtension>],
    ctx: &'a MethodContext<'a>,
    inner: MethodFuture<'a>,
) -> MethodFuture<'a> {
    extensions
        .iter()
        .rev()
        .fold(inner, |next, extension| extension.wrap(ctx, next))
}
