//! Bounce span helpers.
//!
//! Every worker pass over a service instance runs inside a `deployd.bounce`
//! span so executor logs and the outcome land in the same trace.

use std::time::Duration;

use tracing::Span;

/// Start a span for one worker pass over a service instance.
///
/// `bounce.status` and `bounce.retry_after_secs` are declared empty and
/// filled in by [`record_bounce_outcome`].
pub fn start_bounce_span(service: &str, instance: &str, worker: &str) -> Span {
    tracing::info_span!(
        "deployd.bounce",
        "service" = service,
        "instance" = instance,
        "worker" = worker,
        "bounce.status" = tracing::field::Empty,
        "bounce.retry_after_secs" = tracing::field::Empty,
    )
}

/// Record the executor's verdict on the bounce span.
pub fn record_bounce_outcome(span: &Span, status: i32, retry_after: Option<Duration>) {
    span.record("bounce.status", status);
    if let Some(retry_after) = retry_after {
        span.record("bounce.retry_after_secs", retry_after.as_secs_f64());
    }
    span.in_scope(|| {
        tracing::debug!(status, ?retry_after, "bounce_outcome");
    });
}
