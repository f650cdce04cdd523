//! Work dispatch span helpers.
//!
//! Provides span creation and state-transition recording for work items
//! flowing through the processor.

use tracing::Span;

use crate::model::{Status, WorkId};

/// Start a span for dispatching one work item.
///
/// The `work.status` field is declared empty and is filled by
/// [`record_state_transition`].
pub fn start_work_span(category: &str, work_id: &WorkId) -> Span {
    tracing::info_span!(
        "work.dispatch",
        "work.category" = category,
        "work.id" = %work_id,
        "work.status" = tracing::field::Empty,
    )
}

/// Record a state transition on the span and as a metric.
pub fn record_state_transition(span: &Span, from: Status, to: Status) {
    span.record("work.status", tracing::field::display(to));
    span.in_scope(|| {
        tracing::info!(from = %from, to = %to, "state_transition");
    });
    super::metrics::work_state_transitions().add(
        1,
        &[
            opentelemetry::KeyValue::new("from", from.to_string()),
            opentelemetry::KeyValue::new("to", to.to_string()),
        ],
    );
}
