//! Metric instrument factories for workdispatch.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"workdispatch"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for workdispatch instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("workdispatch")
}

/// Counter: work items written to the queue.
/// Labels: `category`, `result` ("ok" | "transport_failed").
pub fn work_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("workdispatch.work.enqueued")
        .with_description("Number of work items enqueued")
        .build()
}

/// Counter: dequeued transport entries by outcome.
/// Labels: `category`, `outcome` ("returned" | "stale" | "status_mismatch").
pub fn work_dequeued() -> Counter<u64> {
    meter()
        .u64_counter("workdispatch.work.dequeued")
        .with_description("Number of transport entries dequeued, by outcome")
        .build()
}

/// Counter: work item state transitions.
/// Labels: `from`, `to`.
pub fn work_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("workdispatch.work.state_transitions")
        .with_description("Number of work item state transitions")
        .build()
}

/// Counter: transport-level operations (enqueue, dequeue, delete, create).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("workdispatch.queue.operations")
        .with_description("Number of transport queue operations")
        .build()
}

/// Counter: records touched by retention cleanup.
/// Labels: `action` ("archived" | "removed" | "error").
pub fn cleanup_items() -> Counter<u64> {
    meter()
        .u64_counter("workdispatch.cleanup.items")
        .with_description("Work item records handled by retention cleanup")
        .build()
}

/// Counter: loop-level warnings absorbed by the processor.
pub fn processor_warnings() -> Counter<u64> {
    meter()
        .u64_counter("workdispatch.processor.warnings")
        .with_description("Errors absorbed by the processor loop")
        .build()
}

/// Histogram: processing duration in milliseconds.
/// Labels: `category`, `status`.
pub fn processing_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("workdispatch.work.processing_duration_ms")
        .with_description("Time spent in the work item processor")
        .with_unit("ms")
        .build()
}
