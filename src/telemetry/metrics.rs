//! Metric instrument factories for projectq.
//!
//! Instruments come from the `"projectq"` meter on the globally-registered
//! `MeterProvider`. Without an OTLP endpoint the global provider is a no-op,
//! so recording is always safe.

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Histogram, Meter};

use crate::model::State;

fn meter() -> Meter {
    opentelemetry::global::meter("projectq")
}

/// Counter: submissions.
/// Labels: `kind`, `result` ("ok" | "not_enqueued" | "rejected").
pub fn work_submitted() -> Counter<u64> {
    meter()
        .u64_counter("projectq.work.submitted")
        .with_description("Number of work items submitted")
        .build()
}

/// Counter: persisted state transitions.
/// Labels: `from`, `to`.
pub fn work_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("projectq.work.state_transitions")
        .with_description("Number of work item state transitions")
        .build()
}

pub fn transition_labels(from: State, to: State) -> [KeyValue; 2] {
    [
        KeyValue::new("from", from.as_str()),
        KeyValue::new("to", to.as_str()),
    ]
}

/// Counter: queue-level operations.
/// Labels: `queue`, `operation` ("send" | "read" | "read_empty" | "archive" | "requeue" | "delete").
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("projectq.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: handled deliveries.
/// Labels: `disposition`.
pub fn deliveries() -> Counter<u64> {
    meter()
        .u64_counter("projectq.work.deliveries")
        .with_description("Deliveries handled by the executor, by outcome")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("projectq.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
