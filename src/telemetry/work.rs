//! Delivery execution span helpers.

use tracing::Span;

use crate::broker::Delivery;
use crate::model::State;

/// Start a span covering one delivery, from fetch to ack.
///
/// `work.kind` and `work.disposition` are declared empty: the kind is only
/// known after the fetch, the disposition at the end.
pub fn start_delivery_span(delivery: &Delivery) -> Span {
    tracing::info_span!(
        "work.deliver",
        "work.id" = %delivery.work_id,
        "work.msg_id" = delivery.msg_id.0,
        "work.read_count" = delivery.read_count,
        "work.kind" = tracing::field::Empty,
        "work.disposition" = tracing::field::Empty,
    )
}

pub fn record_kind(span: &Span, kind: &str) {
    span.record("work.kind", kind);
}

pub fn record_disposition(span: &Span, disposition: &str) {
    span.record("work.disposition", disposition);
}

/// Emit a state transition event scoped to the given span.
pub fn record_state_transition(span: &Span, from: State, to: State) {
    span.in_scope(|| {
        tracing::info!(from = from.as_str(), to = to.as_str(), "state_transition");
    });
}
