//! Integration tests for telemetry initialization, span helpers and metrics.

use chrono::Utc;
use opentelemetry::KeyValue;
use projectq::broker::{Delivery, MessageId};
use projectq::model::{State, WorkId};
use projectq::telemetry::{TelemetryConfig, TelemetryGuard, init_telemetry, metrics, work};

#[test]
fn telemetry_initializes_without_endpoint() {
    // The global subscriber can only be set once per process; a second
    // init in the same binary returns Err, which is acceptable here.
    let config = TelemetryConfig {
        service_name: "projectq-test".to_string(),
        ..TelemetryConfig::default()
    };
    if let Ok(guard) = init_telemetry(config) {
        assert!(!guard.is_exporting());
        guard.force_flush();
    }
}

#[test]
fn default_guard_is_inert() {
    let guard = TelemetryGuard::default();
    assert!(!guard.is_exporting());
    guard.force_flush();
}

#[test]
fn delivery_span_records_kind_disposition_and_transitions() {
    let delivery = Delivery {
        msg_id: MessageId(7),
        work_id: WorkId::new(),
        read_count: 2,
        enqueued_at: Utc::now(),
        visible_until: Utc::now(),
    };
    let span = work::start_delivery_span(&delivery);
    work::record_kind(&span, "project");
    work::record_state_transition(&span, State::Created, State::Processing);
    work::record_state_transition(&span, State::Processing, State::Completed);
    work::record_disposition(&span, "completed");
}

#[test]
fn metrics_record_against_noop_provider() {
    metrics::work_submitted().add(
        1,
        &[
            KeyValue::new("kind", "project"),
            KeyValue::new("result", "ok"),
        ],
    );
    metrics::work_state_transitions()
        .add(1, &metrics::transition_labels(State::Created, State::Processing));
    metrics::queue_operations().add(1, &[KeyValue::new("operation", "send")]);
    metrics::deliveries().add(1, &[KeyValue::new("disposition", "completed")]);
    metrics::operation_duration_ms().record(1.5, &[KeyValue::new("operation", "work.perform")]);
}

#[test]
fn transition_labels_use_wire_names() {
    let labels = metrics::transition_labels(State::Processing, State::Error);
    assert_eq!(labels[0], KeyValue::new("from", "PROCESSING"));
    assert_eq!(labels[1], KeyValue::new("to", "ERROR"));
}
