//! Pipeline metrics
//!
//! Recorded through the `metrics` facade. The library never installs a
//! recorder; the host application decides which exporter (if any) to use.

use crate::circuit_breaker::CircuitState;
use crate::event::EventKind;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Register metric descriptions (safe to call more than once)
pub fn describe_metrics() {
    describe_counter!(
        "faultline_events_captured_total",
        "Events accepted into the buffer"
    );
    describe_counter!(
        "faultline_events_dropped_total",
        "Events dropped before reaching durable storage"
    );
    describe_counter!(
        "faultline_items_persisted_total",
        "Buffered items written to durable storage"
    );
    describe_counter!(
        "faultline_persist_failures_total",
        "Buffered items that failed durable storage"
    );
    describe_counter!(
        "faultline_alerts_total",
        "Alert attempts by outcome"
    );
    describe_gauge!(
        "faultline_circuit_state",
        "Buffer circuit breaker state (0 closed, 1 half-open, 2 open)"
    );
    describe_histogram!(
        "faultline_persist_cycle_seconds",
        "Duration of one persister cycle in seconds"
    );
}

pub fn record_captured(kind: EventKind) {
    counter!("faultline_events_captured_total", "kind" => kind.as_str()).increment(1);
}

/// Record dropped events; `reason` is one of circuit_open, overflow,
/// filtered, malformed, write_failed
pub fn record_dropped(kind: EventKind, reason: &'static str, count: u64) {
    counter!(
        "faultline_events_dropped_total",
        "kind" => kind.as_str(),
        "reason" => reason,
    )
    .increment(count);
}

pub fn record_persisted(kind: EventKind) {
    counter!("faultline_items_persisted_total", "kind" => kind.as_str()).increment(1);
}

pub fn record_persist_failure(kind: EventKind) {
    counter!("faultline_persist_failures_total", "kind" => kind.as_str()).increment(1);
}

pub fn record_alert(outcome: &'static str) {
    counter!("faultline_alerts_total", "outcome" => outcome).increment(1);
}

pub fn set_circuit_state(state: CircuitState) {
    let value = match state {
        CircuitState::Closed => 0.0,
        CircuitState::HalfOpen => 1.0,
        CircuitState::Open => 2.0,
    };
    gauge!("faultline_circuit_state").set(value);
}

pub fn record_cycle_duration(duration: Duration) {
    histogram!("faultline_persist_cycle_seconds").record(duration.as_secs_f64());
}
