//! Prometheus metric recording for the hub
//!
//! Thin wrappers over the `metrics` facade so metric names and labels live
//! in one place. Exported by the API's Prometheus recorder.

use std::time::Duration;

use hub_common::{DeadLetterReason, Priority};

use crate::circuit_breaker_registry::CircuitBreakerState;

pub fn record_message_accepted(kind: &'static str) {
    metrics::counter!("hub_messages_total", "status" => "accepted", "kind" => kind).increment(1);
}

pub fn record_message_delivered() {
    metrics::counter!("hub_messages_total", "status" => "delivered", "kind" => "delivery").increment(1);
}

pub fn record_event_appended(count: usize) {
    metrics::counter!("hub_events_total").increment(count as u64);
}

pub fn record_retry(destination: &str) {
    metrics::counter!("hub_retries_total", "destination" => destination.to_string()).increment(1);
}

pub fn record_dead_letter(reason: DeadLetterReason) {
    metrics::counter!("hub_dead_letters_total", "reason" => reason.code()).increment(1);
}

pub fn record_circuit_transition(destination: &str, from: CircuitBreakerState, to: CircuitBreakerState) {
    metrics::counter!(
        "hub_circuit_transitions_total",
        "destination" => destination.to_string(),
        "from" => from.as_str(),
        "to" => to.as_str()
    )
    .increment(1);
}

pub fn set_queue_depth(priority: Priority, depth: usize) {
    metrics::gauge!("hub_queue_depth", "priority" => priority.as_str()).set(depth as f64);
}

pub fn record_delivery(destination: &str, duration: Duration, success: bool) {
    metrics::histogram!(
        "hub_delivery_duration_seconds",
        "destination" => destination.to_string(),
        "result" => if success { "success" } else { "failure" }
    )
    .record(duration.as_secs_f64());
}

pub fn record_transaction(outcome: &'static str) {
    metrics::counter!("hub_transactions_total", "outcome" => outcome).increment(1);
}
