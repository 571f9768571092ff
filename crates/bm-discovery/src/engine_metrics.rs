//! Metrics for the discovery engine
//!
//! Provides Prometheus-compatible metrics for:
//! - Inventory size and churn
//! - Reconciliation outcomes and latency
//! - Service readiness

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Update the number of queues in the inventory
pub fn set_queues_monitored(count: usize) {
    gauge!("bm_queues_monitored").set(count as f64);
}

/// Record a queue admitted to the inventory
pub fn record_queue_created(prefix: &str) {
    counter!(
        "bm_queues_created_total",
        "queue_prefix" => prefix.to_string()
    )
    .increment(1);
}

/// Record a queue evicted from the inventory
pub fn record_queue_removed(prefix: &str, reason: &str) {
    counter!(
        "bm_queues_removed_total",
        "queue_prefix" => prefix.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record a finished reconciliation; `result` is `success`, `partial` or `failure`
pub fn record_reconciliation(trigger: &str, result: &str, duration: Duration) {
    counter!(
        "bm_reconciliations_total",
        "trigger" => trigger.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
    histogram!("bm_reconciliation_duration_seconds").record(duration.as_secs_f64());
}

/// Record a notification message that changed the inventory
pub fn record_notification(verb: &str) {
    counter!(
        "bm_notifications_total",
        "verb" => verb.to_string()
    )
    .increment(1);
}

/// Update the service readiness gauge
pub fn set_service_ready(ready: bool) {
    gauge!("bm_service_ready").set(if ready { 1.0 } else { 0.0 });
}

/// Record a connection state transition
pub fn record_connection_state(connection: &str, state: &str) {
    counter!(
        "bm_connection_state_changes_total",
        "connection" => connection.to_string(),
        "state" => state.to_string()
    )
    .increment(1);
}
