//! Per-queue job gauges
//!
//! One gauge per job state, labelled with the queue's prefix and name.

use bm_common::QueueIdentity;
use bm_discovery::JobCounts;
use metrics::{describe_gauge, gauge};

pub const JOBS_COMPLETED: &str = "jobs_completed_total";
pub const JOBS_FAILED: &str = "jobs_failed_total";
pub const JOBS_DELAYED: &str = "jobs_delayed_total";
pub const JOBS_ACTIVE: &str = "jobs_active_total";
pub const JOBS_WAITING: &str = "jobs_waiting_total";

/// Register help text for the job gauges with the installed recorder
pub fn describe_job_metrics() {
    describe_gauge!(JOBS_COMPLETED, "Total completed jobs");
    describe_gauge!(JOBS_FAILED, "Total failed jobs");
    describe_gauge!(JOBS_DELAYED, "Total delayed jobs");
    describe_gauge!(JOBS_ACTIVE, "Total active jobs");
    describe_gauge!(JOBS_WAITING, "Total waiting jobs");
}

/// Set every job gauge of `identity` from `counts`
pub fn record_job_counts(identity: &QueueIdentity, counts: &JobCounts) {
    let values = [
        (JOBS_COMPLETED, counts.completed),
        (JOBS_FAILED, counts.failed),
        (JOBS_DELAYED, counts.delayed),
        (JOBS_ACTIVE, counts.active),
        (JOBS_WAITING, counts.waiting),
    ];
    for (name, value) in values {
        gauge!(
            name,
            "queue_prefix" => identity.prefix.clone(),
            "queue_name" => identity.name.clone()
        )
        .set(value as f64);
    }
}

/// Zero the gauges of a queue that left the inventory
pub fn clear_job_counts(identity: &QueueIdentity) {
    record_job_counts(identity, &JobCounts::default());
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusBuilder;

    #[test]
    fn test_gauges_are_labelled_per_queue() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let orders = QueueIdentity::new("bull", "orders");

        metrics::with_local_recorder(&recorder, || {
            record_job_counts(
                &orders,
                &JobCounts {
                    waiting: 3,
                    failed: 1,
                    ..Default::default()
                },
            );
        });

        let rendered = handle.render();
        assert!(rendered.contains(r#"jobs_waiting_total{queue_prefix="bull",queue_name="orders"} 3"#));
        assert!(rendered.contains(r#"jobs_failed_total{queue_prefix="bull",queue_name="orders"} 1"#));
        assert!(rendered.contains(r#"jobs_active_total{queue_prefix="bull",queue_name="orders"} 0"#));
    }

    #[test]
    fn test_clear_zeroes_gauges() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let orders = QueueIdentity::new("bull", "orders");

        metrics::with_local_recorder(&recorder, || {
            record_job_counts(&orders, &JobCounts { delayed: 7, ..Default::default() });
            clear_job_counts(&orders);
        });

        assert!(handle
            .render()
            .contains(r#"jobs_delayed_total{queue_prefix="bull",queue_name="orders"} 0"#));
    }
}
