//! Job event metrics
//!
//! Counters follow each transition read from a queue's event stream, labelled
//! with the queue and the job name. Jobs that complete or fail also feed the
//! duration, wait and attempt summaries, labelled with the outcome.

use bm_common::{QueueIdentity, UNKNOWN};
use bm_discovery::{JobEvent, JobEventKind, JobRecord};
use metrics::{counter, describe_counter, describe_histogram, histogram, Label, Unit};

pub const JOBS_ACTIVE: &str = "jobs_active";
pub const JOBS_WAITING: &str = "jobs_waiting";
pub const JOBS_COMPLETED: &str = "jobs_completed";
pub const JOBS_FAILED: &str = "jobs_failed";
pub const JOBS_DELAYED: &str = "jobs_delayed";
pub const JOBS_STALLED: &str = "jobs_stalled";
pub const JOB_DURATION: &str = "job_duration";
pub const JOB_WAIT_DURATION: &str = "job_wait_duration";
pub const JOB_ATTEMPTS: &str = "job_attempts";

/// Register help text for the event counters and summaries
pub fn describe_event_metrics() {
    describe_counter!(JOBS_ACTIVE, "Number of active jobs");
    describe_counter!(JOBS_WAITING, "Number of waiting jobs");
    describe_counter!(JOBS_COMPLETED, "Number of completed jobs");
    describe_counter!(JOBS_FAILED, "Number of failed jobs");
    describe_counter!(JOBS_DELAYED, "Number of delayed jobs");
    describe_counter!(JOBS_STALLED, "Number of stalled jobs");
    describe_histogram!(JOB_DURATION, Unit::Milliseconds, "Job duration");
    describe_histogram!(JOB_WAIT_DURATION, Unit::Milliseconds, "Job waiting duration");
    describe_histogram!(JOB_ATTEMPTS, "Job attempts");
}

fn counter_name(kind: JobEventKind) -> &'static str {
    match kind {
        JobEventKind::Active => JOBS_ACTIVE,
        JobEventKind::Waiting => JOBS_WAITING,
        JobEventKind::Completed => JOBS_COMPLETED,
        JobEventKind::Failed => JOBS_FAILED,
        JobEventKind::Delayed => JOBS_DELAYED,
        JobEventKind::Stalled => JOBS_STALLED,
    }
}

/// Count `event` and, for finished jobs, observe the job's timings.
///
/// `job` is `None` when the job hash was removed before it could be read; the
/// event is still counted under an unknown job name.
pub fn record_job_event(identity: &QueueIdentity, event: &JobEvent, job: Option<&JobRecord>) {
    let job_name = job
        .map(|job| job.name.as_str())
        .filter(|name| !name.is_empty())
        .unwrap_or(UNKNOWN)
        .to_string();

    let mut labels = vec![
        Label::new("queue_prefix", identity.prefix.clone()),
        Label::new("queue_name", identity.name.clone()),
        Label::new("job_name", job_name),
    ];
    let mut counter_labels = labels.clone();
    if event.kind == JobEventKind::Failed {
        let fail_type = event.failed_reason.as_deref().unwrap_or(UNKNOWN).to_string();
        counter_labels.push(Label::new("fail_type", fail_type));
    }
    counter!(counter_name(event.kind), counter_labels).increment(1);

    let Some(job) = job else {
        return;
    };
    if !event.kind.is_terminal() || job.finished_on.is_none() {
        return;
    }

    labels.push(Label::new("status", event.kind.as_str()));
    if event.kind == JobEventKind::Failed {
        let fail_type = job
            .failed_reason
            .as_deref()
            .or(event.failed_reason.as_deref())
            .unwrap_or(UNKNOWN)
            .to_string();
        labels.push(Label::new("fail_type", fail_type));
    }

    if let Some(duration) = job.duration_ms() {
        histogram!(JOB_DURATION, labels.clone()).record(duration as f64);
    }
    if let Some(wait) = job.wait_ms() {
        histogram!(JOB_WAIT_DURATION, labels.clone()).record(wait as f64);
    }
    histogram!(JOB_ATTEMPTS, labels).record(job.attempts_made as f64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusBuilder;

    fn event(kind: JobEventKind, failed_reason: Option<&str>) -> JobEvent {
        JobEvent {
            stream_id: "1-0".to_string(),
            kind,
            job_id: "7".to_string(),
            failed_reason: failed_reason.map(str::to_string),
        }
    }

    fn finished_job(name: &str) -> JobRecord {
        JobRecord {
            name: name.to_string(),
            timestamp: Some(1_000),
            processed_on: Some(1_400),
            finished_on: Some(1_650),
            attempts_made: 2,
            failed_reason: None,
        }
    }

    #[test]
    fn test_counts_transitions_per_job_name() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let orders = QueueIdentity::new("bull", "orders");
        let job = JobRecord { name: "resize".to_string(), ..Default::default() };

        metrics::with_local_recorder(&recorder, || {
            record_job_event(&orders, &event(JobEventKind::Active, None), Some(&job));
            record_job_event(&orders, &event(JobEventKind::Active, None), Some(&job));
            record_job_event(&orders, &event(JobEventKind::Stalled, None), None);
        });

        let rendered = handle.render();
        assert!(rendered.contains(r#"jobs_active{queue_prefix="bull",queue_name="orders",job_name="resize"} 2"#));
        assert!(rendered.contains(r#"jobs_stalled{queue_prefix="bull",queue_name="orders",job_name="unknown"} 1"#));
        assert!(!rendered.contains("job_duration"));
    }

    #[test]
    fn test_failed_job_carries_fail_type_and_timings() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let orders = QueueIdentity::new("bull", "orders");
        let job = JobRecord {
            failed_reason: Some("timeout".to_string()),
            ..finished_job("send-email")
        };

        metrics::with_local_recorder(&recorder, || {
            record_job_event(&orders, &event(JobEventKind::Failed, Some("timeout")), Some(&job));
        });

        let rendered = handle.render();
        assert!(rendered.contains(
            r#"jobs_failed{queue_prefix="bull",queue_name="orders",job_name="send-email",fail_type="timeout"} 1"#
        ));
        assert!(rendered.contains(
            r#"job_duration_sum{queue_prefix="bull",queue_name="orders",job_name="send-email",status="failed",fail_type="timeout"} 250"#
        ));
        assert!(rendered.contains(
            r#"job_wait_duration_sum{queue_prefix="bull",queue_name="orders",job_name="send-email",status="failed",fail_type="timeout"} 400"#
        ));
        assert!(rendered.contains(
            r#"job_attempts_sum{queue_prefix="bull",queue_name="orders",job_name="send-email",status="failed",fail_type="timeout"} 2"#
        ));
    }

    #[test]
    fn test_unfinished_jobs_skip_summaries() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let orders = QueueIdentity::new("bull", "orders");
        let running = JobRecord { finished_on: None, ..finished_job("resize") };

        metrics::with_local_recorder(&recorder, || {
            record_job_event(&orders, &event(JobEventKind::Completed, None), Some(&running));
            record_job_event(&orders, &event(JobEventKind::Completed, None), None);
        });

        let rendered = handle.render();
        assert!(rendered.contains(r#"jobs_completed{queue_prefix="bull",queue_name="orders",job_name="resize"} 1"#));
        assert!(rendered.contains(r#"jobs_completed{queue_prefix="bull",queue_name="orders",job_name="unknown"} 1"#));
        assert!(!rendered.contains("job_duration"));
    }
}
