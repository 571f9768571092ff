//! Bull Monitor metrics
//!
//! - [`QueueMetricsCollector`]: per-queue job count gauges and job event
//!   counters fed by discovery events
//! - [`install_recorder`]: Prometheus recorder whose handle renders `/metrics`

pub mod collector;
pub mod event_metrics;
pub mod job_metrics;

pub use collector::{CollectorSettings, QueueMetricsCollector};
pub use metrics_exporter_prometheus::PrometheusHandle;

use metrics_exporter_prometheus::PrometheusBuilder;
use metrics_util::MetricKindMask;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Failed to install Prometheus recorder: {0}")]
    Install(#[from] metrics_exporter_prometheus::BuildError),
}

/// Install the global Prometheus recorder and describe the job metrics.
///
/// Counter and summary series untouched for `series_idle_timeout` are dropped,
/// which is how the series of a removed queue leave the exposition. Gauges are
/// zeroed by the collector instead.
pub fn install_recorder(series_idle_timeout: Option<Duration>) -> Result<PrometheusHandle, MetricsError> {
    let handle = PrometheusBuilder::new()
        .idle_timeout(MetricKindMask::COUNTER | MetricKindMask::HISTOGRAM, series_idle_timeout)
        .install_recorder()?;
    job_metrics::describe_job_metrics();
    event_metrics::describe_event_metrics();
    Ok(handle)
}
