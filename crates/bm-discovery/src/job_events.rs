//! Job lifecycle events
//!
//! BullMQ appends one entry per job transition to the queue's `{prefix}:{name}:events`
//! stream. Each entry carries an `event` field naming the transition and the
//! `jobId`; failures add `failedReason`. The job itself lives in the hash
//! `{prefix}:{name}:{jobId}` until the queue's retention removes it.

use std::collections::HashMap;
use std::fmt;

/// Stream id meaning "only entries appended from now on"
pub const STREAM_TAIL: &str = "$";

/// Suffix of the per-queue event stream key
pub const EVENTS_KEY_SUFFIX: &str = "events";

/// Transitions counted by the job metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobEventKind {
    Active,
    Waiting,
    Delayed,
    Completed,
    Failed,
    Stalled,
}

impl JobEventKind {
    /// `None` for stream events without a job metric (`added`, `progress`, `drained`, ...)
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(JobEventKind::Active),
            "waiting" => Some(JobEventKind::Waiting),
            "delayed" => Some(JobEventKind::Delayed),
            "completed" => Some(JobEventKind::Completed),
            "failed" => Some(JobEventKind::Failed),
            "stalled" => Some(JobEventKind::Stalled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobEventKind::Active => "active",
            JobEventKind::Waiting => "waiting",
            JobEventKind::Delayed => "delayed",
            JobEventKind::Completed => "completed",
            JobEventKind::Failed => "failed",
            JobEventKind::Stalled => "stalled",
        }
    }

    /// Completed and failed jobs have run to an end and carry timings
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobEventKind::Completed | JobEventKind::Failed)
    }
}

impl fmt::Display for JobEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a queue's event stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobEvent {
    pub stream_id: String,
    pub kind: JobEventKind,
    pub job_id: String,
    pub failed_reason: Option<String>,
}

impl JobEvent {
    /// Build an event from a stream entry's fields.
    ///
    /// Returns `None` for kinds without a job metric and for entries missing a job id.
    pub fn from_fields(stream_id: &str, fields: &HashMap<String, String>) -> Option<Self> {
        let kind = JobEventKind::parse(fields.get("event")?)?;
        let job_id = fields.get("jobId").filter(|id| !id.is_empty())?;

        Some(Self {
            stream_id: stream_id.to_string(),
            kind,
            job_id: job_id.clone(),
            failed_reason: fields.get("failedReason").cloned(),
        })
    }
}

/// Result of one stream read
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobEventBatch {
    /// Id of the last entry read, counted or not; the next read starts after it
    pub last_id: Option<String>,
    pub events: Vec<JobEvent>,
}

/// The fields of a job hash the metrics need
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobRecord {
    pub name: String,
    /// Creation time, epoch millis
    pub timestamp: Option<u64>,
    pub processed_on: Option<u64>,
    pub finished_on: Option<u64>,
    pub attempts_made: u64,
    pub failed_reason: Option<String>,
}

impl JobRecord {
    /// Parse a job hash; `None` when the hash is gone.
    ///
    /// Newer BullMQ versions store the attempt count as `atm`, older ones as
    /// `attemptsMade`.
    pub fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        if fields.is_empty() {
            return None;
        }
        let number = |key: &str| fields.get(key).and_then(|v| v.parse::<u64>().ok());

        Some(Self {
            name: fields.get("name").cloned().unwrap_or_default(),
            timestamp: number("timestamp"),
            processed_on: number("processedOn"),
            finished_on: number("finishedOn"),
            attempts_made: number("atm").or_else(|| number("attemptsMade")).unwrap_or(0),
            failed_reason: fields.get("failedReason").cloned(),
        })
    }

    /// Time spent processing, once the job has finished
    pub fn duration_ms(&self) -> Option<u64> {
        Some(self.finished_on?.saturating_sub(self.processed_on?))
    }

    /// Time between creation and the start of processing
    pub fn wait_ms(&self) -> Option<u64> {
        Some(self.processed_on?.saturating_sub(self.timestamp?))
    }
}
