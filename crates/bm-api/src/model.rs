//! Response bodies

use bm_common::QueueIdentity;
use bm_discovery::JobCounts;
use serde::Serialize;
use utoipa::ToSchema;

/// Simple health response
#[derive(Debug, Serialize, ToSchema)]
pub struct SimpleHealthResponse {
    /// Health status: UP
    pub status: String,
    /// Application version
    pub version: String,
}

/// Kubernetes probe response
#[derive(Debug, Serialize, ToSchema)]
pub struct ProbeResponse {
    /// Probe status: LIVE, READY, NOT_READY
    pub status: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct VersionResponse {
    pub version: String,
}

/// Latest job counts read by the metrics collector
#[derive(Debug, Clone, Copy, Serialize, ToSchema)]
pub struct JobCountsResponse {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
}

impl From<JobCounts> for JobCountsResponse {
    fn from(counts: JobCounts) -> Self {
        Self {
            waiting: counts.waiting,
            active: counts.active,
            completed: counts.completed,
            failed: counts.failed,
            delayed: counts.delayed,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct QueueResponse {
    pub prefix: String,
    pub name: String,
    /// Absent until the collector has read the queue once
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counts: Option<JobCountsResponse>,
}

impl QueueResponse {
    pub fn new(identity: QueueIdentity, counts: Option<JobCounts>) -> Self {
        Self {
            prefix: identity.prefix,
            name: identity.name,
            counts: counts.map(JobCountsResponse::from),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct QueueListResponse {
    pub total: usize,
    pub queues: Vec<QueueResponse>,
}
