//! Queue handles
//!
//! A [`QueueHandle`] owns the two live clients bound to one queue identity: the
//! queue client used to read the queue's state and jobs, and the support client,
//! a dedicated named connection kept alive with PINGs that also reads the
//! queue's event stream. Blocking stream reads get their own connection so they
//! never stall the shared one. The support client does no scheduling work; its
//! fault only evicts the handle. Handles are created by a [`HandleFactory`]
//! during Add and closed exactly once during Remove.

use async_trait::async_trait;
use bm_common::QueueIdentity;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{DiscoveryError, Result};
use crate::job_events::{JobEventBatch, JobRecord};

/// Job counts per queue state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
}

/// A client bound to one queue that can fail and be closed
#[async_trait]
pub trait ManagedClient: Send + Sync {
    /// Release the client's resources
    async fn close(&self) -> Result<()>;

    /// Resolves with a reason once the client hits an unrecoverable error or
    /// loses its connection. Never resolves for a healthy client.
    async fn faulted(&self) -> String;
}

/// Reads a queue's state
#[async_trait]
pub trait QueueClient: ManagedClient {
    async fn job_counts(&self) -> Result<JobCounts>;

    /// The job hash for `job_id`, or `None` once retention removed it
    async fn job(&self, job_id: &str) -> Result<Option<JobRecord>>;
}

/// Reads a queue's event stream
#[async_trait]
pub trait EventStreamClient: ManagedClient {
    /// Up to `count` entries after `after`, waiting at most `block` for the first
    async fn read_events(&self, after: &str, block: Duration, count: usize) -> Result<JobEventBatch>;
}

/// Builds the clients for a newly discovered queue
#[async_trait]
pub trait HandleFactory: Send + Sync {
    async fn create(&self, identity: &QueueIdentity) -> Result<QueueHandle>;
}

pub struct QueueHandle {
    identity: QueueIdentity,
    queue: Arc<dyn QueueClient>,
    support: Arc<dyn EventStreamClient>,
    closed: AtomicBool,
}

impl QueueHandle {
    pub fn new(
        identity: QueueIdentity,
        queue: Arc<dyn QueueClient>,
        support: Arc<dyn EventStreamClient>,
    ) -> Self {
        Self {
            identity,
            queue,
            support,
            closed: AtomicBool::new(false),
        }
    }

    pub fn identity(&self) -> &QueueIdentity {
        &self.identity
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn job_counts(&self) -> Result<JobCounts> {
        if self.is_closed() {
            return Err(DiscoveryError::handle(&self.identity, "handle is closed"));
        }
        self.queue.job_counts().await
    }

    pub async fn job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        if self.is_closed() {
            return Err(DiscoveryError::handle(&self.identity, "handle is closed"));
        }
        self.queue.job(job_id).await
    }

    pub async fn read_events(&self, after: &str, block: Duration, count: usize) -> Result<JobEventBatch> {
        if self.is_closed() {
            return Err(DiscoveryError::handle(&self.identity, "handle is closed"));
        }
        self.support.read_events(after, block, count).await
    }

    /// Close both clients. Close errors are logged and swallowed; calls after
    /// the first do nothing.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Err(e) = self.queue.close().await {
            warn!(queue = %self.identity, error = %e, "Failed to close queue client");
        }
        if let Err(e) = self.support.close().await {
            warn!(queue = %self.identity, error = %e, "Failed to close support client");
        }
        debug!(queue = %self.identity, "Queue handle closed");
    }

    /// Resolves with the reason once either client faults
    pub async fn faulted(&self) -> String {
        tokio::select! {
            reason = self.queue.faulted() => format!("queue client: {}", reason),
            reason = self.support.faulted() => format!("support client: {}", reason),
        }
    }
}

impl fmt::Debug for QueueHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueHandle")
            .field("identity", &self.identity)
            .field("closed", &self.is_closed())
            .finish()
    }
}
