//! Error types for the discovery engine

use bm_common::QueueIdentity;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Timed out after {timeout:?} waiting for the {guard} guard")]
    LockTimeout { guard: &'static str, timeout: Duration },

    #[error("Redis operation error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("Queue handle error for {identity}: {reason}")]
    Handle { identity: QueueIdentity, reason: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Discovery engine is shutting down")]
    ShuttingDown,
}

impl DiscoveryError {
    pub fn handle(identity: &QueueIdentity, reason: impl Into<String>) -> Self {
        Self::Handle {
            identity: identity.clone(),
            reason: reason.into(),
        }
    }

    /// Errors confined to a single queue; a scan keeps going past them
    pub fn is_queue_scoped(&self) -> bool {
        matches!(self, Self::Handle { .. } | Self::Redis(_))
    }
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;
