//! Engine lifecycle events
//!
//! Downstream consumers (metrics collectors, dashboards) subscribe to a
//! broadcast of [`DiscoveryEvent`]s. Publishing never blocks and never fails;
//! a slow consumer lags and is told how many events it missed.

use bm_common::QueueIdentity;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

use crate::handle::QueueHandle;

pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// A new identity was admitted to the inventory
    QueueCreated {
        identity: QueueIdentity,
        handle: Arc<QueueHandle>,
    },
    /// An identity was evicted; published before its handle is closed
    QueueRemoved { identity: QueueIdentity },
    /// A reconciliation completed
    ServiceReady,
    /// Engine shutdown completed
    ServiceClosed,
}

impl DiscoveryEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DiscoveryEvent::QueueCreated { .. } => "queue_created",
            DiscoveryEvent::QueueRemoved { .. } => "queue_removed",
            DiscoveryEvent::ServiceReady => "service_ready",
            DiscoveryEvent::ServiceClosed => "service_closed",
        }
    }

    pub fn identity(&self) -> Option<&QueueIdentity> {
        match self {
            DiscoveryEvent::QueueCreated { identity, .. } | DiscoveryEvent::QueueRemoved { identity } => {
                Some(identity)
            }
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct EventPublisher {
    tx: broadcast::Sender<DiscoveryEvent>,
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish to every current subscriber, returning how many received it
    pub fn publish(&self, event: DiscoveryEvent) -> usize {
        let name = event.name();
        let receivers = self.tx.send(event).unwrap_or(0);
        trace!(event = name, receivers, "Published discovery event");
        receivers
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
