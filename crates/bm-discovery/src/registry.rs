//! Queue registry: the serialized Add/Remove operations over the inventory
//!
//! Every membership change goes through the mutation guard, so notification
//! handling, reconciliation and fault-driven removal are totally ordered.
//! The inventory lock itself is only ever held for a map operation.
//!
//! Each entry carries a generation number. A fault watcher captures the
//! generation of the handle it watches, so a late fault can only evict that
//! handle and never a newer one admitted for the same identity.

use bm_common::QueueIdentity;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::engine_metrics;
use crate::error::{DiscoveryError, Result};
use crate::events::{DiscoveryEvent, EventPublisher};
use crate::guard::ConcurrencyGuard;
use crate::handle::{HandleFactory, QueueHandle};
use crate::inventory::{Inventory, InventoryEntry};

/// Why an entry left the inventory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    Notification,
    Pruned,
    Fault,
    Shutdown,
}

impl RemovalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemovalReason::Notification => "notification",
            RemovalReason::Pruned => "pruned",
            RemovalReason::Fault => "fault",
            RemovalReason::Shutdown => "shutdown",
        }
    }
}

pub struct QueueRegistry {
    factory: Arc<dyn HandleFactory>,
    inventory: RwLock<Inventory>,
    guard: ConcurrencyGuard,
    events: EventPublisher,
    next_generation: AtomicU64,
    closing: AtomicBool,
    weak_self: Weak<Self>,
}

impl QueueRegistry {
    pub fn new(
        factory: Arc<dyn HandleFactory>,
        guard: ConcurrencyGuard,
        events: EventPublisher,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            factory,
            inventory: RwLock::new(Inventory::new()),
            guard,
            events,
            next_generation: AtomicU64::new(0),
            closing: AtomicBool::new(false),
            weak_self: weak_self.clone(),
        })
    }

    pub fn events(&self) -> &EventPublisher {
        &self.events
    }

    pub fn contains(&self, identity: &QueueIdentity) -> bool {
        self.inventory.read().has(identity)
    }

    pub fn get(&self, identity: &QueueIdentity) -> Option<Arc<QueueHandle>> {
        self.inventory.read().get(identity)
    }

    pub fn keys(&self) -> HashSet<QueueIdentity> {
        self.inventory.read().keys()
    }

    /// Identities sorted by prefix then name
    pub fn sorted_keys(&self) -> Vec<QueueIdentity> {
        let mut keys: Vec<_> = self.keys().into_iter().collect();
        keys.sort();
        keys
    }

    pub fn handles(&self) -> Vec<Arc<QueueHandle>> {
        self.inventory.read().handles()
    }

    pub fn len(&self) -> usize {
        self.inventory.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inventory.read().is_empty()
    }

    /// Admit `identity` unless already present.
    ///
    /// Returns whether a new entry was created. A `QueueCreated` event is
    /// published exactly once per admitted entry.
    pub async fn add(&self, identity: &QueueIdentity) -> Result<bool> {
        self.guard.run_exclusive(|| self.add_locked(identity)).await
    }

    /// Evict `identity` if present, returning whether an entry was removed
    pub async fn remove(&self, identity: &QueueIdentity, reason: RemovalReason) -> Result<bool> {
        self.guard
            .run_exclusive(|| self.remove_locked(identity, None, reason))
            .await
    }

    /// Evict `identity` only if its entry still has `generation`
    pub async fn remove_generation(&self, identity: &QueueIdentity, generation: u64) -> Result<bool> {
        self.guard
            .run_exclusive(|| self.remove_locked(identity, Some(generation), RemovalReason::Fault))
            .await
    }

    /// Refuse further Adds and evict every entry.
    ///
    /// Returns how many entries were removed. Individual failures are logged
    /// and the remaining entries are still processed.
    pub async fn remove_all(&self) -> usize {
        self.closing.store(true, Ordering::SeqCst);

        let mut removed = 0;
        for identity in self.sorted_keys() {
            match self.remove(&identity, RemovalReason::Shutdown).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(queue = %identity, error = %e, "Failed to remove queue during shutdown");
                }
            }
        }
        removed
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    async fn add_locked(&self, identity: &QueueIdentity) -> Result<bool> {
        if self.inventory.read().has(identity) {
            debug!(queue = %identity, "Queue already monitored");
            return Ok(false);
        }
        if self.is_closing() {
            return Err(DiscoveryError::ShuttingDown);
        }

        info!(queue_prefix = %identity.prefix, queue_name = %identity.name, "Adding queue");

        let handle = Arc::new(self.factory.create(identity).await?);
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let watcher = self.spawn_fault_watcher(identity.clone(), handle.clone(), generation);

        let size = {
            let mut inventory = self.inventory.write();
            inventory.put(identity, InventoryEntry::new(handle.clone(), generation).with_watcher(watcher));
            inventory.len()
        };

        engine_metrics::record_queue_created(&identity.prefix);
        engine_metrics::set_queues_monitored(size);

        self.events.publish(DiscoveryEvent::QueueCreated {
            identity: identity.clone(),
            handle,
        });
        Ok(true)
    }

    async fn remove_locked(
        &self,
        identity: &QueueIdentity,
        generation: Option<u64>,
        reason: RemovalReason,
    ) -> Result<bool> {
        let handle = {
            let inventory = self.inventory.read();
            match inventory.entry(identity) {
                Some(entry) if generation.map_or(true, |g| g == entry.generation()) => {
                    entry.stop_watcher();
                    entry.handle().clone()
                }
                Some(entry) => {
                    debug!(
                        queue = %identity,
                        stale_generation = ?generation,
                        current_generation = entry.generation(),
                        "Ignoring removal for a replaced handle"
                    );
                    return Ok(false);
                }
                None => return Ok(false),
            }
        };

        info!(
            queue_prefix = %identity.prefix,
            queue_name = %identity.name,
            reason = reason.as_str(),
            "Removing queue"
        );

        self.events.publish(DiscoveryEvent::QueueRemoved {
            identity: identity.clone(),
        });

        handle.close().await;

        let size = {
            let mut inventory = self.inventory.write();
            inventory.remove(identity);
            inventory.len()
        };

        engine_metrics::record_queue_removed(&identity.prefix, reason.as_str());
        engine_metrics::set_queues_monitored(size);
        Ok(true)
    }

    /// Watch the handle's clients; on a fault, evict this generation.
    ///
    /// The eviction runs on its own task: Remove aborts the watcher, which must
    /// not cancel the eviction in progress.
    fn spawn_fault_watcher(
        &self,
        identity: QueueIdentity,
        handle: Arc<QueueHandle>,
        generation: u64,
    ) -> JoinHandle<()> {
        let registry = self.weak_self.clone();
        tokio::spawn(async move {
            let reason = handle.faulted().await;
            drop(handle);

            let Some(registry) = registry.upgrade() else {
                return;
            };
            warn!(queue = %identity, generation, reason = %reason, "Queue client faulted, removing queue");

            tokio::spawn(async move {
                if let Err(e) = registry.remove_generation(&identity, generation).await {
                    error!(queue = %identity, error = %e, "Failed to remove faulted queue");
                }
            });
        })
    }
}
