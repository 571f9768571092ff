//! The queue inventory
//!
//! Passive mapping from composite key (`prefix:::name`) to the live handle for
//! that queue. Holds no locks of its own and never awaits; the registry wraps it
//! and only mutates it while holding the mutation guard.

use bm_common::QueueIdentity;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::handle::QueueHandle;

/// One admitted queue
pub struct InventoryEntry {
    handle: Arc<QueueHandle>,
    /// Distinguishes successive handles for the same identity
    generation: u64,
    watcher: Option<JoinHandle<()>>,
}

impl InventoryEntry {
    pub fn new(handle: Arc<QueueHandle>, generation: u64) -> Self {
        Self {
            handle,
            generation,
            watcher: None,
        }
    }

    /// Attach the task supervising this entry's clients
    pub fn with_watcher(mut self, watcher: JoinHandle<()>) -> Self {
        self.watcher = Some(watcher);
        self
    }

    pub fn handle(&self) -> &Arc<QueueHandle> {
        &self.handle
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn stop_watcher(&self) {
        if let Some(watcher) = &self.watcher {
            watcher.abort();
        }
    }
}

impl Drop for InventoryEntry {
    fn drop(&mut self) {
        self.stop_watcher();
    }
}

#[derive(Default)]
pub struct Inventory {
    entries: HashMap<String, InventoryEntry>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has(&self, identity: &QueueIdentity) -> bool {
        self.entries.contains_key(&identity.composite_key())
    }

    pub fn get(&self, identity: &QueueIdentity) -> Option<Arc<QueueHandle>> {
        self.entry(identity).map(|entry| entry.handle.clone())
    }

    pub fn entry(&self, identity: &QueueIdentity) -> Option<&InventoryEntry> {
        self.entries.get(&identity.composite_key())
    }

    /// Insert an entry, returning the one it replaced
    pub fn put(&mut self, identity: &QueueIdentity, entry: InventoryEntry) -> Option<InventoryEntry> {
        self.entries.insert(identity.composite_key(), entry)
    }

    pub fn remove(&mut self, identity: &QueueIdentity) -> Option<InventoryEntry> {
        self.entries.remove(&identity.composite_key())
    }

    pub fn keys(&self) -> HashSet<QueueIdentity> {
        self.entries
            .keys()
            .filter_map(|key| QueueIdentity::from_composite_key(key))
            .collect()
    }

    /// Handles of every admitted queue
    pub fn handles(&self) -> Vec<Arc<QueueHandle>> {
        self.entries.values().map(|entry| entry.handle.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
