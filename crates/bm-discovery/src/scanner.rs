//! Paginated scan of a prefix's metadata keys
//!
//! Every identity found is admitted as soon as its page arrives, so queues
//! start being monitored before a long scan has finished.

use bm_common::{QueueIdentity, QueueKeyParser};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::registry::QueueRegistry;
use crate::store::AdminStore;

pub const DEFAULT_SCAN_PAGE_SIZE: usize = 100;

pub struct ReconciliationScanner {
    store: Arc<dyn AdminStore>,
    parser: QueueKeyParser,
    page_size: usize,
}

impl ReconciliationScanner {
    pub fn new(store: Arc<dyn AdminStore>, parser: QueueKeyParser, page_size: usize) -> Self {
        Self {
            store,
            parser,
            page_size: page_size.max(1),
        }
    }

    /// Scan every metadata hash under `prefix`, adding each queue found.
    ///
    /// Returns the set of identities present in the store. A failing page
    /// aborts the scan with the store error. A queue whose handle cannot be
    /// built is logged and still counted as present.
    pub async fn scan(&self, prefix: &str, registry: &QueueRegistry) -> Result<HashSet<QueueIdentity>> {
        let pattern = self.parser.scan_pattern(prefix);
        let mut found = HashSet::new();
        let mut cursor = 0u64;
        let mut pages = 0usize;

        loop {
            let (next, keys) = self.store.scan_hashes(cursor, &pattern, self.page_size).await?;
            pages += 1;

            for key in keys {
                let identity = self.parser.parse(&key);
                if identity.is_unknown() {
                    warn!(key = %key, "Skipping key with unrecognized shape");
                    continue;
                }
                if !found.insert(identity.clone()) {
                    // SCAN may return a key more than once
                    continue;
                }
                match registry.add(&identity).await {
                    Ok(_) => {}
                    Err(e) if e.is_queue_scoped() => {
                        warn!(queue = %identity, error = %e, "Failed to add scanned queue");
                    }
                    Err(e) => return Err(e),
                }
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(prefix = %prefix, pages, "Scan complete");
        info!(prefix = %prefix, queues = found.len(), "Discovered queues");
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventPublisher;
    use crate::guard::ConcurrencyGuard;
    use crate::memory::{InMemoryHandleFactory, InMemoryStore};
    use crate::DiscoveryError;
    use std::time::Duration;

    fn registry(factory: Arc<InMemoryHandleFactory>) -> Arc<QueueRegistry> {
        QueueRegistry::new(
            factory,
            ConcurrencyGuard::mutation(Duration::from_secs(1)),
            EventPublisher::default(),
        )
    }

    #[tokio::test]
    async fn test_scan_adds_every_queue_across_pages() {
        let (store, _, _) = InMemoryStore::new(0);
        for i in 0..7 {
            store.insert_queue(&QueueIdentity::new("bull", format!("queue-{}", i)));
        }
        store.insert_queue(&QueueIdentity::new("other", "ignored"));
        let registry = registry(Arc::new(InMemoryHandleFactory::new()));
        let scanner = ReconciliationScanner::new(store.clone(), QueueKeyParser::default(), 3);

        let found = scanner.scan("bull", &registry).await.unwrap();

        assert_eq!(found.len(), 7);
        assert_eq!(registry.len(), 7);
        assert_eq!(store.scan_calls(), 3);
        assert!(!registry.contains(&QueueIdentity::new("other", "ignored")));
    }

    #[tokio::test]
    async fn test_scan_error_is_returned() {
        let (store, _, _) = InMemoryStore::new(0);
        store.fail_scans_for("bull", true);
        let registry = registry(Arc::new(InMemoryHandleFactory::new()));
        let scanner = ReconciliationScanner::new(store, QueueKeyParser::default(), 100);

        assert!(matches!(scanner.scan("bull", &registry).await, Err(DiscoveryError::Redis(_))));
    }

    #[tokio::test]
    async fn test_handle_failure_keeps_identity_in_result() {
        let (store, _, _) = InMemoryStore::new(0);
        let broken = QueueIdentity::new("bull", "broken");
        store.insert_queue(&broken);
        store.insert_queue(&QueueIdentity::new("bull", "fine"));
        let factory = Arc::new(InMemoryHandleFactory::new());
        factory.fail_for(&broken);
        let registry = registry(factory);
        let scanner = ReconciliationScanner::new(store, QueueKeyParser::default(), 100);

        let found = scanner.scan("bull", &registry).await.unwrap();

        assert_eq!(found.len(), 2);
        assert_eq!(registry.len(), 1);
    }
}
