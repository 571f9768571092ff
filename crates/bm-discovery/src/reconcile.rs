//! Reconciliation against a full scan
//!
//! Runs under the lifecycle guard:
//! 1. snapshot the inventory
//! 2. ensure keyspace notification flags
//! 3. scan every watched prefix, adding what is found
//! 4. remove what was known before but not found now
//!
//! The lifecycle manager publishes `ServiceReady` after every cycle that gets
//! past step 2.
//!
//! Prefixes are isolated: a prefix whose scan fails contributes nothing to the
//! prune set, so its queues survive until a later cycle can see them. The
//! failure is reported, not raised.

use bm_common::QueueIdentity;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::configurer::KeyspaceNotificationConfigurer;
use crate::engine_metrics;
use crate::error::Result;
use crate::guard::ConcurrencyGuard;
use crate::registry::{QueueRegistry, RemovalReason};
use crate::scanner::ReconciliationScanner;

/// What triggered a reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileTrigger {
    Connected,
    Resubscribed,
    Periodic,
    Manual,
}

impl ReconcileTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileTrigger::Connected => "connected",
            ReconcileTrigger::Resubscribed => "resubscribed",
            ReconcileTrigger::Periodic => "periodic",
            ReconcileTrigger::Manual => "manual",
        }
    }
}

/// Inventory before and after one scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationSnapshot {
    pub previous: HashSet<QueueIdentity>,
    pub current: HashSet<QueueIdentity>,
}

impl ReconciliationSnapshot {
    /// `previous - current`, sorted
    pub fn prune_set(&self) -> Vec<QueueIdentity> {
        let mut prune: Vec<_> = self.previous.difference(&self.current).cloned().collect();
        prune.sort();
        prune
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationReport {
    /// Identities seen by the scan
    pub discovered: usize,
    /// Identities removed because the scan no longer saw them
    pub pruned: usize,
    /// Prefixes whose scan failed this cycle
    pub failed_prefixes: Vec<String>,
}

impl ReconciliationReport {
    pub fn is_complete(&self) -> bool {
        self.failed_prefixes.is_empty()
    }
}

pub struct Reconciler {
    registry: Arc<QueueRegistry>,
    configurer: KeyspaceNotificationConfigurer,
    scanner: ReconciliationScanner,
    prefixes: Vec<String>,
    guard: Arc<ConcurrencyGuard>,
}

impl Reconciler {
    pub fn new(
        registry: Arc<QueueRegistry>,
        configurer: KeyspaceNotificationConfigurer,
        scanner: ReconciliationScanner,
        prefixes: Vec<String>,
        guard: Arc<ConcurrencyGuard>,
    ) -> Self {
        Self {
            registry,
            configurer,
            scanner,
            prefixes,
            guard,
        }
    }

    pub fn prefixes(&self) -> &[String] {
        &self.prefixes
    }

    /// Run one reconciliation cycle under the lifecycle guard.
    ///
    /// Fails on guard timeout or when the notification flags cannot be read
    /// or written; scan failures are reported per prefix instead.
    pub async fn reconcile(&self, trigger: ReconcileTrigger) -> Result<ReconciliationReport> {
        let started = Instant::now();
        let result = self.guard.run_exclusive(|| self.reconcile_locked()).await;

        let outcome = match &result {
            Ok(report) if report.is_complete() => "success",
            Ok(_) => "partial",
            Err(_) => "failure",
        };
        engine_metrics::record_reconciliation(trigger.as_str(), outcome, started.elapsed());

        match &result {
            Ok(report) => info!(
                trigger = trigger.as_str(),
                discovered = report.discovered,
                pruned = report.pruned,
                failed_prefixes = ?report.failed_prefixes,
                duration_ms = started.elapsed().as_millis() as u64,
                "Reconciliation finished"
            ),
            Err(e) => error!(trigger = trigger.as_str(), error = %e, "Reconciliation failed"),
        }
        result
    }

    async fn reconcile_locked(&self) -> Result<ReconciliationReport> {
        let previous = self.registry.keys();

        self.configurer.ensure_enabled().await?;

        let mut current = HashSet::new();
        let mut failed_prefixes = Vec::new();
        for prefix in &self.prefixes {
            match self.scanner.scan(prefix, &self.registry).await {
                Ok(found) => current.extend(found),
                Err(e) => {
                    error!(prefix = %prefix, error = %e, "Scan failed, keeping this prefix's queues");
                    failed_prefixes.push(prefix.clone());
                }
            }
        }

        let snapshot = ReconciliationSnapshot { previous, current };
        let mut pruned = 0;
        for identity in snapshot.prune_set() {
            if failed_prefixes.contains(&identity.prefix) {
                continue;
            }
            match self.registry.remove(&identity, RemovalReason::Pruned).await {
                Ok(true) => pruned += 1,
                Ok(false) => {}
                Err(e) => warn!(queue = %identity, error = %e, "Failed to prune queue"),
            }
        }

        Ok(ReconciliationReport {
            discovered: snapshot.current.len(),
            pruned,
            failed_prefixes,
        })
    }
}
