//! Engine assembly
//!
//! Wires the guards, registry, configurer, scanner, listener, reconciler and
//! lifecycle manager from configuration plus the two store ports and a handle
//! factory. Every collaborator is passed in; nothing is global.

use bm_common::QueueKeyParser;
use bm_config::DiscoveryConfig;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

use crate::configurer::KeyspaceNotificationConfigurer;
use crate::error::Result;
use crate::events::{DiscoveryEvent, EventPublisher};
use crate::guard::ConcurrencyGuard;
use crate::handle::HandleFactory;
use crate::lifecycle::{ConnectionLifecycleManager, EngineStatus, LifecycleSettings};
use crate::listener::NotificationListener;
use crate::reconcile::{ReconciliationReport, Reconciler};
use crate::registry::QueueRegistry;
use crate::scanner::ReconciliationScanner;
use crate::store::{AdminStore, NotificationStore, StoreEventReceiver};

pub struct DiscoveryEngine {
    registry: Arc<QueueRegistry>,
    lifecycle: Arc<ConnectionLifecycleManager>,
    events: EventPublisher,
}

impl DiscoveryEngine {
    /// Build an engine watching `config.watch_prefixes` in database `db`
    pub fn new(
        config: &DiscoveryConfig,
        db: i64,
        admin: Arc<dyn AdminStore>,
        notifications: Arc<dyn NotificationStore>,
        factory: Arc<dyn HandleFactory>,
    ) -> Self {
        let parser = QueueKeyParser::new(&config.metadata_suffix);
        let events = EventPublisher::default();
        let lifecycle_guard = Arc::new(ConcurrencyGuard::lifecycle(config.lifecycle_lock_timeout()));

        let registry = QueueRegistry::new(
            factory,
            ConcurrencyGuard::mutation(config.mutation_lock_timeout()),
            events.clone(),
        );

        let reconciler = Arc::new(Reconciler::new(
            registry.clone(),
            KeyspaceNotificationConfigurer::new(
                admin.clone(),
                config.configure_keyspace_notifications,
                config.keyspace_flags.clone(),
            ),
            ReconciliationScanner::new(admin.clone(), parser.clone(), config.scan_page_size),
            config.watch_prefixes.clone(),
            lifecycle_guard.clone(),
        ));

        let listener = Arc::new(NotificationListener::new(
            notifications.clone(),
            registry.clone(),
            parser,
            db,
        ));

        let lifecycle = Arc::new(ConnectionLifecycleManager::new(
            reconciler,
            listener,
            registry.clone(),
            lifecycle_guard,
            admin,
            notifications,
            LifecycleSettings {
                prefixes: config.watch_prefixes.clone(),
                reconcile_interval: config.reconcile_interval(),
                reconcile_on_resubscribe: config.reconcile_on_resubscribe,
                ..LifecycleSettings::default()
            },
        ));

        Self {
            registry,
            lifecycle,
            events,
        }
    }

    /// Start reacting to the adapters' connection events
    pub fn start(&self, admin_events: StoreEventReceiver, notification_events: StoreEventReceiver) -> Result<()> {
        self.lifecycle.start(admin_events, notification_events)
    }

    pub fn registry(&self) -> &Arc<QueueRegistry> {
        &self.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> EngineStatus {
        self.lifecycle.status()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<EngineStatus> {
        self.lifecycle.subscribe_status()
    }

    pub async fn reconcile_now(&self) -> Result<ReconciliationReport> {
        self.lifecycle.reconcile_now().await
    }

    pub async fn shutdown(&self) {
        self.lifecycle.shutdown().await
    }
}
