//! Connection Lifecycle Manager - drives the engine from store connection events
//!
//! Handles:
//! - Admin connection `ready`: reconciliation
//! - Notification connection `ready`: listener start, plus a resync when the
//!   inventory was already reconciled (missed notifications)
//! - Notification connection `closed`: listener stop
//! - Periodic reconciliation (when enabled)
//! - `ServiceReady` once the inventory is reconciled and the listener is subscribed
//! - Connection status tracking for readiness probes
//! - Graceful shutdown coordination
//!
//! `reconnecting` and `error` events are only logged; the adapters own the
//! reconnect loop.
//!
//! A transition that times out on the lifecycle guard is retried every
//! `retry_delay` for as long as its connection stays ready. The next state
//! change on that connection replaces it.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::engine_metrics;
use crate::error::{DiscoveryError, Result};
use crate::events::DiscoveryEvent;
use crate::guard::ConcurrencyGuard;
use crate::listener::NotificationListener;
use crate::reconcile::{ReconcileTrigger, ReconciliationReport, Reconciler};
use crate::registry::QueueRegistry;
use crate::store::{AdminStore, ConnectionState, NotificationStore, StoreEvent, StoreEventReceiver};

/// Settings for the lifecycle manager
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    /// Prefixes subscribed when the notification connection is ready
    pub prefixes: Vec<String>,
    /// Interval for periodic reconciliation; `None` disables it
    pub reconcile_interval: Option<Duration>,
    /// Reconcile again after re-subscribing on an already reconciled inventory
    pub reconcile_on_resubscribe: bool,
    /// Pause before retrying a transition that timed out on the lifecycle guard
    pub retry_delay: Duration,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            prefixes: vec!["bull".to_string()],
            reconcile_interval: None,
            reconcile_on_resubscribe: true,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Observable state of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStatus {
    pub admin: ConnectionState,
    pub notifications: ConnectionState,
    /// A reconciliation completed on the current admin connection
    pub reconciled: bool,
    pub listening: bool,
}

impl EngineStatus {
    pub fn is_ready(&self) -> bool {
        self.admin.is_ready() && self.notifications.is_ready() && self.reconciled && self.listening
    }
}

impl Default for EngineStatus {
    fn default() -> Self {
        Self {
            admin: ConnectionState::Connecting,
            notifications: ConnectionState::Connecting,
            reconciled: false,
            listening: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Connection {
    Admin,
    Notifications,
}

impl Connection {
    fn as_str(&self) -> &'static str {
        match self {
            Connection::Admin => "admin",
            Connection::Notifications => "notifications",
        }
    }
}

/// A connection-driven transition still owed after a guard timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingStep {
    StartListener,
    Reconcile(ReconcileTrigger),
}

pub struct ConnectionLifecycleManager {
    reconciler: Arc<Reconciler>,
    listener: Arc<NotificationListener>,
    registry: Arc<QueueRegistry>,
    guard: Arc<ConcurrencyGuard>,
    admin_store: Arc<dyn AdminStore>,
    notification_store: Arc<dyn NotificationStore>,
    settings: LifecycleSettings,
    status_tx: watch::Sender<EngineStatus>,
    running: AtomicBool,
    stopped: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionLifecycleManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        reconciler: Arc<Reconciler>,
        listener: Arc<NotificationListener>,
        registry: Arc<QueueRegistry>,
        guard: Arc<ConcurrencyGuard>,
        admin_store: Arc<dyn AdminStore>,
        notification_store: Arc<dyn NotificationStore>,
        settings: LifecycleSettings,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (status_tx, _) = watch::channel(EngineStatus::default());

        Self {
            reconciler,
            listener,
            registry,
            guard,
            admin_store,
            notification_store,
            settings,
            status_tx,
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn status(&self) -> EngineStatus {
        *self.status_tx.borrow()
    }

    /// Subscribe to status changes
    pub fn subscribe_status(&self) -> watch::Receiver<EngineStatus> {
        self.status_tx.subscribe()
    }

    /// Start consuming both connections' events
    pub fn start(
        self: &Arc<Self>,
        admin_events: StoreEventReceiver,
        notification_events: StoreEventReceiver,
    ) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(DiscoveryError::ShuttingDown);
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(DiscoveryError::Configuration(
                "lifecycle manager already started".to_string(),
            ));
        }

        info!(
            prefixes = ?self.settings.prefixes,
            reconcile_interval = ?self.settings.reconcile_interval,
            "Starting connection lifecycle manager"
        );

        let mut tasks = self.tasks.lock();
        tasks.push(self.spawn_event_loop(Connection::Admin, admin_events));
        tasks.push(self.spawn_event_loop(Connection::Notifications, notification_events));
        if let Some(interval) = self.settings.reconcile_interval {
            tasks.push(self.spawn_periodic_reconcile(interval));
        }
        Ok(())
    }

    fn spawn_event_loop(self: &Arc<Self>, connection: Connection, mut events: StoreEventReceiver) -> JoinHandle<()> {
        let manager = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let retry_delay = self.settings.retry_delay;

        tokio::spawn(async move {
            let mut pending: Option<PendingStep> = None;

            loop {
                tokio::select! {
                    event = events.recv() => {
                        let Some(event) = event else {
                            debug!(connection = connection.as_str(), "Store event stream ended");
                            break;
                        };
                        let changes_state = event.state().is_some();
                        let owed = match connection {
                            Connection::Admin => manager.on_admin_event(event).await,
                            Connection::Notifications => manager.on_notification_event(event).await,
                        };
                        if changes_state || owed.is_some() {
                            pending = owed;
                        }
                    }
                    _ = tokio::time::sleep(retry_delay), if pending.is_some() => {
                        if let Some(step) = pending.take() {
                            pending = manager.retry(connection, step).await;
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!(connection = connection.as_str(), "Store event loop shutting down");
                        break;
                    }
                }
            }
        })
    }

    fn spawn_periodic_reconcile(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let manager = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if manager.status().admin.is_ready() {
                            // a timeout here is covered by the next tick
                            let _ = manager.reconcile(ReconcileTrigger::Periodic).await;
                        } else {
                            debug!("Admin connection not ready, skipping periodic reconciliation");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Periodic reconciliation shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Returns the step still owed when the lifecycle guard timed out
    async fn on_admin_event(&self, event: StoreEvent) -> Option<PendingStep> {
        self.track_state(Connection::Admin, &event);

        match event {
            StoreEvent::Ready => self.reconcile_step(ReconcileTrigger::Connected).await,
            StoreEvent::Closed => {
                self.status_tx.send_modify(|status| status.reconciled = false);
                engine_metrics::set_service_ready(false);
                None
            }
            StoreEvent::PatternMessage { channel, .. } => {
                debug!(channel = %channel, "Ignoring pattern message on admin connection");
                None
            }
            _ => None,
        }
    }

    async fn on_notification_event(&self, event: StoreEvent) -> Option<PendingStep> {
        self.track_state(Connection::Notifications, &event);

        match event {
            StoreEvent::Ready => self.start_listener().await,
            StoreEvent::Closed => {
                self.stop_listener().await;
                None
            }
            StoreEvent::PatternMessage { channel, payload, .. } => {
                if let Err(e) = self.listener.handle_message(&channel, &payload).await {
                    error!(channel = %channel, verb = %payload, error = %e, "Failed to apply keyspace notification");
                }
                None
            }
            _ => None,
        }
    }

    /// Re-run `step` unless its connection has left `ready` since it was owed
    async fn retry(&self, connection: Connection, step: PendingStep) -> Option<PendingStep> {
        let status = self.status();
        let connected = match connection {
            Connection::Admin => status.admin.is_ready(),
            Connection::Notifications => status.notifications.is_ready(),
        };
        let admin_needed = matches!(step, PendingStep::Reconcile(_));

        if self.stopped.load(Ordering::SeqCst) || !connected || (admin_needed && !status.admin.is_ready()) {
            debug!(connection = connection.as_str(), step = ?step, "Dropping pending lifecycle step");
            return None;
        }

        info!(connection = connection.as_str(), step = ?step, "Retrying lifecycle step");
        match step {
            PendingStep::StartListener => self.start_listener().await,
            PendingStep::Reconcile(trigger) => self.reconcile_step(trigger).await,
        }
    }

    async fn reconcile_step(&self, trigger: ReconcileTrigger) -> Option<PendingStep> {
        match self.reconcile(trigger).await {
            Err(DiscoveryError::LockTimeout { .. }) => Some(PendingStep::Reconcile(trigger)),
            _ => None,
        }
    }

    async fn start_listener(&self) -> Option<PendingStep> {
        let prefixes = &self.settings.prefixes;
        let started = self
            .guard
            .run_exclusive(|| self.listener.start(prefixes))
            .await;

        match started {
            Ok(true) => {
                let mut resync = false;
                self.status_tx.send_modify(|status| {
                    status.listening = true;
                    if !status.reconciled {
                        // the admin reconciliation publishes ServiceReady
                        return;
                    }
                    resync = self.settings.reconcile_on_resubscribe && status.admin.is_ready();
                    if !resync {
                        self.publish_ready();
                    }
                });
                self.update_ready_gauge();

                if resync {
                    info!("Re-subscribed to keyspace notifications, resynchronizing");
                    return self.reconcile_step(ReconcileTrigger::Resubscribed).await;
                }
                None
            }
            Ok(false) => None,
            Err(e @ DiscoveryError::LockTimeout { .. }) => {
                warn!(
                    error = %e,
                    retry_ms = self.settings.retry_delay.as_millis() as u64,
                    "Notification listener start timed out, retrying"
                );
                Some(PendingStep::StartListener)
            }
            Err(e) => {
                error!(error = %e, "Failed to start notification listener");
                None
            }
        }
    }

    async fn stop_listener(&self) {
        let stopped = self
            .guard
            .run_exclusive(|| async { Ok(self.listener.stop().await) })
            .await;

        if let Err(e) = stopped {
            // the subscriptions died with the connection; reset regardless
            warn!(error = %e, "Stopping notification listener without the lifecycle guard");
            self.listener.stop().await;
        }
        self.status_tx.send_modify(|status| status.listening = false);
        engine_metrics::set_service_ready(false);
    }

    fn track_state(&self, connection: Connection, event: &StoreEvent) {
        let Some(state) = event.state() else {
            return;
        };

        match event {
            StoreEvent::Connecting => debug!(connection = connection.as_str(), "Connecting"),
            StoreEvent::Ready => info!(connection = connection.as_str(), "Connection ready"),
            StoreEvent::Reconnecting => info!(connection = connection.as_str(), "Reconnecting"),
            StoreEvent::Closed => warn!(connection = connection.as_str(), "Connection closed"),
            StoreEvent::Error(message) => {
                warn!(connection = connection.as_str(), error = %message, "Connection error")
            }
            StoreEvent::PatternMessage { .. } => {}
        }

        engine_metrics::record_connection_state(connection.as_str(), state.as_str());
        self.status_tx.send_modify(|status| match connection {
            Connection::Admin => status.admin = state,
            Connection::Notifications => status.notifications = state,
        });
    }

    fn update_ready_gauge(&self) {
        engine_metrics::set_service_ready(self.status().is_ready());
    }

    /// Called inside `send_modify` so the event goes out before status watchers wake
    fn publish_ready(&self) {
        debug!(queues = self.registry.len(), "Inventory in sync");
        self.registry.events().publish(DiscoveryEvent::ServiceReady);
    }

    /// Reconcile, then publish `ServiceReady` if the listener is subscribed.
    ///
    /// Prefixes whose scan failed stay in the report; they do not hold back
    /// readiness for the others.
    async fn reconcile(&self, trigger: ReconcileTrigger) -> Result<ReconciliationReport> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(DiscoveryError::ShuttingDown);
        }

        let report = self.reconciler.reconcile(trigger).await?;

        self.status_tx.send_modify(|status| {
            status.reconciled = true;
            if status.listening {
                self.publish_ready();
            }
        });
        self.update_ready_gauge();
        Ok(report)
    }

    /// Reconcile now, outside the connection-driven schedule
    pub async fn reconcile_now(&self) -> Result<ReconciliationReport> {
        self.reconcile(ReconcileTrigger::Manual).await
    }

    /// Stop background tasks, evict every queue, close both connections, then
    /// publish `ServiceClosed`. Calls after the first do nothing.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down discovery engine");

        let _ = self.shutdown_tx.send(());
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(self.guard.timeout(), task).await.is_err() {
                warn!("Lifecycle task did not stop in time, aborting");
                abort.abort();
            }
        }

        self.stop_listener().await;
        let removed = self.registry.remove_all().await;

        self.admin_store.close().await;
        self.notification_store.close().await;

        self.status_tx.send_modify(|status| {
            status.admin = ConnectionState::Closed;
            status.notifications = ConnectionState::Closed;
            status.reconciled = false;
            status.listening = false;
        });
        engine_metrics::set_service_ready(false);

        self.registry.events().publish(DiscoveryEvent::ServiceClosed);
        info!(removed, "Discovery engine stopped");
    }
}
