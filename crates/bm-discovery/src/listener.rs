//! Keyspace notification listener
//!
//! Subscribes `__keyspace@{db}__:{prefix}:*:meta` for every watched prefix and
//! turns each message into an Add (`hset`) or Remove (`del`). Messages that
//! arrive while the listener is stopped are dropped.

use bm_common::{QueueIdentity, QueueKeyParser};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::engine_metrics;
use crate::error::Result;
use crate::registry::{QueueRegistry, RemovalReason};
use crate::store::NotificationStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Deleted,
}

impl ChangeKind {
    /// Map the store's mutation verb; other verbs carry no lifecycle meaning
    pub fn from_verb(verb: &str) -> Option<Self> {
        match verb {
            "hset" => Some(ChangeKind::Created),
            "del" => Some(ChangeKind::Deleted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotification {
    pub kind: ChangeKind,
    pub identity: QueueIdentity,
}

impl ChangeNotification {
    pub fn parse(parser: &QueueKeyParser, channel: &str, payload: &str) -> Option<Self> {
        let kind = ChangeKind::from_verb(payload)?;
        Some(Self {
            kind,
            identity: parser.parse(channel),
        })
    }
}

pub struct NotificationListener {
    store: Arc<dyn NotificationStore>,
    registry: Arc<QueueRegistry>,
    parser: QueueKeyParser,
    db: i64,
    initialized: AtomicBool,
    patterns: Mutex<Vec<String>>,
}

impl NotificationListener {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        registry: Arc<QueueRegistry>,
        parser: QueueKeyParser,
        db: i64,
    ) -> Self {
        Self {
            store,
            registry,
            parser,
            db,
            initialized: AtomicBool::new(false),
            patterns: Mutex::new(Vec::new()),
        }
    }

    pub fn is_active(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn patterns(&self) -> Vec<String> {
        self.patterns.lock().clone()
    }

    /// Subscribe every prefix and start handling messages.
    ///
    /// Returns `false` when already started. If a subscription fails, the
    /// patterns subscribed so far are released and the listener stays stopped.
    pub async fn start(&self, prefixes: &[String]) -> Result<bool> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            debug!("Notification listener already started");
            return Ok(false);
        }

        for prefix in prefixes {
            let pattern = self.parser.keyspace_pattern(self.db, prefix);
            if let Err(e) = self.store.psubscribe(&pattern).await {
                warn!(pattern = %pattern, error = %e, "Failed to subscribe to keyspace notifications");
                self.stop().await;
                return Err(e);
            }
            debug!(pattern = %pattern, "Subscribed to keyspace notifications");
            self.patterns.lock().push(pattern);
        }

        info!(prefixes = ?prefixes, db = self.db, "Notification listener started");
        Ok(true)
    }

    /// Stop handling messages and release every subscription.
    ///
    /// Unsubscribe failures are logged and swallowed. Returns `false` when
    /// already stopped.
    pub async fn stop(&self) -> bool {
        if !self.initialized.swap(false, Ordering::SeqCst) {
            return false;
        }

        let patterns = std::mem::take(&mut *self.patterns.lock());
        for pattern in patterns {
            if let Err(e) = self.store.punsubscribe(&pattern).await {
                debug!(pattern = %pattern, error = %e, "Unsubscribe failed");
            }
        }

        info!("Notification listener stopped");
        true
    }

    /// Apply one keyspace message to the registry
    pub async fn handle_message(&self, channel: &str, payload: &str) -> Result<()> {
        if !self.is_active() {
            debug!(channel = %channel, "Listener stopped, dropping message");
            return Ok(());
        }

        let Some(notification) = ChangeNotification::parse(&self.parser, channel, payload) else {
            debug!(channel = %channel, verb = %payload, "Ignoring keyspace event");
            return Ok(());
        };

        if notification.identity.is_unknown() {
            warn!(channel = %channel, "Keyspace channel does not name a queue");
            return Ok(());
        }

        engine_metrics::record_notification(payload);
        match notification.kind {
            ChangeKind::Created => {
                self.registry.add(&notification.identity).await?;
            }
            ChangeKind::Deleted => {
                self.registry
                    .remove(&notification.identity, RemovalReason::Notification)
                    .await?;
            }
        }
        Ok(())
    }
}
