//! Store ports
//!
//! The engine talks to Redis through two narrow traits, one per connection:
//! - [`AdminStore`]: notification flags and paginated scans
//! - [`NotificationStore`]: keyspace pattern subscriptions
//!
//! Each adapter also reports its connection lifecycle and incoming pattern
//! messages as [`StoreEvent`]s on an unbounded channel handed to the
//! lifecycle manager.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Ready,
    Reconnecting,
    Closed,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Ready => "ready",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
            ConnectionState::Error => "error",
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, ConnectionState::Ready)
    }
}

/// Event emitted by a connection adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Connecting,
    Ready,
    Reconnecting,
    Closed,
    Error(String),
    PatternMessage {
        pattern: String,
        channel: String,
        payload: String,
    },
}

impl StoreEvent {
    /// The connection state this event moves to, if any
    pub fn state(&self) -> Option<ConnectionState> {
        match self {
            StoreEvent::Connecting => Some(ConnectionState::Connecting),
            StoreEvent::Ready => Some(ConnectionState::Ready),
            StoreEvent::Reconnecting => Some(ConnectionState::Reconnecting),
            StoreEvent::Closed => Some(ConnectionState::Closed),
            StoreEvent::Error(_) => Some(ConnectionState::Error),
            StoreEvent::PatternMessage { .. } => None,
        }
    }
}

pub type StoreEventSender = mpsc::UnboundedSender<StoreEvent>;
pub type StoreEventReceiver = mpsc::UnboundedReceiver<StoreEvent>;

pub fn store_event_channel() -> (StoreEventSender, StoreEventReceiver) {
    mpsc::unbounded_channel()
}

/// Administrative connection: configuration and scans
#[async_trait]
pub trait AdminStore: Send + Sync {
    /// Current value of `notify-keyspace-events`
    async fn notify_keyspace_events(&self) -> Result<String>;

    async fn set_notify_keyspace_events(&self, flags: &str) -> Result<()>;

    /// One `SCAN cursor MATCH pattern COUNT count TYPE hash` page.
    /// A returned cursor of 0 ends the iteration.
    async fn scan_hashes(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>)>;

    async fn close(&self);
}

/// Subscriber connection: keyspace notifications
#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn psubscribe(&self, pattern: &str) -> Result<()>;

    async fn punsubscribe(&self, pattern: &str) -> Result<()>;

    async fn close(&self);
}
