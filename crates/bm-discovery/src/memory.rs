//! In-memory store and handle factory
//!
//! Stand-ins for Redis used by tests and local dry runs. The store keeps a set
//! of keys, the notification flags and the active pattern subscriptions, and
//! emits the same [`StoreEvent`]s as the Redis adapters, so the whole engine
//! can be driven without a server.

use async_trait::async_trait;
use bm_common::{QueueIdentity, QueueKeyParser};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::error::{DiscoveryError, Result};
use crate::handle::{EventStreamClient, HandleFactory, JobCounts, ManagedClient, QueueClient, QueueHandle};
use crate::job_events::{JobEvent, JobEventBatch, JobEventKind, JobRecord};
use crate::store::{
    store_event_channel, AdminStore, NotificationStore, StoreEvent, StoreEventReceiver,
    StoreEventSender,
};

fn redis_error(description: &'static str) -> DiscoveryError {
    DiscoveryError::Redis(redis::RedisError::from((redis::ErrorKind::IoError, description)))
}

// ============================================================================
// Store
// ============================================================================

#[derive(Default)]
struct StoreState {
    keys: BTreeSet<String>,
    notify_flags: String,
    flag_writes: Vec<String>,
    subscriptions: BTreeSet<String>,
    failing_scan_prefixes: HashSet<String>,
    fail_config: bool,
    fail_subscribe: bool,
    scan_calls: usize,
}

/// In-memory stand-in for both store connections
pub struct InMemoryStore {
    parser: QueueKeyParser,
    db: i64,
    state: Mutex<StoreState>,
    admin_events: StoreEventSender,
    notification_events: StoreEventSender,
    admin_closed: AtomicBool,
    notifications_closed: AtomicBool,
}

impl InMemoryStore {
    /// Create a store plus the event receivers for its admin and notification sides
    pub fn new(db: i64) -> (Arc<Self>, StoreEventReceiver, StoreEventReceiver) {
        Self::with_parser(db, QueueKeyParser::default())
    }

    pub fn with_parser(db: i64, parser: QueueKeyParser) -> (Arc<Self>, StoreEventReceiver, StoreEventReceiver) {
        let (admin_events, admin_rx) = store_event_channel();
        let (notification_events, notification_rx) = store_event_channel();
        let store = Arc::new(Self {
            parser,
            db,
            state: Mutex::new(StoreState::default()),
            admin_events,
            notification_events,
            admin_closed: AtomicBool::new(false),
            notifications_closed: AtomicBool::new(false),
        });
        (store, admin_rx, notification_rx)
    }

    fn metadata_key(&self, identity: &QueueIdentity) -> String {
        identity.key(self.parser.metadata_suffix())
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    pub fn connect_admin(&self) {
        let _ = self.admin_events.send(StoreEvent::Connecting);
        let _ = self.admin_events.send(StoreEvent::Ready);
    }

    pub fn disconnect_admin(&self) {
        let _ = self.admin_events.send(StoreEvent::Closed);
        let _ = self.admin_events.send(StoreEvent::Reconnecting);
    }

    pub fn connect_notifications(&self) {
        let _ = self.notification_events.send(StoreEvent::Connecting);
        let _ = self.notification_events.send(StoreEvent::Ready);
    }

    /// Drop the subscriber connection; its subscriptions go with it
    pub fn disconnect_notifications(&self) {
        self.state.lock().subscriptions.clear();
        let _ = self.notification_events.send(StoreEvent::Closed);
        let _ = self.notification_events.send(StoreEvent::Reconnecting);
    }

    pub fn emit_admin(&self, event: StoreEvent) {
        let _ = self.admin_events.send(event);
    }

    pub fn emit_notification(&self, event: StoreEvent) {
        let _ = self.notification_events.send(event);
    }

    pub fn is_admin_closed(&self) -> bool {
        self.admin_closed.load(Ordering::SeqCst)
    }

    pub fn is_notifications_closed(&self) -> bool {
        self.notifications_closed.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Data
    // ------------------------------------------------------------------

    /// Create a queue's metadata key without publishing a notification
    pub fn insert_queue(&self, identity: &QueueIdentity) {
        let key = self.metadata_key(identity);
        self.state.lock().keys.insert(key);
    }

    /// Delete a queue's metadata key without publishing a notification
    pub fn forget_queue(&self, identity: &QueueIdentity) {
        let key = self.metadata_key(identity);
        self.state.lock().keys.remove(&key);
    }

    /// Create a queue and publish `hset` on its keyspace channel
    pub fn create_queue(&self, identity: &QueueIdentity) {
        self.insert_queue(identity);
        self.publish_keyspace(&self.metadata_key(identity), "hset");
    }

    /// Delete a queue and publish `del` on its keyspace channel
    pub fn delete_queue(&self, identity: &QueueIdentity) {
        self.forget_queue(identity);
        self.publish_keyspace(&self.metadata_key(identity), "del");
    }

    /// Publish `verb` for `key` if a subscription covers it
    pub fn publish_keyspace(&self, key: &str, verb: &str) -> bool {
        let identity = self.parser.parse(key);
        let pattern = self.parser.keyspace_pattern(self.db, &identity.prefix);
        if !self.state.lock().subscriptions.contains(&pattern) {
            return false;
        }
        let _ = self.notification_events.send(StoreEvent::PatternMessage {
            pattern,
            channel: format!("__keyspace@{}__:{}", self.db, key),
            payload: verb.to_string(),
        });
        true
    }

    pub fn keys(&self) -> Vec<String> {
        self.state.lock().keys.iter().cloned().collect()
    }

    pub fn set_notify_flags(&self, flags: &str) {
        self.state.lock().notify_flags = flags.to_string();
    }

    pub fn notify_flags(&self) -> String {
        self.state.lock().notify_flags.clone()
    }

    /// Every value written with `CONFIG SET`
    pub fn flag_writes(&self) -> Vec<String> {
        self.state.lock().flag_writes.clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.state.lock().subscriptions.iter().cloned().collect()
    }

    pub fn scan_calls(&self) -> usize {
        self.state.lock().scan_calls
    }

    // ------------------------------------------------------------------
    // Failure injection
    // ------------------------------------------------------------------

    pub fn fail_scans_for(&self, prefix: &str, fail: bool) {
        let mut state = self.state.lock();
        if fail {
            state.failing_scan_prefixes.insert(prefix.to_string());
        } else {
            state.failing_scan_prefixes.remove(prefix);
        }
    }

    pub fn fail_config(&self, fail: bool) {
        self.state.lock().fail_config = fail;
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.state.lock().fail_subscribe = fail;
    }
}

/// Match a single-`*` glob such as `bull:*:meta`
fn matches_pattern(pattern: &str, key: &str) -> bool {
    match pattern.split_once('*') {
        Some((head, tail)) => {
            key.len() > head.len() + tail.len() && key.starts_with(head) && key.ends_with(tail)
        }
        None => pattern == key,
    }
}

#[async_trait]
impl AdminStore for InMemoryStore {
    async fn notify_keyspace_events(&self) -> Result<String> {
        let state = self.state.lock();
        if state.fail_config {
            return Err(redis_error("CONFIG GET failed"));
        }
        Ok(state.notify_flags.clone())
    }

    async fn set_notify_keyspace_events(&self, flags: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_config {
            return Err(redis_error("CONFIG SET failed"));
        }
        state.notify_flags = flags.to_string();
        state.flag_writes.push(flags.to_string());
        Ok(())
    }

    async fn scan_hashes(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>)> {
        let mut state = self.state.lock();
        state.scan_calls += 1;

        let failing = state
            .failing_scan_prefixes
            .iter()
            .any(|prefix| pattern.starts_with(&format!("{}:", prefix)));
        if failing {
            return Err(redis_error("SCAN failed"));
        }

        let matching: Vec<&String> = state.keys.iter().filter(|key| matches_pattern(pattern, key)).collect();
        let start = cursor as usize;
        let end = (start + count.max(1)).min(matching.len());
        let page = matching
            .get(start..end)
            .map(|keys| keys.iter().map(|key| key.to_string()).collect())
            .unwrap_or_default();
        let next = if end >= matching.len() { 0 } else { end as u64 };
        Ok((next, page))
    }

    async fn close(&self) {
        self.admin_closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl NotificationStore for InMemoryStore {
    async fn psubscribe(&self, pattern: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_subscribe {
            return Err(DiscoveryError::NotConnected("subscriber connection".to_string()));
        }
        state.subscriptions.insert(pattern.to_string());
        Ok(())
    }

    async fn punsubscribe(&self, pattern: &str) -> Result<()> {
        self.state.lock().subscriptions.remove(pattern);
        Ok(())
    }

    async fn close(&self) {
        self.state.lock().subscriptions.clear();
        self.notifications_closed.store(true, Ordering::SeqCst);
    }
}

// ============================================================================
// Clients
// ============================================================================

/// Client whose counts, jobs, stream entries, close behaviour and faults are
/// set by the caller
pub struct InMemoryClient {
    counts: Mutex<JobCounts>,
    jobs: Mutex<HashMap<String, JobRecord>>,
    /// Stream entries not read yet; `None` marks an entry without a job metric
    stream: Mutex<VecDeque<(String, Option<JobEvent>)>>,
    stream_seq: AtomicU64,
    closes: AtomicUsize,
    fail_close: AtomicBool,
    fault: watch::Sender<Option<String>>,
}

impl InMemoryClient {
    pub fn new() -> Self {
        let (fault, _) = watch::channel(None);
        Self {
            counts: Mutex::new(JobCounts::default()),
            jobs: Mutex::new(HashMap::new()),
            stream: Mutex::new(VecDeque::new()),
            stream_seq: AtomicU64::new(0),
            closes: AtomicUsize::new(0),
            fail_close: AtomicBool::new(false),
            fault,
        }
    }

    pub fn set_counts(&self, counts: JobCounts) {
        *self.counts.lock() = counts;
    }

    pub fn insert_job(&self, job_id: &str, job: JobRecord) {
        self.jobs.lock().insert(job_id.to_string(), job);
    }

    pub fn remove_job(&self, job_id: &str) {
        self.jobs.lock().remove(job_id);
    }

    fn next_stream_id(&self) -> String {
        format!("{}-0", self.stream_seq.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Append a counted entry to the event stream, returning its id
    pub fn push_event(&self, kind: JobEventKind, job_id: &str, failed_reason: Option<&str>) -> String {
        let stream_id = self.next_stream_id();
        let event = JobEvent {
            stream_id: stream_id.clone(),
            kind,
            job_id: job_id.to_string(),
            failed_reason: failed_reason.map(str::to_string),
        };
        self.stream.lock().push_back((stream_id.clone(), Some(event)));
        stream_id
    }

    /// Append an entry such as `progress` that has no job metric
    pub fn push_uncounted_event(&self) -> String {
        let stream_id = self.next_stream_id();
        self.stream.lock().push_back((stream_id.clone(), None));
        stream_id
    }

    fn drain_stream(&self, count: usize) -> JobEventBatch {
        let mut stream = self.stream.lock();
        let take = count.min(stream.len());
        let mut batch = JobEventBatch::default();
        for (stream_id, event) in stream.drain(..take) {
            batch.last_id = Some(stream_id);
            batch.events.extend(event);
        }
        batch
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Make `close` return an error (it is still counted)
    pub fn fail_close(&self) {
        self.fail_close.store(true, Ordering::SeqCst);
    }

    /// Simulate a fatal client error
    pub fn trip(&self, reason: &str) {
        self.fault.send_replace(Some(reason.to_string()));
    }
}

impl Default for InMemoryClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ManagedClient for InMemoryClient {
    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(redis_error("QUIT failed"));
        }
        Ok(())
    }

    async fn faulted(&self) -> String {
        let mut rx = self.fault.subscribe();
        let fault = rx
            .wait_for(|fault| fault.is_some())
            .await
            .map(|fault| fault.clone().unwrap_or_default());
        match fault {
            Ok(reason) => reason,
            Err(_) => std::future::pending().await,
        }
    }
}

#[async_trait]
impl QueueClient for InMemoryClient {
    async fn job_counts(&self) -> Result<JobCounts> {
        Ok(*self.counts.lock())
    }

    async fn job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        Ok(self.jobs.lock().get(job_id).cloned())
    }
}

/// Reads ignore `after`: entries are handed out once, in order
#[async_trait]
impl EventStreamClient for InMemoryClient {
    async fn read_events(&self, _after: &str, block: Duration, count: usize) -> Result<JobEventBatch> {
        let batch = self.drain_stream(count);
        if batch.last_id.is_some() {
            return Ok(batch);
        }
        tokio::time::sleep(block).await;
        Ok(self.drain_stream(count))
    }
}

/// The two clients built for one handle
#[derive(Clone)]
pub struct ClientPair {
    pub identity: QueueIdentity,
    pub queue: Arc<InMemoryClient>,
    pub support: Arc<InMemoryClient>,
}

/// Factory producing [`InMemoryClient`]s and remembering every pair it built
#[derive(Default)]
pub struct InMemoryHandleFactory {
    built: Mutex<Vec<ClientPair>>,
    failing: Mutex<HashSet<QueueIdentity>>,
    counts: Mutex<HashMap<QueueIdentity, JobCounts>>,
    create_delay: Mutex<Option<Duration>>,
}

impl InMemoryHandleFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn created_count(&self) -> usize {
        self.built.lock().len()
    }

    /// Most recent pair built for `identity`
    pub fn clients(&self, identity: &QueueIdentity) -> Option<ClientPair> {
        self.built
            .lock()
            .iter()
            .rev()
            .find(|pair| &pair.identity == identity)
            .cloned()
    }

    pub fn all_clients(&self) -> Vec<ClientPair> {
        self.built.lock().clone()
    }

    pub fn fail_for(&self, identity: &QueueIdentity) {
        self.failing.lock().insert(identity.clone());
    }

    /// Job counts reported by queue clients built for `identity` from now on
    pub fn set_counts(&self, identity: &QueueIdentity, counts: JobCounts) {
        self.counts.lock().insert(identity.clone(), counts);
    }

    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock() = Some(delay);
    }
}

#[async_trait]
impl HandleFactory for InMemoryHandleFactory {
    async fn create(&self, identity: &QueueIdentity) -> Result<QueueHandle> {
        let delay = *self.create_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().contains(identity) {
            return Err(DiscoveryError::handle(identity, "client construction failed"));
        }

        let queue = Arc::new(InMemoryClient::new());
        if let Some(counts) = self.counts.lock().get(identity) {
            queue.set_counts(*counts);
        }
        let support = Arc::new(InMemoryClient::new());

        self.built.lock().push(ClientPair {
            identity: identity.clone(),
            queue: queue.clone(),
            support: support.clone(),
        });
        Ok(QueueHandle::new(identity.clone(), queue, support))
    }
}
