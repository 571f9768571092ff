//! Queue Metrics Collector - polls job counts and follows job events for every discovered queue
//!
//! Handles:
//! - `QueueCreated`: spawn a poller reading the handle's job counts every interval,
//!   and a follower reading the queue's event stream from its tail
//! - `QueueRemoved`: stop both tasks and zero the queue's gauges
//! - `ServiceClosed`: stop every task
//! - Lagging behind the discovery events: resync tasks from the registry

use bm_common::QueueIdentity;
use bm_discovery::job_events::STREAM_TAIL;
use bm_discovery::{DiscoveryEvent, JobCounts, QueueHandle, QueueRegistry};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{event_metrics, job_metrics};

/// Entries read per `XREAD`
const EVENT_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone)]
pub struct CollectorSettings {
    /// Period of the job count poll
    pub interval: Duration,
    /// Follow each queue's event stream for the job event metrics
    pub job_events: bool,
    /// Longest a single event stream read blocks
    pub event_block: Duration,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            job_events: true,
            event_block: Duration::from_secs(1),
        }
    }
}

struct QueueTasks {
    poller: JoinHandle<()>,
    follower: Option<JoinHandle<()>>,
}

impl QueueTasks {
    fn abort(self) {
        self.poller.abort();
        if let Some(follower) = self.follower {
            follower.abort();
        }
    }
}

pub struct QueueMetricsCollector {
    registry: Arc<QueueRegistry>,
    settings: CollectorSettings,
    tasks: Mutex<HashMap<QueueIdentity, QueueTasks>>,
    latest: Arc<RwLock<HashMap<QueueIdentity, JobCounts>>>,
    cursors: Arc<RwLock<HashMap<QueueIdentity, String>>>,
    shutdown_tx: broadcast::Sender<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl QueueMetricsCollector {
    pub fn new(registry: Arc<QueueRegistry>, settings: CollectorSettings) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new(Self {
            registry,
            settings,
            tasks: Mutex::new(HashMap::new()),
            latest: Arc::new(RwLock::new(HashMap::new())),
            cursors: Arc::new(RwLock::new(HashMap::new())),
            shutdown_tx,
            task: Mutex::new(None),
        })
    }

    /// Track the queues already in the registry, then follow `events`
    pub fn start(self: &Arc<Self>, events: broadcast::Receiver<DiscoveryEvent>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        info!(
            interval_ms = self.settings.interval.as_millis() as u64,
            job_events = self.settings.job_events,
            "Starting queue metrics collector"
        );
        self.resync();

        let collector = self.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        *task = Some(tokio::spawn(collector.run(events, shutdown_rx)));
    }

    async fn run(
        self: Arc<Self>,
        mut events: broadcast::Receiver<DiscoveryEvent>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(DiscoveryEvent::QueueCreated { handle, .. }) => self.track(handle),
                    Ok(DiscoveryEvent::QueueRemoved { identity }) => self.untrack(&identity),
                    Ok(DiscoveryEvent::ServiceReady) => {}
                    Ok(DiscoveryEvent::ServiceClosed) => {
                        self.stop_all();
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Metrics collector lagged behind discovery events, resyncing");
                        self.resync();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown_rx.recv() => {
                    self.stop_all();
                    break;
                }
            }
        }
        debug!("Queue metrics collector stopped");
    }

    /// Identities currently polled, sorted
    pub fn tracked(&self) -> Vec<QueueIdentity> {
        let mut tracked: Vec<_> = self.tasks.lock().keys().cloned().collect();
        tracked.sort();
        tracked
    }

    /// Last job counts read for `identity`
    pub fn latest(&self, identity: &QueueIdentity) -> Option<JobCounts> {
        self.latest.read().get(identity).copied()
    }

    /// Id of the last event stream entry read for `identity`
    pub fn event_cursor(&self, identity: &QueueIdentity) -> Option<String> {
        self.cursors.read().get(identity).cloned()
    }

    fn track(&self, handle: Arc<QueueHandle>) {
        let identity = handle.identity().clone();
        let poller = tokio::spawn(poll(handle.clone(), self.settings.interval, self.latest.clone()));
        let follower = self
            .settings
            .job_events
            .then(|| tokio::spawn(follow_events(handle, self.settings.event_block, self.cursors.clone())));

        if let Some(previous) = self.tasks.lock().insert(identity.clone(), QueueTasks { poller, follower }) {
            previous.abort();
        }
        debug!(queue = %identity, "Collecting job metrics");
    }

    fn untrack(&self, identity: &QueueIdentity) {
        let tasks = self.tasks.lock().remove(identity);
        if let Some(tasks) = tasks {
            tasks.abort();
        }
        self.latest.write().remove(identity);
        self.cursors.write().remove(identity);
        job_metrics::clear_job_counts(identity);
        debug!(queue = %identity, "Stopped collecting job metrics");
    }

    /// Align pollers with the registry after missed events
    fn resync(&self) {
        let handles = self.registry.handles();
        let live: Vec<QueueIdentity> = handles.iter().map(|h| h.identity().clone()).collect();

        let stale: Vec<QueueIdentity> = self
            .tasks
            .lock()
            .keys()
            .filter(|identity| !live.contains(identity))
            .cloned()
            .collect();
        for identity in stale {
            self.untrack(&identity);
        }

        for handle in handles {
            let known = self.tasks.lock().contains_key(handle.identity());
            if !known {
                self.track(handle);
            }
        }
    }

    fn stop_all(&self) {
        let tasks: Vec<_> = self.tasks.lock().drain().collect();
        for (identity, tasks) in tasks {
            tasks.abort();
            job_metrics::clear_job_counts(&identity);
        }
        self.latest.write().clear();
        self.cursors.write().clear();
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.stop_all();
    }
}

async fn poll(handle: Arc<QueueHandle>, interval: Duration, latest: Arc<RwLock<HashMap<QueueIdentity, JobCounts>>>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        if handle.is_closed() {
            break;
        }
        match handle.job_counts().await {
            Ok(counts) => {
                job_metrics::record_job_counts(handle.identity(), &counts);
                latest.write().insert(handle.identity().clone(), counts);
            }
            Err(e) => warn!(queue = %handle.identity(), error = %e, "Failed to read job counts"),
        }
    }
}

/// Read the queue's event stream from its tail, counting every transition
async fn follow_events(handle: Arc<QueueHandle>, block: Duration, cursors: Arc<RwLock<HashMap<QueueIdentity, String>>>) {
    let mut cursor = STREAM_TAIL.to_string();

    loop {
        if handle.is_closed() {
            break;
        }
        let batch = match handle.read_events(&cursor, block, EVENT_BATCH_SIZE).await {
            Ok(batch) => batch,
            Err(e) => {
                if handle.is_closed() {
                    break;
                }
                warn!(queue = %handle.identity(), error = %e, "Failed to read job events");
                tokio::time::sleep(block).await;
                continue;
            }
        };

        for event in &batch.events {
            let job = match handle.job(&event.job_id).await {
                Ok(job) => job,
                Err(e) => {
                    debug!(queue = %handle.identity(), job_id = %event.job_id, error = %e, "Failed to read job");
                    None
                }
            };
            event_metrics::record_job_event(handle.identity(), event, job.as_ref());
        }

        if let Some(last_id) = batch.last_id {
            cursors.write().insert(handle.identity().clone(), last_id.clone());
            cursor = last_id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bm_discovery::memory::InMemoryHandleFactory;
    use bm_discovery::{ConcurrencyGuard, EventPublisher, JobEventKind, JobRecord, RemovalReason};

    fn registry(factory: Arc<InMemoryHandleFactory>) -> Arc<QueueRegistry> {
        QueueRegistry::new(
            factory,
            ConcurrencyGuard::mutation(Duration::from_secs(1)),
            EventPublisher::default(),
        )
    }

    fn settings(interval: Duration) -> CollectorSettings {
        CollectorSettings {
            interval,
            job_events: true,
            event_block: Duration::from_millis(20),
        }
    }

    async fn eventually(what: &str, check: impl Fn() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_polls_created_queues() {
        let factory = Arc::new(InMemoryHandleFactory::new());
        let orders = QueueIdentity::new("bull", "orders");
        factory.set_counts(&orders, JobCounts { waiting: 4, active: 1, ..Default::default() });
        let registry = registry(factory);

        let collector = QueueMetricsCollector::new(registry.clone(), settings(Duration::from_millis(20)));
        collector.start(registry.events().subscribe());

        registry.add(&orders).await.unwrap();
        eventually("counts collected", || collector.latest(&orders).is_some()).await;

        let counts = collector.latest(&orders).unwrap();
        assert_eq!(counts.waiting, 4);
        assert_eq!(counts.active, 1);
        assert_eq!(collector.tracked(), vec![orders.clone()]);

        collector.shutdown().await;
    }

    #[tokio::test]
    async fn test_removed_queue_stops_polling() {
        let factory = Arc::new(InMemoryHandleFactory::new());
        let registry = registry(factory);
        let orders = QueueIdentity::new("bull", "orders");

        let collector = QueueMetricsCollector::new(registry.clone(), settings(Duration::from_millis(20)));
        collector.start(registry.events().subscribe());

        registry.add(&orders).await.unwrap();
        eventually("queue tracked", || collector.latest(&orders).is_some()).await;

        registry.remove(&orders, RemovalReason::Notification).await.unwrap();
        eventually("queue untracked", || collector.tracked().is_empty()).await;
        assert!(collector.latest(&orders).is_none());

        collector.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_tracks_existing_queues() {
        let factory = Arc::new(InMemoryHandleFactory::new());
        let registry = registry(factory);
        let first = QueueIdentity::new("bull", "first");
        let second = QueueIdentity::new("bull", "second");
        registry.add(&first).await.unwrap();
        registry.add(&second).await.unwrap();

        let collector = QueueMetricsCollector::new(registry.clone(), settings(Duration::from_secs(60)));
        collector.start(registry.events().subscribe());

        assert_eq!(collector.tracked(), vec![first, second]);
        collector.shutdown().await;
        assert!(collector.tracked().is_empty());
    }

    #[tokio::test]
    async fn test_follows_job_events() {
        let factory = Arc::new(InMemoryHandleFactory::new());
        let registry = registry(factory.clone());
        let orders = QueueIdentity::new("bull", "orders");

        let collector = QueueMetricsCollector::new(registry.clone(), settings(Duration::from_secs(60)));
        collector.start(registry.events().subscribe());
        registry.add(&orders).await.unwrap();
        eventually("queue tracked", || collector.tracked() == vec![orders.clone()]).await;

        let clients = factory.clients(&orders).unwrap();
        clients.queue.insert_job("7", JobRecord { name: "resize".to_string(), ..Default::default() });
        clients.support.push_event(JobEventKind::Active, "7", None);
        clients.support.push_event(JobEventKind::Failed, "7", Some("boom"));
        let last = clients.support.push_uncounted_event();

        eventually("events read", || collector.event_cursor(&orders).as_deref() == Some(last.as_str())).await;

        registry.remove(&orders, RemovalReason::Notification).await.unwrap();
        eventually("queue untracked", || collector.tracked().is_empty()).await;
        assert!(collector.event_cursor(&orders).is_none());

        collector.shutdown().await;
    }

    #[tokio::test]
    async fn test_job_events_can_be_disabled() {
        let factory = Arc::new(InMemoryHandleFactory::new());
        let registry = registry(factory.clone());
        let orders = QueueIdentity::new("bull", "orders");

        let collector = QueueMetricsCollector::new(
            registry.clone(),
            CollectorSettings {
                job_events: false,
                ..settings(Duration::from_millis(20))
            },
        );
        collector.start(registry.events().subscribe());
        registry.add(&orders).await.unwrap();
        eventually("counts collected", || collector.latest(&orders).is_some()).await;

        factory.clients(&orders).unwrap().support.push_event(JobEventKind::Active, "7", None);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(collector.event_cursor(&orders).is_none());

        collector.shutdown().await;
    }
}
