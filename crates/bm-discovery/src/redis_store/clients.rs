//! Per-queue Redis clients
//!
//! - [`RedisQueueClient`] reads job counts and job hashes over the shared admin
//!   connection and faults when that connection is lost after the client was created
//! - [`RedisSupportClient`] holds a dedicated named connection kept alive with
//!   `PING`. Blocking `XREAD`s on the queue's event stream run there so they never
//!   stall the admin connection. It does no scheduling work and faults when a
//!   keepalive or a read loses the connection.

use async_trait::async_trait;
use bm_common::QueueIdentity;
use bm_config::RedisConfig;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::RedisAdminConnection;
use crate::error::{DiscoveryError, Result};
use crate::handle::{EventStreamClient, HandleFactory, JobCounts, ManagedClient, QueueClient, QueueHandle};
use crate::job_events::{JobEvent, JobEventBatch, JobRecord, EVENTS_KEY_SUFFIX};

/// Wait for a fault reason on `rx`, pending forever if the sender is gone
async fn wait_for_fault(rx: &mut watch::Receiver<Option<String>>) -> String {
    let fault = rx
        .wait_for(|fault| fault.is_some())
        .await
        .map(|fault| fault.clone().unwrap_or_default());
    match fault {
        Ok(reason) => reason,
        Err(_) => std::future::pending().await,
    }
}

fn is_connection_failure(error: &redis::RedisError) -> bool {
    error.is_connection_dropped() || error.is_io_error() || error.is_timeout()
}

pub struct RedisQueueClient {
    identity: QueueIdentity,
    admin: Arc<RedisAdminConnection>,
    disconnects_at_creation: u64,
    fault: watch::Sender<Option<String>>,
    closed: AtomicBool,
}

impl RedisQueueClient {
    pub fn new(identity: QueueIdentity, admin: Arc<RedisAdminConnection>) -> Self {
        let (fault, _) = watch::channel(None);
        Self {
            identity,
            disconnects_at_creation: admin.disconnects(),
            admin,
            fault,
            closed: AtomicBool::new(false),
        }
    }

    fn trip(&self, reason: String) {
        self.fault.send_if_modified(|fault| {
            if fault.is_some() {
                return false;
            }
            *fault = Some(reason);
            true
        });
    }
}

#[async_trait]
impl ManagedClient for RedisQueueClient {
    async fn close(&self) -> Result<()> {
        // the connection belongs to the admin adapter
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn faulted(&self) -> String {
        let mut fault_rx = self.fault.subscribe();
        let mut disconnects_rx = self.admin.subscribe_disconnects();
        let baseline = self.disconnects_at_creation;

        tokio::select! {
            reason = wait_for_fault(&mut fault_rx) => reason,
            lost = async {
                disconnects_rx.wait_for(|count| *count != baseline).await.is_ok()
            } => {
                if lost {
                    "admin connection lost".to_string()
                } else {
                    std::future::pending().await
                }
            }
        }
    }
}

#[async_trait]
impl QueueClient for RedisQueueClient {
    async fn job_counts(&self) -> Result<JobCounts> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DiscoveryError::handle(&self.identity, "queue client is closed"));
        }
        let mut connection = self.admin.connection()?;

        let result: redis::RedisResult<(u64, u64, u64, u64, u64)> = redis::pipe()
            .cmd("LLEN")
            .arg(self.identity.key("wait"))
            .cmd("LLEN")
            .arg(self.identity.key("active"))
            .cmd("ZCARD")
            .arg(self.identity.key("completed"))
            .cmd("ZCARD")
            .arg(self.identity.key("failed"))
            .cmd("ZCARD")
            .arg(self.identity.key("delayed"))
            .query_async(&mut connection)
            .await;

        match result {
            Ok((waiting, active, completed, failed, delayed)) => Ok(JobCounts {
                waiting,
                active,
                completed,
                failed,
                delayed,
            }),
            Err(e) => {
                if is_connection_failure(&e) {
                    self.trip(e.to_string());
                }
                Err(e.into())
            }
        }
    }

    async fn job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DiscoveryError::handle(&self.identity, "queue client is closed"));
        }
        let mut connection = self.admin.connection()?;

        let fields: redis::RedisResult<HashMap<String, String>> = connection.hgetall(self.identity.key(job_id)).await;
        match fields {
            Ok(fields) => Ok(JobRecord::from_fields(&fields)),
            Err(e) => {
                if is_connection_failure(&e) {
                    self.trip(e.to_string());
                }
                Err(e.into())
            }
        }
    }
}

pub struct RedisSupportClient {
    identity: QueueIdentity,
    connection: parking_lot::Mutex<Option<MultiplexedConnection>>,
    command_timeout: Duration,
    fault: watch::Sender<Option<String>>,
    keepalive: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl RedisSupportClient {
    /// Open a dedicated connection named after the queue and start the keepalive
    pub async fn connect(
        identity: QueueIdentity,
        client: &redis::Client,
        connect_timeout: Duration,
        keepalive_interval: Duration,
    ) -> Result<Arc<Self>> {
        let mut connection = tokio::time::timeout(connect_timeout, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| DiscoveryError::handle(&identity, "support connection timed out"))??;

        let _: () = redis::cmd("CLIENT")
            .arg("SETNAME")
            .arg(connection_name(&identity))
            .query_async(&mut connection)
            .await?;

        let (fault, _) = watch::channel(None);
        let support = Arc::new(Self {
            identity,
            connection: parking_lot::Mutex::new(Some(connection.clone())),
            command_timeout: connect_timeout,
            fault,
            keepalive: parking_lot::Mutex::new(None),
        });

        let task = tokio::spawn(Self::keep_alive(
            support.fault.clone(),
            connection,
            keepalive_interval,
            connect_timeout,
        ));
        *support.keepalive.lock() = Some(task);
        debug!(queue = %support.identity, "Support connection opened");
        Ok(support)
    }

    async fn keep_alive(
        fault: watch::Sender<Option<String>>,
        mut connection: MultiplexedConnection,
        interval: Duration,
        timeout: Duration,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let reply = tokio::time::timeout(timeout, redis::cmd("PING").query_async::<String>(&mut connection)).await;
            let reason = match reply {
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(_) => "keepalive timed out".to_string(),
            };
            fault.send_replace(Some(reason));
            return;
        }
    }
}

impl RedisSupportClient {
    fn trip(&self, reason: String) {
        self.fault.send_if_modified(|fault| {
            if fault.is_some() {
                return false;
            }
            *fault = Some(reason);
            true
        });
    }
}

/// Flatten an `XREAD` reply into counted events and the cursor to resume from
fn batch_from_reply(reply: Option<StreamReadReply>) -> JobEventBatch {
    let mut batch = JobEventBatch::default();
    let Some(reply) = reply else {
        return batch;
    };

    for stream in reply.keys {
        for entry in stream.ids {
            let fields: HashMap<String, String> = entry
                .map
                .iter()
                .filter_map(|(field, value)| {
                    redis::from_redis_value::<String>(value)
                        .ok()
                        .map(|value| (field.clone(), value))
                })
                .collect();
            if let Some(event) = JobEvent::from_fields(&entry.id, &fields) {
                batch.events.push(event);
            }
            batch.last_id = Some(entry.id);
        }
    }
    batch
}

/// `bull-monitor:{prefix}:{name}` with whitespace replaced, as `CLIENT SETNAME` rejects spaces
fn connection_name(identity: &QueueIdentity) -> String {
    format!("bull-monitor:{}:{}", identity.prefix, identity.name)
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect()
}

#[async_trait]
impl ManagedClient for RedisSupportClient {
    async fn close(&self) -> Result<()> {
        let task = self.keepalive.lock().take();
        if let Some(task) = task {
            task.abort();
        }
        self.connection.lock().take();
        debug!(queue = %self.identity, "Support connection closed");
        Ok(())
    }

    async fn faulted(&self) -> String {
        let mut rx = self.fault.subscribe();
        wait_for_fault(&mut rx).await
    }
}

#[async_trait]
impl EventStreamClient for RedisSupportClient {
    async fn read_events(&self, after: &str, block: Duration, count: usize) -> Result<JobEventBatch> {
        let connection = self.connection.lock().clone();
        let Some(mut connection) = connection else {
            return Err(DiscoveryError::handle(&self.identity, "support client is closed"));
        };

        let key = self.identity.key(EVENTS_KEY_SUFFIX);
        let options = StreamReadOptions::default()
            .count(count)
            .block(block.as_millis() as usize);
        let keys = [key];
        let ids = [after];
        let read = connection.xread_options::<_, _, Option<StreamReadReply>>(&keys, &ids, &options);

        match tokio::time::timeout(block + self.command_timeout, read).await {
            Ok(Ok(reply)) => Ok(batch_from_reply(reply)),
            Ok(Err(e)) => {
                if is_connection_failure(&e) {
                    self.trip(e.to_string());
                }
                Err(e.into())
            }
            Err(_) => {
                self.trip("event stream read timed out".to_string());
                Err(DiscoveryError::handle(&self.identity, "event stream read timed out"))
            }
        }
    }
}

impl Drop for RedisSupportClient {
    fn drop(&mut self) {
        if let Some(task) = self.keepalive.get_mut().take() {
            task.abort();
        }
    }
}

/// Builds handles over live Redis connections
pub struct RedisHandleFactory {
    admin: Arc<RedisAdminConnection>,
    connect_timeout: Duration,
    keepalive_interval: Duration,
}

impl RedisHandleFactory {
    pub fn new(admin: Arc<RedisAdminConnection>, config: &RedisConfig, keepalive_interval: Duration) -> Self {
        Self {
            admin,
            connect_timeout: config.connect_timeout(),
            keepalive_interval,
        }
    }
}

#[async_trait]
impl HandleFactory for RedisHandleFactory {
    async fn create(&self, identity: &QueueIdentity) -> Result<QueueHandle> {
        if !self.admin.state().is_ready() {
            return Err(DiscoveryError::NotConnected("admin connection".to_string()));
        }

        let queue = Arc::new(RedisQueueClient::new(identity.clone(), self.admin.clone()));
        let support = RedisSupportClient::connect(
            identity.clone(),
            self.admin.client(),
            self.connect_timeout,
            self.keepalive_interval,
        )
        .await
        .map_err(|e| {
            warn!(queue = %identity, error = %e, "Failed to open support connection");
            match e {
                DiscoveryError::Handle { .. } => e,
                other => DiscoveryError::handle(identity, other.to_string()),
            }
        })?;

        Ok(QueueHandle::new(identity.clone(), queue, support))
    }
}
