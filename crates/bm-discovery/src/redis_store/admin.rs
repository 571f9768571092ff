//! Administrative Redis connection
//!
//! A supervisor task owns the connection lifecycle:
//! - connect with a timeout, then emit `Ready`
//! - `PING` every health check interval; a failure emits `Error` then `Closed`
//! - reconnect with exponential backoff, emitting `Reconnecting`

use async_trait::async_trait;
use bm_config::RedisConfig;
use parking_lot::{Mutex, RwLock};
use redis::aio::MultiplexedConnection;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::ConnectionSettings;
use crate::error::{DiscoveryError, Result};
use crate::store::{
    store_event_channel, AdminStore, ConnectionState, StoreEvent, StoreEventReceiver,
    StoreEventSender,
};

const NOTIFY_KEYSPACE_EVENTS: &str = "notify-keyspace-events";

pub struct RedisAdminConnection {
    client: redis::Client,
    settings: ConnectionSettings,
    connection: RwLock<Option<MultiplexedConnection>>,
    events: StoreEventSender,
    state_tx: watch::Sender<ConnectionState>,
    /// Incremented every time an established connection is lost
    disconnects_tx: watch::Sender<u64>,
    shutdown_tx: broadcast::Sender<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RedisAdminConnection {
    pub fn new(config: &RedisConfig) -> Result<(Arc<Self>, StoreEventReceiver)> {
        let client = redis::Client::open(config.url().as_str())?;
        let (events, events_rx) = store_event_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let (disconnects_tx, _) = watch::channel(0);
        let (shutdown_tx, _) = broadcast::channel(1);

        let connection = Arc::new(Self {
            client,
            settings: ConnectionSettings::from_config(config),
            connection: RwLock::new(None),
            events,
            state_tx,
            disconnects_tx,
            shutdown_tx,
            task: Mutex::new(None),
        });
        Ok((connection, events_rx))
    }

    /// Spawn the supervisor task. Calls after the first do nothing.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        let shutdown_rx = self.shutdown_tx.subscribe();
        *task = Some(tokio::spawn(self.clone().supervise(shutdown_rx)));
    }

    pub fn client(&self) -> &redis::Client {
        &self.client
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn disconnects(&self) -> u64 {
        *self.disconnects_tx.borrow()
    }

    pub fn subscribe_disconnects(&self) -> watch::Receiver<u64> {
        self.disconnects_tx.subscribe()
    }

    /// A clone of the live connection
    pub fn connection(&self) -> Result<MultiplexedConnection> {
        self.connection
            .read()
            .clone()
            .ok_or_else(|| DiscoveryError::NotConnected("admin connection".to_string()))
    }

    fn emit(&self, event: StoreEvent) {
        if let Some(state) = event.state() {
            self.state_tx.send_replace(state);
        }
        let _ = self.events.send(event);
    }

    async fn supervise(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut delay = self.settings.reconnect_delay;
        let mut first_attempt = true;

        loop {
            self.emit(if first_attempt {
                StoreEvent::Connecting
            } else {
                StoreEvent::Reconnecting
            });
            first_attempt = false;

            match self.connect().await {
                Ok(connection) => {
                    *self.connection.write() = Some(connection);
                    delay = self.settings.reconnect_delay;
                    info!(url = %self.settings.redacted_url, "Admin connection established");
                    self.emit(StoreEvent::Ready);

                    let shutting_down = self.monitor(&mut shutdown_rx).await;

                    self.connection.write().take();
                    self.disconnects_tx.send_modify(|count| *count += 1);
                    self.emit(StoreEvent::Closed);
                    if shutting_down {
                        return;
                    }
                }
                Err(e) => {
                    warn!(url = %self.settings.redacted_url, error = %e, "Admin connection failed");
                    self.emit(StoreEvent::Error(e.to_string()));
                }
            }

            debug!(delay_ms = delay.as_millis() as u64, "Waiting before reconnecting admin connection");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.recv() => {
                    self.emit(StoreEvent::Closed);
                    return;
                }
            }
            delay = self.settings.next_delay(delay);
        }
    }

    async fn connect(&self) -> Result<MultiplexedConnection> {
        match tokio::time::timeout(
            self.settings.connect_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        {
            Ok(connection) => Ok(connection?),
            Err(_) => Err(DiscoveryError::NotConnected(format!(
                "connect timed out after {:?}",
                self.settings.connect_timeout
            ))),
        }
    }

    /// Health-check until the connection fails (`false`) or shutdown (`true`)
    async fn monitor(&self, shutdown_rx: &mut broadcast::Receiver<()>) -> bool {
        let mut ticker = tokio::time::interval(self.settings.health_check_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.ping().await {
                        warn!(error = %e, "Admin connection health check failed");
                        self.emit(StoreEvent::Error(e.to_string()));
                        return false;
                    }
                }
                _ = shutdown_rx.recv() => return true,
            }
        }
    }

    async fn ping(&self) -> Result<()> {
        let mut connection = self.connection()?;
        let reply = tokio::time::timeout(
            self.settings.connect_timeout,
            redis::cmd("PING").query_async::<String>(&mut connection),
        )
        .await
        .map_err(|_| DiscoveryError::NotConnected("PING timed out".to_string()))??;

        if reply != "PONG" {
            return Err(DiscoveryError::NotConnected(format!("unexpected PING reply '{}'", reply)));
        }
        Ok(())
    }
}

#[async_trait]
impl AdminStore for RedisAdminConnection {
    async fn notify_keyspace_events(&self) -> Result<String> {
        let mut connection = self.connection()?;
        // CONFIG GET replies with [name, value] pairs
        let reply: Vec<String> = redis::cmd("CONFIG")
            .arg("GET")
            .arg(NOTIFY_KEYSPACE_EVENTS)
            .query_async(&mut connection)
            .await?;
        Ok(reply.into_iter().nth(1).unwrap_or_default())
    }

    async fn set_notify_keyspace_events(&self, flags: &str) -> Result<()> {
        let mut connection = self.connection()?;
        let _: () = redis::cmd("CONFIG")
            .arg("SET")
            .arg(NOTIFY_KEYSPACE_EVENTS)
            .arg(flags)
            .query_async(&mut connection)
            .await?;
        Ok(())
    }

    async fn scan_hashes(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>)> {
        let mut connection = self.connection()?;
        let (next, raw): (u64, Vec<Vec<u8>>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count)
            .arg("TYPE")
            .arg("hash")
            .query_async(&mut connection)
            .await?;
        Ok((next, utf8_keys(raw)))
    }

    async fn close(&self) {
        let _ = self.shutdown_tx.send(());
        let task = self.task.lock().take();
        if let Some(task) = task {
            let abort = task.abort_handle();
            if tokio::time::timeout(self.settings.connect_timeout, task).await.is_err() {
                abort.abort();
            }
        }
        self.connection.write().take();
        info!("Admin connection closed");
    }
}

/// Keep the keys that are valid UTF-8; a queue name is always text
fn utf8_keys(raw: Vec<Vec<u8>>) -> Vec<String> {
    raw.into_iter()
        .filter_map(|key| match String::from_utf8(key) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(key = %String::from_utf8_lossy(e.as_bytes()), "Skipping non UTF-8 key from scan");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utf8_keys_skips_invalid_entries() {
        let raw = vec![
            b"bull:orders:meta".to_vec(),
            vec![b'b', b'u', b'l', b'l', b':', 0xff, 0xfe, b':', b'm', b'e', b't', b'a'],
            b"bull:emails:meta".to_vec(),
        ];

        assert_eq!(
            utf8_keys(raw),
            vec!["bull:orders:meta".to_string(), "bull:emails:meta".to_string()]
        );
    }
}
