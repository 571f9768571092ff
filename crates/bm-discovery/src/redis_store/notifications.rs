//! Keyspace notification connection
//!
//! A dedicated pub/sub connection owned by a supervisor task. Subscription
//! requests reach the task over a command channel so that the pub/sub handle
//! is never shared. Pattern messages are forwarded as
//! [`StoreEvent::PatternMessage`].
//!
//! Redis drops every subscription with the connection, so after a reconnect
//! the lifecycle manager subscribes again on `Ready`.

use async_trait::async_trait;
use bm_config::RedisConfig;
use futures::StreamExt;
use parking_lot::Mutex;
use redis::aio::PubSub;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::ConnectionSettings;
use crate::error::{DiscoveryError, Result};
use crate::store::{
    store_event_channel, ConnectionState, NotificationStore, StoreEvent, StoreEventReceiver,
    StoreEventSender,
};

const COMMAND_BUFFER: usize = 64;

enum Command {
    Subscribe(String, oneshot::Sender<Result<()>>),
    Unsubscribe(String, oneshot::Sender<Result<()>>),
}

impl Command {
    fn reject(self, reason: &str) {
        let (Command::Subscribe(_, reply) | Command::Unsubscribe(_, reply)) = self;
        let _ = reply.send(Err(DiscoveryError::NotConnected(reason.to_string())));
    }
}

/// Outcome of one wait on the pub/sub connection
enum Step {
    Message(redis::Msg),
    Command(Command),
    StreamEnded,
    Shutdown,
}

pub struct RedisNotificationConnection {
    client: redis::Client,
    settings: ConnectionSettings,
    events: StoreEventSender,
    state_tx: watch::Sender<ConnectionState>,
    commands_tx: mpsc::Sender<Command>,
    commands_rx: Mutex<Option<mpsc::Receiver<Command>>>,
    shutdown_tx: broadcast::Sender<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RedisNotificationConnection {
    pub fn new(config: &RedisConfig) -> Result<(Arc<Self>, StoreEventReceiver)> {
        let client = redis::Client::open(config.url().as_str())?;
        let (events, events_rx) = store_event_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (shutdown_tx, _) = broadcast::channel(1);

        let connection = Arc::new(Self {
            client,
            settings: ConnectionSettings::from_config(config),
            events,
            state_tx,
            commands_tx,
            commands_rx: Mutex::new(Some(commands_rx)),
            shutdown_tx,
            task: Mutex::new(None),
        });
        Ok((connection, events_rx))
    }

    /// Spawn the supervisor task. Calls after the first do nothing.
    pub fn start(self: &Arc<Self>) {
        let Some(commands) = self.commands_rx.lock().take() else {
            return;
        };
        let shutdown_rx = self.shutdown_tx.subscribe();
        let task = tokio::spawn(self.clone().supervise(commands, shutdown_rx));
        *self.task.lock() = Some(task);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn emit(&self, event: StoreEvent) {
        if let Some(state) = event.state() {
            self.state_tx.send_replace(state);
        }
        let _ = self.events.send(event);
    }

    async fn supervise(
        self: Arc<Self>,
        mut commands: mpsc::Receiver<Command>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
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
                Ok(mut pubsub) => {
                    delay = self.settings.reconnect_delay;
                    info!(url = %self.settings.redacted_url, "Notification connection established");
                    self.emit(StoreEvent::Ready);

                    let shutting_down = self.pump(&mut pubsub, &mut commands, &mut shutdown_rx).await;
                    self.emit(StoreEvent::Closed);
                    if shutting_down {
                        return;
                    }
                }
                Err(e) => {
                    warn!(url = %self.settings.redacted_url, error = %e, "Notification connection failed");
                    self.emit(StoreEvent::Error(e.to_string()));
                }
            }

            debug!(delay_ms = delay.as_millis() as u64, "Waiting before reconnecting notification connection");
            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    Some(command) = commands.recv() => command.reject("notification connection is down"),
                    _ = shutdown_rx.recv() => {
                        self.emit(StoreEvent::Closed);
                        return;
                    }
                }
            }
            delay = self.settings.next_delay(delay);
        }
    }

    async fn connect(&self) -> Result<PubSub> {
        match tokio::time::timeout(self.settings.connect_timeout, self.client.get_async_pubsub()).await {
            Ok(pubsub) => Ok(pubsub?),
            Err(_) => Err(DiscoveryError::NotConnected(format!(
                "connect timed out after {:?}",
                self.settings.connect_timeout
            ))),
        }
    }

    /// Serve the connection until it drops (`false`) or shutdown (`true`)
    async fn pump(
        &self,
        pubsub: &mut PubSub,
        commands: &mut mpsc::Receiver<Command>,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> bool {
        loop {
            let step = {
                let mut messages = std::pin::pin!(pubsub.on_message());
                tokio::select! {
                    message = messages.next() => match message {
                        Some(message) => Step::Message(message),
                        None => Step::StreamEnded,
                    },
                    Some(command) = commands.recv() => Step::Command(command),
                    _ = shutdown_rx.recv() => Step::Shutdown,
                }
            };

            match step {
                Step::Message(message) => self.forward(&message),
                Step::Command(Command::Subscribe(pattern, reply)) => {
                    let result = pubsub.psubscribe(&pattern).await.map_err(DiscoveryError::from);
                    let _ = reply.send(result);
                }
                Step::Command(Command::Unsubscribe(pattern, reply)) => {
                    let result = pubsub.punsubscribe(&pattern).await.map_err(DiscoveryError::from);
                    let _ = reply.send(result);
                }
                Step::StreamEnded => {
                    warn!("Notification connection lost");
                    return false;
                }
                Step::Shutdown => return true,
            }
        }
    }

    fn forward(&self, message: &redis::Msg) {
        let payload = match message.get_payload::<String>() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(channel = %message.get_channel_name(), error = %e, "Ignoring undecodable notification payload");
                return;
            }
        };
        let pattern = message.get_pattern::<String>().unwrap_or_default();
        self.emit(StoreEvent::PatternMessage {
            pattern,
            channel: message.get_channel_name().to_string(),
            payload,
        });
    }

    async fn request(&self, build: impl FnOnce(oneshot::Sender<Result<()>>) -> Command) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands_tx
            .send(build(reply_tx))
            .await
            .map_err(|_| DiscoveryError::ShuttingDown)?;

        match tokio::time::timeout(self.settings.connect_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DiscoveryError::ShuttingDown),
            Err(_) => Err(DiscoveryError::NotConnected(
                "notification connection did not answer in time".to_string(),
            )),
        }
    }
}

#[async_trait]
impl NotificationStore for RedisNotificationConnection {
    async fn psubscribe(&self, pattern: &str) -> Result<()> {
        let pattern = pattern.to_string();
        self.request(|reply| Command::Subscribe(pattern, reply)).await
    }

    async fn punsubscribe(&self, pattern: &str) -> Result<()> {
        let pattern = pattern.to_string();
        self.request(|reply| Command::Unsubscribe(pattern, reply)).await
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
        info!("Notification connection closed");
    }
}
