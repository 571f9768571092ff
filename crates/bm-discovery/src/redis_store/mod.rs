//! Redis adapters for the store ports
//!
//! - [`RedisAdminConnection`]: multiplexed connection for `CONFIG` and `SCAN`,
//!   health-checked with `PING` and reconnected with exponential backoff
//! - [`RedisNotificationConnection`]: dedicated pub/sub connection for
//!   keyspace pattern subscriptions
//! - [`RedisHandleFactory`]: per-queue clients; the queue client shares the
//!   admin connection, the support client opens its own

mod admin;
mod clients;
mod notifications;

pub use admin::RedisAdminConnection;
pub use clients::{RedisHandleFactory, RedisQueueClient, RedisSupportClient};
pub use notifications::RedisNotificationConnection;

use bm_config::RedisConfig;
use std::time::Duration;

/// Connection timing shared by both adapters
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Connection URL with the password masked
    pub redacted_url: String,
    pub connect_timeout: Duration,
    pub health_check_interval: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
}

impl ConnectionSettings {
    pub fn from_config(config: &RedisConfig) -> Self {
        Self {
            redacted_url: config.redacted_url(),
            connect_timeout: config.connect_timeout(),
            health_check_interval: config.health_check_interval(),
            reconnect_delay: config.reconnect_delay(),
            max_reconnect_delay: config.max_reconnect_delay(),
        }
    }

    /// Backoff after `current`, doubling up to the maximum
    pub fn next_delay(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_reconnect_delay)
    }
}
