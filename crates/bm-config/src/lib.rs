//! Bull Monitor Configuration System
//!
//! TOML-based configuration with environment variable overrides.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Environment variable error: {0}")]
    EnvError(String),
}

/// Characters that would turn a watched prefix into a wider glob, plus the key separator
const RESERVED_PREFIX_CHARACTERS: &[char] = &['*', '?', '[', ']', '\\', ':'];

/// Root application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub redis: RedisConfig,
    pub discovery: DiscoveryConfig,
    pub metrics: MetricsConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

/// Redis connection configuration, shared by both engine connections
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Logical database; also selects the `__keyspace@{db}__` channel namespace
    pub db: i64,
    pub connect_timeout_ms: u64,
    /// How often the administrative connection is probed with PING
    pub health_check_interval_ms: u64,
    /// Initial delay before a reconnect attempt (doubles up to the max)
    pub reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            username: None,
            password: None,
            db: 0,
            connect_timeout_ms: 5000,
            health_check_interval_ms: 1000,
            reconnect_delay_ms: 500,
            max_reconnect_delay_ms: 10_000,
        }
    }
}

impl RedisConfig {
    /// Connection URL with percent-encoded credentials
    pub fn url(&self) -> String {
        let credentials = match (&self.username, &self.password) {
            (Some(user), Some(pass)) => format!(
                "{}:{}@",
                urlencoding::encode(user),
                urlencoding::encode(pass)
            ),
            (None, Some(pass)) => format!(":{}@", urlencoding::encode(pass)),
            (Some(user), None) => format!("{}@", urlencoding::encode(user)),
            (None, None) => String::new(),
        };
        format!("redis://{}{}:{}/{}", credentials, self.host, self.port, self.db)
    }

    /// Same as [`url`](Self::url) with the password masked, for logging
    pub fn redacted_url(&self) -> String {
        let masked = Self {
            password: self.password.as_ref().map(|_| "****".to_string()),
            ..self.clone()
        };
        masked.url().replace("%2A%2A%2A%2A", "****")
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_delay_ms)
    }
}

/// Queue discovery engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Queue prefixes to watch
    pub watch_prefixes: Vec<String>,
    /// Whether the engine may update `notify-keyspace-events`
    pub configure_keyspace_notifications: bool,
    /// Flags that must be present in `notify-keyspace-events`
    pub keyspace_flags: String,
    /// Suffix of the queue metadata key
    pub metadata_suffix: String,
    /// Keys requested per SCAN page
    pub scan_page_size: usize,
    pub lifecycle_lock_timeout_ms: u64,
    pub mutation_lock_timeout_ms: u64,
    /// Periodic reconciliation interval; 0 disables it
    pub reconcile_interval_secs: u64,
    /// Reconcile after the notification connection re-subscribes
    pub reconcile_on_resubscribe: bool,
    /// PING interval for each queue's support connection
    pub support_keepalive_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            watch_prefixes: vec!["bull".to_string()],
            configure_keyspace_notifications: true,
            keyspace_flags: "A$K".to_string(),
            metadata_suffix: "meta".to_string(),
            scan_page_size: 100,
            lifecycle_lock_timeout_ms: 10_000,
            mutation_lock_timeout_ms: 10_000,
            reconcile_interval_secs: 0,
            reconcile_on_resubscribe: true,
            support_keepalive_ms: 30_000,
        }
    }
}

impl DiscoveryConfig {
    pub fn lifecycle_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lifecycle_lock_timeout_ms)
    }

    pub fn mutation_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.mutation_lock_timeout_ms)
    }

    pub fn reconcile_interval(&self) -> Option<Duration> {
        (self.reconcile_interval_secs > 0).then(|| Duration::from_secs(self.reconcile_interval_secs))
    }

    pub fn support_keepalive(&self) -> Duration {
        Duration::from_millis(self.support_keepalive_ms)
    }
}

/// Split a comma-separated prefix list, trimming whitespace and dropping empties
pub fn parse_prefix_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// Queue metrics collection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    /// Job count polling interval per queue
    pub collect_interval_ms: u64,
    /// Follow each queue's event stream for per-job counters and timings
    pub job_events: bool,
    /// Longest wait of one event stream read; must stay below the Redis connect timeout
    pub event_block_ms: u64,
    /// Drop counter and summary series not updated for this long; 0 keeps them forever
    pub series_idle_timeout_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            collect_interval_ms: 60_000,
            job_events: true,
            event_block_ms: 1_000,
            series_idle_timeout_secs: 900,
        }
    }
}

impl MetricsConfig {
    pub fn collect_interval(&self) -> Duration {
        Duration::from_millis(self.collect_interval_ms)
    }

    pub fn event_block(&self) -> Duration {
        Duration::from_millis(self.event_block_ms)
    }

    pub fn series_idle_timeout(&self) -> Option<Duration> {
        (self.series_idle_timeout_secs > 0).then(|| Duration::from_secs(self.series_idle_timeout_secs))
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration with environment variable override
    pub fn load() -> Result<Self, ConfigError> {
        let loader = ConfigLoader::new();
        loader.load()
    }

    /// Check invariants the engine relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.discovery.watch_prefixes.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one queue prefix must be watched".to_string(),
            ));
        }
        for prefix in &self.discovery.watch_prefixes {
            if prefix.trim().is_empty() {
                return Err(ConfigError::ValidationError("empty queue prefix".to_string()));
            }
            if prefix.contains(RESERVED_PREFIX_CHARACTERS) {
                return Err(ConfigError::ValidationError(format!(
                    "queue prefix '{}' contains glob or separator characters",
                    prefix
                )));
            }
        }
        if self.discovery.metadata_suffix.is_empty() || self.discovery.metadata_suffix.contains(':') {
            return Err(ConfigError::ValidationError(format!(
                "invalid metadata suffix '{}'",
                self.discovery.metadata_suffix
            )));
        }
        if self.discovery.scan_page_size == 0 {
            return Err(ConfigError::ValidationError("scan_page_size must be positive".to_string()));
        }
        if self.discovery.lifecycle_lock_timeout_ms == 0 || self.discovery.mutation_lock_timeout_ms == 0 {
            return Err(ConfigError::ValidationError("lock timeouts must be positive".to_string()));
        }
        if self.http.port == 0 {
            return Err(ConfigError::ValidationError("http port must be non-zero".to_string()));
        }
        if self.redis.port == 0 {
            return Err(ConfigError::ValidationError("redis port must be non-zero".to_string()));
        }
        if self.metrics.enabled && self.metrics.collect_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "collect_interval_ms must be positive when metrics are enabled".to_string(),
            ));
        }
        if self.metrics.enabled && self.metrics.job_events {
            // XREAD BLOCK 0 never returns
            if self.metrics.event_block_ms == 0 {
                return Err(ConfigError::ValidationError(
                    "event_block_ms must be positive when job events are collected".to_string(),
                ));
            }
            if self.metrics.event_block_ms >= self.redis.connect_timeout_ms {
                return Err(ConfigError::ValidationError(format!(
                    "event_block_ms ({}) must be below redis connect_timeout_ms ({})",
                    self.metrics.event_block_ms, self.redis.connect_timeout_ms
                )));
            }
        }
        Ok(())
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# Bull Monitor Configuration
# Environment variables override these settings

[http]
host = "0.0.0.0"
port = 3000

[redis]
host = "127.0.0.1"
port = 6379
# username = "default"
# password = ""
db = 0
connect_timeout_ms = 5000
health_check_interval_ms = 1000
reconnect_delay_ms = 500
max_reconnect_delay_ms = 10000

[discovery]
watch_prefixes = ["bull"]
configure_keyspace_notifications = true
keyspace_flags = "A$K"
metadata_suffix = "meta"
scan_page_size = 100
lifecycle_lock_timeout_ms = 10000
mutation_lock_timeout_ms = 10000
reconcile_interval_secs = 0  # 0 disables periodic reconciliation
reconcile_on_resubscribe = true
support_keepalive_ms = 30000

[metrics]
enabled = true
collect_interval_ms = 60000
job_events = true
event_block_ms = 1000
series_idle_timeout_secs = 900  # 0 keeps removed queues' series forever
"#
        .to_string()
    }
}
