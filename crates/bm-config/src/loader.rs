//! Configuration loader with file and environment variable support

use crate::{parse_prefix_list, AppConfig, ConfigError};
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "config.toml",
    "bull-monitor.toml",
    "./config/config.toml",
    "/etc/bull-monitor/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
    /// Replaces the process environment when set (tests)
    env_overrides: Option<HashMap<String, String>>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self {
            config_path: None,
            env_overrides: None,
        }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
            env_overrides: None,
        }
    }

    /// Read variables from the given map instead of the process environment
    pub fn with_env(mut self, vars: HashMap<String, String>) -> Self {
        self.env_overrides = Some(vars);
        self
    }

    /// Load configuration from file (if found) with environment variable overrides,
    /// then validate it
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config)?;
        config.validate()?;

        Ok(config)
    }

    fn var(&self, name: &str) -> Option<String> {
        match &self.env_overrides {
            Some(vars) => vars.get(name).cloned(),
            None => env::var(name).ok(),
        }
    }

    /// Find the configuration file to use
    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Some(path) = self.var("BULL_MONITOR_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        // Explicit sources only when the environment is injected
        if self.env_overrides.is_some() {
            return None;
        }

        CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }

    fn parse_var<T: std::str::FromStr>(&self, name: &str) -> Result<Option<T>, ConfigError> {
        match self.var(name) {
            Some(val) => val
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| ConfigError::EnvError(format!("{} has invalid value '{}'", name, val))),
            None => Ok(None),
        }
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut AppConfig) -> Result<(), ConfigError> {
        // HTTP
        if let Some(val) = self.var("HOST") {
            config.http.host = val;
        }
        if let Some(port) = self.parse_var("PORT")? {
            config.http.port = port;
        }

        // Redis
        if let Some(val) = self.var("REDIS_HOST") {
            config.redis.host = val;
        }
        if let Some(port) = self.parse_var("REDIS_PORT")? {
            config.redis.port = port;
        }
        if let Some(val) = self.var("REDIS_USERNAME") {
            config.redis.username = (!val.is_empty()).then_some(val);
        }
        if let Some(val) = self.var("REDIS_PASSWORD") {
            config.redis.password = (!val.is_empty()).then_some(val);
        }
        if let Some(db) = self.parse_var("REDIS_DB")? {
            config.redis.db = db;
        }

        // Discovery
        if let Some(val) = self.var("BULL_WATCH_QUEUE_PREFIXES") {
            config.discovery.watch_prefixes = parse_prefix_list(&val);
        }
        if let Some(enabled) = self.parse_var("REDIS_CONFIGURE_KEYSPACE_NOTIFICATIONS")? {
            config.discovery.configure_keyspace_notifications = enabled;
        }
        if let Some(secs) = self.parse_var("BULL_RECONCILE_INTERVAL_SECS")? {
            config.discovery.reconcile_interval_secs = secs;
        }

        // Metrics
        if let Some(interval) = self.parse_var("BULL_COLLECT_QUEUE_METRICS_INTERVAL_MS")? {
            config.metrics.collect_interval_ms = interval;
        }
        if let Some(enabled) = self.parse_var("BULL_COLLECT_JOB_EVENTS")? {
            config.metrics.job_events = enabled;
        }

        Ok(())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_env_overrides() {
        let config = ConfigLoader::new()
            .with_env(env(&[
                ("REDIS_HOST", "redis.internal"),
                ("REDIS_PORT", "6380"),
                ("REDIS_PASSWORD", "secret"),
                ("BULL_WATCH_QUEUE_PREFIXES", "bull, jobs"),
                ("REDIS_CONFIGURE_KEYSPACE_NOTIFICATIONS", "false"),
                ("BULL_COLLECT_QUEUE_METRICS_INTERVAL_MS", "15000"),
                ("BULL_COLLECT_JOB_EVENTS", "false"),
                ("PORT", "8080"),
            ]))
            .load()
            .unwrap();

        assert_eq!(config.redis.host, "redis.internal");
        assert_eq!(config.redis.port, 6380);
        assert_eq!(config.redis.password.as_deref(), Some("secret"));
        assert_eq!(config.discovery.watch_prefixes, vec!["bull", "jobs"]);
        assert!(!config.discovery.configure_keyspace_notifications);
        assert_eq!(config.metrics.collect_interval_ms, 15000);
        assert!(!config.metrics.job_events);
        assert_eq!(config.http.port, 8080);
    }

    #[test]
    fn test_invalid_env_value_is_an_error() {
        let result = ConfigLoader::new()
            .with_env(env(&[("REDIS_PORT", "not-a-port")]))
            .load();
        assert!(matches!(result, Err(ConfigError::EnvError(_))));
    }

    #[test]
    fn test_empty_prefix_list_fails_validation() {
        let result = ConfigLoader::new()
            .with_env(env(&[("BULL_WATCH_QUEUE_PREFIXES", " , ")]))
            .load();
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_file_then_env() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[redis]
host = "from-file"
port = 7000

[discovery]
watch_prefixes = ["file"]
"#
        )
        .unwrap();

        let config = ConfigLoader::with_path(file.path())
            .with_env(env(&[("REDIS_PORT", "7001")]))
            .load()
            .unwrap();

        assert_eq!(config.redis.host, "from-file");
        assert_eq!(config.redis.port, 7001);
        assert_eq!(config.discovery.watch_prefixes, vec!["file"]);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = ConfigLoader::with_path("/nonexistent/bull-monitor.toml")
            .with_env(HashMap::new())
            .load()
            .unwrap();
        assert_eq!(config.redis.host, "127.0.0.1");
    }
}
