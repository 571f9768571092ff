//! Keyspace notification flags
//!
//! `notify-keyspace-events` is a string of single-character flags. The
//! configurer adds the flags the listener depends on and leaves every other
//! flag an operator set in place. `A` is an alias for `g$lshzxetd`, so a
//! server reporting `AK` already satisfies `A$K`.

use std::sync::Arc;
use tracing::{debug, info};

use crate::error::Result;
use crate::store::AdminStore;

pub const DEFAULT_REQUIRED_FLAGS: &str = "A$K";

/// Event classes covered by the `A` alias
const ALL_EVENTS_ALIAS: &str = "g$lshzxetd";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigureOutcome {
    /// Flag management is turned off
    Disabled,
    AlreadyEnabled,
    Updated { previous: String, current: String },
}

/// Flags from `required` not covered by `current`
pub fn missing_flags(current: &str, required: &str) -> Vec<char> {
    let covers = |flag: char| {
        current.contains(flag) || (current.contains('A') && ALL_EVENTS_ALIAS.contains(flag))
    };
    let mut missing: Vec<char> = Vec::new();
    for flag in required.chars() {
        if !covers(flag) && !missing.contains(&flag) {
            missing.push(flag);
        }
    }
    missing
}

pub struct KeyspaceNotificationConfigurer {
    store: Arc<dyn AdminStore>,
    enabled: bool,
    required_flags: String,
}

impl KeyspaceNotificationConfigurer {
    pub fn new(store: Arc<dyn AdminStore>, enabled: bool, required_flags: impl Into<String>) -> Self {
        Self {
            store,
            enabled,
            required_flags: required_flags.into(),
        }
    }

    /// Make sure the required flags are set, writing only when some are missing.
    /// Read and write failures are returned to the caller.
    pub async fn ensure_enabled(&self) -> Result<ConfigureOutcome> {
        if !self.enabled {
            debug!("Keyspace notification configuration disabled");
            return Ok(ConfigureOutcome::Disabled);
        }

        let previous = self.store.notify_keyspace_events().await?;
        let missing = missing_flags(&previous, &self.required_flags);
        if missing.is_empty() {
            debug!(flags = %previous, "Keyspace notifications already enabled");
            return Ok(ConfigureOutcome::AlreadyEnabled);
        }

        let mut current = previous.clone();
        current.extend(missing);
        self.store.set_notify_keyspace_events(&current).await?;

        info!(previous = %previous, current = %current, "Enabled keyspace notifications");
        Ok(ConfigureOutcome::Updated { previous, current })
    }
}
