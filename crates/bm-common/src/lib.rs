//! Bull Monitor common types
//!
//! Shared by every crate in the workspace:
//! - `QueueIdentity`: the (prefix, name) pair naming a queue in Redis
//! - `QueueKeyParser`: derives identities from storage keys and keyspace channels
//! - Key and channel naming helpers used for scans and subscriptions
//! - Structured logging setup

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod keys;
pub mod logging;

pub use keys::{parse_queue_key, QueueKeyParser};

/// Sentinel value used for both prefix and name when a key cannot be parsed
pub const UNKNOWN: &str = "unknown";

/// Suffix of the per-queue hash key whose existence signals a live queue
pub const DEFAULT_METADATA_SUFFIX: &str = "meta";

/// Separator used to build inventory keys.
///
/// Parsed prefixes and names never contain a colon, so `:::` keeps the
/// composite key unambiguous.
pub const COMPOSITE_SEPARATOR: &str = ":::";

// ============================================================================
// Queue Identity
// ============================================================================

/// Identifies a queue across the watched namespace
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueIdentity {
    pub prefix: String,
    pub name: String,
}

impl QueueIdentity {
    pub fn new(prefix: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            name: name.into(),
        }
    }

    /// The identity produced for keys that match no known shape
    pub fn unknown() -> Self {
        Self::new(UNKNOWN, UNKNOWN)
    }

    pub fn is_unknown(&self) -> bool {
        self.prefix == UNKNOWN && self.name == UNKNOWN
    }

    /// Inventory key: `prefix:::name`
    pub fn composite_key(&self) -> String {
        format!("{}{}{}", self.prefix, COMPOSITE_SEPARATOR, self.name)
    }

    /// Inverse of [`composite_key`](Self::composite_key).
    ///
    /// Splits on the last separator so prefixes containing `:::` still round-trip.
    pub fn from_composite_key(key: &str) -> Option<Self> {
        let (prefix, name) = key.rsplit_once(COMPOSITE_SEPARATOR)?;
        if prefix.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self::new(prefix, name))
    }

    /// Redis key of one of this queue's structures, e.g. `bull:orders:wait`
    pub fn key(&self, suffix: &str) -> String {
        format!("{}:{}:{}", self.prefix, self.name, suffix)
    }
}

impl fmt::Display for QueueIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.prefix, self.name)
    }
}
