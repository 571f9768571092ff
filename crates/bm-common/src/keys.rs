//! Queue key parsing and naming
//!
//! Queues are laid out in Redis as `{prefix}:{name}:{structure}`. The metadata
//! hash (`{prefix}:{name}:meta`) exists for as long as the queue does, so it is
//! the key both the reconciliation scan and the keyspace subscriptions target.
//!
//! Keyspace channels look like `__keyspace@0__:bull:orders:meta`; the metadata
//! pattern is not anchored at the start so channels and raw keys parse the same.

use regex::Regex;
use std::sync::OnceLock;

use crate::{QueueIdentity, DEFAULT_METADATA_SUFFIX};

/// `{prefix}:{name}:` at the start of a key
fn generic_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^(?P<prefix>[^:]+):(?P<name>[^:]+):").ok())
        .as_ref()
}

/// `{prefix}:{name}:` at the end of a key whose metadata suffix was stripped
fn metadata_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?P<prefix>[^:]+):(?P<name>[^:]+):$").ok())
        .as_ref()
}

/// Parses queue identities out of storage keys and notification channels
#[derive(Debug, Clone)]
pub struct QueueKeyParser {
    metadata_suffix: String,
}

impl QueueKeyParser {
    pub fn new(metadata_suffix: &str) -> Self {
        Self {
            metadata_suffix: metadata_suffix.to_string(),
        }
    }

    pub fn metadata_suffix(&self) -> &str {
        &self.metadata_suffix
    }

    /// Derive the queue identity for a key or channel name.
    ///
    /// Keys ending in the metadata suffix use the metadata shape, everything
    /// else the generic `{prefix}:{name}:` shape. Never fails: keys matching
    /// neither yield [`QueueIdentity::unknown`].
    pub fn parse(&self, key: &str) -> QueueIdentity {
        let (pattern, subject) = match self.strip_metadata_suffix(key) {
            Some(rest) => (metadata_pattern(), rest),
            None => (generic_pattern(), key),
        };

        let captures = match pattern.and_then(|p| p.captures(subject)) {
            Some(captures) => captures,
            None => return QueueIdentity::unknown(),
        };
        match (captures.name("prefix"), captures.name("name")) {
            (Some(prefix), Some(name)) => QueueIdentity::new(prefix.as_str(), name.as_str()),
            _ => QueueIdentity::unknown(),
        }
    }

    /// The key up to and including the separator before the metadata suffix
    fn strip_metadata_suffix<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_suffix(self.metadata_suffix.as_str())
            .filter(|rest| rest.ends_with(':'))
    }

    /// Glob pattern matching every metadata key under `prefix`
    pub fn scan_pattern(&self, prefix: &str) -> String {
        format!("{}:*:{}", prefix, self.metadata_suffix)
    }

    /// Keyspace channel pattern for metadata keys under `prefix` in database `db`
    pub fn keyspace_pattern(&self, db: i64, prefix: &str) -> String {
        format!("__keyspace@{}__:{}", db, self.scan_pattern(prefix))
    }
}

impl Default for QueueKeyParser {
    fn default() -> Self {
        Self::new(DEFAULT_METADATA_SUFFIX)
    }
}

/// Parse with the default `meta` suffix
pub fn parse_queue_key(key: &str) -> QueueIdentity {
    static PARSER: OnceLock<QueueKeyParser> = OnceLock::new();
    PARSER.get_or_init(QueueKeyParser::default).parse(key)
}
