//! Expiring key/value storage for per-client guard state.
//!
//! Entries are addressed by a namespace (`csrf`, `rate`, `lograte`) and a
//! key (always a hashed client identifier). Values are JSON documents with
//! an optional absolute expiry; an expired entry reads as absent and is
//! removed when it is next touched.
//!
//! Two backends:
//! - [`FileStore`]: one file per entry, shared between processes through
//!   advisory locks. Best effort: the last writer wins.
//! - [`MemoryStore`]: in-process map for tests and single-process runs.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What an [`KeyValueStore::update`] closure wants done with the entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Leave the entry untouched.
    Keep,
    /// Replace the entry.
    Put { value: Value, ttl: Option<Duration> },
    /// Delete the entry.
    Remove,
}

pub trait KeyValueStore: Send + Sync {
    fn get(&self, ns: &str, key: &str) -> Result<Option<Value>>;

    fn set(&self, ns: &str, key: &str, value: Value, ttl: Option<Duration>) -> Result<()>;

    fn delete(&self, ns: &str, key: &str) -> Result<()>;

    /// Read-modify-write under the entry's lock.
    ///
    /// The closure sees the current live value (`None` when absent or
    /// expired) and decides what to store.
    fn update(
        &self,
        ns: &str,
        key: &str,
        f: &mut dyn FnMut(Option<&Value>) -> Mutation,
    ) -> Result<()>;

    /// Remove every expired entry. Returns how many were removed.
    fn purge_expired(&self) -> Result<usize>;
}

/// On-disk / in-memory representation of one entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredEntry {
    pub value: Value,

    /// Unix seconds; `None` = never expires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

impl StoredEntry {
    pub fn new(value: Value, ttl: Option<Duration>, now: DateTime<Utc>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| (now + ttl).timestamp()),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if at <= now.timestamp())
    }
}

/// Namespaces and keys become file names, so only a safe alphabet is allowed.
pub(crate) fn check_component(kind: &str, s: &str) -> Result<()> {
    let ok = !s.is_empty()
        && s.len() <= 128
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !ok {
        anyhow::bail!("invalid store {}: {:?}", kind, s);
    }
    Ok(())
}
