use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{KeyValueStore, Mutation, StoredEntry, check_component};
use crate::clock::Clock;

/// In-process store. One mutex guards the whole map, which also makes
/// every `update` atomic.
pub struct MemoryStore {
    entries: Mutex<HashMap<(String, String), StoredEntry>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(String, String), StoredEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn key(ns: &str, key: &str) -> Result<(String, String)> {
        check_component("namespace", ns)?;
        check_component("key", key)?;
        Ok((ns.to_string(), key.to_string()))
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, ns: &str, key: &str) -> Result<Option<Value>> {
        let k = Self::key(ns, key)?;
        let now = self.clock.now();
        let mut entries = self.lock();

        match entries.get(&k) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(&k);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    fn set(&self, ns: &str, key: &str, value: Value, ttl: Option<chrono::Duration>) -> Result<()> {
        let k = Self::key(ns, key)?;
        let entry = StoredEntry::new(value, ttl, self.clock.now());
        self.lock().insert(k, entry);
        Ok(())
    }

    fn delete(&self, ns: &str, key: &str) -> Result<()> {
        let k = Self::key(ns, key)?;
        self.lock().remove(&k);
        Ok(())
    }

    fn update(
        &self,
        ns: &str,
        key: &str,
        f: &mut dyn FnMut(Option<&Value>) -> Mutation,
    ) -> Result<()> {
        let k = Self::key(ns, key)?;
        let now = self.clock.now();
        let mut entries = self.lock();

        if entries.get(&k).is_some_and(|e| e.is_expired(now)) {
            entries.remove(&k);
        }

        match f(entries.get(&k).map(|e| &e.value)) {
            Mutation::Keep => {}
            Mutation::Put { value, ttl } => {
                entries.insert(k, StoredEntry::new(value, ttl, now));
            }
            Mutation::Remove => {
                entries.remove(&k);
            }
        }
        Ok(())
    }

    fn purge_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        Ok(before - entries.len())
    }
}
