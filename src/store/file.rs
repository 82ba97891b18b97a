//! File-per-entry store shared across processes.
//!
//! Layout: `<dir>/<ns>_<key>` holds the JSON entry, `<dir>/.<ns>_<key>.lock`
//! is the advisory lock taken around every read-modify-write. Writes go to
//! a unique temp file that is renamed over the entry, so readers never see
//! a torn document.

use anyhow::{Context, Result};
use fs2::FileExt;
use serde_json::Value;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use super::{KeyValueStore, Mutation, StoredEntry, check_component};
use crate::clock::Clock;

pub struct FileStore {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
}

/// Releases the entry lock on drop.
struct EntryLockGuard {
    file: File,
}

impl Drop for EntryLockGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

impl FileStore {
    /// Open (and create, 0700) the store directory.
    pub fn open(dir: &Path, clock: Arc<dyn Clock>) -> Result<Self> {
        crate::paths::create_dir_with_mode(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            clock,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, ns: &str, key: &str) -> Result<PathBuf> {
        check_component("namespace", ns)?;
        check_component("key", key)?;
        Ok(self.dir.join(format!("{}_{}", ns, key)))
    }

    fn lock_path(&self, ns: &str, key: &str) -> PathBuf {
        self.dir.join(format!(".{}_{}.lock", ns, key))
    }

    fn lock(&self, ns: &str, key: &str) -> Result<EntryLockGuard> {
        let path = self.lock_path(ns, key);
        let file = File::create(&path)
            .with_context(|| format!("Failed to open lock {}", path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("Failed to lock {}", path.display()))?;
        Ok(EntryLockGuard { file })
    }

    /// Read an entry, dropping it if expired. Caller holds the lock.
    fn read_live(&self, path: &Path) -> Result<Option<StoredEntry>> {
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()));
            }
        };

        let entry: StoredEntry = serde_json::from_str(&content)
            .with_context(|| format!("Corrupt store entry {}", path.display()))?;

        if entry.is_expired(self.clock.now()) {
            remove_if_exists(path)?;
            return Ok(None);
        }

        Ok(Some(entry))
    }

    fn write_atomic(&self, path: &Path, entry: &StoredEntry) -> Result<()> {
        let content = serde_json::to_string(entry)?;

        let tmp_path = path.with_extension(format!(
            "{}.{}.tmp",
            std::process::id(),
            uuid::Uuid::new_v4().simple()
        ));
        fs::write(&tmp_path, content)
            .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
        if let Err(e) = fs::rename(&tmp_path, path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e).with_context(|| format!("Failed to replace {}", path.display()));
        }
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, ns: &str, key: &str) -> Result<Option<Value>> {
        let path = self.entry_path(ns, key)?;
        let _guard = self.lock(ns, key)?;
        Ok(self.read_live(&path)?.map(|e| e.value))
    }

    fn set(&self, ns: &str, key: &str, value: Value, ttl: Option<chrono::Duration>) -> Result<()> {
        let path = self.entry_path(ns, key)?;
        let _guard = self.lock(ns, key)?;
        let entry = StoredEntry::new(value, ttl, self.clock.now());
        self.write_atomic(&path, &entry)
    }

    fn delete(&self, ns: &str, key: &str) -> Result<()> {
        let path = self.entry_path(ns, key)?;
        let _guard = self.lock(ns, key)?;
        remove_if_exists(&path)
    }

    fn update(
        &self,
        ns: &str,
        key: &str,
        f: &mut dyn FnMut(Option<&Value>) -> Mutation,
    ) -> Result<()> {
        let path = self.entry_path(ns, key)?;
        let _guard = self.lock(ns, key)?;
        let current = self.read_live(&path)?;

        match f(current.as_ref().map(|e| &e.value)) {
            Mutation::Keep => Ok(()),
            Mutation::Put { value, ttl } => {
                let entry = StoredEntry::new(value, ttl, self.clock.now());
                self.write_atomic(&path, &entry)
            }
            Mutation::Remove => remove_if_exists(&path),
        }
    }

    fn purge_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut removed = 0;
        let mut lock_files = Vec::new();

        for dir_entry in fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to list {}", self.dir.display()))?
        {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name().to_string_lossy().to_string();
            let path = dir_entry.path();

            if name.starts_with('.') {
                lock_files.push((name, path));
                continue;
            }
            if name.ends_with(".tmp") {
                continue;
            }

            let Ok(content) = fs::read_to_string(&path) else {
                continue;
            };
            match serde_json::from_str::<StoredEntry>(&content) {
                Ok(entry) if entry.is_expired(now) => {
                    remove_if_exists(&path)?;
                    removed += 1;
                }
                Ok(_) => {}
                Err(_) => {
                    debug!("Removing unreadable store entry {}", path.display());
                    remove_if_exists(&path)?;
                    removed += 1;
                }
            }
        }

        // Orphaned lock files go once nobody holds them.
        for (name, path) in lock_files {
            if let Some(stem) = name
                .strip_prefix('.')
                .and_then(|n| n.strip_suffix(".lock"))
                && !self.dir.join(stem).exists()
                && let Ok(file) = File::open(&path)
                && file.try_lock_exclusive().is_ok()
            {
                let _ = fs::remove_file(&path);
                let _ = file.unlock();
            }
        }

        Ok(removed)
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Duration;
    use serde_json::json;

    fn store(dir: &Path) -> (FileStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        let store = FileStore::open(&dir.join("guard"), clock.clone()).unwrap();
        (store, clock)
    }

    #[test]
    fn set_get_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, _) = store(tmp.path());

        store.set("csrf", "abc", json!({"token": "t"}), None).unwrap();
        assert_eq!(store.get("csrf", "abc").unwrap(), Some(json!({"token": "t"})));
        assert!(store.dir().join("csrf_abc").exists());

        store.delete("csrf", "abc").unwrap();
        assert_eq!(store.get("csrf", "abc").unwrap(), None);
        // Deleting twice is fine
        store.delete("csrf", "abc").unwrap();
    }

    #[test]
    fn expired_entry_is_removed_on_read() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, clock) = store(tmp.path());

        store
            .set("rate", "k", json!(1), Some(Duration::seconds(60)))
            .unwrap();
        clock.advance(Duration::seconds(61));

        assert_eq!(store.get("rate", "k").unwrap(), None);
        assert!(!store.dir().join("rate_k").exists());
    }

    #[test]
    fn update_sees_current_value() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, _) = store(tmp.path());

        for _ in 0..3 {
            store
                .update("rate", "k", &mut |current| {
                    let n = current.and_then(|v| v.as_u64()).unwrap_or(0);
                    Mutation::Put {
                        value: json!(n + 1),
                        ttl: None,
                    }
                })
                .unwrap();
        }
        assert_eq!(store.get("rate", "k").unwrap(), Some(json!(3)));

        store.update("rate", "k", &mut |_| Mutation::Remove).unwrap();
        assert_eq!(store.get("rate", "k").unwrap(), None);
    }

    #[test]
    fn no_tmp_files_left_behind() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, _) = store(tmp.path());

        for i in 0..5 {
            store.set("csrf", "abc", json!(i), None).unwrap();
        }

        let tmp_files: Vec<_> = fs::read_dir(store.dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(tmp_files.is_empty());
    }

    #[test]
    fn corrupt_entry_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, _) = store(tmp.path());

        fs::write(store.dir().join("csrf_bad"), "{not json").unwrap();
        assert!(store.get("csrf", "bad").is_err());
    }

    #[test]
    fn purge_removes_only_expired() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, clock) = store(tmp.path());

        store
            .set("csrf", "old", json!(1), Some(Duration::seconds(10)))
            .unwrap();
        store
            .set("csrf", "new", json!(2), Some(Duration::hours(1)))
            .unwrap();
        store.set("rate", "forever", json!(3), None).unwrap();

        clock.advance(Duration::seconds(30));
        assert_eq!(store.purge_expired().unwrap(), 1);

        assert!(!store.dir().join("csrf_old").exists());
        assert!(!store.dir().join(".csrf_old.lock").exists());
        assert_eq!(store.get("csrf", "new").unwrap(), Some(json!(2)));
        assert_eq!(store.get("rate", "forever").unwrap(), Some(json!(3)));
    }

    #[test]
    fn rejects_unsafe_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, _) = store(tmp.path());
        assert!(store.set("csrf", "../escape", json!(1), None).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn store_dir_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let (store, _) = store(tmp.path());
        let mode = fs::metadata(store.dir()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
