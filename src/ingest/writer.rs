//! Append-only JSONL files for ingested telemetry.
//!
//! Layout under the log root:
//!
//! ```text
//! <type>/<YYYY-MM-DD>_<type>.log      one file per type and day
//! <type>/<...>.log.<unix>.gz          rotated, compressed segments
//! alerts/<YYYY-MM-DD>_alerts.log
//! critical/<YYYY-MM-DD>_critical.log
//! system_errors.log                   failures of the ingestion itself
//! ```

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::write::GzEncoder;
use fs2::FileExt;
use serde_json::Value;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};

use crate::telemetry::LogType;

pub const ALERTS_DIR: &str = "alerts";
pub const CRITICAL_DIR: &str = "critical";
pub const COUNTERS_DIR: &str = "counters";
const SYSTEM_ERRORS_FILE: &str = "system_errors.log";

pub struct LogWriter {
    root: PathBuf,
    max_bytes: u64,
    retention_days: u32,
}

impl LogWriter {
    pub fn new(root: &Path, max_bytes: u64, retention_days: u32) -> Self {
        Self {
            root: root.to_path_buf(),
            max_bytes,
            retention_days,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the root and one directory per log type.
    pub fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("Failed to create {}", self.root.display()))?;
        for log_type in LogType::ALL {
            fs::create_dir_all(self.root.join(log_type.as_str()))?;
        }
        Ok(())
    }

    pub fn type_log_path(&self, log_type: LogType, now: DateTime<Utc>) -> PathBuf {
        let name = log_type.as_str();
        self.root
            .join(name)
            .join(format!("{}_{}.log", now.format("%Y-%m-%d"), name))
    }

    fn daily_path(&self, dir: &str, suffix: &str, now: DateTime<Utc>) -> PathBuf {
        self.root
            .join(dir)
            .join(format!("{}_{}.log", now.format("%Y-%m-%d"), suffix))
    }

    /// Append one record to today's file for its type. Rotation is left to
    /// the caller via [`LogWriter::rotate_if_needed`].
    pub fn append(&self, log_type: LogType, record: &Value, now: DateTime<Utc>) -> Result<PathBuf> {
        let path = self.type_log_path(log_type, now);
        append_json_line(&path, record)?;
        Ok(path)
    }

    pub fn append_alert(&self, record: &Value, now: DateTime<Utc>) -> Result<PathBuf> {
        let path = self.daily_path(ALERTS_DIR, "alerts", now);
        append_json_line(&path, record)?;
        Ok(path)
    }

    pub fn append_critical(&self, record: &Value, now: DateTime<Utc>) -> Result<PathBuf> {
        let path = self.daily_path(CRITICAL_DIR, "critical", now);
        append_json_line(&path, record)?;
        Ok(path)
    }

    /// Record a failure of the ingestion pipeline. Never fails itself.
    pub fn system_error(&self, message: &str, client_hash: &str, now: DateTime<Utc>) {
        let line = format!(
            "{} [SYSTEM_ERROR] {} IP: {}",
            now.to_rfc3339(),
            message,
            client_hash
        );
        if let Err(e) = append_line(&self.root.join(SYSTEM_ERRORS_FILE), &line) {
            warn!("Failed to record ingestion error: {:#}", e);
        }
    }

    /// Rename `path` to `path.<unix>` and compress it once it exceeds the
    /// size limit. Returns the compressed file.
    pub fn rotate_if_needed(&self, path: &Path, now: DateTime<Utc>) -> Result<Option<PathBuf>> {
        let size = match fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if size <= self.max_bytes {
            return Ok(None);
        }

        let rotated = PathBuf::from(format!("{}.{}", path.display(), now.timestamp()));
        fs::rename(path, &rotated)
            .with_context(|| format!("Failed to rotate {}", path.display()))?;

        let compressed = compress_file(&rotated)?;
        info!(
            "Rotated {} ({} bytes) to {}",
            path.display(),
            size,
            compressed.display()
        );
        Ok(Some(compressed))
    }

    /// Delete log files last modified before the retention horizon.
    /// Returns how many were removed.
    pub fn clean_old_logs(&self, now: DateTime<Utc>) -> Result<usize> {
        if self.retention_days == 0 {
            return Ok(0);
        }

        let cutoff: SystemTime = (now - chrono::Duration::days(self.retention_days as i64)).into();
        let mut dirs: Vec<&str> = LogType::ALL.iter().map(|t| t.as_str()).collect();
        dirs.extend([ALERTS_DIR, CRITICAL_DIR, COUNTERS_DIR]);

        let mut removed = 0;
        for dir in dirs {
            let dir = self.root.join(dir);
            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
                    continue;
                };
                if path.is_file() && modified < cutoff {
                    match fs::remove_file(&path) {
                        Ok(()) => {
                            debug!("Removed expired log {}", path.display());
                            removed += 1;
                        }
                        Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
                    }
                }
            }
        }

        if removed > 0 {
            info!("Retention sweep removed {} log files", removed);
        }
        Ok(removed)
    }
}

fn append_json_line(path: &Path, record: &Value) -> Result<()> {
    let line = serde_json::to_string(record).context("Failed to serialize log record")?;
    append_line(path, &line)
}

/// Append under an exclusive advisory lock so concurrent writers never
/// interleave partial lines.
fn append_line(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    file.lock_exclusive()?;
    let result = writeln!(file, "{}", line);
    let _ = file.unlock();
    result.with_context(|| format!("Failed to append to {}", path.display()))
}

/// Gzip `path` to `path.gz` and remove the original.
fn compress_file(path: &Path) -> Result<PathBuf> {
    let compressed = PathBuf::from(format!("{}.gz", path.display()));

    let mut input = File::open(path)?;
    let output = File::create(&compressed)
        .with_context(|| format!("Failed to create {}", compressed.display()))?;
    let mut encoder = GzEncoder::new(output, Compression::best());
    io::copy(&mut input, &mut encoder)?;
    encoder.finish()?;

    fs::remove_file(path)?;
    Ok(compressed)
}
