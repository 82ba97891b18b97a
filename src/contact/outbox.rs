//! Durable hand-off of accepted contact submissions.
//!
//! Mail delivery is somebody else's job: accepted submissions are appended
//! to `<dir>/<YYYY-MM-DD>_contact.jsonl` for the delivery process to pick
//! up. The client address is stored hashed.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::ContactSubmission;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: String,
    pub timestamp: String,
    #[serde(flatten)]
    pub submission: ContactSubmission,
    pub client_ip_hash: String,
}

pub struct ContactOutbox {
    dir: PathBuf,
}

impl ContactOutbox {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn file_for(&self, date: DateTime<Utc>) -> PathBuf {
        self.dir
            .join(format!("{}_contact.jsonl", date.format("%Y-%m-%d")))
    }

    pub fn append(
        &self,
        submission: &ContactSubmission,
        client_ip_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<OutboxRecord> {
        crate::paths::create_dir_with_mode(&self.dir)?;

        let record = OutboxRecord {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: now.to_rfc3339(),
            submission: submission.clone(),
            client_ip_hash: client_ip_hash.to_string(),
        };

        let path = self.file_for(now);
        let line = serde_json::to_string(&record).context("Failed to serialize submission")?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open outbox {}", path.display()))?;
        writeln!(file, "{}", line).context("Failed to write submission")?;

        Ok(record)
    }

    /// All records of one day, skipping unreadable lines.
    pub fn read_day(&self, date: DateTime<Utc>) -> Result<Vec<OutboxRecord>> {
        let path = self.file_for(date);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(content
            .lines()
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }
}
