//! Append-only, hash-chained audit trail of guard decisions.
//!
//! Stored at `<state_dir>/landing-guard.audit.jsonl`. Each entry carries the
//! SHA-256 of the previous line, so removing or editing a line breaks the
//! chain at the following entry.
//!
//! # Format
//!
//! One JSON object per line:
//!
//! | Field | Description |
//! |-------|-------------|
//! | `ts` | RFC 3339 timestamp |
//! | `action` | `contact_accepted`, `csrf_rejected`, `spam_detected`, ... |
//! | `client_hash` | Keyed hash of the client, never the raw address |
//! | `prev_entry_sha256` | SHA-256 of the previous line |
//! | `source` | Route or subsystem that recorded it |
//! | `detail` | Optional context |
//!
//! The first entry links to 64 zeros.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::guard::hasher::sha256_hex;

const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub ts: String,
    pub action: AuditAction,
    pub client_hash: String,
    pub prev_entry_sha256: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Contact submission passed every check and reached the outbox.
    ContactAccepted,
    /// Contact submission carried a missing, stale or reused token.
    CsrfRejected,
    /// Honeypot field was filled in.
    SpamDetected,
    /// Contact fields failed validation.
    ValidationFailed,
    /// Site-wide ceiling reached.
    RateLimited,
    /// Previous entry corrupted, new chain segment started.
    ChainRecovery,
}

/// Append one entry to the log at `path`.
///
/// The file is held under an exclusive lock while the last line is read
/// and the new one written, so concurrent requests cannot fork the chain.
/// A corrupted last line is answered with a `ChainRecovery` entry first.
pub fn append_audit_entry(
    path: &Path,
    action: AuditAction,
    client_hash: &str,
    source: &str,
    detail: Option<&str>,
    now: DateTime<Utc>,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)
        .context("Failed to open audit log")?;
    file.lock_exclusive()?;
    let result = append_locked(&mut file, action, client_hash, source, detail, now);
    let _ = file.unlock();
    result
}

fn append_locked(
    file: &mut File,
    action: AuditAction,
    client_hash: &str,
    source: &str,
    detail: Option<&str>,
    now: DateTime<Utc>,
) -> Result<()> {
    let mut content = String::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_string(&mut content)
        .context("Failed to read audit log")?;

    let prev_hash = match content.lines().last() {
        Some(last) if !last.is_empty() => {
            if serde_json::from_str::<AuditEntry>(last).is_ok() {
                sha256_hex(last.as_bytes())
            } else {
                let recovery = AuditEntry {
                    ts: now.to_rfc3339(),
                    action: AuditAction::ChainRecovery,
                    client_hash: String::new(),
                    prev_entry_sha256: sha256_hex(last.as_bytes()),
                    source: "audit_system".to_string(),
                    detail: Some(format!(
                        "Previous entry corrupted ({} bytes), new chain segment",
                        last.len()
                    )),
                };
                let line = serde_json::to_string(&recovery)
                    .context("Failed to serialize recovery entry")?;
                writeln!(file, "{}", line).context("Failed to write audit entry")?;
                sha256_hex(line.as_bytes())
            }
        }
        _ => GENESIS_HASH.to_string(),
    };

    let entry = AuditEntry {
        ts: now.to_rfc3339(),
        action,
        client_hash: client_hash.to_string(),
        prev_entry_sha256: prev_hash,
        source: source.to_string(),
        detail: detail.map(str::to_string),
    };
    let line = serde_json::to_string(&entry).context("Failed to serialize audit entry")?;
    writeln!(file, "{}", line).context("Failed to write audit entry")?;
    Ok(())
}

/// All parseable entries. Corrupted lines are skipped.
pub fn read_audit_log(path: &Path) -> Result<Vec<AuditEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path).context("Failed to read audit log")?;
    Ok(content
        .lines()
        .filter(|l| !l.is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}

/// Indices of lines whose chain link does not match. Empty means intact.
pub fn verify_audit_chain(path: &Path) -> Result<Vec<usize>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path).context("Failed to read audit log")?;
    let lines: Vec<&str> = content.lines().filter(|l| !l.is_empty()).collect();

    let mut broken = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        let Ok(entry) = serde_json::from_str::<AuditEntry>(line) else {
            broken.push(i);
            continue;
        };
        let expected = match i {
            0 => GENESIS_HASH.to_string(),
            _ => sha256_hex(lines[i - 1].as_bytes()),
        };
        if entry.prev_entry_sha256 != expected {
            broken.push(i);
        }
    }
    Ok(broken)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-07-14T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn append(path: &Path, action: AuditAction, client: &str) {
        append_audit_entry(path, action, client, "contact", None, now()).unwrap();
    }

    #[test]
    fn chain_intact_after_appends() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("audit.jsonl");

        for i in 0..5 {
            append(&path, AuditAction::ContactAccepted, &format!("client_{}", i));
        }

        let entries = read_audit_log(&path).unwrap();
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[0].prev_entry_sha256, GENESIS_HASH);
        assert!(verify_audit_chain(&path).unwrap().is_empty());
    }

    #[test]
    fn edited_line_breaks_next_link() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("audit.jsonl");
        for i in 0..3 {
            append(&path, AuditAction::CsrfRejected, &format!("client_{}", i));
        }

        let content = fs::read_to_string(&path).unwrap();
        let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
        lines[1] = lines[1].replace("client_1", "someone_else");
        fs::write(&path, lines.join("\n") + "\n").unwrap();

        assert_eq!(verify_audit_chain(&path).unwrap(), vec![2]);
    }

    #[test]
    fn missing_log_is_empty_and_intact() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("audit.jsonl");
        assert!(read_audit_log(&path).unwrap().is_empty());
        assert!(verify_audit_chain(&path).unwrap().is_empty());
    }

    #[test]
    fn corrupted_tail_starts_new_segment() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("audit.jsonl");
        append(&path, AuditAction::ContactAccepted, "a");

        let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "not json").unwrap();
        drop(file);

        append(&path, AuditAction::SpamDetected, "b");

        let entries = read_audit_log(&path).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].action, AuditAction::ChainRecovery);
        assert_eq!(entries[1].source, "audit_system");
        assert_eq!(entries[2].action, AuditAction::SpamDetected);
        // Only the garbage line itself is reported
        assert_eq!(verify_audit_chain(&path).unwrap(), vec![1]);
    }

    #[test]
    fn actions_serialize_snake_case_and_omit_empty_detail() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("audit.jsonl");
        append(&path, AuditAction::RateLimited, "c");
        append_audit_entry(
            &path,
            AuditAction::ValidationFailed,
            "c",
            "contact",
            Some("Invalid email format"),
            now(),
        )
        .unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert!(lines[0].contains("\"rate_limited\""));
        assert!(!lines[0].contains("\"detail\""));
        assert!(lines[1].contains("\"validation_failed\""));
        assert!(lines[1].contains("Invalid email format"));
    }
}
