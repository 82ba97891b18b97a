//! Telemetry event model and the sanitizers applied before queueing.
//!
//! Nothing leaves the page unbounded: strings are cut to 500 characters,
//! arrays to 10 elements, URLs lose their query string and fragment.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::guard::hasher::{random_hex, sha256_hex};

pub const MAX_STRING_CHARS: usize = 500;
pub const MAX_ARRAY_ITEMS: usize = 10;
pub const MAX_COERCED_CHARS: usize = 100;
pub const MAX_ERROR_CHARS: usize = 200;
pub const MAX_STACK_LINES: usize = 3;
pub const MAX_FILENAME_CHARS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogType {
    Security,
    Event,
    Performance,
    Error,
}

impl LogType {
    pub const ALL: [LogType; 4] = [
        LogType::Security,
        LogType::Event,
        LogType::Performance,
        LogType::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LogType::Security => "security",
            LogType::Event => "event",
            LogType::Performance => "performance",
            LogType::Error => "error",
        }
    }
}

impl fmt::Display for LogType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LogType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown log type: {}", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Events at this severity skip the queue and flush at once.
    pub fn flushes_immediately(&self) -> bool {
        *self >= Severity::High
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            _ => Err(format!("unknown severity: {}", s)),
        }
    }
}

/// One queued telemetry event, serialized in the page's wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    #[serde(rename = "type")]
    pub log_type: LogType,
    pub event: String,
    pub data: Value,
    pub severity: Severity,
    pub timestamp: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Identifies repeated deliveries of the same event
    pub event_id: String,
}

/// Batch metadata sent alongside the events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchMeta {
    pub timestamp: String,
    pub session_id: String,
    /// Milliseconds since the epoch at batcher creation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_load_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Body of a `POST /api/security-log`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogBatch {
    pub logs: Vec<LogEvent>,
    pub meta: BatchMeta,
}

pub fn rfc3339(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// 16 random bytes as 32 lowercase hex characters.
pub fn generate_session_id() -> String {
    random_hex(16)
}

/// Short one-way fingerprint of a user agent string.
pub fn hash_user_agent(user_agent: &str) -> String {
    sha256_hex(user_agent.as_bytes())[..20].to_string()
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

/// Plain-text rendering of a JSON value (strings unquoted).
fn coerce(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(coerce).collect::<Vec<_>>().join(","),
        other => other.to_string(),
    }
}

fn sanitize_item(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(truncate(s, MAX_STRING_CHARS)),
        Value::Number(_) => value.clone(),
        other => Value::String(truncate(&coerce(other), MAX_COERCED_CHARS)),
    }
}

/// Bound an event payload.
///
/// A non-object becomes a string of at most 500 characters. Object members:
/// strings are cut to 500 characters, numbers kept, arrays cut to 10
/// elements, anything else coerced to a string of at most 100 characters.
pub fn sanitize_data(data: &Value) -> Value {
    let Value::Object(members) = data else {
        return Value::String(truncate(&coerce(data), MAX_STRING_CHARS));
    };

    let sanitized: Map<String, Value> = members
        .iter()
        .map(|(key, value)| {
            let value = match value {
                Value::Array(items) => Value::Array(
                    items
                        .iter()
                        .take(MAX_ARRAY_ITEMS)
                        .map(sanitize_item)
                        .collect(),
                ),
                other => sanitize_item(other),
            };
            (key.clone(), value)
        })
        .collect();

    Value::Object(sanitized)
}

/// Origin and path only. `None` for empty input, `"invalid_url"` when the
/// input does not parse.
pub fn sanitize_url(url: Option<&str>) -> Option<String> {
    let url = url.filter(|u| !u.is_empty())?;
    match reqwest::Url::parse(url) {
        Ok(parsed) => Some(format!(
            "{}{}",
            parsed.origin().ascii_serialization(),
            parsed.path()
        )),
        Err(_) => Some("invalid_url".to_string()),
    }
}

pub fn sanitize_error(error: Option<&str>) -> String {
    match error.filter(|e| !e.is_empty()) {
        Some(e) => truncate(e, MAX_ERROR_CHARS),
        None => "unknown".to_string(),
    }
}

/// First three frames, at most 500 characters.
pub fn sanitize_stack_trace(stack: Option<&str>) -> Option<String> {
    let stack = stack.filter(|s| !s.is_empty())?;
    let head = stack
        .split('\n')
        .take(MAX_STACK_LINES)
        .collect::<Vec<_>>()
        .join("\n");
    Some(truncate(&head, MAX_STRING_CHARS))
}

/// Last path segment only.
pub fn sanitize_filename(filename: Option<&str>) -> Option<String> {
    let filename = filename.filter(|f| !f.is_empty())?;
    let base = filename.rsplit('/').next().unwrap_or(filename);
    Some(truncate(base, MAX_FILENAME_CHARS))
}
