//! Server-side ingestion of telemetry batches.
//!
//! A batch is rate limited per client, each event is validated on its own
//! (invalid events are skipped, not fatal), enriched with server-side
//! context and appended to the type's daily log. Security, error and
//! performance events then feed the counters and alerting.

pub mod alerts;
pub mod writer;

pub use alerts::{
    Alert, AlertCooldown, AlertKind, CounterStore, MultiNotifier, Notifier, TracingNotifier,
    WebhookNotifier,
};
pub use writer::LogWriter;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value, json};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{Config, IngestConfig, parse_duration};
use crate::guard::hasher::{ClientHasher, random_hex, sha256_hex};
use crate::guard::{RateLimiter, to_chrono};
use crate::store::KeyValueStore;
use crate::telemetry::LogType;

/// Store namespace of the logging endpoint's limiter.
pub const LOG_RATE_NAMESPACE: &str = "lograte";

const REQUIRED_FIELDS: [&str; 4] = ["type", "event", "timestamp", "sessionId"];

static SESSION_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-f0-9]{32}$").expect("valid session id regex"));

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Invalid payload")]
    InvalidPayload,

    #[error("Batch of {size} events exceeds limit of {max}")]
    BatchTooLarge { size: usize, max: usize },
}

/// Result of one accepted batch.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestOutcome {
    pub processed: usize,
    pub skipped: usize,
    pub alert_raised: bool,
    pub timestamp: String,
}

/// [`IngestConfig`] with durations resolved.
#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub max_log_bytes: u64,
    pub retention_days: u32,
    pub rate_limit: u32,
    pub rate_window: Duration,
    pub max_batch: usize,
    pub alert_threshold: u64,
    pub alert_cooldown: Duration,
    pub critical_events: HashSet<String>,
    pub error_alert_threshold: u64,
    pub slow_threshold_ms: f64,
    pub memory_ratio_threshold: f64,
    pub alert_recipient: String,
}

impl IngestSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        let ingest: &IngestConfig = &config.ingest;
        Ok(Self {
            max_log_bytes: ingest.max_log_bytes,
            retention_days: ingest.retention_days,
            rate_limit: ingest.rate_limit,
            rate_window: to_chrono(
                parse_duration(&ingest.rate_window).context("ingest.rate_window")?,
            )?,
            max_batch: ingest.max_batch,
            alert_threshold: ingest.alert_threshold,
            alert_cooldown: to_chrono(
                parse_duration(&ingest.alert_cooldown).context("ingest.alert_cooldown")?,
            )?,
            critical_events: ingest.critical_events.iter().cloned().collect(),
            error_alert_threshold: ingest.error_alert_threshold,
            slow_threshold_ms: ingest.slow_threshold_ms,
            memory_ratio_threshold: ingest.memory_ratio_threshold,
            alert_recipient: config.alerts.email.clone(),
        })
    }
}

impl Default for IngestSettings {
    fn default() -> Self {
        let config = Config::default();
        Self {
            max_log_bytes: config.ingest.max_log_bytes,
            retention_days: config.ingest.retention_days,
            rate_limit: config.ingest.rate_limit,
            rate_window: Duration::minutes(5),
            max_batch: config.ingest.max_batch,
            alert_threshold: config.ingest.alert_threshold,
            alert_cooldown: Duration::hours(1),
            critical_events: config.ingest.critical_events.into_iter().collect(),
            error_alert_threshold: config.ingest.error_alert_threshold,
            slow_threshold_ms: config.ingest.slow_threshold_ms,
            memory_ratio_threshold: config.ingest.memory_ratio_threshold,
            alert_recipient: config.alerts.email,
        }
    }
}

pub struct LogIngestor {
    writer: LogWriter,
    counters: CounterStore,
    cooldown: AlertCooldown,
    limiter: RateLimiter,
    hasher: ClientHasher,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    settings: IngestSettings,
}

impl LogIngestor {
    pub fn new(
        log_root: &Path,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        hasher: ClientHasher,
        notifier: Arc<dyn Notifier>,
        settings: IngestSettings,
    ) -> Self {
        Self {
            writer: LogWriter::new(log_root, settings.max_log_bytes, settings.retention_days),
            counters: CounterStore::new(log_root),
            cooldown: AlertCooldown::new(log_root, settings.alert_cooldown),
            limiter: RateLimiter::new(
                store,
                clock.clone(),
                LOG_RATE_NAMESPACE,
                settings.rate_window,
                settings.rate_limit,
            ),
            hasher,
            notifier,
            clock,
            settings,
        }
    }

    pub fn writer(&self) -> &LogWriter {
        &self.writer
    }

    /// Create the log layout and apply the retention policy.
    pub fn init(&self) -> Result<usize> {
        self.writer.init()?;
        self.writer.clean_old_logs(self.clock.now())
    }

    /// Ingest one `{logs, meta}` batch from `client_ip`.
    pub async fn ingest(
        &self,
        payload: &Value,
        client_ip: &str,
        request_path: &str,
    ) -> Result<IngestOutcome, IngestError> {
        let client_hash = self.hasher.hash(client_ip);
        let now = self.clock.now();

        let allowed = self
            .limiter
            .check_and_consume(&client_hash)
            .unwrap_or_else(|e| {
                warn!("Log rate state unreadable, rejecting: {:#}", e);
                false
            });
        if !allowed {
            self.writer
                .system_error("Rate limit exceeded for logging", &client_hash, now);
            return Err(IngestError::RateLimited);
        }

        let Some(logs) = payload.get("logs").and_then(Value::as_array) else {
            self.writer.system_error("Invalid payload", &client_hash, now);
            return Err(IngestError::InvalidPayload);
        };

        if logs.len() > self.settings.max_batch {
            self.writer
                .system_error("Batch too large", &client_hash, now);
            return Err(IngestError::BatchTooLarge {
                size: logs.len(),
                max: self.settings.max_batch,
            });
        }

        let mut processed = 0;
        let mut alert_raised = false;

        for log in logs {
            let Some((log_type, event)) = validate_log_entry(log) else {
                continue;
            };

            let record = self.enrich(log, &client_hash, request_path, now);
            let path = match self.writer.append(log_type, &record, now) {
                Ok(path) => path,
                Err(e) => {
                    warn!("Failed to persist {} event: {:#}", log_type, e);
                    self.writer
                        .system_error(&format!("Write failed: {:#}", e), &client_hash, now);
                    continue;
                }
            };
            processed += 1;

            // The record is on disk; a failed rotation must not hide it
            if let Err(e) = self.writer.rotate_if_needed(&path, now) {
                warn!("Failed to rotate {}: {:#}", path.display(), e);
                self.writer
                    .system_error(&format!("Rotation failed: {:#}", e), &client_hash, now);
            }

            if let Err(e) = self.process_by_type(log_type, event, &record, &client_hash, now).await {
                warn!("Post-processing of {} event failed: {:#}", log_type, e);
                self.writer
                    .system_error(&format!("Processing failed: {:#}", e), &client_hash, now);
            }

            if !alert_raised && log_type == LogType::Security {
                match self.threshold_alert(&record, &client_hash, now).await {
                    Ok(raised) => alert_raised = raised,
                    Err(e) => warn!("Threshold check failed: {:#}", e),
                }
            }
        }

        let skipped = logs.len() - processed;
        if skipped > 0 {
            debug!(client = %client_hash, skipped, "Skipped invalid telemetry events");
        }

        Ok(IngestOutcome {
            processed,
            skipped,
            alert_raised,
            timestamp: now.to_rfc3339(),
        })
    }

    fn enrich(&self, log: &Value, client_hash: &str, request_path: &str, now: DateTime<Utc>) -> Value {
        let mut record: Map<String, Value> = log.as_object().cloned().unwrap_or_default();
        record.insert("server_timestamp".into(), json!(now.to_rfc3339()));
        record.insert("client_ip_hash".into(), json!(client_hash));
        record.insert("request_id".into(), json!(random_hex(8)));
        record.insert(
            "server_info".into(),
            json!({
                "version": env!("CARGO_PKG_VERSION"),
                "request_uri": request_path,
            }),
        );
        Value::Object(record)
    }

    async fn process_by_type(
        &self,
        log_type: LogType,
        event: &str,
        record: &Value,
        client_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        match log_type {
            LogType::Security => {
                self.counters.increment_security(client_hash, event, now)?;
                if self.settings.critical_events.contains(event) {
                    self.critical_alert(event, record, client_hash, now).await?;
                }
            }
            LogType::Error => {
                let message = record
                    .pointer("/data/message")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                let group = sha256_hex(format!("{}{}", event, message).as_bytes());
                let count = self.counters.increment_error(&group, now)?;
                // Alert once, when the group first crosses the threshold
                if count == self.settings.error_alert_threshold + 1 {
                    let alert = self.alert(AlertKind::ErrorThresholdExceeded, event, "HIGH", record, now)
                        .with_count(count, self.settings.error_alert_threshold);
                    self.raise(alert, now).await?;
                }
            }
            LogType::Performance => {
                let data = record.get("data");
                if let Some(duration) = data.and_then(|d| d.get("duration")).and_then(Value::as_f64)
                    && duration > self.settings.slow_threshold_ms
                {
                    warn!(event, duration_ms = duration, "Slow operation reported");
                }
                if let Some(ratio) = data.and_then(|d| d.get("ratio")).and_then(Value::as_f64)
                    && ratio > self.settings.memory_ratio_threshold
                {
                    let mut alert = self.alert(AlertKind::HighMemoryUsage, event, "MEDIUM", record, now);
                    alert.client_ip_hash = Some(client_hash.to_string());
                    self.raise(alert, now).await?;
                }
            }
            LogType::Event => {}
        }
        Ok(())
    }

    async fn critical_alert(
        &self,
        event: &str,
        record: &Value,
        client_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut alert = self.alert(AlertKind::CriticalSecurityEvent, event, "CRITICAL", record, now);
        alert.client_ip_hash = Some(client_hash.to_string());

        self.writer.append_critical(&serde_json::to_value(&alert)?, now)?;
        if let Err(e) = self.notifier.notify(&alert).await {
            warn!("Critical alert delivery failed: {:#}", e);
        }
        Ok(())
    }

    /// Raise the per-client threshold alert if due. Returns whether it fired.
    async fn threshold_alert(&self, record: &Value, client_hash: &str, now: DateTime<Utc>) -> Result<bool> {
        if !self.cooldown.is_ready(now)? {
            return Ok(false);
        }

        let total = self.counters.security_total(client_hash, now)?;
        if total < self.settings.alert_threshold {
            return Ok(false);
        }

        let event = record.get("event").and_then(Value::as_str).unwrap_or("");
        let mut alert = self
            .alert(AlertKind::SecurityThresholdExceeded, event, "HIGH", record, now)
            .with_count(total, self.settings.alert_threshold);
        alert.client_ip_hash = Some(client_hash.to_string());

        self.raise(alert, now).await?;
        let alert_count = self.cooldown.record(now)?;
        info!(client = %client_hash, total, alert_count, "Security threshold alert raised");
        Ok(true)
    }

    fn alert(&self, kind: AlertKind, event: &str, severity: &str, record: &Value, now: DateTime<Utc>) -> Alert {
        Alert {
            kind,
            timestamp: now.to_rfc3339(),
            event: event.to_string(),
            severity: severity.to_string(),
            recipient: self.settings.alert_recipient.clone(),
            client_ip_hash: None,
            threshold: None,
            count: None,
            details: record.clone(),
        }
    }

    /// Persist to the daily alerts log, then notify.
    async fn raise(&self, alert: Alert, now: DateTime<Utc>) -> Result<()> {
        self.writer.append_alert(&serde_json::to_value(&alert)?, now)?;
        if let Err(e) = self.notifier.notify(&alert).await {
            warn!("Alert delivery failed: {:#}", e);
        }
        Ok(())
    }
}

impl Alert {
    fn with_count(mut self, count: u64, threshold: u64) -> Self {
        self.count = Some(count);
        self.threshold = Some(threshold);
        self
    }
}

/// Required fields present, type known, timestamp RFC 3339, session id
/// 32 lowercase hex characters.
pub fn validate_log_entry(log: &Value) -> Option<(LogType, &str)> {
    let obj = log.as_object()?;
    if REQUIRED_FIELDS.iter().any(|f| !obj.contains_key(*f)) {
        return None;
    }

    let log_type: LogType = obj.get("type")?.as_str()?.parse().ok()?;
    let event = obj.get("event")?.as_str().filter(|e| !e.is_empty())?;

    let timestamp = obj.get("timestamp")?.as_str()?;
    DateTime::parse_from_rfc3339(timestamp).ok()?;

    let session_id = obj.get("sessionId")?.as_str()?;
    if !SESSION_ID_RE.is_match(session_id) {
        return None;
    }

    Some((log_type, event))
}
