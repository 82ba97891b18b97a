//! Security counters, alert cooldown and alert delivery.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

use super::writer::COUNTERS_DIR;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// One client crossed the daily security event threshold
    SecurityThresholdExceeded,
    /// A critical event name arrived
    CriticalSecurityEvent,
    /// One error group crossed its daily threshold
    ErrorThresholdExceeded,
    /// A page reported heap usage above the limit
    HighMemoryUsage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    #[serde(rename = "type")]
    pub kind: AlertKind,
    pub timestamp: String,
    pub event: String,
    pub severity: String,
    /// Who should hear about it; carried for the receiving webhook
    pub recipient: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ip_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    pub details: Value,
}

/// Alert delivery seam.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, alert: &Alert) -> Result<()>;
}

/// Writes alerts to the process log.
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, alert: &Alert) -> Result<()> {
        match alert.kind {
            AlertKind::CriticalSecurityEvent => error!(
                kind = ?alert.kind,
                event = %alert.event,
                "Critical security event"
            ),
            _ => warn!(
                kind = ?alert.kind,
                event = %alert.event,
                client = alert.client_ip_hash.as_deref().unwrap_or("-"),
                count = alert.count.unwrap_or(0),
                "Security alert raised"
            ),
        }
        Ok(())
    }
}

/// POSTs alerts as JSON to a webhook.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build webhook client")?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, alert: &Alert) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(alert)
            .send()
            .await
            .context("Webhook request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("Webhook answered {}", response.status());
        }
        Ok(())
    }
}

/// Fans an alert out to several notifiers. One failing does not stop
/// the others.
pub struct MultiNotifier {
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl MultiNotifier {
    pub fn new(notifiers: Vec<Arc<dyn Notifier>>) -> Self {
        Self { notifiers }
    }
}

#[async_trait]
impl Notifier for MultiNotifier {
    async fn notify(&self, alert: &Alert) -> Result<()> {
        let mut failures = 0;
        for notifier in &self.notifiers {
            if let Err(e) = notifier.notify(alert).await {
                warn!("Alert delivery failed: {:#}", e);
                failures += 1;
            }
        }
        if failures > 0 && failures == self.notifiers.len() {
            anyhow::bail!("all {} notifiers failed", failures);
        }
        Ok(())
    }
}

/// `{client_hash: {event: count}}`
type SecurityCounters = BTreeMap<String, BTreeMap<String, u64>>;

/// `{group_hash: count}`
type ErrorCounters = BTreeMap<String, u64>;

/// Daily counters under `<root>/counters/`.
pub struct CounterStore {
    dir: PathBuf,
}

impl CounterStore {
    pub fn new(log_root: &Path) -> Self {
        Self {
            dir: log_root.join(COUNTERS_DIR),
        }
    }

    fn security_path(&self, now: DateTime<Utc>) -> PathBuf {
        self.dir
            .join(format!("security_{}.json", now.format("%Y-%m-%d")))
    }

    fn errors_path(&self, now: DateTime<Utc>) -> PathBuf {
        self.dir
            .join(format!("errors_{}.json", now.format("%Y-%m-%d")))
    }

    /// Count one security event. Returns the client's total for the day.
    pub fn increment_security(
        &self,
        client_hash: &str,
        event: &str,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let path = self.security_path(now);
        let mut total = 0;
        self.modify::<SecurityCounters>(&path, |counters| {
            let client = counters.entry(client_hash.to_string()).or_default();
            *client.entry(event.to_string()).or_insert(0) += 1;
            total = client.values().sum();
        })?;
        Ok(total)
    }

    /// The client's security event total for the day.
    pub fn security_total(&self, client_hash: &str, now: DateTime<Utc>) -> Result<u64> {
        let counters: SecurityCounters = read_json_or_default(&self.security_path(now))?;
        Ok(counters
            .get(client_hash)
            .map(|events| events.values().sum())
            .unwrap_or(0))
    }

    /// Count one error in `group`. Returns the group's count for the day.
    pub fn increment_error(&self, group: &str, now: DateTime<Utc>) -> Result<u64> {
        let path = self.errors_path(now);
        let mut count = 0;
        self.modify::<ErrorCounters>(&path, |counters| {
            let c = counters.entry(group.to_string()).or_insert(0);
            *c += 1;
            count = *c;
        })?;
        Ok(count)
    }

    fn modify<T>(&self, path: &Path, f: impl FnOnce(&mut T)) -> Result<()>
    where
        T: Default + Serialize + for<'de> Deserialize<'de>,
    {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;

        let lock = File::create(self.dir.join(".counters.lock"))?;
        lock.lock_exclusive()?;

        let result = (|| {
            let mut value: T = read_json_or_default(path)?;
            f(&mut value);
            write_json_atomic(path, &value)
        })();

        let _ = lock.unlock();
        result
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CooldownState {
    /// Unix seconds
    last_alert: i64,
    alert_count: u64,
}

/// Global minimum spacing between threshold alerts, persisted in
/// `<root>/alert_cooldown.json`.
pub struct AlertCooldown {
    path: PathBuf,
    cooldown: chrono::Duration,
}

impl AlertCooldown {
    pub fn new(log_root: &Path, cooldown: chrono::Duration) -> Self {
        Self {
            path: log_root.join("alert_cooldown.json"),
            cooldown,
        }
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> Result<bool> {
        if !self.path.exists() {
            return Ok(true);
        }
        let state: CooldownState = read_json_or_default(&self.path)?;
        Ok(now.timestamp() - state.last_alert >= self.cooldown.num_seconds())
    }

    /// Start a new cooldown period. Returns the total number of alerts.
    pub fn record(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut state: CooldownState = read_json_or_default(&self.path)?;
        state.last_alert = now.timestamp();
        state.alert_count += 1;
        write_json_atomic(&self.path, &state)?;
        Ok(state.alert_count)
    }
}

fn read_json_or_default<T>(path: &Path) -> Result<T>
where
    T: Default + for<'de> Deserialize<'de>,
{
    match fs::read_to_string(path) {
        Ok(content) => Ok(serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!("Resetting unreadable {}: {}", path.display(), e);
            T::default()
        })),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension(format!(
        "{}.{}.tmp",
        std::process::id(),
        uuid::Uuid::new_v4().simple()
    ));
    fs::write(&tmp_path, serde_json::to_string(value)?)?;
    fs::rename(&tmp_path, path).with_context(|| format!("Failed to replace {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn sample_alert() -> Alert {
        Alert {
            kind: AlertKind::CriticalSecurityEvent,
            timestamp: "2025-07-14T10:00:00+00:00".to_string(),
            event: "xss_attempt".to_string(),
            severity: "CRITICAL".to_string(),
            recipient: "security@example.com".to_string(),
            client_ip_hash: None,
            threshold: None,
            count: None,
            details: json!({}),
        }
    }

    #[test]
    fn security_counters_accumulate_per_client() {
        let tmp = tempfile::tempdir().unwrap();
        let counters = CounterStore::new(tmp.path());
        let now = at("2025-07-14T10:00:00Z");

        assert_eq!(counters.increment_security("c1", "devtools_detected", now).unwrap(), 1);
        assert_eq!(counters.increment_security("c1", "xss_attempt", now).unwrap(), 2);
        assert_eq!(counters.increment_security("c2", "xss_attempt", now).unwrap(), 1);
        assert_eq!(counters.security_total("c1", now).unwrap(), 2);
        assert_eq!(counters.security_total("nobody", now).unwrap(), 0);

        let raw: Value = serde_json::from_str(
            &fs::read_to_string(tmp.path().join("counters/security_2025-07-14.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(raw["c1"]["xss_attempt"], 1);

        // New day, new file
        assert_eq!(counters.security_total("c1", at("2025-07-15T10:00:00Z")).unwrap(), 0);
    }

    #[test]
    fn error_groups_counted() {
        let tmp = tempfile::tempdir().unwrap();
        let counters = CounterStore::new(tmp.path());
        let now = at("2025-07-14T10:00:00Z");

        for expected in 1..=3 {
            assert_eq!(counters.increment_error("g", now).unwrap(), expected);
        }
        assert_eq!(counters.increment_error("other", now).unwrap(), 1);
    }

    #[test]
    fn corrupt_counter_file_resets() {
        let tmp = tempfile::tempdir().unwrap();
        let counters = CounterStore::new(tmp.path());
        let now = at("2025-07-14T10:00:00Z");

        fs::create_dir_all(tmp.path().join("counters")).unwrap();
        fs::write(tmp.path().join("counters/errors_2025-07-14.json"), "[oops").unwrap();
        assert_eq!(counters.increment_error("g", now).unwrap(), 1);
    }

    #[test]
    fn cooldown_blocks_until_elapsed() {
        let tmp = tempfile::tempdir().unwrap();
        let cooldown = AlertCooldown::new(tmp.path(), chrono::Duration::hours(1));
        let now = at("2025-07-14T10:00:00Z");

        assert!(cooldown.is_ready(now).unwrap());
        assert_eq!(cooldown.record(now).unwrap(), 1);
        assert!(!cooldown.is_ready(now + chrono::Duration::minutes(59)).unwrap());
        assert!(cooldown.is_ready(now + chrono::Duration::hours(1)).unwrap());
        assert_eq!(cooldown.record(now + chrono::Duration::hours(1)).unwrap(), 2);
    }

    #[test]
    fn alert_json_shape() {
        let json = serde_json::to_value(sample_alert()).unwrap();
        assert_eq!(json["type"], "critical_security_event");
        assert_eq!(json["recipient"], "security@example.com");
        assert!(json.get("threshold").is_none());
    }

    #[tokio::test]
    async fn multi_notifier_tolerates_partial_failure() {
        let mut failing = MockNotifier::new();
        failing
            .expect_notify()
            .times(1)
            .returning(|_| Err(anyhow::anyhow!("smtp down")));
        let mut working = MockNotifier::new();
        working.expect_notify().times(1).returning(|_| Ok(()));

        let multi = MultiNotifier::new(vec![Arc::new(failing), Arc::new(working)]);
        assert!(multi.notify(&sample_alert()).await.is_ok());
    }

    #[tokio::test]
    async fn multi_notifier_reports_total_failure() {
        let mut failing = MockNotifier::new();
        failing
            .expect_notify()
            .returning(|_| Err(anyhow::anyhow!("down")));

        let multi = MultiNotifier::new(vec![Arc::new(failing)]);
        assert!(multi.notify(&sample_alert()).await.is_err());
    }

    #[tokio::test]
    async fn tracing_notifier_never_fails() {
        assert!(TracingNotifier.notify(&sample_alert()).await.is_ok());
    }
}
