mod duration;

pub use duration::parse_duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::paths::Paths;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Resolved XDG-compliant paths (not serialized)
    #[serde(skip)]
    pub paths: Paths,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub guard: GuardConfig,

    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default)]
    pub alerts: AlertsConfig,

    #[serde(default)]
    pub campaign: CampaignConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_bind")]
    pub bind: String,

    /// Reject requests that did not arrive over HTTPS (checked through
    /// `X-Forwarded-Proto`, set by the TLS-terminating proxy)
    #[serde(default = "default_true")]
    pub require_https: bool,

    /// Requests with a larger Content-Length are rejected with 413
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: u64,

    /// Origins allowed by CORS. Empty = same-origin only.
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Lifetime of an issued CSRF token
    #[serde(default = "default_csrf_ttl")]
    pub csrf_ttl: String,

    /// Length of a rate-limit window
    #[serde(default = "default_rate_window")]
    pub rate_window: String,

    /// Requests allowed per client per window
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,

    /// Derive the client address from X-Forwarded-For / X-Real-IP / Client-IP
    #[serde(default = "default_true")]
    pub trust_proxy_headers: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Override for the security log directory (default: state_dir/logs/security)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<String>,

    /// Rotate a log file once it grows beyond this many bytes
    #[serde(default = "default_max_log_bytes")]
    pub max_log_bytes: u64,

    /// Days to keep log files (0 = keep forever)
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Logging endpoint requests allowed per client per window
    #[serde(default = "default_ingest_rate_limit")]
    pub rate_limit: u32,

    #[serde(default = "default_rate_window")]
    pub rate_window: String,

    /// Batches with more events are rejected with 413
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,

    /// Daily security events from one client before an alert is raised
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: u64,

    /// Minimum time between two threshold alerts
    #[serde(default = "default_alert_cooldown")]
    pub alert_cooldown: String,

    /// Security event names that alert immediately
    #[serde(default = "default_critical_events")]
    pub critical_events: Vec<String>,

    /// Occurrences of one error group in a day before alerting
    #[serde(default = "default_error_alert_threshold")]
    pub error_alert_threshold: u64,

    /// Performance events slower than this are reported
    #[serde(default = "default_slow_threshold_ms")]
    pub slow_threshold_ms: f64,

    /// Heap usage ratio (percent) that raises a memory alert
    #[serde(default = "default_memory_ratio_threshold")]
    pub memory_ratio_threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    /// Recipient carried in alert payloads
    #[serde(default = "default_alert_email")]
    pub email: String,

    /// Optional webhook receiving alerts as JSON
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,

    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignConfig {
    /// Campaign end, RFC 3339
    #[serde(default = "default_campaign_end")]
    pub end_date: String,

    #[serde(default = "default_promo_codes")]
    pub promo_codes: Vec<PromoCodeConfig>,

    #[serde(default = "default_tiers")]
    pub tiers: Vec<TierConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromoCodeConfig {
    pub code: String,

    pub discount: u32,

    /// "percentage" or "fixed"
    #[serde(rename = "type", default = "default_discount_type")]
    pub discount_type: String,

    #[serde(default = "default_max_uses")]
    pub max_uses: u64,

    #[serde(default)]
    pub used_count: u64,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    pub name: String,

    #[serde(default = "default_true")]
    pub available: bool,

    /// None = unlimited
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slots_remaining: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Logging endpoint the client batcher posts to
    #[serde(default = "default_telemetry_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_flush_interval")]
    pub flush_interval: String,

    /// Queue length that forces a flush
    #[serde(default = "default_max_queue")]
    pub max_queue: usize,

    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// "text" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_true() -> bool {
    true
}
fn default_port() -> u16 {
    8443
}
fn default_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_max_request_bytes() -> u64 {
    1_048_576 // 1MB
}
fn default_allowed_origins() -> Vec<String> {
    vec![
        "https://www.morgandigital.fr".to_string(),
        "https://morgandigital.fr".to_string(),
    ]
}
fn default_csrf_ttl() -> String {
    "1h".to_string()
}
fn default_rate_window() -> String {
    "5m".to_string()
}
fn default_rate_limit() -> u32 {
    10
}
fn default_max_log_bytes() -> u64 {
    52_428_800 // 50MB
}
fn default_retention_days() -> u32 {
    90
}
fn default_ingest_rate_limit() -> u32 {
    100
}
fn default_max_batch() -> usize {
    500
}
fn default_alert_threshold() -> u64 {
    5
}
fn default_alert_cooldown() -> String {
    "1h".to_string()
}
fn default_critical_events() -> Vec<String> {
    [
        "script_injection_attempt",
        "csrf_token_manipulation",
        "sql_injection_attempt",
        "xss_attempt",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_error_alert_threshold() -> u64 {
    10
}
fn default_slow_threshold_ms() -> f64 {
    5000.0
}
fn default_memory_ratio_threshold() -> f64 {
    95.0
}
fn default_alert_email() -> String {
    "security@morgandigital.fr".to_string()
}
fn default_http_timeout_secs() -> u64 {
    10
}
fn default_campaign_end() -> String {
    "2025-08-31T23:59:59+02:00".to_string()
}
fn default_discount_type() -> String {
    "percentage".to_string()
}
fn default_max_uses() -> u64 {
    1000
}
fn default_promo_codes() -> Vec<PromoCodeConfig> {
    vec![PromoCodeConfig {
        code: "SAVE50".to_string(),
        discount: 50,
        discount_type: default_discount_type(),
        max_uses: default_max_uses(),
        used_count: 0,
        enabled: true,
    }]
}
fn default_tiers() -> Vec<TierConfig> {
    ["starter", "professional", "enterprise"]
        .iter()
        .map(|name| TierConfig {
            name: name.to_string(),
            available: true,
            slots_remaining: None,
        })
        .collect()
}
fn default_telemetry_endpoint() -> String {
    "https://127.0.0.1:8443/api/security-log".to_string()
}
fn default_flush_interval() -> String {
    "30s".to_string()
}
fn default_max_queue() -> usize {
    50
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            require_https: default_true(),
            max_request_bytes: default_max_request_bytes(),
            allowed_origins: default_allowed_origins(),
        }
    }
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            csrf_ttl: default_csrf_ttl(),
            rate_window: default_rate_window(),
            rate_limit: default_rate_limit(),
            trust_proxy_headers: default_true(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            max_log_bytes: default_max_log_bytes(),
            retention_days: default_retention_days(),
            rate_limit: default_ingest_rate_limit(),
            rate_window: default_rate_window(),
            max_batch: default_max_batch(),
            alert_threshold: default_alert_threshold(),
            alert_cooldown: default_alert_cooldown(),
            critical_events: default_critical_events(),
            error_alert_threshold: default_error_alert_threshold(),
            slow_threshold_ms: default_slow_threshold_ms(),
            memory_ratio_threshold: default_memory_ratio_threshold(),
        }
    }
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            email: default_alert_email(),
            webhook_url: None,
            timeout_secs: default_http_timeout_secs(),
        }
    }
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            end_date: default_campaign_end(),
            promo_codes: default_promo_codes(),
            tiers: default_tiers(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            endpoint: default_telemetry_endpoint(),
            flush_interval: default_flush_interval(),
            max_queue: default_max_queue(),
            timeout_secs: default_http_timeout_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load from an explicit file, or from `config_dir/config.toml`.
    ///
    /// The default location gets a commented template on first run.
    pub fn load_from(explicit: Option<&Path>) -> Result<Self> {
        let paths = Paths::resolve()?;
        paths.ensure_dirs()?;

        let path = match explicit {
            Some(p) => p.to_path_buf(),
            None => paths.config_file(),
        };

        if !path.exists() {
            if explicit.is_some() {
                anyhow::bail!("Config file not found: {}", path.display());
            }
            let config = Config {
                paths,
                ..Config::default()
            };
            config.save_with_template()?;
            return Ok(config);
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut config = Self::from_toml(&content)?;
        config.paths = paths;

        Ok(config)
    }

    /// Parse a config document, expand env vars, and check derived values.
    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content).context("Invalid config.toml")?;
        config.expand_env_vars();
        config.validate()?;
        Ok(config)
    }

    /// Reject durations and dates that would only fail later at runtime.
    pub fn validate(&self) -> Result<()> {
        parse_duration(&self.guard.csrf_ttl).context("guard.csrf_ttl")?;
        parse_duration(&self.guard.rate_window).context("guard.rate_window")?;
        parse_duration(&self.ingest.rate_window).context("ingest.rate_window")?;
        parse_duration(&self.ingest.alert_cooldown).context("ingest.alert_cooldown")?;
        parse_duration(&self.telemetry.flush_interval).context("telemetry.flush_interval")?;
        chrono::DateTime::parse_from_rfc3339(&self.campaign.end_date)
            .context("campaign.end_date must be RFC 3339")?;
        if self.guard.rate_limit == 0 || self.ingest.rate_limit == 0 {
            anyhow::bail!("rate limits must be at least 1");
        }
        if self.telemetry.max_queue == 0 {
            anyhow::bail!("telemetry.max_queue must be at least 1");
        }
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&self.paths.config_file())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;

        Ok(())
    }

    /// Save config with a helpful template (for first-time setup)
    pub fn save_with_template(&self) -> Result<()> {
        let path = self.paths.config_file();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(&path, DEFAULT_CONFIG_TEMPLATE)?;
        eprintln!("Created default config at {}", path.display());

        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let paths = Paths::resolve()?;
        Ok(paths.config_file())
    }

    /// Directory receiving ingested client logs.
    pub fn security_log_dir(&self) -> PathBuf {
        match self.ingest.log_dir {
            Some(ref dir) => PathBuf::from(shellexpand::tilde(dir).to_string()),
            None => self.paths.security_log_dir(),
        }
    }

    fn expand_env_vars(&mut self) {
        if let Some(ref mut url) = self.alerts.webhook_url {
            *url = expand_env(url);
        }
        self.alerts.email = expand_env(&self.alerts.email);
    }

    pub fn get_value(&self, key: &str) -> Result<String> {
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["server", "port"] => Ok(self.server.port.to_string()),
            ["server", "bind"] => Ok(self.server.bind.clone()),
            ["server", "require_https"] => Ok(self.server.require_https.to_string()),
            ["server", "max_request_bytes"] => Ok(self.server.max_request_bytes.to_string()),
            ["guard", "csrf_ttl"] => Ok(self.guard.csrf_ttl.clone()),
            ["guard", "rate_window"] => Ok(self.guard.rate_window.clone()),
            ["guard", "rate_limit"] => Ok(self.guard.rate_limit.to_string()),
            ["ingest", "retention_days"] => Ok(self.ingest.retention_days.to_string()),
            ["ingest", "alert_threshold"] => Ok(self.ingest.alert_threshold.to_string()),
            ["ingest", "rate_limit"] => Ok(self.ingest.rate_limit.to_string()),
            ["alerts", "email"] => Ok(self.alerts.email.clone()),
            ["alerts", "webhook_url"] => Ok(self.alerts.webhook_url.clone().unwrap_or_default()),
            ["campaign", "end_date"] => Ok(self.campaign.end_date.clone()),
            ["telemetry", "endpoint"] => Ok(self.telemetry.endpoint.clone()),
            ["telemetry", "flush_interval"] => Ok(self.telemetry.flush_interval.clone()),
            ["logging", "level"] => Ok(self.logging.level.clone()),
            ["logging", "format"] => Ok(self.logging.format.clone()),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
    }

    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["server", "port"] => self.server.port = value.parse()?,
            ["server", "bind"] => self.server.bind = value.to_string(),
            ["server", "require_https"] => self.server.require_https = value.parse()?,
            ["server", "max_request_bytes"] => self.server.max_request_bytes = value.parse()?,
            ["guard", "csrf_ttl"] => self.guard.csrf_ttl = value.to_string(),
            ["guard", "rate_window"] => self.guard.rate_window = value.to_string(),
            ["guard", "rate_limit"] => self.guard.rate_limit = value.parse()?,
            ["ingest", "retention_days"] => self.ingest.retention_days = value.parse()?,
            ["ingest", "alert_threshold"] => self.ingest.alert_threshold = value.parse()?,
            ["ingest", "rate_limit"] => self.ingest.rate_limit = value.parse()?,
            ["alerts", "email"] => self.alerts.email = value.to_string(),
            ["alerts", "webhook_url"] => {
                self.alerts.webhook_url = (!value.is_empty()).then(|| value.to_string())
            }
            ["campaign", "end_date"] => self.campaign.end_date = value.to_string(),
            ["telemetry", "endpoint"] => self.telemetry.endpoint = value.to_string(),
            ["telemetry", "flush_interval"] => self.telemetry.flush_interval = value.to_string(),
            ["logging", "level"] => self.logging.level = value.to_string(),
            ["logging", "format"] => self.logging.format = value.to_string(),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }

        self.validate()
    }
}

fn expand_env(s: &str) -> String {
    if let Some(var_name) = s.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
        std::env::var(var_name).unwrap_or_else(|_| s.to_string())
    } else if let Some(var_name) = s.strip_prefix('$') {
        std::env::var(var_name).unwrap_or_else(|_| s.to_string())
    } else {
        s.to_string()
    }
}

/// Default config template with helpful comments (used for first-time setup)
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# landing-guard configuration
# Auto-created on first run. Edit as needed.

[server]
bind = "127.0.0.1"
port = 8443
# The TLS proxy must set X-Forwarded-Proto: https
require_https = true
max_request_bytes = 1048576
allowed_origins = ["https://www.morgandigital.fr", "https://morgandigital.fr"]

[guard]
csrf_ttl = "1h"
rate_window = "5m"
rate_limit = 10
trust_proxy_headers = true

[ingest]
# log_dir = "/var/log/landing-guard/security"
max_log_bytes = 52428800
retention_days = 90
rate_limit = 100
rate_window = "5m"
alert_threshold = 5
alert_cooldown = "1h"

[alerts]
email = "security@morgandigital.fr"
# webhook_url = "${LANDING_GUARD_ALERT_WEBHOOK}"

[campaign]
end_date = "2025-08-31T23:59:59+02:00"

[[campaign.promo_codes]]
code = "SAVE50"
discount = 50
type = "percentage"
max_uses = 1000

[[campaign.tiers]]
name = "starter"

[[campaign.tiers]]
name = "professional"

[[campaign.tiers]]
name = "enterprise"

[telemetry]
endpoint = "https://127.0.0.1:8443/api/security-log"
flush_interval = "30s"
max_queue = 50

[logging]
level = "info"
# format = "json"
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_parses_to_defaults() {
        let config = Config::from_toml(DEFAULT_CONFIG_TEMPLATE).unwrap();
        let defaults = Config::default();

        assert_eq!(config.server.port, defaults.server.port);
        assert_eq!(config.guard.rate_limit, defaults.guard.rate_limit);
        assert_eq!(config.ingest.retention_days, defaults.ingest.retention_days);
        assert_eq!(config.campaign.promo_codes.len(), 1);
        assert_eq!(config.campaign.promo_codes[0].discount_type, "percentage");
        assert_eq!(config.campaign.tiers.len(), 3);
        assert_eq!(config.telemetry.max_queue, 50);
    }

    #[test]
    fn empty_document_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.guard.csrf_ttl, "1h");
        assert_eq!(config.ingest.critical_events.len(), 4);
        assert!(config.server.require_https);
    }

    #[test]
    fn invalid_duration_rejected() {
        let err = Config::from_toml("[guard]\nrate_window = \"soon\"\n").unwrap_err();
        assert!(format!("{:#}", err).contains("guard.rate_window"));
    }

    #[test]
    fn invalid_end_date_rejected() {
        assert!(Config::from_toml("[campaign]\nend_date = \"tomorrow\"\n").is_err());
    }

    #[test]
    fn get_and_set_roundtrip() {
        let mut config = Config::default();
        config.set_value("guard.rate_limit", "25").unwrap();
        config.set_value("alerts.webhook_url", "https://hooks.example/x").unwrap();

        assert_eq!(config.get_value("guard.rate_limit").unwrap(), "25");
        assert_eq!(
            config.get_value("alerts.webhook_url").unwrap(),
            "https://hooks.example/x"
        );

        config.set_value("alerts.webhook_url", "").unwrap();
        assert!(config.alerts.webhook_url.is_none());
    }

    #[test]
    fn set_value_rejects_unknown_and_invalid() {
        let mut config = Config::default();
        assert!(config.set_value("guard.nope", "1").is_err());
        assert!(config.set_value("guard.rate_limit", "0").is_err());
        assert!(config.get_value("nope").is_err());
    }

    #[test]
    fn log_dir_override_is_expanded() {
        let mut config = Config::default();
        assert!(config.security_log_dir().ends_with("logs/security"));

        config.ingest.log_dir = Some("/var/log/lg".to_string());
        assert_eq!(config.security_log_dir(), PathBuf::from("/var/log/lg"));
    }
}
