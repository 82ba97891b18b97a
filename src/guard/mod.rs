//! Per-client request guard: CSRF tokens and the site-wide rate limit.
//!
//! All state is keyed by [`ClientHasher`] output, never by raw address.
//! Storage failures fail closed: a token that cannot be checked is
//! invalid and a request that cannot be counted is rejected.

pub mod client;
pub mod csrf;
pub mod hasher;
pub mod rate_limit;

pub use client::client_ip;
pub use csrf::CsrfGuard;
pub use hasher::ClientHasher;
pub use rate_limit::RateLimiter;

use anyhow::{Context, Result};
use chrono::Duration;
use std::sync::Arc;
use tracing::warn;

use crate::clock::Clock;
use crate::config::{GuardConfig, parse_duration};
use crate::store::KeyValueStore;

/// Store namespace of the site-wide limiter.
pub const SITE_RATE_NAMESPACE: &str = "rate";

/// [`GuardConfig`] with durations resolved.
#[derive(Debug, Clone)]
pub struct GuardSettings {
    pub csrf_ttl: Duration,
    pub rate_window: Duration,
    pub rate_limit: u32,
    pub trust_proxy_headers: bool,
}

impl GuardSettings {
    pub fn from_config(config: &GuardConfig) -> Result<Self> {
        Ok(Self {
            csrf_ttl: to_chrono(parse_duration(&config.csrf_ttl).context("guard.csrf_ttl")?)?,
            rate_window: to_chrono(
                parse_duration(&config.rate_window).context("guard.rate_window")?,
            )?,
            rate_limit: config.rate_limit,
            trust_proxy_headers: config.trust_proxy_headers,
        })
    }
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            csrf_ttl: Duration::hours(1),
            rate_window: Duration::minutes(5),
            rate_limit: 10,
            trust_proxy_headers: true,
        }
    }
}

pub(crate) fn to_chrono(d: std::time::Duration) -> Result<Duration> {
    Duration::from_std(d).context("duration out of range")
}

pub struct Guard {
    hasher: ClientHasher,
    csrf: CsrfGuard,
    limiter: RateLimiter,
    store: Arc<dyn KeyValueStore>,
    trust_proxy_headers: bool,
}

impl Guard {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        hasher: ClientHasher,
        settings: &GuardSettings,
    ) -> Self {
        Self {
            hasher,
            csrf: CsrfGuard::new(store.clone(), clock.clone(), settings.csrf_ttl),
            limiter: RateLimiter::new(
                store.clone(),
                clock,
                SITE_RATE_NAMESPACE,
                settings.rate_window,
                settings.rate_limit,
            ),
            store,
            trust_proxy_headers: settings.trust_proxy_headers,
        }
    }

    pub fn hasher(&self) -> &ClientHasher {
        &self.hasher
    }

    pub fn trust_proxy_headers(&self) -> bool {
        self.trust_proxy_headers
    }

    pub fn client_key(&self, client_ip: &str) -> String {
        self.hasher.hash(client_ip)
    }

    pub fn issue_token(&self, client_ip: &str) -> Result<String> {
        self.csrf.issue_token(&self.client_key(client_ip))
    }

    pub fn validate_token(&self, client_ip: &str, candidate: &str) -> bool {
        let key = self.client_key(client_ip);
        self.csrf
            .validate_token(&key, candidate)
            .unwrap_or_else(|e| {
                warn!(client = %key, "CSRF state unreadable, rejecting: {:#}", e);
                false
            })
    }

    pub fn check_rate_limit(&self, client_ip: &str) -> bool {
        let key = self.client_key(client_ip);
        self.limiter.check_and_consume(&key).unwrap_or_else(|e| {
            warn!(client = %key, "Rate state unreadable, rejecting: {:#}", e);
            false
        })
    }

    /// Drop expired tokens and elapsed windows.
    pub fn purge_expired(&self) -> Result<usize> {
        self.store.purge_expired()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{FileStore, MemoryStore, Mutation};
    use serde_json::Value;

    fn guard_with(store: Arc<dyn KeyValueStore>, clock: Arc<ManualClock>) -> Guard {
        let hasher = ClientHasher::new(&[7u8; 32]).unwrap();
        Guard::new(store, clock, hasher, &GuardSettings::default())
    }

    #[test]
    fn settings_from_default_config() {
        let settings = GuardSettings::from_config(&GuardConfig::default()).unwrap();
        assert_eq!(settings.csrf_ttl, Duration::seconds(3600));
        assert_eq!(settings.rate_window, Duration::seconds(300));
        assert_eq!(settings.rate_limit, 10);
    }

    #[test]
    fn eleventh_request_rejected_then_allowed_after_window() {
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        let guard = guard_with(Arc::new(MemoryStore::new(clock.clone())), clock.clone());

        for _ in 0..10 {
            assert!(guard.check_rate_limit("8.8.8.8"));
        }
        assert!(!guard.check_rate_limit("8.8.8.8"));

        clock.advance(Duration::seconds(301));
        assert!(guard.check_rate_limit("8.8.8.8"));
    }

    #[test]
    fn file_backed_state_is_hashed() {
        let tmp = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        let store = Arc::new(FileStore::open(tmp.path(), clock.clone()).unwrap());
        let guard = guard_with(store, clock);

        let token = guard.issue_token("8.8.8.8").unwrap();
        guard.check_rate_limit("8.8.8.8");

        let names: Vec<String> = std::fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert!(names.iter().all(|n| !n.contains("8.8.8.8")));
        let key = guard.client_key("8.8.8.8");
        assert!(names.contains(&format!("csrf_{}", key)));
        assert!(names.contains(&format!("rate_{}", key)));

        assert!(guard.validate_token("8.8.8.8", &token));
        assert!(!guard.validate_token("8.8.8.8", &token));
    }

    /// Store whose every operation fails.
    struct BrokenStore;

    impl KeyValueStore for BrokenStore {
        fn get(&self, _: &str, _: &str) -> Result<Option<Value>> {
            anyhow::bail!("disk on fire")
        }
        fn set(&self, _: &str, _: &str, _: Value, _: Option<Duration>) -> Result<()> {
            anyhow::bail!("disk on fire")
        }
        fn delete(&self, _: &str, _: &str) -> Result<()> {
            anyhow::bail!("disk on fire")
        }
        fn update(
            &self,
            _: &str,
            _: &str,
            _: &mut dyn FnMut(Option<&Value>) -> Mutation,
        ) -> Result<()> {
            anyhow::bail!("disk on fire")
        }
        fn purge_expired(&self) -> Result<usize> {
            anyhow::bail!("disk on fire")
        }
    }

    #[test]
    fn storage_errors_fail_closed() {
        let clock = Arc::new(ManualClock::at_unix(0));
        let guard = guard_with(Arc::new(BrokenStore), clock);

        assert!(guard.issue_token("8.8.8.8").is_err());
        assert!(!guard.validate_token("8.8.8.8", "anything"));
        assert!(!guard.check_rate_limit("8.8.8.8"));
    }
}
