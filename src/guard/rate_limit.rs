//! Fixed-window request ceiling per hashed client.

use anyhow::Result;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::clock::Clock;
use crate::store::{KeyValueStore, Mutation};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RateWindow {
    /// Unix seconds
    window_start: i64,
    request_count: u32,
}

pub struct RateLimiter {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    namespace: &'static str,
    window: Duration,
    ceiling: u32,
}

impl RateLimiter {
    /// `namespace` keeps independent limiters (site-wide, logging endpoint)
    /// from sharing counters in the same store.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        namespace: &'static str,
        window: Duration,
        ceiling: u32,
    ) -> Self {
        Self {
            store,
            clock,
            namespace,
            window,
            ceiling,
        }
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    /// Count one request. `Ok(false)` once the ceiling is reached for the
    /// current window.
    pub fn check_and_consume(&self, client_key: &str) -> Result<bool> {
        let now = self.clock.unix();
        let window_secs = self.window.num_seconds();
        let mut allowed = false;

        self.store.update(self.namespace, client_key, &mut |current| {
            let current = current.and_then(|v| serde_json::from_value::<RateWindow>(v.clone()).ok());

            let next = match current {
                Some(w) if now - w.window_start < window_secs => {
                    if w.request_count >= self.ceiling {
                        return Mutation::Keep;
                    }
                    RateWindow {
                        request_count: w.request_count + 1,
                        ..w
                    }
                }
                _ => RateWindow {
                    window_start: now,
                    request_count: 1,
                },
            };

            allowed = true;
            // Expire with the window so stale records can be purged
            let remaining = next.window_start + window_secs - now;
            match serde_json::to_value(&next) {
                Ok(value) => Mutation::Put {
                    value,
                    ttl: Some(Duration::seconds(remaining.max(1))),
                },
                Err(_) => {
                    allowed = false;
                    Mutation::Keep
                }
            }
        })?;

        Ok(allowed)
    }
}
