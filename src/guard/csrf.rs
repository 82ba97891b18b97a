//! Single-use CSRF tokens bound to a hashed client identifier.

use anyhow::Result;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::debug;

use super::hasher::random_hex;
use crate::clock::Clock;
use crate::store::{KeyValueStore, Mutation};

const NAMESPACE: &str = "csrf";
const TOKEN_BYTES: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CsrfRecord {
    token: String,
    /// Unix seconds
    expiry: i64,
}

pub struct CsrfGuard {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl CsrfGuard {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self { store, clock, ttl }
    }

    /// Issue a fresh token for `client_key`, replacing any previous one.
    pub fn issue_token(&self, client_key: &str) -> Result<String> {
        let token = random_hex(TOKEN_BYTES);
        let record = CsrfRecord {
            token: token.clone(),
            expiry: (self.clock.now() + self.ttl).timestamp(),
        };
        self.store
            .set(NAMESPACE, client_key, serde_json::to_value(&record)?, Some(self.ttl))?;
        Ok(token)
    }

    /// Check `candidate` against the stored token.
    ///
    /// A match consumes the token. An expired record is deleted. Storage
    /// errors propagate so callers can fail closed.
    pub fn validate_token(&self, client_key: &str, candidate: &str) -> Result<bool> {
        let now = self.clock.unix();
        let mut valid = false;

        self.store.update(NAMESPACE, client_key, &mut |current| {
            let Some(record) =
                current.and_then(|v| serde_json::from_value::<CsrfRecord>(v.clone()).ok())
            else {
                // Absent or unreadable
                return if current.is_some() {
                    Mutation::Remove
                } else {
                    Mutation::Keep
                };
            };

            if record.expiry < now {
                debug!("CSRF token expired");
                return Mutation::Remove;
            }

            valid = record
                .token
                .as_bytes()
                .ct_eq(candidate.as_bytes())
                .into();
            if valid { Mutation::Remove } else { Mutation::Keep }
        })?;

        Ok(valid)
    }
}
