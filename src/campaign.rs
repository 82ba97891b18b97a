//! Server-side campaign state: countdown, promo codes, tier availability.
//!
//! The end date lives in configuration so the page cannot extend a
//! campaign by tampering with its own clock.

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, SecondsFormat};
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::sync::Arc;

use crate::clock::Clock;
use crate::config::{CampaignConfig, PromoCodeConfig, TierConfig};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CampaignStatus {
    pub active: bool,
    pub end_date: String,
    /// Seconds, never negative
    pub time_remaining: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PromoResult {
    Valid {
        valid: bool,
        code: String,
        discount: u32,
        #[serde(rename = "type")]
        discount_type: String,
    },
    Invalid {
        valid: bool,
        error: &'static str,
    },
}

impl PromoResult {
    fn invalid(error: &'static str) -> Self {
        PromoResult::Invalid {
            valid: false,
            error,
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, PromoResult::Valid { .. })
    }
}

pub struct CampaignManager {
    end: DateTime<FixedOffset>,
    promo_codes: Vec<PromoCodeConfig>,
    tiers: Vec<TierConfig>,
    clock: Arc<dyn Clock>,
}

impl CampaignManager {
    pub fn from_config(config: &CampaignConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let end = DateTime::parse_from_rfc3339(&config.end_date)
            .with_context(|| format!("Invalid campaign end date: {}", config.end_date))?;
        Ok(Self {
            end,
            promo_codes: config.promo_codes.clone(),
            tiers: config.tiers.clone(),
            clock,
        })
    }

    pub fn is_active(&self) -> bool {
        self.clock.now() < self.end
    }

    pub fn status(&self) -> CampaignStatus {
        let remaining = self.end.timestamp() - self.clock.unix();
        CampaignStatus {
            active: self.is_active(),
            end_date: self.end.to_rfc3339_opts(SecondsFormat::Secs, false),
            time_remaining: remaining.max(0),
        }
    }

    pub fn validate_promo(&self, code: &str) -> PromoResult {
        let code = code.trim().to_uppercase();

        let Some(promo) = self.promo_codes.iter().find(|p| p.code.to_uppercase() == code) else {
            return PromoResult::invalid("Code not found");
        };

        if !promo.enabled || !self.is_active() {
            return PromoResult::invalid("Code expired");
        }

        if promo.used_count >= promo.max_uses {
            return PromoResult::invalid("Code usage limit reached");
        }

        PromoResult::Valid {
            valid: true,
            code,
            discount: promo.discount,
            discount_type: promo.discount_type.clone(),
        }
    }

    /// `{tier: {available, slots_remaining}}`, `null` slots meaning unlimited.
    pub fn availability(&self) -> Value {
        let tiers: Map<String, Value> = self
            .tiers
            .iter()
            .map(|t| {
                (
                    t.name.clone(),
                    json!({
                        "available": t.available && t.slots_remaining != Some(0),
                        "slots_remaining": t.slots_remaining,
                    }),
                )
            })
            .collect();
        Value::Object(tiers)
    }
}
