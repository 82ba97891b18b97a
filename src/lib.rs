//! landing-guard - request guard and telemetry pipeline for a landing page
//!
//! This crate provides:
//! - CSRF tokens and fixed-window rate limiting keyed by hashed client
//! - Contact form validation and a JSONL outbox
//! - Campaign countdown and promo code checks
//! - A client-side telemetry batcher and the server-side log ingestion
//! - The HTTP API tying them together

pub mod campaign;
pub mod cli;
pub mod clock;
pub mod config;
pub mod contact;
pub mod guard;
pub mod ingest;
pub mod paths;
pub mod security;
pub mod server;
pub mod store;
pub mod telemetry;

pub use config::Config;
