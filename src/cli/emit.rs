//! CLI subcommand: `landing-guard emit`
//!
//! Pushes one event through the client batcher to a running server. Useful
//! to check the logging endpoint end to end after a deploy.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Args;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::telemetry::{
    BatcherSettings, EventBatcher, HttpTransport, LogBatch, LogType, Severity, Transport,
    TransportError,
};

#[derive(Args)]
pub struct EmitArgs {
    /// Event name (e.g. page_view, devtools_detected)
    pub event: String,

    /// Log type: security, event, performance or error
    #[arg(short = 't', long = "type", default_value = "event")]
    pub log_type: LogType,

    /// Event data as a JSON object
    #[arg(short, long, default_value = "{}")]
    pub data: String,

    /// low, medium, high or critical
    #[arg(short, long, default_value = "medium")]
    pub severity: Severity,

    /// Logging endpoint (overrides telemetry.endpoint)
    #[arg(short, long)]
    pub endpoint: Option<String>,

    /// Page URL reported with the event
    #[arg(long)]
    pub url: Option<String>,
}

/// Reports each delivery outcome so the command can wait for it.
struct ReportingTransport {
    inner: HttpTransport,
    outcomes: mpsc::UnboundedSender<Result<usize, String>>,
}

#[async_trait]
impl Transport for ReportingTransport {
    async fn send(&self, batch: &LogBatch) -> Result<(), TransportError> {
        let result = self.inner.send(batch).await;
        let _ = self.outcomes.send(match &result {
            Ok(()) => Ok(batch.logs.len()),
            Err(e) => Err(e.to_string()),
        });
        result
    }

    fn beacon(&self, batch: LogBatch) {
        self.inner.beacon(batch);
    }
}

pub async fn run(args: EmitArgs, config_path: Option<&Path>) -> Result<()> {
    let config = Config::load_from(config_path)?;
    let endpoint = args.endpoint.unwrap_or(config.telemetry.endpoint.clone());
    let timeout = Duration::from_secs(config.telemetry.timeout_secs);

    let data: Value = serde_json::from_str(&args.data).context("--data must be valid JSON")?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let transport = ReportingTransport {
        inner: HttpTransport::new(&endpoint, timeout)?,
        outcomes: tx,
    };
    let batcher = EventBatcher::new(
        Arc::new(transport),
        &BatcherSettings::from_config(&config.telemetry)?,
    )
    .with_page(args.url.as_deref(), Some(concat!("landing-guard/", env!("CARGO_PKG_VERSION"))));

    batcher.log_event(args.log_type, &args.event, &data, args.severity);
    batcher.trigger_flush();

    let outcome = tokio::time::timeout(timeout + Duration::from_secs(1), rx.recv())
        .await
        .context("Timed out waiting for delivery")?
        .context("Delivery task ended without reporting")?;

    match outcome {
        Ok(count) => {
            println!(
                "Delivered {} event(s) to {} (session {})",
                count,
                endpoint,
                batcher.session_id()
            );
            Ok(())
        }
        Err(e) => anyhow::bail!("Delivery to {} failed: {}", endpoint, e),
    }
}
