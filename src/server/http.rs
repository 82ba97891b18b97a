//! HTTP API for the landing page
//!
//! Serves CSRF tokens, campaign state, promo validation, contact intake and
//! the telemetry logging endpoint. Meant to sit behind a TLS-terminating
//! reverse proxy.

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderName, HeaderValue, Method, Uri, header},
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::error::ApiError;
use super::middleware::{ClientIp, limit_request_size, require_https, site_rate_limit};
use crate::campaign::{CampaignManager, CampaignStatus, PromoResult};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::contact::{ContactForm, ContactOutbox, validate_submission};
use crate::guard::{ClientHasher, Guard, GuardSettings};
use crate::ingest::{
    IngestSettings, LogIngestor, MultiNotifier, Notifier, TracingNotifier, WebhookNotifier,
};
use crate::security::{AuditAction, append_audit_entry};
use crate::store::FileStore;

pub struct Server {
    config: Config,
}

/// Everything a request handler can reach.
pub struct AppState {
    pub guard: Guard,
    pub campaign: CampaignManager,
    pub ingestor: LogIngestor,
    pub outbox: ContactOutbox,
    pub audit_log: PathBuf,
    pub clock: Arc<dyn Clock>,
    pub require_https: bool,
    pub max_request_bytes: u64,
    pub allowed_origins: Vec<String>,
}

impl AppState {
    /// Wire the file-backed guard state, ingestion and outbox under the
    /// configured directories.
    pub fn from_config(config: &Config, clock: Arc<dyn Clock>) -> Result<Self> {
        let paths = &config.paths;
        paths.ensure_dirs()?;

        let hasher = ClientHasher::load_or_create(&paths.hash_key())?;
        let store = Arc::new(FileStore::open(&paths.guard_dir(), clock.clone())?);

        let guard = Guard::new(
            store.clone(),
            clock.clone(),
            hasher.clone(),
            &GuardSettings::from_config(&config.guard)?,
        );

        let mut notifiers: Vec<Arc<dyn Notifier>> = vec![Arc::new(TracingNotifier)];
        if let Some(ref url) = config.alerts.webhook_url {
            notifiers.push(Arc::new(WebhookNotifier::new(
                url,
                Duration::from_secs(config.alerts.timeout_secs),
            )?));
        }

        let ingestor = LogIngestor::new(
            &config.security_log_dir(),
            store,
            clock.clone(),
            hasher,
            Arc::new(MultiNotifier::new(notifiers)),
            IngestSettings::from_config(config)?,
        );

        Ok(Self {
            guard,
            campaign: CampaignManager::from_config(&config.campaign, clock.clone())?,
            ingestor,
            outbox: ContactOutbox::new(&paths.outbox_dir()),
            audit_log: paths.audit_log(),
            clock,
            require_https: config.server.require_https,
            max_request_bytes: config.server.max_request_bytes,
            allowed_origins: config.server.allowed_origins.clone(),
        })
    }

    /// Record a guard decision. Failures are logged, never surfaced.
    pub fn audit(&self, action: AuditAction, client_hash: &str, source: &str, detail: Option<&str>) {
        if let Err(e) = append_audit_entry(
            &self.audit_log,
            action,
            client_hash,
            source,
            detail,
            self.clock.now(),
        ) {
            warn!("Failed to write audit entry: {:#}", e);
        }
    }
}

impl Server {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            config: config.clone(),
        })
    }

    pub async fn run(&self) -> Result<()> {
        let state = Arc::new(AppState::from_config(&self.config, Arc::new(SystemClock))?);

        let removed = state
            .ingestor
            .init()
            .context("Failed to prepare security log directory")?;
        if removed > 0 {
            info!("Removed {} expired log files", removed);
        }

        let app = build_router(state);

        let addr: SocketAddr =
            format!("{}:{}", self.config.server.bind, self.config.server.port).parse()?;

        info!("Starting HTTP server on http://{}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await?;

        Ok(())
    }
}

/// Routes, request gates and response headers. Serve with
/// `into_make_service_with_connect_info::<SocketAddr>()` so the peer
/// address is available when proxy headers are absent.
pub fn build_router(state: Arc<AppState>) -> Router {
    let origins: Vec<HeaderValue> = state
        .allowed_origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!("Ignoring invalid CORS origin: {}", o);
                None
            }
        })
        .collect();

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            header::CONTENT_TYPE,
            HeaderName::from_static("x-requested-with"),
        ]);

    Router::new()
        .route("/csrf-token", get(csrf_token))
        .route("/campaign-status", get(campaign_status))
        .route("/validate-promo", post(validate_promo))
        .route("/availability", get(availability))
        .route("/contact", post(contact))
        .route("/api/security-log", post(security_log))
        .route("/health", get(health_check))
        .method_not_allowed_fallback(method_not_allowed)
        .fallback(not_found)
        // Last added runs first
        .layer(middleware::from_fn_with_state(state.clone(), site_rate_limit))
        .layer(middleware::from_fn_with_state(state.clone(), limit_request_size))
        .layer(middleware::from_fn_with_state(state.clone(), require_https))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_XSS_PROTECTION,
            HeaderValue::from_static("1; mode=block"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::REFERRER_POLICY,
            HeaderValue::from_static("strict-origin-when-cross-origin"),
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}

async fn not_found() -> ApiError {
    ApiError::NotFound
}

async fn method_not_allowed() -> ApiError {
    ApiError::MethodNotAllowed
}

async fn csrf_token(
    State(state): State<Arc<AppState>>,
    ClientIp(ip): ClientIp,
) -> Result<Json<Value>, ApiError> {
    let token = state.guard.issue_token(&ip).map_err(ApiError::Internal)?;
    Ok(Json(json!({ "csrf_token": token })))
}

async fn campaign_status(State(state): State<Arc<AppState>>) -> Json<CampaignStatus> {
    Json(state.campaign.status())
}

async fn availability(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(state.campaign.availability())
}

async fn validate_promo(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<PromoResult>, ApiError> {
    let input: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let code = input
        .get("code")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::bad_request("Promo code required"))?;
    Ok(Json(state.campaign.validate_promo(code)))
}

/// The token is consumed by the check itself, so a submission that fails
/// later validation needs a fresh token.
async fn contact(
    State(state): State<Arc<AppState>>,
    ClientIp(ip): ClientIp,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let form: ContactForm = serde_json::from_slice(&body).unwrap_or_default();
    let client = state.guard.client_key(&ip);

    let token_valid = match form.csrf.as_deref() {
        Some(token) if !token.is_empty() => state.guard.validate_token(&ip, token),
        _ => false,
    };
    if !token_valid {
        state.audit(AuditAction::CsrfRejected, &client, "contact", None);
        return Err(ApiError::bad_request("Invalid CSRF token"));
    }

    if form.is_spam() {
        state.audit(AuditAction::SpamDetected, &client, "contact", None);
        return Err(ApiError::bad_request("Spam detected"));
    }

    let submission = validate_submission(&form).inspect_err(|e| {
        state.audit(
            AuditAction::ValidationFailed,
            &client,
            "contact",
            Some(&e.to_string()),
        );
    })?;

    let record = state
        .outbox
        .append(&submission, &client, state.clock.now())
        .map_err(ApiError::Internal)?;
    state.audit(
        AuditAction::ContactAccepted,
        &client,
        "contact",
        Some(&record.id),
    );
    info!(client = %client, id = %record.id, "Contact submission accepted");

    Ok(Json(json!({
        "success": true,
        "message": "Message sent successfully",
    })))
}

async fn security_log(
    State(state): State<Arc<AppState>>,
    ClientIp(ip): ClientIp,
    uri: Uri,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let payload: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let outcome = state.ingestor.ingest(&payload, &ip, uri.path()).await?;
    Ok(Json(json!({
        "success": true,
        "processed": outcome.processed,
        "timestamp": outcome.timestamp,
    })))
}
