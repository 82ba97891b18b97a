//! Request gates applied before any handler runs: HTTPS, declared body
//! size, then the site-wide rate limit.

use axum::{
    extract::{ConnectInfo, FromRequestParts, Request, State},
    http::{header, request::Parts},
    middleware::Next,
    response::Response,
};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

use super::error::ApiError;
use super::http::AppState;
use crate::guard::client_ip;
use crate::security::AuditAction;

/// Routes exempt from the site-wide limiter. The logging endpoint has its
/// own, `/health` is polled by the proxy.
const RATE_EXEMPT: [&str; 2] = ["/api/security-log", "/health"];

/// Address identifying the caller, resolved through the proxy headers when
/// they are trusted.
#[derive(Debug, Clone)]
pub struct ClientIp(pub String);

impl FromRequestParts<Arc<AppState>> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        Ok(ClientIp(client_ip(
            &parts.headers,
            peer,
            state.guard.trust_proxy_headers(),
        )))
    }
}

pub async fn require_https(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if state.require_https {
        let proto = req
            .headers()
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_ascii_lowercase());
        if proto.as_deref() != Some("https") {
            return Err(ApiError::bad_request("HTTPS required"));
        }
    }
    Ok(next.run(req).await)
}

pub async fn limit_request_size(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let declared = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if let Some(len) = declared
        && len > state.max_request_bytes
    {
        debug!(len, "Rejecting oversized request");
        return Err(ApiError::PayloadTooLarge("Request too large"));
    }
    Ok(next.run(req).await)
}

pub async fn site_rate_limit(
    State(state): State<Arc<AppState>>,
    ClientIp(ip): ClientIp,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if RATE_EXEMPT.contains(&req.uri().path()) {
        return Ok(next.run(req).await);
    }
    if !state.guard.check_rate_limit(&ip) {
        let client = state.guard.client_key(&ip);
        state.audit(AuditAction::RateLimited, &client, req.uri().path(), None);
        return Err(ApiError::TooManyRequests("Too many requests"));
    }
    Ok(next.run(req).await)
}
