//! Request admission middleware.
//!
//! Derives the caller's identity from the request, asks the engine for a
//! decision, and turns that decision into either the downstream response or a
//! short-circuit rejection. Store failures are fail-closed.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::AsHeaderName;
use axum::http::{HeaderMap, HeaderName, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::{debug, error};

use crate::limiter::{AdmissionEngine, Decision};

/// Body message returned with every 429.
pub const RATE_LIMIT_EXCEEDED_MESSAGE: &str =
    "you have reached the maximum number of requests or actions allowed within a certain time frame";

const FORWARDED_FOR: &str = "x-forwarded-for";
const REAL_IP: &str = "x-real-ip";

/// Shared state for the admission middleware.
#[derive(Clone)]
pub struct AdmissionState {
    engine: Arc<AdmissionEngine>,
    token_header: HeaderName,
}

impl AdmissionState {
    /// Create middleware state reading tokens from `token_header`.
    pub fn new(engine: Arc<AdmissionEngine>, token_header: HeaderName) -> Self {
        Self {
            engine,
            token_header,
        }
    }

    /// The engine behind this middleware.
    pub fn engine(&self) -> &Arc<AdmissionEngine> {
        &self.engine
    }
}

/// Client address: first `X-Forwarded-For` hop, else `X-Real-IP`, else the peer.
pub fn client_address(request: &Request) -> String {
    let headers = request.headers();

    if let Some(forwarded) = header_str(headers, FORWARDED_FOR) {
        if let Some(first) = forwarded.split(',').next() {
            return first.trim().to_string();
        }
    }

    if let Some(real_ip) = header_str(headers, REAL_IP) {
        return real_ip.to_string();
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(peer)| peer.ip().to_string())
        .unwrap_or_default()
}

/// Bearer token from the designated header, empty if absent.
pub fn request_token(headers: &HeaderMap, token_header: &HeaderName) -> String {
    header_str(headers, token_header)
        .unwrap_or_default()
        .to_string()
}

fn header_str<K: AsHeaderName>(headers: &HeaderMap, name: K) -> Option<&str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
}

/// The 429 response sent when a window is exhausted.
pub fn rate_limited_response() -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({ "error": RATE_LIMIT_EXCEEDED_MESSAGE })),
    )
        .into_response()
}

/// Admission middleware for axum routers.
pub async fn admission_middleware(
    State(state): State<AdmissionState>,
    request: Request,
    next: Next,
) -> Response {
    let address = client_address(&request);
    let token = request_token(request.headers(), &state.token_header);
    let class = if token.is_empty() { "ip" } else { "token" };

    match state.engine.decide(&address, &token).await {
        Ok(Decision::Allowed) => next.run(request).await,
        Ok(Decision::Denied) => {
            debug!(
                identity_class = class,
                path = %request.uri().path(),
                "Request rejected: rate limit exceeded"
            );
            rate_limited_response()
        }
        Err(e) => {
            error!(
                error = %e,
                identity_class = class,
                path = %request.uri().path(),
                "Admission check failed"
            );
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
        }
    }
}
