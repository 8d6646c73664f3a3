//! HTTP handlers for the health check and the protected demo endpoints.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, OriginalUri};
use axum::http::Method;
use axum::Json;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Value};

/// Body of the catch-all protected endpoint.
#[derive(Debug, Serialize)]
pub struct AcceptedResponse {
    pub message: &'static str,
    pub timestamp: String,
}

/// Liveness check. Never rate limited.
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Any admitted request under `/api/`.
pub async fn accepted() -> Json<AcceptedResponse> {
    Json(AcceptedResponse {
        message: "Request accepted! Rate limiter working correctly.",
        timestamp: now_rfc3339(),
    })
}

/// Echo details of an admitted request.
pub async fn echo(
    method: Method,
    OriginalUri(uri): OriginalUri,
    peer: Option<ConnectInfo<SocketAddr>>,
) -> Json<Value> {
    let ip = peer
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_default();

    Json(json!({
        "message": "Test endpoint response",
        "method": method.as_str(),
        "path": uri.path(),
        "ip": ip,
        "time": now_rfc3339(),
    }))
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}
