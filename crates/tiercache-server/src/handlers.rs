use axum::{
    Json,
    body::{Body, to_bytes},
    extract::State,
    http::{Request, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tiercache_core::CacheError;

use crate::middleware::error_response;
use crate::server::AppState;

#[derive(Serialize)]
pub struct HealthResponse<'a> {
    status: &'a str,
}

#[derive(Serialize)]
pub struct ReadyResponse {
    status: &'static str,
    mode: String,
    distributed: &'static str,
}

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

/// Always ready: an unreachable distributed tier degrades the cache to
/// local-only, it does not stop traffic.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let orchestrator = state.cache.orchestrator();
    let distributed = match orchestrator.distributed() {
        Some(tier) => {
            if tier.is_available().await {
                "ok"
            } else {
                "unavailable"
            }
        }
        None => "disabled",
    };
    (
        StatusCode::OK,
        Json(ReadyResponse {
            status: "ready",
            mode: orchestrator.mode(),
            distributed,
        }),
    )
}

pub async fn metrics() -> Response {
    match crate::metrics::render_metrics() {
        Some(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => error_response(StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed"),
    }
}

pub async fn cache_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.cache.orchestrator().stats())
}

#[derive(Debug, Deserialize)]
pub struct InvalidateRequest {
    pub pattern: String,
    /// CDN paths to purge after the tiers are cleared
    #[serde(default)]
    pub paths: Vec<String>,
}

pub async fn invalidate(
    State(state): State<AppState>,
    Json(req): Json<InvalidateRequest>,
) -> Response {
    match state
        .invalidation
        .invalidate_with_paths(&req.pattern, &req.paths)
        .await
    {
        Ok(report) => {
            tracing::info!(
                pattern = %req.pattern,
                local_removed = report.local_removed,
                distributed_removed = ?report.distributed_removed,
                cdn_purged = report.cdn_purged,
                "cache invalidated"
            );
            (StatusCode::OK, Json(json!({ "pattern": req.pattern, "report": report }))).into_response()
        }
        Err(e @ CacheError::InvalidPattern { .. }) => error_response(StatusCode::BAD_REQUEST, &e.to_string()),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

/// Fallback: forward anything the router does not own to the origin.
pub async fn proxy(State(state): State<AppState>, req: Request<Body>) -> Response {
    let (parts, body) = req.into_parts();
    let body = match to_bytes(body, state.config.server.body_limit_bytes).await {
        Ok(body) => body,
        Err(e) => return error_response(StatusCode::PAYLOAD_TOO_LARGE, &e.to_string()),
    };
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    match state
        .origin
        .forward(parts.method, path_and_query, &parts.headers, body)
        .await
    {
        Ok(res) => res.into_response(),
        Err(e) => {
            tracing::warn!(path = %path_and_query, error = %e, "origin request failed");
            error_response(e.status(), &e.to_string())
        }
    }
}
