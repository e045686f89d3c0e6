use std::time::Instant;

use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::{
    Json,
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode, Uri, header},
    middleware::Next,
    response::Response,
};
use bytes::{BufMut, Bytes, BytesMut};
use serde_json::{Map, Value, json};
use thiserror::Error;
use tiercache_core::{CacheError, CacheStatus, RequestKeyParts};
use uuid::Uuid;

use crate::metrics;
use crate::server::AppState;

const X_CACHE: HeaderName = HeaderName::from_static("x-cache");

// Middleware that ensures each request has an X-Request-Id and mirrors it on the response
pub async fn request_id(mut req: Request<Body>, next: Next) -> Response {
    let header_name = HeaderName::from_static("x-request-id");

    // If the incoming request already has a request-id, preserve it; otherwise generate one
    let req_id_value = req
        .headers()
        .get(&header_name)
        .cloned()
        .or_else(|| HeaderValue::from_str(&Uuid::new_v4().to_string()).ok());

    let Some(req_id_value) = req_id_value else {
        return next.run(req).await;
    };

    // Add to request extensions for downstream usage (e.g., logging)
    req.extensions_mut().insert(req_id_value.clone());

    let mut res = next.run(req).await;

    // Add/propagate the request id header to response
    res.headers_mut().insert(header_name, req_id_value);

    res
}

/// Records request count, latency and in-flight requests.
pub async fn http_metrics(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();

    metrics::increment_active_connections();
    let res = next.run(req).await;
    metrics::decrement_active_connections();

    metrics::record_http_request(method.as_str(), &path, res.status().as_u16(), started.elapsed());
    res
}

// =============================================================================
// Response cache
// =============================================================================

/// A non-200 origin answer. Handed back to every waiting request unchanged
/// and never stored.
#[derive(Debug, Error)]
#[error("origin answered {status}")]
pub struct Passthrough {
    pub status: StatusCode,
    pub content_type: Option<HeaderValue>,
    pub body: Bytes,
}

/// Body and content type of a cached `200` response.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl CachedResponse {
    /// `{content-type}\n{body}`; header values cannot contain a newline.
    pub fn encode(&self) -> Bytes {
        let content_type = self.content_type.as_deref().unwrap_or("");
        let mut buf = BytesMut::with_capacity(content_type.len() + 1 + self.body.len());
        buf.put_slice(content_type.as_bytes());
        buf.put_u8(b'\n');
        buf.put_slice(&self.body);
        buf.freeze()
    }

    pub fn decode(raw: &Bytes) -> Option<Self> {
        let split = raw.iter().position(|b| *b == b'\n')?;
        let content_type = std::str::from_utf8(&raw[..split]).ok()?;
        Some(Self {
            content_type: (!content_type.is_empty()).then(|| content_type.to_string()),
            body: raw.slice(split + 1..),
        })
    }
}

/// Split a request path into namespace and identifier.
///
/// `/api/items/42` becomes `("api", "items/42")`; a bare `/api` gets the
/// identifier `index`.
pub fn split_path(path: &str) -> Option<(&str, &str)> {
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.split_once('/') {
        Some((namespace, rest)) if !rest.is_empty() => Some((namespace, rest)),
        Some((namespace, _)) => Some((namespace, "index")),
        None => Some((trimmed, "index")),
    }
}

/// Query string as a JSON object; repeated names collect into arrays.
pub fn query_params(query: Option<&str>) -> Option<Value> {
    let query = query.filter(|q| !q.is_empty())?;
    let uri: Uri = format!("/?{query}").parse().ok()?;
    let Query(pairs) = Query::<Vec<(String, String)>>::try_from_uri(&uri).ok()?;
    let mut params = Map::new();
    for (name, value) in pairs {
        let value = Value::String(value);
        match params.get_mut(&name) {
            Some(Value::Array(values)) => values.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
            None => {
                params.insert(name, value);
            }
        }
    }
    Some(Value::Object(params))
}

/// Serves configured namespaces through the two-tier cache.
///
/// Only `GET` requests whose first path segment names a configured namespace
/// are cached. `Dynamic` namespaces are forwarded untouched with `no-store`.
/// Only `200` answers are stored; anything else is passed through.
pub async fn response_cache_layer(State(state): State<AppState>, req: Request<Body>, next: Next) -> Response {
    if req.method() != Method::GET {
        return next.run(req).await;
    }

    let path = req.uri().path().to_string();
    let Some((namespace, identifier)) = split_path(&path) else {
        return next.run(req).await;
    };
    let Some(ttl) = state.cache.namespace(namespace).cloned() else {
        return next.run(req).await;
    };

    if !ttl.policy.is_cacheable() {
        metrics::record_cache_response(namespace, "BYPASS");
        let mut res = next.run(req).await;
        let headers = res.headers_mut();
        headers.insert(X_CACHE, HeaderValue::from_static("BYPASS"));
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        return res;
    }

    let mut parts = RequestKeyParts::new(namespace, identifier);
    parts.params = query_params(req.uri().query());
    let body_limit = state.config.server.body_limit_bytes;

    let fetch = move || async move {
        let res = next.run(req).await;
        let (head, body) = res.into_parts();
        let body = axum::body::to_bytes(body, body_limit).await?;
        let content_type = head.headers.get(header::CONTENT_TYPE).cloned();
        if head.status != StatusCode::OK {
            return Err(anyhow::Error::new(Passthrough {
                status: head.status,
                content_type,
                body,
            }));
        }
        let cached = CachedResponse {
            content_type: content_type.and_then(|v| v.to_str().ok().map(str::to_string)),
            body,
        };
        Ok(cached.encode())
    };

    match state
        .cache
        .handle(&parts, ttl.fresh_ttl(), ttl.stale_ttl(), fetch)
        .await
    {
        Ok((raw, status)) => {
            metrics::record_cache_response(namespace, status.as_str());
            cached_response(&raw, status, ttl.policy.cache_control(ttl.fresh_ttl()))
        }
        Err(err) => cache_error_response(namespace, &err),
    }
}

fn cached_response(raw: &Bytes, status: CacheStatus, cache_control: String) -> Response {
    let Some(cached) = CachedResponse::decode(raw) else {
        tracing::error!("cached response is malformed");
        return error_response(StatusCode::BAD_GATEWAY, "cached response is malformed");
    };

    let mut headers = HeaderMap::new();
    if let Some(value) = cached
        .content_type
        .as_deref()
        .and_then(|ct| HeaderValue::from_str(ct).ok())
    {
        headers.insert(header::CONTENT_TYPE, value);
    }
    headers.insert(X_CACHE, HeaderValue::from_static(status.as_str()));
    if let Ok(value) = HeaderValue::from_str(&cache_control) {
        headers.insert(header::CACHE_CONTROL, value);
    }
    (StatusCode::OK, headers, cached.body).into_response()
}

fn cache_error_response(namespace: &str, err: &CacheError) -> Response {
    if let Some(passthrough) = err
        .origin_error()
        .and_then(|e| e.downcast_ref::<Passthrough>())
    {
        metrics::record_cache_response(namespace, "MISS");
        let mut headers = HeaderMap::new();
        if let Some(ct) = &passthrough.content_type {
            headers.insert(header::CONTENT_TYPE, ct.clone());
        }
        headers.insert(X_CACHE, HeaderValue::from_static(CacheStatus::Miss.as_str()));
        return (passthrough.status, headers, passthrough.body.clone()).into_response();
    }

    tracing::warn!(namespace, error = %err, "cached request failed");
    error_response(StatusCode::BAD_GATEWAY, &err.to_string())
}

pub(crate) fn error_response(status: StatusCode, msg: &str) -> Response {
    let body: Value = json!({
        "error": status.canonical_reason().unwrap_or("error"),
        "message": msg,
    });
    (status, Json(body)).into_response()
}
