//! Reverse-proxy client for the origin.

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, Method, Response, StatusCode, header};
use bytes::Bytes;
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;

use crate::config::OriginConfig;

/// Headers that apply to a single connection and must not be forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
    // Bodies are cached decoded
    "accept-encoding",
];

#[derive(Debug, Error)]
pub enum OriginError {
    #[error("origin request timed out after {0:?}")]
    Timeout(Duration),

    #[error("origin request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("invalid origin configuration: {0}")]
    InvalidConfig(String),
}

impl OriginError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Request(_) | Self::InvalidConfig(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

/// A fully buffered origin response.
#[derive(Debug, Clone)]
pub struct OriginResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl OriginResponse {
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }

    pub fn into_response(self) -> Response<Body> {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

pub struct OriginClient {
    http_client: Client,
    base_url: String,
    timeout: Duration,
}

impl OriginClient {
    pub fn new(config: &OriginConfig) -> Result<Self, OriginError> {
        let base_url = config.url.trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(OriginError::InvalidConfig("origin.url is empty".into()));
        }
        let http_client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| OriginError::InvalidConfig(e.to_string()))?;
        Ok(Self {
            http_client,
            base_url,
            timeout: config.timeout(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Forward a request to `{base_url}{path_and_query}` and buffer the answer.
    pub async fn forward(
        &self,
        method: Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<OriginResponse, OriginError> {
        let url = format!("{}{}", self.base_url, path_and_query);

        let mut request = self.http_client.request(method, &url);
        for (name, value) in headers {
            if !is_hop_by_hop(name) {
                request = request.header(name, value);
            }
        }
        if !body.is_empty() {
            request = request.body(body);
        }

        let response = request.send().await.map_err(|e| self.classify(e))?;
        let status = response.status();
        let mut forwarded = HeaderMap::new();
        for (name, value) in response.headers() {
            if !is_hop_by_hop(name) {
                forwarded.append(name.clone(), value.clone());
            }
        }
        let body = response.bytes().await.map_err(|e| self.classify(e))?;

        tracing::debug!(url = %url, status = status.as_u16(), bytes = body.len(), "origin responded");
        Ok(OriginResponse {
            status,
            headers: forwarded,
            body,
        })
    }

    fn classify(&self, e: reqwest::Error) -> OriginError {
        if e.is_timeout() {
            OriginError::Timeout(self.timeout)
        } else {
            OriginError::Request(e)
        }
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hop_by_hop_headers_are_filtered() {
        assert!(is_hop_by_hop(&header::CONNECTION));
        assert!(is_hop_by_hop(&header::HOST));
        assert!(!is_hop_by_hop(&header::CONTENT_TYPE));
        assert!(!is_hop_by_hop(&header::ACCEPT));
    }

    #[test]
    fn test_base_url_trailing_slash_is_trimmed() {
        let client = OriginClient::new(&OriginConfig {
            url: "http://localhost:3000/".into(),
            timeout_ms: 1_000,
        })
        .unwrap();
        assert_eq!(client.base_url(), "http://localhost:3000");
    }
}
