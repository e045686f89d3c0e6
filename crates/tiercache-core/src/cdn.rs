//! CDN purge-by-path client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use crate::config::CdnConfig;
use crate::error::PurgeError;
use crate::metrics;

/// Purges cached paths at the edge.
#[async_trait]
pub trait CdnPurger: Send + Sync {
    async fn purge(&self, paths: &[String]) -> Result<(), PurgeError>;
}

/// Generic HTTP purge endpoint.
///
/// Sends `POST {"paths": [...]}` with an optional bearer token. Any 2xx
/// answer counts as success.
pub struct HttpCdnPurger {
    http_client: Client,
    purge_url: String,
    api_token: Option<String>,
    timeout: Duration,
}

impl HttpCdnPurger {
    pub fn new(purge_url: impl Into<String>, api_token: Option<String>, timeout: Duration) -> Self {
        Self {
            http_client: Client::new(),
            purge_url: purge_url.into(),
            api_token,
            timeout,
        }
    }

    /// Build a purger from config. Returns `Ok(None)` when purging is disabled.
    pub fn from_config(config: &CdnConfig) -> Result<Option<Self>, PurgeError> {
        if !config.enabled {
            return Ok(None);
        }
        let url = config
            .purge_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or(PurgeError::InvalidConfig("Missing purge_url".into()))?;
        Ok(Some(Self::new(url, config.api_token.clone(), config.timeout())))
    }

    pub fn purge_url(&self) -> &str {
        &self.purge_url
    }

    async fn send(&self, paths: &[String]) -> Result<(), PurgeError> {
        let mut request = self
            .http_client
            .post(&self.purge_url)
            .timeout(self.timeout)
            .json(&json!({ "paths": paths }));

        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                PurgeError::Timeout(self.timeout)
            } else {
                PurgeError::Http(e)
            }
        })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(PurgeError::Status {
                status: status.as_u16(),
                body,
            })
        }
    }
}

#[async_trait]
impl CdnPurger for HttpCdnPurger {
    async fn purge(&self, paths: &[String]) -> Result<(), PurgeError> {
        if paths.is_empty() {
            return Ok(());
        }
        let result = self.send(paths).await;
        match &result {
            Ok(()) => {
                metrics::record_cdn_purge("ok");
                tracing::info!(count = paths.len(), "purged CDN paths");
            }
            Err(e) => {
                metrics::record_cdn_purge("error");
                tracing::debug!(count = paths.len(), error = %e, "CDN purge request failed");
            }
        }
        result
    }
}
