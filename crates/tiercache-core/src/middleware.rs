//! Request-level cache front: derives a key from request parts, reads through
//! the orchestrator and maps namespaces to outbound cache headers.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;

use crate::config::{CacheConfig, CachePolicy, TtlConfig};
use crate::entry::CacheStatus;
use crate::error::CacheResult;
use crate::key::{CacheKey, KeyBuilder};
use crate::orchestrator::CacheOrchestrator;

/// The parts of a request that identify a cached response.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestKeyParts {
    pub namespace: String,
    pub identifier: String,
    /// Query or body parameters; digested into the key when present.
    pub params: Option<Value>,
}

impl RequestKeyParts {
    pub fn new(namespace: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            identifier: identifier.into(),
            params: None,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }
}

impl CachePolicy {
    /// `Cache-Control` value for responses under this policy.
    pub fn cache_control(&self, fresh_ttl: Duration) -> String {
        match self {
            CachePolicy::Static => "public, max-age=31536000, immutable".to_string(),
            CachePolicy::Api => format!("private, max-age={}, must-revalidate", fresh_ttl.as_secs()),
            CachePolicy::Dynamic => "no-store".to_string(),
        }
    }

    /// Whether responses under this policy are stored at all.
    pub fn is_cacheable(&self) -> bool {
        !matches!(self, CachePolicy::Dynamic)
    }
}

/// Wraps an orchestrator with key derivation and per-namespace TTLs.
#[derive(Clone)]
pub struct CacheMiddleware {
    orchestrator: CacheOrchestrator,
    keys: KeyBuilder,
    config: Arc<CacheConfig>,
}

impl CacheMiddleware {
    pub fn new(orchestrator: CacheOrchestrator, config: Arc<CacheConfig>) -> Self {
        Self {
            orchestrator,
            keys: KeyBuilder::new(config.schema_version.clone()),
            config,
        }
    }

    pub fn orchestrator(&self) -> &CacheOrchestrator {
        &self.orchestrator
    }

    pub fn keys(&self) -> &KeyBuilder {
        &self.keys
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Configured window for `namespace`, if it has its own entry.
    pub fn namespace(&self, namespace: &str) -> Option<&TtlConfig> {
        self.config.namespaces.get(namespace)
    }

    pub fn key_for(&self, parts: &RequestKeyParts) -> CacheKey {
        self.keys
            .build_key_opt(&parts.namespace, &parts.identifier, parts.params.as_ref())
    }

    /// Serve `parts` from cache or `origin_fetch` with explicit TTLs.
    pub async fn handle<F, Fut>(
        &self,
        parts: &RequestKeyParts,
        fresh_ttl: Duration,
        stale_ttl: Duration,
        origin_fetch: F,
    ) -> CacheResult<(Bytes, CacheStatus)>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Bytes>> + Send + 'static,
    {
        let key = self.key_for(parts);
        let lookup = self
            .orchestrator
            .get_or_fetch(key.as_str(), fresh_ttl, stale_ttl, origin_fetch)
            .await?;
        tracing::debug!(key = %key, status = %lookup.status, "cache lookup");
        Ok((lookup.value, lookup.status))
    }

    /// Like [`handle`](Self::handle), with TTLs taken from the namespace config.
    pub async fn handle_for<F, Fut>(
        &self,
        parts: &RequestKeyParts,
        origin_fetch: F,
    ) -> CacheResult<(Bytes, CacheStatus)>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Bytes>> + Send + 'static,
    {
        let ttl = self.config.ttl_for(&parts.namespace);
        let (fresh, stale) = (ttl.fresh_ttl(), ttl.stale_ttl());
        self.handle(parts, fresh, stale, origin_fetch).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalTier;
    use serde_json::json;

    fn middleware() -> CacheMiddleware {
        let orchestrator = CacheOrchestrator::new(Arc::new(LocalTier::default()), None, Duration::from_secs(1));
        CacheMiddleware::new(orchestrator, Arc::new(CacheConfig::default()))
    }

    #[test]
    fn test_cache_control_table() {
        let fresh = Duration::from_secs(30);
        assert_eq!(
            CachePolicy::Static.cache_control(fresh),
            "public, max-age=31536000, immutable"
        );
        assert_eq!(
            CachePolicy::Api.cache_control(fresh),
            "private, max-age=30, must-revalidate"
        );
        assert_eq!(CachePolicy::Dynamic.cache_control(fresh), "no-store");
        assert!(!CachePolicy::Dynamic.is_cacheable());
    }

    #[test]
    fn test_key_for_digests_params() {
        let mw = middleware();
        let plain = mw.key_for(&RequestKeyParts::new("api", "items"));
        assert_eq!(plain.as_str(), "v1:api:items");

        let a = mw.key_for(&RequestKeyParts::new("api", "items").with_params(json!({"page": 1, "sort": "asc"})));
        let b = mw.key_for(&RequestKeyParts::new("api", "items").with_params(json!({"sort": "asc", "page": 1})));
        let c = mw.key_for(&RequestKeyParts::new("api", "items").with_params(json!({"page": 2, "sort": "asc"})));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_handle_reports_status() {
        let mw = middleware();
        let parts = RequestKeyParts::new("api", "items");

        let (body, status) = mw
            .handle_for(&parts, || async { Ok(Bytes::from_static(b"[1,2,3]")) })
            .await
            .unwrap();
        assert_eq!(body, Bytes::from_static(b"[1,2,3]"));
        assert_eq!(status, CacheStatus::Miss);

        let (_, status) = mw
            .handle_for(&parts, || async { anyhow::bail!("origin should not be called") })
            .await
            .unwrap();
        assert_eq!(status, CacheStatus::Hit);
    }
}
