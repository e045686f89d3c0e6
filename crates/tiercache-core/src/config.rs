//! Cache configuration

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Outbound cache-control policy for a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CachePolicy {
    /// Long-lived immutable assets
    Static,
    /// Short-lived private responses that must revalidate
    #[default]
    Api,
    /// Never stored
    Dynamic,
}

/// Freshness window for a namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtlConfig {
    /// Seconds an entry is served without revalidation
    #[serde(default = "default_fresh_ttl_secs")]
    pub fresh_ttl_secs: u64,

    /// Seconds an entry may be served at all (must be >= fresh_ttl_secs)
    #[serde(default = "default_stale_ttl_secs")]
    pub stale_ttl_secs: u64,

    #[serde(default)]
    pub policy: CachePolicy,
}

impl TtlConfig {
    pub fn fresh_ttl(&self) -> Duration {
        Duration::from_secs(self.fresh_ttl_secs)
    }

    pub fn stale_ttl(&self) -> Duration {
        Duration::from_secs(self.stale_ttl_secs)
    }
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            fresh_ttl_secs: default_fresh_ttl_secs(),
            stale_ttl_secs: default_stale_ttl_secs(),
            policy: CachePolicy::default(),
        }
    }
}

fn default_fresh_ttl_secs() -> u64 {
    60
}

fn default_stale_ttl_secs() -> u64 {
    300
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Prefix of every key; bump to orphan all existing entries
    #[serde(default = "default_schema_version")]
    pub schema_version: String,

    /// Window used for namespaces without their own entry
    #[serde(default)]
    pub default_ttl: TtlConfig,

    /// Per-namespace windows, keyed by namespace
    #[serde(default)]
    pub namespaces: HashMap<String, TtlConfig>,

    /// Interval of the L1 expiry sweep
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Local (L1) cache max entries
    #[serde(default = "default_local_max_entries")]
    pub local_max_entries: usize,

    /// Upper bound for any single distributed tier call
    #[serde(default = "default_distributed_timeout_ms")]
    pub distributed_timeout_ms: u64,

    /// Publish invalidations so other processes drop their L1 copies
    #[serde(default)]
    pub broadcast_invalidations: bool,
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.schema_version.trim().is_empty() {
            return Err("cache.schema_version must not be empty".into());
        }
        if self.schema_version.contains(':') {
            return Err("cache.schema_version must not contain ':'".into());
        }
        if self.sweep_interval_secs == 0 {
            return Err("cache.sweep_interval_secs must be > 0".into());
        }
        if self.distributed_timeout_ms == 0 {
            return Err("cache.distributed_timeout_ms must be > 0".into());
        }
        if self.local_max_entries == 0 {
            return Err("cache.local_max_entries must be > 0".into());
        }
        let windows = std::iter::once(("default_ttl", &self.default_ttl))
            .chain(self.namespaces.iter().map(|(name, ttl)| (name.as_str(), ttl)));
        for (name, ttl) in windows {
            if ttl.stale_ttl_secs < ttl.fresh_ttl_secs {
                return Err(format!(
                    "cache.{name}: stale_ttl_secs must be >= fresh_ttl_secs"
                ));
            }
        }
        Ok(())
    }

    /// Window for `namespace`, falling back to the default.
    pub fn ttl_for(&self, namespace: &str) -> &TtlConfig {
        self.namespaces.get(namespace).unwrap_or(&self.default_ttl)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn distributed_timeout(&self) -> Duration {
        Duration::from_millis(self.distributed_timeout_ms)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            default_ttl: TtlConfig::default(),
            namespaces: HashMap::new(),
            sweep_interval_secs: default_sweep_interval_secs(),
            local_max_entries: default_local_max_entries(),
            distributed_timeout_ms: default_distributed_timeout_ms(),
            broadcast_invalidations: false,
        }
    }
}

fn default_schema_version() -> String {
    "v1".into()
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_local_max_entries() -> usize {
    crate::local::DEFAULT_MAX_ENTRIES
}

fn default_distributed_timeout_ms() -> u64 {
    2_000
}

/// Redis configuration for the distributed tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Enable Redis (gracefully degrades to L1-only without it)
    #[serde(default = "default_redis_enabled")]
    pub enabled: bool,

    /// Redis connection URL (e.g., "redis://localhost:6379")
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,

    /// Pool wait/create/recycle timeout in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_redis_enabled() -> bool {
    false
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_redis_pool_size() -> usize {
    10
}

fn default_redis_timeout_ms() -> u64 {
    2_000
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: default_redis_enabled(),
            url: default_redis_url(),
            pool_size: default_redis_pool_size(),
            timeout_ms: default_redis_timeout_ms(),
        }
    }
}

/// CDN purge endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdnConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Endpoint receiving `POST {"paths": [...]}`
    #[serde(default)]
    pub purge_url: Option<String>,

    /// Sent as a bearer token when set.
    /// Prefer TIERCACHE__CDN__API_TOKEN over putting it in the file.
    #[serde(default)]
    pub api_token: Option<String>,

    #[serde(default = "default_cdn_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_cdn_timeout_ms() -> u64 {
    5_000
}

impl CdnConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.enabled && self.purge_url.as_deref().unwrap_or("").is_empty() {
            return Err("cdn.enabled=true requires cdn.purge_url".into());
        }
        if self.timeout_ms == 0 {
            return Err("cdn.timeout_ms must be > 0".into());
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for CdnConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            purge_url: None,
            api_token: None,
            timeout_ms: default_cdn_timeout_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(CacheConfig::default().validate().is_ok());
        assert!(CdnConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_inverted_window() {
        let mut cfg = CacheConfig::default();
        cfg.namespaces.insert(
            "api".into(),
            TtlConfig {
                fresh_ttl_secs: 30,
                stale_ttl_secs: 10,
                policy: CachePolicy::Api,
            },
        );
        let err = cfg.validate().unwrap_err();
        assert!(err.contains("cache.api"));
    }

    #[test]
    fn test_rejects_colon_in_schema_version() {
        let cfg = CacheConfig {
            schema_version: "v1:x".into(),
            ..CacheConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_ttl_for_falls_back_to_default() {
        let mut cfg = CacheConfig::default();
        cfg.namespaces.insert(
            "static".into(),
            TtlConfig {
                fresh_ttl_secs: 86_400,
                stale_ttl_secs: 86_400,
                policy: CachePolicy::Static,
            },
        );
        assert_eq!(cfg.ttl_for("static").policy, CachePolicy::Static);
        assert_eq!(cfg.ttl_for("other").fresh_ttl_secs, 60);
    }

    #[test]
    fn test_policy_deserializes_lowercase() {
        let ttl: TtlConfig =
            serde_json::from_str(r#"{"fresh_ttl_secs": 5, "stale_ttl_secs": 10, "policy": "dynamic"}"#)
                .unwrap();
        assert_eq!(ttl.policy, CachePolicy::Dynamic);
    }

    #[test]
    fn test_cdn_requires_url_when_enabled() {
        let cfg = CdnConfig {
            enabled: true,
            ..CdnConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
