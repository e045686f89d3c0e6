use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use deadpool_redis::{Connection, Pool};

use super::DistributedTier;
use crate::config::RedisConfig;
use crate::error::TierError;
use crate::pattern::KeyPattern;

/// Keys requested per SCAN round trip.
const SCAN_BATCH: usize = 500;

/// Redis-backed distributed tier.
///
/// Values are stored with a store-side expiry equal to the entry's stale TTL,
/// so the store never holds anything the cache would refuse to serve.
#[derive(Clone)]
pub struct RedisTier {
    pool: Pool,
    url: String,
    timeout: Duration,
}

impl RedisTier {
    pub fn new(pool: Pool, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            pool,
            url: url.into(),
            timeout,
        }
    }

    /// Build a pool from config and check that Redis answers.
    ///
    /// Returns `None` when Redis is disabled or unreachable; the caller then
    /// runs L1-only.
    pub async fn connect(config: &RedisConfig) -> Option<Self> {
        if !config.enabled {
            tracing::info!("Redis disabled, using local cache only");
            return None;
        }

        tracing::info!(url = %config.url, "Connecting to Redis");
        let timeout = Duration::from_millis(config.timeout_ms);

        let mut redis_config = deadpool_redis::Config::from_url(&config.url);
        if let Some(ref mut pool_config) = redis_config.pool {
            pool_config.max_size = config.pool_size;
            pool_config.timeouts.wait = Some(timeout);
            pool_config.timeouts.create = Some(timeout);
            pool_config.timeouts.recycle = Some(timeout);
        }

        let pool = match redis_config.create_pool(Some(deadpool_redis::Runtime::Tokio1)) {
            Ok(pool) => pool,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to create Redis pool. Falling back to local cache.");
                return None;
            }
        };

        match pool.get().await {
            Ok(_) => {
                tracing::info!("Connected to Redis");
                Some(Self::new(pool, config.url.clone(), timeout))
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to connect to Redis. Falling back to local cache.");
                None
            }
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn conn(&self) -> Result<Connection, TierError> {
        self.pool
            .get()
            .await
            .map_err(|e| TierError::Connection(e.to_string()))
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, TierError>
    where
        F: Future<Output = Result<T, TierError>>,
    {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| TierError::Timeout(self.timeout))?
    }
}

/// Interpret a PTTL reply: -2 missing, -1 no expiry.
fn ttl_from_pttl(pttl: i64) -> Option<Duration> {
    u64::try_from(pttl).ok().map(Duration::from_millis)
}

#[async_trait]
impl DistributedTier for RedisTier {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, TierError> {
        self.bounded(async {
            let mut conn = self.conn().await?;
            let value: Option<Vec<u8>> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
            Ok(value.map(Bytes::from))
        })
        .await
    }

    async fn set_with_ttl(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), TierError> {
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        self.bounded(async {
            let mut conn = self.conn().await?;
            let () = redis::cmd("PSETEX")
                .arg(key)
                .arg(ttl_ms)
                .arg(value.as_ref())
                .query_async(&mut conn)
                .await?;
            Ok(())
        })
        .await
    }

    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>, TierError> {
        self.bounded(async {
            let mut conn = self.conn().await?;
            let pttl: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
            Ok(ttl_from_pttl(pttl))
        })
        .await
    }

    async fn delete_many(&self, keys: &[String]) -> Result<usize, TierError> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.bounded(async {
            let mut conn = self.conn().await?;
            let removed: usize = redis::cmd("DEL").arg(keys).query_async(&mut conn).await?;
            Ok(removed)
        })
        .await
    }

    async fn scan_by_pattern(&self, pattern: &KeyPattern) -> Result<Vec<String>, TierError> {
        let redis_match = pattern.redis_match();
        self.bounded(async {
            let mut conn = self.conn().await?;
            let mut cursor: u64 = 0;
            let mut keys = Vec::new();
            loop {
                let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&redis_match)
                    .arg("COUNT")
                    .arg(SCAN_BATCH)
                    .query_async(&mut conn)
                    .await?;
                keys.extend(batch.into_iter().filter(|k| pattern.matches(k)));
                if next == 0 {
                    break;
                }
                cursor = next;
            }
            keys.sort();
            keys.dedup();
            Ok(keys)
        })
        .await
    }

    async fn get_with_ttl(&self, key: &str) -> Result<Option<(Bytes, Option<Duration>)>, TierError> {
        self.bounded(async {
            let mut conn = self.conn().await?;
            let (value, pttl): (Option<Vec<u8>>, i64) = redis::pipe()
                .cmd("GET")
                .arg(key)
                .cmd("PTTL")
                .arg(key)
                .query_async(&mut conn)
                .await?;
            Ok(value.map(|v| (Bytes::from(v), ttl_from_pttl(pttl))))
        })
        .await
    }

    async fn is_available(&self) -> bool {
        let ping = async {
            let mut conn = self.conn().await?;
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok::<_, TierError>(())
        };
        matches!(tokio::time::timeout(self.timeout, ping).await, Ok(Ok(())))
    }

    fn mode(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pttl_interpretation() {
        assert_eq!(ttl_from_pttl(-2), None);
        assert_eq!(ttl_from_pttl(-1), None);
        assert_eq!(ttl_from_pttl(1500), Some(Duration::from_millis(1500)));
    }

    #[tokio::test]
    async fn test_connect_disabled_returns_none() {
        let config = RedisConfig::default();
        assert!(RedisTier::connect(&config).await.is_none());
    }
}
