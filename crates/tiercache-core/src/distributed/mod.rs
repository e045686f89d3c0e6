//! Distributed (L2) tier clients.
//!
//! The shared store is reached only through [`DistributedTier`]. Every call may
//! fail; callers treat failures as misses on read and log-and-continue on
//! write. [`RedisTier`] is the production client, [`MemoryTier`] an in-process
//! stand-in for tests and single-node deployments.

mod memory;
mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::TierError;
use crate::pattern::KeyPattern;

pub use memory::MemoryTier;
pub use redis::RedisTier;

/// Shared distributed tier handle.
pub type DynDistributedTier = Arc<dyn DistributedTier>;

#[async_trait]
pub trait DistributedTier: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, TierError>;

    async fn set_with_ttl(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), TierError>;

    /// Time left before the store expires `key`. `None` when the key is
    /// missing or carries no expiry.
    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>, TierError>;

    /// Delete `keys`, returning how many existed.
    async fn delete_many(&self, keys: &[String]) -> Result<usize, TierError>;

    /// Best-effort listing of keys matching `pattern`. Potentially expensive;
    /// never called on the read path.
    async fn scan_by_pattern(&self, pattern: &KeyPattern) -> Result<Vec<String>, TierError>;

    /// Value and remaining TTL in one call.
    ///
    /// The default issues two calls; clients that can pipeline should override.
    async fn get_with_ttl(&self, key: &str) -> Result<Option<(Bytes, Option<Duration>)>, TierError> {
        match self.get(key).await? {
            Some(value) => {
                let ttl = self.remaining_ttl(key).await?;
                Ok(Some((value, ttl)))
            }
            None => Ok(None),
        }
    }

    /// Cheap health probe.
    async fn is_available(&self) -> bool;

    /// Short label for stats and logs.
    fn mode(&self) -> &'static str;
}
