//! Pattern-based invalidation across both tiers and the CDN.

use std::sync::Arc;
use std::time::Duration;

use deadpool_redis::Pool;
use serde::Serialize;

use crate::cdn::CdnPurger;
use crate::distributed::DynDistributedTier;
use crate::error::{CacheResult, TierError};
use crate::local::LocalTier;
use crate::metrics;
use crate::orchestrator::CacheOrchestrator;
use crate::pattern::KeyPattern;
use crate::pubsub;

/// What an invalidation touched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InvalidationReport {
    pub local_removed: usize,
    /// Keys deleted from the distributed tier; `None` if it was skipped or failed.
    pub distributed_removed: Option<usize>,
    pub broadcast: bool,
    pub cdn_purged: bool,
}

/// Removes keys matching a glob pattern from every tier.
///
/// Order: distributed tier first, then the local tier, so a concurrent miss in
/// this process cannot repopulate L1 from an L2 copy about to be deleted.
/// Distributed tier, broadcast and CDN failures are logged and reported,
/// never returned as errors.
pub struct InvalidationService {
    local: Arc<LocalTier>,
    distributed: Option<DynDistributedTier>,
    cdn: Option<Arc<dyn CdnPurger>>,
    broadcast: Option<Pool>,
    timeout: Duration,
}

impl InvalidationService {
    pub fn new(local: Arc<LocalTier>, distributed: Option<DynDistributedTier>, timeout: Duration) -> Self {
        Self {
            local,
            distributed,
            cdn: None,
            broadcast: None,
            timeout,
        }
    }

    /// Invalidate the same tiers an orchestrator reads from.
    pub fn for_orchestrator(orchestrator: &CacheOrchestrator) -> Self {
        Self::new(
            Arc::clone(orchestrator.local()),
            orchestrator.distributed().cloned(),
            orchestrator.tier_timeout(),
        )
    }

    pub fn with_cdn(mut self, cdn: Arc<dyn CdnPurger>) -> Self {
        self.cdn = Some(cdn);
        self
    }

    /// Publish every pattern so other processes drop matching L1 entries.
    pub fn with_broadcast(mut self, pool: Pool) -> Self {
        self.broadcast = Some(pool);
        self
    }

    pub fn has_cdn(&self) -> bool {
        self.cdn.is_some()
    }

    /// Remove keys matching `pattern` from both tiers.
    pub async fn invalidate(&self, pattern: &str) -> CacheResult<InvalidationReport> {
        self.invalidate_with_paths(pattern, &[]).await
    }

    /// Remove keys matching `pattern` from both tiers, then purge `paths` at
    /// the CDN. An empty `paths` skips the CDN.
    pub async fn invalidate_with_paths(&self, pattern: &str, paths: &[String]) -> CacheResult<InvalidationReport> {
        let pattern = KeyPattern::new(pattern)?;
        let mut report = InvalidationReport::default();

        // Fetches already in flight must not store matching keys from here on.
        self.local.record_invalidation(&pattern);

        if let Some(tier) = &self.distributed {
            match self.invalidate_distributed(tier, &pattern).await {
                Ok(removed) => {
                    metrics::record_invalidated_keys("L2", removed);
                    report.distributed_removed = Some(removed);
                }
                Err(e) => {
                    metrics::record_tier_error("delete");
                    tracing::warn!(
                        pattern = %pattern.as_str(),
                        error = %e,
                        "distributed invalidation failed; entries will expire on their own"
                    );
                }
            }
        }

        report.local_removed = self.local.invalidate_matching(&pattern);
        metrics::record_invalidated_keys("L1", report.local_removed);

        if let Some(pool) = &self.broadcast {
            match tokio::time::timeout(self.timeout, pubsub::publish_invalidation(pool, pattern.as_str())).await {
                Ok(Ok(())) => report.broadcast = true,
                Ok(Err(e)) => tracing::warn!(pattern = %pattern.as_str(), error = %e, "failed to broadcast invalidation"),
                Err(_) => tracing::warn!(pattern = %pattern.as_str(), "broadcasting invalidation timed out"),
            }
        }

        if !paths.is_empty() {
            if let Some(cdn) = &self.cdn {
                match cdn.purge(paths).await {
                    Ok(()) => report.cdn_purged = true,
                    Err(e) => tracing::warn!(
                        count = paths.len(),
                        error = %e,
                        "CDN purge failed; cache tiers were still invalidated"
                    ),
                }
            } else {
                tracing::debug!(count = paths.len(), "no CDN purger configured, skipping paths");
            }
        }

        tracing::info!(
            pattern = %pattern.as_str(),
            local_removed = report.local_removed,
            distributed_removed = ?report.distributed_removed,
            cdn_purged = report.cdn_purged,
            "invalidated cache entries"
        );
        Ok(report)
    }

    async fn invalidate_distributed(&self, tier: &DynDistributedTier, pattern: &KeyPattern) -> Result<usize, TierError> {
        let keys = tokio::time::timeout(self.timeout, tier.scan_by_pattern(pattern))
            .await
            .map_err(|_| TierError::Timeout(self.timeout))??;
        if keys.is_empty() {
            return Ok(0);
        }
        tokio::time::timeout(self.timeout, tier.delete_many(&keys))
            .await
            .map_err(|_| TierError::Timeout(self.timeout))?
    }
}
