//! Read-through orchestration across the local and distributed tiers.
//!
//! Lookup order is L1, then L2, then the origin. Fresh entries are returned
//! as-is. Stale entries are returned immediately while one background
//! revalidation refreshes them. Misses go through the single-flight
//! coordinator so concurrent callers share one origin fetch.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::CacheConfig;
use crate::distributed::DynDistributedTier;
use crate::entry::{CacheEntry, CacheStatus, Freshness};
use crate::error::{CacheError, CacheResult};
use crate::local::LocalTier;
use crate::metrics;
use crate::singleflight::SingleFlight;

/// Result of a cached read.
#[derive(Debug, Clone)]
pub struct Lookup {
    pub value: Bytes,
    pub status: CacheStatus,
}

/// Point-in-time counters for the orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub mode: String,
    pub l1_entries: usize,
    pub l1_max_entries: usize,
    pub hits_fresh: u64,
    pub hits_stale: u64,
    pub misses: u64,
    pub origin_fetches: u64,
    pub origin_errors: u64,
    pub revalidations: u64,
    pub revalidation_failures: u64,
    pub distributed_errors: u64,
    pub evictions: u64,
    pub in_flight: usize,
}

#[derive(Default)]
struct Counters {
    hits_fresh: AtomicU64,
    hits_stale: AtomicU64,
    misses: AtomicU64,
    origin_fetches: AtomicU64,
    origin_errors: AtomicU64,
    revalidations: AtomicU64,
    revalidation_failures: AtomicU64,
    distributed_errors: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

struct Inner {
    local: Arc<LocalTier>,
    distributed: Option<DynDistributedTier>,
    flights: SingleFlight,
    tier_timeout: Duration,
    counters: Counters,
}

/// Two-tier cache front. Cheap to clone.
#[derive(Clone)]
pub struct CacheOrchestrator {
    inner: Arc<Inner>,
}

impl CacheOrchestrator {
    pub fn new(local: Arc<LocalTier>, distributed: Option<DynDistributedTier>, tier_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                local,
                distributed,
                flights: SingleFlight::new(),
                tier_timeout,
                counters: Counters::default(),
            }),
        }
    }

    pub fn from_config(config: &CacheConfig, distributed: Option<DynDistributedTier>) -> Self {
        Self::new(
            Arc::new(LocalTier::new(config.local_max_entries)),
            distributed,
            config.distributed_timeout(),
        )
    }

    pub fn local(&self) -> &Arc<LocalTier> {
        &self.inner.local
    }

    pub fn distributed(&self) -> Option<&DynDistributedTier> {
        self.inner.distributed.as_ref()
    }

    pub fn tier_timeout(&self) -> Duration {
        self.inner.tier_timeout
    }

    /// "local" or "local+<distributed mode>".
    pub fn mode(&self) -> String {
        match &self.inner.distributed {
            Some(tier) => format!("local+{}", tier.mode()),
            None => "local".to_string(),
        }
    }

    /// Return the cached value for `key`, fetching it from the origin on a miss.
    ///
    /// `fetch` runs at most once per key at a time across all callers of this
    /// orchestrator. Origin errors are returned to every waiting caller and are
    /// never cached. Distributed tier failures degrade to L1-only behaviour.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &str,
        fresh_ttl: Duration,
        stale_ttl: Duration,
        fetch: F,
    ) -> CacheResult<Lookup>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Bytes>> + Send + 'static,
    {
        check_window(fresh_ttl, stale_ttl)?;

        if let Some(entry) = self.inner.local.get(key) {
            match entry.freshness_at(Instant::now()) {
                Freshness::Fresh => {
                    bump(&self.inner.counters.hits_fresh);
                    metrics::record_cache_hit("L1", "fresh");
                    return Ok(Lookup {
                        value: entry.value,
                        status: CacheStatus::Hit,
                    });
                }
                Freshness::Stale => {
                    bump(&self.inner.counters.hits_stale);
                    metrics::record_cache_hit("L1", "stale");
                    self.revalidate(key, fresh_ttl, stale_ttl, fetch);
                    return Ok(Lookup {
                        value: entry.value,
                        status: CacheStatus::StaleHit,
                    });
                }
                Freshness::Expired => {}
            }
        }

        if let Some(entry) = self.read_distributed(key, fresh_ttl, stale_ttl).await {
            match entry.freshness_at(Instant::now()) {
                Freshness::Fresh => {
                    self.inner.local.put(key, entry.clone());
                    bump(&self.inner.counters.hits_fresh);
                    metrics::record_cache_hit("L2", "fresh");
                    return Ok(Lookup {
                        value: entry.value,
                        status: CacheStatus::Hit,
                    });
                }
                Freshness::Stale => {
                    self.inner.local.put(key, entry.clone());
                    bump(&self.inner.counters.hits_stale);
                    metrics::record_cache_hit("L2", "stale");
                    self.revalidate(key, fresh_ttl, stale_ttl, fetch);
                    return Ok(Lookup {
                        value: entry.value,
                        status: CacheStatus::StaleHit,
                    });
                }
                Freshness::Expired => {}
            }
        }

        bump(&self.inner.counters.misses);
        metrics::record_cache_miss();

        let inner = Arc::clone(&self.inner);
        let owned_key = key.to_string();
        let value = self
            .inner
            .flights
            .run(key, move || async move {
                let generation = inner.local.generation();
                match fetch().await {
                    Ok(value) => {
                        bump(&inner.counters.origin_fetches);
                        metrics::record_origin_fetch("ok");
                        inner
                            .store_fetched(&owned_key, value.clone(), fresh_ttl, stale_ttl, generation)
                            .await;
                        Ok(value)
                    }
                    Err(e) => {
                        bump(&inner.counters.origin_errors);
                        metrics::record_origin_fetch("error");
                        tracing::warn!(key = %owned_key, error = %e, "origin fetch failed");
                        Err(CacheError::origin(e))
                    }
                }
            })
            .await?;

        Ok(Lookup {
            value,
            status: CacheStatus::Miss,
        })
    }

    /// Store `value` in both tiers without consulting the origin.
    pub async fn set(&self, key: &str, value: Bytes, fresh_ttl: Duration, stale_ttl: Duration) -> CacheResult<()> {
        check_window(fresh_ttl, stale_ttl)?;
        self.inner.store(key, value, fresh_ttl, stale_ttl).await;
        Ok(())
    }

    /// Drop `key` from both tiers. Returns true if L1 held it.
    pub async fn remove(&self, key: &str) -> bool {
        let removed = self.inner.local.remove(key);
        self.inner.delete_distributed(key).await;
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.inner.counters;
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        CacheStats {
            mode: self.mode(),
            l1_entries: self.inner.local.len(),
            l1_max_entries: self.inner.local.max_entries(),
            hits_fresh: load(&c.hits_fresh),
            hits_stale: load(&c.hits_stale),
            misses: load(&c.misses),
            origin_fetches: load(&c.origin_fetches),
            origin_errors: load(&c.origin_errors),
            revalidations: load(&c.revalidations),
            revalidation_failures: load(&c.revalidation_failures),
            distributed_errors: load(&c.distributed_errors),
            evictions: self.inner.local.evictions(),
            in_flight: self.inner.flights.in_flight(),
        }
    }

    fn revalidate<F, Fut>(&self, key: &str, fresh_ttl: Duration, stale_ttl: Duration, fetch: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Bytes>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let owned_key = key.to_string();
        let started = self.inner.flights.spawn(key, move || async move {
            let generation = inner.local.generation();
            match fetch().await {
                Ok(value) => {
                    bump(&inner.counters.revalidations);
                    metrics::record_revalidation("ok");
                    inner
                        .store_fetched(&owned_key, value.clone(), fresh_ttl, stale_ttl, generation)
                        .await;
                    tracing::debug!(key = %owned_key, "revalidated stale entry");
                    Ok(value)
                }
                Err(e) => {
                    bump(&inner.counters.revalidation_failures);
                    metrics::record_revalidation("error");
                    tracing::warn!(key = %owned_key, error = %e, "background revalidation failed, keeping stale entry");
                    Err(CacheError::origin(e))
                }
            }
        });
        if !started {
            tracing::trace!(key = %key, "revalidation already in flight");
        }
    }

    async fn read_distributed(&self, key: &str, fresh_ttl: Duration, stale_ttl: Duration) -> Option<CacheEntry> {
        let tier = self.inner.distributed.as_ref()?;
        match tokio::time::timeout(self.inner.tier_timeout, tier.get_with_ttl(key)).await {
            Ok(Ok(Some((value, Some(remaining))))) => {
                Some(CacheEntry::from_remaining_ttl(value, remaining, fresh_ttl, stale_ttl))
            }
            Ok(Ok(Some((_, None)))) => {
                tracing::debug!(key = %key, "L2 entry has no expiry, treating as miss");
                None
            }
            Ok(Ok(None)) => None,
            Ok(Err(e)) => {
                self.inner.distributed_error("get", key, &e.to_string());
                None
            }
            Err(_) => {
                self.inner.distributed_error("get", key, "timed out");
                None
            }
        }
    }
}

impl Inner {
    /// Write L1 first, then L2 with the full stale TTL as store-side expiry.
    async fn store(&self, key: &str, value: Bytes, fresh_ttl: Duration, stale_ttl: Duration) {
        self.local
            .put(key, CacheEntry::new(value.clone(), fresh_ttl, stale_ttl));

        let Some(tier) = &self.distributed else {
            return;
        };
        match tokio::time::timeout(self.tier_timeout, tier.set_with_ttl(key, value, stale_ttl)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.distributed_error("set", key, &e.to_string()),
            Err(_) => self.distributed_error("set", key, "timed out"),
        }
    }

    /// Store a value fetched since `generation`, unless an invalidation
    /// matching `key` ran meanwhile. The caller still gets the value.
    async fn store_fetched(&self, key: &str, value: Bytes, fresh_ttl: Duration, stale_ttl: Duration, generation: u64) {
        if self.local.invalidated_since(generation, key) {
            tracing::debug!(key = %key, "key invalidated during fetch, not storing");
            return;
        }
        self.store(key, value, fresh_ttl, stale_ttl).await;

        // An invalidation may have scanned L2 while the write was pending.
        if self.local.invalidated_since(generation, key) {
            self.local.remove(key);
            self.delete_distributed(key).await;
            tracing::debug!(key = %key, "key invalidated while storing, dropped again");
        }
    }

    async fn delete_distributed(&self, key: &str) {
        let Some(tier) = &self.distributed else {
            return;
        };
        let keys = [key.to_string()];
        match tokio::time::timeout(self.tier_timeout, tier.delete_many(&keys)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => self.distributed_error("delete", key, &e.to_string()),
            Err(_) => self.distributed_error("delete", key, "timed out"),
        }
    }

    fn distributed_error(&self, op: &'static str, key: &str, error: &str) {
        bump(&self.counters.distributed_errors);
        metrics::record_tier_error(op);
        tracing::warn!(op, key = %key, error = %error, "distributed tier call failed, continuing with L1");
    }
}

fn check_window(fresh_ttl: Duration, stale_ttl: Duration) -> CacheResult<()> {
    if stale_ttl < fresh_ttl {
        return Err(CacheError::InvalidTtl {
            fresh: fresh_ttl,
            stale: stale_ttl,
        });
    }
    Ok(())
}
