use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::time::Instant;

use super::DistributedTier;
use crate::error::TierError;
use crate::pattern::KeyPattern;

struct StoredValue {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// In-process distributed tier with store-side TTL.
///
/// Shares state between every orchestrator holding the same `Arc`, which makes
/// it a convenient stand-in for a shared store in tests. `set_unavailable`
/// makes every call fail, to exercise degraded paths.
#[derive(Default)]
pub struct MemoryTier {
    values: DashMap<String, StoredValue>,
    unavailable: AtomicBool,
    gets: AtomicU64,
    sets: AtomicU64,
}

impl MemoryTier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Store a value without expiry, as a foreign writer might.
    pub fn insert_persistent(&self, key: &str, value: Bytes) {
        self.values.insert(
            key.to_string(),
            StoredValue {
                value,
                expires_at: None,
            },
        );
    }

    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.values.get(key).is_some_and(|v| v.is_live(now))
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.values.iter().filter(|v| v.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of `get`/`get_with_ttl` calls served.
    pub fn get_calls(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
    }

    pub fn set_calls(&self) -> u64 {
        self.sets.load(Ordering::Relaxed)
    }

    fn check(&self) -> Result<(), TierError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(TierError::Unavailable)
        } else {
            Ok(())
        }
    }

    fn live(&self, key: &str) -> Option<(Bytes, Option<Duration>)> {
        let now = Instant::now();
        let stored = self.values.get(key)?;
        if !stored.is_live(now) {
            drop(stored);
            self.values.remove_if(key, |_, v| !v.is_live(now));
            return None;
        }
        let remaining = stored.expires_at.map(|at| at - now);
        Some((stored.value.clone(), remaining))
    }
}

#[async_trait]
impl DistributedTier for MemoryTier {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, TierError> {
        self.check()?;
        self.gets.fetch_add(1, Ordering::Relaxed);
        Ok(self.live(key).map(|(value, _)| value))
    }

    async fn set_with_ttl(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), TierError> {
        self.check()?;
        self.sets.fetch_add(1, Ordering::Relaxed);
        self.values.insert(
            key.to_string(),
            StoredValue {
                value,
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>, TierError> {
        self.check()?;
        Ok(self.live(key).and_then(|(_, ttl)| ttl))
    }

    async fn delete_many(&self, keys: &[String]) -> Result<usize, TierError> {
        self.check()?;
        Ok(keys
            .iter()
            .filter(|key| self.values.remove(key.as_str()).is_some())
            .count())
    }

    async fn scan_by_pattern(&self, pattern: &KeyPattern) -> Result<Vec<String>, TierError> {
        self.check()?;
        let now = Instant::now();
        Ok(self
            .values
            .iter()
            .filter(|entry| entry.is_live(now) && pattern.matches(entry.key()))
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn get_with_ttl(&self, key: &str) -> Result<Option<(Bytes, Option<Duration>)>, TierError> {
        self.check()?;
        self.gets.fetch_add(1, Ordering::Relaxed);
        Ok(self.live(key))
    }

    async fn is_available(&self) -> bool {
        !self.unavailable.load(Ordering::SeqCst)
    }

    fn mode(&self) -> &'static str {
        "memory"
    }
}
