//! In-process (L1) tier.
//!
//! A `DashMap` keyed by the full cache key. Lookups and inserts touch a single
//! shard, so they never wait on a sweep or invalidation of another shard.
//! Expired entries are dropped lazily on read and in bulk by a periodic sweep.
//!
//! The tier also keeps a short log of invalidations. A fetch records the
//! current generation before it starts and checks the log before storing, so
//! a value read before an invalidation never lands after it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::entry::CacheEntry;
use crate::metrics;
use crate::pattern::KeyPattern;

/// Default maximum number of entries.
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Invalidations remembered for in-flight fetches. A fetch older than the
/// oldest remembered one is treated as invalidated.
const INVALIDATION_LOG_LEN: usize = 256;

/// Process-local cache tier.
///
/// Memory is bounded primarily by `stale_until` discipline; `max_entries` is a
/// soft backstop. When an insert finds the tier full, expired entries are
/// swept first and, if that frees nothing, the `max_entries / 16` entries
/// closest to expiry are evicted in one pass. The check and the insert are not
/// atomic, so concurrent inserts may briefly overshoot the cap.
pub struct LocalTier {
    entries: DashMap<String, CacheEntry>,
    max_entries: usize,
    evictions: AtomicU64,
    invalidations: Mutex<InvalidationLog>,
}

#[derive(Default)]
struct InvalidationLog {
    generation: u64,
    recent: VecDeque<(u64, KeyPattern)>,
}

impl LocalTier {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
            evictions: AtomicU64::new(0),
            invalidations: Mutex::new(InvalidationLog::default()),
        }
    }

    /// Look up a live entry. Expired entries are removed and reported as absent.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired_at(now) {
                return Some(entry.clone());
            }
            drop(entry);
            self.entries.remove_if(key, |_, e| e.is_expired_at(now));
        }
        None
    }

    /// Insert or overwrite an entry.
    pub fn put(&self, key: impl Into<String>, entry: CacheEntry) {
        let key = key.into();
        if self.entries.len() >= self.max_entries && !self.entries.contains_key(&key) {
            self.make_room();
        }
        self.entries.insert(key, entry);
    }

    /// Remove one key. Returns true if it was present.
    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Drop every entry whose `stale_until <= now`. Returns the number removed.
    ///
    /// `retain` locks one shard at a time, so readers on other shards proceed
    /// while the sweep runs.
    pub fn sweep(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired_at(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            tracing::debug!(removed, remaining = self.entries.len(), "swept expired L1 entries");
        }
        metrics::set_cache_entries("L1", self.entries.len());
        removed
    }

    /// Remove every entry whose key matches `pattern`. Returns the number removed.
    ///
    /// The pattern is recorded first, so fetches already in flight will not
    /// store a matching key afterwards.
    pub fn invalidate_matching(&self, pattern: &KeyPattern) -> usize {
        self.record_invalidation(pattern);
        let before = self.entries.len();
        self.entries.retain(|key, _| !pattern.matches(key));
        let removed = before.saturating_sub(self.entries.len());
        tracing::debug!(pattern = %pattern.as_str(), removed, "invalidated L1 entries");
        removed
    }

    /// Current invalidation generation. Capture it before fetching a value.
    pub fn generation(&self) -> u64 {
        self.invalidations.lock().generation
    }

    /// Note that keys matching `pattern` are being invalidated.
    ///
    /// Call before touching any tier so a concurrent fetch cannot slip its
    /// value in between the distributed delete and the local one.
    pub fn record_invalidation(&self, pattern: &KeyPattern) -> u64 {
        let mut log = self.invalidations.lock();
        log.generation += 1;
        let generation = log.generation;
        if log.recent.len() == INVALIDATION_LOG_LEN {
            log.recent.pop_front();
        }
        log.recent.push_back((generation, pattern.clone()));
        generation
    }

    /// Whether an invalidation matching `key` happened after `generation`.
    pub fn invalidated_since(&self, generation: u64, key: &str) -> bool {
        let log = self.invalidations.lock();
        if log.generation == generation {
            return false;
        }
        match log.recent.front() {
            // the log no longer reaches back that far
            Some((oldest, _)) if *oldest > generation + 1 => true,
            _ => log
                .recent
                .iter()
                .any(|(g, pattern)| *g > generation && pattern.matches(key)),
        }
    }

    /// Keys currently held (including entries not yet swept).
    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Entries dropped to stay under `max_entries`.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Start the periodic sweep on its own task.
    ///
    /// The task holds only a weak reference, so it ends once the tier is
    /// dropped. Dropping the returned handle stops it as well.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> SweeperHandle {
        let tier = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(tier) = tier.upgrade() else {
                    break;
                };
                tier.sweep(Instant::now());
            }
            tracing::debug!("L1 sweeper stopped");
        });
        SweeperHandle(handle)
    }

    fn make_room(&self) {
        let removed = self.sweep(Instant::now());
        if removed > 0 {
            return;
        }

        // Evict a batch so the next inserts find room without another scan.
        let batch = (self.max_entries / 16).max(1);
        let mut candidates: Vec<(Instant, String)> = self
            .entries
            .iter()
            .map(|entry| (entry.stale_until, entry.key().clone()))
            .collect();
        if candidates.len() > batch {
            candidates.select_nth_unstable_by_key(batch - 1, |(stale_until, _)| *stale_until);
            candidates.truncate(batch);
        }

        let evicted = candidates
            .into_iter()
            .filter(|(_, key)| self.entries.remove(key).is_some())
            .count();
        if evicted > 0 {
            self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
            metrics::record_evictions(evicted);
            tracing::debug!(evicted, max_entries = self.max_entries, "L1 at capacity, evicted entries");
        }
    }
}

impl Default for LocalTier {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

/// Aborts the sweeper task when dropped.
#[derive(Debug)]
pub struct SweeperHandle(JoinHandle<()>);

impl SweeperHandle {
    pub fn is_finished(&self) -> bool {
        self.0.is_finished()
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn entry(fresh: u64, stale: u64) -> CacheEntry {
        CacheEntry::new(
            Bytes::from_static(b"value"),
            Duration::from_secs(fresh),
            Duration::from_secs(stale),
        )
    }

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_put_overwrite() {
        let tier = LocalTier::default();
        tier.put("k", entry(5, 10));
        tier.put(
            "k",
            CacheEntry::new(Bytes::from_static(b"new"), Duration::from_secs(5), Duration::from_secs(10)),
        );
        assert_eq!(tier.get("k").map(|e| e.value), Some(Bytes::from_static(b"new")));
        assert_eq!(tier.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_entries_are_still_returned() {
        let tier = LocalTier::default();
        tier.put("k", entry(5, 10));
        tokio::time::advance(Duration::from_secs(7)).await;
        assert!(tier.get("k").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_are_removed_on_read() {
        let tier = LocalTier::default();
        tier.put("k", entry(5, 10));
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(tier.get("k").is_none());
        assert!(tier.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_only_expired() {
        let tier = LocalTier::default();
        tier.put("short", entry(1, 2));
        tier.put("long", entry(1, 60));
        tokio::time::advance(Duration::from_secs(3)).await;

        assert_eq!(tier.sweep(Instant::now()), 1);
        assert_eq!(tier.keys(), vec!["long".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_matching() {
        let tier = LocalTier::default();
        tier.put("v1:api:items:aa11", entry(5, 10));
        tier.put("v1:api:items:bb22", entry(5, 10));
        tier.put("v1:api:users:cc33", entry(5, 10));

        let pattern = KeyPattern::new("v1:api:items:*").unwrap();
        assert_eq!(tier.invalidate_matching(&pattern), 2);
        assert!(tier.get("v1:api:items:aa11").is_none());
        assert!(tier.get("v1:api:users:cc33").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_prefers_expired_entries() {
        let tier = LocalTier::new(2);
        tier.put("a", entry(1, 1));
        tier.put("b", entry(60, 60));
        tokio::time::advance(Duration::from_secs(2)).await;

        tier.put("c", entry(60, 60));
        assert_eq!(tier.len(), 2);
        assert!(tier.get("b").is_some());
        assert!(tier.get("c").is_some());
        assert_eq!(tier.evictions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_closest_to_expiry() {
        let tier = LocalTier::new(2);
        tier.put("soon", entry(5, 10));
        tier.put("later", entry(5, 100));
        tier.put("new", entry(5, 100));

        assert_eq!(tier.len(), 2);
        assert!(tier.get("soon").is_none());
        assert_eq!(tier.evictions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overwrite_at_capacity_does_not_evict() {
        let tier = LocalTier::new(1);
        tier.put("k", entry(5, 10));
        tier.put("k", entry(5, 10));
        assert_eq!(tier.evictions(), 0);
        assert_eq!(tier.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_tier_evicts_a_batch_at_once() {
        let tier = LocalTier::new(64);
        for i in 0..64 {
            tier.put(format!("k{i}"), entry(5, 100 + i));
        }
        tier.put("k64", entry(5, 1000));

        assert_eq!(tier.evictions(), 4);
        assert_eq!(tier.len(), 61);
        for i in 0..4 {
            assert!(tier.get(&format!("k{i}")).is_none(), "k{i} was closest to expiry");
        }

        // the freed slots absorb the next inserts without another pass
        for i in 65..68 {
            tier.put(format!("k{i}"), entry(5, 1000));
        }
        assert_eq!(tier.evictions(), 4);
        assert_eq!(tier.len(), 64);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidated_since_tracks_matching_patterns() {
        let tier = LocalTier::default();
        let before = tier.generation();
        assert!(!tier.invalidated_since(before, "v1:api:items:aa11"));

        tier.invalidate_matching(&KeyPattern::new("v1:api:items:*").unwrap());
        assert!(tier.invalidated_since(before, "v1:api:items:aa11"));
        assert!(!tier.invalidated_since(before, "v1:api:users:cc33"));

        // a fetch started after the invalidation is unaffected
        assert!(!tier.invalidated_since(tier.generation(), "v1:api:items:aa11"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_older_than_the_log_counts_as_invalidated() {
        let tier = LocalTier::default();
        let before = tier.generation();
        let unrelated = KeyPattern::new("v1:other:*").unwrap();
        for _ in 0..=INVALIDATION_LOG_LEN {
            tier.record_invalidation(&unrelated);
        }
        assert!(tier.invalidated_since(before, "v1:api:items:aa11"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_runs_on_interval() {
        let tier = Arc::new(LocalTier::default());
        tier.put("k", entry(1, 2));
        let handle = tier.spawn_sweeper(Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(30)).await;
        settle().await;
        assert_eq!(tier.len(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        settle().await;
        assert_eq!(tier.len(), 0);

        drop(handle);
    }
}
