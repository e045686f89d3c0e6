//! Cache entries and their freshness window.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

/// Where an entry sits in its lifetime at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// `now < fresh_until`
    Fresh,
    /// `fresh_until <= now < stale_until`
    Stale,
    /// `now >= stale_until`; treated as absent
    Expired,
}

/// Outcome reported to the caller of a cached read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheStatus {
    Hit,
    StaleHit,
    Miss,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::StaleHit => "STALE_HIT",
            Self::Miss => "MISS",
        }
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cached value with its freshness window.
///
/// Invariant: `stored_at <= fresh_until <= stale_until`.
///
/// Timestamps use `tokio::time::Instant` so that tests can drive expiry with a
/// paused clock.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: Bytes,
    pub stored_at: Instant,
    pub fresh_until: Instant,
    pub stale_until: Instant,
}

impl CacheEntry {
    /// Entry stored now, fresh for `fresh_ttl` and servable stale until `stale_ttl`.
    ///
    /// A `stale_ttl` shorter than `fresh_ttl` is raised to `fresh_ttl`.
    pub fn new(value: Bytes, fresh_ttl: Duration, stale_ttl: Duration) -> Self {
        Self::stored_at(value, Instant::now(), fresh_ttl, stale_ttl)
    }

    pub fn stored_at(value: Bytes, stored_at: Instant, fresh_ttl: Duration, stale_ttl: Duration) -> Self {
        let fresh_until = stored_at + fresh_ttl;
        let stale_until = (stored_at + stale_ttl).max(fresh_until);
        Self {
            value,
            stored_at,
            fresh_until,
            stale_until,
        }
    }

    /// Rebuild a window from the distributed tier's remaining TTL.
    ///
    /// The distributed copy lives for `stale_ttl`, so `remaining` counts down to
    /// `stale_until`. The fresh boundary sits `stale_ttl - fresh_ttl` before
    /// that, clamped into `[now, stale_until]`.
    pub fn from_remaining_ttl(
        value: Bytes,
        remaining: Duration,
        fresh_ttl: Duration,
        stale_ttl: Duration,
    ) -> Self {
        let now = Instant::now();
        let stale_until = now + remaining;
        let stale_window = stale_ttl.saturating_sub(fresh_ttl);
        let fresh_until = stale_until
            .checked_sub(stale_window)
            .unwrap_or(now)
            .max(now);
        Self {
            value,
            stored_at: now,
            fresh_until,
            stale_until,
        }
    }

    pub fn freshness_at(&self, now: Instant) -> Freshness {
        if now < self.fresh_until {
            Freshness::Fresh
        } else if now < self.stale_until {
            Freshness::Stale
        } else {
            Freshness::Expired
        }
    }

    pub fn freshness(&self) -> Freshness {
        self.freshness_at(Instant::now())
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.stale_until
    }
}
