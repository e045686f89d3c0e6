//! Cache metrics.
//!
//! Recorded through the `metrics` facade; nothing is exported unless the host
//! process installs a recorder (the server installs a Prometheus one).

use metrics::{counter, gauge};

/// Metric names as constants for consistency.
pub mod names {
    pub const CACHE_HITS_TOTAL: &str = "cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "cache_misses_total";
    pub const CACHE_ENTRIES: &str = "cache_entries";
    pub const CACHE_EVICTIONS_TOTAL: &str = "cache_evictions_total";
    pub const CACHE_ORIGIN_FETCHES_TOTAL: &str = "cache_origin_fetches_total";
    pub const CACHE_REVALIDATIONS_TOTAL: &str = "cache_revalidations_total";
    pub const CACHE_TIER_ERRORS_TOTAL: &str = "cache_tier_errors_total";
    pub const CACHE_INVALIDATED_KEYS_TOTAL: &str = "cache_invalidated_keys_total";
    pub const CACHE_CDN_PURGES_TOTAL: &str = "cache_cdn_purges_total";
}

/// Record a cache hit on `tier` ("L1" or "L2") in `state` ("fresh" or "stale").
pub fn record_cache_hit(tier: &'static str, state: &'static str) {
    counter!(names::CACHE_HITS_TOTAL, "tier" => tier, "state" => state).increment(1);
}

pub fn record_cache_miss() {
    counter!(names::CACHE_MISSES_TOTAL).increment(1);
}

pub fn set_cache_entries(tier: &'static str, count: usize) {
    gauge!(names::CACHE_ENTRIES, "tier" => tier).set(count as f64);
}

pub fn record_evictions(count: usize) {
    counter!(names::CACHE_EVICTIONS_TOTAL).increment(count as u64);
}

/// Record an origin fetch outcome ("ok" or "error").
pub fn record_origin_fetch(result: &'static str) {
    counter!(names::CACHE_ORIGIN_FETCHES_TOTAL, "result" => result).increment(1);
}

pub fn record_revalidation(result: &'static str) {
    counter!(names::CACHE_REVALIDATIONS_TOTAL, "result" => result).increment(1);
}

/// Record a failed distributed tier call (`op` is "get", "set", "scan" or "delete").
pub fn record_tier_error(op: &'static str) {
    counter!(names::CACHE_TIER_ERRORS_TOTAL, "op" => op).increment(1);
}

pub fn record_invalidated_keys(tier: &'static str, count: usize) {
    counter!(names::CACHE_INVALIDATED_KEYS_TOTAL, "tier" => tier).increment(count as u64);
}

pub fn record_cdn_purge(result: &'static str) {
    counter!(names::CACHE_CDN_PURGES_TOTAL, "result" => result).increment(1);
}
