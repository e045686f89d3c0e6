//! Read-through behaviour of the orchestrator against the in-memory
//! distributed tier, driven by a paused clock.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::{BoxFuture, join_all};
use tiercache_core::{
    CacheError, CacheKey, CacheOrchestrator, CacheStatus, DynDistributedTier, InvalidationService, KeyBuilder, LocalTier,
    MemoryTier,
};

const FRESH: Duration = Duration::from_secs(5);
const STALE: Duration = Duration::from_secs(10);

type Origin = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<Bytes>> + Send>;

/// Origin returning `body` after `delay`, counting invocations.
fn origin(calls: &Arc<AtomicUsize>, body: &'static str, delay: Duration) -> Origin {
    let calls = calls.clone();
    Box::new(move || {
        Box::pin(async move {
            calls.fetch_add(1, Ordering::SeqCst);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok(Bytes::from_static(body.as_bytes()))
        })
    })
}

fn failing_origin(calls: &Arc<AtomicUsize>) -> Origin {
    let calls = calls.clone();
    Box::new(move || {
        Box::pin(async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::anyhow!("origin returned 502"))
        })
    })
}

fn local_only() -> CacheOrchestrator {
    CacheOrchestrator::new(Arc::new(LocalTier::default()), None, Duration::from_millis(500))
}

fn with_shared(tier: &Arc<MemoryTier>) -> CacheOrchestrator {
    CacheOrchestrator::new(
        Arc::new(LocalTier::default()),
        Some(tier.clone() as DynDistributedTier),
        Duration::from_millis(500),
    )
}

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

async fn read(cache: &CacheOrchestrator, key: &str, fetch: Origin) -> (Bytes, CacheStatus) {
    let lookup = cache.get_or_fetch(key, FRESH, STALE, fetch).await.unwrap();
    (lookup.value, lookup.status)
}

#[tokio::test(start_paused = true)]
async fn test_fresh_stale_expired_timeline() {
    let cache = local_only();
    let key = CacheKey::from_raw("v1:api:items:aa11");
    let calls = Arc::new(AtomicUsize::new(0));

    cache
        .set(key.as_str(), Bytes::from_static(br#"{"count":3}"#), FRESH, STALE)
        .await
        .unwrap();

    tokio::time::advance(Duration::from_secs(2)).await;
    let (value, status) = read(&cache, key.as_str(), origin(&calls, r#"{"count":4}"#, Duration::ZERO)).await;
    assert_eq!(status, CacheStatus::Hit);
    assert_eq!(value, Bytes::from_static(br#"{"count":3}"#));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // The background revalidation fails, so the stale entry stays in place.
    tokio::time::advance(Duration::from_secs(5)).await;
    let (value, status) = read(&cache, key.as_str(), failing_origin(&calls)).await;
    assert_eq!(status, CacheStatus::StaleHit);
    assert_eq!(value, Bytes::from_static(br#"{"count":3}"#));
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.stats().revalidation_failures, 1);

    tokio::time::advance(Duration::from_secs(5)).await;
    let (value, status) = read(&cache, key.as_str(), origin(&calls, r#"{"count":4}"#, Duration::ZERO)).await;
    assert_eq!(status, CacheStatus::Miss);
    assert_eq!(value, Bytes::from_static(br#"{"count":4}"#));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let (value, status) = read(&cache, key.as_str(), failing_origin(&calls)).await;
    assert_eq!(status, CacheStatus::Hit);
    assert_eq!(value, Bytes::from_static(br#"{"count":4}"#));
}

#[tokio::test(start_paused = true)]
async fn test_stale_reads_trigger_one_revalidation() {
    let cache = local_only();
    let calls = Arc::new(AtomicUsize::new(0));
    cache
        .set("v1:api:feed", Bytes::from_static(b"old"), FRESH, STALE)
        .await
        .unwrap();
    tokio::time::advance(Duration::from_secs(6)).await;

    let reads = (0..100).map(|_| read(&cache, "v1:api:feed", origin(&calls, "new", Duration::from_millis(50))));
    let results = join_all(reads).await;
    assert!(
        results
            .iter()
            .all(|(value, status)| *status == CacheStatus::StaleHit && value == &Bytes::from_static(b"old"))
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let (value, status) = read(&cache, "v1:api:feed", failing_origin(&calls)).await;
    assert_eq!(status, CacheStatus::Hit);
    assert_eq!(value, Bytes::from_static(b"new"));
    assert_eq!(cache.stats().revalidations, 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_misses_share_one_fetch() {
    let cache = local_only();
    let calls = Arc::new(AtomicUsize::new(0));

    let reads = (0..100).map(|_| read(&cache, "v1:api:slow", origin(&calls, "body", Duration::from_millis(200))));
    let results = join_all(reads).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(results.len(), 100);
    assert!(
        results
            .iter()
            .all(|(value, status)| *status == CacheStatus::Miss && value == &Bytes::from_static(b"body"))
    );
    let stats = cache.stats();
    assert_eq!(stats.misses, 100);
    assert_eq!(stats.origin_fetches, 1);
    assert_eq!(stats.in_flight, 0);
}

#[tokio::test(start_paused = true)]
async fn test_origin_errors_reach_all_waiters_and_are_not_cached() {
    let cache = local_only();
    let calls = Arc::new(AtomicUsize::new(0));

    let slow_failure = |calls: &Arc<AtomicUsize>| -> Origin {
        let calls = calls.clone();
        Box::new(move || {
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Err(anyhow::anyhow!("upstream timeout"))
            })
        })
    };

    let results = join_all((0..10).map(|_| cache.get_or_fetch("v1:api:err", FRESH, STALE, slow_failure(&calls)))).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    for result in results {
        let err = result.unwrap_err();
        assert!(err.is_origin());
        assert!(err.to_string().contains("upstream timeout"));
    }

    let (value, status) = read(&cache, "v1:api:err", origin(&calls, "recovered", Duration::ZERO)).await;
    assert_eq!(status, CacheStatus::Miss);
    assert_eq!(value, Bytes::from_static(b"recovered"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_caller_leaves_fetch_running() {
    let cache = local_only();
    let calls = Arc::new(AtomicUsize::new(0));

    let abandoned = cache.get_or_fetch("v1:api:bg", FRESH, STALE, origin(&calls, "done", Duration::from_secs(1)));
    assert!(tokio::time::timeout(Duration::from_millis(10), abandoned).await.is_err());

    tokio::time::sleep(Duration::from_secs(2)).await;
    settle().await;

    let (value, status) = read(&cache, "v1:api:bg", failing_origin(&calls)).await;
    assert_eq!(status, CacheStatus::Hit);
    assert_eq!(value, Bytes::from_static(b"done"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_distributed_tier_serves_other_process_with_remaining_window() {
    let shared = Arc::new(MemoryTier::new());
    let writer = with_shared(&shared);
    let reader = with_shared(&shared);
    let calls = Arc::new(AtomicUsize::new(0));

    read(&writer, "v1:api:items:1", origin(&calls, "from-origin", Duration::ZERO)).await;
    assert!(shared.contains("v1:api:items:1"));

    tokio::time::advance(Duration::from_secs(3)).await;
    let (value, status) = read(&reader, "v1:api:items:1", failing_origin(&calls)).await;
    assert_eq!(status, CacheStatus::Hit);
    assert_eq!(value, Bytes::from_static(b"from-origin"));
    assert!(reader.local().get("v1:api:items:1").is_some());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Past the writer's fresh boundary the reader's derived copy is stale too.
    tokio::time::advance(Duration::from_secs(3)).await;
    let (_, status) = read(&reader, "v1:api:items:1", origin(&calls, "refreshed", Duration::ZERO)).await;
    assert_eq!(status, CacheStatus::StaleHit);
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_distributed_entry_read_when_already_stale() {
    let shared = Arc::new(MemoryTier::new());
    let writer = with_shared(&shared);
    let calls = Arc::new(AtomicUsize::new(0));
    read(&writer, "v1:api:late", origin(&calls, "v", Duration::ZERO)).await;

    tokio::time::advance(Duration::from_secs(7)).await;
    let reader = with_shared(&shared);
    let (_, status) = read(&reader, "v1:api:late", failing_origin(&calls)).await;
    assert_eq!(status, CacheStatus::StaleHit);
}

#[tokio::test(start_paused = true)]
async fn test_distributed_entry_without_ttl_is_a_miss() {
    let shared = Arc::new(MemoryTier::new());
    shared.insert_persistent("v1:api:foreign", Bytes::from_static(b"unknown-age"));
    let cache = with_shared(&shared);
    let calls = Arc::new(AtomicUsize::new(0));

    let (value, status) = read(&cache, "v1:api:foreign", origin(&calls, "origin", Duration::ZERO)).await;
    assert_eq!(status, CacheStatus::Miss);
    assert_eq!(value, Bytes::from_static(b"origin"));
}

#[tokio::test(start_paused = true)]
async fn test_distributed_outage_degrades_to_local() {
    let shared = Arc::new(MemoryTier::new());
    shared.set_unavailable(true);
    let cache = with_shared(&shared);
    let calls = Arc::new(AtomicUsize::new(0));

    let (_, status) = read(&cache, "v1:api:down", origin(&calls, "v", Duration::ZERO)).await;
    assert_eq!(status, CacheStatus::Miss);
    let (_, status) = read(&cache, "v1:api:down", failing_origin(&calls)).await;
    assert_eq!(status, CacheStatus::Hit);

    let stats = cache.stats();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    // One failed read and one failed write.
    assert_eq!(stats.distributed_errors, 2);
    assert_eq!(stats.mode, "local+memory");
}

#[tokio::test(start_paused = true)]
async fn test_invalidation_forces_miss_for_matching_keys_only() {
    let shared = Arc::new(MemoryTier::new());
    let cache = with_shared(&shared);
    let calls = Arc::new(AtomicUsize::new(0));
    for key in ["v1:api:items:1", "v1:api:items:2", "v1:api:users:1"] {
        read(&cache, key, origin(&calls, "v", Duration::ZERO)).await;
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let report = InvalidationService::for_orchestrator(&cache)
        .invalidate("v1:api:items:*")
        .await
        .unwrap();
    assert_eq!(report.local_removed, 2);
    assert_eq!(report.distributed_removed, Some(2));

    let (_, status) = read(&cache, "v1:api:items:1", origin(&calls, "v2", Duration::ZERO)).await;
    assert_eq!(status, CacheStatus::Miss);
    let (_, status) = read(&cache, "v1:api:users:1", failing_origin(&calls)).await;
    assert_eq!(status, CacheStatus::Hit);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test(start_paused = true)]
async fn test_fetch_in_flight_during_invalidation_is_not_stored() {
    let shared = Arc::new(MemoryTier::new());
    let cache = with_shared(&shared);
    let invalidation = InvalidationService::for_orchestrator(&cache);
    let calls = Arc::new(AtomicUsize::new(0));
    let key = "v1:api:items:aa11";

    let slow = {
        let cache = cache.clone();
        let fetch = origin(&calls, "pre-invalidation", Duration::from_secs(1));
        tokio::spawn(async move { read(&cache, key, fetch).await })
    };
    tokio::time::advance(Duration::from_millis(100)).await;
    settle().await;
    invalidation.invalidate("v1:api:items:*").await.unwrap();

    // the caller still gets what the origin answered
    tokio::time::advance(Duration::from_secs(1)).await;
    let (value, status) = slow.await.unwrap();
    assert_eq!(status, CacheStatus::Miss);
    assert_eq!(value, Bytes::from_static(b"pre-invalidation"));
    settle().await;
    assert!(cache.local().get(key).is_none());
    assert!(!shared.contains(key));

    let (value, status) = read(&cache, key, origin(&calls, "post-invalidation", Duration::ZERO)).await;
    assert_eq!(status, CacheStatus::Miss);
    assert_eq!(value, Bytes::from_static(b"post-invalidation"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_revalidation_in_flight_during_invalidation_is_not_stored() {
    let shared = Arc::new(MemoryTier::new());
    let cache = with_shared(&shared);
    let invalidation = InvalidationService::for_orchestrator(&cache);
    let calls = Arc::new(AtomicUsize::new(0));
    let key = "v1:api:items:aa11";

    cache.set(key, Bytes::from_static(b"old"), FRESH, STALE).await.unwrap();
    tokio::time::advance(Duration::from_secs(6)).await;

    let (value, status) = read(&cache, key, origin(&calls, "pre-invalidation", Duration::from_secs(1))).await;
    assert_eq!(status, CacheStatus::StaleHit);
    assert_eq!(value, Bytes::from_static(b"old"));
    settle().await;

    invalidation.invalidate("v1:api:items:*").await.unwrap();
    tokio::time::advance(Duration::from_secs(1)).await;
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(cache.local().get(key).is_none());
    assert!(!shared.contains(key));

    let (value, status) = read(&cache, key, origin(&calls, "post-invalidation", Duration::ZERO)).await;
    assert_eq!(status, CacheStatus::Miss);
    assert_eq!(value, Bytes::from_static(b"post-invalidation"));
}

#[tokio::test(start_paused = true)]
async fn test_schema_version_bump_orphans_entries() {
    let cache = local_only();
    let calls = Arc::new(AtomicUsize::new(0));
    let v1 = KeyBuilder::new("v1").build_key("api", "items");
    let v2 = KeyBuilder::new("v2").build_key("api", "items");

    read(&cache, v1.as_str(), origin(&calls, "old-shape", Duration::ZERO)).await;
    let (value, status) = read(&cache, v2.as_str(), origin(&calls, "new-shape", Duration::ZERO)).await;
    assert_eq!(status, CacheStatus::Miss);
    assert_eq!(value, Bytes::from_static(b"new-shape"));
}

#[tokio::test]
async fn test_inverted_window_is_rejected() {
    let cache = local_only();
    let calls = Arc::new(AtomicUsize::new(0));
    let err = cache
        .get_or_fetch("k", STALE, FRESH, origin(&calls, "v", Duration::ZERO))
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::InvalidTtl { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}
