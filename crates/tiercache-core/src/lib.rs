//! Two-tier stale-while-revalidate cache.
//!
//! A process-local tier (L1) sits in front of a shared distributed tier (L2).
//! Reads go through [`CacheOrchestrator::get_or_fetch`], which serves fresh
//! entries directly, serves stale entries while one background revalidation
//! runs, and coalesces concurrent misses into a single origin fetch.

pub mod cdn;
pub mod config;
pub mod distributed;
pub mod entry;
pub mod error;
pub mod invalidation;
pub mod key;
pub mod local;
pub mod metrics;
pub mod middleware;
pub mod orchestrator;
pub mod pattern;
pub mod pubsub;
pub mod singleflight;
pub mod warmup;

pub use cdn::{CdnPurger, HttpCdnPurger};
pub use config::{CacheConfig, CachePolicy, CdnConfig, RedisConfig, TtlConfig};
pub use distributed::{DistributedTier, DynDistributedTier, MemoryTier, RedisTier};
pub use entry::{CacheEntry, CacheStatus, Freshness};
pub use error::{CacheError, CacheResult, PurgeError, TierError};
pub use invalidation::{InvalidationReport, InvalidationService};
pub use key::{CacheKey, KeyBuilder, params_digest};
pub use local::{LocalTier, SweeperHandle};
pub use middleware::{CacheMiddleware, RequestKeyParts};
pub use orchestrator::{CacheOrchestrator, CacheStats, Lookup};
pub use pattern::KeyPattern;
pub use pubsub::{InvalidationListener, ListenerHandle, publish_invalidation};
pub use singleflight::SingleFlight;
pub use warmup::{WarmupReport, WarmupRunner, WarmupTask};
