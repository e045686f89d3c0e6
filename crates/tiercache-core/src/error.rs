use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors surfaced to callers of the cache.
///
/// Only origin failures travel this far. Distributed tier and CDN failures are
/// logged and absorbed where they happen (see [`TierError`], [`PurgeError`]).
///
/// The type is `Clone` because a single origin result is handed to every
/// caller waiting on the same in-flight fetch.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The caller-supplied fetch function failed
    #[error("origin fetch failed: {0}")]
    Origin(Arc<anyhow::Error>),

    /// The in-flight fetch ended without producing a result (the task panicked or was aborted)
    #[error("origin fetch for {key} ended without a result")]
    FetchAborted { key: String },

    /// `stale_ttl` shorter than `fresh_ttl`
    #[error("invalid ttl window: stale ttl {stale:?} is shorter than fresh ttl {fresh:?}")]
    InvalidTtl { fresh: Duration, stale: Duration },

    /// Invalidation pattern could not be compiled
    #[error("invalid key pattern {pattern}: {message}")]
    InvalidPattern { pattern: String, message: String },
}

impl CacheError {
    /// Wrap an origin failure.
    pub fn origin(err: impl Into<anyhow::Error>) -> Self {
        Self::Origin(Arc::new(err.into()))
    }

    /// Returns true if the error came from the origin fetch function.
    pub fn is_origin(&self) -> bool {
        matches!(self, Self::Origin(_))
    }

    /// Access the underlying origin error, e.g. to downcast a typed failure.
    pub fn origin_error(&self) -> Option<&anyhow::Error> {
        match self {
            Self::Origin(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

/// Errors raised by a distributed tier client.
#[derive(Debug, Error)]
pub enum TierError {
    #[error("distributed tier connection error: {0}")]
    Connection(String),

    #[error("distributed tier command error: {0}")]
    Command(#[from] redis::RedisError),

    #[error("distributed tier call timed out after {0:?}")]
    Timeout(Duration),

    #[error("distributed tier unavailable")]
    Unavailable,
}

/// Errors raised by a CDN purge client.
#[derive(Debug, Error)]
pub enum PurgeError {
    #[error("CDN purge request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("CDN purge rejected with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("CDN purge timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid CDN configuration: {0}")]
    InvalidConfig(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("upstream answered {0}")]
    struct UpstreamStatus(u16);

    #[test]
    fn origin_errors_can_be_downcast() {
        let err = CacheError::origin(UpstreamStatus(503));
        assert!(err.is_origin());
        let status = err
            .origin_error()
            .and_then(|e| e.downcast_ref::<UpstreamStatus>())
            .map(|s| s.0);
        assert_eq!(status, Some(503));
        assert_eq!(err.to_string(), "origin fetch failed: upstream answered 503");
    }

    #[test]
    fn clones_share_the_origin_error() {
        let err = CacheError::origin(anyhow::anyhow!("boom"));
        let cloned = err.clone();
        match (&err, &cloned) {
            (CacheError::Origin(a), CacheError::Origin(b)) => assert!(Arc::ptr_eq(a, b)),
            _ => panic!("expected origin errors"),
        }
    }
}
