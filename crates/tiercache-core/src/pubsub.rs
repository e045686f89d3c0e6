//! Redis Pub/Sub for cross-process L1 invalidation.
//!
//! Invalidation is otherwise process-local for L1: other processes keep
//! serving their copies until those expire. When broadcasting is enabled the
//! invalidating process publishes the pattern and every listener drops
//! matching keys from its own L1.
//!
//! ```text
//! Process A: invalidate("v1:api:items:*")
//!   ↓
//! PUBLISH tiercache:invalidate "v1:api:items:*"
//!   ↓
//! Process B listener → LocalTier::invalidate_matching
//! Process C listener → LocalTier::invalidate_matching
//! ```

use std::sync::Arc;
use std::time::Duration;

use deadpool_redis::Pool;
use redis::AsyncCommands;
use tokio::task::JoinHandle;

use crate::error::TierError;
use crate::local::LocalTier;
use crate::pattern::KeyPattern;

/// Channel carrying invalidation patterns.
pub const INVALIDATION_CHANNEL: &str = "tiercache:invalidate";

const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Aborts the listener task when dropped.
#[derive(Debug)]
pub struct ListenerHandle(JoinHandle<()>);

impl ListenerHandle {
    pub fn is_finished(&self) -> bool {
        self.0.is_finished()
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Subscribes to [`INVALIDATION_CHANNEL`] and applies patterns to the local tier.
pub struct InvalidationListener {
    pub redis_url: String,
    pub local: Arc<LocalTier>,
}

impl InvalidationListener {
    /// Spawn the listener. It reconnects with exponential backoff until the
    /// returned handle is dropped.
    pub fn start(self) -> ListenerHandle {
        ListenerHandle(tokio::spawn(async move {
            let mut backoff = Duration::from_secs(1);
            loop {
                match self.run().await {
                    Ok(()) => backoff = Duration::from_secs(1),
                    Err(e) => {
                        tracing::error!(
                            error = %e,
                            backoff_secs = backoff.as_secs(),
                            "Invalidation listener error, reconnecting..."
                        );
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                }
            }
        }))
    }

    async fn run(&self) -> Result<(), TierError> {
        use futures_util::StreamExt;

        let client = redis::Client::open(self.redis_url.as_str())?;
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(INVALIDATION_CHANNEL).await?;

        tracing::info!(channel = INVALIDATION_CHANNEL, "Subscribed to invalidation channel");

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            match msg.get_payload::<String>() {
                Ok(pattern) => self.apply(&pattern),
                Err(e) => tracing::warn!(error = %e, "failed to parse invalidation payload"),
            }
        }
        Err(TierError::Connection("pub/sub connection closed".into()))
    }

    fn apply(&self, pattern: &str) {
        match KeyPattern::new(pattern) {
            Ok(pattern) => {
                let removed = self.local.invalidate_matching(&pattern);
                tracing::debug!(pattern = %pattern.as_str(), removed, "applied remote invalidation");
            }
            Err(e) => tracing::warn!(error = %e, "ignoring malformed invalidation pattern"),
        }
    }
}

/// Publish `pattern` to every listening process.
pub async fn publish_invalidation(redis: &Pool, pattern: &str) -> Result<(), TierError> {
    let mut conn = redis
        .get()
        .await
        .map_err(|e| TierError::Connection(e.to_string()))?;

    conn.publish::<_, _, ()>(INVALIDATION_CHANNEL, pattern).await?;

    tracing::debug!(pattern = %pattern, "published invalidation");
    Ok(())
}
