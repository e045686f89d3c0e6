//! Per-key request coalescing.
//!
//! The first caller for a key registers an in-flight record and launches the
//! fetch on its own task; later callers subscribe to the same record. The
//! record is removed before the result is published, so a caller arriving
//! after completion starts a new flight (by then the value is normally cached).

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;

use crate::error::CacheError;

type Outcome = Option<Result<Bytes, CacheError>>;

enum Join {
    Leader(watch::Sender<Outcome>, watch::Receiver<Outcome>),
    Waiter(watch::Receiver<Outcome>),
}

/// Coalesces concurrent fetches of the same key into one execution.
///
/// Fetches run on a spawned task: a caller that stops waiting does not cancel
/// the fetch for everyone else.
#[derive(Clone, Default)]
pub struct SingleFlight {
    flights: Arc<DashMap<String, watch::Receiver<Outcome>>>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `fetch` for `key`, or wait on the fetch already running for it.
    ///
    /// Every caller of the same flight receives the same result, error included.
    pub async fn run<F, Fut>(&self, key: &str, fetch: F) -> Result<Bytes, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Bytes, CacheError>> + Send + 'static,
    {
        let rx = match self.join(key) {
            Join::Waiter(rx) => {
                tracing::trace!(key = %key, "joined in-flight fetch");
                rx
            }
            Join::Leader(tx, rx) => {
                self.launch(key, tx, rx.clone(), fetch);
                rx
            }
        };
        wait(key, rx).await
    }

    /// Start `fetch` for `key` in the background unless a flight already exists.
    ///
    /// Returns true if a new flight was started.
    pub fn spawn<F, Fut>(&self, key: &str, fetch: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Bytes, CacheError>> + Send + 'static,
    {
        match self.join(key) {
            Join::Leader(tx, rx) => {
                self.launch(key, tx, rx, fetch);
                true
            }
            Join::Waiter(_) => false,
        }
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.flights.contains_key(key)
    }

    /// Number of keys with a fetch currently running.
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }

    fn join(&self, key: &str) -> Join {
        match self.flights.entry(key.to_string()) {
            Entry::Occupied(existing) => Join::Waiter(existing.get().clone()),
            Entry::Vacant(slot) => {
                let (tx, rx) = watch::channel(None);
                slot.insert(rx.clone());
                Join::Leader(tx, rx)
            }
        }
    }

    fn launch<F, Fut>(&self, key: &str, tx: watch::Sender<Outcome>, rx: watch::Receiver<Outcome>, fetch: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Bytes, CacheError>> + Send + 'static,
    {
        let guard = InFlightGuard {
            flights: Arc::clone(&self.flights),
            key: key.to_string(),
            rx,
        };
        tokio::spawn(async move {
            let result = fetch().await;
            drop(guard);
            tx.send_replace(Some(result));
        });
    }
}

/// Removes the in-flight record when the fetch task finishes, panics or is aborted.
struct InFlightGuard {
    flights: Arc<DashMap<String, watch::Receiver<Outcome>>>,
    key: String,
    rx: watch::Receiver<Outcome>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.flights
            .remove_if(&self.key, |_, registered| registered.same_channel(&self.rx));
    }
}

async fn wait(key: &str, mut rx: watch::Receiver<Outcome>) -> Result<Bytes, CacheError> {
    loop {
        let current = rx.borrow_and_update().clone();
        if let Some(result) = current {
            return result;
        }
        if rx.changed().await.is_err() {
            let last = rx.borrow().clone();
            return last.unwrap_or_else(|| {
                Err(CacheError::FetchAborted {
                    key: key.to_string(),
                })
            });
        }
    }
}
