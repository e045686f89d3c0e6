//! Concurrent cache priming at startup.
//!
//! Each task runs on its own tokio task with timeout protection and panic
//! recovery. A failing task is logged and recorded; it never stops the others.

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use tokio::task::JoinSet;

/// Default upper bound for a single warmup task.
const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(30);

/// A named priming function.
pub struct WarmupTask {
    pub name: String,
    future: BoxFuture<'static, anyhow::Result<()>>,
}

impl WarmupTask {
    pub fn new<F>(name: impl Into<String>, future: F) -> Self
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            future: Box::pin(future),
        }
    }
}

/// Outcome of a warmup run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WarmupReport {
    pub succeeded: usize,
    /// `(task name, error)` for every task that failed, panicked or timed out.
    pub failed: Vec<(String, String)>,
}

impl WarmupReport {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed.len()
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct WarmupRunner {
    timeout: Duration,
}

impl WarmupRunner {
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_TASK_TIMEOUT,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Run every task concurrently and wait for all of them.
    pub async fn warm(&self, tasks: Vec<WarmupTask>) -> WarmupReport {
        let mut set = JoinSet::new();
        let timeout = self.timeout;

        for task in tasks {
            let WarmupTask { name, future } = task;
            set.spawn(async move {
                let outcome = tokio::time::timeout(timeout, AssertUnwindSafe(future).catch_unwind()).await;
                let result = match outcome {
                    Ok(Ok(Ok(()))) => Ok(()),
                    Ok(Ok(Err(e))) => Err(format!("{e:#}")),
                    Ok(Err(panic)) => Err(panic_message(panic.as_ref())),
                    Err(_) => Err(format!("timed out after {}s", timeout.as_secs())),
                };
                (name, result)
            });
        }

        let mut report = WarmupReport::default();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((name, Ok(()))) => {
                    tracing::debug!(task = %name, "warmup task completed");
                    report.succeeded += 1;
                }
                Ok((name, Err(error))) => {
                    tracing::warn!(task = %name, error = %error, "warmup task failed");
                    report.failed.push((name, error));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "warmup task aborted");
                    report.failed.push(("<aborted>".to_string(), e.to_string()));
                }
            }
        }

        tracing::info!(
            succeeded = report.succeeded,
            failed = report.failed.len(),
            "cache warmup finished"
        );
        report
    }
}

impl Default for WarmupRunner {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}
