//! Bounded exponential-backoff retry around progress store operations.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::IngestError;
use crate::report::ErrorReporter;

/// Backoff configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_backoff: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    pub multiplier: u32,
    /// Upper bound for a single delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            multiplier: 2,
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Returns the delay to wait after the `attempt`-th failure (1-based).
    /// Returns `None` once no attempts remain.
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt >= self.max_attempts {
            return None;
        }
        let factor = self.multiplier.saturating_pow(attempt - 1);
        Some(self.initial_backoff.saturating_mul(factor).min(self.max_backoff))
    }
}

/// Runs fallible async operations under a [`RetryPolicy`].
///
/// Only [`IngestError::is_retryable`] errors are retried. When attempts are
/// exhausted the last error is reported and returned to the caller.
#[derive(Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    reporter: Arc<dyn ErrorReporter>,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy, reporter: Arc<dyn ErrorReporter>) -> Self {
        Self { policy, reporter }
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// policy runs out of attempts.
    pub async fn run<T, F, Fut>(&self, name: &str, mut op: F) -> Result<T, IngestError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, IngestError>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => match self.policy.delay_after(attempt) {
                    Some(delay) => {
                        tracing::warn!(
                            op = name,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "retrying store operation"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        tracing::error!(op = name, attempt, error = %e, "max retries exceeded");
                        self.reporter.capture(&e, name);
                        return Err(e);
                    }
                },
                Err(e) => {
                    self.reporter.capture(&e, name);
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::TracingReporter;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn default_backoff_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay_after(2), Some(Duration::from_secs(2)));
        assert!(policy.delay_after(3).is_none());
    }

    #[test]
    fn delay_capped_at_max() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            multiplier: 10,
            max_backoff: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_after(5), Some(Duration::from_millis(500)));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let reporter = Arc::new(TracingReporter::new());
        let exec = RetryExecutor::new(RetryPolicy::default(), reporter.clone());
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let started = tokio::time::Instant::now();
        let value = exec
            .run("get_realtime", || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(IngestError::Storage("connection reset".into()))
                } else {
                    Ok(42u64)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 1s + 2s of backoff
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(reporter.reported(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_surfaces_and_reports() {
        let reporter = Arc::new(TracingReporter::new());
        let exec = RetryExecutor::new(RetryPolicy::default(), reporter.clone());
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result: Result<(), _> = exec
            .run("set_realtime", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(IngestError::Storage("timeout".into()))
            })
            .await;

        assert!(matches!(result, Err(IngestError::Storage(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(reporter.reported(), 1);
    }

    #[tokio::test]
    async fn non_retryable_fails_fast() {
        let reporter = Arc::new(TracingReporter::new());
        let exec = RetryExecutor::new(RetryPolicy::default(), reporter.clone());
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result: Result<(), _> = exec
            .run("load", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(IngestError::Other("corrupt record".into()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(reporter.reported(), 1);
    }
}
