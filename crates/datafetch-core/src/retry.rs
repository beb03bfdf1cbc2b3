//! Bounded exponential backoff shared by loaders, locators, storage and publishing

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::config::settings::{
    DEFAULT_RETRY_BASE_DELAY_MS, DEFAULT_RETRY_MAX_ATTEMPTS, DEFAULT_RETRY_MAX_DELAY_SECS,
};
use crate::error::{Classified, ErrorClass};

/// Retry budget for one operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
            max_delay: Duration::from_secs(DEFAULT_RETRY_MAX_DELAY_SECS),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// Retries without sleeping between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO, Duration::ZERO)
    }

    /// Same delays, different attempt budget
    pub fn with_max_attempts(self, max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..self
        }
    }

    /// Delay before attempt `attempt + 1`, doubling from `base_delay` and capped at `max_delay`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or the attempt budget is spent.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, f: F) -> Result<T, E>
    where
        E: Classified + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_counted(operation, f).await.0
    }

    /// Like [`run`](Self::run) but also reports how many attempts were made.
    pub async fn run_counted<T, E, F, Fut>(&self, operation: &str, mut f: F) -> (Result<T, E>, u32)
    where
        E: Classified + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempts = 0;

        loop {
            attempts += 1;

            match f().await {
                Ok(value) => return (Ok(value), attempts),
                Err(e) if e.class() == ErrorClass::Retryable && attempts < self.max_attempts => {
                    let delay = self.delay_for(attempts);
                    warn!(
                        operation,
                        attempt = attempts,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retryable failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                },
                Err(e) => return (Err(e), attempts),
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::LoaderError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1), Duration::from_secs(3));
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(3));
        assert_eq!(policy.delay_for(10), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried_until_budget() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let (result, attempts) = RetryPolicy::immediate(3)
            .run_counted("fetch", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(LoaderError::transient("a", "timeout"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let (result, attempts) = RetryPolicy::immediate(3)
            .run_counted("fetch", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(LoaderError::permanent("a", "404"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failure() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = RetryPolicy::immediate(3)
            .run("fetch", move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(LoaderError::transient("a", "reset"))
                } else {
                    Ok(42)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_sleeps_between_attempts() {
        let start = tokio::time::Instant::now();
        let policy = RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(30));
        let _ = policy
            .run("fetch", || async { Err::<(), _>(LoaderError::transient("a", "slow")) })
            .await;
        // 1s + 2s of virtual time
        assert!(start.elapsed() >= Duration::from_secs(3));
    }
}
