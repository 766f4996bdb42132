//! Bounded local retry for transient dependency errors

use std::future::Future;
use std::time::Duration;

use crate::error::Result;

/// Exponential backoff delay for the `n`th retry (1-based), capped at `max`
pub fn backoff_delay(initial: Duration, max: Duration, n: u32) -> Duration {
    let factor = 2u32.saturating_pow(n.saturating_sub(1));
    initial.saturating_mul(factor).min(max)
}

/// Local retry policy of a single external call
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_backoff: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff,
            max_backoff: Duration::from_secs(30),
        }
    }

    /// No retries
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Longest `run` can take when each call is bounded by `per_call`
    pub fn worst_case(&self, per_call: Duration) -> Duration {
        (1..=self.max_retries).fold(
            per_call.saturating_mul(self.max_retries.saturating_add(1)),
            |total, n| total.saturating_add(backoff_delay(self.initial_backoff, self.max_backoff, n)),
        )
    }

    /// Run `op`, retrying transient failures.
    ///
    /// Returns the final result and the number of attempts made. Permanent
    /// errors return immediately.
    pub async fn run<T, F, Fut>(&self, op_name: &str, mut op: F) -> (Result<T>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return (Ok(value), attempt),
                Err(e) if e.is_transient() && attempt <= self.max_retries => {
                    let delay = backoff_delay(self.initial_backoff, self.max_backoff, attempt);
                    tracing::warn!(
                        "{} failed (attempt {}/{}), retrying in {:?}: {}",
                        op_name,
                        attempt,
                        self.max_retries + 1,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return (Err(e), attempt),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_doubles_and_caps() {
        let min = Duration::from_secs(1);
        let max = Duration::from_secs(10);
        assert_eq!(backoff_delay(min, max, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(min, max, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(min, max, 4), Duration::from_secs(8));
        assert_eq!(backoff_delay(min, max, 5), Duration::from_secs(10));
        assert_eq!(backoff_delay(min, max, 64), Duration::from_secs(10));
    }

    #[test]
    fn test_worst_case_counts_calls_and_backoff() {
        let policy = RetryPolicy::new(3, Duration::from_millis(500));
        assert_eq!(
            policy.worst_case(Duration::from_secs(30)),
            Duration::from_millis(120_000 + 500 + 1_000 + 2_000)
        );
        assert_eq!(RetryPolicy::none().worst_case(Duration::from_secs(5)), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let (result, attempts) = policy
            .run("flaky", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::transient("test", "503"))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let policy = RetryPolicy::new(2, Duration::from_millis(1));
        let (result, attempts): (Result<()>, u32) = policy
            .run("down", || async { Err(Error::transient("test", "timeout")) })
            .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, Duration::from_millis(1));
        let (result, attempts): (Result<()>, u32) = policy
            .run("bad", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::validation("bad processor"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
