//! Bounded handler retry
//!
//! `RetryExecutor` runs a unit of work up to `budget + 1` times. Panics are
//! caught and treated as that attempt's error. Every attempt and every wait
//! between attempts is bounded by the caller's deadline.

use crate::error::{BoxError, HandlerError};
use futures::FutureExt;
use rand::Rng;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::time::{Instant, timeout_at};
use tracing::debug;

/// Jittered exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
    pub floor: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, floor: Duration) -> Self {
        Self { base, cap, floor }
    }

    /// Half of `min(cap, base * 2^attempt)`
    pub fn half_window(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.base.saturating_mul(factor).min(self.cap) / 2
    }

    /// Wait before re-attempt number `attempt` (1-based).
    ///
    /// The result lies in `[half, 2 * half]`, never below `floor`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let half = self.half_window(attempt);
        let jitter_ms = if half.is_zero() {
            0
        } else {
            rand::rng().random_range(0..=half.as_millis() as u64)
        };
        (half + Duration::from_millis(jitter_ms)).max(self.floor)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(500),
            Duration::from_secs(1),
            Duration::from_millis(500),
        )
    }
}

/// Retry driver for handler invocations
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    backoff: Backoff,
}

impl RetryExecutor {
    pub fn new(backoff: Backoff) -> Self {
        Self { backoff }
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Run `work` until it succeeds, the budget is spent or `deadline` passes.
    ///
    /// Returns the number of re-attempts made after the first attempt, so an
    /// always-failing `work` with budget `N` reports `N`.
    pub async fn run<T, F, Fut>(
        &self,
        deadline: Instant,
        budget: u32,
        mut work: F,
    ) -> (u32, Result<T, HandlerError>)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BoxError>>,
    {
        let mut attempt = 0;

        loop {
            let outcome = timeout_at(deadline, AssertUnwindSafe(work()).catch_unwind()).await;

            let err = match outcome {
                Ok(Ok(Ok(value))) => return (attempt, Ok(value)),
                Ok(Ok(Err(e))) => HandlerError::Failed(e),
                Ok(Err(panic)) => HandlerError::from_panic(panic),
                Err(_) => return (attempt, Err(HandlerError::DeadlineExceeded)),
            };

            if attempt >= budget {
                return (attempt, Err(err));
            }

            attempt += 1;
            let delay = self.backoff.delay(attempt);
            debug!(
                attempt = attempt,
                budget = budget,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Attempt failed, retrying"
            );

            if timeout_at(deadline, tokio::time::sleep(delay)).await.is_err() {
                return (attempt - 1, Err(HandlerError::DeadlineExceeded));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryExecutor {
        RetryExecutor::new(Backoff::new(
            Duration::from_millis(2),
            Duration::from_millis(4),
            Duration::from_millis(1),
        ))
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    #[test]
    fn test_backoff_window() {
        let backoff = Backoff::default();
        assert_eq!(backoff.half_window(0), Duration::from_millis(250));
        assert_eq!(backoff.half_window(1), Duration::from_millis(500));
        // capped at 1s
        assert_eq!(backoff.half_window(5), Duration::from_millis(500));
        assert_eq!(backoff.half_window(200), Duration::from_millis(500));
    }

    #[test]
    fn test_backoff_delay_bounds() {
        let backoff = Backoff::default();
        for attempt in 0..10 {
            let half = backoff.half_window(attempt);
            let delay = backoff.delay(attempt);
            assert!(delay >= backoff.floor);
            assert!(delay >= half);
            assert!(delay <= (half * 2).max(backoff.floor));
        }
    }

    #[tokio::test]
    async fn test_success_first_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let (retries, result) = fast()
            .run(far_deadline(), 3, || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, BoxError>("done")
                }
            })
            .await;

        assert_eq!(retries, 0);
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_success_after_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let (retries, result) = fast()
            .run(far_deadline(), 5, || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err::<(), BoxError>(format!("attempt {}", n).into())
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert_eq!(retries, 2);
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_budget_exhausted_reports_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let (retries, result) = fast()
            .run(far_deadline(), 2, || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), BoxError>("always fails".into())
                }
            })
            .await;

        assert_eq!(retries, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3); // 1 initial + 2 retries
        let err = result.unwrap_err();
        assert!(matches!(err, HandlerError::Failed(_)));
        assert_eq!(err.to_string(), "always fails");
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let (retries, result) = fast()
            .run(far_deadline(), 1, || async {
                if true {
                    panic!("handler exploded");
                }
                Ok::<(), BoxError>(())
            })
            .await;

        assert_eq!(retries, 1);
        let err = result.unwrap_err();
        assert!(err.is_panic());
        assert!(err.to_string().contains("handler exploded"));
    }

    #[tokio::test]
    async fn test_deadline_cuts_attempt() {
        let deadline = Instant::now() + Duration::from_millis(50);

        let (retries, result) = fast()
            .run(deadline, 3, || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<(), BoxError>(())
            })
            .await;

        assert_eq!(retries, 0);
        assert!(matches!(result, Err(HandlerError::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn test_deadline_cuts_backoff_wait() {
        let slow = RetryExecutor::new(Backoff::new(
            Duration::from_secs(10),
            Duration::from_secs(20),
            Duration::from_secs(10),
        ));
        let deadline = Instant::now() + Duration::from_millis(50);
        let started = Instant::now();

        let (_, result) = slow
            .run(deadline, 3, || async { Err::<(), BoxError>("nope".into()) })
            .await;

        assert!(matches!(result, Err(HandlerError::DeadlineExceeded)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
