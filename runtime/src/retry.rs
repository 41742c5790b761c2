//! Retry executor for transient tool failures.
//!
//! [`RetryExecutor`] runs an operation under a [`RetryPolicy`]: up to
//! `max_attempts` attempts, with the delay between attempts chosen by the
//! policy's [`RetryStrategy`] and optionally jittered. Delays suspend only the
//! calling task, and dropping the returned future during a delay stops any
//! further attempts.
//!
//! # Example
//!
//! ```rust
//! use toolguard_core::config::RetryPolicy;
//! use toolguard_runtime::retry::RetryExecutor;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let executor = RetryExecutor::new(RetryPolicy::fixed(3, Duration::from_millis(10)));
//!
//! let result = executor
//!     .run(
//!         |_attempt| async { Ok::<_, std::io::Error>(42) },
//!         |_attempt, _err| {},
//!     )
//!     .await?;
//! assert_eq!(result, 42);
//! # Ok(())
//! # }
//! ```

use rand::Rng;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use toolguard_core::config::{RetryPolicy, RetryStrategy};

/// Every attempt failed, or an error was not retryable.
///
/// Carries the last error and how many attempts ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryExhausted<E> {
    /// Attempts made, including the one that produced `error`
    pub attempts: u32,
    /// Error of the last attempt
    pub error: E,
}

impl<E> RetryExhausted<E> {
    /// Unwrap the last error.
    pub fn into_inner(self) -> E {
        self.error
    }
}

impl<E: fmt::Display> fmt::Display for RetryExhausted<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed after {} attempt(s): {}", self.attempts, self.error)
    }
}

impl<E> std::error::Error for RetryExhausted<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Runs operations under a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    /// Create an executor for a policy.
    #[must_use]
    pub const fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// The policy in use.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Delay after `attempt` (1-based) failed, before jitter.
    ///
    /// - immediate: zero
    /// - fixed delay: `base_delay`
    /// - linear: `min(max_delay, base_delay * attempt)`
    /// - exponential: `min(max_delay, base_delay * multiplier^(attempt - 1))`
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let policy = &self.policy;
        let base = policy.base_delay.as_secs_f64();
        let secs = match policy.strategy {
            RetryStrategy::Immediate => return Duration::ZERO,
            RetryStrategy::FixedDelay => return policy.base_delay,
            RetryStrategy::LinearBackoff => base * f64::from(attempt),
            RetryStrategy::ExponentialBackoff => {
                let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
                base * policy.backoff_multiplier.powi(exponent)
            }
        };
        Duration::try_from_secs_f64(secs).map_or(policy.max_delay, |delay| delay.min(policy.max_delay))
    }

    fn next_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        if !self.policy.jitter || delay.is_zero() {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(0.5..1.5);
        Duration::try_from_secs_f64(delay.as_secs_f64() * factor)
            .map_or(delay, |jittered| jittered.min(self.policy.max_delay))
    }

    /// Run `operation` until it succeeds or the attempts run out.
    ///
    /// `operation` receives the 1-based attempt number. `on_attempt_failed`
    /// fires after every failed attempt, the last one included, before the
    /// retry decision is made.
    ///
    /// # Errors
    ///
    /// Returns [`RetryExhausted`] with the last error once `max_attempts`
    /// attempts have failed.
    pub async fn run<F, Fut, T, E, H>(&self, operation: F, on_attempt_failed: H) -> Result<T, RetryExhausted<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
        H: FnMut(u32, &E),
    {
        self.run_if(operation, |_| true, on_attempt_failed).await
    }

    /// Like [`run`](Self::run), but errors rejected by `is_retryable` end the
    /// loop immediately.
    ///
    /// # Errors
    ///
    /// Returns [`RetryExhausted`] with the last error once attempts run out or
    /// a non-retryable error occurs.
    pub async fn run_if<F, Fut, T, E, P, H>(
        &self,
        mut operation: F,
        is_retryable: P,
        mut on_attempt_failed: H,
    ) -> Result<T, RetryExhausted<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
        P: Fn(&E) -> bool,
        H: FnMut(u32, &E),
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match operation(attempt).await {
                Ok(result) => {
                    if attempt > 1 {
                        tracing::info!(attempt, "Operation succeeded after retry");
                    }
                    return Ok(result);
                }
                Err(err) => {
                    on_attempt_failed(attempt, &err);

                    if !is_retryable(&err) {
                        tracing::warn!(attempt, error = %err, "Error is not retryable, failing immediately");
                        return Err(RetryExhausted { attempts: attempt, error: err });
                    }

                    if attempt >= max_attempts {
                        if max_attempts > 1 {
                            tracing::error!(attempt, error = %err, "Operation failed after max attempts");
                        }
                        return Err(RetryExhausted { attempts: attempt, error: err });
                    }

                    let delay = self.next_delay(attempt);
                    tracing::warn!(
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "Operation failed, retrying..."
                    );

                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn counting_failure(counter: &Arc<AtomicU32>) -> impl FnMut(u32) -> std::future::Ready<Result<u32, String>> {
        let counter = Arc::clone(counter);
        move |attempt| {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Err(format!("attempt {attempt} failed")))
        }
    }

    #[test]
    fn test_exponential_delays_without_jitter() {
        let executor = RetryExecutor::new(RetryPolicy::exponential(
            5,
            Duration::from_secs(1),
            Duration::from_secs(10),
            2.0,
        ));

        let delays: Vec<Duration> = (1..=4).map(|a| executor.delay_for_attempt(a)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
            ]
        );
        assert_eq!(executor.delay_for_attempt(5), Duration::from_secs(10));
        assert_eq!(executor.delay_for_attempt(500), Duration::from_secs(10));
    }

    #[test]
    fn test_linear_and_fixed_delays() {
        let linear = RetryExecutor::new(RetryPolicy {
            strategy: RetryStrategy::LinearBackoff,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
            jitter: false,
            ..RetryPolicy::default()
        });
        assert_eq!(linear.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(linear.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(linear.delay_for_attempt(3), Duration::from_millis(250));

        let fixed = RetryExecutor::new(RetryPolicy::fixed(3, Duration::from_millis(10)));
        assert_eq!(fixed.delay_for_attempt(1), Duration::from_millis(10));
        assert_eq!(fixed.delay_for_attempt(7), Duration::from_millis(10));

        let immediate = RetryExecutor::new(RetryPolicy::immediate(3));
        assert_eq!(immediate.delay_for_attempt(2), Duration::ZERO);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let executor = RetryExecutor::new(
            RetryPolicy::fixed(3, Duration::from_millis(100)).with_jitter(true),
        );
        for _ in 0..200 {
            let delay = executor.next_delay(1);
            assert!(delay >= Duration::from_millis(50), "{delay:?}");
            assert!(delay <= Duration::from_millis(150), "{delay:?}");
        }
    }

    #[test]
    fn test_jitter_never_exceeds_max_delay() {
        let executor = RetryExecutor::new(RetryPolicy {
            strategy: RetryStrategy::FixedDelay,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(100),
            jitter: true,
            ..RetryPolicy::default()
        });
        for _ in 0..200 {
            let delay = executor.next_delay(1);
            assert!(delay >= Duration::from_millis(50), "{delay:?}");
            assert!(delay <= Duration::from_millis(100), "{delay:?}");
        }
    }

    #[tokio::test]
    async fn test_succeeds_on_first_try() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&counter);

        let result = RetryExecutor::new(RetryPolicy::default())
            .run(
                move |_| {
                    c.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<_, String>(42) }
                },
                |_, _| {},
            )
            .await;

        assert_eq!(result, Ok(42));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_failures() {
        let executor = RetryExecutor::new(RetryPolicy::fixed(3, Duration::from_millis(10)));
        let mut failures = Vec::new();

        let result = executor
            .run(
                |attempt| async move {
                    if attempt < 3 {
                        Err(format!("attempt {attempt} failed"))
                    } else {
                        Ok(attempt)
                    }
                },
                |attempt, err: &String| failures.push((attempt, err.clone())),
            )
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(
            failures,
            vec![(1, "attempt 1 failed".to_string()), (2, "attempt 2 failed".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_attempts_and_reports_last_error() {
        let counter = Arc::new(AtomicU32::new(0));
        let mut hook_calls = 0;

        let result = RetryExecutor::new(RetryPolicy::fixed(3, Duration::from_millis(10)))
            .run(counting_failure(&counter), |_, _| hook_calls += 1)
            .await;

        let err = result.expect_err("all attempts fail");
        assert_eq!(err.attempts, 3);
        assert_eq!(err.error, "attempt 3 failed");
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(hook_calls, 3);
        assert_eq!(err.to_string(), "failed after 3 attempt(s): attempt 3 failed");
    }

    #[tokio::test]
    async fn test_single_attempt_never_sleeps() {
        let counter = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::from_secs(3600),
            max_delay: Duration::from_secs(3600),
            ..RetryPolicy::default()
        };

        // Real time: a sleep would hang this test.
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            RetryExecutor::new(policy).run(counting_failure(&counter), |_, _| {}),
        )
        .await
        .expect("no delay after the only attempt");

        assert_eq!(result.expect_err("fails").attempts, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_if_stops_on_non_retryable() {
        let counter = Arc::new(AtomicU32::new(0));

        let result = RetryExecutor::new(RetryPolicy::immediate(5))
            .run_if(counting_failure(&counter), |err: &String| err.contains("transient"), |_, _| {})
            .await;

        assert_eq!(result.expect_err("fails").attempts, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_during_delay_stops_attempts() {
        let counter = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::new(RetryPolicy::fixed(5, Duration::from_secs(1)));

        let outcome = tokio::time::timeout(
            Duration::from_millis(1_500),
            executor.run(counting_failure(&counter), |_, _| {}),
        )
        .await;
        assert!(outcome.is_err(), "future is cancelled mid-delay");
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
