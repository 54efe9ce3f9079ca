//! Bounded retry with exponential backoff.
//!
//! Every operation runs at most `max_retries + 1` times. Between attempts the
//! caller is suspended (async) or the thread sleeps (blocking) for
//! `base_delay * 2^attempt`. When the last attempt fails, the failure is
//! wrapped in a [`DbError::Connection`] whose source is the last underlying
//! error.
//!
//! Operations are not assumed to be idempotent. A write that reached the
//! server before the transport failed will be applied again by the retry.

use crate::config::{DEFAULT_MAX_RETRIES, DEFAULT_RETRY_BASE_DELAY_MS};
use crate::error::{DbError, DbResult};
use futures_util::future::BoxFuture;
use std::time::Duration;
use tracing::{Span, error, info_span, warn};

/// Retry budget and backoff base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Policy that runs an operation exactly once.
    pub fn no_retry() -> Self {
        Self::new(0, Duration::ZERO)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Total number of attempts, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay after the failed attempt with zero-based index `attempt`.
    ///
    /// Saturates instead of overflowing for large attempt numbers.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .unwrap_or(Duration::MAX)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_RETRIES,
            Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
        )
    }
}

/// Runs operations against a connection under a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    span: Span,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            span: info_span!("retry", component = "retry_executor"),
        }
    }

    /// Log under `span` instead of the default component span.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` against `connection`, retrying failures.
    ///
    /// The closure is called once per attempt and must build a fresh future
    /// each time, so anything it moves into the future has to be cloned.
    pub async fn execute<C, T, F>(&self, connection: &mut C, mut operation: F) -> DbResult<T>
    where
        C: ?Sized + Send,
        T: Send,
        F: for<'c> FnMut(&'c mut C) -> BoxFuture<'c, DbResult<T>> + Send,
    {
        let max_attempts = self.policy.max_attempts();
        let mut attempt = 0u32;
        loop {
            match operation(&mut *connection).await {
                Ok(value) => return Ok(value),
                Err(err) => match self.after_failure(attempt, max_attempts, err) {
                    Ok(delay) => {
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    Err(exhausted) => return Err(exhausted),
                },
            }
        }
    }

    /// Blocking counterpart of [`execute`](Self::execute); sleeps the calling
    /// thread between attempts.
    pub fn execute_blocking<C, T, F>(&self, connection: &mut C, mut operation: F) -> DbResult<T>
    where
        C: ?Sized,
        F: FnMut(&mut C) -> DbResult<T>,
    {
        let max_attempts = self.policy.max_attempts();
        let mut attempt = 0u32;
        loop {
            match operation(&mut *connection) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let delay = self.after_failure(attempt, max_attempts, err)?;
                    std::thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }

    /// Decide what follows a failed attempt: the backoff delay, or the final
    /// error once the budget is spent.
    fn after_failure(&self, attempt: u32, max_attempts: u32, err: DbError) -> DbResult<Duration> {
        if attempt < self.policy.max_retries {
            let delay = self.policy.delay_for(attempt);
            warn!(
                parent: &self.span,
                attempt = attempt + 1,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Operation failed, retrying"
            );
            return Ok(delay);
        }

        error!(
            parent: &self.span,
            attempts = max_attempts,
            error = %err,
            "Operation failed after all attempts"
        );
        Err(DbError::connection_caused_by(
            format!("Operation failed after {max_attempts} attempts"),
            "Check that the server is reachable; non-idempotent writes may have been applied more than once",
            err,
        ))
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    struct Flaky {
        failures_left: u32,
        calls: u32,
    }

    impl Flaky {
        fn new(failures: u32) -> Self {
            Self {
                failures_left: failures,
                calls: 0,
            }
        }

        fn call(&mut self) -> DbResult<&'static str> {
            self.calls += 1;
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(DbError::protocol("connection reset"));
            }
            Ok("ok")
        }
    }

    #[test]
    fn test_delay_schedule() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        assert_eq!(policy.delay_for(0), Duration::from_millis(10));
        assert_eq!(policy.delay_for(1), Duration::from_millis(20));
        assert_eq!(policy.delay_for(2), Duration::from_millis(40));
        assert_eq!(policy.max_attempts(), 4);
    }

    #[test]
    fn test_delay_saturates() {
        let policy = RetryPolicy::new(100, Duration::from_secs(1));
        assert_eq!(policy.delay_for(64), Duration::MAX);
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries(), 3);
        assert_eq!(policy.base_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_blocking_succeeds_after_failures() {
        let executor = RetryExecutor::new(RetryPolicy::new(3, Duration::from_millis(1)));
        let mut flaky = Flaky::new(2);
        let result = executor.execute_blocking(&mut flaky, |f| f.call());
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(flaky.calls, 3);
    }

    #[test]
    fn test_blocking_exhaustion_wraps_last_error() {
        let executor = RetryExecutor::new(RetryPolicy::new(2, Duration::from_millis(1)));
        let mut flaky = Flaky::new(u32::MAX);
        let err = executor
            .execute_blocking(&mut flaky, |f| f.call())
            .unwrap_err();
        assert_eq!(flaky.calls, 3);
        assert!(matches!(err, DbError::Connection { .. }));
        assert!(err.to_string().contains("3 attempts"));
        assert!(err.source().unwrap().to_string().contains("connection reset"));
    }

    #[test]
    fn test_no_retry_runs_once() {
        let executor = RetryExecutor::new(RetryPolicy::no_retry());
        let mut flaky = Flaky::new(1);
        assert!(executor.execute_blocking(&mut flaky, |f| f.call()).is_err());
        assert_eq!(flaky.calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_backoff_sleeps_exponentially() {
        let executor = RetryExecutor::new(RetryPolicy::new(3, Duration::from_millis(100)));
        let mut flaky = Flaky::new(2);
        let start = tokio::time::Instant::now();

        let result = executor
            .execute(&mut flaky, |f| {
                let outcome = f.call();
                Box::pin(async move { outcome })
            })
            .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(flaky.calls, 3);
        // 100ms + 200ms
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_exhaustion_after_max_attempts() {
        let executor = RetryExecutor::new(RetryPolicy::new(2, Duration::from_millis(10)));
        let mut flaky = Flaky::new(u32::MAX);

        let err = executor
            .execute(&mut flaky, |f| {
                let outcome = f.call();
                Box::pin(async move { outcome })
            })
            .await
            .unwrap_err();

        assert_eq!(flaky.calls, 3);
        assert!(matches!(err.root_cause(), DbError::Protocol { .. }));
    }
}
