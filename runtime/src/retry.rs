//! Retry with a fixed backoff for handler methods.
//!
//! A policy names which failures are retryable, either by error type (matched
//! anywhere in the `source()` chain) or by predicate. Anything else fails on
//! the first attempt. The backoff sleeps on the delivering task, so no later
//! record reaches the handler while an earlier one is being retried.
//!
//! # Example
//!
//! ```rust
//! use eventstore_tools_runtime::retry::{RetryPolicy, retry_with_policy};
//! use std::time::Duration;
//!
//! #[derive(Debug, thiserror::Error)]
//! #[error("database busy")]
//! struct Busy;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let policy = RetryPolicy::builder()
//!     .max_attempts(5)
//!     .backoff(Duration::from_millis(200))
//!     .retry_on::<Busy>()
//!     .build();
//!
//! let value = retry_with_policy(&policy, || async { Ok(42) }).await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use eventstore_tools_core::BoxError;
use eventstore_tools_core::error::has_cause;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

type Matcher = Arc<dyn Fn(&(dyn Error + 'static)) -> bool + Send + Sync>;

/// Retry policy of one handler method.
///
/// # Default Values
///
/// - `max_attempts`: 3 (first call included)
/// - `backoff`: 1 second
/// - nothing is retryable until a matcher is added
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Duration,
    retryable: Vec<Matcher>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("retryable", &self.retryable.len())
            .finish()
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            max_attempts: 3,
            backoff: Duration::from_secs(1),
            retryable: Vec::new(),
        }
    }

    /// Total number of calls, the first one included.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Pause between two attempts.
    #[must_use]
    pub const fn backoff(&self) -> Duration {
        self.backoff
    }

    /// Whether `error` matches one of the retryable matchers.
    #[must_use]
    pub fn is_retryable(&self, error: &(dyn Error + 'static)) -> bool {
        self.retryable.iter().any(|matches| matches(error))
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Clone)]
pub struct RetryPolicyBuilder {
    max_attempts: u32,
    backoff: Duration,
    retryable: Vec<Matcher>,
}

impl RetryPolicyBuilder {
    /// Set the total number of calls.
    #[must_use]
    pub const fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the pause between attempts.
    #[must_use]
    pub const fn backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Retry when an `E` appears anywhere in the error's cause chain.
    #[must_use]
    pub fn retry_on<E: Error + 'static>(mut self) -> Self {
        self.retryable.push(Arc::new(has_cause::<E>));
        self
    }

    /// Retry when `predicate` accepts the error.
    #[must_use]
    pub fn retry_when<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&(dyn Error + 'static)) -> bool + Send + Sync + 'static,
    {
        self.retryable.push(Arc::new(predicate));
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            retryable: self.retryable,
        }
    }
}

/// Retry `operation` under `policy`, matching errors with the policy's
/// matchers.
///
/// # Errors
///
/// Returns the first non-retryable error, or the last error once
/// `max_attempts` calls have failed.
pub async fn retry_with_policy<F, Fut, T>(policy: &RetryPolicy, operation: F) -> Result<T, BoxError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BoxError>>,
{
    retry_with_predicate(policy, operation, |err: &BoxError| {
        policy.is_retryable(&**err)
    })
    .await
}

/// Retry an async operation with custom retry logic.
///
/// Only the attempt budget and backoff of `policy` are used; `is_retryable`
/// decides which errors are retried.
///
/// # Errors
///
/// Returns the first error `is_retryable` rejects, or the last error once
/// the attempt budget is spent.
pub async fn retry_with_predicate<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    mut operation: F,
    is_retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt: u32 = 1;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::info!(attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(err) => {
                if !is_retryable(&err) {
                    tracing::debug!(
                        error = %err,
                        "Error is not retryable, failing immediately"
                    );
                    return Err(err);
                }

                if attempt >= policy.max_attempts {
                    tracing::error!(
                        attempt,
                        error = %err,
                        "Operation failed after max attempts"
                    );
                    return Err(err);
                }

                tracing::warn!(
                    attempt,
                    delay_ms = policy.backoff.as_millis(),
                    error = %err,
                    "Operation failed, retrying..."
                );

                sleep(policy.backoff).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("transient")]
    struct Transient;

    #[derive(Debug, Error)]
    #[error("wrapped: {0}")]
    struct Wrapper(#[source] Transient);

    #[derive(Debug, Error)]
    #[error("permanent")]
    struct Permanent;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(max_attempts)
            .backoff(Duration::from_millis(1))
            .retry_on::<Transient>()
            .build()
    }

    #[test]
    fn defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.backoff(), Duration::from_secs(1));
        assert!(!policy.is_retryable(&Transient));
    }

    #[test]
    fn matches_through_cause_chain() {
        let policy = policy(3);
        assert!(policy.is_retryable(&Transient));
        assert!(policy.is_retryable(&Wrapper(Transient)));
        assert!(!policy.is_retryable(&Permanent));
    }

    #[test]
    fn predicate_matcher() {
        let policy = RetryPolicy::builder()
            .retry_when(|err| err.to_string().contains("busy"))
            .build();
        assert!(policy.is_retryable(&std::io::Error::other("server busy")));
        assert!(!policy.is_retryable(&Permanent));
    }

    #[tokio::test]
    async fn succeeds_after_retryable_failures() {
        let calls = AtomicUsize::new(0);

        let result = retry_with_policy(&policy(3), || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(Box::new(Transient) as BoxError)
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausting_attempts_returns_last_error() {
        let calls = AtomicUsize::new(0);

        let result: Result<(), BoxError> = retry_with_policy(&policy(2), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Box::new(Wrapper(Transient)) as BoxError) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_retryable_fails_on_first_attempt() {
        let calls = AtomicUsize::new(0);

        let result: Result<(), BoxError> = retry_with_policy(&policy(5), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Box::new(Permanent) as BoxError) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn predicate_variant_counts_attempts() {
        let calls = AtomicUsize::new(0);

        let result = retry_with_predicate(
            &policy(4),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<i32, _>("transient error") }
            },
            |err: &&str| err.contains("transient"),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
