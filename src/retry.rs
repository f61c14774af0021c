//! Retry-with-backoff utility shared by embedding and index-write calls.
//!
//! Instead of scattering per-call retry loops, every external call that may
//! fail transiently goes through [`with_backoff`], parameterized by a
//! [`RetryPolicy`]. Classification lives on [`ServiceError`]: transient
//! errors (rate limits, 5xx, timeouts) back off and retry; invalid input
//! fails immediately.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::ServiceError;

/// Bounded exponential backoff: attempt `n` (1-based) sleeps
/// `base_secs^n` seconds before retrying, capped at [`MAX_DELAY`].
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_secs: u64,
}

const MAX_DELAY: Duration = Duration::from_secs(60);

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_secs: u64) -> Self {
        Self {
            max_attempts,
            base_secs,
        }
    }

    fn delay_after(&self, attempt: u32) -> Duration {
        let secs = self.base_secs.saturating_pow(attempt);
        Duration::from_secs(secs).min(MAX_DELAY)
    }
}

/// Run `op` until it succeeds, a non-transient error occurs, or
/// `policy.max_attempts` attempts are exhausted.
///
/// `op` receives the 1-based attempt number. The last error is returned
/// after exhaustion. Timeouts inside `op` count as one failed attempt.
pub async fn with_backoff<T, F, Fut>(
    policy: RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, ServiceError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
{
    let mut last_err = None;

    for attempt in 1..=policy.max_attempts {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_transient() => {
                warn!(%label, attempt, error = %err, "non-retryable failure");
                return Err(err);
            }
            Err(err) => {
                warn!(%label, attempt, max = policy.max_attempts, error = %err, "attempt failed");
                if attempt < policy.max_attempts {
                    tokio::time::sleep(policy.delay_after(attempt)).await;
                }
                last_err = Some(err);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| ServiceError::Service(format!("{}: no attempts made", label))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, 0)
    }

    #[tokio::test]
    async fn succeeds_first_try() {
        let calls = AtomicU32::new(0);
        let result = with_backoff(fast_policy(3), "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, ServiceError>(42) }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn converges_after_two_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = with_backoff(fast_policy(3), "test", |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(ServiceError::Service(format!("boom {}", n)))
                } else {
                    Ok("ok")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_and_returns_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_backoff(fast_policy(3), "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ServiceError::RateLimited("still throttled".into())) }
        })
        .await;
        assert!(matches!(result, Err(ServiceError::RateLimited(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn invalid_input_fails_fast() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_backoff(fast_policy(5), "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ServiceError::InvalidInput("malformed".into())) }
        })
        .await;
        assert!(matches!(result, Err(ServiceError::InvalidInput(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_counts_as_an_attempt() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_backoff(fast_policy(2), "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ServiceError::Timeout(Duration::from_millis(1))) }
        })
        .await;
        assert!(matches!(result, Err(ServiceError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
