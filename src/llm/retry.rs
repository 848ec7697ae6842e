//! Bounded retry with jittered exponential backoff for provider calls.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::LlmError;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based), honouring a server hint.
    pub fn delay_for(&self, retry: u32, hint: Option<Duration>) -> Duration {
        if let Some(hint) = hint {
            return hint.min(self.max_delay);
        }
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(retry.saturating_sub(1)));
        let capped = exp.min(self.max_delay);
        // Up to 25% jitter so concurrent workers do not retry in lockstep.
        let jitter_ms = rand::thread_rng().gen_range(0..=capped.as_millis() as u64 / 4);
        capped + Duration::from_millis(jitter_ms)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// retry budget is spent.
pub(crate) async fn with_retry<T, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, LlmError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    let mut retry = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && retry < policy.max_retries => {
                retry += 1;
                let hint = match &e {
                    LlmError::RateLimited { retry_after, .. } => *retry_after,
                    _ => None,
                };
                let delay = policy.delay_for(retry, hint);
                warn!(error = %e, retry, delay_ms = delay.as_millis() as u64, "Retrying provider call");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[test]
    fn delay_grows_and_is_capped() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
        };
        let first = policy.delay_for(1, None);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(125));
        let capped = policy.delay_for(5, None);
        assert!(capped >= Duration::from_millis(300) && capped <= Duration::from_millis(375));
    }

    #[test]
    fn server_hint_wins_but_is_capped() {
        let policy = fast_policy(1);
        assert_eq!(
            policy.delay_for(1, Some(Duration::from_secs(60))),
            Duration::from_millis(2)
        );
    }

    #[tokio::test]
    async fn retries_retryable_errors_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result = with_retry(fast_policy(3), || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(LlmError::RateLimited {
                        provider: "test".into(),
                        retry_after: None,
                    })
                } else {
                    Ok("done")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_auth_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<(), _> = with_retry(fast_policy(3), || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(LlmError::AuthFailed {
                    provider: "test".into(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<(), _> = with_retry(fast_policy(2), || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(LlmError::RequestFailed {
                    provider: "test".into(),
                    reason: "HTTP 503: overloaded".into(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
