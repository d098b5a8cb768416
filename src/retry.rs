//! Backoff policy and cancellable retry loop

use crate::error::{RelayerError, RelayerResult};
use crate::shutdown::Shutdown;

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// 1.0 gives a fixed delay
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            base_delay,
            max_delay,
            multiplier,
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self::new(delay, delay, 1.0)
    }

    /// Delay to wait after the given failed attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let exponential_delay =
            self.base_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);

        let delay_seconds = exponential_delay.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(delay_seconds.max(0.0))
    }
}

/// Sleep unless shutdown fires first. Returns false when cancelled.
pub async fn sleep_or_cancel(delay: Duration, shutdown: &Shutdown) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = shutdown.cancelled() => false,
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// `max_attempts` is reached.
pub async fn execute_with_retry<F, Fut, T>(
    operation: F,
    policy: &BackoffPolicy,
    max_attempts: u32,
    shutdown: &Shutdown,
    operation_name: &str,
) -> RelayerResult<T>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = RelayerResult<T>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Ok(result) => {
                if attempt > 1 {
                    debug!("{} succeeded on attempt {}", operation_name, attempt);
                }
                return Ok(result);
            }
            Err(e) if !e.is_retryable() || attempt >= max_attempts => return Err(e),
            Err(e) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    "{} failed on attempt {}/{}: {}; retrying in {:?}",
                    operation_name, attempt, max_attempts, e, delay
                );
                if !sleep_or_cancel(delay, shutdown).await {
                    return Err(RelayerError::Cancelled(operation_name.to_string()));
                }
            }
        }

        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(5), 2.0)
    }

    #[test]
    fn test_delay_growth_is_capped() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(5), 2.0);
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(5));
        assert_eq!(policy.delay_for(40), Duration::from_secs(5));
    }

    #[test]
    fn test_fixed_policy() {
        let policy = BackoffPolicy::fixed(Duration::from_secs(30));
        assert_eq!(policy.delay_for(1), Duration::from_secs(30));
        assert_eq!(policy.delay_for(10), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_retry_success_on_second_attempt() {
        let calls = AtomicU32::new(0);

        let result = execute_with_retry(
            |_| {
                let count = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if count == 0 {
                        Err(RelayerError::ChainConnection {
                            message: "connection reset".to_string(),
                        })
                    } else {
                        Ok("sent")
                    }
                }
            },
            &fast_policy(),
            3,
            &Shutdown::never(),
            "test_operation",
        )
        .await;

        assert_eq!(result.unwrap(), "sent");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_stops_at_max_attempts() {
        let calls = AtomicU32::new(0);

        let result: RelayerResult<()> = execute_with_retry(
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(RelayerError::OracleUnavailable("down".to_string())) }
            },
            &fast_policy(),
            4,
            &Shutdown::never(),
            "test_operation",
        )
        .await;

        assert!(matches!(result, Err(RelayerError::OracleUnavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_non_retryable_error_returns_immediately() {
        let calls = AtomicU32::new(0);

        let result: RelayerResult<()> = execute_with_retry(
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(RelayerError::InvalidRequest("bad".to_string())) }
            },
            &fast_policy(),
            5,
            &Shutdown::never(),
            "test_operation",
        )
        .await;

        assert!(matches!(result, Err(RelayerError::InvalidRequest(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_during_backoff() {
        let (trigger, token) = crate::shutdown::channel();
        trigger.trigger();

        let policy = BackoffPolicy::fixed(Duration::from_secs(60));
        let result: RelayerResult<()> = execute_with_retry(
            |_| async {
                Err(RelayerError::ChainConnection {
                    message: "down".to_string(),
                })
            },
            &policy,
            5,
            &token,
            "test_operation",
        )
        .await;

        assert!(matches!(result, Err(RelayerError::Cancelled(_))));
    }
}
