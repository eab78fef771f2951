//! Bounded exponential backoff for transient storage failures.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::config::WebhookConfig;
use crate::error::DatabaseError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = single attempt).
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay randomly added or removed, 0.0 to 1.0.
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn from_webhook_config(config: &WebhookConfig) -> Self {
        Self {
            max_retries: config.max_persistence_retries,
            initial_delay: config.retry_base_delay,
            max_delay: Duration::from_secs(2),
            jitter: 0.25,
        }
    }

    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * 2f64.powi(attempt.min(16) as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        if self.jitter <= 0.0 || capped == 0.0 {
            return Duration::from_secs_f64(capped);
        }
        let spread = capped * self.jitter.min(1.0);
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((capped + offset).max(0.0))
    }
}

/// Storage failure that survived every retry.
#[derive(Debug)]
pub struct RetryExhausted {
    pub attempts: u32,
    pub source: DatabaseError,
}

/// Run `operation`, retrying only errors for which [`DatabaseError::is_transient`] holds.
pub async fn retry_transient<F, Fut, T>(
    policy: &RetryPolicy,
    context: &str,
    operation: F,
) -> Result<T, RetryExhausted>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, DatabaseError>>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        match operation().await {
            Ok(value) => {
                if attempts > 1 {
                    tracing::info!(context, attempts, "Storage operation succeeded after retries");
                }
                return Ok(value);
            }
            Err(e) if e.is_transient() && attempts <= policy.max_retries => {
                let delay = policy.delay_for_attempt(attempts - 1);
                tracing::warn!(
                    context,
                    attempt = attempts,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient storage failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                return Err(RetryExhausted {
                    attempts,
                    source: e,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::{RetryPolicy, retry_transient};
    use crate::error::DatabaseError;

    fn fast(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            jitter: 0.0,
        }
    }

    #[test]
    fn delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(300),
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(50));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(9), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_transient(&fast(3), "test", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(DatabaseError::Query("database is locked".into()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.expect("eventually ok"), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let calls = AtomicU32::new(0);
        let err = retry_transient(&fast(2), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(DatabaseError::Pool("unavailable".into()))
        })
        .await
        .expect_err("exhausted");
        assert_eq!(err.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_fail_fast() {
        let calls = AtomicU32::new(0);
        let err = retry_transient(&fast(5), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(DatabaseError::Serialization("bad row".into()))
        })
        .await
        .expect_err("not retried");
        assert_eq!(err.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
