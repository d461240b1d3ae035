//! Retry with exponential backoff.
//!
//! One [`RetryController`] wraps every service call of a run. Delays grow as
//! `base * 2^k` for retry `k` and are capped, so with the defaults the waits
//! are 1, 2, 4, 8, 16, 30, 30 seconds. Fatal failures are returned at once.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{error, warn};

use crate::checkpoint::RateLimitStats;
use crate::emit;
use crate::error::ClassifyError;
use crate::metrics::events::{RetriesExhausted, RetryScheduled};

/// Delay before retry `retry_count` (0-indexed): `base * 2^retry_count`.
pub fn retry_delay(retry_count: u32, base: Duration) -> Duration {
    let multiplier = 2_u32.saturating_pow(retry_count);
    base.saturating_mul(multiplier)
}

/// Attempt budget and backoff bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, first attempt included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(6, Duration::from_secs(1), Duration::from_secs(30))
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

    /// Capped delay before retry `retry_count`.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        retry_delay(retry_count, self.base_delay).min(self.max_delay)
    }
}

/// Wraps single service calls with backoff and keeps cumulative statistics.
#[derive(Debug, Default)]
pub struct RetryController {
    policy: RetryPolicy,
    rate_limit_hits: AtomicU64,
    transient_retries: AtomicU64,
    exhausted_calls: AtomicU64,
    total_wait_ms: AtomicU64,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `call` until it succeeds, fails fatally or the budget runs out.
    ///
    /// On exhaustion the last failure is returned, so a call that kept being
    /// rate limited comes back as [`ClassifyError::RateLimited`].
    pub async fn run<F, Fut>(&self, label: &str, mut call: F) -> Result<String, ClassifyError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<String, ClassifyError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let err = match call().await {
                Ok(raw) => return Ok(raw),
                Err(err) => err,
            };

            if matches!(err, ClassifyError::RateLimited { .. }) {
                self.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
            }

            if !err.is_retryable() {
                error!(call = label, attempt, error = %err, "Service call failed, not retrying");
                return Err(err);
            }

            if attempt >= self.policy.max_attempts {
                self.exhausted_calls.fetch_add(1, Ordering::Relaxed);
                emit!(RetriesExhausted { kind: err.kind() });
                error!(
                    call = label,
                    attempts = attempt,
                    error = %err,
                    "Retries exhausted"
                );
                return Err(err);
            }

            if matches!(err, ClassifyError::Transient { .. }) {
                self.transient_retries.fetch_add(1, Ordering::Relaxed);
            }

            let wait = self.policy.delay_for(attempt - 1);
            warn!(
                call = label,
                attempt,
                max_attempts = self.policy.max_attempts,
                wait_secs = wait.as_secs_f64(),
                error = %err,
                "Service call failed, backing off"
            );
            emit!(RetryScheduled {
                kind: err.kind(),
                wait,
            });
            tokio::time::sleep(wait).await;
            self.total_wait_ms
                .fetch_add(wait.as_millis() as u64, Ordering::Relaxed);
        }
    }

    /// Statistics accumulated by this controller.
    pub fn snapshot(&self) -> RateLimitStats {
        RateLimitStats {
            rate_limit_hits: self.rate_limit_hits.load(Ordering::Relaxed),
            transient_retries: self.transient_retries.load(Ordering::Relaxed),
            exhausted_calls: self.exhausted_calls.load(Ordering::Relaxed),
            total_wait_ms: self.total_wait_ms.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::time::Instant;

    fn rate_limited() -> ClassifyError {
        ClassifyError::RateLimited {
            message: "429".into(),
        }
    }

    #[test]
    fn test_retry_delay_basic() {
        let base = Duration::from_millis(100);
        assert_eq!(retry_delay(0, base), Duration::from_millis(100));
        assert_eq!(retry_delay(1, base), Duration::from_millis(200));
        assert_eq!(retry_delay(2, base), Duration::from_millis(400));
        // Saturates instead of overflowing.
        assert!(retry_delay(40, base) >= retry_delay(31, base));
    }

    #[test]
    fn test_default_sequence_is_capped() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (0..8).map(|k| policy.delay_for(k).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30, 30]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleeps_follow_backoff_attempt_by_attempt() {
        let policy = RetryPolicy::new(8, Duration::from_secs(1), Duration::from_secs(30));
        let controller = RetryController::new(policy);
        let calls: Mutex<Vec<Instant>> = Mutex::new(Vec::new());

        let result = controller
            .run("batch 0", || {
                calls.lock().unwrap().push(Instant::now());
                async { Err(rate_limited()) }
            })
            .await;

        assert!(matches!(result, Err(ClassifyError::RateLimited { .. })));
        let calls = calls.into_inner().unwrap();
        assert_eq!(calls.len(), 8);
        let gaps: Vec<u64> = calls.windows(2).map(|w| (w[1] - w[0]).as_secs()).collect();
        assert_eq!(gaps, vec![1, 2, 4, 8, 16, 30, 30]);

        let stats = controller.snapshot();
        assert_eq!(stats.rate_limit_hits, 8);
        assert_eq!(stats.exhausted_calls, 1);
        assert_eq!(stats.total_wait_ms, 91_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_rate_limit() {
        let controller = RetryController::new(RetryPolicy::default());
        let attempts = AtomicU64::new(0);

        let result = controller
            .run("batch 1", || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(rate_limited())
                    } else {
                        Ok("ok".to_string())
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(controller.snapshot().rate_limit_hits, 1);
        assert_eq!(controller.snapshot().total_wait_ms, 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_is_not_retried() {
        let controller = RetryController::new(RetryPolicy::default());
        let attempts = AtomicU64::new(0);

        let result = controller
            .run("batch 2", || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(ClassifyError::Fatal {
                        message: "401".into(),
                    })
                }
            })
            .await;

        assert!(matches!(result, Err(ClassifyError::Fatal { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(controller.snapshot(), RateLimitStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_exhaustion_returns_transient() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(10));
        let controller = RetryController::new(policy);

        let result = controller
            .run("batch 3", || async {
                Err(ClassifyError::Transient {
                    message: "timeout".into(),
                })
            })
            .await;

        assert!(matches!(result, Err(ClassifyError::Transient { .. })));
        let stats = controller.snapshot();
        assert_eq!(stats.transient_retries, 2);
        assert_eq!(stats.exhausted_calls, 1);
    }
}
