//! Retry, per-call timeout and request pacing.
//!
//! Every wait in this module races the run's cancellation token: once the
//! token fires no new attempt starts and no backoff sleep completes.
//!
//! ```text
//! provider call
//!   ├─ guarded(): cancel ─┬─ timeout ─┬─ call
//!   │                     │           └─ Ok / Err(e)
//!   │                     └─ Err(Timeout{after})
//!   └─ Err(Cancelled)
//! ```

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::GenerationError;

/// Run `fut` under the per-call timeout, aborting it if `cancel` fires first.
pub async fn guarded<T, F>(
    cancel: &CancellationToken,
    timeout: Duration,
    fut: F,
) -> Result<T, GenerationError>
where
    F: Future<Output = Result<T, GenerationError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(GenerationError::Cancelled),
        result = tokio::time::timeout(timeout, fut) => match result {
            Ok(inner) => inner,
            Err(_) => Err(GenerationError::Timeout { after: timeout }),
        },
    }
}

/// Sleep for `duration` unless cancelled first.
pub async fn sleep_or_cancel(
    cancel: &CancellationToken,
    duration: Duration,
) -> Result<(), GenerationError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(GenerationError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

// ── RetryPolicy ──────────────────────────────────────────────────────────────

/// Exponential backoff for retriable provider failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.multiplier < 1.0 {
            return Err(format!(
                "retry multiplier must be >= 1.0, got {}",
                self.multiplier
            ));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err("retry base_delay_ms must not exceed max_delay_ms".to_string());
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_ms as f64 * self.multiplier.powi(attempt as i32);
        Duration::from_millis(delay.min(self.max_delay_ms as f64) as u64)
    }

    /// Execute `operation`, retrying retriable errors with backoff.
    ///
    /// Cancellation is checked before every attempt and during every sleep.
    pub async fn execute<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T, GenerationError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GenerationError>>,
    {
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(GenerationError::Cancelled);
            }
            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(attempt, "retry succeeded");
                    }
                    return Ok(value);
                }
                Err(error) => {
                    if !error.is_retriable() || attempt >= self.max_retries {
                        return Err(error);
                    }
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        category = %error.retry_category(),
                        error = %error,
                        "retrying provider call"
                    );
                    sleep_or_cancel(cancel, delay).await?;
                    attempt += 1;
                }
            }
        }
    }
}

// ── RequestPacer ─────────────────────────────────────────────────────────────

/// Enforces a minimum interval between request starts against one provider.
///
/// Waiters queue on the inner lock, so concurrent callers are released one
/// interval apart in arrival order.
#[derive(Debug)]
pub struct RequestPacer {
    interval: Duration,
    last_start: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_start: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait for the next free slot, then claim it.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), GenerationError> {
        let mut last = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(GenerationError::Cancelled),
            guard = self.last_start.lock() => guard,
        };
        if let Some(prev) = *last {
            let ready_at = prev + self.interval;
            let now = Instant::now();
            if ready_at > now {
                debug!(wait_ms = (ready_at - now).as_millis() as u64, "pacing request");
                sleep_or_cancel(cancel, ready_at - now).await?;
            }
        }
        *last = Some(Instant::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            multiplier: 2.0,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_then_succeeds() {
        let calls = &AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let result = RetryPolicy::default()
            .execute(&cancel, || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(GenerationError::Request("reset".into()))
                } else {
                    Ok("ok")
                }
            })
            .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_errors_are_not_retried() {
        let calls = &AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let result: Result<(), _> = RetryPolicy::default()
            .execute(&cancel, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(GenerationError::Status {
                    status: 400,
                    body: "bad request".into(),
                })
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn no_retry_after_cancellation() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let result: Result<(), _> = RetryPolicy::default()
            .execute(&cancel, || {
                let calls = calls.clone();
                let cancel = cancel.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    cancel.cancel();
                    Err(GenerationError::Request("reset".into()))
                }
            })
            .await;
        assert_eq!(result.unwrap_err(), GenerationError::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn guarded_reports_timeout() {
        let cancel = CancellationToken::new();
        let result: Result<(), _> = guarded(&cancel, Duration::from_secs(5), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;
        assert_eq!(
            result.unwrap_err(),
            GenerationError::Timeout {
                after: Duration::from_secs(5)
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn pacer_spaces_request_starts() {
        let pacer = RequestPacer::new(Duration::from_secs(2));
        let cancel = CancellationToken::new();
        let start = Instant::now();
        pacer.acquire(&cancel).await.unwrap();
        pacer.acquire(&cancel).await.unwrap();
        pacer.acquire(&cancel).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(4));
    }
}
