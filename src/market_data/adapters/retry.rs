// Bounded retry with exponential backoff and jitter for adapter calls.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{AdapterError, AdapterResult};

const BACKOFF_BASE: f64 = 1.5;
/// Upper bound on a single backoff sleep.
pub const MAX_BACKOFF: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, first call included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Extra multiplier applied when upstream says we're rate limited.
    pub rate_limit_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1_000),
            rate_limit_factor: 4.0,
        }
    }
}

impl RetryPolicy {
    /// base × 1.5^attempt × U(0.9, 1.1), scaled up for rate limits.
    pub fn backoff(&self, attempt: u32, err: &AdapterError) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.9..=1.1);
        let mut secs = self.base_delay.as_secs_f64() * BACKOFF_BASE.powi(attempt as i32) * jitter;
        if matches!(err, AdapterError::RateLimited(_)) && self.rate_limit_factor.is_finite() {
            secs *= self.rate_limit_factor.max(1.0);
        }
        Duration::try_from_secs_f64(secs).map_or(MAX_BACKOFF, |d| d.min(MAX_BACKOFF))
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// attempt budget runs out. Cancellation short-circuits both the call and
/// the backoff sleep.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    source: &str,
    cancel: &CancellationToken,
    mut op: F,
) -> AdapterResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AdapterResult<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(AdapterError::Cancelled);
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(AdapterError::Cancelled) => return Err(AdapterError::Cancelled),
            Err(err) if err.is_retryable() && attempt + 1 < policy.max_attempts => {
                let delay = policy.backoff(attempt, &err);
                warn!(source, attempt = attempt + 1, max = policy.max_attempts, delay_ms = delay.as_millis() as u64, error = %err, "retrying");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(AdapterError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
