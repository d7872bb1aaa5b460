use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use super::CapabilityError;

/// Bounded exponential backoff for provider calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): base * 2^(retry-1) plus up
    /// to half a base of jitter, capped at `max_delay`. A server `Retry-After`
    /// hint wins when it is longer, but is capped at `max_delay` too.
    pub fn delay_for(&self, retry: u32, hint: Option<Duration>) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(1u32 << retry.saturating_sub(1).min(16));
        let jitter_ms = (self.base_delay.as_millis() / 2) as u64;
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms));
        let delay = exp.saturating_add(jitter).min(self.max_delay);
        match hint {
            Some(h) if h > delay => h.min(self.max_delay),
            _ => delay,
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the policy
/// runs out. Exhaustion surfaces as `Unavailable` carrying the last error.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, CapabilityError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CapabilityError>>,
{
    let mut retry = 0u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && retry < policy.max_retries => {
                retry += 1;
                let delay = policy.delay_for(retry, e.retry_after());
                warn!(call = what, retry, delay_ms = delay.as_millis() as u64, error = %e, "retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) if e.is_retryable() => {
                return Err(CapabilityError::Unavailable(format!(
                    "{what}: giving up after {} attempts: {e}",
                    retry + 1
                )))
            }
            Err(e) => return Err(e),
        }
    }
}
