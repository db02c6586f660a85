use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;
use crate::error::RelayError;

/// Exponential backoff with uniform jitter:
/// `delay = base * 2^attempt + U(0, max_jitter)`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Total attempts = `max_retries + 1`.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.base_delay(),
            max_jitter: Duration::from_millis(config.max_jitter_ms),
        }
    }
}

impl RetryPolicy {
    /// Policy without delays. Used by tests and by callers that do their own pacing.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_jitter: Duration::ZERO,
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        let base = self.base_delay.saturating_mul(factor);
        let jitter_ms = self.max_jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0..=jitter_ms);
        base.saturating_add(Duration::from_millis(jitter))
    }
}

/// Run `operation` until it succeeds, a non-retryable error occurs, or the
/// budget is spent. `on_error` sees every failure before the retry decision.
pub async fn retry_with_backoff<T, F, Fut, E>(
    policy: &RetryPolicy,
    mut operation: F,
    mut on_error: E,
) -> Result<T, RelayError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, RelayError>>,
    E: FnMut(&RelayError, u32),
{
    let mut attempt = 0;
    loop {
        match operation(attempt).await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!(attempt, "provider recovered after retries");
                }
                return Ok(value);
            }
            Err(e) => {
                on_error(&e, attempt);

                if !e.is_retryable() {
                    tracing::warn!(class = e.class().as_str(), "non-retryable error: {e}");
                    return Err(e);
                }
                if attempt >= policy.max_retries {
                    tracing::warn!(
                        attempts = attempt + 1,
                        "retry budget exhausted: {e}"
                    );
                    return Err(e);
                }

                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    attempt = attempt + 1,
                    max_attempts = policy.max_retries + 1,
                    delay_ms = delay.as_millis() as u64,
                    "provider call failed, retrying: {e}"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
