//! Bounded exponential backoff around a fallible async attempt.

use crate::config::RetryConfig;
use crate::error::ChatError;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Delay after the failed attempt `attempt` (0-based): `min(base * 2^attempt, max)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[derive(Debug, Clone)]
pub struct RetryController {
    policy: RetryPolicy,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `thunk` up to `max_retries + 1` times, sleeping between failures.
    /// `max_retries` overrides the policy's bound for this call. On exhaustion the last error
    /// is returned as-is.
    pub async fn run<T, F, Fut>(&self, mut thunk: F, max_retries: Option<u32>) -> Result<T, ChatError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ChatError>>,
    {
        let max_retries = max_retries.unwrap_or(self.policy.max_retries);
        let mut attempt = 0;
        loop {
            match thunk().await {
                Ok(v) => {
                    if attempt > 0 {
                        log::info!("retry: succeeded on attempt {}", attempt + 1);
                    }
                    return Ok(v);
                }
                Err(e) if attempt < max_retries => {
                    let delay = self.policy.delay_for(attempt);
                    log::warn!(
                        "retry: attempt {}/{} failed ({}), retrying in {:?}",
                        attempt + 1,
                        max_retries + 1,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    log::warn!("retry: giving up after {} attempts: {}", attempt + 1, e);
                    return Err(e);
                }
            }
        }
    }
}
