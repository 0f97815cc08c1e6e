//! Retry Logic
//!
//! One retry wrapper for every remote call. Transient failures back off
//! exponentially and consume the retry budget; rate-limit responses pause
//! for a cooldown and consume a separate pause budget.

use std::future::Future;
use std::time::Duration;
use wbsync_common::config::ApiConfig;

/// How the retry wrapper treats a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Transient failure: back off and retry, counts against `max_retries`
    Backoff,
    /// Rate limited: pause (server hint or configured cooldown) and retry the same request
    Cooldown(Option<Duration>),
    /// Permanent failure: return immediately
    Fail,
}

/// Errors the retry wrapper can classify and wrap on exhaustion
pub trait Retryable: Sized + std::fmt::Display {
    fn retry_decision(&self) -> RetryDecision;

    /// Wrap the last error once the transient retry budget is spent
    fn retries_exhausted(self, attempts: u32) -> Self;

    /// Wrap the last error once the rate-limit pause budget is spent
    fn cooldowns_exhausted(self, pauses: u32) -> Self;
}

/// Backoff policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry; doubled per further retry
    pub base_delay: Duration,
    /// Cap for a single backoff delay
    pub max_delay: Duration,
    /// Pause after a rate-limit response without a server hint
    pub rate_limit_cooldown: Duration,
    /// Rate-limit pauses tolerated before giving up
    pub max_rate_limit_pauses: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &ApiConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.backoff_base_ms),
            max_delay: Duration::from_millis(config.backoff_max_ms),
            rate_limit_cooldown: Duration::from_millis(config.rate_limit_cooldown_ms),
            max_rate_limit_pauses: config.max_rate_limit_pauses,
        }
    }

    /// Delay before retry number `retry` (1-based): base × 2^(retry-1), capped
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ApiConfig::default())
    }
}

/// Run `operation` until it succeeds, fails permanently, or a budget runs out
///
/// **Algorithm:**
/// 1. Attempt operation
/// 2. On success return the value
/// 3. On `Backoff`: if retries remain, sleep `backoff_for(n)` and retry,
///    otherwise return `retries_exhausted`
/// 4. On `Cooldown`: if pauses remain, sleep the cooldown and retry without
///    touching the retry counter, otherwise return `cooldowns_exhausted`
/// 5. On `Fail`: return the error unchanged
pub async fn retry_with_backoff<F, Fut, T, E>(
    operation_name: &str,
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable,
{
    let mut attempt = 0u32;
    let mut retries = 0u32;
    let mut pauses = 0u32;

    loop {
        attempt += 1;

        let err = match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt,
                        retries,
                        pauses,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        match err.retry_decision() {
            RetryDecision::Fail => return Err(err),
            RetryDecision::Backoff => {
                if retries >= policy.max_retries {
                    tracing::error!(
                        operation = operation_name,
                        attempt,
                        max_retries = policy.max_retries,
                        error = %err,
                        "Retry budget exhausted"
                    );
                    return Err(err.retries_exhausted(attempt));
                }
                retries += 1;
                let delay = policy.backoff_for(retries);
                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    backoff_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient failure, will retry after backoff"
                );
                tokio::time::sleep(delay).await;
            }
            RetryDecision::Cooldown(hint) => {
                if pauses >= policy.max_rate_limit_pauses {
                    tracing::error!(
                        operation = operation_name,
                        pauses,
                        "Rate-limit pause budget exhausted"
                    );
                    return Err(err.cooldowns_exhausted(pauses));
                }
                pauses += 1;
                let delay = hint.unwrap_or(policy.rate_limit_cooldown);
                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    cooldown_ms = delay.as_millis() as u64,
                    "Rate limited, pausing before retrying the same request"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
