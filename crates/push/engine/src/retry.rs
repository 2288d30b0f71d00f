//! Retry policy for transient delivery failures.

use std::time::Duration;

use push_core::{DeliveryOutcome, FailureReason, RetryConfig};

/// What to do after an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryAction {
    /// The outcome is terminal.
    Stop(DeliveryOutcome),
    /// Attempt again after the delay.
    RetryAfter(Duration),
}

/// Decides whether a delivery attempt is retried, and when.
pub trait RetryPolicy: Send + Sync {
    /// Retries allowed after the first attempt.
    fn max_retry(&self) -> u32;

    /// Delay before retry number `retry_count + 1`.
    fn backoff(&self, retry_count: u32) -> Duration;

    /// Only retryable failures are retried, and only while `retry_count` is
    /// below [`RetryPolicy::max_retry`]. A retryable failure past the ceiling
    /// becomes `PermanentFailure(RetryExhausted)`.
    fn next_action(&self, outcome: DeliveryOutcome, retry_count: u32) -> RetryAction {
        match outcome {
            DeliveryOutcome::RetryableFailure { reason } => {
                if retry_count < self.max_retry() {
                    RetryAction::RetryAfter(self.backoff(retry_count))
                } else {
                    RetryAction::Stop(DeliveryOutcome::permanent(FailureReason::RetryExhausted {
                        attempts: retry_count + 1,
                        last: Box::new(reason),
                    }))
                }
            }
            terminal => RetryAction::Stop(terminal),
        }
    }
}

/// Bounded exponential backoff without jitter.
///
/// Delay for retry `n` (0-indexed) is `initial * multiplier^n`, capped at `max`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub max_retry: u32,
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: u32,
}

impl ExponentialBackoff {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retry: config.max_retry,
            initial: Duration::from_millis(config.initial_delay_ms),
            max: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier,
        }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn max_retry(&self) -> u32 {
        self.max_retry
    }

    fn backoff(&self, retry_count: u32) -> Duration {
        // Saturate instead of overflowing for large retry counts.
        let factor = self.multiplier.checked_pow(retry_count).unwrap_or(u32::MAX);
        self.initial
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

/// A policy with its retry ceiling lowered, used for per-notification overrides.
pub struct Capped<'a> {
    inner: &'a dyn RetryPolicy,
    max_retry: u32,
}

impl<'a> Capped<'a> {
    /// Cap `inner` at `limit` retries. The result never exceeds the inner ceiling.
    pub fn new(inner: &'a dyn RetryPolicy, limit: Option<u32>) -> Self {
        let max_retry = limit.map_or(inner.max_retry(), |l| l.min(inner.max_retry()));
        Self { inner, max_retry }
    }
}

impl RetryPolicy for Capped<'_> {
    fn max_retry(&self) -> u32 {
        self.max_retry
    }

    fn backoff(&self, retry_count: u32) -> Duration {
        self.inner.backoff(retry_count)
    }
}
