//! Retry strategies for steps and wait strategies for condition polling.
//!
//! A retry decision is consulted once per failed attempt; the delay it returns
//! is checkpointed and enforced by the backend across invocations, never
//! slept in-process.

use std::sync::Arc;

use rand::Rng;

use crate::duration::Duration;
use crate::error::ErrorObject;

/// Outcome of consulting a retry strategy after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another attempt after the delay.
    Retry {
        /// Delay before the next attempt
        delay: Duration,
    },
    /// Give up and record the failure.
    Stop,
}

/// Decides whether a failed step attempt should be retried.
pub trait RetryStrategy: Send + Sync {
    /// Consults the strategy for the given failure and zero-based attempt.
    fn decide(&self, error: &ErrorObject, attempt: u32) -> RetryDecision;
}

impl<F> RetryStrategy for F
where
    F: Fn(&ErrorObject, u32) -> RetryDecision + Send + Sync,
{
    fn decide(&self, error: &ErrorObject, attempt: u32) -> RetryDecision {
        self(error, attempt)
    }
}

/// Strategy that never retries.
pub struct NoRetry;

impl RetryStrategy for NoRetry {
    fn decide(&self, _error: &ErrorObject, _attempt: u32) -> RetryDecision {
        RetryDecision::Stop
    }
}

/// Exponential backoff with full jitter.
///
/// Attempt `n` draws a delay uniformly from `[0, min(max_delay,
/// initial_delay * multiplier^n)]`, stopping once `max_attempts` attempts
/// have failed.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Base delay for the first retry
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Growth factor per attempt
    pub multiplier: f64,
    /// Total attempts allowed, including the first
    pub max_attempts: u32,
    /// Whether to apply full jitter
    pub jitter: bool,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_minutes(5),
            multiplier: 2.0,
            max_attempts: 3,
            jitter: true,
        }
    }
}

impl ExponentialBackoff {
    /// The uncapped, unjittered delay for a zero-based attempt.
    fn base_delay_secs(&self, attempt: u32) -> u64 {
        let grown = (self.initial_delay.as_secs() as f64) * self.multiplier.powi(attempt as i32);
        let capped = grown.min(self.max_delay.as_secs() as f64);
        capped.max(0.0) as u64
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn decide(&self, _error: &ErrorObject, attempt: u32) -> RetryDecision {
        if attempt + 1 >= self.max_attempts {
            return RetryDecision::Stop;
        }
        let base = self.base_delay_secs(attempt);
        let secs = if self.jitter && base > 0 {
            rand::thread_rng().gen_range(0..=base)
        } else {
            base
        };
        RetryDecision::Retry {
            delay: Duration::from_secs(secs),
        }
    }
}

/// Shared handle to a retry strategy.
pub type SharedRetryStrategy = Arc<dyn RetryStrategy>;

/// The default strategy applied when a step config does not name one.
pub fn default_retry_strategy() -> SharedRetryStrategy {
    Arc::new(ExponentialBackoff::default())
}

/// Outcome of consulting a wait strategy between condition polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitDecision {
    /// Poll again after the delay.
    Continue {
        /// Delay before the next poll
        delay: Duration,
    },
    /// Stop polling and return the current state.
    Finish,
}
