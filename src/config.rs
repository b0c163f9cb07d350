//! Per-operation configuration.
//!
//! Each operation kind has its own options struct; nothing is inferred from
//! argument position. All configs are cheap to clone and carry their defaults
//! via `Default`.

use std::sync::Arc;

use crate::duration::Duration;
use crate::retry::{SharedRetryStrategy, WaitDecision};
use crate::serdes::SerDes;

/// Checkpointing discipline for a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepSemantics {
    /// Run first, checkpoint the outcome after. A crash between the run and
    /// the checkpoint re-runs the step on the next invocation.
    #[default]
    AtLeastOncePerRetry,
    /// Checkpoint STARTED before running. A crash after the start marker is
    /// surfaced as an interruption instead of silently re-running.
    AtMostOncePerRetry,
}

/// Options for a single step producing a value of type `T`.
pub struct StepConfig<T> {
    /// Checkpointing discipline
    pub semantics: StepSemantics,
    /// Retry strategy; `None` uses the default exponential backoff preset
    pub retry: Option<SharedRetryStrategy>,
    /// Codec for the step result; `None` uses JSON
    pub serdes: Option<Arc<dyn SerDes<T>>>,
}

impl<T> StepConfig<T> {
    /// Step config with at-most-once semantics.
    pub fn at_most_once() -> Self {
        Self {
            semantics: StepSemantics::AtMostOncePerRetry,
            ..Default::default()
        }
    }

    /// Sets the retry strategy.
    pub fn with_retry(mut self, retry: SharedRetryStrategy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Disables retries for this step.
    pub fn no_retry(mut self) -> Self {
        self.retry = Some(Arc::new(crate::retry::NoRetry));
        self
    }

    /// Sets a custom codec for the step result.
    pub fn with_serdes(mut self, serdes: Arc<dyn SerDes<T>>) -> Self {
        self.serdes = Some(serdes);
        self
    }
}

impl<T> Default for StepConfig<T> {
    fn default() -> Self {
        Self {
            semantics: StepSemantics::default(),
            retry: None,
            serdes: None,
        }
    }
}

impl<T> Clone for StepConfig<T> {
    fn clone(&self) -> Self {
        Self {
            semantics: self.semantics,
            retry: self.retry.clone(),
            serdes: self.serdes.clone(),
        }
    }
}

impl<T> std::fmt::Debug for StepConfig<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepConfig")
            .field("semantics", &self.semantics)
            .field("retry", &self.retry.as_ref().map(|_| "<strategy>"))
            .field("serdes", &self.serdes.as_ref().map(|_| "<codec>"))
            .finish()
    }
}

/// Options for callback creation.
#[derive(Clone, Default)]
pub struct CallbackConfig {
    /// Overall deadline for the callback to complete
    pub timeout: Option<Duration>,
    /// Maximum silence between heartbeats before the callback fails
    pub heartbeat_timeout: Option<Duration>,
    /// Retry strategy for the submitter step in the submit-and-wait form
    pub submitter_retry: Option<SharedRetryStrategy>,
}

impl CallbackConfig {
    /// Sets the overall timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the heartbeat timeout.
    pub fn with_heartbeat_timeout(mut self, heartbeat_timeout: Duration) -> Self {
        self.heartbeat_timeout = Some(heartbeat_timeout);
        self
    }

    /// Sets the submitter retry strategy.
    pub fn with_submitter_retry(mut self, retry: SharedRetryStrategy) -> Self {
        self.submitter_retry = Some(retry);
        self
    }
}

impl std::fmt::Debug for CallbackConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackConfig")
            .field("timeout", &self.timeout)
            .field("heartbeat_timeout", &self.heartbeat_timeout)
            .finish()
    }
}

/// When a concurrent operation may return before all branches settle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionConfig {
    /// Return once this many branches succeeded
    pub min_successful: Option<usize>,
    /// Fail once more than this many branches failed
    pub tolerated_failure_count: Option<usize>,
    /// Fail once the failure ratio exceeds this percentage (0-100)
    pub tolerated_failure_percentage: Option<f64>,
}

impl CompletionConfig {
    /// Wait for every branch; failures are tolerated and reported.
    pub fn all_completed() -> Self {
        Self::default()
    }

    /// Wait for every branch; the first failure fails the whole operation.
    pub fn all_successful() -> Self {
        Self {
            tolerated_failure_count: Some(0),
            ..Default::default()
        }
    }

    /// Return as soon as one branch succeeds.
    pub fn first_successful() -> Self {
        Self {
            min_successful: Some(1),
            ..Default::default()
        }
    }

    /// Sets the minimum successful count.
    pub fn with_min_successful(mut self, count: usize) -> Self {
        self.min_successful = Some(count);
        self
    }

    /// Sets the tolerated failure count.
    pub fn with_tolerated_failure_count(mut self, count: usize) -> Self {
        self.tolerated_failure_count = Some(count);
        self
    }

    /// Sets the tolerated failure percentage.
    pub fn with_tolerated_failure_percentage(mut self, percentage: f64) -> Self {
        self.tolerated_failure_percentage = Some(percentage);
        self
    }
}

/// Options for `map`.
#[derive(Debug, Clone)]
pub struct MapConfig {
    /// Maximum items executing at once; `None` means unbounded
    pub max_concurrency: Option<usize>,
    /// Early-completion policy
    pub completion: CompletionConfig,
    /// How often orphaned items force a checkpoint flush after early return
    pub orphan_poll_interval: std::time::Duration,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            max_concurrency: None,
            completion: CompletionConfig::all_completed(),
            orphan_poll_interval: std::time::Duration::from_secs(1),
        }
    }
}

impl MapConfig {
    /// Sets the concurrency bound.
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = Some(max_concurrency);
        self
    }

    /// Sets the completion policy.
    pub fn with_completion(mut self, completion: CompletionConfig) -> Self {
        self.completion = completion;
        self
    }
}

/// Options for `parallel`.
#[derive(Debug, Clone)]
pub struct ParallelConfig {
    /// Maximum branches executing at once; `None` means unbounded
    pub max_concurrency: Option<usize>,
    /// Early-completion policy
    pub completion: CompletionConfig,
    /// How often orphaned branches force a checkpoint flush after early return
    pub orphan_poll_interval: std::time::Duration,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            max_concurrency: None,
            completion: CompletionConfig::all_completed(),
            orphan_poll_interval: std::time::Duration::from_secs(1),
        }
    }
}

impl ParallelConfig {
    /// Sets the concurrency bound.
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = Some(max_concurrency);
        self
    }

    /// Sets the completion policy.
    pub fn with_completion(mut self, completion: CompletionConfig) -> Self {
        self.completion = completion;
        self
    }
}

/// Options for a wait-for-condition polling loop.
///
/// The wait strategy alone bounds the loop; there is no hidden attempt cap.
#[derive(Clone)]
pub struct WaitForConditionConfig<S> {
    /// State handed to the first poll
    pub initial_state: S,
    /// Decides, from the latest state and attempt count, whether to poll again
    pub wait_strategy: Arc<dyn Fn(&S, u32) -> WaitDecision + Send + Sync>,
    /// Retry strategy for failures thrown by the check itself
    pub check_retry: Option<SharedRetryStrategy>,
}

impl<S> WaitForConditionConfig<S> {
    /// Creates a config with the given initial state and wait strategy.
    pub fn new(
        initial_state: S,
        wait_strategy: impl Fn(&S, u32) -> WaitDecision + Send + Sync + 'static,
    ) -> Self {
        Self {
            initial_state,
            wait_strategy: Arc::new(wait_strategy),
            check_retry: None,
        }
    }

    /// Sets the retry strategy for check failures.
    pub fn with_check_retry(mut self, retry: SharedRetryStrategy) -> Self {
        self.check_retry = Some(retry);
        self
    }
}

impl<S> std::fmt::Debug for WaitForConditionConfig<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitForConditionConfig").finish_non_exhaustive()
    }
}
