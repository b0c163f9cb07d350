//! Branch accounting for concurrent operations.
//!
//! [`ExecutionCounters`] tracks settlements while branches run;
//! [`BatchResult`] is the durable, index-ordered outcome the executor
//! checkpoints and replays.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::CompletionConfig;
use crate::error::ErrorObject;

/// Why a concurrent operation returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompletionReason {
    /// Every branch settled
    AllCompleted,
    /// The configured minimum success count was reached
    MinSuccessfulReached,
    /// The failure tolerance was exceeded
    FailureToleranceExceeded,
}

/// Settlement state of one branch inside a [`BatchResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchItemStatus {
    /// Still running when the executor returned
    Pending,
    /// Settled with a result
    Succeeded,
    /// Settled with an error
    Failed,
}

/// One branch's slot in a [`BatchResult`], ordered by input index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem<T> {
    /// Position in the input
    pub index: usize,
    /// Settlement state
    pub status: BatchItemStatus,
    /// Result for succeeded branches
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<T>,
    /// Error for failed branches
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl<T> BatchItem<T> {
    /// A branch still in flight when the executor returned.
    pub fn pending(index: usize) -> Self {
        Self {
            index,
            status: BatchItemStatus::Pending,
            result: None,
            error: None,
        }
    }

    /// A settled, successful branch.
    pub fn succeeded(index: usize, result: T) -> Self {
        Self {
            index,
            status: BatchItemStatus::Succeeded,
            result: Some(result),
            error: None,
        }
    }

    /// A settled, failed branch.
    pub fn failed(index: usize, error: ErrorObject) -> Self {
        Self {
            index,
            status: BatchItemStatus::Failed,
            result: None,
            error: Some(error),
        }
    }
}

/// Durable outcome of a map or parallel operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult<T> {
    /// One slot per input, in input order
    pub items: Vec<BatchItem<T>>,
    /// Why the executor returned
    pub completion_reason: CompletionReason,
}

impl<T> BatchResult<T> {
    /// Creates a result over the given items.
    pub fn new(items: Vec<BatchItem<T>>, completion_reason: CompletionReason) -> Self {
        Self {
            items,
            completion_reason,
        }
    }

    /// The empty result: zero branches, trivially all completed.
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            completion_reason: CompletionReason::AllCompleted,
        }
    }

    /// Number of succeeded branches.
    pub fn success_count(&self) -> usize {
        self.items
            .iter()
            .filter(|i| i.status == BatchItemStatus::Succeeded)
            .count()
    }

    /// Number of failed branches.
    pub fn failure_count(&self) -> usize {
        self.items
            .iter()
            .filter(|i| i.status == BatchItemStatus::Failed)
            .count()
    }

    /// Number of branches still pending when the executor returned.
    pub fn pending_count(&self) -> usize {
        self.items
            .iter()
            .filter(|i| i.status == BatchItemStatus::Pending)
            .count()
    }

    /// Total number of branches.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if there were no branches.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Succeeded items, in input order.
    pub fn succeeded(&self) -> impl Iterator<Item = &BatchItem<T>> {
        self.items
            .iter()
            .filter(|i| i.status == BatchItemStatus::Succeeded)
    }

    /// Failed items, in input order.
    pub fn failed(&self) -> impl Iterator<Item = &BatchItem<T>> {
        self.items
            .iter()
            .filter(|i| i.status == BatchItemStatus::Failed)
    }

    /// References to the successful results, in input order.
    pub fn results(&self) -> Vec<&T> {
        self.succeeded().filter_map(|i| i.result.as_ref()).collect()
    }

    /// References to the recorded errors, in input order.
    pub fn errors(&self) -> Vec<&ErrorObject> {
        self.failed().filter_map(|i| i.error.as_ref()).collect()
    }
}

/// Live settlement counters for a running concurrent operation.
#[derive(Debug, Default)]
pub struct ExecutionCounters {
    total: usize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    suspended: AtomicUsize,
}

impl ExecutionCounters {
    /// Creates counters over `total` branches.
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    /// Records a successful settlement.
    pub fn record_success(&self) {
        self.succeeded.fetch_add(1, Ordering::SeqCst);
    }

    /// Records a failed settlement.
    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    /// Records a branch that suspended instead of settling.
    pub fn record_suspension(&self) {
        self.suspended.fetch_add(1, Ordering::SeqCst);
    }

    /// Succeeded settlements so far.
    pub fn succeeded(&self) -> usize {
        self.succeeded.load(Ordering::SeqCst)
    }

    /// Failed settlements so far.
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    /// Suspended branches so far.
    pub fn suspended(&self) -> usize {
        self.suspended.load(Ordering::SeqCst)
    }

    /// Total branches.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Returns true once every branch either settled or suspended.
    pub fn all_accounted_for(&self) -> bool {
        self.succeeded() + self.failed() + self.suspended() >= self.total
    }

    /// Evaluates the completion policy against the current counts.
    ///
    /// Checks run in a fixed order: failure tolerance first, then minimum
    /// success, then all-settled. A batch that crosses both thresholds at
    /// once therefore reports the failure, not the success.
    pub fn evaluate(&self, config: &CompletionConfig) -> Option<CompletionReason> {
        let succeeded = self.succeeded();
        let failed = self.failed();

        if let Some(tolerated) = config.tolerated_failure_count {
            if failed > tolerated {
                return Some(CompletionReason::FailureToleranceExceeded);
            }
        }
        if let Some(percentage) = config.tolerated_failure_percentage {
            if self.total > 0 {
                let ratio = (failed as f64) * 100.0 / (self.total as f64);
                if ratio > percentage {
                    return Some(CompletionReason::FailureToleranceExceeded);
                }
            }
        }

        if let Some(min_successful) = config.min_successful {
            if succeeded >= min_successful {
                return Some(CompletionReason::MinSuccessfulReached);
            }
        }

        if succeeded + failed >= self.total {
            return Some(CompletionReason::AllCompleted);
        }

        None
    }
}
