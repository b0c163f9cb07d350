//! The concurrent executor behind `map` and `parallel`.
//!
//! Branches run as spawned tasks in child scopes, optionally behind a
//! semaphore. Settlements stream back to the executor, which re-evaluates the
//! completion policy after each one and may return before every branch
//! settles. Branches still in flight at that point are orphans: they keep
//! running and checkpointing for as long as the invocation lives, with a
//! keep-alive poller flushing the queue on a fixed cadence so their progress
//! becomes durable.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};

use crate::concurrency::{BatchItem, BatchResult, CompletionReason, ExecutionCounters};
use crate::config::CompletionConfig;
use crate::context::WorkflowContext;
use crate::error::{ErrorObject, TerminationReason, WorkflowError};
use crate::identity::{OperationIdentifier, Scope, CURRENT_SCOPE};
use crate::operation::{OperationSubType, OperationType, OperationUpdate};
use crate::serdes::{from_durable, to_durable};
use crate::state::ExecutionState;

/// One branch of a concurrent operation.
pub type BranchFn<U> =
    Box<dyn FnOnce(WorkflowContext) -> BoxFuture<'static, Result<U, WorkflowError>> + Send>;

/// Wraps a closure as a [`BranchFn`].
pub fn branch<U, F, Fut>(func: F) -> BranchFn<U>
where
    F: FnOnce(WorkflowContext) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<U, WorkflowError>> + Send + 'static,
{
    Box::new(move |ctx| Box::pin(func(ctx)))
}

/// Executor behavior shared by map and parallel.
pub struct ConcurrentOptions {
    /// Sub-type of the executor CONTEXT record
    pub executor_sub_type: OperationSubType,
    /// Sub-type of each branch CONTEXT record
    pub item_sub_type: OperationSubType,
    /// Maximum branches in flight at once
    pub max_concurrency: Option<usize>,
    /// Early-completion policy
    pub completion: CompletionConfig,
    /// Flush cadence while orphaned branches drain
    pub orphan_poll_interval: std::time::Duration,
}

enum BranchOutcome<U> {
    Success(U),
    Failure(ErrorObject),
    Suspended,
}

/// Runs branches concurrently and returns the policy-determined batch outcome.
pub async fn concurrent_handler<U>(
    state: &Arc<ExecutionState>,
    id: &OperationIdentifier,
    branches: Vec<BranchFn<U>>,
    options: ConcurrentOptions,
) -> Result<BatchResult<U>, WorkflowError>
where
    U: Serialize + DeserializeOwned + Send + 'static,
{
    let cached = state.lookup(&id.operation_id).await;
    cached.ensure_type(OperationType::Context, Some(options.executor_sub_type))?;

    if cached.is_succeeded() {
        tracing::debug!(operation_id = %id.operation_id, "concurrent operation replayed from cache");
        return from_durable(cached.result());
    }
    if cached.is_failed() {
        let error = cached
            .error()
            .map(WorkflowError::from)
            .unwrap_or_else(|| WorkflowError::user_code("concurrent operation failed"));
        return Err(error);
    }

    // The executor record goes durable before any branch record can.
    if !cached.is_existent() {
        let update = OperationUpdate::start(&id.operation_id, OperationType::Context)
            .with_parent(id.parent_id.clone())
            .with_name(id.name.clone())
            .with_sub_type(options.executor_sub_type);
        state.checkpoint(update).await?;
    }

    let total = branches.len();
    if total == 0 {
        let result = BatchResult::<U>::empty();
        finalize(state, id, &result).await?;
        return Ok(result);
    }

    let semaphore = options
        .max_concurrency
        .map(|limit| Arc::new(Semaphore::new(limit.max(1))));
    let counters = Arc::new(ExecutionCounters::new(total));
    let outstanding = Arc::new(AtomicUsize::new(total));
    let (settle_tx, mut settle_rx) = mpsc::unbounded_channel::<(usize, BranchOutcome<U>)>();

    let item_scope = Scope::child(id.operation_id.clone());
    for (index, branch_fn) in branches.into_iter().enumerate() {
        let item_id = item_scope.resolve_indexed(index);
        let state = state.clone();
        let semaphore = semaphore.clone();
        let outstanding = outstanding.clone();
        let settle_tx = settle_tx.clone();
        let item_sub_type = options.item_sub_type;
        tokio::spawn(CURRENT_SCOPE.scope(item_id.operation_id.clone(), async move {
            let _permit = match semaphore {
                Some(semaphore) => semaphore.acquire_owned().await.ok(),
                None => None,
            };
            let outcome = run_branch(&state, &item_id, item_sub_type, branch_fn).await;
            outstanding.fetch_sub(1, Ordering::SeqCst);
            let _ = settle_tx.send((index, outcome));
        }));
    }
    drop(settle_tx);

    let mut slots: Vec<BatchItem<U>> = (0..total).map(BatchItem::pending).collect();
    let mut reason: Option<CompletionReason> = None;
    while !counters.all_accounted_for() {
        let Some((index, outcome)) = settle_rx.recv().await else {
            break;
        };
        match outcome {
            BranchOutcome::Success(value) => {
                counters.record_success();
                slots[index] = BatchItem::succeeded(index, value);
            }
            BranchOutcome::Failure(error) => {
                counters.record_failure();
                slots[index] = BatchItem::failed(index, error);
            }
            BranchOutcome::Suspended => counters.record_suspension(),
        }
        if let Some(triggered) = counters.evaluate(&options.completion) {
            reason = Some(triggered);
            break;
        }
    }
    if reason.is_none() {
        reason = counters.evaluate(&options.completion);
    }

    let Some(reason) = reason else {
        // At least one branch suspended and the policy can no longer trigger
        // in this invocation; the whole operation suspends with it.
        let termination_reason = state
            .termination()
            .reason()
            .unwrap_or(TerminationReason::UnhandledError);
        return Err(WorkflowError::suspended(termination_reason));
    };

    if outstanding.load(Ordering::SeqCst) > 0 {
        tracing::debug!(
            operation_id = %id.operation_id,
            orphans = outstanding.load(Ordering::SeqCst),
            ?reason,
            "concurrent operation returning early, orphaned branches continue"
        );
        let state = state.clone();
        let poll_interval = options.orphan_poll_interval;
        tokio::spawn(async move {
            while outstanding.load(Ordering::SeqCst) > 0 {
                tokio::time::sleep(poll_interval).await;
                if state.flush().await.is_err() {
                    break;
                }
            }
        });
    }

    let result = BatchResult::new(slots, reason);
    finalize(state, id, &result).await?;
    Ok(result)
}

/// Checkpoints the executor's terminal SUCCEED with the serialized batch.
async fn finalize<U: Serialize>(
    state: &Arc<ExecutionState>,
    id: &OperationIdentifier,
    result: &BatchResult<U>,
) -> Result<(), WorkflowError> {
    let serialized = to_durable(result)?;
    let update =
        OperationUpdate::succeed(&id.operation_id, OperationType::Context, Some(serialized))
            .with_parent(id.parent_id.clone());
    state.checkpoint(update).await
}

/// Runs one branch in its child scope, replay-first.
async fn run_branch<U>(
    state: &Arc<ExecutionState>,
    item_id: &OperationIdentifier,
    item_sub_type: OperationSubType,
    branch_fn: BranchFn<U>,
) -> BranchOutcome<U>
where
    U: Serialize + DeserializeOwned + Send + 'static,
{
    let cached = state.lookup(&item_id.operation_id).await;
    if let Err(error) = cached.ensure_type(OperationType::Context, Some(item_sub_type)) {
        return BranchOutcome::Failure(ErrorObject::from(&error));
    }
    if cached.is_succeeded() {
        return match from_durable(cached.result()) {
            Ok(value) => BranchOutcome::Success(value),
            Err(error) => BranchOutcome::Failure(ErrorObject::from(&error)),
        };
    }
    if cached.is_failed() {
        let error = cached
            .error()
            .cloned()
            .unwrap_or_else(|| ErrorObject::new("BranchError", "branch failed"));
        return BranchOutcome::Failure(error);
    }

    if !cached.is_existent() {
        let update = OperationUpdate::start(&item_id.operation_id, OperationType::Context)
            .with_parent(item_id.parent_id.clone())
            .with_sub_type(item_sub_type);
        if state.checkpoint(update).await.is_err() {
            // Queue failure already requested fatal termination.
            return BranchOutcome::Suspended;
        }
    }

    let ctx = WorkflowContext::child_of(state.clone(), item_id.operation_id.clone());
    match branch_fn(ctx).await {
        Ok(value) => {
            let serialized = match to_durable(&value) {
                Ok(serialized) => serialized,
                Err(error) => {
                    state
                        .termination()
                        .request(TerminationReason::SerializationError);
                    return BranchOutcome::Failure(ErrorObject::from(&error));
                }
            };
            let update = OperationUpdate::succeed(
                &item_id.operation_id,
                OperationType::Context,
                Some(serialized),
            )
            .with_parent(item_id.parent_id.clone());
            if state.checkpoint(update).await.is_err() {
                return BranchOutcome::Suspended;
            }
            BranchOutcome::Success(value)
        }
        Err(error) if error.is_suspended() => BranchOutcome::Suspended,
        Err(error) if error.is_fatal() => {
            // The branch cannot settle and the execution must not be
            // re-invoked; make sure a non-resumable termination is on record.
            let reason = match &error {
                WorkflowError::Checkpoint { .. } => TerminationReason::CheckpointFailed,
                WorkflowError::Serde { .. } => TerminationReason::SerializationError,
                _ => TerminationReason::UnhandledError,
            };
            state.termination().request(reason);
            BranchOutcome::Suspended
        }
        Err(error) => {
            let error_obj = ErrorObject::from(&error);
            let update = OperationUpdate::fail(
                &item_id.operation_id,
                OperationType::Context,
                error_obj.clone(),
            )
            .with_parent(item_id.parent_id.clone());
            if state.checkpoint(update).await.is_err() {
                return BranchOutcome::Suspended;
            }
            BranchOutcome::Failure(error_obj)
        }
    }
}
