//! Promise combinators over in-flight durable operations.
//!
//! Each combinator is itself a durable STEP: once its outcome is
//! checkpointed, replay returns the cached value without re-driving the
//! member futures. Futures that lose a race keep running in a detached task
//! so their own checkpoints still land.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::concurrency::BatchItem;
use crate::error::{ErrorObject, WorkflowError};
use crate::identity::OperationIdentifier;
use crate::operation::{OperationType, OperationUpdate};
use crate::serdes::{from_durable, to_durable};
use crate::state::ExecutionState;

/// A member future of a combinator.
pub type PromiseFuture<T> = BoxFuture<'static, Result<T, WorkflowError>>;

type Settling<T> = FuturesUnordered<BoxFuture<'static, (usize, Result<T, WorkflowError>)>>;

fn indexed<T>(futures: Vec<PromiseFuture<T>>) -> Settling<T>
where
    T: Send + 'static,
{
    futures
        .into_iter()
        .enumerate()
        .map(|(index, fut)| {
            let boxed: BoxFuture<'static, (usize, Result<T, WorkflowError>)> =
                Box::pin(async move { (index, fut.await) });
            boxed
        })
        .collect()
}

/// Drives the remaining futures to completion off the combinator's task.
///
/// Losers are usually durable operations mid-checkpoint; abandoning them
/// would drop writes that the next invocation expects to replay.
fn drain_in_background<T>(mut pending: Settling<T>)
where
    T: Send + 'static,
{
    if pending.is_empty() {
        return;
    }
    tokio::spawn(async move { while pending.next().await.is_some() {} });
}

/// Replay-or-run wrapper shared by every combinator.
async fn combinator_step<T, Fut>(
    state: &Arc<ExecutionState>,
    id: &OperationIdentifier,
    fan_in: Fut,
) -> Result<T, WorkflowError>
where
    T: Serialize + DeserializeOwned,
    Fut: std::future::Future<Output = Result<T, WorkflowError>>,
{
    let cached = state.lookup(&id.operation_id).await;
    cached.ensure_type(OperationType::Step, None)?;

    if cached.is_succeeded() {
        tracing::debug!(operation_id = %id.operation_id, "combinator replayed from cache");
        return from_durable(cached.result());
    }
    if cached.is_failed() {
        let error = cached
            .error()
            .map(WorkflowError::from)
            .unwrap_or_else(|| WorkflowError::user_code("combinator failed"));
        return Err(error);
    }

    match fan_in.await {
        Ok(value) => {
            let serialized = to_durable(&value)?;
            let update =
                OperationUpdate::succeed(&id.operation_id, OperationType::Step, Some(serialized))
                    .with_parent(id.parent_id.clone())
                    .with_name(id.name.clone());
            state.checkpoint(update).await?;
            Ok(value)
        }
        Err(error) if error.is_suspended() || error.is_fatal() => Err(error),
        Err(error) => {
            let update = OperationUpdate::fail(
                &id.operation_id,
                OperationType::Step,
                ErrorObject::from(&error),
            )
            .with_parent(id.parent_id.clone())
            .with_name(id.name.clone());
            state.checkpoint(update).await?;
            Err(error)
        }
    }
}

/// Resolves when every future succeeds; rejects on the first failure.
pub async fn all_handler<T>(
    state: &Arc<ExecutionState>,
    id: &OperationIdentifier,
    futures: Vec<PromiseFuture<T>>,
) -> Result<Vec<T>, WorkflowError>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    let total = futures.len();
    combinator_step(state, id, async move {
        let mut pending = indexed(futures);
        let mut slots: Vec<Option<T>> = (0..total).map(|_| None).collect();
        while let Some((index, outcome)) = pending.next().await {
            match outcome {
                Ok(value) => slots[index] = Some(value),
                Err(error) => {
                    drain_in_background(pending);
                    return Err(error);
                }
            }
        }
        Ok(slots.into_iter().flatten().collect())
    })
    .await
}

/// Settles with the first future to settle, success or failure.
///
/// A member that suspends has not settled; it is set aside so a member that
/// can settle this invocation still wins. Only when every member suspends
/// does the race itself suspend.
pub async fn race_handler<T>(
    state: &Arc<ExecutionState>,
    id: &OperationIdentifier,
    futures: Vec<PromiseFuture<T>>,
) -> Result<T, WorkflowError>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    combinator_step(state, id, async move {
        let mut pending = indexed(futures);
        if pending.is_empty() {
            return Err(WorkflowError::validation("race requires at least one future"));
        }
        let mut suspension: Option<WorkflowError> = None;
        while let Some((_, outcome)) = pending.next().await {
            match outcome {
                Err(error) if error.is_suspended() => {
                    suspension.get_or_insert(error);
                }
                outcome => {
                    drain_in_background(pending);
                    return outcome;
                }
            }
        }
        Err(suspension
            .unwrap_or_else(|| WorkflowError::validation("race requires at least one future")))
    })
    .await
}

/// Resolves with the first success; rejects only once every future failed.
pub async fn any_handler<T>(
    state: &Arc<ExecutionState>,
    id: &OperationIdentifier,
    futures: Vec<PromiseFuture<T>>,
) -> Result<T, WorkflowError>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    combinator_step(state, id, async move {
        let mut pending = indexed(futures);
        if pending.is_empty() {
            return Err(WorkflowError::validation("any requires at least one future"));
        }
        let mut suspension: Option<WorkflowError> = None;
        let mut errors: Vec<String> = Vec::new();
        while let Some((_, outcome)) = pending.next().await {
            match outcome {
                Ok(value) => {
                    drain_in_background(pending);
                    return Ok(value);
                }
                Err(error) if error.is_fatal() => {
                    drain_in_background(pending);
                    return Err(error);
                }
                // A suspended member might still be beaten by a success.
                Err(error) if error.is_suspended() => {
                    suspension.get_or_insert(error);
                }
                Err(error) => errors.push(error.to_string()),
            }
        }
        if let Some(suspension) = suspension {
            return Err(suspension);
        }
        Err(WorkflowError::UserCode {
            message: format!("all futures rejected: {}", errors.join("; ")),
            error_type: "AggregateError".to_string(),
            stack_trace: None,
        })
    })
    .await
}

/// Waits for every future to settle and reports each outcome.
pub async fn all_settled_handler<T>(
    state: &Arc<ExecutionState>,
    id: &OperationIdentifier,
    futures: Vec<PromiseFuture<T>>,
) -> Result<Vec<BatchItem<T>>, WorkflowError>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    let total = futures.len();
    combinator_step(state, id, async move {
        let mut pending = indexed(futures);
        let mut slots: Vec<BatchItem<T>> = (0..total).map(BatchItem::pending).collect();
        while let Some((index, outcome)) = pending.next().await {
            match outcome {
                Ok(value) => slots[index] = BatchItem::succeeded(index, value),
                Err(error) if error.is_suspended() || error.is_fatal() => {
                    drain_in_background(pending);
                    return Err(error);
                }
                Err(error) => slots[index] = BatchItem::failed(index, ErrorObject::from(&error)),
            }
        }
        Ok(slots)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::concurrency::BatchItemStatus;
    use crate::error::TerminationReason;
    use crate::identity::Scope;
    use crate::operation::OperationStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;

    fn fixture() -> (Arc<InMemoryBackend>, Arc<ExecutionState>) {
        let backend = Arc::new(InMemoryBackend::new());
        let state = ExecutionState::new(backend.clone(), "arn:test", "token-0", vec![]);
        (backend, state)
    }

    fn ready(value: u32) -> PromiseFuture<u32> {
        Box::pin(async move { Ok(value) })
    }

    fn slow(value: u32, millis: u64) -> PromiseFuture<u32> {
        Box::pin(async move {
            tokio::time::sleep(StdDuration::from_millis(millis)).await;
            Ok(value)
        })
    }

    fn failing(message: &str) -> PromiseFuture<u32> {
        let message = message.to_string();
        Box::pin(async move { Err(WorkflowError::user_code(message)) })
    }

    #[tokio::test]
    async fn test_all_preserves_input_order() {
        let (backend, state) = fixture();
        let id = Scope::root().resolve(Some("gather"));
        let result = all_handler(&state, &id, vec![slow(1, 20), ready(2), slow(3, 5)])
            .await
            .unwrap();
        assert_eq!(result, vec![1, 2, 3]);
        assert_eq!(
            backend.record(&id.operation_id).unwrap().status,
            OperationStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn test_all_rejects_on_first_failure() {
        let (backend, state) = fixture();
        let id = Scope::root().resolve(Some("gather"));
        let result = all_handler(&state, &id, vec![slow(1, 50), failing("boom")]).await;
        assert!(matches!(result, Err(WorkflowError::UserCode { .. })));
        assert_eq!(
            backend.record(&id.operation_id).unwrap().status,
            OperationStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_all_replays_without_redriving() {
        let (_, state) = fixture();
        let id = Scope::root().resolve(Some("gather"));
        let _ = all_handler(&state, &id, vec![ready(1), ready(2)]).await.unwrap();

        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let poisoned: PromiseFuture<u32> = Box::pin(async move {
            ran2.fetch_add(1, Ordering::SeqCst);
            Ok(0)
        });
        let replayed = all_handler(&state, &id, vec![poisoned, ready(9)]).await.unwrap();
        assert_eq!(replayed, vec![1, 2]);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_race_first_settlement_wins() {
        let (_, state) = fixture();
        let id = Scope::root().resolve(Some("first"));
        let result = race_handler(&state, &id, vec![slow(1, 80), ready(2)]).await.unwrap();
        assert_eq!(result, 2);
    }

    #[tokio::test]
    async fn test_race_loser_keeps_running() {
        let (backend, state) = fixture();
        let id = Scope::root().resolve(Some("first"));
        let loser_id = Scope::root().resolve(Some("loser-step"));
        let loser_state = state.clone();
        let loser_idc = loser_id.clone();
        let loser: PromiseFuture<u32> = Box::pin(async move {
            tokio::time::sleep(StdDuration::from_millis(30)).await;
            crate::handlers::step::step_handler(
                &loser_state,
                &loser_idc,
                &crate::config::StepConfig::default().no_retry(),
                |_| Ok(7u32),
            )
            .await
        });
        let winner = race_handler(&state, &id, vec![loser, ready(1)]).await.unwrap();
        assert_eq!(winner, 1);

        // The loser's own checkpoint still lands after the race settled.
        tokio::time::sleep(StdDuration::from_millis(120)).await;
        state.flush().await.unwrap();
        assert_eq!(
            backend.record(&loser_id.operation_id).unwrap().status,
            OperationStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn test_race_prefers_settlement_over_suspension() {
        let (_, state) = fixture();
        let id = Scope::root().resolve(Some("first"));
        let suspended: PromiseFuture<u32> = Box::pin(async {
            Err(WorkflowError::suspended(TerminationReason::WaitScheduled))
        });
        let result = race_handler(&state, &id, vec![suspended, slow(3, 10)]).await.unwrap();
        assert_eq!(result, 3);
    }

    #[tokio::test]
    async fn test_race_suspends_when_every_member_suspends() {
        let (backend, state) = fixture();
        let id = Scope::root().resolve(Some("first"));
        let futures: Vec<PromiseFuture<u32>> = (0..2)
            .map(|_| {
                let fut: PromiseFuture<u32> = Box::pin(async {
                    Err(WorkflowError::suspended(TerminationReason::CallbackPending))
                });
                fut
            })
            .collect();
        let result = race_handler(&state, &id, futures).await;
        assert!(matches!(result, Err(WorkflowError::Suspended { .. })));
        assert!(backend.record(&id.operation_id).is_none());
    }

    #[tokio::test]
    async fn test_any_skips_failures() {
        let (_, state) = fixture();
        let id = Scope::root().resolve(Some("fallback"));
        let result = any_handler(&state, &id, vec![failing("a"), slow(5, 10)]).await.unwrap();
        assert_eq!(result, 5);
    }

    #[tokio::test]
    async fn test_any_aggregates_when_all_fail() {
        let (backend, state) = fixture();
        let id = Scope::root().resolve(Some("fallback"));
        let result = any_handler(&state, &id, vec![failing("a"), failing("b")]).await;
        match result {
            Err(WorkflowError::UserCode { error_type, .. }) => {
                assert_eq!(error_type, "AggregateError");
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(
            backend.record(&id.operation_id).unwrap().status,
            OperationStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_any_propagates_suspension_over_failures() {
        let (backend, state) = fixture();
        let id = Scope::root().resolve(Some("fallback"));
        let suspended: PromiseFuture<u32> = Box::pin(async {
            Err(WorkflowError::suspended(TerminationReason::WaitScheduled))
        });
        let result = any_handler(&state, &id, vec![failing("a"), suspended]).await;
        assert!(matches!(result, Err(WorkflowError::Suspended { .. })));
        // No terminal record: the combinator retries next invocation.
        assert!(backend.record(&id.operation_id).is_none());
    }

    #[tokio::test]
    async fn test_all_settled_reports_every_outcome() {
        let (_, state) = fixture();
        let id = Scope::root().resolve(Some("settle"));
        let result = all_settled_handler(&state, &id, vec![ready(1), failing("boom")])
            .await
            .unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].status, BatchItemStatus::Succeeded);
        assert_eq!(result[0].result, Some(1));
        assert_eq!(result[1].status, BatchItemStatus::Failed);
        assert_eq!(result[1].error.as_ref().unwrap().error_message, "boom");
    }

    #[tokio::test]
    async fn test_empty_all_resolves_immediately() {
        let (_, state) = fixture();
        let id = Scope::root().resolve(Some("gather"));
        let result = all_handler::<u32>(&state, &id, vec![]).await.unwrap();
        assert!(result.is_empty());
    }
}
