//! The wait-for-condition handler: a durable polling loop.
//!
//! Each poll is one invocation. The loop's state rides on the operation's
//! payload: a RETRY checkpoint carries the updated state and the delay until
//! the next poll, so the next invocation resumes the loop exactly where this
//! one left it.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::WaitForConditionConfig;
use crate::error::{ErrorObject, TerminationReason, WorkflowError};
use crate::handlers::step::UserError;
use crate::identity::OperationIdentifier;
use crate::operation::{OperationSubType, OperationType, OperationUpdate};
use crate::retry::{default_retry_strategy, RetryDecision, WaitDecision};
use crate::serdes::{from_durable, to_durable};
use crate::state::ExecutionState;

/// Runs one poll of a durable condition loop.
///
/// The check receives the latest checkpointed state and returns the next one;
/// the wait strategy then decides whether the loop is done or sleeps again.
/// There is no attempt cap beyond what the strategy imposes.
pub async fn wait_for_condition_handler<S, F>(
    state: &Arc<ExecutionState>,
    id: &OperationIdentifier,
    config: WaitForConditionConfig<S>,
    check: F,
) -> Result<S, WorkflowError>
where
    S: Serialize + DeserializeOwned,
    F: FnOnce(S) -> Result<S, UserError>,
{
    let cached = state.lookup(&id.operation_id).await;
    cached.ensure_type(OperationType::Step, Some(OperationSubType::WaitForCondition))?;

    if cached.is_succeeded() {
        tracing::debug!(operation_id = %id.operation_id, "condition already met, replayed");
        return from_durable(cached.result());
    }
    if cached.is_failed() {
        let error = cached
            .error()
            .map(WorkflowError::from)
            .unwrap_or_else(|| WorkflowError::user_code("condition check failed"));
        return Err(error);
    }

    let attempt = cached.attempt();
    let current: S = match cached.payload() {
        Some(payload) => from_durable(Some(payload))?,
        None => config.initial_state,
    };
    // Kept for the retry-after-failure checkpoint; the check consumes `current`.
    let current_serialized = to_durable(&current)?;

    if !cached.is_existent() {
        let update = OperationUpdate::start(&id.operation_id, OperationType::Step)
            .with_parent(id.parent_id.clone())
            .with_name(id.name.clone())
            .with_sub_type(OperationSubType::WaitForCondition);
        state.checkpoint(update).await?;
    }

    match check(current) {
        Ok(next) => match (config.wait_strategy)(&next, attempt) {
            WaitDecision::Continue { delay } => {
                let serialized = to_durable(&next)?;
                tracing::debug!(
                    operation_id = %id.operation_id,
                    attempt,
                    delay_seconds = delay.as_secs(),
                    "condition not met, next poll scheduled"
                );
                let update =
                    OperationUpdate::retry(&id.operation_id, OperationType::Step, delay.as_secs())
                        .with_parent(id.parent_id.clone())
                        .with_name(id.name.clone())
                        .with_sub_type(OperationSubType::WaitForCondition)
                        .with_payload(Some(serialized));
                state.checkpoint(update).await?;
                state
                    .termination()
                    .request(TerminationReason::ConditionPollScheduled);
                Err(WorkflowError::suspended(
                    TerminationReason::ConditionPollScheduled,
                ))
            }
            WaitDecision::Finish => {
                let serialized = to_durable(&next)?;
                let update = OperationUpdate::succeed(
                    &id.operation_id,
                    OperationType::Step,
                    Some(serialized),
                )
                .with_parent(id.parent_id.clone())
                .with_name(id.name.clone())
                .with_sub_type(OperationSubType::WaitForCondition);
                state.checkpoint(update).await?;
                Ok(next)
            }
        },
        Err(user_error) => {
            let error = ErrorObject::from_user_error(user_error.as_ref());
            let retry = config
                .check_retry
                .clone()
                .unwrap_or_else(default_retry_strategy);
            match retry.decide(&error, attempt) {
                RetryDecision::Retry { delay } => {
                    let update = OperationUpdate::retry(
                        &id.operation_id,
                        OperationType::Step,
                        delay.as_secs(),
                    )
                    .with_parent(id.parent_id.clone())
                    .with_name(id.name.clone())
                    .with_sub_type(OperationSubType::WaitForCondition)
                    .with_payload(Some(current_serialized));
                    state.checkpoint(update).await?;
                    state.termination().request(TerminationReason::RetryScheduled);
                    Err(WorkflowError::suspended(TerminationReason::RetryScheduled))
                }
                RetryDecision::Stop => {
                    let update =
                        OperationUpdate::fail(&id.operation_id, OperationType::Step, error.clone())
                            .with_parent(id.parent_id.clone())
                            .with_name(id.name.clone())
                            .with_sub_type(OperationSubType::WaitForCondition);
                    state.checkpoint(update).await?;
                    Err((&error).into())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::duration::Duration;
    use crate::identity::Scope;
    use crate::operation::{OperationAction, OperationStatus};
    use crate::retry::NoRetry;

    fn fixture() -> (Arc<InMemoryBackend>, Arc<ExecutionState>) {
        let backend = Arc::new(InMemoryBackend::new());
        let state = ExecutionState::new(backend.clone(), "arn:test", "token-0", vec![]);
        (backend, state)
    }

    fn poll_until(target: u32) -> WaitForConditionConfig<u32> {
        WaitForConditionConfig::new(0u32, move |count, _| {
            if *count >= target {
                WaitDecision::Finish
            } else {
                WaitDecision::Continue {
                    delay: Duration::from_secs(5),
                }
            }
        })
    }

    #[tokio::test]
    async fn test_unmet_condition_schedules_poll_with_state() {
        let (backend, state) = fixture();
        let id = Scope::root().resolve(Some("deploy-ready"));
        let result = wait_for_condition_handler(&state, &id, poll_until(3), |count| Ok(count + 1))
            .await;
        assert!(matches!(
            result,
            Err(WorkflowError::Suspended {
                reason: TerminationReason::ConditionPollScheduled
            })
        ));

        let updates = backend.updates();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].action, OperationAction::Start);
        assert_eq!(updates[1].action, OperationAction::Retry);
        assert_eq!(updates[1].payload.as_deref(), Some("1"));
        assert_eq!(
            updates[1].step_options.unwrap().next_attempt_delay_seconds,
            5
        );

        let record = backend.record(&id.operation_id).unwrap();
        assert_eq!(record.attempt, 1);
        assert_eq!(record.payload.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_next_poll_resumes_from_checkpointed_state() {
        let (backend, state) = fixture();
        let id = Scope::root().resolve(Some("deploy-ready"));
        let _ = wait_for_condition_handler(&state, &id, poll_until(2), |count| Ok(count + 1)).await;

        // Next invocation replays the record with payload "1".
        let state2 = ExecutionState::new(backend.clone(), "arn:test", "t", backend.records());
        let result =
            wait_for_condition_handler(&state2, &id, poll_until(2), |count| {
                assert_eq!(count, 1);
                Ok(count + 1)
            })
            .await
            .unwrap();
        assert_eq!(result, 2);
        assert_eq!(
            backend.record(&id.operation_id).unwrap().status,
            OperationStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn test_met_condition_succeeds_immediately() {
        let (backend, state) = fixture();
        let id = Scope::root().resolve(Some("deploy-ready"));
        let result = wait_for_condition_handler(&state, &id, poll_until(0), |count| Ok(count))
            .await
            .unwrap();
        assert_eq!(result, 0);
        let record = backend.record(&id.operation_id).unwrap();
        assert_eq!(record.status, OperationStatus::Succeeded);
        assert_eq!(record.sub_type, Some(OperationSubType::WaitForCondition));
    }

    #[tokio::test]
    async fn test_succeeded_loop_replays_final_state() {
        let (backend, state) = fixture();
        let id = Scope::root().resolve(Some("deploy-ready"));
        let _ = wait_for_condition_handler(&state, &id, poll_until(0), |c| Ok(c + 10))
            .await
            .unwrap();

        let state2 = ExecutionState::new(backend.clone(), "arn:test", "t", backend.records());
        let replayed = wait_for_condition_handler(&state2, &id, poll_until(0), |_| {
            panic!("check must not run on replay")
        })
        .await
        .unwrap();
        assert_eq!(replayed, 10);
    }

    #[tokio::test]
    async fn test_check_failure_without_retry_fails_loop() {
        let (backend, state) = fixture();
        let id = Scope::root().resolve(Some("deploy-ready"));
        let config = poll_until(3).with_check_retry(Arc::new(NoRetry));
        let result = wait_for_condition_handler(&state, &id, config, |_| {
            Err("poll endpoint 500".into())
        })
        .await;
        assert!(matches!(result, Err(WorkflowError::UserCode { .. })));
        assert_eq!(
            backend.record(&id.operation_id).unwrap().status,
            OperationStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_check_failure_with_retry_keeps_state() {
        let (backend, state) = fixture();
        let id = Scope::root().resolve(Some("deploy-ready"));
        let result = wait_for_condition_handler(&state, &id, poll_until(3), |_| {
            Err::<u32, _>("poll endpoint 500".into())
        })
        .await;
        assert!(matches!(
            result,
            Err(WorkflowError::Suspended {
                reason: TerminationReason::RetryScheduled
            })
        ));
        // The pre-failure state rides on the RETRY checkpoint.
        let record = backend.record(&id.operation_id).unwrap();
        assert_eq!(record.payload.as_deref(), Some("0"));
    }
}
