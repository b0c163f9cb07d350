//! The step handler: replay-first execution of one checkpointed unit of work.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::{StepConfig, StepSemantics};
use crate::error::{ErrorObject, TerminationReason, WorkflowError};
use crate::identity::OperationIdentifier;
use crate::operation::{OperationType, OperationUpdate};
use crate::retry::{default_retry_strategy, RetryDecision, SharedRetryStrategy};
use crate::serdes::{from_durable, to_durable, SerDes};
use crate::state::ExecutionState;

fn encode<T: Serialize>(
    serdes: &Option<Arc<dyn SerDes<T>>>,
    value: &T,
) -> Result<String, WorkflowError> {
    match serdes {
        Some(codec) => codec.serialize(value),
        None => to_durable(value),
    }
}

fn decode<T: DeserializeOwned>(
    serdes: &Option<Arc<dyn SerDes<T>>>,
    data: Option<&str>,
) -> Result<T, WorkflowError> {
    match serdes {
        Some(codec) => codec.deserialize(data.unwrap_or("null")),
        None => from_durable(data),
    }
}

/// Execution-time information handed to a step closure.
#[derive(Debug, Clone, Copy)]
pub struct StepContext {
    /// Zero-based attempt counter for this step
    pub attempt: u32,
}

/// Boxed error type accepted from user step closures.
pub type UserError = Box<dyn std::error::Error + Send + Sync>;

/// Runs one step with replay, retry, and checkpointing.
///
/// A cached SUCCEEDED record short-circuits to the stored result without
/// executing the closure; a cached FAILED record rethrows the stored error.
/// With at-most-once semantics a STARTED marker carrying the attempt number
/// is made durable before the closure runs; replaying a marker for the
/// current attempt is treated as an interruption rather than silently
/// re-running, while a marker left over from an interrupted earlier attempt
/// means the retry was granted and the closure runs once for it.
pub async fn step_handler<T, F>(
    state: &Arc<ExecutionState>,
    id: &OperationIdentifier,
    config: &StepConfig<T>,
    func: F,
) -> Result<T, WorkflowError>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce(StepContext) -> Result<T, UserError>,
{
    let cached = state.lookup(&id.operation_id).await;
    cached.ensure_type(OperationType::Step, None)?;

    if cached.is_succeeded() {
        tracing::debug!(operation_id = %id.operation_id, "step replayed from cache");
        return decode(&config.serdes, cached.result());
    }
    if cached.is_failed() {
        let error = cached
            .error()
            .map(WorkflowError::from)
            .unwrap_or_else(|| WorkflowError::user_code("step failed"));
        return Err(error);
    }

    let attempt = cached.attempt();
    let retry = config.retry.clone().unwrap_or_else(default_retry_strategy);

    if config.semantics == StepSemantics::AtMostOncePerRetry {
        let marked_attempt: Option<u32> = cached.payload().and_then(|p| p.parse().ok());
        if cached.is_started() && marked_attempt == Some(attempt) {
            // The previous invocation started this attempt and never finished.
            let error = ErrorObject::interrupted(&id.operation_id);
            return fail_or_retry(state, id, &retry, error, attempt, true).await;
        }
        // Mark the current attempt before running it.
        let update = OperationUpdate::start(&id.operation_id, OperationType::Step)
            .with_parent(id.parent_id.clone())
            .with_name(id.name.clone())
            .with_payload(Some(attempt.to_string()));
        state.checkpoint(update).await?;
    }

    match func(StepContext { attempt }) {
        Ok(value) => {
            let serialized = match encode(&config.serdes, &value) {
                Ok(serialized) => serialized,
                Err(error) => {
                    // A result that cannot be made durable can never replay.
                    state
                        .termination()
                        .request(TerminationReason::SerializationError);
                    return Err(error);
                }
            };
            let update = OperationUpdate::succeed(
                &id.operation_id,
                OperationType::Step,
                Some(serialized),
            )
            .with_parent(id.parent_id.clone())
            .with_name(id.name.clone());
            state.checkpoint(update).await?;
            Ok(value)
        }
        Err(user_error) => {
            let error = ErrorObject::from_user_error(user_error.as_ref());
            fail_or_retry(state, id, &retry, error, attempt, false).await
        }
    }
}

/// Consults the retry strategy for a failed attempt and checkpoints the verdict.
///
/// A retry checkpoints RETRY with the delay and suspends the invocation; an
/// exhausted strategy checkpoints FAILED exactly once and rethrows.
async fn fail_or_retry<T>(
    state: &Arc<ExecutionState>,
    id: &OperationIdentifier,
    retry: &SharedRetryStrategy,
    error: ErrorObject,
    attempt: u32,
    interrupted: bool,
) -> Result<T, WorkflowError> {
    match retry.decide(&error, attempt) {
        RetryDecision::Retry { delay } => {
            tracing::debug!(
                operation_id = %id.operation_id,
                attempt,
                delay_seconds = delay.as_secs(),
                "step attempt failed, retry scheduled"
            );
            let update =
                OperationUpdate::retry(&id.operation_id, OperationType::Step, delay.as_secs())
                    .with_parent(id.parent_id.clone())
                    .with_name(id.name.clone());
            state.checkpoint(update).await?;
            state.termination().request(TerminationReason::RetryScheduled);
            Err(WorkflowError::suspended(TerminationReason::RetryScheduled))
        }
        RetryDecision::Stop => {
            tracing::debug!(
                operation_id = %id.operation_id,
                attempt,
                error_type = %error.error_type,
                "step failed permanently"
            );
            let update =
                OperationUpdate::fail(&id.operation_id, OperationType::Step, error.clone())
                    .with_parent(id.parent_id.clone())
                    .with_name(id.name.clone());
            state.checkpoint(update).await?;
            if interrupted {
                Err(WorkflowError::Interrupted {
                    operation_id: id.operation_id.clone(),
                })
            } else {
                Err((&error).into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::identity::Scope;
    use crate::operation::{Operation, OperationAction, OperationStatus};
    use crate::retry::NoRetry;

    fn fixture(history: Vec<Operation>) -> (Arc<InMemoryBackend>, Arc<ExecutionState>) {
        let backend = Arc::new(InMemoryBackend::new());
        let state = ExecutionState::new(backend.clone(), "arn:test", "token-0", history);
        (backend, state)
    }

    fn step_id(name: &str) -> OperationIdentifier {
        Scope::root().resolve(Some(name))
    }

    #[tokio::test]
    async fn test_success_checkpoints_result() {
        let (backend, state) = fixture(vec![]);
        let id = step_id("charge");
        let result: u32 = step_handler(&state, &id, &StepConfig::default(), |_| Ok(41 + 1))
            .await
            .unwrap();
        assert_eq!(result, 42);

        let record = backend.record(&id.operation_id).unwrap();
        assert_eq!(record.status, OperationStatus::Succeeded);
        assert_eq!(record.result.as_deref(), Some("42"));
        // At-least-once: no separate START checkpoint.
        assert_eq!(backend.updates().len(), 1);
    }

    #[tokio::test]
    async fn test_replay_skips_execution() {
        let (_, state) = fixture(vec![]);
        let id = step_id("charge");
        let _: u32 = step_handler(&state, &id, &StepConfig::default(), |_| Ok(1))
            .await
            .unwrap();

        let result: u32 = step_handler(&state, &id, &StepConfig::default(), |_| {
            panic!("closure must not run on replay")
        })
        .await
        .unwrap();
        assert_eq!(result, 1);
    }

    #[tokio::test]
    async fn test_cached_failure_rethrows() {
        let mut failed = Operation::started("x", OperationType::Step, None);
        failed.status = OperationStatus::Failed;
        failed.error = Some(ErrorObject::new("PaymentDeclined", "card expired"));
        let id = OperationIdentifier {
            operation_id: "x".to_string(),
            parent_id: None,
            name: None,
        };
        let (_, state) = fixture(vec![failed]);
        let result: Result<u32, _> = step_handler(&state, &id, &StepConfig::default(), |_| {
            panic!("closure must not run")
        })
        .await;
        match result {
            Err(WorkflowError::UserCode { error_type, .. }) => {
                assert_eq!(error_type, "PaymentDeclined");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_no_retry_checkpoints_failed_without_retry_action() {
        let (backend, state) = fixture(vec![]);
        let id = step_id("charge");
        let config = StepConfig::default().no_retry();
        let result: Result<u32, _> =
            step_handler(&state, &id, &config, |_| Err("declined".into())).await;
        assert!(matches!(result, Err(WorkflowError::UserCode { .. })));

        let actions: Vec<OperationAction> =
            backend.updates().iter().map(|u| u.action).collect();
        assert_eq!(actions, vec![OperationAction::Fail]);
    }

    #[tokio::test]
    async fn test_retryable_failure_schedules_retry_and_suspends() {
        let (backend, state) = fixture(vec![]);
        let id = step_id("charge");
        let result: Result<u32, _> =
            step_handler(&state, &id, &StepConfig::default(), |_| Err("flaky".into())).await;
        assert!(matches!(
            result,
            Err(WorkflowError::Suspended {
                reason: TerminationReason::RetryScheduled
            })
        ));
        assert_eq!(
            state.termination().reason(),
            Some(TerminationReason::RetryScheduled)
        );

        let updates = backend.updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].action, OperationAction::Retry);
        assert!(updates[0].step_options.is_some());
        assert_eq!(backend.record(&id.operation_id).unwrap().attempt, 1);
    }

    #[tokio::test]
    async fn test_attempt_counter_reaches_closure() {
        let mut started = Operation::started("y", OperationType::Step, None);
        started.attempt = 2;
        let id = OperationIdentifier {
            operation_id: "y".to_string(),
            parent_id: None,
            name: None,
        };
        let (_, state) = fixture(vec![started]);
        let seen: u32 = step_handler(&state, &id, &StepConfig::default(), |step| {
            Ok(step.attempt)
        })
        .await
        .unwrap();
        assert_eq!(seen, 2);
    }

    #[tokio::test]
    async fn test_at_most_once_checkpoints_start_first() {
        let (backend, state) = fixture(vec![]);
        let id = step_id("send-email");
        let _: () = step_handler(&state, &id, &StepConfig::at_most_once(), |_| Ok(()))
            .await
            .unwrap();
        let updates = backend.updates();
        let actions: Vec<OperationAction> = updates.iter().map(|u| u.action).collect();
        assert_eq!(actions, vec![OperationAction::Start, OperationAction::Succeed]);
        // The marker records which attempt the closure ran under.
        assert_eq!(updates[0].payload.as_deref(), Some("0"));
    }

    #[tokio::test]
    async fn test_at_most_once_started_replay_is_interrupted() {
        let mut started = Operation::started("z", OperationType::Step, None);
        started.payload = Some("0".to_string());
        let id = OperationIdentifier {
            operation_id: "z".to_string(),
            parent_id: None,
            name: None,
        };
        let (backend, state) = fixture(vec![started]);
        let config = StepConfig::at_most_once().with_retry(Arc::new(NoRetry));
        let result: Result<u32, _> = step_handler(&state, &id, &config, |_| {
            panic!("interrupted step must not re-run")
        })
        .await;
        assert!(matches!(result, Err(WorkflowError::Interrupted { .. })));

        let record = backend.record("z").unwrap();
        assert_eq!(record.status, OperationStatus::Failed);
        assert_eq!(
            record.error.unwrap().error_type,
            "StepInterruptedError"
        );
    }

    #[tokio::test]
    async fn test_at_most_once_interruption_can_retry() {
        let mut started = Operation::started("z", OperationType::Step, None);
        started.payload = Some("0".to_string());
        let id = OperationIdentifier {
            operation_id: "z".to_string(),
            parent_id: None,
            name: None,
        };
        let (backend, state) = fixture(vec![started]);
        let result: Result<u32, _> =
            step_handler(&state, &id, &StepConfig::at_most_once(), |_| {
                panic!("interrupted step must not re-run in the same invocation")
            })
            .await;
        assert!(matches!(result, Err(WorkflowError::Suspended { .. })));
        assert_eq!(backend.updates()[0].action, OperationAction::Retry);
    }

    #[tokio::test]
    async fn test_at_most_once_granted_retry_runs_closure() {
        // The interrupted attempt 0 already went through RETRY: the record is
        // STARTED at attempt 1 with no marker for it.
        let mut started = Operation::started("z", OperationType::Step, None);
        started.attempt = 1;
        let id = OperationIdentifier {
            operation_id: "z".to_string(),
            parent_id: None,
            name: None,
        };
        let (backend, state) = fixture(vec![started]);
        let result: u32 = step_handler(&state, &id, &StepConfig::at_most_once(), |step| {
            Ok(step.attempt)
        })
        .await
        .unwrap();
        assert_eq!(result, 1);

        let updates = backend.updates();
        let actions: Vec<OperationAction> = updates.iter().map(|u| u.action).collect();
        assert_eq!(actions, vec![OperationAction::Start, OperationAction::Succeed]);
        assert_eq!(updates[0].payload.as_deref(), Some("1"));
        assert_eq!(
            backend.record("z").unwrap().status,
            OperationStatus::Succeeded
        );
    }

    struct TaggedSerDes;

    impl SerDes<String> for TaggedSerDes {
        fn serialize(&self, value: &String) -> Result<String, WorkflowError> {
            Ok(format!("v1:{value}"))
        }

        fn deserialize(&self, data: &str) -> Result<String, WorkflowError> {
            data.strip_prefix("v1:")
                .map(str::to_string)
                .ok_or_else(|| WorkflowError::serde("missing version tag"))
        }
    }

    #[tokio::test]
    async fn test_custom_serdes_encodes_and_replays() {
        let (backend, state) = fixture(vec![]);
        let id = step_id("lookup");
        let config = StepConfig::default().with_serdes(Arc::new(TaggedSerDes));
        let first: String = step_handler(&state, &id, &config, |_| Ok("order".to_string()))
            .await
            .unwrap();
        assert_eq!(first, "order");
        assert_eq!(
            backend.record(&id.operation_id).unwrap().result.as_deref(),
            Some("v1:order")
        );

        let replayed: String = step_handler(&state, &id, &config, |_| {
            panic!("closure must not run on replay")
        })
        .await
        .unwrap();
        assert_eq!(replayed, "order");
    }

    #[tokio::test]
    async fn test_started_replay_reruns_with_at_least_once() {
        let started = Operation::started("w", OperationType::Step, None);
        let id = OperationIdentifier {
            operation_id: "w".to_string(),
            parent_id: None,
            name: None,
        };
        let (_, state) = fixture(vec![started]);
        let result: u32 = step_handler(&state, &id, &StepConfig::default(), |_| Ok(7))
            .await
            .unwrap();
        assert_eq!(result, 7);
    }

    #[tokio::test]
    async fn test_type_mismatch_is_non_deterministic() {
        let wait = Operation::started("m", OperationType::Wait, None);
        let id = OperationIdentifier {
            operation_id: "m".to_string(),
            parent_id: None,
            name: None,
        };
        let (_, state) = fixture(vec![wait]);
        let result: Result<u32, _> =
            step_handler(&state, &id, &StepConfig::default(), |_| Ok(1)).await;
        assert!(matches!(
            result,
            Err(WorkflowError::NonDeterministic { .. })
        ));
    }
}
