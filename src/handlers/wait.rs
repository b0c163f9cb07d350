//! The wait handler: durable timers that outlive the invocation.

use std::sync::Arc;

use crate::duration::Duration;
use crate::error::{TerminationReason, WorkflowError};
use crate::identity::OperationIdentifier;
use crate::operation::{OperationType, OperationUpdate};
use crate::state::ExecutionState;

/// Minimum wait the backend timer can represent.
const MIN_WAIT_SECONDS: u64 = 1;

/// Records a durable wait and suspends until the backend timer fires.
///
/// A SUCCEEDED replay means the delay already elapsed and the wait is a
/// no-op. A STARTED replay means the timer is still running; the invocation
/// suspends again without writing anything new.
pub async fn wait_handler(
    state: &Arc<ExecutionState>,
    id: &OperationIdentifier,
    duration: Duration,
) -> Result<(), WorkflowError> {
    if duration.as_secs() < MIN_WAIT_SECONDS {
        return Err(WorkflowError::validation(format!(
            "wait duration must be at least {MIN_WAIT_SECONDS} second, got {duration}"
        )));
    }

    let cached = state.lookup(&id.operation_id).await;
    cached.ensure_type(OperationType::Wait, None)?;

    if cached.is_succeeded() {
        tracing::debug!(operation_id = %id.operation_id, "wait already elapsed");
        return Ok(());
    }
    if cached.is_failed() {
        let error = cached
            .error()
            .map(WorkflowError::from)
            .unwrap_or_else(|| WorkflowError::user_code("wait failed"));
        return Err(error);
    }
    if cached.is_started() {
        state.termination().request(TerminationReason::WaitScheduled);
        return Err(WorkflowError::suspended(TerminationReason::WaitScheduled));
    }

    let update = OperationUpdate::start_wait(&id.operation_id, duration.as_secs())
        .with_parent(id.parent_id.clone())
        .with_name(id.name.clone());
    state.checkpoint(update).await?;
    tracing::debug!(
        operation_id = %id.operation_id,
        wait_seconds = duration.as_secs(),
        "wait scheduled, suspending"
    );
    state.termination().request(TerminationReason::WaitScheduled);
    Err(WorkflowError::suspended(TerminationReason::WaitScheduled))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::identity::Scope;
    use crate::operation::{Operation, OperationStatus};

    fn fixture(history: Vec<Operation>) -> (Arc<InMemoryBackend>, Arc<ExecutionState>) {
        let backend = Arc::new(InMemoryBackend::new());
        let state = ExecutionState::new(backend.clone(), "arn:test", "token-0", history);
        (backend, state)
    }

    #[tokio::test]
    async fn test_new_wait_checkpoints_and_suspends() {
        let (backend, state) = fixture(vec![]);
        let id = Scope::root().resolve(Some("cooldown"));
        let result = wait_handler(&state, &id, Duration::from_secs(60)).await;
        assert!(matches!(
            result,
            Err(WorkflowError::Suspended {
                reason: TerminationReason::WaitScheduled
            })
        ));

        let updates = backend.updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].wait_options.unwrap().wait_seconds, 60);
        assert!(state.termination().is_requested());
    }

    #[tokio::test]
    async fn test_elapsed_wait_is_noop() {
        let mut done = Operation::started("w", OperationType::Wait, None);
        done.status = OperationStatus::Succeeded;
        let id = OperationIdentifier {
            operation_id: "w".to_string(),
            parent_id: None,
            name: None,
        };
        let (backend, state) = fixture(vec![done]);
        wait_handler(&state, &id, Duration::from_secs(60)).await.unwrap();
        assert!(backend.updates().is_empty());
        assert!(!state.termination().is_requested());
    }

    #[tokio::test]
    async fn test_running_wait_suspends_without_new_checkpoint() {
        let running = Operation::started("w", OperationType::Wait, None);
        let id = OperationIdentifier {
            operation_id: "w".to_string(),
            parent_id: None,
            name: None,
        };
        let (backend, state) = fixture(vec![running]);
        let result = wait_handler(&state, &id, Duration::from_secs(60)).await;
        assert!(matches!(result, Err(WorkflowError::Suspended { .. })));
        assert!(backend.updates().is_empty());
    }

    #[tokio::test]
    async fn test_sub_second_wait_rejected() {
        let (backend, state) = fixture(vec![]);
        let id = Scope::root().resolve(None);
        let result = wait_handler(&state, &id, Duration::ZERO).await;
        assert!(matches!(result, Err(WorkflowError::Validation { .. })));
        assert!(backend.updates().is_empty());
    }
}
