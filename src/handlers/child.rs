//! The child-context handler: a nested scope whose whole outcome is one
//! durable record.

use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::context::WorkflowContext;
use crate::error::{ErrorObject, WorkflowError};
use crate::identity::{OperationIdentifier, CURRENT_SCOPE};
use crate::operation::{OperationSubType, OperationType, OperationUpdate};
use crate::serdes::{from_durable, to_durable};
use crate::state::ExecutionState;

/// Runs a closure in its own durable scope.
///
/// The CONTEXT record replays like a step: a cached terminal outcome skips the
/// closure entirely, including every operation it would have declared. After
/// the terminal checkpoint the scope closes, so a leaked child handle can no
/// longer create durable state.
pub async fn child_handler<T, F, Fut>(
    state: &Arc<ExecutionState>,
    id: &OperationIdentifier,
    sub_type: Option<OperationSubType>,
    func: F,
) -> Result<T, WorkflowError>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce(WorkflowContext) -> Fut,
    Fut: Future<Output = Result<T, WorkflowError>>,
{
    let cached = state.lookup(&id.operation_id).await;
    cached.ensure_type(OperationType::Context, sub_type)?;

    if cached.is_succeeded() {
        tracing::debug!(operation_id = %id.operation_id, "child context replayed from cache");
        return from_durable(cached.result());
    }
    if cached.is_failed() {
        return Err(child_failure(id, cached.error()));
    }

    if !cached.is_existent() {
        let mut update = OperationUpdate::start(&id.operation_id, OperationType::Context)
            .with_parent(id.parent_id.clone())
            .with_name(id.name.clone());
        if let Some(sub_type) = sub_type {
            update = update.with_sub_type(sub_type);
        }
        state.checkpoint(update).await?;
    }

    let child_ctx = WorkflowContext::child_of(state.clone(), id.operation_id.clone());
    let outcome = CURRENT_SCOPE
        .scope(id.operation_id.clone(), func(child_ctx))
        .await;

    match outcome {
        Ok(value) => {
            let serialized = to_durable(&value)?;
            state
                .checkpoint(
                    OperationUpdate::succeed(
                        &id.operation_id,
                        OperationType::Context,
                        Some(serialized),
                    )
                    .with_parent(id.parent_id.clone()),
                )
                .await?;
            state.close_scope(&id.operation_id).await;
            Ok(value)
        }
        Err(error) if error.is_suspended() || error.is_fatal() => Err(error),
        Err(error) => {
            let error_obj = ErrorObject::from(&error);
            state
                .checkpoint(
                    OperationUpdate::fail(
                        &id.operation_id,
                        OperationType::Context,
                        error_obj.clone(),
                    )
                    .with_parent(id.parent_id.clone()),
                )
                .await?;
            state.close_scope(&id.operation_id).await;
            Err(child_failure(id, Some(&error_obj)))
        }
    }
}

fn child_failure(id: &OperationIdentifier, error: Option<&ErrorObject>) -> WorkflowError {
    let (error_type, message) = error
        .map(|e| (e.error_type.clone(), e.error_message.clone()))
        .unwrap_or_else(|| {
            (
                "ChildContextError".to_string(),
                "child context failed".to_string(),
            )
        });
    WorkflowError::ChildContext {
        message,
        error_type,
        operation_id: id.operation_id.clone(),
    }
}
