//! The invocation runner.
//!
//! The workflow function runs fresh on every invocation; the runner hydrates
//! the history, races the workflow against the termination channel, and maps
//! the outcome to an invocation status the host can act on: `SUCCEEDED` and
//! `FAILED` are terminal, `PENDING` asks the host to re-invoke when the
//! backend signals readiness.

use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::backend::{SharedBackend, StepDataPage};
use crate::context::WorkflowContext;
use crate::error::{ErrorObject, TerminationReason, WorkflowError};
use crate::identity::{CURRENT_SCOPE, ROOT_SCOPE};
use crate::operation::{Operation, OperationType, OperationUpdate};
use crate::serdes::to_durable;
use crate::state::ExecutionState;

/// Operation id used for the root record when the backend did not seed one.
const FALLBACK_EXECUTION_ID: &str = "execution";

/// What the host hands the runner on each invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InvocationInput {
    /// The execution being driven forward
    pub execution_arn: String,
    /// Token authorizing the first checkpoint of this invocation
    pub checkpoint_token: String,
    /// First page of history, when the host inlines it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_execution_state: Option<StepDataPage>,
}

/// How the invocation left the execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvocationStatus {
    /// The workflow returned; the execution is complete
    Succeeded,
    /// The execution failed terminally
    Failed,
    /// The invocation suspended; re-invoke when the backend signals
    Pending,
}

/// The runner's report back to the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InvocationOutput {
    /// Terminal or pending status of the execution
    pub status: InvocationStatus,
    /// Serialized workflow result when `status` is `Succeeded`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Failure details when `status` is `Failed`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl InvocationOutput {
    fn succeeded(result: String) -> Self {
        Self {
            status: InvocationStatus::Succeeded,
            result: Some(result),
            error: None,
        }
    }

    fn failed(error: ErrorObject) -> Self {
        Self {
            status: InvocationStatus::Failed,
            result: None,
            error: Some(error),
        }
    }

    fn pending() -> Self {
        Self {
            status: InvocationStatus::Pending,
            result: None,
            error: None,
        }
    }
}

enum Outcome<T> {
    Finished(Result<T, WorkflowError>),
    Terminated(TerminationReason),
}

/// Runs one invocation of a workflow function over hydrated history.
///
/// Returns `Err` only for hydration failures, where nothing has been written
/// and the host may retry the whole invocation. Every failure after the
/// workflow starts is reported through the output instead.
pub async fn run_invocation<T, F, Fut>(
    backend: SharedBackend,
    input: InvocationInput,
    workflow: F,
) -> Result<InvocationOutput, WorkflowError>
where
    T: Serialize,
    F: FnOnce(WorkflowContext) -> Fut,
    Fut: Future<Output = Result<T, WorkflowError>>,
{
    let history = hydrate(&backend, &input).await?;
    tracing::debug!(
        execution_arn = %input.execution_arn,
        records = history.len(),
        "invocation starting"
    );

    let state = ExecutionState::new(
        backend,
        input.execution_arn.clone(),
        input.checkpoint_token.clone(),
        history,
    );
    let execution_id = state
        .execution_operation()
        .map(|op| op.operation_id.clone())
        .unwrap_or_else(|| FALLBACK_EXECUTION_ID.to_string());

    let ctx = WorkflowContext::root(state.clone());
    let workflow_fut = CURRENT_SCOPE.scope(ROOT_SCOPE.to_string(), workflow(ctx));
    let outcome = {
        // The workflow arm is polled first, so a finished workflow beats a
        // concurrently requested termination.
        tokio::select! {
            biased;
            result = workflow_fut => Outcome::Finished(result),
            reason = state.termination().wait() => Outcome::Terminated(reason),
        }
    };

    let output = match outcome {
        Outcome::Finished(Ok(value)) => match to_durable(&value) {
            Ok(serialized) => {
                let update = OperationUpdate::succeed(
                    &execution_id,
                    OperationType::Execution,
                    Some(serialized.clone()),
                );
                if state.checkpoint(update).await.is_err() || state.flush().await.is_err() {
                    InvocationOutput::failed(checkpoint_failure())
                } else {
                    tracing::info!(execution_arn = %input.execution_arn, "execution succeeded");
                    InvocationOutput::succeeded(serialized)
                }
            }
            Err(error) => fail_execution(&state, &execution_id, &error).await,
        },
        Outcome::Finished(Err(WorkflowError::Suspended { reason })) => {
            // The suspension may carry a resumable reason while a fatal one
            // was requested elsewhere (a branch that hit a serialization
            // failure, say); the fatal reason decides.
            let reason = match state.termination().reason() {
                Some(requested) if !requested.is_resumable() => requested,
                _ => reason,
            };
            conclude_termination(&state, &execution_id, reason).await
        }
        Outcome::Finished(Err(WorkflowError::Checkpoint { .. })) => {
            InvocationOutput::failed(checkpoint_failure())
        }
        Outcome::Finished(Err(error)) => fail_execution(&state, &execution_id, &error).await,
        Outcome::Terminated(reason) => conclude_termination(&state, &execution_id, reason).await,
    };
    Ok(output)
}

/// Maps a termination reason to the invocation outcome: resumable reasons
/// suspend, everything else is terminal.
async fn conclude_termination(
    state: &ExecutionState,
    execution_id: &str,
    reason: TerminationReason,
) -> InvocationOutput {
    if reason.is_resumable() {
        return suspend(state).await;
    }
    if reason == TerminationReason::CheckpointFailed {
        return InvocationOutput::failed(checkpoint_failure());
    }
    tracing::error!(
        execution_arn = %state.execution_arn(),
        %reason,
        "execution terminated"
    );
    let error = WorkflowError::unrecoverable(format!("execution terminated: {reason}"), reason);
    fail_execution(state, execution_id, &error).await
}

/// Reads the full history, following pagination markers.
async fn hydrate(
    backend: &SharedBackend,
    input: &InvocationInput,
) -> Result<Vec<Operation>, WorkflowError> {
    let first = match &input.initial_execution_state {
        Some(page) => page.clone(),
        None => {
            backend
                .get_step_data(&input.checkpoint_token, &input.execution_arn, None)
                .await?
        }
    };
    let mut history = first.operations;
    let mut next_marker = first.next_marker;
    while let Some(marker) = next_marker {
        let page = backend
            .get_step_data(&input.checkpoint_token, &input.execution_arn, Some(&marker))
            .await?;
        history.extend(page.operations);
        next_marker = page.next_marker;
    }
    Ok(history)
}

/// Flushes pending checkpoints and reports the suspension.
async fn suspend(state: &ExecutionState) -> InvocationOutput {
    match state.flush().await {
        Ok(()) => {
            tracing::debug!(
                execution_arn = %state.execution_arn(),
                reason = ?state.termination().reason(),
                "invocation suspended"
            );
            InvocationOutput::pending()
        }
        Err(_) => InvocationOutput::failed(checkpoint_failure()),
    }
}

/// Records a terminal FAILED on the EXECUTION record, best effort.
async fn fail_execution(
    state: &ExecutionState,
    execution_id: &str,
    error: &WorkflowError,
) -> InvocationOutput {
    let error_obj = ErrorObject::from(error);
    tracing::error!(
        execution_arn = %state.execution_arn(),
        error_type = %error_obj.error_type,
        "execution failed: {}",
        error_obj.error_message
    );
    let update = OperationUpdate::fail(
        execution_id,
        OperationType::Execution,
        error_obj.clone(),
    );
    // A poisoned queue cannot take the terminal record; the failure output
    // still reports the original error.
    let _ = state.checkpoint(update).await;
    let _ = state.flush().await;
    InvocationOutput::failed(error_obj)
}

fn checkpoint_failure() -> ErrorObject {
    ErrorObject::new("CheckpointError", "checkpoint submission failed")
}
