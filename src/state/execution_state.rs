//! Per-invocation execution state: the replay cache and checkpoint entry
//! points shared by every handler.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::backend::SharedBackend;
use crate::error::{ErrorObject, WorkflowError};
use crate::operation::{Operation, OperationStatus, OperationSubType, OperationType, OperationUpdate};
use crate::state::queue::CheckpointQueue;
use crate::termination::TerminationManager;

/// Replay lookup result for one operation id.
///
/// Wraps `Option<Operation>` with the status questions handlers actually ask.
#[derive(Debug, Clone)]
pub struct CheckpointedResult {
    operation: Option<Operation>,
}

impl CheckpointedResult {
    /// Returns true if a record exists for the id.
    pub fn is_existent(&self) -> bool {
        self.operation.is_some()
    }

    /// Returns true if the record exists in STARTED status.
    pub fn is_started(&self) -> bool {
        matches!(
            self.operation.as_ref().map(|o| o.status),
            Some(OperationStatus::Started)
        )
    }

    /// Returns true if the record exists in SUCCEEDED status.
    pub fn is_succeeded(&self) -> bool {
        matches!(
            self.operation.as_ref().map(|o| o.status),
            Some(OperationStatus::Succeeded)
        )
    }

    /// Returns true if the record exists in FAILED status.
    pub fn is_failed(&self) -> bool {
        matches!(
            self.operation.as_ref().map(|o| o.status),
            Some(OperationStatus::Failed)
        )
    }

    /// The serialized result, if any.
    pub fn result(&self) -> Option<&str> {
        self.operation.as_ref().and_then(|o| o.result.as_deref())
    }

    /// The recorded error, if any.
    pub fn error(&self) -> Option<&ErrorObject> {
        self.operation.as_ref().and_then(|o| o.error.as_ref())
    }

    /// The carried retry payload, if any.
    pub fn payload(&self) -> Option<&str> {
        self.operation.as_ref().and_then(|o| o.payload.as_deref())
    }

    /// The attempt counter, zero when the record does not exist.
    pub fn attempt(&self) -> u32 {
        self.operation.as_ref().map(|o| o.attempt).unwrap_or(0)
    }

    /// Fails with a NonDeterministic error if the cached record's type does
    /// not match what the code at this id declares.
    pub fn ensure_type(
        &self,
        expected: OperationType,
        sub_type: Option<OperationSubType>,
    ) -> Result<(), WorkflowError> {
        let Some(op) = &self.operation else {
            return Ok(());
        };
        if op.operation_type != expected || (op.sub_type.is_some() && op.sub_type != sub_type) {
            return Err(WorkflowError::non_deterministic(
                format!(
                    "cached record is {} but code declares {}; workflow code changed between invocations",
                    op.operation_type, expected
                ),
                op.operation_id.clone(),
            ));
        }
        Ok(())
    }
}

/// Shared state for one invocation of one execution.
pub struct ExecutionState {
    execution_arn: String,
    cache: Arc<RwLock<HashMap<String, Operation>>>,
    closed_scopes: RwLock<HashSet<String>>,
    queue: CheckpointQueue,
    termination: Arc<TerminationManager>,
    execution_operation: Option<Operation>,
}

impl ExecutionState {
    /// Builds the state from hydrated history and spawns the checkpoint flusher.
    pub fn new(
        backend: SharedBackend,
        execution_arn: impl Into<String>,
        initial_token: impl Into<String>,
        history: Vec<Operation>,
    ) -> Arc<Self> {
        let execution_arn = execution_arn.into();
        let execution_operation = history
            .iter()
            .find(|op| op.operation_type == OperationType::Execution)
            .cloned();
        let cache: HashMap<String, Operation> = history
            .into_iter()
            .map(|op| (op.operation_id.clone(), op))
            .collect();
        let cache = Arc::new(RwLock::new(cache));
        let termination = Arc::new(TerminationManager::new());
        let queue = CheckpointQueue::spawn(
            backend,
            execution_arn.clone(),
            initial_token.into(),
            cache.clone(),
            termination.clone(),
        );
        Arc::new(Self {
            execution_arn,
            cache,
            closed_scopes: RwLock::new(HashSet::new()),
            queue,
            termination,
            execution_operation,
        })
    }

    /// The execution's identifier.
    pub fn execution_arn(&self) -> &str {
        &self.execution_arn
    }

    /// The termination manager for this invocation.
    pub fn termination(&self) -> &Arc<TerminationManager> {
        &self.termination
    }

    /// The root EXECUTION record, if the backend created one.
    pub fn execution_operation(&self) -> Option<&Operation> {
        self.execution_operation.as_ref()
    }

    /// The serialized execution input, if any.
    pub fn input_raw(&self) -> Option<&str> {
        self.execution_operation
            .as_ref()
            .and_then(|op| op.input.as_deref())
    }

    /// Looks up the cached record for an operation id.
    pub async fn lookup(&self, operation_id: &str) -> CheckpointedResult {
        let cache = self.cache.read().await;
        CheckpointedResult {
            operation: cache.get(operation_id).cloned(),
        }
    }

    /// Submits an update and waits until it is durable.
    ///
    /// Updates into a closed scope are rejected: a context handle that
    /// outlived its owning child context cannot create durable state.
    pub async fn checkpoint(&self, update: OperationUpdate) -> Result<(), WorkflowError> {
        if let Some(parent_id) = &update.parent_id {
            if self.closed_scopes.read().await.contains(parent_id) {
                return Err(WorkflowError::ContextUsage {
                    message: format!(
                        "operation {} checkpointed into scope {} after the scope completed",
                        update.operation_id, parent_id
                    ),
                    operation_id: Some(update.operation_id.clone()),
                });
            }
        }
        self.queue.submit(update).await
    }

    /// Waits until everything currently queued has been flushed.
    pub async fn flush(&self) -> Result<(), WorkflowError> {
        self.queue.flush().await
    }

    /// Marks a child context's scope closed; later checkpoints into it fail.
    pub async fn close_scope(&self, scope_id: &str) {
        self.closed_scopes.write().await.insert(scope_id.to_string());
    }
}
