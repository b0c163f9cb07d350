//! The backend seam.
//!
//! [`ExecutionBackend`] is everything the engine needs from the durable store:
//! paginated history reads and checkpoint writes. [`InMemoryBackend`] is a
//! full in-process implementation used by the test suite and by local
//! harnesses; it applies updates to a real record map so multi-invocation
//! replay scenarios work against it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorObject, WorkflowError};
use crate::operation::{Operation, OperationStatus, OperationType, OperationUpdate};

/// One page of execution history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StepDataPage {
    /// Records in this page
    pub operations: Vec<Operation>,
    /// Marker for the next page, `None` on the last page
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_marker: Option<String>,
}

/// A batch of updates submitted under one checkpoint token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CheckpointRequest {
    /// The execution being updated
    pub execution_arn: String,
    /// Updates in submission order
    pub updates: Vec<OperationUpdate>,
}

/// Response to a successful checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CheckpointResponse {
    /// Token for the next checkpoint; the submitted token is now dead
    pub checkpoint_token: String,
    /// Records that changed outside this invocation since the last checkpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_execution_state: Option<StepDataPage>,
}

/// Durable store operations the engine depends on.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Reads one page of execution history.
    async fn get_step_data(
        &self,
        checkpoint_token: &str,
        execution_arn: &str,
        marker: Option<&str>,
    ) -> Result<StepDataPage, WorkflowError>;

    /// Submits a batch of operation updates.
    async fn checkpoint(
        &self,
        checkpoint_token: &str,
        request: CheckpointRequest,
    ) -> Result<CheckpointResponse, WorkflowError>;
}

/// Shared handle to a backend.
pub type SharedBackend = std::sync::Arc<dyn ExecutionBackend>;

#[derive(Default)]
struct BackendState {
    records: HashMap<String, Operation>,
    order: Vec<String>,
    staged_new_state: Vec<Operation>,
    fail_next_checkpoint: Option<String>,
}

impl BackendState {
    fn upsert(&mut self, update: &OperationUpdate) {
        match self.records.get_mut(&update.operation_id) {
            Some(existing) => existing.apply(update),
            None => {
                self.order.push(update.operation_id.clone());
                self.records
                    .insert(update.operation_id.clone(), Operation::from(update));
            }
        }
    }

    fn insert_record(&mut self, operation: Operation) {
        if !self.records.contains_key(&operation.operation_id) {
            self.order.push(operation.operation_id.clone());
        }
        self.records.insert(operation.operation_id.clone(), operation);
    }

    fn snapshot(&self) -> Vec<Operation> {
        self.order
            .iter()
            .filter_map(|id| self.records.get(id).cloned())
            .collect()
    }
}

/// In-memory [`ExecutionBackend`].
///
/// Tracks every received update and checkpoint call so tests can assert on
/// batching behavior, and exposes completer-side helpers (`complete_wait`,
/// `complete_callback`, ...) so suspended executions can be driven forward.
pub struct InMemoryBackend {
    state: Mutex<BackendState>,
    update_log: Mutex<Vec<OperationUpdate>>,
    checkpoint_calls: AtomicUsize,
    token_serial: AtomicU64,
    page_size: Option<usize>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BackendState::default()),
            update_log: Mutex::new(Vec::new()),
            checkpoint_calls: AtomicUsize::new(0),
            token_serial: AtomicU64::new(0),
            page_size: None,
        }
    }

    /// Creates a backend seeded with a root EXECUTION record carrying the input.
    pub fn with_input(execution_id: impl Into<String>, input: impl Into<String>) -> Self {
        let backend = Self::new();
        let mut record = Operation::started(execution_id, OperationType::Execution, None);
        record.input = Some(input.into());
        backend.seed(vec![record]);
        backend
    }

    /// Limits `get_step_data` pages to the given size.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }

    /// Inserts records directly, bypassing the checkpoint path.
    pub fn seed(&self, operations: Vec<Operation>) {
        let mut state = self.state.lock().unwrap();
        for op in operations {
            state.insert_record(op);
        }
    }

    /// Stages records to be returned as `new_execution_state` on the next checkpoint.
    pub fn stage_new_state(&self, operations: Vec<Operation>) {
        self.state.lock().unwrap().staged_new_state.extend(operations);
    }

    /// Makes the next checkpoint call fail with the given message.
    pub fn fail_next_checkpoint(&self, message: impl Into<String>) {
        self.state.lock().unwrap().fail_next_checkpoint = Some(message.into());
    }

    /// Completes a WAIT record, as the backend timer would after the delay.
    pub fn complete_wait(&self, operation_id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(record) = state.records.get_mut(operation_id) {
            record.status = OperationStatus::Succeeded;
        }
    }

    /// Completes a CALLBACK record with a serialized result.
    pub fn complete_callback(&self, operation_id: &str, result: impl Into<String>) {
        let mut state = self.state.lock().unwrap();
        if let Some(record) = state.records.get_mut(operation_id) {
            record.status = OperationStatus::Succeeded;
            record.result = Some(result.into());
        }
    }

    /// Fails a CALLBACK record with the given error object.
    pub fn fail_callback(&self, operation_id: &str, error: ErrorObject) {
        let mut state = self.state.lock().unwrap();
        if let Some(record) = state.records.get_mut(operation_id) {
            record.status = OperationStatus::Failed;
            record.error = Some(error);
        }
    }

    /// Fails a CALLBACK record the way the backend's overall timeout does.
    pub fn timeout_callback(&self, operation_id: &str) {
        self.fail_callback(
            operation_id,
            ErrorObject::new("CallbackTimeout", "callback deadline exceeded"),
        );
    }

    /// Fails a CALLBACK record the way a missed heartbeat does.
    pub fn heartbeat_timeout_callback(&self, operation_id: &str) {
        self.fail_callback(
            operation_id,
            ErrorObject::new("HeartbeatTimeout", "callback heartbeat missed"),
        );
    }

    /// A fresh token for starting an invocation.
    pub fn issue_token(&self) -> String {
        format!("token-{}", self.token_serial.fetch_add(1, Ordering::SeqCst))
    }

    /// All records in insertion order.
    pub fn records(&self) -> Vec<Operation> {
        self.state.lock().unwrap().snapshot()
    }

    /// One record by id.
    pub fn record(&self, operation_id: &str) -> Option<Operation> {
        self.state.lock().unwrap().records.get(operation_id).cloned()
    }

    /// Every update received, across all checkpoint calls.
    pub fn updates(&self) -> Vec<OperationUpdate> {
        self.update_log.lock().unwrap().clone()
    }

    /// Number of checkpoint calls received.
    pub fn checkpoint_calls(&self) -> usize {
        self.checkpoint_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutionBackend for InMemoryBackend {
    async fn get_step_data(
        &self,
        _checkpoint_token: &str,
        _execution_arn: &str,
        marker: Option<&str>,
    ) -> Result<StepDataPage, WorkflowError> {
        let all = self.records();
        let start = match marker {
            Some(m) => m.parse::<usize>().map_err(|_| WorkflowError::Backend {
                message: format!("invalid pagination marker: {m}"),
                retriable: false,
            })?,
            None => 0,
        };
        let page_size = self.page_size.unwrap_or(usize::MAX);
        let end = start.saturating_add(page_size).min(all.len());
        let next_marker = (end < all.len()).then(|| end.to_string());
        Ok(StepDataPage {
            operations: all[start..end].to_vec(),
            next_marker,
        })
    }

    async fn checkpoint(
        &self,
        _checkpoint_token: &str,
        request: CheckpointRequest,
    ) -> Result<CheckpointResponse, WorkflowError> {
        self.checkpoint_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if let Some(message) = state.fail_next_checkpoint.take() {
            return Err(WorkflowError::Backend {
                message,
                retriable: false,
            });
        }
        self.update_log
            .lock()
            .unwrap()
            .extend(request.updates.iter().cloned());
        for update in &request.updates {
            state.upsert(update);
        }
        let new_execution_state = if state.staged_new_state.is_empty() {
            None
        } else {
            let operations = std::mem::take(&mut state.staged_new_state);
            for op in &operations {
                state.insert_record(op.clone());
            }
            Some(StepDataPage {
                operations,
                next_marker: None,
            })
        };
        drop(state);
        Ok(CheckpointResponse {
            checkpoint_token: self.issue_token(),
            new_execution_state,
        })
    }
}
