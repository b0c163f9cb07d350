//! Operation records and checkpoint updates.
//!
//! An [`Operation`] is one row of the durable execution history. Handlers never
//! mutate records directly; they emit [`OperationUpdate`]s through the
//! checkpoint queue, and the backend (plus the local replay cache) applies the
//! action to produce the next record state.

use serde::{Deserialize, Serialize};

use crate::error::ErrorObject;

/// The kind of durable operation a record represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    /// The root record of the whole execution
    Execution,
    /// A checkpointed unit of user work
    Step,
    /// A durable timer
    Wait,
    /// An externally completed callback
    Callback,
    /// A scope that owns child operations
    Context,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Execution => "EXECUTION",
            Self::Step => "STEP",
            Self::Wait => "WAIT",
            Self::Callback => "CALLBACK",
            Self::Context => "CONTEXT",
        };
        f.write_str(s)
    }
}

/// Refinement of [`OperationType`] for records that need one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationSubType {
    /// CONTEXT owning the items of a map
    Map,
    /// CONTEXT for one item of a map
    MapItem,
    /// CONTEXT owning the branches of a parallel
    Parallel,
    /// CONTEXT for one branch of a parallel
    ParallelBranch,
    /// CALLBACK created by the combined submit-and-wait form
    WaitForCallback,
    /// STEP driving a wait-for-condition polling loop
    WaitForCondition,
}

/// Lifecycle status of an operation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    /// The operation has begun but not recorded an outcome
    Started,
    /// The operation completed with a result
    Succeeded,
    /// The operation completed with an error
    Failed,
}

impl OperationStatus {
    /// Returns true if no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// The transition an update applies to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationAction {
    /// Create the record in STARTED status
    Start,
    /// Transition to SUCCEEDED with a result payload
    Succeed,
    /// Transition to FAILED with an error object
    Fail,
    /// Stay STARTED, bump the attempt counter, schedule a delayed re-entry
    Retry,
}

/// Scheduling data attached to WAIT starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WaitOptions {
    /// How long the backend should park the execution
    pub wait_seconds: u64,
}

/// Scheduling data attached to STEP retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StepOptions {
    /// Delay before the backend re-invokes for the next attempt
    pub next_attempt_delay_seconds: u64,
}

/// One row of the durable execution history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Operation {
    /// Deterministic identifier, stable across replays
    pub operation_id: String,
    /// The owning scope's operation id, `None` at the root
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Explicit name if the caller supplied one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// The operation kind
    pub operation_type: OperationType,
    /// Kind refinement where applicable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_type: Option<OperationSubType>,
    /// Current lifecycle status
    pub status: OperationStatus,
    /// Zero-based attempt counter, bumped by RETRY actions
    #[serde(default)]
    pub attempt: u32,
    /// Serialized result for SUCCEEDED records
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Error object for FAILED records
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
    /// Serialized loop state carried across RETRY actions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    /// Serialized execution input, present on the root EXECUTION record
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
}

impl Operation {
    /// Creates a STARTED record. Used by backends and tests when seeding history.
    pub fn started(
        operation_id: impl Into<String>,
        operation_type: OperationType,
        parent_id: Option<String>,
    ) -> Self {
        Self {
            operation_id: operation_id.into(),
            parent_id,
            name: None,
            operation_type,
            sub_type: None,
            status: OperationStatus::Started,
            attempt: 0,
            result: None,
            error: None,
            payload: None,
            input: None,
        }
    }

    /// Returns true if the record reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Applies an update to this record, producing the next state.
    ///
    /// Terminal records ignore further actions, so replaying an
    /// already-applied update is idempotent.
    pub fn apply(&mut self, update: &OperationUpdate) {
        if self.is_terminal() {
            return;
        }
        match update.action {
            OperationAction::Start => {
                // Start on an existing record re-marks it for a new attempt;
                // only the carried payload changes.
                if update.payload.is_some() {
                    self.payload = update.payload.clone();
                }
            }
            OperationAction::Succeed => {
                self.status = OperationStatus::Succeeded;
                self.result = update.payload.clone();
            }
            OperationAction::Fail => {
                self.status = OperationStatus::Failed;
                self.error = update.error.clone();
            }
            OperationAction::Retry => {
                self.attempt += 1;
                self.payload = update.payload.clone();
            }
        }
    }
}

impl From<&OperationUpdate> for Operation {
    fn from(update: &OperationUpdate) -> Self {
        let mut op = Operation::started(
            update.operation_id.clone(),
            update.operation_type,
            update.parent_id.clone(),
        );
        op.name = update.name.clone();
        op.sub_type = update.sub_type;
        op.apply(update);
        op
    }
}

/// A single state transition submitted through the checkpoint queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OperationUpdate {
    /// Target operation id
    pub operation_id: String,
    /// The owning scope's operation id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Explicit name, recorded on START
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// The operation kind
    pub operation_type: OperationType,
    /// Kind refinement where applicable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_type: Option<OperationSubType>,
    /// The transition to apply
    pub action: OperationAction,
    /// Serialized result (SUCCEED) or loop state (RETRY)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    /// Error object for FAIL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
    /// Timer scheduling for WAIT starts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_options: Option<WaitOptions>,
    /// Retry scheduling for STEP retries
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_options: Option<StepOptions>,
}

impl OperationUpdate {
    fn new(
        operation_id: impl Into<String>,
        operation_type: OperationType,
        action: OperationAction,
    ) -> Self {
        Self {
            operation_id: operation_id.into(),
            parent_id: None,
            name: None,
            operation_type,
            sub_type: None,
            action,
            payload: None,
            error: None,
            wait_options: None,
            step_options: None,
        }
    }

    /// Creates a START update.
    pub fn start(operation_id: impl Into<String>, operation_type: OperationType) -> Self {
        Self::new(operation_id, operation_type, OperationAction::Start)
    }

    /// Creates a START update for a WAIT with its timer.
    pub fn start_wait(operation_id: impl Into<String>, wait_seconds: u64) -> Self {
        let mut update = Self::new(operation_id, OperationType::Wait, OperationAction::Start);
        update.wait_options = Some(WaitOptions { wait_seconds });
        update
    }

    /// Creates a SUCCEED update carrying a serialized result.
    pub fn succeed(
        operation_id: impl Into<String>,
        operation_type: OperationType,
        result: Option<String>,
    ) -> Self {
        let mut update = Self::new(operation_id, operation_type, OperationAction::Succeed);
        update.payload = result;
        update
    }

    /// Creates a FAIL update carrying an error object.
    pub fn fail(
        operation_id: impl Into<String>,
        operation_type: OperationType,
        error: ErrorObject,
    ) -> Self {
        let mut update = Self::new(operation_id, operation_type, OperationAction::Fail);
        update.error = Some(error);
        update
    }

    /// Creates a RETRY update with a re-entry delay.
    pub fn retry(
        operation_id: impl Into<String>,
        operation_type: OperationType,
        next_attempt_delay_seconds: u64,
    ) -> Self {
        let mut update = Self::new(operation_id, operation_type, OperationAction::Retry);
        update.step_options = Some(StepOptions {
            next_attempt_delay_seconds,
        });
        update
    }

    /// Sets the parent scope id.
    pub fn with_parent(mut self, parent_id: Option<String>) -> Self {
        self.parent_id = parent_id;
        self
    }

    /// Sets the explicit name.
    pub fn with_name(mut self, name: Option<String>) -> Self {
        self.name = name;
        self
    }

    /// Sets the sub-type.
    pub fn with_sub_type(mut self, sub_type: OperationSubType) -> Self {
        self.sub_type = Some(sub_type);
        self
    }

    /// Sets the carried payload (RETRY loop state).
    pub fn with_payload(mut self, payload: Option<String>) -> Self {
        self.payload = payload;
        self
    }

    /// Returns true if this update completes the root EXECUTION record.
    pub fn is_execution_completion(&self) -> bool {
        self.operation_type == OperationType::Execution
            && matches!(self.action, OperationAction::Succeed | OperationAction::Fail)
    }
}
