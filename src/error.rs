//! Error types for the durable execution engine.
//!
//! Errors split into three families: domain failures that become part of the
//! durable record (`UserCode`, `Callback`, `ChildContext`), control-flow
//! signals (`Suspended`, `Interrupted`), and infrastructure failures that
//! terminate the execution (`Checkpoint`, `Serde`, `Unrecoverable`).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The main error type for durable workflows.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Failure raised by user-provided code inside a step or branch.
    #[error("user code error: {message}")]
    UserCode {
        /// Error message from the user code
        message: String,
        /// The type of error
        error_type: String,
        /// Optional stack trace
        stack_trace: Option<String>,
    },

    /// Callback failed, timed out, or missed a heartbeat.
    #[error("callback error: {message}")]
    Callback {
        /// Error message describing what went wrong
        message: String,
        /// The error type reported by the completer or the timeout source
        error_type: String,
        /// The callback ID if available
        callback_id: Option<String>,
    },

    /// A child context (or concurrent branch) failed.
    #[error("child context error: {message}")]
    ChildContext {
        /// Error message describing what went wrong
        message: String,
        /// The error type of the underlying failure
        error_type: String,
        /// The operation ID of the failed child
        operation_id: String,
    },

    /// A step with at-most-once semantics was cut off before recording an outcome.
    #[error("operation {operation_id} was interrupted before completion")]
    Interrupted {
        /// The operation ID of the interrupted step
        operation_id: String,
    },

    /// Checkpoint submission failed. Always fatal for the execution.
    #[error("checkpoint error: {message}")]
    Checkpoint {
        /// Error message describing what went wrong
        message: String,
    },

    /// Serialization or deserialization of a durable value failed.
    #[error("serialization error: {message}")]
    Serde {
        /// Error message describing the failure
        message: String,
    },

    /// A context handle was used from a scope it does not belong to.
    #[error("context usage error: {message}")]
    ContextUsage {
        /// Error message describing the misuse
        message: String,
        /// The operation ID being resolved, if one was computed
        operation_id: Option<String>,
    },

    /// Replay observed a record that does not match the code being executed.
    #[error("non-deterministic execution: {message}")]
    NonDeterministic {
        /// Error message describing the mismatch
        message: String,
        /// The operation ID where the mismatch occurred
        operation_id: Option<String>,
    },

    /// Unrecoverable engine failure that forces termination.
    #[error("unrecoverable error: {message}")]
    Unrecoverable {
        /// Error message describing what went wrong
        message: String,
        /// The reason recorded on the termination request
        reason: TerminationReason,
    },

    /// The invocation suspended and will resume in a later invocation.
    #[error("invocation suspended: {reason}")]
    Suspended {
        /// Why the invocation gave up the host
        reason: TerminationReason,
    },

    /// Invalid configuration or arguments.
    #[error("validation error: {message}")]
    Validation {
        /// Error message describing the validation failure
        message: String,
    },

    /// Backend call failed before any state changed.
    #[error("backend error: {message}")]
    Backend {
        /// Error message from the backend
        message: String,
        /// Whether the host may retry the whole invocation
        retriable: bool,
    },
}

impl WorkflowError {
    /// Creates a new UserCode error.
    pub fn user_code(message: impl Into<String>) -> Self {
        Self::UserCode {
            message: message.into(),
            error_type: "UserCodeError".to_string(),
            stack_trace: None,
        }
    }

    /// Creates a new Callback error.
    pub fn callback(message: impl Into<String>, callback_id: impl Into<String>) -> Self {
        Self::Callback {
            message: message.into(),
            error_type: "CallbackError".to_string(),
            callback_id: Some(callback_id.into()),
        }
    }

    /// Creates a new Checkpoint error.
    pub fn checkpoint(message: impl Into<String>) -> Self {
        Self::Checkpoint {
            message: message.into(),
        }
    }

    /// Creates a new Serde error.
    pub fn serde(message: impl Into<String>) -> Self {
        Self::Serde {
            message: message.into(),
        }
    }

    /// Creates a new ContextUsage error.
    pub fn context_usage(message: impl Into<String>) -> Self {
        Self::ContextUsage {
            message: message.into(),
            operation_id: None,
        }
    }

    /// Creates a new NonDeterministic error for the given operation.
    pub fn non_deterministic(message: impl Into<String>, operation_id: impl Into<String>) -> Self {
        Self::NonDeterministic {
            message: message.into(),
            operation_id: Some(operation_id.into()),
        }
    }

    /// Creates a new Validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a new Suspended signal with the given reason.
    pub fn suspended(reason: TerminationReason) -> Self {
        Self::Suspended { reason }
    }

    /// Creates a new Unrecoverable error.
    pub fn unrecoverable(message: impl Into<String>, reason: TerminationReason) -> Self {
        Self::Unrecoverable {
            message: message.into(),
            reason,
        }
    }

    /// Returns true if this is a suspension signal rather than a failure.
    pub fn is_suspended(&self) -> bool {
        matches!(self, Self::Suspended { .. })
    }

    /// Returns true if this error must terminate the execution without retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Checkpoint { .. } | Self::Serde { .. } | Self::Unrecoverable { .. }
        )
    }
}

/// Reason an invocation gave up the host or an execution was terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TerminationReason {
    /// Unhandled error in user code
    #[default]
    UnhandledError,
    /// A wait was scheduled; the execution resumes after the delay
    WaitScheduled,
    /// A step retry was scheduled with a delay
    RetryScheduled,
    /// A callback has not completed yet
    CallbackPending,
    /// A wait-for-condition poll was scheduled
    ConditionPollScheduled,
    /// Checkpoint submission failed
    CheckpointFailed,
    /// Non-deterministic execution detected
    NonDeterministicExecution,
    /// Serialization of a durable value failed
    SerializationError,
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::UnhandledError => "unhandled error",
            Self::WaitScheduled => "wait scheduled",
            Self::RetryScheduled => "retry scheduled",
            Self::CallbackPending => "callback pending",
            Self::ConditionPollScheduled => "condition poll scheduled",
            Self::CheckpointFailed => "checkpoint failed",
            Self::NonDeterministicExecution => "non-deterministic execution",
            Self::SerializationError => "serialization error",
        };
        f.write_str(s)
    }
}

impl TerminationReason {
    /// Returns true if the execution can resume after this reason.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            Self::WaitScheduled
                | Self::RetryScheduled
                | Self::CallbackPending
                | Self::ConditionPollScheduled
        )
    }
}

/// Error object persisted on FAILED operation records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorObject {
    /// The error type/name
    #[serde(rename = "ErrorType")]
    pub error_type: String,
    /// The error message
    #[serde(rename = "ErrorMessage")]
    pub error_message: String,
    /// Optional stack trace
    #[serde(rename = "StackTrace", skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

impl ErrorObject {
    /// Creates a new ErrorObject.
    pub fn new(error_type: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            error_message: error_message.into(),
            stack_trace: None,
        }
    }

    /// The synthetic failure recorded when an at-most-once step replays as STARTED.
    pub fn interrupted(operation_id: &str) -> Self {
        Self::new(
            "StepInterruptedError",
            format!("step {operation_id} started but never recorded an outcome"),
        )
    }

    /// Wraps an arbitrary user error.
    pub fn from_user_error(error: &(dyn std::error::Error + 'static)) -> Self {
        Self::new("UserCodeError", error.to_string())
    }
}

impl From<&WorkflowError> for ErrorObject {
    fn from(error: &WorkflowError) -> Self {
        match error {
            WorkflowError::UserCode {
                message,
                error_type,
                stack_trace,
            } => {
                let mut obj = ErrorObject::new(error_type, message);
                obj.stack_trace = stack_trace.clone();
                obj
            }
            WorkflowError::Callback {
                message, error_type, ..
            } => ErrorObject::new(error_type, message),
            WorkflowError::ChildContext {
                message, error_type, ..
            } => ErrorObject::new(error_type, message),
            WorkflowError::Interrupted { operation_id } => ErrorObject::interrupted(operation_id),
            WorkflowError::Checkpoint { message } => ErrorObject::new("CheckpointError", message),
            WorkflowError::Serde { message } => ErrorObject::new("SerDesError", message),
            WorkflowError::ContextUsage { message, .. } => {
                ErrorObject::new("ContextUsageError", message)
            }
            WorkflowError::NonDeterministic { message, .. } => {
                ErrorObject::new("NonDeterministicExecutionError", message)
            }
            WorkflowError::Unrecoverable { message, .. } => {
                ErrorObject::new("UnrecoverableError", message)
            }
            WorkflowError::Suspended { reason } => {
                ErrorObject::new("SuspendedExecution", reason.to_string())
            }
            WorkflowError::Validation { message } => ErrorObject::new("ValidationError", message),
            WorkflowError::Backend { message, .. } => ErrorObject::new("BackendError", message),
        }
    }
}

impl From<&ErrorObject> for WorkflowError {
    fn from(obj: &ErrorObject) -> Self {
        Self::UserCode {
            message: obj.error_message.clone(),
            error_type: obj.error_type.clone(),
            stack_trace: obj.stack_trace.clone(),
        }
    }
}

impl From<serde_json::Error> for WorkflowError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serde {
            message: error.to_string(),
        }
    }
}

impl From<Box<dyn std::error::Error + Send + Sync>> for WorkflowError {
    fn from(error: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self::UserCode {
            message: error.to_string(),
            error_type: "UserCodeError".to_string(),
            stack_trace: None,
        }
    }
}
