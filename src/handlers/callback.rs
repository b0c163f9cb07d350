//! The callback handler: durable handles completed by external systems.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::config::CallbackConfig;
use crate::error::{TerminationReason, WorkflowError};
use crate::identity::OperationIdentifier;
use crate::operation::{OperationSubType, OperationType, OperationUpdate};
use crate::serdes::from_durable;
use crate::state::ExecutionState;

/// Error types recorded by the backend when a callback deadline passes.
const TIMEOUT_ERROR_TYPES: [&str; 2] = ["CallbackTimeout", "HeartbeatTimeout"];

/// Scheduling options serialized onto the callback START record.
#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "PascalCase")]
struct CallbackOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    heartbeat_timeout_seconds: Option<u64>,
}

/// A durable callback handle.
///
/// The callback id doubles as the operation id; external completers address
/// the backend with it. The handle is inert: nothing happens until
/// [`Callback::result`] is awaited.
pub struct Callback<T> {
    id: OperationIdentifier,
    state: Arc<ExecutionState>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Callback<T>
where
    T: DeserializeOwned,
{
    /// The id an external completer uses to resolve this callback.
    pub fn callback_id(&self) -> &str {
        &self.id.operation_id
    }

    /// Resolves the callback's outcome, suspending if it is still pending.
    ///
    /// Timeout and heartbeat-timeout failures keep their distinguishing
    /// `error_type` so callers can react to each separately.
    pub async fn result(&self) -> Result<T, WorkflowError> {
        let cached = self.state.lookup(&self.id.operation_id).await;
        if cached.is_succeeded() {
            return from_durable(cached.result());
        }
        if cached.is_failed() {
            let (error_type, message) = cached
                .error()
                .map(|e| (e.error_type.clone(), e.error_message.clone()))
                .unwrap_or_else(|| ("CallbackError".to_string(), "callback failed".to_string()));
            if TIMEOUT_ERROR_TYPES.contains(&error_type.as_str()) {
                tracing::debug!(
                    callback_id = %self.id.operation_id,
                    %error_type,
                    "callback timed out"
                );
            }
            return Err(WorkflowError::Callback {
                message,
                error_type,
                callback_id: Some(self.id.operation_id.clone()),
            });
        }
        self.state
            .termination()
            .request(TerminationReason::CallbackPending);
        Err(WorkflowError::suspended(TerminationReason::CallbackPending))
    }
}

/// Creates (or replays) a callback record and returns its handle.
pub async fn create_callback_handler<T>(
    state: &Arc<ExecutionState>,
    id: &OperationIdentifier,
    sub_type: Option<OperationSubType>,
    config: &CallbackConfig,
) -> Result<Callback<T>, WorkflowError>
where
    T: DeserializeOwned,
{
    let cached = state.lookup(&id.operation_id).await;
    cached.ensure_type(OperationType::Callback, sub_type)?;

    if !cached.is_existent() {
        let options = CallbackOptions {
            timeout_seconds: config.timeout.map(|d| d.as_secs()),
            heartbeat_timeout_seconds: config.heartbeat_timeout.map(|d| d.as_secs()),
        };
        let payload = (options.timeout_seconds.is_some()
            || options.heartbeat_timeout_seconds.is_some())
        .then(|| serde_json::to_string(&options))
        .transpose()?;
        let mut update = OperationUpdate::start(&id.operation_id, OperationType::Callback)
            .with_parent(id.parent_id.clone())
            .with_name(id.name.clone())
            .with_payload(payload);
        if let Some(sub_type) = sub_type {
            update = update.with_sub_type(sub_type);
        }
        state.checkpoint(update).await?;
        tracing::debug!(callback_id = %id.operation_id, "callback registered");
    }

    Ok(Callback {
        id: id.clone(),
        state: state.clone(),
        _marker: PhantomData,
    })
}

impl<T> std::fmt::Debug for Callback<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callback")
            .field("callback_id", &self.id.operation_id)
            .finish()
    }
}

// Callbacks are frequently moved into combinator futures.
const _: fn() = || {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<Callback<serde_json::Value>>();
};
