//! Durable execution engine for stateless, re-invoked workflow functions.
//!
//! A workflow function runs from the top on every invocation. Operations it
//! declares (`step`, `wait`, callbacks, `map`/`parallel`, child contexts)
//! are identified deterministically and checkpointed through a coalescing
//! queue; on re-invocation, completed operations replay from the cached
//! history instead of executing again. When an operation has to wait on the
//! outside world (a timer, a callback, a retry delay), the invocation
//! suspends and the host re-invokes later.
//!
//! ```no_run
//! use std::sync::Arc;
//! use durable_engine::{
//!     run_invocation, Duration, InMemoryBackend, InvocationInput, WorkflowError,
//! };
//!
//! # async fn demo() -> Result<(), WorkflowError> {
//! let backend = Arc::new(InMemoryBackend::with_input("exec-1", "\"order-42\""));
//! let input = InvocationInput {
//!     execution_arn: "exec-1".to_string(),
//!     checkpoint_token: backend.issue_token(),
//!     initial_execution_state: None,
//! };
//! let output = run_invocation(backend, input, |ctx| async move {
//!     let order: String = ctx.input()?;
//!     let charged: bool = ctx.step("charge", move |_| Ok(!order.is_empty())).await?;
//!     ctx.wait("settlement-delay", Duration::from_minutes(5)).await?;
//!     Ok(charged)
//! })
//! .await?;
//! # let _ = output;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod concurrency;
pub mod config;
pub mod context;
pub mod duration;
pub mod error;
pub mod handlers;
pub mod identity;
pub mod operation;
pub mod retry;
pub mod runner;
pub mod serdes;
pub mod state;
pub mod termination;

pub use backend::{
    CheckpointRequest, CheckpointResponse, ExecutionBackend, InMemoryBackend, SharedBackend,
    StepDataPage,
};
pub use concurrency::{BatchItem, BatchItemStatus, BatchResult, CompletionReason};
pub use config::{
    CallbackConfig, CompletionConfig, MapConfig, ParallelConfig, StepConfig, StepSemantics,
    WaitForConditionConfig,
};
pub use context::WorkflowContext;
pub use duration::Duration;
pub use error::{ErrorObject, TerminationReason, WorkflowError};
pub use handlers::{branch, BranchFn, Callback, PromiseFuture, StepContext, UserError};
pub use retry::{
    ExponentialBackoff, NoRetry, RetryDecision, RetryStrategy, SharedRetryStrategy, WaitDecision,
};
pub use runner::{run_invocation, InvocationInput, InvocationOutput, InvocationStatus};
pub use serdes::{JsonSerDes, SerDes};
