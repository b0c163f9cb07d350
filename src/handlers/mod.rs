//! Operation handlers.
//!
//! Each handler owns one operation kind end to end: replay lookup, type
//! check, execution, and checkpointing. [`crate::context::WorkflowContext`]
//! resolves identities and delegates here.

pub mod callback;
pub mod child;
pub mod concurrent;
pub mod promise;
pub mod step;
pub mod wait;
pub mod wait_for_condition;

pub use callback::Callback;
pub use concurrent::{branch, BranchFn};
pub use promise::PromiseFuture;
pub use step::{StepContext, UserError};
