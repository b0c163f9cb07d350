//! Execution state: replay cache, checkpoint queue, and the lookup wrapper
//! handlers replay against.

mod execution_state;
pub(crate) mod queue;

pub use execution_state::{CheckpointedResult, ExecutionState};
pub use queue::CheckpointQueue;
