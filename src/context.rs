//! The workflow context: the handle workflow code uses to declare durable
//! operations.
//!
//! A context is bound to one naming scope. The root context covers top-level
//! code; child contexts are handed to `run_in_child_context` closures and
//! concurrent branches. Contexts are cheap to clone, but each clone stays
//! bound to its scope: using a parent's context inside a branch fails before
//! any state is written.
//!
//! Every method claims its operation id the moment it is called, before the
//! returned future is first polled. Declaring an operation is what consumes
//! its slot in the scope, so a combinator whose cached outcome replays
//! without driving its members still sees the members' ids consumed, and
//! anonymous operations declared afterwards keep their positions.

use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::concurrency::{BatchItem, BatchResult};
use crate::config::{
    CallbackConfig, MapConfig, ParallelConfig, StepConfig, WaitForConditionConfig,
};
use crate::duration::Duration;
use crate::error::WorkflowError;
use crate::handlers::callback::{create_callback_handler, Callback};
use crate::handlers::child::child_handler;
use crate::handlers::concurrent::{concurrent_handler, BranchFn, ConcurrentOptions};
use crate::handlers::promise::{
    all_handler, all_settled_handler, any_handler, race_handler, PromiseFuture,
};
use crate::handlers::step::{step_handler, StepContext, UserError};
use crate::handlers::wait::wait_handler;
use crate::handlers::wait_for_condition::wait_for_condition_handler;
use crate::identity::{OperationIdentifier, Scope};
use crate::serdes::from_durable;
use crate::state::ExecutionState;

/// Handle for declaring durable operations within one scope.
#[derive(Clone)]
pub struct WorkflowContext {
    state: Arc<ExecutionState>,
    scope: Arc<Scope>,
}

impl WorkflowContext {
    /// The root context handed to the workflow function.
    pub(crate) fn root(state: Arc<ExecutionState>) -> Self {
        Self {
            state,
            scope: Arc::new(Scope::root()),
        }
    }

    /// A context scoped to a child CONTEXT operation.
    pub(crate) fn child_of(state: Arc<ExecutionState>, scope_owner_id: String) -> Self {
        Self {
            state,
            scope: Arc::new(Scope::child(scope_owner_id)),
        }
    }

    /// Resolves the identity of the next operation declared on this context.
    fn resolve(&self, name: Option<&str>) -> Result<OperationIdentifier, WorkflowError> {
        self.scope.ensure_current()?;
        Ok(self.scope.resolve(name))
    }

    /// Deserializes the execution's input.
    pub fn input<T: DeserializeOwned>(&self) -> Result<T, WorkflowError> {
        from_durable(self.state.input_raw())
    }

    /// Runs a step with default config: at-least-once, exponential backoff.
    pub fn step<'a, T, F>(
        &self,
        name: impl Into<Option<&'a str>>,
        func: F,
    ) -> impl Future<Output = Result<T, WorkflowError>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(StepContext) -> Result<T, UserError>,
    {
        self.step_with(name, StepConfig::default(), func)
    }

    /// Runs a step with explicit semantics, retry, and codec config.
    pub fn step_with<'a, T, F>(
        &self,
        name: impl Into<Option<&'a str>>,
        config: StepConfig<T>,
        func: F,
    ) -> impl Future<Output = Result<T, WorkflowError>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(StepContext) -> Result<T, UserError>,
    {
        let resolved = self.resolve(name.into());
        let state = self.state.clone();
        async move {
            let id = resolved?;
            step_handler(&state, &id, &config, func).await
        }
    }

    /// Records a durable timer and suspends until it elapses.
    pub fn wait<'a>(
        &self,
        name: impl Into<Option<&'a str>>,
        duration: Duration,
    ) -> impl Future<Output = Result<(), WorkflowError>> {
        let resolved = self.resolve(name.into());
        let state = self.state.clone();
        async move {
            let id = resolved?;
            wait_handler(&state, &id, duration).await
        }
    }

    /// Creates a callback handle for external completion.
    ///
    /// The returned handle is inert until [`Callback::result`] is awaited, so
    /// its id can first be handed to the outside world.
    pub fn create_callback<'a, T>(
        &self,
        name: impl Into<Option<&'a str>>,
        config: CallbackConfig,
    ) -> impl Future<Output = Result<Callback<T>, WorkflowError>>
    where
        T: DeserializeOwned,
    {
        let resolved = self.resolve(name.into());
        let state = self.state.clone();
        async move {
            let id = resolved?;
            create_callback_handler(&state, &id, None, &config).await
        }
    }

    /// Creates a callback, delivers its id through a retryable submitter
    /// step, and awaits the external completion.
    pub fn wait_for_callback<'a, T, F>(
        &self,
        name: impl Into<Option<&'a str>>,
        submit: F,
        config: CallbackConfig,
    ) -> impl Future<Output = Result<T, WorkflowError>>
    where
        T: DeserializeOwned,
        F: FnOnce(&str) -> Result<(), UserError>,
    {
        // Both ids are claimed at declaration: the callback record and the
        // anonymous submitter step that delivers its id.
        let resolved = self
            .resolve(name.into())
            .map(|callback_id| (callback_id, self.scope.resolve(None)));
        let state = self.state.clone();
        async move {
            let (callback_id, submit_id) = resolved?;
            let callback: Callback<T> = create_callback_handler(
                &state,
                &callback_id,
                Some(crate::operation::OperationSubType::WaitForCallback),
                &config,
            )
            .await?;

            // The submitter is a step in its own right: if delivering the id
            // to the external system fails, it retries without recreating the
            // callback record.
            let step_config = StepConfig {
                retry: config.submitter_retry.clone(),
                ..Default::default()
            };
            let delivered_id = callback.callback_id().to_string();
            step_handler::<(), _>(&state, &submit_id, &step_config, move |_| {
                submit(&delivered_id)
            })
            .await?;

            callback.result().await
        }
    }

    /// Applies a function to each item concurrently, one durable record per
    /// item.
    pub fn map<'a, T, U, F, Fut>(
        &self,
        name: impl Into<Option<&'a str>>,
        items: Vec<T>,
        func: F,
        config: MapConfig,
    ) -> impl Future<Output = Result<BatchResult<U>, WorkflowError>>
    where
        T: Send + 'static,
        U: Serialize + DeserializeOwned + Send + 'static,
        F: Fn(WorkflowContext, T, usize) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<U, WorkflowError>> + Send + 'static,
    {
        let resolved = self.resolve(name.into());
        let state = self.state.clone();
        let branches: Vec<BranchFn<U>> = items
            .into_iter()
            .enumerate()
            .map(|(index, item)| {
                let func = func.clone();
                let branch: BranchFn<U> =
                    Box::new(move |ctx| Box::pin(func(ctx, item, index)));
                branch
            })
            .collect();
        async move {
            let id = resolved?;
            concurrent_handler(
                &state,
                &id,
                branches,
                ConcurrentOptions {
                    executor_sub_type: crate::operation::OperationSubType::Map,
                    item_sub_type: crate::operation::OperationSubType::MapItem,
                    max_concurrency: config.max_concurrency,
                    completion: config.completion,
                    orphan_poll_interval: config.orphan_poll_interval,
                },
            )
            .await
        }
    }

    /// Runs heterogeneous branches concurrently. Build them with
    /// [`crate::handlers::branch`].
    pub fn parallel<'a, U>(
        &self,
        name: impl Into<Option<&'a str>>,
        branches: Vec<BranchFn<U>>,
        config: ParallelConfig,
    ) -> impl Future<Output = Result<BatchResult<U>, WorkflowError>>
    where
        U: Serialize + DeserializeOwned + Send + 'static,
    {
        let resolved = self.resolve(name.into());
        let state = self.state.clone();
        async move {
            let id = resolved?;
            concurrent_handler(
                &state,
                &id,
                branches,
                ConcurrentOptions {
                    executor_sub_type: crate::operation::OperationSubType::Parallel,
                    item_sub_type: crate::operation::OperationSubType::ParallelBranch,
                    max_concurrency: config.max_concurrency,
                    completion: config.completion,
                    orphan_poll_interval: config.orphan_poll_interval,
                },
            )
            .await
        }
    }

    /// Runs a closure in a child scope whose whole outcome is one record.
    pub fn run_in_child_context<'a, T, F, Fut>(
        &self,
        name: impl Into<Option<&'a str>>,
        func: F,
    ) -> impl Future<Output = Result<T, WorkflowError>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(WorkflowContext) -> Fut,
        Fut: Future<Output = Result<T, WorkflowError>>,
    {
        let resolved = self.resolve(name.into());
        let state = self.state.clone();
        async move {
            let id = resolved?;
            child_handler(&state, &id, None, func).await
        }
    }

    /// Polls a condition durably until the wait strategy finishes the loop.
    pub fn wait_for_condition<'a, S, F>(
        &self,
        name: impl Into<Option<&'a str>>,
        check: F,
        config: WaitForConditionConfig<S>,
    ) -> impl Future<Output = Result<S, WorkflowError>>
    where
        S: Serialize + DeserializeOwned,
        F: FnOnce(S) -> Result<S, UserError>,
    {
        let resolved = self.resolve(name.into());
        let state = self.state.clone();
        async move {
            let id = resolved?;
            wait_for_condition_handler(&state, &id, config, check).await
        }
    }

    /// Resolves when every future succeeds; rejects on the first failure.
    pub fn all<T>(
        &self,
        futures: Vec<PromiseFuture<T>>,
    ) -> impl Future<Output = Result<Vec<T>, WorkflowError>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let resolved = self.resolve(None);
        let state = self.state.clone();
        async move {
            let id = resolved?;
            all_handler(&state, &id, futures).await
        }
    }

    /// Waits for every future to settle and reports each outcome.
    pub fn all_settled<T>(
        &self,
        futures: Vec<PromiseFuture<T>>,
    ) -> impl Future<Output = Result<Vec<BatchItem<T>>, WorkflowError>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let resolved = self.resolve(None);
        let state = self.state.clone();
        async move {
            let id = resolved?;
            all_settled_handler(&state, &id, futures).await
        }
    }

    /// Settles with the first future to settle, success or failure.
    pub fn race<T>(
        &self,
        futures: Vec<PromiseFuture<T>>,
    ) -> impl Future<Output = Result<T, WorkflowError>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let resolved = self.resolve(None);
        let state = self.state.clone();
        async move {
            let id = resolved?;
            race_handler(&state, &id, futures).await
        }
    }

    /// Resolves with the first success; rejects once every future failed.
    pub fn any<T>(
        &self,
        futures: Vec<PromiseFuture<T>>,
    ) -> impl Future<Output = Result<T, WorkflowError>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let resolved = self.resolve(None);
        let state = self.state.clone();
        async move {
            let id = resolved?;
            any_handler(&state, &id, futures).await
        }
    }
}

impl std::fmt::Debug for WorkflowContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowContext")
            .field("scope", &self.scope.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::concurrency::CompletionReason;
    use crate::error::TerminationReason;
    use crate::handlers::branch;
    use crate::identity::{CURRENT_SCOPE, ROOT_SCOPE};
    use crate::operation::{Operation, OperationType};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fixture(history: Vec<Operation>) -> (Arc<InMemoryBackend>, WorkflowContext) {
        let backend = Arc::new(InMemoryBackend::new());
        let state = ExecutionState::new(backend.clone(), "arn:test", "token-0", history);
        (backend, WorkflowContext::root(state))
    }

    async fn in_root_scope<F, Fut, R>(ctx: WorkflowContext, f: F) -> R
    where
        F: FnOnce(WorkflowContext) -> Fut,
        Fut: Future<Output = R>,
    {
        CURRENT_SCOPE.scope(ROOT_SCOPE.to_string(), f(ctx)).await
    }

    #[tokio::test]
    async fn test_input_deserializes_execution_input() {
        let mut exec = Operation::started("exec-1", OperationType::Execution, None);
        exec.input = Some("{\"order_id\":\"o-42\"}".to_string());
        let (_, ctx) = fixture(vec![exec]);
        let input: serde_json::Value = ctx.input().unwrap();
        assert_eq!(input["order_id"], "o-42");
    }

    #[tokio::test]
    async fn test_anonymous_steps_replay_in_declaration_order() {
        let (backend, ctx) = fixture(vec![]);
        let a: u32 = ctx.step(None, |_| Ok(1)).await.unwrap();
        let b: u32 = ctx.step(None, |_| Ok(2)).await.unwrap();
        assert_eq!((a, b), (1, 2));

        // Same code on a fresh context sees both cached values.
        let state2 = ExecutionState::new(backend.clone(), "arn:test", "t", backend.records());
        let ctx2 = WorkflowContext::root(state2);
        let a2: u32 = ctx2
            .step(None, |_| panic!("must replay"))
            .await
            .unwrap();
        let b2: u32 = ctx2
            .step(None, |_| panic!("must replay"))
            .await
            .unwrap();
        assert_eq!((a2, b2), (1, 2));
    }

    #[tokio::test]
    async fn test_anonymous_ids_stable_after_cached_combinator() {
        let (backend, ctx) = fixture(vec![]);
        let member: PromiseFuture<u32> = Box::pin(ctx.step(None, |_| Ok(1)));
        let gathered = ctx.all(vec![member]).await.unwrap();
        let after: u32 = ctx.step(None, |_| Ok(2)).await.unwrap();
        assert_eq!((gathered[0], after), (1, 2));

        // Replay: the cached combinator never polls its member, but the
        // member was declared, so the step after it keeps its own id.
        let state2 = ExecutionState::new(backend.clone(), "arn:test", "t", backend.records());
        let ctx2 = WorkflowContext::root(state2);
        let member: PromiseFuture<u32> =
            Box::pin(ctx2.step(None, |_| panic!("member must not run")));
        let gathered = ctx2.all(vec![member]).await.unwrap();
        let after: u32 = ctx2
            .step(None, |_| panic!("must replay"))
            .await
            .unwrap();
        assert_eq!((gathered[0], after), (1, 2));
    }

    #[tokio::test]
    async fn test_map_runs_items_in_child_scopes() {
        let (_, ctx) = fixture(vec![]);
        let result = ctx
            .map(
                "double",
                vec![1u32, 2, 3],
                |item_ctx, item, _index| async move {
                    item_ctx.step("times-two", move |_| Ok(item * 2)).await
                },
                MapConfig::default(),
            )
            .await
            .unwrap();
        assert_eq!(result.completion_reason, CompletionReason::AllCompleted);
        let values: Vec<u32> = result.results().into_iter().copied().collect();
        assert_eq!(values, vec![2, 4, 6]);
    }

    #[tokio::test]
    async fn test_parallel_branches() {
        let (_, ctx) = fixture(vec![]);
        let result = ctx
            .parallel(
                "sides",
                vec![
                    branch(|ctx| async move { ctx.step("left", |_| Ok(10u32)).await }),
                    branch(|ctx| async move { ctx.step("right", |_| Ok(20u32)).await }),
                ],
                ParallelConfig::default(),
            )
            .await
            .unwrap();
        let values: Vec<u32> = result.results().into_iter().copied().collect();
        assert_eq!(values, vec![10, 20]);
    }

    #[tokio::test]
    async fn test_parent_context_rejected_inside_branch() {
        let (_, ctx) = fixture(vec![]);
        let result = in_root_scope(ctx, |ctx| async move {
            let outer = ctx.clone();
            ctx.parallel(
                "bad",
                vec![branch(move |_branch_ctx| async move {
                    // Misuse: the captured parent context, not the branch's own.
                    outer.step("stray", |_| Ok(1u32)).await
                })],
                ParallelConfig::default(),
            )
            .await
        })
        .await
        .unwrap();
        assert_eq!(result.failure_count(), 1);
        assert!(result.errors()[0].error_message.contains("scope"));
    }

    #[tokio::test]
    async fn test_wait_for_callback_submits_once_and_resumes() {
        let (backend, ctx) = fixture(vec![]);
        let submitted = Arc::new(AtomicUsize::new(0));

        let submitted1 = submitted.clone();
        let first: Result<String, _> = ctx
            .wait_for_callback(
                "approval",
                move |_callback_id| {
                    submitted1.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                CallbackConfig::default(),
            )
            .await;
        assert!(matches!(
            first,
            Err(WorkflowError::Suspended {
                reason: TerminationReason::CallbackPending
            })
        ));
        assert_eq!(submitted.load(Ordering::SeqCst), 1);

        let callback_record = backend
            .updates()
            .into_iter()
            .find(|u| u.operation_type == OperationType::Callback)
            .unwrap();
        backend.complete_callback(&callback_record.operation_id, "\"approved\"");

        // Next invocation: submitter replays, result resolves.
        let state2 = ExecutionState::new(backend.clone(), "arn:test", "t", backend.records());
        let ctx2 = WorkflowContext::root(state2);
        let submitted2 = submitted.clone();
        let second: String = ctx2
            .wait_for_callback(
                "approval",
                move |_callback_id| {
                    submitted2.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                CallbackConfig::default(),
            )
            .await
            .unwrap();
        assert_eq!(second, "approved");
        assert_eq!(submitted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_combinators_available_on_context() {
        let (_, ctx) = fixture(vec![]);
        let futures: Vec<PromiseFuture<u32>> = vec![
            Box::pin(async { Ok(1) }),
            Box::pin(async { Ok(2) }),
        ];
        let all = ctx.all(futures).await.unwrap();
        assert_eq!(all, vec![1, 2]);

        let raced: u32 = ctx
            .race(vec![Box::pin(async { Ok(9) })])
            .await
            .unwrap();
        assert_eq!(raced, 9);
    }
}
