//! The checkpoint queue.
//!
//! All updates funnel through one flusher task per execution. The flusher
//! drains whatever is queued at the moment it wakes and submits it as a single
//! backend call, so bursts of updates coalesce into one batch and flushes are
//! serialized by construction. Updates enqueued while a flush is in flight
//! simply form the next batch.
//!
//! A failed flush is fatal: every waiter is rejected, termination is
//! requested, and the queue is poisoned so later submissions fail fast. The
//! checkpoint is the durability contract; there is no silent retry.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, RwLock};

use crate::backend::{CheckpointRequest, SharedBackend};
use crate::error::{TerminationReason, WorkflowError};
use crate::operation::{Operation, OperationUpdate};
use crate::termination::TerminationManager;

type Ack = oneshot::Sender<Result<(), WorkflowError>>;

enum QueueEntry {
    Update { update: OperationUpdate, ack: Ack },
    /// Resolves once everything enqueued before it has been flushed.
    Barrier { ack: Ack },
}

/// Handle for submitting updates to the flusher task.
#[derive(Clone)]
pub struct CheckpointQueue {
    tx: mpsc::UnboundedSender<QueueEntry>,
}

impl CheckpointQueue {
    /// Spawns the flusher task and returns the submission handle.
    ///
    /// The flusher shares the replay cache with [`ExecutionState`] so every
    /// durable update is immediately visible to replay lookups, and it merges
    /// records the backend reports as changed by other invocations.
    ///
    /// [`ExecutionState`]: crate::state::ExecutionState
    pub fn spawn(
        backend: SharedBackend,
        execution_arn: String,
        initial_token: String,
        cache: Arc<RwLock<HashMap<String, Operation>>>,
        termination: Arc<TerminationManager>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_flusher(
            rx,
            backend,
            execution_arn,
            initial_token,
            cache,
            termination,
        ));
        Self { tx }
    }

    /// Submits an update and waits until it is durable.
    pub async fn submit(&self, update: OperationUpdate) -> Result<(), WorkflowError> {
        let (ack, rx) = oneshot::channel();
        self.tx
            .send(QueueEntry::Update { update, ack })
            .map_err(|_| WorkflowError::checkpoint("checkpoint queue closed"))?;
        rx.await
            .map_err(|_| WorkflowError::checkpoint("checkpoint queue dropped pending update"))?
    }

    /// Waits until everything currently queued has been flushed.
    pub async fn flush(&self) -> Result<(), WorkflowError> {
        let (ack, rx) = oneshot::channel();
        self.tx
            .send(QueueEntry::Barrier { ack })
            .map_err(|_| WorkflowError::checkpoint("checkpoint queue closed"))?;
        rx.await
            .map_err(|_| WorkflowError::checkpoint("checkpoint queue dropped pending barrier"))?
    }
}

/// Orders a batch so the EXECUTION completion, if present, goes last.
///
/// Everything else keeps submission order; starts and completions for the
/// same operation may share a batch.
fn sort_batch(updates: &mut Vec<OperationUpdate>) {
    // Stable partition: non-completions first, in original order.
    let completions: Vec<OperationUpdate> = {
        let mut completions = Vec::new();
        updates.retain(|u| {
            if u.is_execution_completion() {
                completions.push(u.clone());
                false
            } else {
                true
            }
        });
        completions
    };
    updates.extend(completions);
}

async fn run_flusher(
    mut rx: mpsc::UnboundedReceiver<QueueEntry>,
    backend: SharedBackend,
    execution_arn: String,
    mut token: String,
    cache: Arc<RwLock<HashMap<String, Operation>>>,
    termination: Arc<TerminationManager>,
) {
    let mut poisoned: Option<String> = None;

    while let Some(first) = rx.recv().await {
        let mut entries = vec![first];
        while let Ok(next) = rx.try_recv() {
            entries.push(next);
        }

        if let Some(message) = &poisoned {
            for entry in entries {
                let (QueueEntry::Update { ack, .. } | QueueEntry::Barrier { ack }) = entry;
                let _ = ack.send(Err(WorkflowError::checkpoint(message.clone())));
            }
            continue;
        }

        let mut updates = Vec::new();
        let mut acks = Vec::new();
        for entry in entries {
            match entry {
                QueueEntry::Update { update, ack } => {
                    updates.push(update);
                    acks.push(ack);
                }
                QueueEntry::Barrier { ack } => acks.push(ack),
            }
        }

        if updates.is_empty() {
            for ack in acks {
                let _ = ack.send(Ok(()));
            }
            continue;
        }

        sort_batch(&mut updates);
        tracing::debug!(
            execution_arn = %execution_arn,
            batch_size = updates.len(),
            "flushing checkpoint batch"
        );

        let request = CheckpointRequest {
            execution_arn: execution_arn.clone(),
            updates: updates.clone(),
        };
        match backend.checkpoint(&token, request).await {
            Ok(response) => {
                token = response.checkpoint_token;
                let mut cache = cache.write().await;
                for update in &updates {
                    match cache.get_mut(&update.operation_id) {
                        Some(record) => record.apply(update),
                        None => {
                            cache.insert(update.operation_id.clone(), Operation::from(update));
                        }
                    }
                }
                if let Some(page) = response.new_execution_state {
                    for incoming in page.operations {
                        merge_record(&mut cache, incoming);
                    }
                }
                drop(cache);
                for ack in acks {
                    let _ = ack.send(Ok(()));
                }
            }
            Err(error) => {
                let message = format!("checkpoint batch failed: {error}");
                tracing::error!(execution_arn = %execution_arn, %error, "checkpoint batch failed");
                termination.request(TerminationReason::CheckpointFailed);
                for ack in acks {
                    let _ = ack.send(Err(WorkflowError::checkpoint(message.clone())));
                }
                poisoned = Some(message);
            }
        }
    }
}

/// Merges a record reported by the backend into the replay cache.
///
/// Another invocation's progress only ever moves a record forward, so a
/// terminal incoming state or a higher attempt count wins; otherwise the
/// local record stands.
fn merge_record(cache: &mut HashMap<String, Operation>, incoming: Operation) {
    match cache.get(&incoming.operation_id) {
        None => {
            cache.insert(incoming.operation_id.clone(), incoming);
        }
        Some(existing) if !existing.is_terminal() => {
            if incoming.is_terminal() || incoming.attempt > existing.attempt {
                cache.insert(incoming.operation_id.clone(), incoming);
            }
        }
        Some(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::operation::{OperationStatus, OperationType};

    fn queue_over(
        backend: Arc<InMemoryBackend>,
    ) -> (
        CheckpointQueue,
        Arc<RwLock<HashMap<String, Operation>>>,
        Arc<TerminationManager>,
    ) {
        let cache = Arc::new(RwLock::new(HashMap::new()));
        let termination = Arc::new(TerminationManager::new());
        let queue = CheckpointQueue::spawn(
            backend,
            "arn:test".to_string(),
            "token-0".to_string(),
            cache.clone(),
            termination.clone(),
        );
        (queue, cache, termination)
    }

    #[tokio::test]
    async fn test_submit_applies_to_cache() {
        let backend = Arc::new(InMemoryBackend::new());
        let (queue, cache, _) = queue_over(backend.clone());

        queue
            .submit(OperationUpdate::start("op-1", OperationType::Step))
            .await
            .unwrap();

        let cache = cache.read().await;
        assert_eq!(cache["op-1"].status, OperationStatus::Started);
        assert_eq!(backend.checkpoint_calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_submissions_coalesce() {
        let backend = Arc::new(InMemoryBackend::new());
        let (queue, _, _) = queue_over(backend.clone());

        // Enqueue a burst without yielding, then await all acks. The flusher
        // wakes once and drains the burst into a single backend call.
        let mut pending = Vec::new();
        for i in 0..10 {
            let (ack, rx) = oneshot::channel();
            queue
                .tx
                .send(QueueEntry::Update {
                    update: OperationUpdate::start(format!("op-{i}"), OperationType::Step),
                    ack,
                })
                .unwrap();
            pending.push(rx);
        }
        for rx in pending {
            rx.await.unwrap().unwrap();
        }

        assert!(backend.checkpoint_calls() <= 2);
        assert_eq!(backend.updates().len(), 10);
    }

    #[tokio::test]
    async fn test_failure_rejects_waiters_and_poisons() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.fail_next_checkpoint("store unavailable");
        let (queue, _, termination) = queue_over(backend.clone());

        let result = queue
            .submit(OperationUpdate::start("op-1", OperationType::Step))
            .await;
        assert!(matches!(result, Err(WorkflowError::Checkpoint { .. })));
        assert_eq!(
            termination.reason(),
            Some(TerminationReason::CheckpointFailed)
        );

        // Poisoned: later submissions fail without reaching the backend.
        let calls = backend.checkpoint_calls();
        let result = queue
            .submit(OperationUpdate::start("op-2", OperationType::Step))
            .await;
        assert!(matches!(result, Err(WorkflowError::Checkpoint { .. })));
        assert_eq!(backend.checkpoint_calls(), calls);
    }

    #[tokio::test]
    async fn test_barrier_flushes_queued_updates() {
        let backend = Arc::new(InMemoryBackend::new());
        let (queue, _, _) = queue_over(backend.clone());

        let (ack, rx) = oneshot::channel();
        queue
            .tx
            .send(QueueEntry::Update {
                update: OperationUpdate::start("op-1", OperationType::Step),
                ack,
            })
            .unwrap();
        queue.flush().await.unwrap();
        rx.await.unwrap().unwrap();
        assert!(backend.record("op-1").is_some());
    }

    #[tokio::test]
    async fn test_new_execution_state_merges_into_cache() {
        let backend = Arc::new(InMemoryBackend::new());
        let mut sibling = Operation::started("sibling", OperationType::Step, None);
        sibling.status = OperationStatus::Succeeded;
        sibling.result = Some("42".to_string());
        backend.stage_new_state(vec![sibling]);

        let (queue, cache, _) = queue_over(backend);
        queue
            .submit(OperationUpdate::start("op-1", OperationType::Step))
            .await
            .unwrap();

        let cache = cache.read().await;
        assert_eq!(cache["sibling"].result.as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn test_execution_completion_sorted_last() {
        let mut updates = vec![
            OperationUpdate::succeed("exec", OperationType::Execution, None),
            OperationUpdate::start("op-1", OperationType::Step),
            OperationUpdate::succeed("op-1", OperationType::Step, None),
        ];
        sort_batch(&mut updates);
        assert_eq!(updates[0].operation_id, "op-1");
        assert_eq!(updates[2].operation_id, "exec");
        assert!(updates[2].is_execution_completion());
    }

    #[test]
    fn test_merge_prefers_terminal_and_newer_attempts() {
        let mut cache = HashMap::new();
        cache.insert(
            "op".to_string(),
            Operation::started("op", OperationType::Step, None),
        );

        // Non-terminal, same attempt: local record stands.
        merge_record(
            &mut cache,
            Operation::started("op", OperationType::Step, None),
        );
        assert_eq!(cache["op"].status, OperationStatus::Started);

        // Terminal incoming wins.
        let mut done = Operation::started("op", OperationType::Step, None);
        done.status = OperationStatus::Succeeded;
        merge_record(&mut cache, done);
        assert_eq!(cache["op"].status, OperationStatus::Succeeded);

        // Terminal local record is never demoted.
        merge_record(
            &mut cache,
            Operation::started("op", OperationType::Step, None),
        );
        assert_eq!(cache["op"].status, OperationStatus::Succeeded);
    }
}
