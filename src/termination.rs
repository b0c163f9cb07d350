//! Cooperative invocation termination.
//!
//! Handlers that need the execution to leave the host (waits, retries,
//! pending callbacks) request termination here. The runner races the workflow
//! future against [`TerminationManager::wait`]; whichever side finishes first
//! decides the invocation outcome. The manager is owned by the execution
//! state, so two executions in one process never share termination signals.

use tokio::sync::watch;

use crate::error::TerminationReason;

/// Collects termination requests for one invocation. First reason wins.
#[derive(Debug)]
pub struct TerminationManager {
    tx: watch::Sender<Option<TerminationReason>>,
}

impl Default for TerminationManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminationManager {
    /// Creates a manager with no termination requested.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Requests termination. Later requests are ignored.
    pub fn request(&self, reason: TerminationReason) {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                tracing::debug!(%reason, "invocation termination requested");
                true
            } else {
                false
            }
        });
    }

    /// The requested reason, if any.
    pub fn reason(&self) -> Option<TerminationReason> {
        *self.tx.borrow()
    }

    /// Returns true if termination has been requested.
    pub fn is_requested(&self) -> bool {
        self.reason().is_some()
    }

    /// Resolves once termination is requested.
    pub async fn wait(&self) -> TerminationReason {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(reason) = *rx.borrow_and_update() {
                return reason;
            }
            if rx.changed().await.is_err() {
                // Sender dropped with no request; nothing will ever arrive.
                std::future::pending::<()>().await;
            }
        }
    }
}
