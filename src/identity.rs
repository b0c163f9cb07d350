//! Deterministic operation identity.
//!
//! Operation ids are content-addressed: a hash over the parent scope id and a
//! positional or name key. The same code path produces the same id in every
//! invocation, which is what lets replay find cached results without any
//! coordination with the backend.

use std::sync::atomic::{AtomicU64, Ordering};

use sha2::{Digest, Sha256};

use crate::error::WorkflowError;

tokio::task_local! {
    /// The scope id of the task currently executing user code.
    ///
    /// Set by the runner for the root scope and by concurrent/child handlers
    /// for their branches; consulted before resolving any operation id.
    pub(crate) static CURRENT_SCOPE: String;
}

/// Root scope marker used when no parent operation exists.
pub(crate) const ROOT_SCOPE: &str = "";

/// Derives a deterministic operation id from the parent scope and a key.
///
/// The id is the lowercase hex of the first 16 bytes of
/// `SHA-256(parent ++ "/" ++ key)`.
pub fn hash_operation_id(parent: Option<&str>, key: &str) -> String {
    let mut hasher = Sha256::new();
    if let Some(parent) = parent {
        hasher.update(parent.as_bytes());
    }
    hasher.update(b"/");
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

/// Fully resolved identity for one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationIdentifier {
    /// The derived operation id
    pub operation_id: String,
    /// The owning scope's operation id, `None` at the root
    pub parent_id: Option<String>,
    /// Explicit name if the caller supplied one
    pub name: Option<String>,
}

/// One naming scope: the root context, a child context, or a branch.
///
/// Anonymous operations take positional keys from a per-scope counter; named
/// operations are keyed by name alone, so inserting an anonymous operation
/// between two named ones never shifts the named ids.
#[derive(Debug)]
pub struct Scope {
    /// The operation id of the owning CONTEXT record, `None` at the root
    id: Option<String>,
    counter: AtomicU64,
}

impl Scope {
    /// Creates the root scope.
    pub fn root() -> Self {
        Self {
            id: None,
            counter: AtomicU64::new(0),
        }
    }

    /// Creates a scope owned by the given CONTEXT operation.
    pub fn child(owner_operation_id: impl Into<String>) -> Self {
        Self {
            id: Some(owner_operation_id.into()),
            counter: AtomicU64::new(0),
        }
    }

    /// The owning operation id, `None` for the root scope.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// The marker value this scope installs in [`CURRENT_SCOPE`].
    pub(crate) fn marker(&self) -> String {
        self.id.clone().unwrap_or_else(|| ROOT_SCOPE.to_string())
    }

    /// Resolves the identity of the next operation declared in this scope.
    pub fn resolve(&self, name: Option<&str>) -> OperationIdentifier {
        let key = match name {
            Some(name) => format!("name:{name}"),
            None => {
                let index = self.counter.fetch_add(1, Ordering::SeqCst);
                format!("#{index}")
            }
        };
        OperationIdentifier {
            operation_id: hash_operation_id(self.id.as_deref(), &key),
            parent_id: self.id.clone(),
            name: name.map(str::to_string),
        }
    }

    /// Resolves the identity of a positional child, e.g. a map item.
    pub fn resolve_indexed(&self, index: usize) -> OperationIdentifier {
        OperationIdentifier {
            operation_id: hash_operation_id(self.id.as_deref(), &format!("#{index}")),
            parent_id: self.id.clone(),
            name: None,
        }
    }

    /// Fails if the calling task does not belong to this scope.
    ///
    /// This is the synchronous misuse check: a parent context handle captured
    /// inside a concurrent branch is rejected here, before any id is consumed
    /// or any checkpoint is enqueued.
    pub fn ensure_current(&self) -> Result<(), WorkflowError> {
        let own = self.marker();
        match CURRENT_SCOPE.try_with(|current| current.clone()) {
            Ok(current) if current != own => Err(WorkflowError::context_usage(format!(
                "context for scope {:?} used from scope {:?}; use the context passed to the branch",
                own, current
            ))),
            // Not inside a tracked task (user-spawned helper); nothing to check.
            _ => Ok(()),
        }
    }
}
