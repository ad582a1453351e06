//! In-memory registry of cancellation handles for in-flight executions.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tokio_util::sync::CancellationToken;

use super::RecordId;

/// Concurrency-safe map from execution id to its cancellation handle.
///
/// Cloning shares the same registry.
#[derive(Debug, Clone, Default)]
pub struct ExecutionTracker {
    handles: Arc<RwLock<HashMap<RecordId, CancellationToken>>>,
}

impl ExecutionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the handle for `id`.
    pub fn register(&self, id: RecordId, cancel: CancellationToken) {
        self.handles
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, cancel);
    }

    pub fn lookup(&self, id: RecordId) -> Option<CancellationToken> {
        self.handles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Remove the handle for `id`. Removing an unknown id is a no-op.
    pub fn remove(&self, id: RecordId) -> Option<CancellationToken> {
        self.handles
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    /// Look up, trigger and remove in one step. Returns whether a handle existed.
    pub fn cancel(&self, id: RecordId) -> bool {
        match self.remove(id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.handles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register `cancel` under `id` for as long as the returned guard lives.
    pub fn track(&self, id: RecordId, cancel: CancellationToken) -> Registration {
        self.register(id, cancel);
        Registration {
            tracker: self.clone(),
            id,
        }
    }
}

/// Removes its tracker entry when dropped, on every exit path including unwinding.
#[must_use = "the entry is removed as soon as the registration drops"]
pub struct Registration {
    tracker: ExecutionTracker,
    id: RecordId,
}

impl Registration {
    pub fn id(&self) -> RecordId {
        self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.tracker.remove(self.id);
    }
}
