//! Task observers and the registry that holds them.
//!
//! Listeners never run inline with the state machine: each notification is
//! its own job submitted through the dispatcher with the task's affinity, so
//! a slow or reentrant listener cannot stall a transition or re-enter the
//! task synchronously.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::FailureCause;
use crate::util::lock_unpoisoned;

/// Observer of a task's lifecycle.
///
/// All methods default to no-ops so implementors override only what they
/// care about. `task_id` identifies the originating task; `cause` on
/// `on_failed` distinguishes cancellation, stop requests, and work errors.
#[async_trait]
pub trait TaskListener: Send + Sync {
    async fn on_started(&self, task_id: &str) {
        let _ = task_id;
    }

    async fn on_completed(&self, task_id: &str) {
        let _ = task_id;
    }

    async fn on_failed(&self, task_id: &str, cause: &FailureCause) {
        let _ = (task_id, cause);
    }
}

/// Ordered listener registry owned by a task.
///
/// Notification works on a snapshot: adds and removals during an in-flight
/// batch affect later notifications only.
#[derive(Default)]
pub struct ListenerSet {
    listeners: Mutex<Vec<Arc<dyn TaskListener>>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn TaskListener>) {
        lock_unpoisoned(&self.listeners).push(listener);
    }

    pub fn add_all(&self, listeners: impl IntoIterator<Item = Arc<dyn TaskListener>>) {
        lock_unpoisoned(&self.listeners).extend(listeners);
    }

    /// Remove a listener by identity (the same `Arc`). Removing a listener
    /// that was never added is a no-op.
    pub fn remove(&self, listener: &Arc<dyn TaskListener>) {
        lock_unpoisoned(&self.listeners).retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Remove the listener at `position` in registration order, if present.
    pub fn remove_at(&self, position: usize) {
        let mut listeners = lock_unpoisoned(&self.listeners);
        if position < listeners.len() {
            listeners.remove(position);
        }
    }

    pub fn clear(&self) {
        lock_unpoisoned(&self.listeners).clear();
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.listeners).len()
    }

    pub fn is_empty(&self) -> bool {
        lock_unpoisoned(&self.listeners).is_empty()
    }

    /// Copy of the current listener list, for one notification batch.
    pub fn snapshot(&self) -> Vec<Arc<dyn TaskListener>> {
        lock_unpoisoned(&self.listeners).clone()
    }
}

impl std::fmt::Debug for ListenerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSet")
            .field("len", &self.len())
            .finish()
    }
}
