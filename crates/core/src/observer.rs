//! Observer registries
//!
//! The engine exposes plain register/unregister callback sets. Reactive
//! framework bindings are external wrappers built on these.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

/// Handle returned by [`Observers::register`], used to unregister.
pub type ObserverId = u64;

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Set of callbacks notified with events of one type.
pub struct Observers<E> {
    callbacks: Mutex<HashMap<ObserverId, Callback<E>>>,
    next_id: AtomicU64,
}

impl<E> Observers<E> {
    /// Empty registry.
    pub fn new() -> Self {
        Self { callbacks: Mutex::new(HashMap::new()), next_id: AtomicU64::new(1) }
    }

    /// Register a callback; the returned id unregisters it.
    pub fn register(&self, callback: impl Fn(&E) + Send + Sync + 'static) -> ObserverId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks.lock().insert(id, Arc::new(callback));
        id
    }

    /// Remove a callback. Unknown ids are ignored.
    pub fn unregister(&self, id: ObserverId) {
        self.callbacks.lock().remove(&id);
    }

    /// Invoke every registered callback with the event.
    pub fn notify(&self, event: &E) {
        let callbacks: Vec<Callback<E>> = self.callbacks.lock().values().cloned().collect();
        for callback in callbacks {
            callback(event);
        }
    }

    /// Number of registered callbacks.
    pub fn len(&self) -> usize {
        self.callbacks.lock().len()
    }

    /// Whether no callback is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E> Default for Observers<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for Observers<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers").field("len", &self.len()).finish()
    }
}

/// Wakes the sync engine after a local write.
pub trait SyncNudge: Send + Sync {
    /// Request a debounced sync cycle.
    fn nudge(&self);
}

/// No-op nudge for contexts without a running engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullNudge;

impl SyncNudge for NullNudge {
    fn nudge(&self) {}
}

/// UI hook consulted before a remotely deleted row disappears locally.
///
/// The implementation owns the animation-tick budget: the engine awaits the
/// hook before writing the deletion, then notifies data observers.
#[async_trait]
pub trait DeletePendingObserver: Send + Sync {
    /// Called with the table and entity about to be removed or tombstoned.
    async fn on_delete_pending(&self, table: &str, entity_id: &str);
}

/// Delete observer that imposes no delay.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediateDelete;

#[async_trait]
impl DeletePendingObserver for ImmediateDelete {
    async fn on_delete_pending(&self, _table: &str, _entity_id: &str) {}
}
