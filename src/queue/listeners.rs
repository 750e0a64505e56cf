use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use parking_lot::Mutex;
use super::types::{Listener, QueueItem};

/// Snapshot listeners, keyed by registration order.
#[derive(Default)]
pub(crate) struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: Mutex<BTreeMap<u64, Listener>>,
}

impl ListenerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register and replay `items` to the new listener right away.
    pub fn register(&self, listener: Listener, items: &[QueueItem]) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().insert(id, listener.clone());
        listener(items);
        id
    }

    pub fn unregister(&self, id: u64) {
        self.listeners.lock().remove(&id);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Hand every listener its own copy of the list.
    pub fn notify(&self, items: &[QueueItem]) {
        // 先复制一份，回调里可以安全地退订
        let listeners: Vec<Listener> = self.listeners.lock().values().cloned().collect();
        for listener in listeners {
            let snapshot = items.to_vec();
            listener(&snapshot);
        }
    }
}

/// Keeps a listener registered. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    registry: Arc<ListenerRegistry>,
}

impl Subscription {
    pub(crate) fn new(id: u64, registry: Arc<ListenerRegistry>) -> Self {
        Self { id, registry }
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}
