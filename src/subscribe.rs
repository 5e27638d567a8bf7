//! Callback subscription registry
//!
//! Shared observer plumbing for the pipeline's fan-out points. Callbacks
//! are invoked synchronously, in registration order, on the thread that
//! applied the update. Handles support explicit unsubscribe without
//! polling.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// Handle returned by `subscribe`, used to unsubscribe later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Registry of subscriber callbacks for values of type `T`.
pub struct Subscribers<T> {
    callbacks: RwLock<Vec<(u64, Box<dyn Fn(&T) + Send + Sync>)>>,
    next_id: AtomicU64,
}

impl<T> Default for Subscribers<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Subscribers<T> {
    pub fn new() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a callback; returns a handle for unsubscribing.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks.write().push((id, Box::new(callback)));
        SubscriptionId(id)
    }

    /// Remove a subscriber. Returns false if the handle was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut callbacks = self.callbacks.write();
        let before = callbacks.len();
        callbacks.retain(|(cb_id, _)| *cb_id != id.0);
        callbacks.len() != before
    }

    /// Deliver one value to every subscriber, in registration order.
    pub fn notify(&self, value: &T) {
        let callbacks = self.callbacks.read();
        for (_, callback) in callbacks.iter() {
            callback(value);
        }
    }

    /// Number of registered subscribers.
    pub fn len(&self) -> usize {
        self.callbacks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.read().is_empty()
    }
}
