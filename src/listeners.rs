//! Id-keyed callback registry.
//!
//! [`Listeners::add`] returns a [`ListenerId`] that later removes the callback.
//! `emit` calls every callback from a snapshot taken up front, so a callback
//! may add or remove listeners (itself included) while being called.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::sync::lock;

/// Handle identifying a registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Inner<T> {
    next_id: u64,
    callbacks: BTreeMap<ListenerId, Callback<T>>,
}

/// Broadcast list of callbacks taking `&T`.
pub struct Listeners<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> Listeners<T> {
    /// Create an empty list.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 0,
                callbacks: BTreeMap::new(),
            }),
        }
    }

    /// Register `callback` and return its id.
    pub fn add<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let mut inner = lock(&self.inner);
        let id = ListenerId(inner.next_id);
        inner.next_id += 1;
        inner.callbacks.insert(id, Arc::new(callback));
        id
    }

    /// Unregister a callback. Returns whether it was registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        lock(&self.inner).callbacks.remove(&id).is_some()
    }

    /// Call every registered callback in registration order.
    pub fn emit(&self, value: &T) {
        let snapshot: Vec<Callback<T>> = lock(&self.inner).callbacks.values().cloned().collect();
        for callback in snapshot {
            callback(value);
        }
    }

    /// Number of registered callbacks.
    pub fn len(&self) -> usize {
        lock(&self.inner).callbacks.len()
    }

    /// Check if no callback is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}
