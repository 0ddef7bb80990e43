//! Observer plumbing shared by every callback-style API.
//!
//! Listeners are registered explicitly and removed only through the returned
//! [`Unsubscribe`] handle. Dropping a handle does not end the subscription.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// A synchronous change listener.
pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Wrap a closure as a [`Listener`].
pub fn listener<T, F>(f: F) -> Listener<T>
where
    F: Fn(&T) + Send + Sync + 'static,
{
    Arc::new(f)
}

type Action = Box<dyn FnOnce() + Send>;

/// Idempotent teardown handle. Cloning shares the same underlying action.
#[derive(Clone)]
pub struct Unsubscribe {
    action: Arc<Mutex<Option<Action>>>,
}

impl Unsubscribe {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            action: Arc::new(Mutex::new(Some(Box::new(f)))),
        }
    }

    /// A handle with nothing to tear down.
    pub fn noop() -> Self {
        Self {
            action: Arc::new(Mutex::new(None)),
        }
    }

    /// Run the teardown action. Later calls do nothing.
    pub fn unsubscribe(&self) {
        let action = self.action.lock().take();
        if let Some(action) = action {
            action();
        }
    }

    pub fn is_active(&self) -> bool {
        self.action.lock().is_some()
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("active", &self.is_active())
            .finish()
    }
}

struct Registry<T> {
    next_id: u64,
    listeners: BTreeMap<u64, Listener<T>>,
}

/// Ordered set of listeners. Emission happens outside the lock, so a listener may
/// register or unsubscribe other listeners re-entrantly.
pub struct ListenerSet<T> {
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T: 'static> ListenerSet<T> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                listeners: BTreeMap::new(),
            })),
        }
    }

    pub fn add(&self, listener: Listener<T>) -> Unsubscribe {
        let id = {
            let mut registry = self.registry.lock();
            let id = registry.next_id;
            registry.next_id += 1;
            registry.listeners.insert(id, listener);
            id
        };

        let weak: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.registry);
        Unsubscribe::new(move || {
            if let Some(registry) = weak.upgrade() {
                registry.lock().listeners.remove(&id);
            }
        })
    }

    /// Call every listener in registration order.
    pub fn emit(&self, value: &T) {
        let listeners: Vec<Listener<T>> = self.registry.lock().listeners.values().cloned().collect();
        for listener in listeners {
            listener(value);
        }
    }

    pub fn len(&self) -> usize {
        self.registry.lock().listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.registry.lock().listeners.clear();
    }
}

impl<T: 'static> Default for ListenerSet<T> {
    fn default() -> Self {
        Self::new()
    }
}
