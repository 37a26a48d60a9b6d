//! Generic listener registry with first/last-subscriber hooks.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Hooks fired when the set transitions between empty and non-empty. Used to
/// attach and detach platform glue lazily.
#[derive(Default)]
pub struct SubscribeHooks {
    pub on_subscribe: Option<Box<dyn Fn() + Send + Sync>>,
    pub on_unsubscribe: Option<Box<dyn Fn() + Send + Sync>>,
}

struct Inner<T> {
    next_id: u64,
    listeners: Vec<(u64, Listener<T>)>,
}

/// Set of callbacks invoked on every notification, in no particular order.
pub struct ListenerSet<T> {
    me: Weak<ListenerSet<T>>,
    inner: Mutex<Inner<T>>,
    hooks: SubscribeHooks,
}

impl<T> ListenerSet<T> {
    pub fn new() -> Arc<Self> {
        Self::with_hooks(SubscribeHooks::default())
    }

    pub fn with_hooks(hooks: SubscribeHooks) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            inner: Mutex::new(Inner {
                next_id: 0,
                listeners: Vec::new(),
            }),
            hooks,
        })
    }

    /// Register `listener`. The returned guard removes it when dropped or
    /// explicitly unsubscribed. The first registration fires `on_subscribe`.
    pub fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Subscription<T> {
        let (id, first) = {
            let mut inner = self.inner.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            let first = inner.listeners.is_empty();
            inner.listeners.push((id, Arc::new(listener)));
            (id, first)
        };
        if first {
            if let Some(hook) = &self.hooks.on_subscribe {
                hook();
            }
        }
        Subscription {
            set: self.me.clone(),
            id,
            active: true,
        }
    }

    pub fn has_listeners(&self) -> bool {
        !self.inner.lock().listeners.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_listeners()
    }

    /// Snapshot of the current listeners; callers invoke them without any
    /// lock held so listeners may re-enter the set.
    pub fn snapshot(&self) -> Vec<Listener<T>> {
        self.inner
            .lock()
            .listeners
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect()
    }

    /// Invoke every listener with `value`.
    pub fn emit(&self, value: &T) {
        for listener in self.snapshot() {
            listener.as_ref()(value);
        }
    }

    fn unsubscribe(&self, id: u64) {
        let last = {
            let mut inner = self.inner.lock();
            let before = inner.listeners.len();
            inner.listeners.retain(|(lid, _)| *lid != id);
            before > 0 && inner.listeners.is_empty()
        };
        if last {
            if let Some(hook) = &self.hooks.on_unsubscribe {
                hook();
            }
        }
    }
}

/// Guard for one registered listener.
pub struct Subscription<T> {
    set: Weak<ListenerSet<T>>,
    id: u64,
    active: bool,
}

impl<T> Subscription<T> {
    /// Remove the listener now. Removing the last one fires `on_unsubscribe`.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(set) = self.set.upgrade() {
            set.unsubscribe(self.id);
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.release();
    }
}
