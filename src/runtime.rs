//! Environment probes and the shared runtime context.
//!
//! Focus and online state are not process-wide singletons: a [`CacheRuntime`]
//! is constructed once and handed by `Arc` to every cache, entry, and
//! retryer, so tests can gate fetches through their own probes without
//! touching globals.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::notify::NotifyManager;
use crate::subscribable::{ListenerSet, Subscription};

type TeardownFn = Box<dyn FnOnce() + Send>;

/// Reports whether the application window is focused. Defaults to focused
/// until platform glue or a test says otherwise.
pub struct FocusManager {
    me: Weak<FocusManager>,
    listeners: Arc<ListenerSet<bool>>,
    focused: Mutex<Option<bool>>,
    cleanup: Mutex<Option<TeardownFn>>,
}

impl FocusManager {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            listeners: ListenerSet::new(),
            focused: Mutex::new(None),
            cleanup: Mutex::new(None),
        })
    }

    pub fn is_focused(&self) -> bool {
        self.focused.lock().unwrap_or(true)
    }

    /// Update the focus state. `None` falls back to the default. Listeners
    /// are invoked synchronously when the effective value changes.
    pub fn set_focused(&self, focused: Option<bool>) {
        let changed = {
            let mut current = self.focused.lock();
            let before = current.unwrap_or(true);
            *current = focused;
            before != current.unwrap_or(true)
        };
        if changed {
            let now = self.is_focused();
            debug!(focused = now, "focus state changed");
            self.listeners.emit(&now);
        }
    }

    pub fn subscribe(&self, listener: impl Fn(&bool) + Send + Sync + 'static) -> Subscription<bool> {
        self.listeners.subscribe(listener)
    }

    /// Swap the platform glue. Any previous glue is torn down first; `setup`
    /// receives a callback that feeds focus changes into this manager and
    /// returns its own teardown.
    pub fn set_event_listener<F>(&self, setup: F)
    where
        F: FnOnce(Box<dyn Fn(Option<bool>) + Send + Sync>) -> TeardownFn,
    {
        if let Some(teardown) = self.cleanup.lock().take() {
            teardown();
        }
        let me = self.me.clone();
        let teardown = setup(Box::new(move |focused| {
            if let Some(manager) = me.upgrade() {
                manager.set_focused(focused);
            }
        }));
        *self.cleanup.lock() = Some(teardown);
    }
}

/// Reports whether the network is reachable. Defaults to online.
pub struct OnlineManager {
    me: Weak<OnlineManager>,
    listeners: Arc<ListenerSet<bool>>,
    online: Mutex<bool>,
    cleanup: Mutex<Option<TeardownFn>>,
}

impl OnlineManager {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            listeners: ListenerSet::new(),
            online: Mutex::new(true),
            cleanup: Mutex::new(None),
        })
    }

    pub fn is_online(&self) -> bool {
        *self.online.lock()
    }

    pub fn set_online(&self, online: bool) {
        let changed = {
            let mut current = self.online.lock();
            let before = *current;
            *current = online;
            before != online
        };
        if changed {
            debug!(online, "online state changed");
            self.listeners.emit(&online);
        }
    }

    pub fn subscribe(&self, listener: impl Fn(&bool) + Send + Sync + 'static) -> Subscription<bool> {
        self.listeners.subscribe(listener)
    }

    pub fn set_event_listener<F>(&self, setup: F)
    where
        F: FnOnce(Box<dyn Fn(bool) + Send + Sync>) -> TeardownFn,
    {
        if let Some(teardown) = self.cleanup.lock().take() {
            teardown();
        }
        let me = self.me.clone();
        let teardown = setup(Box::new(move |online| {
            if let Some(manager) = me.upgrade() {
                manager.set_online(online);
            }
        }));
        *self.cleanup.lock() = Some(teardown);
    }
}

/// Shared context for one cache instance: environment probes plus the
/// notification batcher. Passed by `Arc` everywhere a fetch can be gated or
/// a notification raised.
pub struct CacheRuntime {
    pub focus: Arc<FocusManager>,
    pub online: Arc<OnlineManager>,
    pub notify: Arc<NotifyManager>,
}

impl CacheRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            focus: FocusManager::new(),
            online: OnlineManager::new(),
            notify: Arc::new(NotifyManager::new()),
        })
    }
}
