//! Notification batching.
//!
//! State transitions raised inside one logical transaction are delivered
//! together after the outermost transaction ends, so consumers mutating
//! several entries in one synchronous block never observe a partial view.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

pub type NotifyCallback = Box<dyn FnOnce() + Send>;

type ScheduleFn = Arc<dyn Fn(NotifyCallback) + Send + Sync>;
type BatchNotifyFn = Arc<dyn Fn(NotifyCallback) + Send + Sync>;

struct Inner {
    transactions: usize,
    queue: Vec<NotifyCallback>,
}

/// Coalesces notification callbacks raised during a transaction into one
/// flush at the outermost `batch` boundary.
pub struct NotifyManager {
    inner: Mutex<Inner>,
    schedule_fn: RwLock<ScheduleFn>,
    batch_notify_fn: RwLock<BatchNotifyFn>,
}

impl NotifyManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                transactions: 0,
                queue: Vec::new(),
            }),
            schedule_fn: RwLock::new(Arc::new(|callback| callback())),
            batch_notify_fn: RwLock::new(Arc::new(|callback| callback())),
        }
    }

    /// Run `f` inside a transaction. Callbacks scheduled while it runs are
    /// flushed once, after `f` returns, when this is the outermost batch.
    /// The transaction counter is decremented even if `f` panics.
    pub fn batch<T>(&self, f: impl FnOnce() -> T) -> T {
        self.inner.lock().transactions += 1;
        let _guard = TransactionGuard { manager: self };
        f()
    }

    /// Enqueue `callback` if inside a transaction, otherwise hand it to the
    /// scheduler immediately.
    pub fn schedule(&self, callback: NotifyCallback) {
        {
            let mut inner = self.inner.lock();
            if inner.transactions > 0 {
                inner.queue.push(callback);
                return;
            }
        }
        let schedule = self.schedule_fn.read().clone();
        let notify = self.batch_notify_fn.read().clone();
        schedule.as_ref()(Box::new(move || notify.as_ref()(callback)));
    }

    /// Wrap `f` so every invocation is scheduled for batched delivery.
    pub fn batch_calls<A: Send + 'static>(
        self: Arc<Self>,
        f: impl Fn(A) + Send + Sync + 'static,
    ) -> impl Fn(A) {
        let manager = self;
        let f = Arc::new(f);
        move |arg: A| {
            let f = Arc::clone(&f);
            manager.schedule(Box::new(move || f.as_ref()(arg)));
        }
    }

    /// Replace the function used to hand flushed callbacks to the executor.
    /// The default runs them immediately at the flush boundary; a custom
    /// scheduler may defer to a spawned task instead.
    pub fn set_scheduler(&self, f: impl Fn(NotifyCallback) + Send + Sync + 'static) {
        *self.schedule_fn.write() = Arc::new(f);
    }

    /// Replace the function wrapping each delivered batch.
    pub fn set_batch_notify(&self, f: impl Fn(NotifyCallback) + Send + Sync + 'static) {
        *self.batch_notify_fn.write() = Arc::new(f);
    }

    fn flush(&self) {
        let queue = {
            let mut inner = self.inner.lock();
            if inner.transactions > 0 || inner.queue.is_empty() {
                return;
            }
            std::mem::take(&mut inner.queue)
        };
        let schedule = self.schedule_fn.read().clone();
        let notify = self.batch_notify_fn.read().clone();
        schedule.as_ref()(Box::new(move || {
            notify.as_ref()(Box::new(move || {
                for callback in queue {
                    callback();
                }
            }));
        }));
    }
}

impl Default for NotifyManager {
    fn default() -> Self {
        Self::new()
    }
}

struct TransactionGuard<'a> {
    manager: &'a NotifyManager,
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        self.manager.inner.lock().transactions -= 1;
        self.manager.flush();
    }
}
