//! Eviction timer for unobserved cache entries.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

/// Schedules a one-shot eviction callback after the entry's TTL. `None`
/// means never collect.
pub(crate) struct GcTimer {
    gc_time: Mutex<Option<Duration>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl GcTimer {
    pub fn new(gc_time: Option<Duration>) -> Self {
        Self {
            gc_time: Mutex::new(gc_time),
            handle: Mutex::new(None),
        }
    }

    pub fn gc_time(&self) -> Option<Duration> {
        *self.gc_time.lock()
    }

    /// Raise the effective TTL to the max of the current and new values.
    /// `None` (never collect) wins over any finite TTL.
    pub fn update_gc_time(&self, new: Option<Duration>) {
        let mut current = self.gc_time.lock();
        *current = match (*current, new) {
            (Some(a), Some(b)) => Some(a.max(b)),
            _ => None,
        };
    }

    /// Re-arm the eviction timer. Any pending timer is cleared first; with
    /// an infinite TTL nothing is armed.
    pub fn schedule(&self, evict: impl FnOnce() + Send + 'static) {
        self.clear();
        if let Some(ttl) = *self.gc_time.lock() {
            let handle = tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                evict();
            });
            *self.handle.lock() = Some(handle);
        }
    }

    pub fn clear(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for GcTimer {
    fn drop(&mut self) {
        self.clear();
    }
}
