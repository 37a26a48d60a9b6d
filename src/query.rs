//! Cache entry: the single source of truth for one keyed async value.
//!
//! All state mutation goes through a reducer over a tagged action enum; the
//! entry mediates its observers and the single allowed concurrent fetch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::warn;

use crate::cache::{CacheEvent, QueryCache};
use crate::error::{CancelOptions, QueryError};
use crate::gc::GcTimer;
use crate::key::QueryKey;
use crate::observer::QueryObserver;
use crate::options::{FetchOptions, QueryOptions, SetDataOptions};
use crate::retry::{AttemptFn, FetchPromise, Retryer, RetryerConfig, RetryerHooks};
use crate::runtime::CacheRuntime;
use crate::structural::replace_equal_deep;

/// Result status of the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    Pending,
    Success,
    Error,
}

/// Fetch activity of the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    Idle,
    Fetching,
    Paused,
}

/// Observable state of one cache entry.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryState {
    pub data: Option<Arc<Value>>,
    pub data_updated_at: Option<Instant>,
    pub data_update_count: u64,
    pub error: Option<QueryError>,
    pub error_updated_at: Option<Instant>,
    pub error_update_count: u64,
    pub fetch_failure_count: u32,
    pub fetch_failure_reason: Option<QueryError>,
    pub fetch_meta: Option<Value>,
    pub is_invalidated: bool,
    pub status: QueryStatus,
    pub fetch_status: FetchStatus,
}

impl Default for QueryState {
    fn default() -> Self {
        Self {
            data: None,
            data_updated_at: None,
            data_update_count: 0,
            error: None,
            error_updated_at: None,
            error_update_count: 0,
            fetch_failure_count: 0,
            fetch_failure_reason: None,
            fetch_meta: None,
            is_invalidated: false,
            status: QueryStatus::Pending,
            fetch_status: FetchStatus::Idle,
        }
    }
}

/// Partial state for manual overrides via [`Query::set_state`].
#[derive(Debug, Clone, Default)]
pub struct QueryStatePatch {
    pub data: Option<Option<Arc<Value>>>,
    pub data_updated_at: Option<Option<Instant>>,
    pub error: Option<Option<QueryError>>,
    pub error_updated_at: Option<Option<Instant>>,
    pub status: Option<QueryStatus>,
    pub fetch_status: Option<FetchStatus>,
    pub is_invalidated: Option<bool>,
}

/// Lifecycle events applied through the reducer.
#[derive(Debug, Clone)]
pub(crate) enum Action {
    Fetch {
        meta: Option<Value>,
        can_start: bool,
    },
    Success {
        data: Arc<Value>,
        updated_at: Instant,
        manual: bool,
    },
    Error {
        error: QueryError,
        at: Instant,
    },
    Failed {
        failure_count: u32,
        error: QueryError,
    },
    Pause,
    Continue,
    Invalidate,
    SetState {
        patch: QueryStatePatch,
    },
}

/// Pure transition function. `revert` is the pre-fetch snapshot used when a
/// cancellation asks for rollback.
pub(crate) fn reduce(state: &QueryState, action: Action, revert: Option<&QueryState>) -> QueryState {
    match action {
        Action::Fetch { meta, can_start } => {
            let mut next = state.clone();
            next.fetch_failure_count = 0;
            next.fetch_failure_reason = None;
            next.fetch_meta = meta;
            next.fetch_status = if can_start {
                FetchStatus::Fetching
            } else {
                FetchStatus::Paused
            };
            if next.data.is_none() {
                next.error = None;
                next.status = QueryStatus::Pending;
            }
            next
        }
        Action::Success {
            data,
            updated_at,
            manual,
        } => {
            let mut next = state.clone();
            next.data = Some(data);
            next.data_updated_at = Some(updated_at);
            next.data_update_count += 1;
            next.error = None;
            next.is_invalidated = false;
            next.status = QueryStatus::Success;
            if !manual {
                next.fetch_status = FetchStatus::Idle;
                next.fetch_failure_count = 0;
                next.fetch_failure_reason = None;
            }
            next
        }
        Action::Error { error, at } => {
            if error.cancel_revert() {
                if let Some(revert_state) = revert {
                    let mut next = revert_state.clone();
                    next.fetch_status = FetchStatus::Idle;
                    return next;
                }
            }
            let mut next = state.clone();
            next.error = Some(error.clone());
            next.error_updated_at = Some(at);
            next.error_update_count += 1;
            next.fetch_failure_count += 1;
            next.fetch_failure_reason = Some(error);
            next.fetch_status = FetchStatus::Idle;
            next.status = QueryStatus::Error;
            next
        }
        Action::Failed {
            failure_count,
            error,
        } => {
            let mut next = state.clone();
            next.fetch_failure_count = failure_count;
            next.fetch_failure_reason = Some(error);
            next
        }
        Action::Pause => {
            let mut next = state.clone();
            next.fetch_status = FetchStatus::Paused;
            next
        }
        Action::Continue => {
            let mut next = state.clone();
            next.fetch_status = FetchStatus::Fetching;
            next
        }
        Action::Invalidate => {
            let mut next = state.clone();
            next.is_invalidated = true;
            next
        }
        Action::SetState { patch } => {
            let mut next = state.clone();
            if let Some(data) = patch.data {
                next.data = data;
            }
            if let Some(at) = patch.data_updated_at {
                next.data_updated_at = at;
            }
            if let Some(error) = patch.error {
                next.error = error;
            }
            if let Some(at) = patch.error_updated_at {
                next.error_updated_at = at;
            }
            if let Some(status) = patch.status {
                next.status = status;
            }
            if let Some(fetch_status) = patch.fetch_status {
                next.fetch_status = fetch_status;
            }
            if let Some(invalidated) = patch.is_invalidated {
                next.is_invalidated = invalidated;
            }
            next
        }
    }
}

/// Cooperative cancellation signal handed to producers.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when the fetch is cancelled. Never resolves if it settles
    /// normally.
    pub async fn aborted(mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Sender gone without firing; cancellation can no longer
                // happen.
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Per-fetch context passed to the producer function.
#[derive(Clone)]
pub struct FetchContext {
    key: QueryKey,
    meta: Option<Value>,
    signal_rx: watch::Receiver<bool>,
    signal_consumed: Arc<AtomicBool>,
}

impl FetchContext {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn meta(&self) -> Option<&Value> {
        self.meta.as_ref()
    }

    /// Take the abort signal. Consuming it tells the entry that the producer
    /// observes cancellation, which changes how an abandoned fetch is torn
    /// down (full cancel with revert instead of letting the attempt finish).
    pub fn signal(&self) -> AbortSignal {
        self.signal_consumed.store(true, Ordering::SeqCst);
        AbortSignal {
            rx: self.signal_rx.clone(),
        }
    }
}

#[derive(Clone)]
struct ActiveFetch {
    retryer: Retryer,
    promise: FetchPromise,
    signal_consumed: Arc<AtomicBool>,
}

/// One cached async result, keyed by its canonical hash.
pub struct Query {
    me: Weak<Query>,
    key: QueryKey,
    hash: String,
    cache: Weak<QueryCache>,
    runtime: Arc<CacheRuntime>,
    options: Mutex<QueryOptions>,
    state: Mutex<QueryState>,
    revert_state: Mutex<Option<QueryState>>,
    observers: Mutex<Vec<(u64, Weak<QueryObserver>)>>,
    active: Mutex<Option<ActiveFetch>>,
    gc: GcTimer,
}

impl Query {
    pub(crate) fn new(
        cache: Weak<QueryCache>,
        runtime: Arc<CacheRuntime>,
        options: QueryOptions,
    ) -> Arc<Self> {
        let query = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            key: options.key.clone(),
            hash: options.key.hash(),
            cache,
            runtime,
            gc: GcTimer::new(options.gc_time.as_duration()),
            options: Mutex::new(options),
            state: Mutex::new(QueryState::default()),
            revert_state: Mutex::new(None),
            observers: Mutex::new(Vec::new()),
            active: Mutex::new(None),
        });
        query.schedule_gc();
        query
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn state(&self) -> QueryState {
        self.state.lock().clone()
    }

    pub fn options(&self) -> QueryOptions {
        self.options.lock().clone()
    }

    pub(crate) fn set_options(&self, options: QueryOptions) {
        self.gc.update_gc_time(options.gc_time.as_duration());
        *self.options.lock() = options;
    }

    /// Number of live observers.
    pub fn observer_count(&self) -> usize {
        self.observers_snapshot().len()
    }

    pub(crate) fn observers_snapshot(&self) -> Vec<Arc<QueryObserver>> {
        self.observers
            .lock()
            .iter()
            .filter_map(|(_, weak)| weak.upgrade())
            .collect()
    }

    /// True when at least one enabled observer is attached.
    pub fn is_active(&self) -> bool {
        self.observers_snapshot()
            .iter()
            .any(|observer| observer.is_enabled())
    }

    pub fn is_fetching(&self) -> bool {
        self.state.lock().fetch_status == FetchStatus::Fetching
    }

    /// Stale when any observer computes stale; with no observers, when
    /// invalidated or without data.
    pub fn is_stale(&self) -> bool {
        let observers = self.observers_snapshot();
        if !observers.is_empty() {
            return observers
                .iter()
                .any(|observer| observer.current_result().is_stale);
        }
        let state = self.state.lock();
        state.is_invalidated || state.data.is_none()
    }

    /// Time-based staleness: invalidated, no data, or data older than
    /// `stale_time`.
    pub fn is_stale_by_time(&self, stale_time: Duration) -> bool {
        let state = self.state.lock();
        if state.is_invalidated || state.data.is_none() {
            return true;
        }
        match state.data_updated_at {
            None => true,
            Some(updated_at) => Instant::now().duration_since(updated_at) >= stale_time,
        }
    }

    /// Start or join a fetch. At most one fetch runs per entry: a second
    /// call without `cancel_refetch` returns the in-flight promise.
    pub fn fetch(&self, fetch_options: FetchOptions) -> FetchPromise {
        if self.state.lock().fetch_status != FetchStatus::Idle {
            let active = self.active.lock().clone();
            if let Some(active) = active {
                let has_data = self.state.lock().data.is_some();
                if fetch_options.cancel_refetch && has_data {
                    // Silently drop the in-flight fetch and start over.
                    active.retryer.cancel(CancelOptions::silent());
                } else {
                    // Coalesce: a joining consumer also re-allows retries a
                    // departing one may have cancelled.
                    active.retryer.continue_retry();
                    return active.promise;
                }
            }
        }

        let options = self.options.lock().clone();

        let (abort_tx, abort_rx) = watch::channel(false);
        let signal_consumed = Arc::new(AtomicBool::new(false));
        let context = FetchContext {
            key: self.key.clone(),
            meta: options.meta.clone(),
            signal_rx: abort_rx,
            signal_consumed: Arc::clone(&signal_consumed),
        };

        let attempt: AttemptFn = match options.query_fn.clone() {
            Some(query_fn) => Box::new(move || {
                let fut = query_fn.as_ref()(context.clone());
                async move {
                    match fut.await {
                        Ok(Some(value)) => Ok(Arc::new(value)),
                        Ok(None) => Err(QueryError::NoData),
                        Err(error) => Err(QueryError::producer(error)),
                    }
                }
                .boxed()
            }),
            None => {
                warn!(query_hash = %self.hash, "fetch requested without a query function");
                let hash = self.hash.clone();
                Box::new(move || {
                    let hash = hash.clone();
                    async move { Err(QueryError::MissingQueryFn(hash)) }.boxed()
                })
            }
        };

        let weak = self.me.clone();
        let hooks = RetryerHooks {
            on_success: Box::new({
                let weak = weak.clone();
                move |data| {
                    if let Some(query) = weak.upgrade() {
                        query.on_fetch_success(Arc::clone(data));
                    }
                }
            }),
            on_error: Box::new({
                let weak = weak.clone();
                move |error| {
                    if let Some(query) = weak.upgrade() {
                        query.on_fetch_error(error.clone());
                    }
                }
            }),
            on_fail: Box::new({
                let weak = weak.clone();
                move |failure_count, error| {
                    if let Some(query) = weak.upgrade() {
                        query.dispatch(Action::Failed {
                            failure_count,
                            error: error.clone(),
                        });
                    }
                }
            }),
            on_pause: Box::new({
                let weak = weak.clone();
                move || {
                    if let Some(query) = weak.upgrade() {
                        query.dispatch(Action::Pause);
                    }
                }
            }),
            on_continue: Box::new({
                let weak = weak.clone();
                move || {
                    if let Some(query) = weak.upgrade() {
                        query.dispatch(Action::Continue);
                    }
                }
            }),
            abort: Box::new(move || {
                let _ = abort_tx.send(true);
            }),
        };

        let retryer = Retryer::new(RetryerConfig {
            attempt,
            retry: options.retry.clone(),
            retry_delay: options.retry_delay.clone(),
            network_mode: options.network_mode,
            runtime: Arc::clone(&self.runtime),
            hooks,
        });
        let promise = retryer.promise();

        *self.revert_state.lock() = Some(self.state.lock().clone());
        *self.active.lock() = Some(ActiveFetch {
            retryer: retryer.clone(),
            promise: promise.clone(),
            signal_consumed,
        });

        let can_start = options.network_mode.can_start(&self.runtime);
        self.dispatch(Action::Fetch {
            meta: options.meta,
            can_start,
        });

        retryer.start()
    }

    /// Manually record data, structurally shared against the previous value.
    pub fn set_data(&self, value: Value, options: SetDataOptions) -> Arc<Value> {
        let data = self.share_with_previous(value);
        self.dispatch(Action::Success {
            data: Arc::clone(&data),
            updated_at: options.updated_at.unwrap_or_else(Instant::now),
            manual: true,
        });
        data
    }

    /// Manual partial-state override.
    pub fn set_state(&self, patch: QueryStatePatch) {
        self.dispatch(Action::SetState { patch });
    }

    /// Cancel the active fetch, if any, and wait for it to settle.
    pub async fn cancel(&self, options: CancelOptions) {
        let active = self.active.lock().clone();
        if let Some(active) = active {
            active.retryer.cancel(options);
            let _ = active.promise.await;
        }
    }

    /// Mark the entry as needing a refetch. Idempotent: only the first call
    /// dispatches.
    pub fn invalidate(&self) {
        if !self.state.lock().is_invalidated {
            self.dispatch(Action::Invalidate);
        }
    }

    pub(crate) fn add_observer(&self, observer: &Arc<QueryObserver>) {
        let added = {
            let mut observers = self.observers.lock();
            if observers.iter().any(|(id, _)| *id == observer.id()) {
                false
            } else {
                observers.push((observer.id(), Arc::downgrade(observer)));
                true
            }
        };
        if added {
            self.gc.clear();
            self.notify_cache(CacheEvent::ObserverAdded);
        }
    }

    pub(crate) fn remove_observer(&self, observer_id: u64) {
        let (removed, now_empty) = {
            let mut observers = self.observers.lock();
            let before = observers.len();
            observers.retain(|(id, weak)| *id != observer_id && weak.strong_count() > 0);
            (observers.len() < before, observers.is_empty())
        };
        if !removed {
            return;
        }
        if now_empty {
            let active = self.active.lock().clone();
            if let Some(active) = active {
                if active.signal_consumed.load(Ordering::SeqCst) {
                    active.retryer.cancel(CancelOptions::revert());
                } else {
                    active.retryer.cancel_retry();
                }
            }
            self.schedule_gc();
        }
        self.notify_cache(CacheEvent::ObserverRemoved);
    }

    pub(crate) fn on_focus(&self) {
        let observers = self.observers_snapshot();
        if let Some(observer) = observers.iter().find(|o| o.should_refetch_on_focus()) {
            observer.trigger_refetch();
        }
        if let Some(active) = self.active.lock().clone() {
            active.retryer.continue_exec();
        }
    }

    pub(crate) fn on_online(&self) {
        let observers = self.observers_snapshot();
        if let Some(observer) = observers.iter().find(|o| o.should_refetch_on_reconnect()) {
            observer.trigger_refetch();
        }
        if let Some(active) = self.active.lock().clone() {
            active.retryer.continue_exec();
        }
    }

    /// Called by the cache when the entry is evicted.
    pub(crate) fn destroy(&self) {
        self.gc.clear();
        let active = self.active.lock().clone();
        if let Some(active) = active {
            active.retryer.cancel(CancelOptions::silent());
        }
    }

    fn on_fetch_success(&self, data: Arc<Value>) {
        let shared = self.share_with_previous((*data).clone());
        self.dispatch(Action::Success {
            data: shared,
            updated_at: Instant::now(),
            manual: false,
        });
        *self.active.lock() = None;
        self.schedule_gc();
    }

    fn on_fetch_error(&self, error: QueryError) {
        if !(error.is_cancelled() && error.cancel_silent()) {
            self.dispatch(Action::Error {
                error: error.clone(),
                at: Instant::now(),
            });
        }
        if !error.is_cancelled() {
            warn!(query_hash = %self.hash, error = %error, "query fetch failed");
        }
        *self.active.lock() = None;
        self.schedule_gc();
    }

    fn share_with_previous(&self, value: Value) -> Arc<Value> {
        let prev = self.state.lock().data.clone();
        match prev {
            Some(prev_data) => {
                let merged = replace_equal_deep(&prev_data, value);
                if *prev_data == merged {
                    prev_data
                } else {
                    Arc::new(merged)
                }
            }
            None => Arc::new(value),
        }
    }

    pub(crate) fn schedule_gc(&self) {
        let weak = self.me.clone();
        self.gc.schedule(move || {
            if let Some(query) = weak.upgrade() {
                query.optional_remove();
            }
        });
    }

    /// Evict only when unobserved and idle.
    fn optional_remove(&self) {
        if self.observer_count() == 0 && self.state.lock().fetch_status == FetchStatus::Idle {
            if let (Some(cache), Some(me)) = (self.cache.upgrade(), self.me.upgrade()) {
                cache.remove(&me);
            }
        }
    }

    fn notify_cache(&self, event: fn(Arc<Query>) -> CacheEvent) {
        if let (Some(cache), Some(me)) = (self.cache.upgrade(), self.me.upgrade()) {
            cache.notify_event(event(me));
        }
    }

    fn dispatch(&self, action: Action) {
        let revert = self.revert_state.lock().clone();
        {
            let mut state = self.state.lock();
            *state = reduce(&state, action, revert.as_ref());
        }
        let observers = self.observers_snapshot();
        let cache = self.cache.upgrade();
        let me = self.me.upgrade();
        self.runtime.notify.batch(|| {
            for observer in &observers {
                observer.on_query_update();
            }
            if let (Some(cache), Some(me)) = (cache, me) {
                cache.notify_event(CacheEvent::Updated(me));
            }
        });
    }
}
