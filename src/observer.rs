//! Per-consumer subscription view over a cache entry.
//!
//! Translates raw entry state into a consumer-facing result snapshot and
//! manages the staleness and periodic-refetch timers. Which result fields a
//! consumer depends on is declared explicitly (`notify_on_change_props`);
//! with no declaration, any change notifies.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::cache::QueryCache;
use crate::error::QueryError;
use crate::options::{FetchOptions, QueryOptions, RefetchPolicy, SelectFn};
use crate::query::{FetchStatus, Query, QueryStatus};
use crate::retry::FetchPromise;
use crate::runtime::CacheRuntime;
use crate::subscribable::{ListenerSet, SubscribeHooks, Subscription};

static NEXT_OBSERVER_ID: AtomicU64 = AtomicU64::new(1);

/// Consumer-facing snapshot of one entry, as seen through an observer's
/// options. Plain data; refetching goes through [`QueryObserver::refetch`].
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub status: QueryStatus,
    pub fetch_status: FetchStatus,
    pub data: Option<Arc<Value>>,
    pub error: Option<QueryError>,
    pub data_updated_at: Option<Instant>,
    pub error_updated_at: Option<Instant>,
    pub failure_count: u32,
    pub failure_reason: Option<QueryError>,
    pub is_invalidated: bool,
    pub is_pending: bool,
    pub is_success: bool,
    pub is_error: bool,
    pub is_fetching: bool,
    pub is_paused: bool,
    pub is_loading: bool,
    pub is_refetching: bool,
    pub is_loading_error: bool,
    pub is_refetch_error: bool,
    pub is_placeholder_data: bool,
    pub is_stale: bool,
    pub is_fetched: bool,
    pub is_fetched_after_mount: bool,
}

/// Result fields a consumer can declare as tracked. The derived booleans are
/// covered by the field they are computed from (`Status`, `FetchStatus`,
/// `Data`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultField {
    Data,
    Error,
    Status,
    FetchStatus,
    DataUpdatedAt,
    ErrorUpdatedAt,
    FailureCount,
    FailureReason,
    IsInvalidated,
    IsPlaceholderData,
    IsStale,
    IsFetched,
    IsFetchedAfterMount,
}

pub(crate) fn field_changed(field: ResultField, a: &QueryResult, b: &QueryResult) -> bool {
    match field {
        ResultField::Data => a.data != b.data,
        ResultField::Error => a.error != b.error,
        ResultField::Status => a.status != b.status,
        ResultField::FetchStatus => a.fetch_status != b.fetch_status,
        ResultField::DataUpdatedAt => a.data_updated_at != b.data_updated_at,
        ResultField::ErrorUpdatedAt => a.error_updated_at != b.error_updated_at,
        ResultField::FailureCount => a.failure_count != b.failure_count,
        ResultField::FailureReason => a.failure_reason != b.failure_reason,
        ResultField::IsInvalidated => a.is_invalidated != b.is_invalidated,
        ResultField::IsPlaceholderData => a.is_placeholder_data != b.is_placeholder_data,
        ResultField::IsStale => a.is_stale != b.is_stale,
        ResultField::IsFetched => a.is_fetched != b.is_fetched,
        ResultField::IsFetchedAfterMount => a.is_fetched_after_mount != b.is_fetched_after_mount,
    }
}

struct SelectMemo {
    input: Arc<Value>,
    select: SelectFn,
    output: Result<Arc<Value>, QueryError>,
}

struct ObserverInner {
    options: QueryOptions,
    query: Arc<Query>,
    result: QueryResult,
    /// Update counts when this observer bound to the query; basis for
    /// `is_fetched_after_mount`.
    initial_counts: (u64, u64),
    select_memo: Option<SelectMemo>,
    stale_timer: Option<JoinHandle<()>>,
    interval_timer: Option<JoinHandle<()>>,
    current_interval: Option<Duration>,
}

impl ObserverInner {
    fn create_result(&mut self, query: &Arc<Query>, options: &QueryOptions) -> QueryResult {
        let state = query.state();
        let mut status = state.status;
        let mut error = state.error.clone();
        let mut data: Option<Arc<Value>> = None;
        let mut is_placeholder = false;

        if let Some(raw) = &state.data {
            match &options.select {
                Some(select) => match self.select_with_memo(raw, select) {
                    Ok(selected) => data = Some(selected),
                    Err(select_error) => {
                        error = Some(select_error);
                        status = QueryStatus::Error;
                    }
                },
                None => data = Some(Arc::clone(raw)),
            }
        }

        if data.is_none() && status == QueryStatus::Pending {
            if let Some(placeholder) = &options.placeholder_data {
                if let Some(value) = placeholder.resolve() {
                    let projected = match &options.select {
                        Some(select) => select.as_ref()(&value).ok().map(Arc::new),
                        None => Some(Arc::new(value)),
                    };
                    if let Some(projected) = projected {
                        data = Some(projected);
                        status = QueryStatus::Success;
                        is_placeholder = true;
                    }
                }
            }
        }

        let is_pending = status == QueryStatus::Pending;
        let is_error = status == QueryStatus::Error;
        let is_fetching = state.fetch_status == FetchStatus::Fetching;

        QueryResult {
            status,
            fetch_status: state.fetch_status,
            data,
            error,
            data_updated_at: state.data_updated_at,
            error_updated_at: state.error_updated_at,
            failure_count: state.fetch_failure_count,
            failure_reason: state.fetch_failure_reason.clone(),
            is_invalidated: state.is_invalidated,
            is_pending,
            is_success: status == QueryStatus::Success,
            is_error,
            is_fetching,
            is_paused: state.fetch_status == FetchStatus::Paused,
            is_loading: is_pending && is_fetching,
            is_refetching: is_fetching && !is_pending,
            is_loading_error: is_error && state.data.is_none(),
            is_refetch_error: is_error && state.data.is_some(),
            is_placeholder_data: is_placeholder,
            is_stale: query.is_stale_by_time(options.stale_time.resolve(&state)),
            is_fetched: state.data_update_count > 0 || state.error_update_count > 0,
            is_fetched_after_mount: state.data_update_count > self.initial_counts.0
                || state.error_update_count > self.initial_counts.1,
        }
    }

    /// Run the projection, memoized on the identity of both the raw data and
    /// the selector. A deep-equal re-projection keeps the previous output so
    /// downstream identity comparison still sees it as unchanged.
    fn select_with_memo(
        &mut self,
        raw: &Arc<Value>,
        select: &SelectFn,
    ) -> Result<Arc<Value>, QueryError> {
        if let Some(memo) = &self.select_memo {
            if Arc::ptr_eq(&memo.input, raw) && Arc::ptr_eq(&memo.select, select) {
                return memo.output.clone();
            }
        }
        let output = match select.as_ref()(raw) {
            Ok(selected) => {
                let shared = match self.select_memo.as_ref().map(|m| &m.output) {
                    Some(Ok(prev)) if **prev == selected => Arc::clone(prev),
                    _ => Arc::new(selected),
                };
                Ok(shared)
            }
            Err(error) => Err(QueryError::select(error)),
        };
        self.select_memo = Some(SelectMemo {
            input: Arc::clone(raw),
            select: Arc::clone(select),
            output: output.clone(),
        });
        output
    }
}

/// Subscription view over one cache entry.
pub struct QueryObserver {
    me: Weak<QueryObserver>,
    id: u64,
    cache: Arc<QueryCache>,
    runtime: Arc<CacheRuntime>,
    listeners: Arc<ListenerSet<QueryResult>>,
    inner: Mutex<ObserverInner>,
}

impl QueryObserver {
    pub fn new(cache: &Arc<QueryCache>, options: QueryOptions) -> Arc<Self> {
        let runtime = Arc::clone(cache.runtime());
        let query = cache.build(options.clone());
        let state = query.state();

        Arc::new_cyclic(|me: &Weak<QueryObserver>| {
            let on_sub = me.clone();
            let on_unsub = me.clone();
            let listeners = ListenerSet::with_hooks(SubscribeHooks {
                on_subscribe: Some(Box::new(move || {
                    if let Some(observer) = on_sub.upgrade() {
                        observer.on_mount();
                    }
                })),
                on_unsubscribe: Some(Box::new(move || {
                    if let Some(observer) = on_unsub.upgrade() {
                        observer.on_unmount();
                    }
                })),
            });

            let mut inner = ObserverInner {
                query: Arc::clone(&query),
                result: QueryResult {
                    status: QueryStatus::Pending,
                    fetch_status: FetchStatus::Idle,
                    data: None,
                    error: None,
                    data_updated_at: None,
                    error_updated_at: None,
                    failure_count: 0,
                    failure_reason: None,
                    is_invalidated: false,
                    is_pending: true,
                    is_success: false,
                    is_error: false,
                    is_fetching: false,
                    is_paused: false,
                    is_loading: false,
                    is_refetching: false,
                    is_loading_error: false,
                    is_refetch_error: false,
                    is_placeholder_data: false,
                    is_stale: true,
                    is_fetched: false,
                    is_fetched_after_mount: false,
                },
                initial_counts: (state.data_update_count, state.error_update_count),
                select_memo: None,
                stale_timer: None,
                interval_timer: None,
                current_interval: None,
                options,
            };
            let initial = {
                let q = Arc::clone(&inner.query);
                let opts = inner.options.clone();
                inner.create_result(&q, &opts)
            };
            inner.result = initial;

            Self {
                me: me.clone(),
                id: NEXT_OBSERVER_ID.fetch_add(1, Ordering::Relaxed),
                cache: Arc::clone(cache),
                runtime,
                listeners,
                inner: Mutex::new(inner),
            }
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn current_query(&self) -> Arc<Query> {
        Arc::clone(&self.inner.lock().query)
    }

    pub fn current_result(&self) -> QueryResult {
        self.inner.lock().result.clone()
    }

    /// Listen for result changes. The first subscription attaches the
    /// observer to its entry and may trigger a mount fetch.
    pub fn subscribe(
        &self,
        listener: impl Fn(&QueryResult) + Send + Sync + 'static,
    ) -> Subscription<QueryResult> {
        self.listeners.subscribe(listener)
    }

    /// Bind/build the entry for `options` and compute a result snapshot
    /// without any subscription side effects. Lets a consumer render correct
    /// loading/cached state before subscribing.
    pub fn get_optimistic_result(&self, options: &QueryOptions) -> QueryResult {
        let query = self.cache.build(options.clone());
        let mut inner = self.inner.lock();
        inner.create_result(&query, options)
    }

    /// Re-apply options, rebinding to a different entry when the key
    /// changed.
    pub fn set_options(&self, options: QueryOptions) {
        let prev_query = self.current_query();
        let query = self.cache.build(options.clone());
        let rebound = !Arc::ptr_eq(&query, &prev_query);

        {
            let mut inner = self.inner.lock();
            inner.options = options;
            if rebound {
                let state = query.state();
                inner.query = Arc::clone(&query);
                inner.initial_counts = (state.data_update_count, state.error_update_count);
                inner.select_memo = None;
            }
        }

        if rebound && self.listeners.has_listeners() {
            prev_query.remove_observer(self.id);
            if let Some(me) = self.me.upgrade() {
                query.add_observer(&me);
            }
            if self.should_fetch_on_mount() {
                let _ = self.execute_fetch(FetchOptions::default());
            }
        }
        self.update_result();
        if self.listeners.has_listeners() {
            self.update_timers();
        }
    }

    /// Imperative refetch, cancelling any in-flight fetch first.
    pub fn refetch(&self) -> FetchPromise {
        self.execute_fetch(FetchOptions::cancel_refetch())
    }

    /// Called by the cache on every mutation of the observed entry.
    pub(crate) fn on_query_update(&self) {
        self.update_result();
        if self.listeners.has_listeners() {
            self.update_timers();
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        let (query, options) = self.query_and_options();
        options.enabled.resolve(&query.state())
    }

    pub(crate) fn should_refetch_on_focus(&self) -> bool {
        self.should_refetch_on(|options| options.refetch_on_window_focus)
    }

    pub(crate) fn should_refetch_on_reconnect(&self) -> bool {
        self.should_refetch_on(|options| options.refetch_on_reconnect)
    }

    /// Event-driven refetch; joins an in-flight fetch instead of cancelling.
    pub(crate) fn trigger_refetch(&self) {
        let _ = self.execute_fetch(FetchOptions::default());
    }

    fn should_refetch_on(&self, policy: impl Fn(&QueryOptions) -> RefetchPolicy) -> bool {
        let (query, options) = self.query_and_options();
        let state = query.state();
        if !options.enabled.resolve(&state) {
            return false;
        }
        match policy(&options) {
            RefetchPolicy::Always => true,
            RefetchPolicy::IfStale => query.is_stale_by_time(options.stale_time.resolve(&state)),
            RefetchPolicy::Never => false,
        }
    }

    fn should_fetch_on_mount(&self) -> bool {
        let (query, options) = self.query_and_options();
        let state = query.state();
        if !options.enabled.resolve(&state) {
            return false;
        }
        if state.data.is_none() {
            return true;
        }
        match options.refetch_on_mount {
            RefetchPolicy::Always => true,
            RefetchPolicy::IfStale => query.is_stale_by_time(options.stale_time.resolve(&state)),
            RefetchPolicy::Never => false,
        }
    }

    fn on_mount(&self) {
        let query = self.current_query();
        if let Some(me) = self.me.upgrade() {
            query.add_observer(&me);
        }
        if self.should_fetch_on_mount() {
            let _ = self.execute_fetch(FetchOptions::default());
        } else {
            self.update_result();
        }
        self.update_timers();
    }

    fn on_unmount(&self) {
        self.clear_timers();
        self.current_query().remove_observer(self.id);
    }

    fn execute_fetch(&self, fetch_options: FetchOptions) -> FetchPromise {
        self.current_query().fetch(fetch_options)
    }

    fn update_result(&self) {
        let (prev, next, options) = {
            let mut inner = self.inner.lock();
            let query = Arc::clone(&inner.query);
            let options = inner.options.clone();
            let prev = inner.result.clone();
            let next = inner.create_result(&query, &options);
            inner.result = next.clone();
            (prev, next, options)
        };

        let changed = match &options.notify_on_change_props {
            None => prev != next,
            Some(fields) => fields
                .iter()
                .any(|field| field_changed(*field, &prev, &next)),
        };
        if !changed {
            return;
        }
        for listener in self.listeners.snapshot() {
            let result = next.clone();
            self.runtime
                .notify
                .schedule(Box::new(move || listener.as_ref()(&result)));
        }
    }

    fn update_timers(&self) {
        self.update_stale_timeout();
        self.update_refetch_interval();
    }

    /// Arm a timer that recomputes the result exactly when the entry turns
    /// stale.
    fn update_stale_timeout(&self) {
        let (query, options, already_stale) = {
            let mut inner = self.inner.lock();
            if let Some(handle) = inner.stale_timer.take() {
                handle.abort();
            }
            (
                Arc::clone(&inner.query),
                inner.options.clone(),
                inner.result.is_stale,
            )
        };
        if already_stale {
            return;
        }
        let state = query.state();
        let Some(updated_at) = state.data_updated_at else {
            return;
        };
        let stale_time = options.stale_time.resolve(&state);
        let Some(deadline) = updated_at
            .checked_add(stale_time)
            .and_then(|d| d.checked_add(Duration::from_millis(1)))
        else {
            return;
        };

        let weak = self.me.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(observer) = weak.upgrade() {
                observer.update_result();
            }
        });
        self.inner.lock().stale_timer = Some(handle);
    }

    fn update_refetch_interval(&self) {
        let (query, options) = self.query_and_options();
        let state = query.state();
        let interval = if options.enabled.resolve(&state) {
            options.refetch_interval.resolve(&state)
        } else {
            None
        };

        {
            let mut inner = self.inner.lock();
            let running = inner
                .interval_timer
                .as_ref()
                .is_some_and(|handle| !handle.is_finished());
            if inner.current_interval == interval && running {
                return;
            }
            if let Some(handle) = inner.interval_timer.take() {
                handle.abort();
            }
            inner.current_interval = interval;
        }

        let Some(period) = interval else {
            return;
        };
        let weak = self.me.clone();
        let in_background = options.refetch_interval_in_background;
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                let Some(observer) = weak.upgrade() else {
                    break;
                };
                if in_background || observer.runtime.focus.is_focused() {
                    observer.trigger_refetch();
                }
            }
        });
        self.inner.lock().interval_timer = Some(handle);
    }

    fn clear_timers(&self) {
        let mut inner = self.inner.lock();
        if let Some(handle) = inner.stale_timer.take() {
            handle.abort();
        }
        if let Some(handle) = inner.interval_timer.take() {
            handle.abort();
        }
        inner.current_interval = None;
    }

    fn query_and_options(&self) -> (Arc<Query>, QueryOptions) {
        let inner = self.inner.lock();
        (Arc::clone(&inner.query), inner.options.clone())
    }
}

impl Drop for QueryObserver {
    fn drop(&mut self) {
        self.clear_timers();
    }
}
