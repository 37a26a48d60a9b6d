//! Integrator facade over one cache and its runtime.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::cache::{QueryCache, QueryFilter};
use crate::error::{CancelOptions, QueryError};
use crate::key::QueryKey;
use crate::observer::QueryObserver;
use crate::options::{FetchOptions, QueryOptions, SetDataOptions};
use crate::query::QueryState;
use crate::retry::FetchPromise;
use crate::runtime::CacheRuntime;
use crate::subscribable::Subscription;

/// Owns a [`QueryCache`] plus its [`CacheRuntime`] and exposes the
/// key-level operations integrators call directly.
pub struct QueryClient {
    runtime: Arc<CacheRuntime>,
    cache: Arc<QueryCache>,
    mount_subscriptions: Mutex<Vec<Subscription<bool>>>,
}

impl QueryClient {
    pub fn new() -> Arc<Self> {
        Self::with_runtime(CacheRuntime::new())
    }

    /// Construct against an injected runtime (test probes, shared notify
    /// manager).
    pub fn with_runtime(runtime: Arc<CacheRuntime>) -> Arc<Self> {
        let cache = QueryCache::new(Arc::clone(&runtime));
        Arc::new(Self {
            runtime,
            cache,
            mount_subscriptions: Mutex::new(Vec::new()),
        })
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    pub fn runtime(&self) -> &Arc<CacheRuntime> {
        &self.runtime
    }

    /// Wire the cache to focus/reconnect transitions. Idempotent.
    pub fn mount(&self) {
        let mut subscriptions = self.mount_subscriptions.lock();
        if !subscriptions.is_empty() {
            return;
        }
        let cache = Arc::clone(&self.cache);
        subscriptions.push(self.runtime.focus.subscribe(move |focused| {
            if *focused {
                cache.on_focus();
            }
        }));
        let cache = Arc::clone(&self.cache);
        subscriptions.push(self.runtime.online.subscribe(move |online| {
            if *online {
                cache.on_online();
            }
        }));
    }

    pub fn unmount(&self) {
        self.mount_subscriptions.lock().clear();
    }

    /// Create an observer for `options`. Fetching and timers start on its
    /// first subscription.
    pub fn watch_query(&self, options: QueryOptions) -> Arc<QueryObserver> {
        QueryObserver::new(&self.cache, options)
    }

    /// Resolve data for a key: returns the cached value while fresh per
    /// `stale_time`, otherwise fetches.
    pub async fn fetch_query(&self, options: QueryOptions) -> Result<Arc<Value>, QueryError> {
        let stale_time = options.stale_time.clone();
        let query = self.cache.build(options);
        let state = query.state();
        if let Some(data) = state.data.clone() {
            if !query.is_stale_by_time(stale_time.resolve(&state)) {
                return Ok(data);
            }
        }
        query.fetch(FetchOptions::default()).await
    }

    /// Populate the cache ahead of use; the outcome is intentionally
    /// discarded.
    pub async fn prefetch_query(&self, options: QueryOptions) {
        let _ = self.fetch_query(options).await;
    }

    pub fn get_query_data(&self, key: &QueryKey) -> Option<Arc<Value>> {
        self.cache.get_by_key(key).and_then(|q| q.state().data)
    }

    pub fn get_query_state(&self, key: &QueryKey) -> Option<QueryState> {
        self.cache.get_by_key(key).map(|q| q.state())
    }

    /// Write data for a key directly, creating the entry if needed.
    pub fn set_query_data(&self, key: &QueryKey, value: Value) -> Arc<Value> {
        let query = self.cache.build(QueryOptions::new(key.clone()));
        query.set_data(value, SetDataOptions::default())
    }

    /// Mark matching entries invalidated (in one notification batch) and
    /// refetch the ones with active observers.
    pub async fn invalidate_queries(&self, filter: &QueryFilter) {
        let matching = self.cache.find_all(filter);
        self.runtime.notify.batch(|| {
            for query in &matching {
                query.invalidate();
            }
        });
        let fetches: Vec<FetchPromise> = matching
            .iter()
            .filter(|query| query.is_active())
            .map(|query| query.fetch(FetchOptions::cancel_refetch()))
            .collect();
        for fetch in fetches {
            let _ = fetch.await;
        }
    }

    /// Refetch matching entries with active observers.
    pub async fn refetch_queries(&self, filter: &QueryFilter) {
        let fetches: Vec<FetchPromise> = self
            .cache
            .find_all(filter)
            .iter()
            .filter(|query| query.is_active())
            .map(|query| query.fetch(FetchOptions::cancel_refetch()))
            .collect();
        for fetch in fetches {
            let _ = fetch.await;
        }
    }

    /// Cancel in-flight fetches for matching entries, reverting their state
    /// to the pre-fetch snapshot.
    pub async fn cancel_queries(&self, filter: &QueryFilter) {
        for query in self.cache.find_all(filter) {
            query.cancel(CancelOptions::revert()).await;
        }
    }

    pub fn remove_queries(&self, filter: &QueryFilter) {
        for query in self.cache.find_all(filter) {
            self.cache.remove(&query);
        }
    }

    pub fn clear(&self) {
        self.cache.clear();
    }

    /// Number of matching entries currently fetching.
    pub fn is_fetching(&self, filter: &QueryFilter) -> usize {
        self.cache
            .find_all(filter)
            .iter()
            .filter(|query| query.is_fetching())
            .count()
    }
}
