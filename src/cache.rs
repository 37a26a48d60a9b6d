//! Hash-keyed map of cache entries plus cache-level event fanout.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::key::QueryKey;
use crate::options::QueryOptions;
use crate::query::{FetchStatus, Query};
use crate::runtime::CacheRuntime;
use crate::subscribable::{ListenerSet, Subscription};

/// Event emitted to cache subscribers on entry lifecycle changes.
#[derive(Clone)]
pub enum CacheEvent {
    Added(Arc<Query>),
    Removed(Arc<Query>),
    Updated(Arc<Query>),
    ObserverAdded(Arc<Query>),
    ObserverRemoved(Arc<Query>),
}

impl CacheEvent {
    pub fn query(&self) -> &Arc<Query> {
        match self {
            Self::Added(q)
            | Self::Removed(q)
            | Self::Updated(q)
            | Self::ObserverAdded(q)
            | Self::ObserverRemoved(q) => q,
        }
    }
}

/// Criteria for selecting entries in bulk operations.
#[derive(Clone, Default)]
pub struct QueryFilter {
    /// Match keys with this prefix (partial deep match per segment), or the
    /// exact key when `exact` is set.
    pub key: Option<QueryKey>,
    pub exact: bool,
    pub stale: Option<bool>,
    pub fetch_status: Option<FetchStatus>,
    pub predicate: Option<Arc<dyn Fn(&Arc<Query>) -> bool + Send + Sync>>,
}

impl QueryFilter {
    pub fn key(key: impl Into<QueryKey>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::default()
        }
    }

    pub fn exact(key: impl Into<QueryKey>) -> Self {
        Self {
            key: Some(key.into()),
            exact: true,
            ..Self::default()
        }
    }

    pub fn matches(&self, query: &Arc<Query>) -> bool {
        if let Some(key) = &self.key {
            if self.exact {
                if query.key() != key {
                    return false;
                }
            } else if !key.is_prefix_of(query.key()) {
                return false;
            }
        }
        if let Some(stale) = self.stale {
            if query.is_stale() != stale {
                return false;
            }
        }
        if let Some(fetch_status) = self.fetch_status {
            if query.state().fetch_status != fetch_status {
                return false;
            }
        }
        if let Some(predicate) = &self.predicate {
            if !predicate.as_ref()(query) {
                return false;
            }
        }
        true
    }
}

/// In-memory store of all live entries for one client.
pub struct QueryCache {
    me: Weak<QueryCache>,
    runtime: Arc<CacheRuntime>,
    queries: Mutex<HashMap<String, Arc<Query>>>,
    listeners: Arc<ListenerSet<CacheEvent>>,
}

impl QueryCache {
    pub fn new(runtime: Arc<CacheRuntime>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            runtime,
            queries: Mutex::new(HashMap::new()),
            listeners: ListenerSet::new(),
        })
    }

    pub fn runtime(&self) -> &Arc<CacheRuntime> {
        &self.runtime
    }

    /// Look up the entry for `options.key`, creating it if absent. Incoming
    /// options refresh an existing entry only when they carry a producer, so
    /// a bare-key lookup cannot clobber a registered one.
    pub fn build(&self, options: QueryOptions) -> Arc<Query> {
        let hash = options.key.hash();
        let existing = self.queries.lock().get(&hash).cloned();
        match existing {
            Some(query) => {
                if options.query_fn.is_some() {
                    query.set_options(options);
                }
                query
            }
            None => {
                let query = Query::new(self.me.clone(), Arc::clone(&self.runtime), options);
                self.queries.lock().insert(hash.clone(), Arc::clone(&query));
                debug!(query_hash = %hash, "added query");
                self.notify_event(CacheEvent::Added(Arc::clone(&query)));
                query
            }
        }
    }

    pub fn get(&self, hash: &str) -> Option<Arc<Query>> {
        self.queries.lock().get(hash).cloned()
    }

    pub fn get_by_key(&self, key: &QueryKey) -> Option<Arc<Query>> {
        self.get(&key.hash())
    }

    pub fn get_all(&self) -> Vec<Arc<Query>> {
        self.queries.lock().values().cloned().collect()
    }

    pub fn find(&self, filter: &QueryFilter) -> Option<Arc<Query>> {
        self.get_all().into_iter().find(|q| filter.matches(q))
    }

    pub fn find_all(&self, filter: &QueryFilter) -> Vec<Arc<Query>> {
        self.get_all()
            .into_iter()
            .filter(|q| filter.matches(q))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.queries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.lock().is_empty()
    }

    /// Evict `query`. No-op when the map holds a different entry under the
    /// same hash (the entry was already replaced).
    pub fn remove(&self, query: &Arc<Query>) {
        let removed = {
            let mut queries = self.queries.lock();
            match queries.get(query.hash()) {
                Some(existing) if Arc::ptr_eq(existing, query) => {
                    queries.remove(query.hash());
                    true
                }
                _ => false,
            }
        };
        if removed {
            query.destroy();
            debug!(query_hash = %query.hash(), "removed query");
            self.notify_event(CacheEvent::Removed(Arc::clone(query)));
        }
    }

    /// Evict every entry, delivering all removal notifications in one batch.
    pub fn clear(&self) {
        let all = self.get_all();
        self.runtime.notify.batch(|| {
            for query in all {
                self.remove(&query);
            }
        });
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(&CacheEvent) + Send + Sync + 'static,
    ) -> Subscription<CacheEvent> {
        self.listeners.subscribe(listener)
    }

    pub(crate) fn notify_event(&self, event: CacheEvent) {
        for listener in self.listeners.snapshot() {
            let event = event.clone();
            self.runtime
                .notify
                .schedule(Box::new(move || listener.as_ref()(&event)));
        }
    }

    /// Window regained focus: resume paused retryers and run policy-driven
    /// refetches.
    pub fn on_focus(&self) {
        for query in self.get_all() {
            query.on_focus();
        }
    }

    /// Network came back: same fan-out as focus, with the reconnect policy.
    pub fn on_online(&self) {
        for query in self.get_all() {
            query.on_online();
        }
    }
}
