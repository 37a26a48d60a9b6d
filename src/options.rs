//! Configuration for cached operations and their observers.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::key::QueryKey;
use crate::observer::ResultField;
use crate::query::{FetchContext, QueryState};
use crate::retry::{NetworkMode, RetryDelay, RetryPolicy};

/// Producer of one cached value. Returning `Ok(None)` signals that no usable
/// value was produced and is surfaced as a contract-violation error.
pub type QueryFn =
    Arc<dyn Fn(FetchContext) -> BoxFuture<'static, anyhow::Result<Option<Value>>> + Send + Sync>;

/// Consumer-supplied projection applied to raw data before it reaches the
/// observer's result.
pub type SelectFn = Arc<dyn Fn(&Value) -> anyhow::Result<Value> + Send + Sync>;

/// Whether an observer may fetch automatically.
#[derive(Clone)]
pub enum Enabled {
    Bool(bool),
    Fn(Arc<dyn Fn(&QueryState) -> bool + Send + Sync>),
}

impl Enabled {
    pub fn resolve(&self, state: &QueryState) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Fn(f) => f.as_ref()(state),
        }
    }
}

impl Default for Enabled {
    fn default() -> Self {
        Self::Bool(true)
    }
}

impl From<bool> for Enabled {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// How long fetched data stays fresh.
#[derive(Clone)]
pub enum StaleTime {
    Millis(u64),
    Fn(Arc<dyn Fn(&QueryState) -> u64 + Send + Sync>),
}

impl StaleTime {
    pub fn resolve(&self, state: &QueryState) -> Duration {
        let ms = match self {
            Self::Millis(ms) => *ms,
            Self::Fn(f) => f.as_ref()(state),
        };
        Duration::from_millis(ms)
    }
}

impl Default for StaleTime {
    fn default() -> Self {
        Self::Millis(0)
    }
}

/// TTL after which an unobserved entry is evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcTime {
    Millis(u64),
    /// Keep the entry until it is removed explicitly.
    Never,
}

impl GcTime {
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Self::Millis(ms) => Some(Duration::from_millis(*ms)),
            Self::Never => None,
        }
    }
}

impl Default for GcTime {
    fn default() -> Self {
        // Five minutes, the long-lived-application default.
        Self::Millis(5 * 60 * 1000)
    }
}

/// Periodic background refetch cadence.
#[derive(Clone, Default)]
pub enum RefetchInterval {
    #[default]
    Off,
    Millis(u64),
    /// Computed from the current entry state; `None` disables the timer.
    Fn(Arc<dyn Fn(&QueryState) -> Option<u64> + Send + Sync>),
}

impl RefetchInterval {
    pub fn resolve(&self, state: &QueryState) -> Option<Duration> {
        match self {
            Self::Off => None,
            Self::Millis(ms) => Some(Duration::from_millis(*ms)),
            Self::Fn(f) => f.as_ref()(state).map(Duration::from_millis),
        }
        .filter(|d| !d.is_zero())
    }
}

/// When an environment event (mount, window focus, reconnect) should trigger
/// a refetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefetchPolicy {
    Never,
    /// Refetch only when the entry is stale.
    #[default]
    IfStale,
    Always,
}

/// Substitute data shown while an entry is still pending.
#[derive(Clone)]
pub enum PlaceholderData {
    Value(Value),
    Fn(Arc<dyn Fn() -> Option<Value> + Send + Sync>),
}

impl PlaceholderData {
    pub fn resolve(&self) -> Option<Value> {
        match self {
            Self::Value(v) => Some(v.clone()),
            Self::Fn(f) => f.as_ref()(),
        }
    }
}

/// Full configuration for one cached operation and the observers watching
/// it. Constructed with [`QueryOptions::new`] plus struct-update syntax.
#[derive(Clone)]
pub struct QueryOptions {
    pub key: QueryKey,
    pub query_fn: Option<QueryFn>,
    pub enabled: Enabled,
    pub retry: RetryPolicy,
    pub retry_delay: RetryDelay,
    pub network_mode: NetworkMode,
    pub stale_time: StaleTime,
    pub gc_time: GcTime,
    pub refetch_interval: RefetchInterval,
    pub refetch_interval_in_background: bool,
    pub refetch_on_window_focus: RefetchPolicy,
    pub refetch_on_reconnect: RefetchPolicy,
    pub refetch_on_mount: RefetchPolicy,
    pub select: Option<SelectFn>,
    pub placeholder_data: Option<PlaceholderData>,
    /// Result fields whose changes should notify this observer's listeners.
    /// `None` notifies on any change.
    pub notify_on_change_props: Option<Vec<ResultField>>,
    /// Opaque metadata handed to the producer through [`FetchContext`].
    pub meta: Option<Value>,
}

impl QueryOptions {
    pub fn new(key: impl Into<QueryKey>) -> Self {
        Self {
            key: key.into(),
            ..Self::default()
        }
    }

    /// Convenience for the common case of a key plus a producer.
    pub fn with_query_fn(key: impl Into<QueryKey>, query_fn: QueryFn) -> Self {
        Self {
            key: key.into(),
            query_fn: Some(query_fn),
            ..Self::default()
        }
    }
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            key: QueryKey::new(Vec::new()),
            query_fn: None,
            enabled: Enabled::default(),
            retry: RetryPolicy::default(),
            retry_delay: RetryDelay::default(),
            network_mode: NetworkMode::default(),
            stale_time: StaleTime::default(),
            gc_time: GcTime::default(),
            refetch_interval: RefetchInterval::default(),
            refetch_interval_in_background: false,
            refetch_on_window_focus: RefetchPolicy::default(),
            refetch_on_reconnect: RefetchPolicy::default(),
            refetch_on_mount: RefetchPolicy::default(),
            select: None,
            placeholder_data: None,
            notify_on_change_props: None,
            meta: None,
        }
    }
}

impl fmt::Debug for QueryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("key", &self.key)
            .field("has_query_fn", &self.query_fn.is_some())
            .field("retry", &self.retry)
            .field("network_mode", &self.network_mode)
            .field("gc_time", &self.gc_time)
            .finish_non_exhaustive()
    }
}

/// Per-call fetch behavior.
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchOptions {
    /// Cancel an in-flight fetch (silently) and start over, instead of
    /// coalescing onto its promise. Only applies once the entry has data.
    pub cancel_refetch: bool,
}

impl FetchOptions {
    pub fn cancel_refetch() -> Self {
        Self {
            cancel_refetch: true,
        }
    }
}

/// Behavior of a manual [`crate::query::Query::set_data`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SetDataOptions {
    /// Override the recorded update instant (e.g. for data restored from
    /// persistence).
    pub updated_at: Option<tokio::time::Instant>,
}
