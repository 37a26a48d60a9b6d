//! Keyed async result cache with retry, staleness tracking, and observer
//! notifications.
//!
//! This library provides the client-side caching pipeline for arbitrary
//! async producers:
//! - **Request coalescing**: at most one fetch per key; concurrent callers
//!   share the in-flight promise
//! - **Retry**: capped exponential backoff with focus/online gating and
//!   cooperative cancellation
//! - **Staleness**: per-observer stale windows, invalidation, refetch on
//!   focus/reconnect/interval
//! - **Batched notifications**: all observers of a transaction see one
//!   consistent flush
//! - **Garbage collection**: unobserved entries are evicted after a TTL
//!
//! # Architecture
//!
//! ```text
//! QueryClient ──► QueryCache ──► Query (one per canonical key hash)
//!                     │             │
//!                     │             ├── reducer: Fetch/Success/Error/...
//!                     │             ├── Retryer (one per in-flight fetch)
//!                     │             └── GcTimer (TTL eviction)
//!                     │
//!                     └─ notifies ─► QueryObserver ──► consumer listeners
//!                                        (result snapshot + timers)
//!
//! CacheRuntime: FocusManager + OnlineManager gate fetch/retry;
//!               NotifyManager batches all delivery.
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use futures_util::FutureExt;
//! use query_cache::{QueryClient, QueryKey, QueryOptions};
//! use serde_json::{json, Value};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = QueryClient::new();
//!     client.mount();
//!
//!     let options = QueryOptions::with_query_fn(
//!         QueryKey::from(["todos"]),
//!         Arc::new(|_ctx| {
//!             async move {
//!                 // Any async source: HTTP call, database read, ...
//!                 Ok::<_, anyhow::Error>(Some(json!([{"id": 1, "done": false}])))
//!             }
//!             .boxed()
//!         }),
//!     );
//!
//!     // Resolves from the producer, then from cache while fresh.
//!     let todos: Arc<Value> = client.fetch_query(options.clone()).await?;
//!     println!("{todos}");
//!
//!     // Observe the entry; listeners fire on every relevant change.
//!     let observer = client.watch_query(options);
//!     let _subscription = observer.subscribe(|result| {
//!         println!("stale: {}, fetching: {}", result.is_stale, result.is_fetching);
//!     });
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod client;
pub mod error;
mod gc;
pub mod key;
pub mod notify;
pub mod observer;
pub mod options;
pub mod query;
pub mod retry;
pub mod runtime;
pub mod structural;
pub mod subscribable;

pub use cache::{CacheEvent, QueryCache, QueryFilter};
pub use client::QueryClient;
pub use error::{CancelOptions, QueryError};
pub use key::{hash_query_key, QueryKey};
pub use notify::NotifyManager;
pub use observer::{QueryObserver, QueryResult, ResultField};
pub use options::{
    Enabled, FetchOptions, GcTime, PlaceholderData, QueryFn, QueryOptions, RefetchInterval,
    RefetchPolicy, SelectFn, SetDataOptions, StaleTime,
};
pub use query::{
    AbortSignal, FetchContext, FetchStatus, Query, QueryState, QueryStatePatch, QueryStatus,
};
pub use retry::{
    default_retry_delay, FetchOutcome, FetchPromise, NetworkMode, RetryDelay, RetryPolicy,
};
pub use runtime::{CacheRuntime, FocusManager, OnlineManager};
pub use structural::replace_equal_deep;
pub use subscribable::{ListenerSet, SubscribeHooks, Subscription};
