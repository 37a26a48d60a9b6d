//! Per-fetch retry state machine.
//!
//! A `Retryer` drives one producer invocation sequence to a terminal state:
//! `running → success | failed | cancelled`, with an interim `paused` state
//! while environment gating (focus/online) forbids continuing. Settlement is
//! fanned out through a shared future so coalesced callers all observe the
//! same outcome, and exactly one of the success/error hooks fires per
//! terminal state.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{oneshot, Notify};
use tracing::debug;

use crate::error::{CancelOptions, QueryError};
use crate::runtime::CacheRuntime;

/// Terminal outcome of one fetch sequence.
pub type FetchOutcome = Result<Arc<Value>, QueryError>;

/// Cloneable handle on an in-flight fetch; every clone resolves with the
/// same outcome.
pub type FetchPromise = Shared<BoxFuture<'static, FetchOutcome>>;

/// One producer invocation. Called again for each retry attempt.
pub(crate) type AttemptFn = Box<dyn FnMut() -> BoxFuture<'static, FetchOutcome> + Send>;

/// Upper bound of the default backoff curve.
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 30_000;

/// Capped exponential backoff: `min(1000 * 2^failure_count, 30_000)` ms.
pub fn default_retry_delay(failure_count: u32) -> u64 {
    1000u64
        .saturating_mul(2u64.saturating_pow(failure_count))
        .min(DEFAULT_RETRY_MAX_DELAY_MS)
}

/// Whether a failed attempt should be retried.
#[derive(Clone)]
pub enum RetryPolicy {
    Never,
    Always,
    /// Retry while `failure_count < n`, i.e. `n` retries after the initial
    /// attempt.
    Count(u32),
    Predicate(Arc<dyn Fn(u32, &QueryError) -> bool + Send + Sync>),
}

impl RetryPolicy {
    pub fn should_retry(&self, failure_count: u32, error: &QueryError) -> bool {
        match self {
            Self::Never => false,
            Self::Always => true,
            Self::Count(max) => failure_count < *max,
            Self::Predicate(f) => f.as_ref()(failure_count, error),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::Count(3)
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => write!(f, "RetryPolicy::Never"),
            Self::Always => write!(f, "RetryPolicy::Always"),
            Self::Count(n) => write!(f, "RetryPolicy::Count({n})"),
            Self::Predicate(_) => write!(f, "RetryPolicy::Predicate(..)"),
        }
    }
}

/// Delay before the next attempt, as a function of the failure count at the
/// time the attempt failed.
#[derive(Clone)]
pub enum RetryDelay {
    Millis(u64),
    Fn(Arc<dyn Fn(u32, &QueryError) -> u64 + Send + Sync>),
}

impl RetryDelay {
    pub fn delay_for(&self, failure_count: u32, error: &QueryError) -> Duration {
        let ms = match self {
            Self::Millis(ms) => *ms,
            Self::Fn(f) => f.as_ref()(failure_count, error),
        };
        Duration::from_millis(ms)
    }
}

impl Default for RetryDelay {
    fn default() -> Self {
        Self::Fn(Arc::new(|failure_count, _| default_retry_delay(failure_count)))
    }
}

impl fmt::Debug for RetryDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Millis(ms) => write!(f, "RetryDelay::Millis({ms})"),
            Self::Fn(_) => write!(f, "RetryDelay::Fn(..)"),
        }
    }
}

/// How fetches relate to network reachability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkMode {
    /// Fetch only while online; pause otherwise.
    #[default]
    Online,
    /// Fetch regardless of connectivity.
    Always,
}

impl NetworkMode {
    /// Whether a fetch may begin right now.
    pub(crate) fn can_start(&self, runtime: &CacheRuntime) -> bool {
        matches!(self, Self::Always) || runtime.online.is_online()
    }

    /// Whether a retry may continue after its backoff delay. Stricter than
    /// starting: an unfocused window also holds the retry.
    pub(crate) fn can_continue(&self, runtime: &CacheRuntime) -> bool {
        runtime.focus.is_focused() && self.can_start(runtime)
    }
}

/// Lifecycle callbacks wired by the owning cache entry. All synchronous.
pub(crate) struct RetryerHooks {
    pub on_success: Box<dyn Fn(&Arc<Value>) + Send + Sync>,
    pub on_error: Box<dyn Fn(&QueryError) + Send + Sync>,
    pub on_fail: Box<dyn Fn(u32, &QueryError) + Send + Sync>,
    pub on_pause: Box<dyn Fn() + Send + Sync>,
    pub on_continue: Box<dyn Fn() + Send + Sync>,
    /// Signals cooperative cancellation to the producer.
    pub abort: Box<dyn Fn() + Send + Sync>,
}

pub(crate) struct RetryerConfig {
    pub attempt: AttemptFn,
    pub retry: RetryPolicy,
    pub retry_delay: RetryDelay,
    pub network_mode: NetworkMode,
    pub runtime: Arc<CacheRuntime>,
    pub hooks: RetryerHooks,
}

struct RetryerState {
    failure_count: u32,
    is_resolved: bool,
    is_retry_cancelled: bool,
    continue_requested: bool,
}

struct RetryerShared {
    state: Mutex<RetryerState>,
    wake: Notify,
    settle_tx: Mutex<Option<oneshot::Sender<FetchOutcome>>>,
    hooks: RetryerHooks,
    network_mode: NetworkMode,
    runtime: Arc<CacheRuntime>,
}

impl RetryerShared {
    fn is_resolved(&self) -> bool {
        self.state.lock().is_resolved
    }

    fn is_retry_cancelled(&self) -> bool {
        self.state.lock().is_retry_cancelled
    }

    fn failure_count(&self) -> u32 {
        self.state.lock().failure_count
    }

    fn increment_failure_count(&self) -> u32 {
        let mut state = self.state.lock();
        state.failure_count += 1;
        state.failure_count
    }

    fn can_start(&self) -> bool {
        self.network_mode.can_start(&self.runtime)
    }

    fn can_continue(&self) -> bool {
        self.network_mode.can_continue(&self.runtime)
    }

    /// Settle the outer promise exactly once, firing the matching terminal
    /// hook before any awaiter resumes.
    fn settle(&self, outcome: FetchOutcome) {
        let Some(tx) = self.settle_tx.lock().take() else {
            return;
        };
        self.state.lock().is_resolved = true;
        self.wake.notify_waiters();
        match &outcome {
            Ok(data) => (self.hooks.on_success)(data),
            Err(error) => (self.hooks.on_error)(error),
        }
        let _ = tx.send(outcome);
    }
}

struct StartState {
    attempt: AttemptFn,
    retry: RetryPolicy,
    retry_delay: RetryDelay,
}

/// Handle on one fetch sequence. Clones share state and outcome.
#[derive(Clone)]
pub(crate) struct Retryer {
    shared: Arc<RetryerShared>,
    promise: FetchPromise,
    start_state: Arc<Mutex<Option<StartState>>>,
}

impl Retryer {
    pub fn new(config: RetryerConfig) -> Self {
        let RetryerConfig {
            attempt,
            retry,
            retry_delay,
            network_mode,
            runtime,
            hooks,
        } = config;

        let (tx, rx) = oneshot::channel::<FetchOutcome>();
        let promise: FetchPromise = async move {
            match rx.await {
                Ok(outcome) => outcome,
                // The driving task settles before exiting; a dropped sender
                // only happens when the runtime tears the task down.
                Err(_) => Err(QueryError::Cancelled {
                    revert: false,
                    silent: true,
                }),
            }
        }
        .boxed()
        .shared();

        Self {
            shared: Arc::new(RetryerShared {
                state: Mutex::new(RetryerState {
                    failure_count: 0,
                    is_resolved: false,
                    is_retry_cancelled: false,
                    continue_requested: false,
                }),
                wake: Notify::new(),
                settle_tx: Mutex::new(Some(tx)),
                hooks,
                network_mode,
                runtime,
            }),
            promise,
            start_state: Arc::new(Mutex::new(Some(StartState {
                attempt,
                retry,
                retry_delay,
            }))),
        }
    }

    /// Begin executing. Subsequent calls return the same promise.
    pub fn start(&self) -> FetchPromise {
        if let Some(start) = self.start_state.lock().take() {
            let shared = Arc::clone(&self.shared);
            tokio::spawn(run_loop(shared, start));
        }
        self.promise.clone()
    }

    pub fn promise(&self) -> FetchPromise {
        self.promise.clone()
    }

    /// Reject the outer promise with a cancellation and signal the producer
    /// to abort. A second cancel after settlement is a no-op.
    pub fn cancel(&self, options: CancelOptions) {
        if self.shared.is_resolved() {
            return;
        }
        self.shared.settle(Err(QueryError::cancelled(options)));
        (self.shared.hooks.abort)();
    }

    /// Forbid further retry attempts without settling an in-flight one.
    pub fn cancel_retry(&self) {
        self.shared.state.lock().is_retry_cancelled = true;
    }

    /// Allow retries again after `cancel_retry`.
    pub fn continue_retry(&self) {
        self.shared.state.lock().is_retry_cancelled = false;
    }

    /// Resume a paused retryer. No-op when not paused.
    pub fn continue_exec(&self) {
        self.shared.state.lock().continue_requested = true;
        self.shared.wake.notify_waiters();
    }

    pub fn failure_count(&self) -> u32 {
        self.shared.failure_count()
    }

    pub fn is_resolved(&self) -> bool {
        self.shared.is_resolved()
    }
}

async fn run_loop(shared: Arc<RetryerShared>, start: StartState) {
    let StartState {
        mut attempt,
        retry,
        retry_delay,
    } = start;

    if !shared.can_start() {
        pause(&shared).await;
    }

    loop {
        if shared.is_resolved() {
            return;
        }
        let outcome = attempt().await;
        if shared.is_resolved() {
            // Cancelled while the producer was running; its result is moot.
            return;
        }
        match outcome {
            Ok(data) => {
                shared.settle(Ok(data));
                return;
            }
            Err(error) => {
                let failure_count = shared.failure_count();
                let should_retry = error.is_retryable()
                    && !shared.is_retry_cancelled()
                    && retry.should_retry(failure_count, &error);
                if !should_retry {
                    shared.settle(Err(error));
                    return;
                }

                let delay = retry_delay.delay_for(failure_count, &error);
                let new_count = shared.increment_failure_count();
                (shared.hooks.on_fail)(new_count, &error);
                debug!(
                    failure_count = new_count,
                    delay_ms = delay.as_millis() as u64,
                    "retrying failed query fetch"
                );

                sleep_interruptible(&shared, delay).await;
                if shared.is_resolved() {
                    return;
                }
                if !shared.can_continue() {
                    pause(&shared).await;
                    if shared.is_resolved() {
                        return;
                    }
                }
                if shared.is_retry_cancelled() {
                    shared.settle(Err(error));
                    return;
                }
            }
        }
    }
}

/// Suspend until environment gating permits continuing, `continue_exec` is
/// called, or the retryer settles.
async fn pause(shared: &Arc<RetryerShared>) {
    {
        let mut state = shared.state.lock();
        if state.is_resolved {
            return;
        }
        state.continue_requested = false;
    }
    (shared.hooks.on_pause)();
    loop {
        // Arm the wake before re-checking so a notify between check and
        // await is not lost.
        let notified = shared.wake.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        {
            let state = shared.state.lock();
            if state.is_resolved {
                return;
            }
            if state.continue_requested {
                break;
            }
        }
        if shared.can_continue() {
            break;
        }
        notified.await;
    }
    (shared.hooks.on_continue)();
}

/// Sleep for `duration`, waking early if the retryer settles.
async fn sleep_interruptible(shared: &Arc<RetryerShared>, duration: Duration) {
    let sleep = tokio::time::sleep(duration);
    tokio::pin!(sleep);
    loop {
        let notified = shared.wake.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if shared.is_resolved() {
            return;
        }
        tokio::select! {
            _ = &mut sleep => return,
            _ = &mut notified => {}
        }
    }
}
