//! Error taxonomy for the cache engine.
//!
//! Producer and selector failures are captured at their boundary and turned
//! into state; they are never allowed to escape as panics. Errors are cheaply
//! clonable so one failure can be shared by every observer snapshot.

use std::sync::Arc;

use thiserror::Error;

/// Flags controlling how an in-flight fetch is cancelled.
///
/// `revert` restores the entry's pre-fetch snapshot; `silent` suppresses the
/// user-visible error dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CancelOptions {
    pub revert: bool,
    pub silent: bool,
}

impl CancelOptions {
    pub fn revert() -> Self {
        Self {
            revert: true,
            silent: false,
        }
    }

    pub fn silent() -> Self {
        Self {
            revert: false,
            silent: true,
        }
    }
}

/// Terminal error of a cached fetch or an observer projection.
#[derive(Debug, Clone, Error)]
pub enum QueryError {
    /// The producer function rejected. Retried per policy.
    #[error("query function failed: {0}")]
    Producer(Arc<anyhow::Error>),

    /// The fetch was cancelled before settling. Never retried.
    #[error("query was cancelled")]
    Cancelled { revert: bool, silent: bool },

    /// The producer resolved without a usable value.
    #[error("query function returned no data")]
    NoData,

    /// A consumer-supplied `select` projection failed. Observer-local: the
    /// underlying entry state is untouched.
    #[error("select function failed: {0}")]
    Select(Arc<anyhow::Error>),

    /// A fetch was requested for an entry with no registered producer.
    #[error("no query function registered for query {0}")]
    MissingQueryFn(String),
}

impl QueryError {
    pub fn producer(error: anyhow::Error) -> Self {
        Self::Producer(Arc::new(error))
    }

    pub fn select(error: anyhow::Error) -> Self {
        Self::Select(Arc::new(error))
    }

    pub fn cancelled(options: CancelOptions) -> Self {
        Self::Cancelled {
            revert: options.revert,
            silent: options.silent,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    pub fn cancel_revert(&self) -> bool {
        matches!(self, Self::Cancelled { revert: true, .. })
    }

    pub fn cancel_silent(&self) -> bool {
        matches!(self, Self::Cancelled { silent: true, .. })
    }

    /// Only producer rejections are subject to the retry policy.
    pub(crate) fn is_retryable(&self) -> bool {
        matches!(self, Self::Producer(_))
    }
}

impl From<anyhow::Error> for QueryError {
    fn from(error: anyhow::Error) -> Self {
        Self::producer(error)
    }
}

// Stored errors compare by identity: two snapshots holding the same failure
// are equal, re-running a producer yields a distinct error even if the
// message matches.
impl PartialEq for QueryError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Producer(a), Self::Producer(b)) => Arc::ptr_eq(a, b),
            (Self::Select(a), Self::Select(b)) => Arc::ptr_eq(a, b),
            (
                Self::Cancelled {
                    revert: r1,
                    silent: s1,
                },
                Self::Cancelled {
                    revert: r2,
                    silent: s2,
                },
            ) => r1 == r2 && s1 == s2,
            (Self::NoData, Self::NoData) => true,
            (Self::MissingQueryFn(a), Self::MissingQueryFn(b)) => a == b,
            _ => false,
        }
    }
}
