//! Query keys and their canonical hash form.
//!
//! A key is an ordered sequence of JSON segments. Two keys identify the same
//! cache entry iff their canonical serializations are equal. `serde_json`'s
//! default object representation is a sorted `BTreeMap`, so serializing the
//! segment array yields a deep-key-sorted canonical string with no extra
//! normalization pass (the `preserve_order` feature must stay off).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::structural::partial_deep_match;

/// Ordered, JSON-serializable identifier for one cached operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(Vec<Value>);

impl QueryKey {
    pub fn new(segments: Vec<Value>) -> Self {
        Self(segments)
    }

    pub fn segments(&self) -> &[Value] {
        &self.0
    }

    /// Canonical string form, used as the cache map key.
    pub fn hash(&self) -> String {
        hash_query_key(self)
    }

    /// True when `self` is a partial prefix of `other`: every segment of
    /// `self` must partially deep-match the corresponding segment of `other`
    /// (object segments match on a subset of their fields).
    pub fn is_prefix_of(&self, other: &QueryKey) -> bool {
        self.0.len() <= other.0.len()
            && self
                .0
                .iter()
                .zip(other.0.iter())
                .all(|(expected, actual)| partial_deep_match(expected, actual))
    }
}

impl From<Vec<Value>> for QueryKey {
    fn from(segments: Vec<Value>) -> Self {
        Self(segments)
    }
}

impl From<&[&str]> for QueryKey {
    fn from(segments: &[&str]) -> Self {
        Self(segments.iter().map(|s| Value::String((*s).to_string())).collect())
    }
}

impl<const N: usize> From<[&str; N]> for QueryKey {
    fn from(segments: [&str; N]) -> Self {
        Self::from(&segments[..])
    }
}

/// Canonical serialization of a key.
pub fn hash_query_key(key: &QueryKey) -> String {
    // `Value` cannot hold non-finite numbers or non-string map keys, so
    // serialization is infallible.
    serde_json::to_string(key.segments())
        .expect("serializing serde_json::Value segments cannot fail")
}
