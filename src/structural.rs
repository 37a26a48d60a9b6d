//! Structural sharing and partial matching over JSON values.

use serde_json::Value;

/// Merge `next` against `prev`, reusing any subtree of `prev` that is deeply
/// equal to the corresponding subtree of `next`. The result is always deeply
/// equal to `next`; reused subtrees keep the previous representation so
/// downstream change detection sees unchanged branches as unchanged.
pub fn replace_equal_deep(prev: &Value, next: Value) -> Value {
    if *prev == next {
        return prev.clone();
    }
    match (prev, next) {
        (Value::Array(prev_items), Value::Array(next_items)) => Value::Array(
            next_items
                .into_iter()
                .enumerate()
                .map(|(i, item)| match prev_items.get(i) {
                    Some(prev_item) => replace_equal_deep(prev_item, item),
                    None => item,
                })
                .collect(),
        ),
        (Value::Object(prev_map), Value::Object(next_map)) => Value::Object(
            next_map
                .into_iter()
                .map(|(k, v)| {
                    let merged = match prev_map.get(&k) {
                        Some(prev_v) => replace_equal_deep(prev_v, v),
                        None => v,
                    };
                    (k, merged)
                })
                .collect(),
        ),
        (_, next) => next,
    }
}

/// True when `expected` partially matches `actual`: object fields of
/// `expected` must all be present and match in `actual` (extra fields in
/// `actual` are ignored), array items match index-wise with `expected`
/// allowed to be shorter, and scalars compare by equality.
pub fn partial_deep_match(expected: &Value, actual: &Value) -> bool {
    if expected == actual {
        return true;
    }
    match (expected, actual) {
        (Value::Object(e), Value::Object(a)) => e
            .iter()
            .all(|(k, ev)| a.get(k).is_some_and(|av| partial_deep_match(ev, av))),
        (Value::Array(e), Value::Array(a)) => {
            e.len() <= a.len()
                && e.iter()
                    .zip(a.iter())
                    .all(|(ev, av)| partial_deep_match(ev, av))
        }
        _ => false,
    }
}
