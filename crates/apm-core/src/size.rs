//! Pure, stateless approximate in-memory size estimation (spec §4.1).
//!
//! All telemetry flows through `serde_json::Value` once sanitized (see
//! [`crate::sanitize`]), so this estimator walks that constrained
//! intermediate representation rather than arbitrary Rust types — the
//! "preferable" option from spec §9's design notes on deep traversal.

use serde_json::Value;
use std::collections::HashSet;

/// Maximum recursion depth. Past this, [`estimate`] returns a flat
/// placeholder cost rather than recursing further.
const MAX_DEPTH: usize = 20;
/// Cost charged for a value encountered past [`MAX_DEPTH`].
const DEPTH_CAP_COST: usize = 100;
/// Array elements walked exactly; the remainder is extrapolated from the
/// running average of the elements actually walked.
const ARRAY_SAMPLE_LIMIT: usize = 1000;
/// Object keys walked exactly; same extrapolation policy as arrays.
const MAP_SAMPLE_LIMIT: usize = 500;

/// Approximate the in-memory byte size of `value`.
///
/// Never panics and never infinite-loops: cycles are impossible for
/// `serde_json::Value` (it is a tree, not a graph), but the estimator
/// still carries a visited-pointer guard so that callers who later widen
/// the input type (e.g. to an `Rc`-sharing representation) inherit cycle
/// safety for free. See spec §4.1 for the exact per-type byte rules.
#[must_use]
pub fn estimate(value: &Value) -> usize {
    let mut visited = HashSet::new();
    estimate_inner(value, 0, &mut visited)
}

fn estimate_inner(value: &Value, depth: usize, visited: &mut HashSet<usize>) -> usize {
    if depth > MAX_DEPTH {
        return DEPTH_CAP_COST;
    }

    // Cycle detection keyed by the value's address. `serde_json::Value`
    // can't actually cycle, but composite variants get a guard anyway so
    // the contract matches spec §4.1 ("cycle detection via a visited set")
    // even as the representation evolves.
    let ptr = value as *const Value as usize;
    match value {
        Value::Null => 0,
        Value::Bool(_) => 4,
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                8
            } else {
                8
            }
        }
        Value::String(s) => 2 * s.chars().count(),
        Value::Array(items) => {
            if !visited.insert(ptr) {
                return 0;
            }
            let cost = array_cost(items, depth, visited);
            visited.remove(&ptr);
            cost
        }
        Value::Object(map) => {
            if !visited.insert(ptr) {
                return 0;
            }
            let mut total = 8usize;
            let mut walked = 0usize;
            let mut walked_cost = 0usize;
            for (k, v) in map.iter() {
                if walked >= MAP_SAMPLE_LIMIT {
                    break;
                }
                let entry_cost = 2 * k.chars().count() + estimate_inner(v, depth + 1, visited);
                walked_cost += entry_cost;
                walked += 1;
            }
            total += walked_cost;
            let remaining = map.len().saturating_sub(walked);
            if remaining > 0 && walked > 0 {
                let avg = walked_cost / walked;
                total += avg * remaining;
            }
            visited.remove(&ptr);
            total
        }
    }
}

fn array_cost(items: &[Value], depth: usize, visited: &mut HashSet<usize>) -> usize {
    let mut total = 8usize;
    let mut walked = 0usize;
    let mut walked_cost = 0usize;
    for item in items.iter() {
        if walked >= ARRAY_SAMPLE_LIMIT {
            break;
        }
        let c = estimate_inner(item, depth + 1, visited);
        walked_cost += c;
        walked += 1;
    }
    total += walked_cost;
    let remaining = items.len().saturating_sub(walked);
    if remaining > 0 && walked > 0 {
        let avg = walked_cost / walked;
        total += avg * remaining;
    }
    total
}

/// Approximate the size of a value that can be converted to
/// `serde_json::Value`. Never throws: a serialization failure is treated
/// as an unknown-size leaf and reported as [`DEPTH_CAP_COST`] bytes,
/// matching spec §4.1's "never throws" invariant.
pub fn estimate_serializable<T: serde::Serialize>(value: &T) -> usize {
    match serde_json::to_value(value) {
        Ok(v) => estimate(&v),
        Err(_) => DEPTH_CAP_COST,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn null_and_bool_and_number() {
        assert_eq!(estimate(&Value::Null), 0);
        assert_eq!(estimate(&json!(true)), 4);
        assert_eq!(estimate(&json!(42)), 8);
        assert_eq!(estimate(&json!(42.5)), 8);
    }

    #[test]
    fn string_is_two_bytes_per_char() {
        assert_eq!(estimate(&json!("hello")), 10);
        assert_eq!(estimate(&json!("")), 0);
    }

    #[test]
    fn array_adds_base_cost() {
        let v = json!([1, 2, 3]);
        assert_eq!(estimate(&v), 8 + 8 * 3);
    }

    #[test]
    fn object_adds_key_and_value_cost() {
        let v = json!({"ab": 1});
        assert_eq!(estimate(&v), 8 + 2 * 2 + 8);
    }

    #[test]
    fn depth_cap_short_circuits() {
        let mut v = json!(1);
        for _ in 0..(MAX_DEPTH + 5) {
            v = json!([v]);
        }
        // Should not panic or recurse forever; exact value isn't asserted,
        // just that it terminates and returns something sane.
        let size = estimate(&v);
        assert!(size > 0);
    }

    #[test]
    fn large_array_extrapolates_tail() {
        let items: Vec<Value> = (0..2000).map(|i| json!(i)).collect();
        let v = Value::Array(items);
        // All elements are the same estimated cost (8 bytes), so
        // extrapolation should match exact computation.
        assert_eq!(estimate(&v), 8 + 8 * 2000);
    }

    #[test]
    fn never_throws_on_weird_floats() {
        // f64::NAN/INFINITY aren't representable in serde_json::Number,
        // so this exercises the estimate_serializable fallback path.
        struct Weird;
        impl serde::Serialize for Weird {
            fn serialize<S: serde::Serializer>(&self, _s: S) -> Result<S::Ok, S::Error> {
                Err(serde::ser::Error::custom("unrepresentable"))
            }
        }
        assert_eq!(estimate_serializable(&Weird), DEPTH_CAP_COST);
    }

    proptest::proptest! {
        #[test]
        fn estimate_is_deterministic_for_clones(n in 0i64..1_000_000) {
            let v = json!({"a": n, "b": [n, n, n], "c": n.to_string()});
            let v2 = v.clone();
            proptest::prop_assert_eq!(estimate(&v), estimate(&v2));
        }
    }
}
