//! Argument sanitization and query-fingerprint normalization (spec §4.5,
//! §4.6). Grounded on the depth-capped, truncation-sentinel style of
//! `turbomcp-core/src/security/validation.rs` and
//! `turbomcp-server/src/error_sanitization.rs`.

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;

/// Strings longer than this are truncated (spec §4.5).
pub const MAX_STRING_LEN: usize = 1000;
/// Objects with more keys than this are truncated with a sentinel entry.
pub const MAX_OBJECT_KEYS: usize = 50;
/// Arrays longer than this are truncated (general arguments).
pub const MAX_ARRAY_LEN: usize = 10;
/// Arrays longer than this are truncated (db args get a looser bound).
pub const MAX_DB_ARRAY_LEN: usize = 20;
/// Recursion cap for general arguments.
pub const MAX_DEPTH: usize = 3;
/// Recursion cap for db arguments (selectors/pipelines nest deeper).
pub const MAX_DB_DEPTH: usize = 5;

const REDACTED: &str = "[REDACTED]";
const TRUNCATION_SENTINEL_KEY: &str = "__truncated__";

static SENSITIVE_KEY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(password|passwd|token|secret|api[_-]?key|authorization|auth|cookie|session(id)?|credit[_-]?card|cc[_-]?number|ssn|cvv|cvc|bearer|private[_-]?key|access[_-]?key)$",
    )
    .expect("static sensitive-key pattern must compile")
});

fn is_sensitive_key(key: &str) -> bool {
    SENSITIVE_KEY_PATTERN.is_match(key)
}

/// Sanitize an arbitrary argument value for inclusion in a `Trace`.
///
/// Redacting an already-redacted value is the identity (spec §8): once a
/// key is replaced with the sentinel string it is a plain string leaf on
/// the next pass and is left untouched (strings aren't objects, so the
/// key-based redaction rule never re-fires on them).
#[must_use]
pub fn sanitize_args(value: &Value) -> Value {
    sanitize_inner(value, 0, MAX_DEPTH, MAX_ARRAY_LEN)
}

/// Sanitize a database operation's selector/modifier/pipeline/options,
/// using the looser depth and array bounds spec §4.5 grants db args.
#[must_use]
pub fn sanitize_db_args(value: &Value) -> Value {
    sanitize_inner(value, 0, MAX_DB_DEPTH, MAX_DB_ARRAY_LEN)
}

fn sanitize_inner(value: &Value, depth: usize, max_depth: usize, max_array: usize) -> Value {
    if depth >= max_depth {
        return match value {
            Value::Object(_) | Value::Array(_) => Value::String("[MAX_DEPTH]".to_string()),
            other => sanitize_leaf(other),
        };
    }

    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map.iter().take(MAX_OBJECT_KEYS) {
                if is_sensitive_key(k) {
                    out.insert(k.clone(), Value::String(REDACTED.to_string()));
                } else {
                    out.insert(k.clone(), sanitize_inner(v, depth + 1, max_depth, max_array));
                }
            }
            if map.len() > MAX_OBJECT_KEYS {
                out.insert(
                    TRUNCATION_SENTINEL_KEY.to_string(),
                    Value::String(format!("{} more keys truncated", map.len() - MAX_OBJECT_KEYS)),
                );
            }
            Value::Object(out)
        }
        Value::Array(items) => {
            let mut out: Vec<Value> = items
                .iter()
                .take(max_array)
                .map(|v| sanitize_inner(v, depth + 1, max_depth, max_array))
                .collect();
            if items.len() > max_array {
                out.push(Value::String(format!(
                    "[{} more items truncated]",
                    items.len() - max_array
                )));
            }
            Value::Array(out)
        }
        other => sanitize_leaf(other),
    }
}

fn sanitize_leaf(value: &Value) -> Value {
    match value {
        Value::String(s) if s.chars().count() > MAX_STRING_LEN => {
            let truncated: String = s.chars().take(MAX_STRING_LEN).collect();
            Value::String(format!("{truncated}...[truncated]"))
        }
        other => other.clone(),
    }
}

/// Normalize a query selector into a fingerprint-stable shape: leaf
/// values are replaced with a placeholder while operator keys (those
/// starting with `$`) are preserved verbatim, per spec §4.5.
#[must_use]
pub fn normalize_selector(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map.iter() {
                if k.starts_with('$') {
                    out.insert(k.clone(), normalize_selector(v));
                } else {
                    out.insert(k.clone(), Value::String("?".to_string()));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(normalize_selector).collect()),
        _ => Value::String("?".to_string()),
    }
}

/// Build the fingerprint string `"collection.operation::<normalized>"`
/// used for N+1 detection (spec §4.5).
#[must_use]
pub fn fingerprint(collection: &str, operation: &str, selector: &Value) -> String {
    let normalized = normalize_selector(selector);
    format!(
        "{collection}.{operation}::{}",
        serde_json::to_string(&normalized).unwrap_or_default()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn redacts_sensitive_keys_case_insensitively() {
        let v = json!({"password": "hunter2", "Token": "abc", "name": "alice"});
        let out = sanitize_args(&v);
        assert_eq!(out["password"], json!(REDACTED));
        assert_eq!(out["Token"], json!(REDACTED));
        assert_eq!(out["name"], json!("alice"));
    }

    #[test]
    fn redacting_twice_is_identity() {
        let v = json!({"password": "hunter2"});
        let once = sanitize_args(&v);
        let twice = sanitize_args(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn truncates_long_strings() {
        let long = "a".repeat(2000);
        let v = json!({"field": long});
        let out = sanitize_args(&v);
        let s = out["field"].as_str().unwrap();
        assert!(s.len() < 2000);
        assert!(s.ends_with("...[truncated]"));
    }

    #[test]
    fn truncates_large_objects_with_sentinel() {
        let mut map = Map::new();
        for i in 0..60 {
            map.insert(format!("k{i}"), json!(i));
        }
        let out = sanitize_args(&Value::Object(map));
        let obj = out.as_object().unwrap();
        assert!(obj.contains_key(TRUNCATION_SENTINEL_KEY));
        assert_eq!(obj.len(), MAX_OBJECT_KEYS + 1);
    }

    #[test]
    fn truncates_arrays_with_different_bounds_for_db_args() {
        let items: Vec<Value> = (0..30).map(Value::from).collect();
        let general = sanitize_args(&Value::Array(items.clone()));
        let db = sanitize_db_args(&Value::Array(items));
        assert_eq!(general.as_array().unwrap().len(), MAX_ARRAY_LEN + 1);
        assert_eq!(db.as_array().unwrap().len(), MAX_DB_ARRAY_LEN + 1);
    }

    #[test]
    fn normalize_preserves_operators_blinds_leaves() {
        let selector = json!({"orderId": 42, "$or": [{"status": "open"}]});
        let norm = normalize_selector(&selector);
        assert_eq!(norm["orderId"], json!("?"));
        assert_eq!(norm["$or"][0]["status"], json!("?"));
    }

    #[test]
    fn fingerprint_is_value_blind() {
        let a = fingerprint("Orders", "findOne", &json!({"orderId": 1}));
        let b = fingerprint("Orders", "findOne", &json!({"orderId": 2}));
        assert_eq!(a, b);
    }
}
