/// Cache, lock and heartbeat key derivation

use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// JSON tree whose objects serialize with sorted keys regardless of how the
/// source map was ordered
#[derive(Serialize)]
#[serde(untagged)]
enum Canonical<'a> {
    Object(BTreeMap<&'a str, Canonical<'a>>),
    Array(Vec<Canonical<'a>>),
    Scalar(&'a Value),
}

impl<'a> Canonical<'a> {
    fn from_value(value: &'a Value) -> Self {
        match value {
            Value::Object(map) => Canonical::Object(
                map.iter()
                    .map(|(key, value)| (key.as_str(), Canonical::from_value(value)))
                    .collect(),
            ),
            Value::Array(items) => Canonical::Array(items.iter().map(Canonical::from_value).collect()),
            scalar => Canonical::Scalar(scalar),
        }
    }
}

fn canonical_bytes(value: &Value) -> Vec<u8> {
    // serializing borrowed JSON into memory cannot fail
    serde_json::to_vec(&Canonical::from_value(value)).unwrap_or_default()
}

/// Stable memoization key for a node invocation.
///
/// Object keys are sorted at every depth before hashing, so the key does not
/// depend on insertion order.
pub fn cache_key(kind: &str, params: &Value, inputs: &Value) -> String {
    let canonical = canonical_bytes(&json!({ "params": params, "inputs": inputs }));

    let mut hasher = Sha256::new();
    hasher.update(kind.as_bytes());
    hasher.update([0u8]);
    hasher.update(&canonical);
    format!("node:{}:{:x}", kind, hasher.finalize())
}

/// Key of the mutual-exclusion record guarding `key`
pub fn lock_key(key: &str) -> String {
    format!("lock:{}", key)
}

/// Key holding a run's latest heartbeat timestamp
pub fn heartbeat_key(run_id: &str) -> String {
    format!("heartbeat:{}", run_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_ignores_object_insertion_order() {
        let a: Value = serde_json::from_str(r#"{"b": 1, "a": 2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a": 2, "b": 1}"#).unwrap();
        assert_eq!(cache_key("fetch", &a, &json!({})), cache_key("fetch", &b, &json!({})));
    }

    #[test]
    fn nested_objects_are_sorted_too() {
        let a: Value = serde_json::from_str(r#"{"outer": {"z": [{"y": 1, "x": 2}], "a": null}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"outer": {"a": null, "z": [{"x": 2, "y": 1}]}}"#).unwrap();
        assert_eq!(cache_key("fetch", &json!({}), &a), cache_key("fetch", &json!({}), &b));
        assert_eq!(
            String::from_utf8(canonical_bytes(&a)).unwrap(),
            r#"{"outer":{"a":null,"z":[{"x":2,"y":1}]}}"#
        );
    }

    #[test]
    fn key_depends_on_kind_and_inputs() {
        let params = json!({ "url": "https://example.com" });
        let base = cache_key("fetch", &params, &json!({ "start": 1 }));
        assert_ne!(base, cache_key("send", &params, &json!({ "start": 1 })));
        assert_ne!(base, cache_key("fetch", &params, &json!({ "start": 2 })));
        assert!(base.starts_with("node:fetch:"));
    }
}
