//! Canonical JSON serialization and request hashing for the idempotency ledger
//!
//! Two requests are "the same" when their route plus canonical body hash to
//! the same SHA-256 digest. Canonical form sorts object keys recursively and
//! serializes compactly, so key order and whitespace differences do not
//! defeat replay detection.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Rebuild a JSON value with every object's keys sorted recursively
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = serde_json::Map::new();
            for key in keys {
                out.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Compact serialization of the canonical form
pub fn canonical_string(value: &Value) -> String {
    canonicalize(value).to_string()
}

/// Hex SHA-256 of `route + "\n" + canonical(body)`
pub fn request_hash(route: &str, body: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(route.as_bytes());
    hasher.update(b"\n");
    hasher.update(canonical_string(body).as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_sorts_keys_recursively() {
        let value = json!({"b": {"z": 1, "a": 2}, "a": [{"y": 1, "x": 2}]});
        assert_eq!(
            canonical_string(&value),
            r#"{"a":[{"x":2,"y":1}],"b":{"a":2,"z":1}}"#
        );
    }

    #[test]
    fn test_request_hash_ignores_key_order() {
        let a = json!({"name": "h1", "capabilities": ["shell"]});
        let b = json!({"capabilities": ["shell"], "name": "h1"});
        assert_eq!(request_hash("/v1/jobs", &a), request_hash("/v1/jobs", &b));
    }

    #[test]
    fn test_request_hash_scoped_by_route() {
        let body = json!({"name": "h1"});
        assert_ne!(
            request_hash("/v1/jobs", &body),
            request_hash("/v1/public/jobs", &body)
        );
    }

    #[test]
    fn test_request_hash_differs_on_body() {
        assert_ne!(
            request_hash("/v1/jobs", &json!({"a": 1})),
            request_hash("/v1/jobs", &json!({"a": 2}))
        );
    }
}
