//! Canonical JSON serialisation used as the sole source of cache-key
//! variance: object keys are sorted lexicographically, arrays keep their
//! original order, primitives serialise as-is.
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Serialises `value` to a byte-identical string for any two values that are
/// structurally equal up to object-key order. `serde_json::Value` has no
/// reference identity, so there is no cycle to detect: two branches that
/// happen to be equal are serialised independently rather than shared.
pub fn stable_stringify(value: &Value) -> String {
    let mut out = String::new();
    write_value(value, &mut out);
    out
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_json_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_json_string(key, out);
                out.push(':');
                write_value(&map[*key], out);
            }
            out.push('}');
        }
    }
}

fn write_json_string(s: &str, out: &mut String) {
    // serde_json's Value already escapes on (de)serialisation; round-trip
    // through its own string serialiser so we don't reimplement escaping.
    out.push_str(&serde_json::to_string(s).expect("string serialisation is infallible"));
}

/// `namespace:hex(sha256(url ⊕ stableJson(cacheVary)))`. With no `cacheVary`,
/// the key is `namespace:hex(sha256(url))`.
pub fn create_cache_key(namespace: &str, url: &str, cache_vary: Option<&Value>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    if let Some(vary) = cache_vary {
        hasher.update(stable_stringify(vary).as_bytes());
    }
    let digest = hasher.finalize();
    format!("{namespace}:{}", hex::encode(digest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_change_the_key() {
        let a = json!({"b": 1, "a": 2});
        let b = json!({"a": 2, "b": 1});
        assert_eq!(
            create_cache_key("markdown", "https://example.com", Some(&a)),
            create_cache_key("markdown", "https://example.com", Some(&b))
        );
    }

    #[test]
    fn array_order_is_preserved() {
        let a = json!({"tags": ["x", "y"]});
        let b = json!({"tags": ["y", "x"]});
        assert_ne!(
            create_cache_key("markdown", "https://example.com", Some(&a)),
            create_cache_key("markdown", "https://example.com", Some(&b))
        );
    }

    #[test]
    fn no_vary_matches_bare_url_hash() {
        let k1 = create_cache_key("markdown", "https://example.com", None);
        let k2 = create_cache_key("markdown", "https://example.com", None);
        assert_eq!(k1, k2);
        assert!(k1.starts_with("markdown:"));
    }

    #[test]
    fn stable_stringify_is_deterministic() {
        let v = json!({"z": [1, 2, {"y": true, "x": null}], "a": "s"});
        assert_eq!(stable_stringify(&v), stable_stringify(&v.clone()));
    }
}
