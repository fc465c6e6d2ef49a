//! Canonical JSON serialization for stable hashing.
//!
//! Two JSON documents that differ only in object key order must hash to the
//! same digest, otherwise derived idempotency keys would drift between
//! replays of the same logical request.

use serde_json::Value;

/// Serialize a JSON value with object keys sorted recursively.
pub fn to_canonical_string(value: &Value) -> String {
    let mut out = String::new();
    write_value(value, &mut out);
    out
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Keys come from a parsed document, so re-serializing them
                // cannot fail.
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_value(&map[*key], out);
            }
            out.push('}');
        }
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
        other => out.push_str(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_object_keys() {
        let a = json!({"b": 1, "a": {"d": 2, "c": 3}});
        let b = json!({"a": {"c": 3, "d": 2}, "b": 1});
        assert_eq!(to_canonical_string(&a), to_canonical_string(&b));
    }

    #[test]
    fn preserves_array_order() {
        let a = json!([1, 2, 3]);
        let b = json!([3, 2, 1]);
        assert_ne!(to_canonical_string(&a), to_canonical_string(&b));
    }

    #[test]
    fn scalars_roundtrip() {
        assert_eq!(to_canonical_string(&json!(null)), "null");
        assert_eq!(to_canonical_string(&json!("x")), "\"x\"");
        assert_eq!(to_canonical_string(&json!(1.5)), "1.5");
    }
}
