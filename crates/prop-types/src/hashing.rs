//! Canonical JSON and content hashing used for cache keys and force field fingerprints.

use serde_json::Value;
use std::collections::BTreeMap;

/// Render a JSON value with object keys sorted and no insignificant whitespace.
///
/// Two values that compare equal as JSON always render to the same string, regardless of the
/// key order they were parsed or built with. Integral floats render as integers, so `298.0`
/// and `298` are the same parameter.
pub fn to_canonical_json(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => canonical_number(n),
        Value::String(_) => value.to_string(),
        Value::Array(arr) => {
            let items: Vec<String> = arr.iter().map(to_canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        Value::Object(map) => {
            let tree: BTreeMap<&String, String> =
                map.iter().map(|(k, v)| (k, to_canonical_json(v))).collect();
            let items: Vec<String> = tree
                .into_iter()
                .map(|(k, v)| format!("{}:{}", Value::String(k.clone()), v))
                .collect();
            format!("{{{}}}", items.join(","))
        }
    }
}

/// Largest magnitude below which every integer is exactly representable as an f64.
const EXACT_INTEGER_LIMIT: f64 = 9_007_199_254_740_992.0;

fn canonical_number(n: &serde_json::Number) -> String {
    match n.as_f64() {
        Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < EXACT_INTEGER_LIMIT => {
            // -0.0 renders as 0
            format!("{}", f as i64)
        }
        _ => n.to_string(),
    }
}

/// Hash a string with blake3 and return the hex digest.
pub fn hash_str(input: &str) -> String {
    blake3::hash(input.as_bytes()).to_hex().to_string()
}

/// Hash the canonical rendering of a JSON value.
pub fn hash_value(value: &Value) -> String {
    hash_str(&to_canonical_json(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_change_canonical_form() {
        let a: Value = serde_json::from_str(r#"{"b": 1, "a": {"y": [1, 2], "x": "s"}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a": {"x": "s", "y": [1, 2]}, "b": 1}"#).unwrap();
        assert_eq!(to_canonical_json(&a), to_canonical_json(&b));
        assert_eq!(to_canonical_json(&a), r#"{"a":{"x":"s","y":[1,2]},"b":1}"#);
        assert_eq!(hash_value(&a), hash_value(&b));
    }

    #[test]
    fn array_order_is_significant() {
        assert_ne!(hash_value(&json!([1, 2])), hash_value(&json!([2, 1])));
    }

    #[test]
    fn integral_floats_match_integers() {
        assert_eq!(
            hash_value(&json!({"temperature": 298.0, "pressure": -0.0})),
            hash_value(&json!({"temperature": 298, "pressure": 0}))
        );
        assert_eq!(to_canonical_json(&json!([298.15, 1e300])), "[298.15,1e300]");
        assert_ne!(hash_value(&json!(298.15)), hash_value(&json!(298)));
    }

    #[test]
    fn strings_are_escaped() {
        assert_eq!(to_canonical_json(&json!("a\"b")), r#""a\"b""#);
    }
}
