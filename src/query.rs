//! Nested Query-String Codec
//!
//! This module encodes and decodes the query portion of a virtual URL using
//! bracketed-nested semantics: square-bracket keys produce nested mappings
//! and a `[]` suffix produces ordered sequences.
//!
//! ```text
//! q[active]=true&q[roles][]=admin&q[roles][]=ops
//! ```
//!
//! decodes to
//!
//! ```json
//! {"q": {"active": true, "roles": ["admin", "ops"]}}
//! ```
//!
//! Brackets travel literally on the wire; only characters that would break
//! the `key=value&` framing are percent-escaped. Scalar values are revived
//! on decode (`true`, `false`, `null` and numbers come back typed), which
//! makes encode/decode idempotent for filter mappings.

use serde_json::{Map, Number, Value};

use crate::error::{Error, Result};

/// Encode a filters mapping into a bracketed query string.
///
/// Returns an empty string for an empty mapping. Nested mappings become
/// bracket paths, sequences become repeated `[]` entries, in iteration
/// order.
pub fn encode(filters: &Map<String, Value>) -> String {
    let mut pairs = Vec::new();
    for (key, value) in filters {
        encode_pair(&escape(key), value, &mut pairs);
    }
    pairs.join("&")
}

fn encode_pair(prefix: &str, value: &Value, pairs: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (key, inner) in map {
                encode_pair(&format!("{}[{}]", prefix, escape(key)), inner, pairs);
            }
        }
        Value::Array(items) => {
            for item in items {
                encode_pair(&format!("{}[]", prefix), item, pairs);
            }
        }
        Value::Null => pairs.push(format!("{}=null", prefix)),
        Value::Bool(b) => pairs.push(format!("{}={}", prefix, b)),
        Value::Number(n) => pairs.push(format!("{}={}", prefix, n)),
        Value::String(s) => pairs.push(format!("{}={}", prefix, escape(s))),
    }
}

/// Decode a query string into a nested mapping.
///
/// Empty input yields an empty mapping. Pairs with colliding scalar keys
/// keep the last value; malformed bracket paths fall back to the literal
/// key.
pub fn decode(query: &str) -> Result<Map<String, Value>> {
    let mut root = Map::new();

    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (raw_key, raw_value) = match pair.split_once('=') {
            Some((k, v)) => (k, v),
            None => (pair, ""),
        };

        let key = unescape(raw_key)?;
        let value = revive_scalar(&unescape(raw_value)?);
        let path = parse_key_path(&key);
        insert(&mut root, &path, value)?;
    }

    Ok(root)
}

/// One step of a bracket path: a named map key or a sequence append.
#[derive(Debug, Clone, PartialEq)]
enum Step {
    Key(String),
    Append,
}

/// Split `a[b][c][]` into its steps. A key with unbalanced brackets is
/// treated as a single literal key.
fn parse_key_path(key: &str) -> Vec<Step> {
    let root_end = match key.find('[') {
        Some(idx) if idx > 0 => idx,
        _ => return vec![Step::Key(key.to_string())],
    };

    let mut steps = vec![Step::Key(key[..root_end].to_string())];
    let mut rest = &key[root_end..];

    while !rest.is_empty() {
        if !rest.starts_with('[') {
            return vec![Step::Key(key.to_string())];
        }
        match rest.find(']') {
            Some(close) => {
                let segment = &rest[1..close];
                if segment.is_empty() {
                    steps.push(Step::Append);
                } else {
                    steps.push(Step::Key(segment.to_string()));
                }
                rest = &rest[close + 1..];
            }
            None => return vec![Step::Key(key.to_string())],
        }
    }

    steps
}

fn insert(root: &mut Map<String, Value>, path: &[Step], value: Value) -> Result<()> {
    let key = match &path[0] {
        Step::Key(k) => k.clone(),
        // A bare `[]=` key has no mapping slot to land in.
        Step::Append => return Err(Error::invalid_argument("query key starts with []")),
    };

    let slot = root.entry(key).or_insert(Value::Null);
    insert_at(slot, &path[1..], value)
}

fn insert_at(slot: &mut Value, path: &[Step], value: Value) -> Result<()> {
    if path.is_empty() {
        *slot = value;
        return Ok(());
    }

    match &path[0] {
        Step::Key(key) => {
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            let map = slot.as_object_mut().expect("slot was just made an object");
            let next = map.entry(key.clone()).or_insert(Value::Null);
            insert_at(next, &path[1..], value)
        }
        Step::Append => {
            if !slot.is_array() {
                *slot = Value::Array(Vec::new());
            }
            let items = slot.as_array_mut().expect("slot was just made an array");
            if path.len() == 1 {
                items.push(value);
                Ok(())
            } else {
                // `a[][b]` appends a one-key mapping per pair.
                let mut nested = Value::Object(Map::new());
                insert_at(&mut nested, &path[1..], value)?;
                items.push(nested);
                Ok(())
            }
        }
    }
}

/// Revive typed scalars from their wire spelling.
fn revive_scalar(raw: &str) -> Value {
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        "null" => Value::Null,
        _ => {
            if let Ok(n) = raw.parse::<i64>() {
                return Value::Number(n.into());
            }
            if let Ok(f) = raw.parse::<f64>() {
                if let Some(n) = Number::from_f64(f) {
                    return Value::Number(n);
                }
            }
            Value::String(raw.to_string())
        }
    }
}

/// Characters that survive unescaped in keys and values. Brackets stay
/// literal so the nested grammar is readable on the wire.
fn is_unreserved(byte: u8) -> bool {
    byte.is_ascii_alphanumeric()
        || matches!(byte, b'-' | b'_' | b'.' | b'~' | b'[' | b']' | b'/' | b':' | b'@' | b'*')
}

fn escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        if is_unreserved(byte) {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

fn unescape(input: &str) -> Result<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut idx = 0;

    while idx < bytes.len() {
        match bytes[idx] {
            b'%' => {
                let hex = input
                    .get(idx + 1..idx + 3)
                    .ok_or_else(|| Error::invalid_argument("truncated percent escape"))?;
                let byte = u8::from_str_radix(hex, 16)
                    .map_err(|_| Error::invalid_argument("invalid percent escape"))?;
                out.push(byte);
                idx += 3;
            }
            b'+' => {
                out.push(b' ');
                idx += 1;
            }
            byte => {
                out.push(byte);
                idx += 1;
            }
        }
    }

    String::from_utf8(out).map_err(|_| Error::invalid_argument("query is not valid UTF-8"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn as_map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {:?}", other),
        }
    }

    #[test]
    fn test_encode_nested_filters() {
        let filters = as_map(json!({"q": {"active": true, "roles": ["admin"]}}));
        assert_eq!(encode(&filters), "q[active]=true&q[roles][]=admin");
    }

    #[test]
    fn test_encode_empty_is_empty() {
        assert_eq!(encode(&Map::new()), "");
    }

    #[test]
    fn test_encode_escapes_values_not_brackets() {
        let filters = as_map(json!({"name": "a b&c"}));
        assert_eq!(encode(&filters), "name=a%20b%26c");
    }

    #[test]
    fn test_decode_nested() {
        let decoded = decode("a[b]=1&a[c][]=x&a[c][]=y").unwrap();
        assert_eq!(
            Value::Object(decoded),
            json!({"a": {"b": 1, "c": ["x", "y"]}})
        );
    }

    #[test]
    fn test_decode_revives_scalars() {
        let decoded = decode("flag=true&none=null&count=42&ratio=0.5&word=true-ish").unwrap();
        assert_eq!(decoded["flag"], Value::Bool(true));
        assert_eq!(decoded["none"], Value::Null);
        assert_eq!(decoded["count"], json!(42));
        assert_eq!(decoded["ratio"], json!(0.5));
        assert_eq!(decoded["word"], json!("true-ish"));
    }

    #[test]
    fn test_decode_last_scalar_wins() {
        let decoded = decode("a=1&a=2").unwrap();
        assert_eq!(decoded["a"], json!(2));
    }

    #[test]
    fn test_round_trip_idempotence() {
        let filters = as_map(json!({
            "q": {"active": true, "roles": ["admin", "ops"], "page": 3}
        }));
        let encoded = encode(&filters);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, filters);

        // A second pass through the codec is stable.
        assert_eq!(encode(&decoded), encoded);
    }

    #[test]
    fn test_decode_percent_escapes() {
        let decoded = decode("name=a%20b%26c&plus=1+2").unwrap();
        assert_eq!(decoded["name"], json!("a b&c"));
        assert_eq!(decoded["plus"], json!("1 2"));
    }

    #[test]
    fn test_malformed_brackets_fall_back_to_literal_key() {
        let decoded = decode("a[b=1").unwrap();
        assert_eq!(decoded["a[b"], json!(1));
    }

    #[test]
    fn test_append_into_nested_maps() {
        let decoded = decode("items[][sku]=a&items[][sku]=b").unwrap();
        assert_eq!(
            Value::Object(decoded),
            json!({"items": [{"sku": "a"}, {"sku": "b"}]})
        );
    }
}
