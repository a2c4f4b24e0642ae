//! Deterministic checksums over canonical JSON.
//!
//! A value is serialized to JSON, object keys are sorted recursively, and the
//! first eight bytes of the SHA-256 digest are read as a big-endian `u64`.
//! The checksum detects accidental divergence; it is not meant to resist
//! deliberately crafted collisions.

use crate::error::ProtocolResult;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Serializes a JSON value with object keys sorted at every level.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Computes the checksum of an already-built JSON value.
pub fn checksum_value(value: &Value) -> u64 {
    let digest = Sha256::digest(canonical_json(value).as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

/// Computes the checksum of any serializable value.
///
/// # Errors
///
/// Returns an error if the value cannot be represented as JSON.
pub fn checksum<T: Serialize + ?Sized>(value: &T) -> ProtocolResult<u64> {
    Ok(checksum_value(&serde_json::to_value(value)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::{json, Map};

    #[test]
    fn canonical_sorts_nested_keys() {
        let value = json!({"b": 1, "a": {"z": true, "y": [3, {"d": null, "c": "x"}]}});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":{"y":[3,{"c":"x","d":null}],"z":true},"b":1}"#
        );
    }

    #[test]
    fn checksum_is_stable() {
        let value = json!({"title": "Dune", "genre": "sci-fi"});
        assert_eq!(checksum(&value).unwrap(), checksum(&value).unwrap());
    }

    #[test]
    fn checksum_distinguishes_values() {
        let a = json!({"title": "A"});
        let b = json!({"title": "B"});
        assert_ne!(checksum(&a).unwrap(), checksum(&b).unwrap());
    }

    #[test]
    fn checksum_of_none_is_null_checksum() {
        let none: Option<u8> = None;
        assert_eq!(checksum(&none).unwrap(), checksum_value(&Value::Null));
    }

    proptest! {
        #[test]
        fn checksum_ignores_key_insertion_order(
            pairs in prop::collection::btree_map("[a-z]{1,8}", any::<i64>(), 0..12)
        ) {
            let mut forward = Map::new();
            for (k, v) in pairs.iter() {
                forward.insert(k.clone(), json!(v));
            }
            let mut backward = Map::new();
            for (k, v) in pairs.iter().rev() {
                backward.insert(k.clone(), json!(v));
            }
            prop_assert_eq!(
                checksum_value(&Value::Object(forward)),
                checksum_value(&Value::Object(backward))
            );
        }
    }
}
