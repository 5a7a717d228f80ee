//! Compact JSON encoding shared by every backend.
//!
//! `dumps_sorted` is the canonical form: object keys are ordered
//! recursively so two structurally equal values always produce the same
//! bytes, which is what `content_hash` relies on.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::errors::Result;

pub fn dumps<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

pub fn loads<T: DeserializeOwned>(raw: &str) -> Result<T> {
    Ok(serde_json::from_str(raw)?)
}

/// Serialize with recursively sorted object keys.
pub fn dumps_sorted<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_string(&canonicalize(value))?)
}

/// Hex SHA-256 of the canonical serialization.
pub fn content_hash<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(sha256_hex(&dumps_sorted(value)?))
}

pub fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

// Rebuilding the map in sorted order also covers builds where
// serde_json's `preserve_order` feature is switched on by another crate.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::with_capacity(entries.len());
            for (k, v) in entries {
                sorted.insert(k, canonicalize(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}
