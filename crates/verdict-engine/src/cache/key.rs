//! Content-addressed cache keys
//!
//! Payloads are rewritten into a canonical text form (sorted object keys,
//! integers exact, fractions at fixed precision) and hashed with SHA-256,
//! so that semantically identical requests collide regardless of key order
//! or float jitter.

use crate::models::FeaturePayload;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt::Write;
use thiserror::Error;

/// Decimal places kept when normalizing numbers
pub const FLOAT_PRECISION: usize = 6;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheKeyError {
    #[error("payload nesting exceeds {0} levels")]
    TooDeep(usize),
}

/// Hex-encoded SHA-256 of the canonical form of a payload
pub fn cache_key(features: &FeaturePayload, max_depth: usize) -> Result<String, CacheKeyError> {
    let canonical = canonicalize(features.value(), max_depth)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Deterministic text form of a JSON value
pub fn canonicalize(value: &Value, max_depth: usize) -> Result<String, CacheKeyError> {
    let mut out = String::new();
    write_value(value, &mut out, 0, max_depth)?;
    Ok(out)
}

fn write_value(value: &Value, out: &mut String, depth: usize, max_depth: usize) -> Result<(), CacheKeyError> {
    if depth > max_depth {
        return Err(CacheKeyError::TooDeep(max_depth));
    }
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                let _ = write!(out, "{}", i);
            } else if let Some(u) = n.as_u64() {
                let _ = write!(out, "{}", u);
            } else {
                write_float(n.as_f64().unwrap_or(0.0), out);
            }
        }
        Value::String(s) => {
            // serde_json escaping is stable, reuse it
            out.push_str(&Value::String(s.clone()).to_string());
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out, depth + 1, max_depth)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_value(&map[key], out, depth + 1, max_depth)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

/// Largest magnitude below which every integer is exact in an f64
const EXACT_INT_LIMIT: f64 = 9_007_199_254_740_992.0;

fn write_float(f: f64, out: &mut String) {
    let factor = 10f64.powi(FLOAT_PRECISION as i32);
    let scaled = f * factor;
    if !scaled.is_finite() {
        // too large to round; the exact form keeps distinct values apart
        let _ = write!(out, "{:e}", f);
        return;
    }
    let mut rounded = scaled.round() / factor;
    if rounded == 0.0 {
        // fold -0.0 into 0.0
        rounded = 0.0;
    }
    if rounded.fract() == 0.0 && rounded.abs() < EXACT_INT_LIMIT {
        // same text as the integer branch, so 1 and 1.0 share a key
        let _ = write!(out, "{}", rounded as i64);
    } else {
        let _ = write!(out, "{:.*}", FLOAT_PRECISION, rounded);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(value: Value) -> String {
        cache_key(&FeaturePayload::new(value), 32).unwrap()
    }

    #[test]
    fn test_key_order_does_not_matter() {
        let a: Value = serde_json::from_str(r#"{"tipo":"imagen","calidad":"alta","stats":{"x":1,"y":2}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"stats":{"y":2,"x":1},"calidad":"alta","tipo":"imagen"}"#).unwrap();
        assert_eq!(key(a), key(b));
    }

    #[test]
    fn test_float_jitter_collides() {
        assert_eq!(key(json!({"luma": 1.0})), key(json!({"luma": 1.00000001})));
        assert_eq!(key(json!({"luma": 1})), key(json!({"luma": 1.0})));
        assert_eq!(key(json!({"luma": -0.0})), key(json!({"luma": 0.0})));
    }

    #[test]
    fn test_significant_differences_do_not_collide() {
        assert_ne!(key(json!({"luma": 1.0})), key(json!({"luma": 1.001})));
        assert_ne!(key(json!({"tipo": "imagen"})), key(json!({"tipo": "video"})));
        assert_ne!(key(json!([1, 2])), key(json!([2, 1])));
    }

    #[test]
    fn test_large_numbers_keep_distinct_keys() {
        let id = 9_007_199_254_740_992u64;
        assert_ne!(key(json!({"id": id})), key(json!({"id": id + 1})));
        assert_ne!(key(json!({"id": u64::MAX})), key(json!({"id": u64::MAX - 1})));
        assert_ne!(key(json!({"id": i64::MIN})), key(json!({"id": i64::MIN + 1})));
        assert_ne!(key(json!({"gain": 1e303})), key(json!({"gain": 5e307})));
        assert_eq!(canonicalize(&json!(1e303), 4).unwrap(), "1e303");
    }

    #[test]
    fn test_key_is_stable_across_calls() {
        let value = json!({"b": [1.5, {"z": null, "a": true}], "a": "x"});
        let first = key(value.clone());
        let second = key(value);
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
    }

    #[test]
    fn test_depth_limit() {
        let deep = json!({"a": {"b": {"c": 1}}});
        assert_eq!(
            cache_key(&FeaturePayload::new(deep), 2),
            Err(CacheKeyError::TooDeep(2))
        );
    }
}
