//! Prototype-pollution-safe JSON handling (spec.md §6).
//!
//! Any `serde_json::Value` built from untrusted input (tool-call arguments,
//! admin request bodies) is passed through [`strip_dangerous_keys`] before
//! it is priced, stored, or forwarded downstream.

use serde_json::Value;

const DANGEROUS_KEYS: [&str; 3] = ["__proto__", "constructor", "prototype"];

pub fn strip_dangerous_keys(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for key in DANGEROUS_KEYS {
                map.remove(key);
            }
            for (_, v) in map.iter_mut() {
                strip_dangerous_keys(v);
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                strip_dangerous_keys(item);
            }
        }
        _ => {}
    }
}

/// Byte length of the UTF-8 serialization of `value`, in kilobytes
/// (fractional), used by the pricing surcharge in spec.md §4.2.
pub fn serialized_size_kb(value: &Value) -> f64 {
    let serialized = serde_json::to_vec(value).unwrap_or_default();
    serialized.len() as f64 / 1024.0
}
