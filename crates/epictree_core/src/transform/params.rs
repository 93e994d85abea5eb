//! Parameter blob flattening.
//!
//! # Responsibility
//! - Collapse arbitrarily nested key/value blobs into one level with
//!   underscore-joined composite keys.
//!
//! # Invariants
//! - Never fails: unparseable or non-map blobs flatten to an empty map.
//! - Output never contains a nested map.
//! - Key collisions resolve last-write-wins in traversal order, which is
//!   ascending key order at every nesting level.
//! - Idempotent on already-flat input.

use crate::model::value::{Value, ValueMap};
use crate::transform::sanitize::{sanitize, NullPolicy};
use log::debug;

/// Flattens a parameter blob without a key prefix.
pub fn flatten_params(blob: &Value) -> ValueMap {
    flatten_params_with_prefix(blob, "")
}

/// Flattens a parameter blob, prefixing every emitted key with `prefix_`.
///
/// Text blobs are parsed as JSON first; a parse failure yields an empty map.
pub fn flatten_params_with_prefix(blob: &Value, prefix: &str) -> ValueMap {
    let mut flat = ValueMap::new();
    match blob {
        Value::Map(map) => flatten_into(map, prefix, &mut flat),
        Value::Text(text) => match serde_json::from_str::<serde_json::Value>(text) {
            Ok(parsed) => {
                if let Value::Map(map) = Value::from(parsed) {
                    flatten_into(&map, prefix, &mut flat);
                }
            }
            Err(err) => {
                debug!(
                    "event=params_flatten module=transform status=skipped reason=malformed_blob error={}",
                    err
                );
            }
        },
        _ => {}
    }
    flat
}

fn flatten_into(map: &ValueMap, prefix: &str, flat: &mut ValueMap) {
    for (key, value) in map {
        let full_key = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}_{key}")
        };

        match value {
            Value::Map(nested) => flatten_into(nested, &full_key, flat),
            other => {
                flat.insert(full_key, sanitize(other, NullPolicy::EmptyList));
            }
        }
    }
}

/// Overlays `top` onto `base`; keys present in `top` win.
pub fn overlay(base: &ValueMap, top: &ValueMap) -> ValueMap {
    let mut merged = base.clone();
    merged.extend(top.iter().map(|(key, value)| (key.clone(), value.clone())));
    merged
}
