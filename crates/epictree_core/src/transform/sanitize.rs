//! Interchange type sanitizer.
//!
//! # Responsibility
//! - Rewrite any value into the small set of shapes the struct-array writer
//!   accepts: number, text, bool, bytes, flat or nested map, sequence.
//!
//! # Invariants
//! - Total: no input panics or errors.
//! - Idempotent: `sanitize(sanitize(v), p) == sanitize(v, p)`.
//! - Missing values are replaced according to the caller's `NullPolicy`,
//!   never by inspecting the surrounding value.

use crate::model::value::{Value, ValueMap};

/// Replacement for a missing value, fixed per call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NullPolicy {
    /// Field-value context (parameter blobs): missing becomes `[]`.
    EmptyList,
    /// Free-text context (whole-document pass): missing becomes `""`.
    EmptyText,
}

impl NullPolicy {
    fn replacement(self) -> Value {
        match self {
            Self::EmptyList => Value::List(Vec::new()),
            Self::EmptyText => Value::Text(String::new()),
        }
    }
}

/// Sanitizes one value recursively.
pub fn sanitize(value: &Value, policy: NullPolicy) -> Value {
    match value {
        Value::Null | Value::Empty => policy.replacement(),
        Value::Bool(_)
        | Value::Int(_)
        | Value::Float(_)
        | Value::Text(_)
        | Value::Bytes(_)
        | Value::Array(_) => value.clone(),
        Value::Timestamp(_) | Value::Opaque { .. } => Value::Text(value.to_text()),
        Value::Map(map) => Value::Map(sanitize_map(map, policy)),
        Value::List(items) => {
            if is_homogeneous_numeric(items) {
                value.clone()
            } else {
                Value::List(items.iter().map(|item| sanitize(item, policy)).collect())
            }
        }
    }
}

/// Sanitizes every value of a map, keeping keys and emptiness.
pub fn sanitize_map(map: &ValueMap, policy: NullPolicy) -> ValueMap {
    map.iter()
        .map(|(key, value)| (key.clone(), sanitize(value, policy)))
        .collect()
}

fn is_homogeneous_numeric(items: &[Value]) -> bool {
    !items.is_empty()
        && (items.iter().all(|item| matches!(item, Value::Int(_)))
            || items.iter().all(|item| matches!(item, Value::Float(_))))
}

#[cfg(test)]
mod tests {
    use super::{sanitize, NullPolicy};
    use crate::model::value::{Value, ValueMap};
    use chrono::NaiveDate;

    #[test]
    fn null_replacement_follows_call_site_policy() {
        assert_eq!(
            sanitize(&Value::Null, NullPolicy::EmptyList),
            Value::List(Vec::new())
        );
        assert_eq!(
            sanitize(&Value::Null, NullPolicy::EmptyText),
            Value::Text(String::new())
        );
        assert_eq!(
            sanitize(&Value::Empty, NullPolicy::EmptyText),
            Value::Text(String::new())
        );
    }

    #[test]
    fn empty_map_stays_a_map() {
        let empty = Value::Map(ValueMap::new());
        assert_eq!(sanitize(&empty, NullPolicy::EmptyText), empty);
    }

    #[test]
    fn temporal_and_foreign_scalars_become_text() {
        let stamp = NaiveDate::from_ymd_opt(2024, 5, 1)
            .and_then(|date| date.and_hms_micro_opt(8, 0, 1, 250_000))
            .expect("valid timestamp");
        assert_eq!(
            sanitize(&Value::Timestamp(stamp), NullPolicy::EmptyList),
            Value::from("2024-05-01 08:00:01.250")
        );
        let opaque = Value::Opaque {
            kind: "decimal".to_string(),
            repr: "3.14".to_string(),
        };
        assert_eq!(
            sanitize(&opaque, NullPolicy::EmptyList),
            Value::from("3.14")
        );
    }

    #[test]
    fn mixed_sequences_are_sanitized_element_wise() {
        let mixed = Value::List(vec![Value::Int(1), Value::Null, Value::from("x")]);
        assert_eq!(
            sanitize(&mixed, NullPolicy::EmptyText),
            Value::List(vec![Value::Int(1), Value::from(""), Value::from("x")])
        );
    }

    #[test]
    fn sanitizing_twice_changes_nothing() {
        let mut nested = ValueMap::new();
        nested.insert("when".to_string(), Value::Null);
        nested.insert(
            "items".to_string(),
            Value::List(vec![Value::Float(1.0), Value::Float(2.0)]),
        );
        let value = Value::List(vec![Value::Map(nested), Value::Empty, Value::Bool(true)]);

        for policy in [NullPolicy::EmptyList, NullPolicy::EmptyText] {
            let once = sanitize(&value, policy);
            assert_eq!(sanitize(&once, policy), once);
        }
    }
}
