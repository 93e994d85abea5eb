//! Dynamic value carried by raw source payloads and the interchange document.
//!
//! # Responsibility
//! - Represent every shape a source payload can hold, including temporal
//!   values and foreign scalars that the interchange format cannot store.
//! - Provide lossless conversion from `serde_json` values.
//!
//! # Invariants
//! - Maps are key-ordered (`BTreeMap`); traversal order is ascending key order.
//! - `Array` holds float64 samples and is always a homogeneous numeric sequence.

use chrono::NaiveDateTime;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

/// Canonical rendering used for temporal values.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Key-ordered mapping of field name to value.
pub type ValueMap = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Missing value.
    Null,
    /// Attribute recorded with an empty dataspace by the acquisition software.
    Empty,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(NaiveDateTime),
    /// Scalar of a type the interchange format has no slot for
    /// (decimal, uuid, enum member...). `repr` is its display form.
    Opaque { kind: String, repr: String },
    /// Float64 sample array.
    Array(Vec<f64>),
    List(Vec<Value>),
    Map(ValueMap),
}

impl Value {
    /// Returns `true` for `Null` and the empty marker.
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Null | Self::Empty)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Int(_) | Self::Float(_))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            Self::Float(value) if value.is_finite() => Some(value.trunc() as i64),
            Self::Bool(value) => Some(i64::from(*value)),
            Self::Text(value) => value.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(value) => Some(*value as f64),
            Self::Float(value) => Some(*value),
            Self::Bool(value) => Some(if *value { 1.0 } else { 0.0 }),
            Self::Text(value) => value.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            Self::Int(value) => Some(*value != 0),
            Self::Float(value) => Some(*value != 0.0),
            Self::Text(value) => match value.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Some(true),
                "false" | "no" | "0" | "" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&ValueMap> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    /// Looks up `key` when this value is a map.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|map| map.get(key))
    }

    /// Numeric samples held by this value, if it is an all-numeric sequence.
    pub fn to_samples(&self) -> Option<Vec<f64>> {
        match self {
            Self::Array(samples) => Some(samples.clone()),
            Self::List(items) => items.iter().map(Value::as_numeric_f64).collect(),
            _ => None,
        }
    }

    /// Views a decoded struct array as its records.
    ///
    /// A 1x1 struct decodes as a map; larger struct arrays decode as lists of
    /// maps. Both are returned as a record slice here.
    pub fn records(&self) -> Vec<&ValueMap> {
        match self {
            Self::Map(map) => vec![map],
            Self::List(items) => items.iter().filter_map(Value::as_map).collect(),
            _ => Vec::new(),
        }
    }

    /// Renders the value as free text.
    pub fn to_text(&self) -> String {
        self.to_string()
    }

    fn as_numeric_f64(&self) -> Option<f64> {
        match self {
            Self::Int(value) => Some(*value as f64),
            Self::Float(value) => Some(*value),
            _ => None,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null | Self::Empty => Ok(()),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
            Self::Bytes(bytes) => f.write_str(&String::from_utf8_lossy(bytes)),
            Self::Timestamp(value) => write!(f, "{}", value.format(TIMESTAMP_FORMAT)),
            Self::Opaque { repr, .. } => f.write_str(repr),
            Self::Array(samples) => {
                let rendered: Vec<String> = samples.iter().map(|s| s.to_string()).collect();
                write!(f, "[{}]", rendered.join(", "))
            }
            Self::List(items) => {
                let rendered: Vec<String> = items.iter().map(Value::to_string).collect();
                write!(f, "[{}]", rendered.join(", "))
            }
            Self::Map(map) => {
                let rendered: Vec<String> =
                    map.iter().map(|(key, value)| format!("{key}: {value}")).collect();
                write!(f, "{{{}}}", rendered.join(", "))
            }
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(flag) => Self::Bool(flag),
            serde_json::Value::Number(number) => {
                if let Some(int) = number.as_i64() {
                    Self::Int(int)
                } else {
                    Self::Float(number.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(text) => Self::Text(text),
            serde_json::Value::Array(items) => {
                Self::List(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(entries) => Self::Map(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, Value::from(value)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(value: NaiveDateTime) -> Self {
        Self::Timestamp(value)
    }
}

impl From<ValueMap> for Value {
    fn from(value: ValueMap) -> Self {
        Self::Map(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Self::List(value)
    }
}

#[cfg(test)]
mod tests {
    use super::Value;
    use chrono::NaiveDate;
    use serde_json::json;

    #[test]
    fn json_numbers_keep_integer_identity() {
        let value = Value::from(json!({"a": 1, "b": 1.5, "c": [true, null]}));
        assert_eq!(value.get("a"), Some(&Value::Int(1)));
        assert_eq!(value.get("b"), Some(&Value::Float(1.5)));
        assert_eq!(
            value.get("c"),
            Some(&Value::List(vec![Value::Bool(true), Value::Null]))
        );
    }

    #[test]
    fn timestamps_render_without_zero_fraction() {
        let stamp = NaiveDate::from_ymd_opt(2025, 12, 2)
            .and_then(|date| date.and_hms_opt(9, 30, 0))
            .expect("valid timestamp");
        assert_eq!(Value::Timestamp(stamp).to_text(), "2025-12-02 09:30:00");
    }

    #[test]
    fn text_coerces_to_numbers_and_flags() {
        assert_eq!(Value::from(" 42 ").as_i64(), Some(42));
        assert_eq!(Value::from("2.5").as_f64(), Some(2.5));
        assert_eq!(Value::from("True").as_bool(), Some(true));
        assert_eq!(Value::from("maybe").as_bool(), None);
    }

    #[test]
    fn records_views_single_struct_and_struct_list_alike() {
        let single = Value::from(json!({"id": 1}));
        let many = Value::from(json!([{"id": 1}, {"id": 2}]));
        assert_eq!(single.records().len(), 1);
        assert_eq!(many.records().len(), 2);
    }
}
