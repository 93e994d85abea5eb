//! Per-level field extraction with declared defaults.
//!
//! # Responsibility
//! - Declare, once per hierarchy level, the exact field set pulled from a raw
//!   payload and the default used when a field is absent or null.
//! - Coerce present values into the declared kind.
//!
//! # Invariants
//! - Extraction never fails; absence is a handled case.
//! - The returned field set is exactly the declared schema; no raw nulls.
//! - Fields are independent of each other and of declaration order.

use crate::model::document::Tag;
use crate::model::value::{Value, ValueMap};
use once_cell::sync::Lazy;
use regex::Regex;

static SAMPLE_RATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d+(?:\.\d+)?)\s*(MHz|kHz|Hz)?").expect("valid sample rate regex")
});

/// Coercion applied to a declared field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Stringified; temporal values use their canonical rendering.
    Text,
    Integer,
    Float,
    Flag,
    /// Sample rate in Hz, accepting unit-suffixed text.
    Rate,
}

/// One declared field of a level schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    /// Default for `Text` fields; numeric kinds default to zero, flags to false.
    pub default_text: &'static str,
}

impl FieldSpec {
    pub const fn text(name: &'static str) -> Self {
        Self::text_or(name, "")
    }

    pub const fn text_or(name: &'static str, default_text: &'static str) -> Self {
        Self {
            name,
            kind: FieldKind::Text,
            default_text,
        }
    }

    pub const fn integer(name: &'static str) -> Self {
        Self::of(name, FieldKind::Integer)
    }

    pub const fn float(name: &'static str) -> Self {
        Self::of(name, FieldKind::Float)
    }

    pub const fn flag(name: &'static str) -> Self {
        Self::of(name, FieldKind::Flag)
    }

    pub const fn rate(name: &'static str) -> Self {
        Self::of(name, FieldKind::Rate)
    }

    const fn of(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            default_text: "",
        }
    }

    /// Extracts this field from an optional raw value.
    pub fn extract(&self, raw: Option<&Value>) -> Value {
        let present = raw.filter(|value| !value.is_missing());
        match self.kind {
            FieldKind::Text => match present {
                Some(value) => Value::Text(value.to_text()),
                None => Value::from(self.default_text),
            },
            FieldKind::Integer => Value::Int(present.and_then(Value::as_i64).unwrap_or(0)),
            FieldKind::Float => Value::Float(present.and_then(Value::as_f64).unwrap_or(0.0)),
            FieldKind::Flag => Value::Bool(present.and_then(Value::as_bool).unwrap_or(false)),
            FieldKind::Rate => Value::Float(present.map_or(0.0, parse_sample_rate)),
        }
    }
}

pub const EXPERIMENT_FIELDS: &[FieldSpec] = &[
    FieldSpec::integer("id"),
    FieldSpec::text("h5_uuid"),
    FieldSpec::text("exp_name"),
    FieldSpec::text("label"),
    FieldSpec::flag("is_mea"),
    FieldSpec::text("experimenter"),
    FieldSpec::text("rig"),
    FieldSpec::text("institution"),
    FieldSpec::text("lab"),
    FieldSpec::text("start_time"),
    FieldSpec::text("data_file"),
];

pub const ANIMAL_FIELDS: &[FieldSpec] = &[
    FieldSpec::text("species"),
    FieldSpec::text("age"),
    FieldSpec::text("sex"),
    FieldSpec::text("weight"),
    FieldSpec::text("description"),
];

pub const PREPARATION_FIELDS: &[FieldSpec] = &[
    FieldSpec::text("bath_solution"),
    FieldSpec::text("region"),
];

pub const CELL_FIELDS: &[FieldSpec] = &[
    FieldSpec::integer("id"),
    FieldSpec::text("h5_uuid"),
    FieldSpec::text("label"),
    FieldSpec::text("type"),
];

pub const EPOCH_GROUP_FIELDS: &[FieldSpec] = &[
    FieldSpec::integer("id"),
    FieldSpec::text("h5_uuid"),
    FieldSpec::text("label"),
    FieldSpec::text("protocol_name"),
    FieldSpec::integer("protocol_id"),
    FieldSpec::text("start_time"),
    FieldSpec::text("end_time"),
];

pub const EPOCH_BLOCK_FIELDS: &[FieldSpec] = &[
    FieldSpec::integer("id"),
    FieldSpec::text("h5_uuid"),
    FieldSpec::text("label"),
    FieldSpec::text("protocol_name"),
    FieldSpec::integer("protocol_id"),
    FieldSpec::text("start_time"),
    FieldSpec::text("end_time"),
    FieldSpec::text("data_dir"),
];

pub const EPOCH_FIELDS: &[FieldSpec] = &[
    FieldSpec::integer("id"),
    FieldSpec::text("h5_uuid"),
    FieldSpec::text("label"),
    FieldSpec::text("start_time"),
    FieldSpec::text("end_time"),
];

pub const RESPONSE_FIELDS: &[FieldSpec] = &[
    FieldSpec::integer("id"),
    FieldSpec::text("device_name"),
    FieldSpec::text("h5path"),
    FieldSpec::rate("sample_rate"),
    FieldSpec::text_or("sample_rate_units", "Hz"),
    FieldSpec::text_or("units", "mV"),
    FieldSpec::float("offset_ms"),
];

pub const STIMULUS_FIELDS: &[FieldSpec] = &[
    FieldSpec::integer("id"),
    FieldSpec::text("device_name"),
    FieldSpec::text("stimulus_id"),
    FieldSpec::text("h5path"),
    FieldSpec::rate("sample_rate"),
    FieldSpec::text_or("units", "normalized"),
];

/// Keys never merged from an elided level; they identify the row, not the cell.
pub const IDENTITY_KEYS: &[&str] = &["id", "h5_uuid", "label", "experiment_id", "parent_id"];

/// Schema used to merge an elided level into the nearest retained level.
///
/// Returns `None` for levels without a declared schema; their whole payload
/// is merged instead.
pub fn elided_schema(level_name: &str) -> Option<&'static [FieldSpec]> {
    match level_name {
        "animal" => Some(ANIMAL_FIELDS),
        "preparation" => Some(PREPARATION_FIELDS),
        _ => None,
    }
}

/// Extracted field set of one node.
#[derive(Debug, Clone, PartialEq)]
pub struct Fields(ValueMap);

impl Fields {
    pub fn text(&self, name: &str) -> String {
        self.0.get(name).map(Value::to_text).unwrap_or_default()
    }

    pub fn int(&self, name: &str) -> i64 {
        self.0.get(name).and_then(Value::as_i64).unwrap_or(0)
    }

    pub fn float(&self, name: &str) -> f64 {
        self.0.get(name).and_then(Value::as_f64).unwrap_or(0.0)
    }

    pub fn flag(&self, name: &str) -> bool {
        self.0.get(name).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn as_map(&self) -> &ValueMap {
        &self.0
    }

    pub fn into_map(self) -> ValueMap {
        self.0
    }
}

/// Extracts exactly the declared `schema` fields from `object`.
pub fn extract_fields(object: &ValueMap, schema: &[FieldSpec]) -> Fields {
    Fields(
        schema
            .iter()
            .map(|spec| (spec.name.to_string(), spec.extract(object.get(spec.name))))
            .collect(),
    )
}

/// Keeps `user` and `tag` of each raw tag record.
pub fn extract_tags(raw_tags: &[ValueMap]) -> Vec<Tag> {
    raw_tags
        .iter()
        .map(|raw| {
            let fields = extract_fields(raw, &[FieldSpec::text("user"), FieldSpec::text("tag")]);
            Tag {
                user: fields.text("user"),
                tag: fields.text("tag"),
            }
        })
        .collect()
}

/// Converts a sample rate to Hz.
///
/// Numbers pass through; text such as `"10 kHz"` or `"10000 Hz"` is parsed
/// from its first decimal number and optional unit. Anything else is `0.0`.
pub fn parse_sample_rate(value: &Value) -> f64 {
    match value {
        Value::Int(rate) => *rate as f64,
        Value::Float(rate) => *rate,
        Value::Text(text) => parse_rate_text(text),
        _ => 0.0,
    }
}

fn parse_rate_text(text: &str) -> f64 {
    let Some(captures) = SAMPLE_RATE_RE.captures(text) else {
        return 0.0;
    };
    let magnitude = captures
        .get(1)
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .unwrap_or(0.0);
    match captures.get(2).map(|m| m.as_str()) {
        Some("kHz") => magnitude * 1_000.0,
        Some("MHz") => magnitude * 1_000_000.0,
        _ => magnitude,
    }
}

#[cfg(test)]
mod tests {
    use super::{
        extract_fields, extract_tags, parse_sample_rate, EXPERIMENT_FIELDS, RESPONSE_FIELDS,
    };
    use crate::model::value::{Value, ValueMap};
    use serde_json::json;

    fn object(value: serde_json::Value) -> ValueMap {
        match Value::from(value) {
            Value::Map(map) => map,
            _ => ValueMap::new(),
        }
    }

    #[test]
    fn missing_and_null_fields_take_declared_defaults() {
        let fields = extract_fields(
            &object(json!({"label": null, "rig": "B", "is_mea": null})),
            EXPERIMENT_FIELDS,
        );
        assert_eq!(fields.as_map().len(), EXPERIMENT_FIELDS.len());
        assert_eq!(fields.int("id"), 0);
        assert_eq!(fields.text("label"), "");
        assert_eq!(fields.text("rig"), "B");
        assert!(!fields.flag("is_mea"));
        assert!(fields.as_map().values().all(|value| !value.is_missing()));
    }

    #[test]
    fn labels_are_force_stringified() {
        let fields = extract_fields(&object(json!({"label": 17})), EXPERIMENT_FIELDS);
        assert_eq!(fields.as_map().get("label"), Some(&Value::from("17")));
    }

    #[test]
    fn response_defaults_are_unit_specific() {
        let fields = extract_fields(&ValueMap::new(), RESPONSE_FIELDS);
        assert_eq!(fields.text("units"), "mV");
        assert_eq!(fields.text("sample_rate_units"), "Hz");
        assert_eq!(fields.float("sample_rate"), 0.0);
    }

    #[test]
    fn sample_rates_normalize_to_hz() {
        assert_eq!(parse_sample_rate(&Value::from("10000 Hz")), 10_000.0);
        assert_eq!(parse_sample_rate(&Value::from("10 kHz")), 10_000.0);
        assert_eq!(parse_sample_rate(&Value::from("1.5MHz")), 1_500_000.0);
        assert_eq!(parse_sample_rate(&Value::Int(20_000)), 20_000.0);
        assert_eq!(parse_sample_rate(&Value::from("fast")), 0.0);
        assert_eq!(parse_sample_rate(&Value::Null), 0.0);
    }

    #[test]
    fn tags_keep_only_user_and_tag() {
        let raw = vec![object(json!({"user": "alice", "tag": "good", "tag_id": 4}))];
        let tags = extract_tags(&raw);
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].user, "alice");
        assert_eq!(tags[0].tag, "good");
    }
}
