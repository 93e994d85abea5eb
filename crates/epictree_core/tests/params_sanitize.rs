use chrono::NaiveDate;
use epictree_core::transform::extract::{
    extract_fields, CELL_FIELDS, EPOCH_BLOCK_FIELDS, EPOCH_FIELDS, EPOCH_GROUP_FIELDS,
    EXPERIMENT_FIELDS, RESPONSE_FIELDS, STIMULUS_FIELDS,
};
use epictree_core::transform::params::flatten_params;
use epictree_core::transform::sanitize::{sanitize, NullPolicy};
use epictree_core::{Value, ValueMap};

/// Builds a blob `depth` levels deep with `width` keys per level and returns
/// it with the expected flattened key for every leaf.
fn nested_blob(depth: usize, width: usize) -> (Value, Vec<String>) {
    fn build(depth: usize, width: usize, path: &str, leaves: &mut Vec<String>) -> Value {
        let mut map = ValueMap::new();
        for index in 0..width {
            let key = format!("k{index}");
            let full = if path.is_empty() {
                key.clone()
            } else {
                format!("{path}_{key}")
            };
            if depth == 0 {
                leaves.push(full);
                map.insert(key, Value::Int(index as i64));
            } else {
                map.insert(key, build(depth - 1, width, &full, leaves));
            }
        }
        Value::Map(map)
    }

    let mut leaves = Vec::new();
    let blob = build(depth, width, "", &mut leaves);
    leaves.sort();
    (blob, leaves)
}

fn sample_values() -> Vec<Value> {
    let stamp = NaiveDate::from_ymd_opt(2025, 1, 2)
        .and_then(|date| date.and_hms_opt(3, 4, 5))
        .unwrap();
    let mut nested = ValueMap::new();
    nested.insert("when".to_string(), Value::Timestamp(stamp));
    nested.insert("gone".to_string(), Value::Null);
    nested.insert("empty".to_string(), Value::Map(ValueMap::new()));

    vec![
        Value::Null,
        Value::Empty,
        Value::Bool(true),
        Value::Int(-4),
        Value::Float(2.5),
        Value::from("text"),
        Value::Bytes(vec![1, 2, 3]),
        Value::Timestamp(stamp),
        Value::Opaque {
            kind: "decimal".to_string(),
            repr: "1.50".to_string(),
        },
        Value::Array(vec![0.5, 1.5]),
        Value::List(vec![Value::Int(1), Value::Int(2)]),
        Value::List(vec![Value::Int(1), Value::from("x"), Value::Null]),
        Value::Map(nested.clone()),
        Value::List(vec![Value::Map(nested)]),
    ]
}

fn contains_missing(value: &Value) -> bool {
    match value {
        Value::Null | Value::Empty => true,
        Value::List(items) => items.iter().any(contains_missing),
        Value::Map(map) => map.values().any(contains_missing),
        _ => false,
    }
}

#[test]
fn flattening_yields_one_key_per_leaf_for_every_depth() {
    for depth in 0..5 {
        for width in 1..4 {
            let (blob, leaves) = nested_blob(depth, width);
            let flat = flatten_params(&blob);

            assert!(flat.values().all(|value| !matches!(value, Value::Map(_))));
            let keys: Vec<String> = flat.keys().cloned().collect();
            assert_eq!(keys, leaves, "depth={depth} width={width}");
        }
    }
}

#[test]
fn flattening_is_idempotent_on_flat_input() {
    for depth in 0..4 {
        let (blob, _) = nested_blob(depth, 3);
        let once = flatten_params(&blob);
        let twice = flatten_params(&Value::Map(once.clone()));
        assert_eq!(once, twice);
    }
}

#[test]
fn sanitizing_twice_changes_nothing() {
    for policy in [NullPolicy::EmptyList, NullPolicy::EmptyText] {
        for value in sample_values() {
            let once = sanitize(&value, policy);
            assert_eq!(sanitize(&once, policy), once, "value={value:?}");
            assert!(!contains_missing(&once), "value={value:?}");
        }
    }
}

#[test]
fn sanitizer_keeps_empty_maps_and_stringifies_foreign_scalars() {
    let values = sample_values();
    let Value::Map(map) = sanitize(&values[12], NullPolicy::EmptyText) else {
        panic!("map stays a map");
    };
    assert_eq!(map.get("empty"), Some(&Value::Map(ValueMap::new())));
    assert_eq!(map.get("gone"), Some(&Value::from("")));
    assert_eq!(map.get("when"), Some(&Value::from("2025-01-02 03:04:05")));

    assert_eq!(
        sanitize(&values[8], NullPolicy::EmptyList),
        Value::from("1.50")
    );
}

#[test]
fn extraction_never_surfaces_missing_values() {
    let schemas = [
        EXPERIMENT_FIELDS,
        CELL_FIELDS,
        EPOCH_GROUP_FIELDS,
        EPOCH_BLOCK_FIELDS,
        EPOCH_FIELDS,
        RESPONSE_FIELDS,
        STIMULUS_FIELDS,
    ];

    let mut all_null = ValueMap::new();
    for schema in schemas {
        for spec in schema {
            all_null.insert(spec.name.to_string(), Value::Null);
        }
    }

    for schema in schemas {
        for object in [ValueMap::new(), all_null.clone()] {
            let fields = extract_fields(&object, schema);
            assert_eq!(fields.as_map().len(), schema.len());
            assert!(fields.as_map().values().all(|value| !value.is_missing()));
        }
    }
}

#[test]
fn labels_are_coerced_to_text() {
    let mut object = ValueMap::new();
    object.insert("label".to_string(), Value::Int(12));
    object.insert("id".to_string(), Value::from("7"));
    let fields = extract_fields(&object, CELL_FIELDS);
    assert_eq!(fields.text("label"), "12");
    assert_eq!(fields.int("id"), 7);
}
