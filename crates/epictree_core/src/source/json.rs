//! JSON dump adapter.
//!
//! # Responsibility
//! - Read either a dumped raw-node tree or a Symphony reader document and
//!   produce raw experiment trees.
//!
//! # Invariants
//! - Raw-node dumps are taken as-is: levels, payloads and order unchanged.
//! - Symphony documents yield `animal` and `preparation` as elided levels.

use super::{SourceAdapter, SourceError, SourceResult};
use crate::model::raw::{Level, RawNode};
use crate::model::value::{Value, ValueMap};
use log::info;
use std::fs;
use std::path::Path;

/// Node-level keys copied into the payload when the payload lacks them.
const NODE_LEVEL_KEYS: &[(&str, &str)] = &[
    ("id", "id"),
    ("label", "label"),
    ("is_mea", "is_mea"),
    ("protocol", "protocol_name"),
];

const RESPONSE_RENAMES: &[(&str, &str)] = &[
    ("sampleRate", "sample_rate"),
    ("sampleRateUnits", "sample_rate_units"),
    ("h5_path", "h5path"),
    ("spikeTimes", "spike_times"),
];

const STIMULUS_RENAMES: &[(&str, &str)] = &[
    ("sampleRate", "sample_rate"),
    ("h5_path", "h5path"),
    ("stimulusID", "stimulus_id"),
    ("parameters", "stimulus_parameters"),
];

pub struct JsonDumpSource {
    name: String,
    text: String,
}

impl JsonDumpSource {
    /// Reads a dump from disk; the file stem names Symphony experiments.
    pub fn from_path(path: &Path) -> SourceResult<Self> {
        let text = fs::read_to_string(path).map_err(|source| SourceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self { name, text })
    }

    pub fn from_text(name: &str, text: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            text: text.into(),
        }
    }
}

impl SourceAdapter for JsonDumpSource {
    fn describe(&self) -> String {
        "Symphony H5 + JSON".to_string()
    }

    fn load_experiments(&self) -> SourceResult<Vec<RawNode>> {
        let parsed: serde_json::Value = serde_json::from_str(&self.text)?;
        let document = Value::from(parsed);

        let roots = match &document {
            Value::List(items) => items.iter().map(raw_node).collect::<SourceResult<Vec<_>>>()?,
            Value::Map(map) if map.contains_key("level") => vec![raw_node(&document)?],
            Value::Map(map) if map.contains_key("animals") => vec![symphony_experiment(map, &self.name)],
            _ => {
                return Err(SourceError::InvalidData(
                    "expected a raw node, a list of raw nodes or a Symphony document".to_string(),
                ))
            }
        };

        info!(
            "event=source_load module=source status=ok source=json experiments={}",
            roots.len()
        );
        Ok(roots)
    }
}

/// Parses one dumped raw node and its subtree.
pub fn raw_node(value: &Value) -> SourceResult<RawNode> {
    let node = value
        .as_map()
        .ok_or_else(|| SourceError::InvalidData("raw node must be a mapping".to_string()))?;
    let level = node
        .get("level")
        .and_then(Value::as_str)
        .map(Level::parse)
        .ok_or_else(|| SourceError::InvalidData("raw node without a `level` tag".to_string()))?;

    let mut object = match node.get("object") {
        Some(Value::Map(map)) => map.clone(),
        // Query trees wrap the row in a one-element list.
        Some(Value::List(rows)) => rows.first().and_then(Value::as_map).cloned().unwrap_or_default(),
        _ => ValueMap::new(),
    };
    for (from, to) in NODE_LEVEL_KEYS {
        if let Some(value) = node.get(*from).filter(|value| !value.is_missing()) {
            object.entry((*to).to_string()).or_insert_with(|| value.clone());
        }
    }

    let children = node
        .get("children")
        .and_then(Value::as_list)
        .unwrap_or_default()
        .iter()
        .map(raw_node)
        .collect::<SourceResult<Vec<_>>>()?;

    Ok(RawNode {
        level,
        object,
        children,
        tags: records(node.get("tags")),
        responses: device_records(node.get("responses"), RESPONSE_RENAMES),
        stimuli: device_records(node.get("stimuli"), STIMULUS_RENAMES),
    })
}

fn symphony_experiment(document: &ValueMap, exp_name: &str) -> RawNode {
    let rig_type = document
        .get("rig_type")
        .and_then(Value::as_str)
        .unwrap_or("PATCH")
        .to_string();
    let data_file = ["h5_file", "data_file", "dataFile"]
        .iter()
        .find_map(|key| document.get(*key).filter(|value| !value.is_missing()))
        .cloned()
        .unwrap_or(Value::from(""));

    let mut experiment = RawNode::new(Level::Experiment)
        .with_field("id", 1_i64)
        .with_field("exp_name", exp_name)
        .with_field("is_mea", rig_type == "MEA")
        .with_field("rig", rig_type.as_str())
        .with_field("data_file", data_file);
    for key in ["label", "start_time", "experimenter", "institution", "lab"] {
        if let Some(value) = document.get(key) {
            experiment.object.insert(key.to_string(), value.clone());
        }
    }

    for animal in list_of(document.get("animals")) {
        let mut animal_node = RawNode::new(Level::parse("animal")).with_object(payload(animal, "preparations"));
        for preparation in list_of(animal.get("preparations")) {
            let mut prep_node =
                RawNode::new(Level::parse("preparation")).with_object(payload(preparation, "cells"));
            for (index, cell) in list_of(preparation.get("cells")).into_iter().enumerate() {
                prep_node.children.push(symphony_cell(cell, index + 1));
            }
            animal_node.children.push(prep_node);
        }
        experiment.children.push(animal_node);
    }
    experiment
}

fn symphony_cell(cell: &ValueMap, position: usize) -> RawNode {
    let mut node = RawNode::new(Level::Cell)
        .with_field("label", text_or(cell, "label", format!("Cell{position}")))
        .with_field("type", text_or(cell, "type", String::new()));
    if let Some(properties) = cell.get("properties") {
        node.object.insert("properties".to_string(), properties.clone());
    }
    node.tags = records(cell.get("tags"));

    for (index, group) in list_of(cell.get("epoch_groups")).into_iter().enumerate() {
        node.children.push(symphony_epoch_group(group, index + 1));
    }
    node
}

fn symphony_epoch_group(group: &ValueMap, position: usize) -> RawNode {
    let mut node = RawNode::new(Level::EpochGroup)
        .with_field("label", text_or(group, "label", format!("Group{position}")));
    copy_keys(group, &mut node.object, &["start_time", "end_time"]);

    for (index, block) in list_of(group.get("epoch_blocks")).into_iter().enumerate() {
        let block_node = symphony_epoch_block(block, index + 1);
        // The group takes its protocol from the first block.
        if index == 0 {
            if let Some(protocol) = block_node.object.get("protocol_name") {
                node.object.insert("protocol_name".to_string(), protocol.clone());
            }
        }
        node.children.push(block_node);
    }
    node
}

fn symphony_epoch_block(block: &ValueMap, position: usize) -> RawNode {
    let protocol_name = block
        .get("protocolID")
        .and_then(Value::as_str)
        .and_then(|id| id.rsplit('.').next())
        .unwrap_or_default()
        .to_string();

    let mut node = RawNode::new(Level::EpochBlock)
        .with_field("label", text_or(block, "label", format!("Block{position}")))
        .with_field("protocol_name", protocol_name);
    copy_keys(block, &mut node.object, &["start_time", "end_time", "parameters"]);
    if let Some(data_dir) = block.get("dataFile") {
        node.object.insert("data_dir".to_string(), data_dir.clone());
    }

    for (index, epoch) in list_of(block.get("epochs")).into_iter().enumerate() {
        node.children.push(symphony_epoch(epoch, index + 1));
    }
    node
}

fn symphony_epoch(epoch: &ValueMap, position: usize) -> RawNode {
    let mut node = RawNode::new(Level::Epoch)
        .with_field("label", text_or(epoch, "label", format!("Epoch{position}")));
    copy_keys(
        epoch,
        &mut node.object,
        &["h5_uuid", "start_time", "end_time", "parameters", "frame_times_ms"],
    );
    if let Some(frame_times) = epoch.get("frameTimesMs") {
        node.object.insert("frame_times_ms".to_string(), frame_times.clone());
    }
    node.responses = device_records(epoch.get("responses"), RESPONSE_RENAMES)
        .into_iter()
        .map(with_symphony_response_defaults)
        .collect();
    node.stimuli = device_records(epoch.get("stimuli"), STIMULUS_RENAMES);
    node
}

/// Symphony amplifier channels record current at 10 kHz unless stated.
fn with_symphony_response_defaults(mut record: ValueMap) -> ValueMap {
    let defaults = [("units", Value::from("pA")), ("sample_rate", Value::Int(10_000))];
    for (key, default) in defaults {
        if record.get(key).map_or(true, Value::is_missing) {
            record.insert(key.to_string(), default);
        }
    }
    record
}

/// Items of a list that are mappings; anything else yields nothing.
fn list_of(value: Option<&Value>) -> Vec<&ValueMap> {
    value
        .and_then(Value::as_list)
        .map(|items| items.iter().filter_map(Value::as_map).collect())
        .unwrap_or_default()
}

fn records(value: Option<&Value>) -> Vec<ValueMap> {
    list_of(value).into_iter().cloned().collect()
}

/// Reads responses/stimuli given either as a list or as a mapping keyed by
/// device name.
fn device_records(value: Option<&Value>, renames: &[(&str, &str)]) -> Vec<ValueMap> {
    let raw: Vec<ValueMap> = match value {
        Some(Value::Map(by_device)) => by_device
            .iter()
            .filter_map(|(device, record)| {
                let mut record = record.as_map()?.clone();
                record
                    .entry("device_name".to_string())
                    .or_insert_with(|| Value::from(device.as_str()));
                Some(record)
            })
            .collect(),
        other => records(other),
    };

    raw.into_iter()
        .map(|mut record| {
            for (from, to) in renames {
                if let Some(value) = record.get(*from).cloned() {
                    record.entry((*to).to_string()).or_insert(value);
                }
            }
            if !record.contains_key("device_name") {
                if let Some(label) = record.get("label").cloned() {
                    record.insert("device_name".to_string(), label);
                }
            }
            record
        })
        .collect()
}

/// Copies `source` without its `children_key` list, lifting a nested
/// `properties` mapping to the top level.
fn payload(source: &ValueMap, children_key: &str) -> ValueMap {
    let mut object: ValueMap = source
        .iter()
        .filter(|(key, _)| key.as_str() != children_key && key.as_str() != "properties")
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    if let Some(Value::Map(properties)) = source.get("properties") {
        for (key, value) in properties {
            object.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
    object
}

fn copy_keys(source: &ValueMap, target: &mut ValueMap, keys: &[&str]) {
    for key in keys {
        if let Some(value) = source.get(*key) {
            target.insert((*key).to_string(), value.clone());
        }
    }
}

fn text_or(source: &ValueMap, key: &str, fallback: String) -> Value {
    match source.get(key) {
        Some(value) if !value.is_missing() => value.clone(),
        _ => Value::from(fallback),
    }
}
