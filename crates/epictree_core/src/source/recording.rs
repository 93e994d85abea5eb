//! Recording-file adapter.
//!
//! # Responsibility
//! - Walk a hierarchical recording file (HDF5-like groups with attributes and
//!   datasets) and emit experiment trees without elided levels.
//! - Read sample datasets back by intra-file locator.
//!
//! # Invariants
//! - Layout walked: `experiment-*/sources/source-*/experiment/epochGroups/
//!   epochGroup-*/epochBlocks/*/epochs/epoch-*/{responses,stimuli}/*`.
//! - Cells are discovered from each epoch group's `source` link and grouped
//!   by label in first-seen order.
//! - Response/stimulus locators are absolute group paths inside the file.

use super::{SourceAdapter, SourceResult};
use crate::model::document::SampleRef;
use crate::model::raw::{Level, RawNode};
use crate::model::value::{Value, ValueMap};
use crate::transform::resolve::{ReadError, SampleReader};
use chrono::{Duration, NaiveDate};
use log::{debug, info};
use std::collections::BTreeMap;

/// Attribute holding .NET `DateTimeOffset` ticks (100 ns since 0001-01-01).
const START_TICKS: &str = "startTimeDotNetDateTimeOffsetTicks";
const END_TICKS: &str = "endTimeDotNetDateTimeOffsetTicks";

const ANIMAL_KEYS: &[&str] = &["species", "age", "sex", "weight", "description"];
const EXPERIMENT_PROPERTY_KEYS: &[&str] = &["experimenter", "rig", "institution", "lab"];

/// Read access to one group of a recording file.
pub trait RecordingGroup {
    fn attrs(&self) -> &ValueMap;
    /// Child group names in file order.
    fn group_names(&self) -> Vec<&str>;
    fn group(&self, name: &str) -> Option<&Self>;
    fn dataset(&self, name: &str) -> Option<&Value>;
    fn dataset_names(&self) -> Vec<&str>;
}

/// In-memory recording group; child names iterate in lexical order like an
/// HDF5 group's default index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryGroup {
    pub attrs: ValueMap,
    pub groups: BTreeMap<String, MemoryGroup>,
    pub datasets: BTreeMap<String, Value>,
}

impl MemoryGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_attr(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attrs.insert(key.to_string(), value.into());
        self
    }

    pub fn with_group(mut self, name: &str, group: MemoryGroup) -> Self {
        self.groups.insert(name.to_string(), group);
        self
    }

    pub fn with_dataset(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.datasets.insert(name.to_string(), value.into());
        self
    }
}

impl RecordingGroup for MemoryGroup {
    fn attrs(&self) -> &ValueMap {
        &self.attrs
    }

    fn group_names(&self) -> Vec<&str> {
        self.groups.keys().map(String::as_str).collect()
    }

    fn group(&self, name: &str) -> Option<&Self> {
        self.groups.get(name)
    }

    fn dataset(&self, name: &str) -> Option<&Value> {
        self.datasets.get(name)
    }

    fn dataset_names(&self) -> Vec<&str> {
        self.datasets.keys().map(String::as_str).collect()
    }
}

/// Emits experiment trees from the root group of one recording file.
pub struct RecordingFileSource<'g, G> {
    root: &'g G,
    file: String,
    exp_name: String,
}

impl<'g, G: RecordingGroup> RecordingFileSource<'g, G> {
    /// `file` is the path recorded in lazy references; its stem names the
    /// experiment.
    pub fn new(root: &'g G, file: &str) -> Self {
        let exp_name = std::path::Path::new(file)
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            root,
            file: file.to_string(),
            exp_name,
        }
    }

    fn experiment(&self, key: &str, group: &G, position: usize) -> RawNode {
        let mut node = RawNode::new(Level::Experiment)
            .with_field("id", position as i64)
            .with_field("exp_name", self.exp_name.as_str())
            .with_field("label", self.exp_name.as_str())
            .with_field("data_file", self.file.as_str());
        if let Some(uuid) = group.attrs().get("uuid") {
            node.object.insert("h5_uuid".to_string(), uuid.clone());
        }
        if let Some(start) = group.attrs().get(START_TICKS) {
            node.object.insert("start_time".to_string(), ticks_to_timestamp(start));
        }
        if let Some(properties) = group.group("properties") {
            let properties = read_properties(properties);
            for key in EXPERIMENT_PROPERTY_KEYS {
                if let Some(value) = properties.get(*key) {
                    node.object.insert((*key).to_string(), value.clone());
                }
            }
        }

        let mut cells = CellRegistry::default();
        let sources_path = format!("/{key}/sources");
        if let Some(sources) = group.group("sources") {
            for (index, source_key) in prefixed(sources, "source-").into_iter().enumerate() {
                let Some(source) = sources.group(source_key) else {
                    continue;
                };
                let path = format!("{sources_path}/{source_key}/experiment");
                self.collect_source(source, &path, index + 1, &mut cells);
            }
        }
        node.children = cells.into_nodes();
        node
    }

    fn collect_source(&self, source: &G, path: &str, position: usize, cells: &mut CellRegistry) {
        let animal = source
            .group("properties")
            .map(read_properties)
            .unwrap_or_default();
        let animal_info: ValueMap = ANIMAL_KEYS
            .iter()
            .filter_map(|key| animal.get(*key).map(|value| ((*key).to_string(), value.clone())))
            .collect();

        let Some(groups) = source
            .group("experiment")
            .and_then(|experiment| experiment.group("epochGroups"))
        else {
            return;
        };

        for group_key in prefixed(groups, "epochGroup-") {
            let Some(group) = groups.group(group_key) else {
                continue;
            };
            let group_path = format!("{path}/epochGroups/{group_key}");
            let (label, cell_source) = cell_source(group);
            let label = label.unwrap_or_else(|| format!("Cell {position}"));
            let cell = cells.entry(&label, &animal_info, cell_source.as_ref());
            cell.children.push(epoch_group(group_key, group, &group_path));
        }
    }
}

impl<G: RecordingGroup> SourceAdapter for RecordingFileSource<'_, G> {
    fn describe(&self) -> String {
        "H5 file direct parse".to_string()
    }

    fn load_experiments(&self) -> SourceResult<Vec<RawNode>> {
        let roots: Vec<RawNode> = prefixed(self.root, "experiment-")
            .into_iter()
            .enumerate()
            .filter_map(|(index, key)| {
                self.root
                    .group(key)
                    .map(|group| self.experiment(key, group, index + 1))
            })
            .collect();
        info!(
            "event=source_load module=source status=ok source=recording experiments={}",
            roots.len()
        );
        Ok(roots)
    }
}

/// Cells keyed by label, in first-seen order.
#[derive(Default)]
struct CellRegistry {
    cells: Vec<(String, RawNode)>,
}

impl CellRegistry {
    fn entry(&mut self, label: &str, animal: &ValueMap, source: Option<&ValueMap>) -> &mut RawNode {
        let position = match self.cells.iter().position(|(known, _)| known == label) {
            Some(position) => position,
            None => {
                let mut properties = animal.clone();
                if let Some(source) = source {
                    properties.extend(
                        source
                            .iter()
                            .filter(|(key, _)| key.as_str() != "type")
                            .map(|(key, value)| (key.clone(), value.clone())),
                    );
                }
                let node = RawNode::new(Level::Cell)
                    .with_field("id", self.cells.len() as i64 + 1)
                    .with_field("label", label)
                    .with_field("properties", properties);
                self.cells.push((label.to_string(), node));
                self.cells.len() - 1
            }
        };

        let node = &mut self.cells[position].1;
        // A later epoch group may name the type the first one lacked.
        let has_type = node
            .object
            .get("type")
            .is_some_and(|cell_type| !cell_type.to_text().is_empty());
        if !has_type {
            if let Some(cell_type) = source
                .and_then(|props| props.get("type"))
                .filter(|cell_type| !cell_type.is_missing())
            {
                node.object.insert("type".to_string(), cell_type.clone());
            }
        }
        node
    }

    fn into_nodes(self) -> Vec<RawNode> {
        self.cells.into_iter().map(|(_, node)| node).collect()
    }
}

/// Label and properties of the cell an epoch group links to.
fn cell_source<G: RecordingGroup>(group: &G) -> (Option<String>, Option<ValueMap>) {
    let Some(source) = group.group("source") else {
        return (None, None);
    };
    let label = source
        .attrs()
        .get("label")
        .map(Value::to_text)
        .filter(|label| !label.is_empty());
    (label, source.group("properties").map(read_properties))
}

fn epoch_group<G: RecordingGroup>(key: &str, group: &G, path: &str) -> RawNode {
    let attrs = group.attrs();
    let mut node = RawNode::new(Level::EpochGroup).with_field(
        "label",
        attrs
            .get("label")
            .cloned()
            .unwrap_or_else(|| Value::from(key)),
    );
    copy_times(attrs, &mut node.object);
    if let Some(uuid) = attrs.get("uuid") {
        node.object.insert("h5_uuid".to_string(), uuid.clone());
    }

    let Some(blocks) = group.group("epochBlocks") else {
        return node;
    };
    for block_key in blocks.group_names() {
        let Some(block) = blocks.group(block_key) else {
            continue;
        };
        let block_node = epoch_block(block_key, block, &format!("{path}/epochBlocks/{block_key}"));
        if block_node.children.is_empty() {
            debug!("event=source_load module=source status=skipped level=epoch_block block={block_key}");
            continue;
        }
        if !node.object.contains_key("protocol_name") {
            if let Some(protocol) = block_node.object.get("protocol_name") {
                node.object.insert("protocol_name".to_string(), protocol.clone());
            }
        }
        node.children.push(block_node);
    }
    node
}

fn epoch_block<G: RecordingGroup>(key: &str, block: &G, path: &str) -> RawNode {
    let attrs = block.attrs();
    let protocol_name = match attrs.get("protocolID").and_then(Value::as_str) {
        Some(id) if !id.is_empty() => id.rsplit('.').next().unwrap_or(id).to_string(),
        _ => key.split('-').next().unwrap_or(key).to_string(),
    };

    let mut node = RawNode::new(Level::EpochBlock)
        .with_field("label", key)
        .with_field("protocol_name", protocol_name);
    copy_times(attrs, &mut node.object);
    if let Some(uuid) = attrs.get("uuid") {
        node.object.insert("h5_uuid".to_string(), uuid.clone());
    }
    if let Some(parameters) = block.group("protocolParameters") {
        node.object
            .insert("parameters".to_string(), Value::Map(parameters.attrs().clone()));
    }

    let Some(epochs) = block.group("epochs") else {
        return node;
    };
    for epoch_key in prefixed(epochs, "epoch-") {
        if let Some(epoch) = epochs.group(epoch_key) {
            node.children
                .push(epoch_node(epoch_key, epoch, &format!("{path}/epochs/{epoch_key}")));
        }
    }
    node
}

fn epoch_node<G: RecordingGroup>(key: &str, epoch: &G, path: &str) -> RawNode {
    let attrs = epoch.attrs();
    let mut node = RawNode::new(Level::Epoch).with_field("label", key);
    copy_times(attrs, &mut node.object);
    if let Some(uuid) = attrs.get("uuid") {
        node.object.insert("h5_uuid".to_string(), uuid.clone());
    }
    if let Some(parameters) = epoch.group("protocolParameters") {
        node.object
            .insert("parameters".to_string(), Value::Map(parameters.attrs().clone()));
    }

    if let Some(responses) = epoch.group("responses") {
        for response_key in responses.group_names() {
            let Some(response) = responses.group(response_key) else {
                continue;
            };
            let attrs = response.attrs();
            let mut record = ValueMap::new();
            record.insert("device_name".to_string(), Value::from(device_name(response_key)));
            record.insert(
                "h5path".to_string(),
                Value::from(format!("{path}/responses/{response_key}")),
            );
            for (from, to) in [
                ("sampleRate", "sample_rate"),
                ("sampleRateUnits", "sample_rate_units"),
                ("units", "units"),
            ] {
                if let Some(value) = attrs.get(from) {
                    record.insert(to.to_string(), value.clone());
                }
            }
            node.responses.push(record);
        }
    }

    if let Some(stimuli) = epoch.group("stimuli") {
        for stimulus_key in stimuli.group_names() {
            let Some(stimulus) = stimuli.group(stimulus_key) else {
                continue;
            };
            let attrs = stimulus.attrs();
            let mut record = ValueMap::new();
            record.insert("device_name".to_string(), Value::from(device_name(stimulus_key)));
            record.insert(
                "h5path".to_string(),
                Value::from(format!("{path}/stimuli/{stimulus_key}")),
            );
            for (from, to) in [
                ("stimulusID", "stimulus_id"),
                ("sampleRate", "sample_rate"),
                ("units", "units"),
            ] {
                if let Some(value) = attrs.get(from) {
                    record.insert(to.to_string(), value.clone());
                }
            }
            if let Some(parameters) = stimulus.group("parameters") {
                record.insert(
                    "stimulus_parameters".to_string(),
                    Value::Map(read_properties(parameters)),
                );
            }
            node.stimuli.push(record);
        }
    }
    node
}

/// Group attributes, scalar datasets and child-group attributes as one map.
fn read_properties<G: RecordingGroup>(group: &G) -> ValueMap {
    let mut properties = group.attrs().clone();
    for name in group.dataset_names() {
        if let Some(value) = group.dataset(name) {
            properties.insert(name.to_string(), value.clone());
        }
    }
    for name in group.group_names() {
        if let Some(child) = group.group(name) {
            if !child.attrs().is_empty() {
                properties.insert(name.to_string(), Value::Map(child.attrs().clone()));
            }
        }
    }
    properties
}

fn prefixed<'a, G: RecordingGroup>(group: &'a G, prefix: &str) -> Vec<&'a str> {
    group
        .group_names()
        .into_iter()
        .filter(|name| name.starts_with(prefix))
        .collect()
}

fn device_name(key: &str) -> &str {
    key.split('-').next().unwrap_or(key)
}

fn copy_times(attrs: &ValueMap, object: &mut ValueMap) {
    if let Some(start) = attrs.get(START_TICKS) {
        object.insert("start_time".to_string(), ticks_to_timestamp(start));
    }
    if let Some(end) = attrs.get(END_TICKS) {
        object.insert("end_time".to_string(), ticks_to_timestamp(end));
    }
}

/// Converts .NET ticks to a timestamp; non-numeric values pass through.
pub fn ticks_to_timestamp(value: &Value) -> Value {
    let Some(ticks) = value.as_i64() else {
        return value.clone();
    };
    let Some(epoch) = NaiveDate::from_ymd_opt(1, 1, 1).and_then(|date| date.and_hms_opt(0, 0, 0))
    else {
        return value.clone();
    };
    match epoch.checked_add_signed(Duration::microseconds(ticks / 10)) {
        Some(stamp) => Value::Timestamp(stamp),
        None => value.clone(),
    }
}

/// Reads `data` datasets of one recording file by absolute group path.
pub struct RecordingSampleReader<'g, G> {
    root: &'g G,
    file: String,
}

impl<'g, G: RecordingGroup> RecordingSampleReader<'g, G> {
    pub fn new(root: &'g G, file: &str) -> Self {
        Self {
            root,
            file: file.to_string(),
        }
    }
}

impl<G: RecordingGroup + Sync> SampleReader for RecordingSampleReader<'_, G> {
    fn read_samples(&self, source: &SampleRef) -> Result<Vec<f64>, ReadError> {
        if source.file != self.file {
            return Err(ReadError::new(format!(
                "reference points at `{}`, reader is bound to `{}`",
                source.file, self.file
            )));
        }

        let mut group = self.root;
        for segment in source.locator.split('/').filter(|s| !s.is_empty()) {
            group = group
                .group(segment)
                .ok_or_else(|| ReadError::new(format!("no group `{segment}`")))?;
        }
        group
            .dataset("data")
            .and_then(Value::to_samples)
            .ok_or_else(|| ReadError::new("group has no numeric `data` dataset"))
    }
}
