//! Canonical five-level export document.
//!
//! # Responsibility
//! - Define the fixed Experiment → Cell → EpochGroup → EpochBlock → Epoch
//!   hierarchy with nested Response/Stimulus records.
//! - Lower the typed document into interchange values with stable field names.
//!
//! # Invariants
//! - Field names produced by `to_value` are part of the compatibility contract
//!   with the analysis GUI and must not change.
//! - `parameters`, `properties` and `stimulus_parameters` never hold nested maps.
//! - Sample arrays are always emitted, empty when not loaded.

use crate::model::value::{Value, ValueMap};

/// Schema tag written as the root `format_version` field.
pub const FORMAT_VERSION: &str = "1.0";

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub format_version: String,
    pub metadata: ExportMetadata,
    pub experiments: Vec<Experiment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportMetadata {
    /// `%Y-%m-%d %H:%M:%S` local time of the run.
    pub created_date: String,
    /// Provenance, e.g. `DataJoint + H5 files`.
    pub data_source: String,
    pub export_user: String,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub user: String,
    pub tag: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Experiment {
    pub id: i64,
    pub h5_uuid: String,
    pub exp_name: String,
    pub label: String,
    /// Always `false` in an emitted document; MEA sources are rejected.
    pub is_mea: bool,
    pub experimenter: String,
    pub rig: String,
    pub institution: String,
    pub lab: String,
    pub start_time: String,
    /// Recording file backing lazy references, possibly empty.
    pub h5_file: String,
    pub tags: Vec<Tag>,
    pub cells: Vec<Cell>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    pub id: i64,
    pub h5_uuid: String,
    pub label: String,
    /// Serialized as `type`.
    pub cell_type: String,
    /// Metadata merged from elided ancestor levels plus the cell's own
    /// property blob.
    pub properties: ValueMap,
    pub tags: Vec<Tag>,
    pub epoch_groups: Vec<EpochGroup>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpochGroup {
    pub id: i64,
    pub h5_uuid: String,
    pub label: String,
    pub protocol_name: String,
    pub protocol_id: i64,
    pub start_time: String,
    pub end_time: String,
    pub tags: Vec<Tag>,
    pub epoch_blocks: Vec<EpochBlock>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpochBlock {
    pub id: i64,
    pub h5_uuid: String,
    pub label: String,
    pub protocol_name: String,
    pub protocol_id: i64,
    pub start_time: String,
    pub end_time: String,
    pub data_dir: String,
    pub parameters: ValueMap,
    pub tags: Vec<Tag>,
    pub epochs: Vec<Epoch>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Epoch {
    pub id: i64,
    /// Stable identifier used by the selection-mask artifact.
    pub h5_uuid: String,
    pub label: String,
    pub start_time: String,
    pub end_time: String,
    /// Block parameters overlaid with epoch parameters.
    pub parameters: ValueMap,
    /// Display frame flip times relative to epoch start; empty when unknown.
    pub frame_times_ms: Vec<f64>,
    pub tags: Vec<Tag>,
    pub responses: Vec<Response>,
    pub stimuli: Vec<Stimulus>,
}

/// Location of a sample payload inside a recording file.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SampleRef {
    pub file: String,
    pub locator: String,
}

impl SampleRef {
    pub fn is_complete(&self) -> bool {
        !self.file.trim().is_empty() && !self.locator.trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SampleData {
    /// Not read; consumers load through the reference.
    Lazy,
    Inline(Vec<f64>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    pub source: SampleRef,
    pub data: SampleData,
}

impl Payload {
    pub fn lazy(source: SampleRef) -> Self {
        Self {
            source,
            data: SampleData::Lazy,
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.data, SampleData::Inline(_))
    }

    fn push_fields(&self, fields: &mut Vec<(&'static str, Value)>) {
        let samples = match &self.data {
            SampleData::Lazy => Vec::new(),
            SampleData::Inline(samples) => samples.clone(),
        };
        fields.push(("h5_file", Value::from(self.source.file.as_str())));
        fields.push(("h5_path", Value::from(self.source.locator.as_str())));
        fields.push(("data", Value::Array(samples)));
        fields.push(("data_loaded", Value::Bool(self.is_loaded())));
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: i64,
    pub device_name: String,
    pub units: String,
    /// Hz.
    pub sample_rate: f64,
    pub sample_rate_units: String,
    pub payload: Payload,
    pub spike_times: Vec<f64>,
    pub offset_ms: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stimulus {
    pub id: i64,
    pub device_name: String,
    /// Generator class of the stimulus.
    pub stimulus_id: String,
    pub units: String,
    pub sample_rate: f64,
    pub payload: Payload,
    pub stimulus_parameters: ValueMap,
}

impl Document {
    /// Lowers the document into its top-level interchange variables.
    pub fn to_value(&self) -> ValueMap {
        let mut root = ValueMap::new();
        root.insert(
            "format_version".to_string(),
            Value::from(self.format_version.as_str()),
        );
        root.insert("metadata".to_string(), self.metadata.to_value());
        root.insert(
            "experiments".to_string(),
            Value::List(self.experiments.iter().map(Experiment::to_value).collect()),
        );
        root
    }

    pub fn cell_count(&self) -> usize {
        self.experiments.iter().map(|exp| exp.cells.len()).sum()
    }

    pub fn epoch_count(&self) -> usize {
        self.epochs().count()
    }

    /// All epochs in document order.
    pub fn epochs(&self) -> impl Iterator<Item = &Epoch> {
        self.experiments
            .iter()
            .flat_map(|exp| exp.cells.iter())
            .flat_map(|cell| cell.epoch_groups.iter())
            .flat_map(|group| group.epoch_blocks.iter())
            .flat_map(|block| block.epochs.iter())
    }
}

impl ExportMetadata {
    pub fn to_value(&self) -> Value {
        let mut fields = vec![
            ("created_date", Value::from(self.created_date.as_str())),
            ("data_source", Value::from(self.data_source.as_str())),
            ("export_user", Value::from(self.export_user.as_str())),
        ];
        if let Some(notes) = &self.notes {
            fields.push(("notes", Value::from(notes.as_str())));
        }
        record(fields)
    }
}

impl Tag {
    pub fn to_value(&self) -> Value {
        record(vec![
            ("user", Value::from(self.user.as_str())),
            ("tag", Value::from(self.tag.as_str())),
        ])
    }
}

impl Experiment {
    pub fn to_value(&self) -> Value {
        record(vec![
            ("id", Value::Int(self.id)),
            ("h5_uuid", Value::from(self.h5_uuid.as_str())),
            ("exp_name", Value::from(self.exp_name.as_str())),
            ("label", Value::from(self.label.as_str())),
            ("is_mea", Value::Bool(self.is_mea)),
            ("experimenter", Value::from(self.experimenter.as_str())),
            ("rig", Value::from(self.rig.as_str())),
            ("institution", Value::from(self.institution.as_str())),
            ("lab", Value::from(self.lab.as_str())),
            ("start_time", Value::from(self.start_time.as_str())),
            ("h5_file", Value::from(self.h5_file.as_str())),
            ("tags", tags_value(&self.tags)),
            (
                "cells",
                Value::List(self.cells.iter().map(Cell::to_value).collect()),
            ),
        ])
    }
}

impl Cell {
    pub fn to_value(&self) -> Value {
        record(vec![
            ("id", Value::Int(self.id)),
            ("h5_uuid", Value::from(self.h5_uuid.as_str())),
            ("label", Value::from(self.label.as_str())),
            ("type", Value::from(self.cell_type.as_str())),
            ("properties", Value::Map(self.properties.clone())),
            ("tags", tags_value(&self.tags)),
            (
                "epoch_groups",
                Value::List(self.epoch_groups.iter().map(EpochGroup::to_value).collect()),
            ),
        ])
    }
}

impl EpochGroup {
    pub fn to_value(&self) -> Value {
        record(vec![
            ("id", Value::Int(self.id)),
            ("h5_uuid", Value::from(self.h5_uuid.as_str())),
            ("label", Value::from(self.label.as_str())),
            ("protocol_name", Value::from(self.protocol_name.as_str())),
            ("protocol_id", Value::Int(self.protocol_id)),
            ("start_time", Value::from(self.start_time.as_str())),
            ("end_time", Value::from(self.end_time.as_str())),
            ("tags", tags_value(&self.tags)),
            (
                "epoch_blocks",
                Value::List(self.epoch_blocks.iter().map(EpochBlock::to_value).collect()),
            ),
        ])
    }
}

impl EpochBlock {
    pub fn to_value(&self) -> Value {
        record(vec![
            ("id", Value::Int(self.id)),
            ("h5_uuid", Value::from(self.h5_uuid.as_str())),
            ("label", Value::from(self.label.as_str())),
            ("protocol_name", Value::from(self.protocol_name.as_str())),
            ("protocol_id", Value::Int(self.protocol_id)),
            ("start_time", Value::from(self.start_time.as_str())),
            ("end_time", Value::from(self.end_time.as_str())),
            ("data_dir", Value::from(self.data_dir.as_str())),
            ("parameters", Value::Map(self.parameters.clone())),
            ("tags", tags_value(&self.tags)),
            (
                "epochs",
                Value::List(self.epochs.iter().map(Epoch::to_value).collect()),
            ),
        ])
    }
}

impl Epoch {
    pub fn to_value(&self) -> Value {
        record(vec![
            ("id", Value::Int(self.id)),
            ("h5_uuid", Value::from(self.h5_uuid.as_str())),
            ("label", Value::from(self.label.as_str())),
            ("start_time", Value::from(self.start_time.as_str())),
            ("end_time", Value::from(self.end_time.as_str())),
            ("parameters", Value::Map(self.parameters.clone())),
            ("frame_times_ms", Value::Array(self.frame_times_ms.clone())),
            ("tags", tags_value(&self.tags)),
            (
                "responses",
                Value::List(self.responses.iter().map(Response::to_value).collect()),
            ),
            (
                "stimuli",
                Value::List(self.stimuli.iter().map(Stimulus::to_value).collect()),
            ),
        ])
    }
}

impl Response {
    pub fn to_value(&self) -> Value {
        let mut fields = vec![
            ("id", Value::Int(self.id)),
            ("device_name", Value::from(self.device_name.as_str())),
            ("units", Value::from(self.units.as_str())),
            ("sample_rate", Value::Float(self.sample_rate)),
            (
                "sample_rate_units",
                Value::from(self.sample_rate_units.as_str()),
            ),
        ];
        self.payload.push_fields(&mut fields);
        fields.push(("spike_times", Value::Array(self.spike_times.clone())));
        fields.push(("offset_ms", Value::Float(self.offset_ms)));
        record(fields)
    }
}

impl Stimulus {
    pub fn to_value(&self) -> Value {
        let mut fields = vec![
            ("id", Value::Int(self.id)),
            ("device_name", Value::from(self.device_name.as_str())),
            ("stimulus_id", Value::from(self.stimulus_id.as_str())),
            ("units", Value::from(self.units.as_str())),
            ("sample_rate", Value::Float(self.sample_rate)),
        ];
        self.payload.push_fields(&mut fields);
        fields.push((
            "stimulus_parameters",
            Value::Map(self.stimulus_parameters.clone()),
        ));
        record(fields)
    }
}

fn tags_value(tags: &[Tag]) -> Value {
    Value::List(tags.iter().map(Tag::to_value).collect())
}

fn record(fields: Vec<(&'static str, Value)>) -> Value {
    Value::Map(
        fields
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect(),
    )
}
