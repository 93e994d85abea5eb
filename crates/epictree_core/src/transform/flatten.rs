//! Raw source tree → canonical document flattening.
//!
//! # Responsibility
//! - Walk one experiment's raw tree top-down and emit the fixed five-level
//!   document subtree.
//! - Merge metadata of interposed non-canonical levels into the nearest
//!   retained node instead of emitting them.
//! - Flatten block and epoch parameter blobs; epoch keys override block keys.
//!
//! # Invariants
//! - MEA experiments are rejected before any child is visited.
//! - Any number of interposed levels is supported; the deepest value wins.
//! - Child order is preserved at every level.
//! - Sibling ids are unique; non-positive or repeated ids are reassigned.

use crate::model::document::{
    Cell, Epoch, EpochBlock, EpochGroup, Experiment, Payload, Response, SampleData, SampleRef,
    Stimulus,
};
use crate::model::raw::{Level, RawNode};
use crate::model::value::{Value, ValueMap};
use crate::transform::cell_types::CellTypeNaming;
use crate::transform::extract::{
    elided_schema, extract_fields, extract_tags, CELL_FIELDS, EPOCH_BLOCK_FIELDS, EPOCH_FIELDS,
    EPOCH_GROUP_FIELDS, EXPERIMENT_FIELDS, IDENTITY_KEYS, RESPONSE_FIELDS, STIMULUS_FIELDS,
};
use crate::transform::params::{flatten_params, overlay};
use log::{debug, info, warn};
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Options that shape the emitted document without changing its schema.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlattenOptions {
    pub cell_type_naming: CellTypeNaming,
    /// Recording file used for lazy references instead of the experiment's
    /// own `data_file`.
    pub source_file: Option<String>,
}

/// Why an experiment cannot be converted by this pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnsupportedReason {
    /// Multi-electrode-array recordings need a different pipeline.
    MultiElectrodeArray,
    /// The root node is not an experiment.
    NotAnExperiment(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlattenError {
    UnsupportedSource {
        experiment: String,
        reason: UnsupportedReason,
    },
}

impl Display for FlattenError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedSource {
                experiment,
                reason: UnsupportedReason::MultiElectrodeArray,
            } => write!(
                f,
                "experiment `{experiment}` is a multi-electrode-array recording; only single-cell patch data is supported"
            ),
            Self::UnsupportedSource {
                experiment,
                reason: UnsupportedReason::NotAnExperiment(level),
            } => write!(
                f,
                "source root `{experiment}` has level `{level}`, expected `experiment`"
            ),
        }
    }
}

impl Error for FlattenError {}

/// Flattens one experiment subtree.
///
/// # Errors
/// - `UnsupportedSource` when the root is not an experiment or is flagged
///   `is_mea`, regardless of any other field.
pub fn flatten_experiment(
    node: &RawNode,
    options: &FlattenOptions,
) -> Result<Experiment, FlattenError> {
    let fields = extract_fields(&node.object, EXPERIMENT_FIELDS);
    let display_name = experiment_display_name(&fields.text("exp_name"), &fields.text("label"), fields.int("id"));

    if node.level != Level::Experiment {
        return Err(FlattenError::UnsupportedSource {
            experiment: display_name,
            reason: UnsupportedReason::NotAnExperiment(node.level.as_str().to_string()),
        });
    }
    if fields.flag("is_mea") {
        return Err(FlattenError::UnsupportedSource {
            experiment: display_name,
            reason: UnsupportedReason::MultiElectrodeArray,
        });
    }

    let h5_file = options
        .source_file
        .clone()
        .unwrap_or_else(|| fields.text("data_file"));

    let mut ids = IdAllocator::default();
    let cells: Vec<Cell> = locate(&node.children, &Level::Cell, &ValueMap::new())
        .into_iter()
        .map(|located| build_cell(located, &mut ids, options, &h5_file))
        .collect();

    info!(
        "event=experiment_flatten module=transform status=ok experiment={} cells={}",
        display_name,
        cells.len()
    );

    Ok(Experiment {
        id: fields.int("id"),
        h5_uuid: fields.text("h5_uuid"),
        exp_name: fields.text("exp_name"),
        label: fields.text("label"),
        is_mea: false,
        experimenter: fields.text("experimenter"),
        rig: fields.text("rig"),
        institution: fields.text("institution"),
        lab: fields.text("lab"),
        start_time: fields.text("start_time"),
        h5_file,
        tags: extract_tags(&node.tags),
        cells,
    })
}

/// Name used for an experiment in logs and run summaries.
pub fn experiment_display_name(exp_name: &str, label: &str, id: i64) -> String {
    if !exp_name.is_empty() {
        exp_name.to_string()
    } else if !label.is_empty() {
        label.to_string()
    } else {
        format!("experiment#{id}")
    }
}

/// A retained node plus the metadata merged from the levels above it.
struct Located<'a> {
    node: &'a RawNode,
    elided: ValueMap,
}

/// Finds the next `target`-level nodes below `children`, descending through
/// non-canonical levels and accumulating their metadata.
fn locate<'a>(children: &'a [RawNode], target: &Level, inherited: &ValueMap) -> Vec<Located<'a>> {
    let mut found = Vec::new();
    locate_into(children, target, inherited, &mut found);
    found
}

fn locate_into<'a>(
    children: &'a [RawNode],
    target: &Level,
    inherited: &ValueMap,
    found: &mut Vec<Located<'a>>,
) {
    for child in children {
        if child.level == *target {
            found.push(Located {
                node: child,
                elided: inherited.clone(),
            });
            continue;
        }

        match &child.level {
            Level::Other(name) => {
                let merged = merge_elided(inherited, name, child);
                locate_into(&child.children, target, &merged, found);
            }
            other => {
                warn!(
                    "event=tree_descend module=transform status=skipped expected={} found={}",
                    target.as_str(),
                    other.as_str()
                );
            }
        }
    }
}

/// Merges one elided node into `inherited`; the elided node is deeper and wins.
fn merge_elided(inherited: &ValueMap, level_name: &str, node: &RawNode) -> ValueMap {
    let mut merged = inherited.clone();
    match elided_schema(level_name) {
        Some(schema) => {
            for spec in schema {
                let raw = node.object.get(spec.name).filter(|value| !value.is_missing());
                let value = spec.extract(raw);
                if raw.is_some() {
                    merged.insert(spec.name.to_string(), value);
                } else {
                    merged.entry(spec.name.to_string()).or_insert(value);
                }
            }
        }
        None => {
            let payload: ValueMap = node
                .object
                .iter()
                .filter(|(key, _)| !IDENTITY_KEYS.contains(&key.as_str()))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            merged.extend(flatten_params(&Value::Map(payload)));
        }
    }
    merged
}

fn build_cell(
    located: Located<'_>,
    ids: &mut IdAllocator,
    options: &FlattenOptions,
    h5_file: &str,
) -> Cell {
    let node = located.node;
    let fields = extract_fields(&node.object, CELL_FIELDS);
    let own_properties = node
        .field("properties")
        .map(flatten_params)
        .unwrap_or_default();

    let mut group_ids = IdAllocator::default();
    let epoch_groups = locate(&node.children, &Level::EpochGroup, &ValueMap::new())
        .into_iter()
        .map(|group| build_epoch_group(group, &mut group_ids, h5_file))
        .collect();

    Cell {
        id: ids.claim(fields.int("id"), "cell"),
        h5_uuid: fields.text("h5_uuid"),
        label: fields.text("label"),
        cell_type: options.cell_type_naming.apply(&fields.text("type")),
        properties: overlay(&located.elided, &own_properties),
        tags: extract_tags(&node.tags),
        epoch_groups,
    }
}

fn build_epoch_group(located: Located<'_>, ids: &mut IdAllocator, h5_file: &str) -> EpochGroup {
    let node = located.node;
    let fields = extract_fields(&node.object, EPOCH_GROUP_FIELDS);
    if !located.elided.is_empty() {
        debug!(
            "event=tree_descend module=transform status=dropped level=epoch_group keys={}",
            located.elided.len()
        );
    }

    let mut block_ids = IdAllocator::default();
    let epoch_blocks = locate(&node.children, &Level::EpochBlock, &ValueMap::new())
        .into_iter()
        .map(|block| build_epoch_block(block, &mut block_ids, h5_file))
        .collect();

    EpochGroup {
        id: ids.claim(fields.int("id"), "epoch_group"),
        h5_uuid: fields.text("h5_uuid"),
        label: fields.text("label"),
        protocol_name: fields.text("protocol_name"),
        protocol_id: fields.int("protocol_id"),
        start_time: fields.text("start_time"),
        end_time: fields.text("end_time"),
        tags: extract_tags(&node.tags),
        epoch_blocks,
    }
}

fn build_epoch_block(located: Located<'_>, ids: &mut IdAllocator, h5_file: &str) -> EpochBlock {
    let node = located.node;
    let fields = extract_fields(&node.object, EPOCH_BLOCK_FIELDS);
    let own_parameters = node
        .field("parameters")
        .map(flatten_params)
        .unwrap_or_default();
    let parameters = overlay(&located.elided, &own_parameters);

    let mut epoch_ids = IdAllocator::default();
    let epochs = locate(&node.children, &Level::Epoch, &ValueMap::new())
        .into_iter()
        .map(|epoch| build_epoch(epoch, &parameters, &mut epoch_ids, h5_file))
        .collect();

    EpochBlock {
        id: ids.claim(fields.int("id"), "epoch_block"),
        h5_uuid: fields.text("h5_uuid"),
        label: fields.text("label"),
        protocol_name: fields.text("protocol_name"),
        protocol_id: fields.int("protocol_id"),
        start_time: fields.text("start_time"),
        end_time: fields.text("end_time"),
        data_dir: fields.text("data_dir"),
        parameters,
        tags: extract_tags(&node.tags),
        epochs,
    }
}

fn build_epoch(
    located: Located<'_>,
    block_parameters: &ValueMap,
    ids: &mut IdAllocator,
    h5_file: &str,
) -> Epoch {
    let node = located.node;
    let fields = extract_fields(&node.object, EPOCH_FIELDS);
    let own_parameters = node
        .field("parameters")
        .map(flatten_params)
        .unwrap_or_default();
    let inherited = overlay(block_parameters, &located.elided);

    let mut response_ids = IdAllocator::default();
    let responses = node
        .responses
        .iter()
        .map(|raw| build_response(raw, &mut response_ids, h5_file))
        .collect();
    let mut stimulus_ids = IdAllocator::default();
    let stimuli = node
        .stimuli
        .iter()
        .map(|raw| build_stimulus(raw, &mut stimulus_ids, h5_file))
        .collect();

    Epoch {
        id: ids.claim(fields.int("id"), "epoch"),
        h5_uuid: fields.text("h5_uuid"),
        label: fields.text("label"),
        start_time: fields.text("start_time"),
        end_time: fields.text("end_time"),
        parameters: overlay(&inherited, &own_parameters),
        frame_times_ms: node
            .field("frame_times_ms")
            .and_then(Value::to_samples)
            .unwrap_or_default(),
        tags: extract_tags(&node.tags),
        responses,
        stimuli,
    }
}

fn build_response(raw: &ValueMap, ids: &mut IdAllocator, h5_file: &str) -> Response {
    let fields = extract_fields(raw, RESPONSE_FIELDS);
    Response {
        id: ids.claim(fields.int("id"), "response"),
        device_name: fields.text("device_name"),
        units: fields.text("units"),
        sample_rate: fields.float("sample_rate"),
        sample_rate_units: fields.text("sample_rate_units"),
        payload: payload_of(raw, fields.text("h5path"), h5_file),
        spike_times: raw
            .get("spike_times")
            .and_then(Value::to_samples)
            .unwrap_or_default(),
        offset_ms: fields.float("offset_ms"),
    }
}

fn build_stimulus(raw: &ValueMap, ids: &mut IdAllocator, h5_file: &str) -> Stimulus {
    let fields = extract_fields(raw, STIMULUS_FIELDS);
    let stimulus_parameters = raw
        .get("stimulus_parameters")
        .filter(|value| !value.is_missing())
        .map(flatten_params)
        .unwrap_or_default();

    Stimulus {
        id: ids.claim(fields.int("id"), "stimulus"),
        device_name: fields.text("device_name"),
        stimulus_id: fields.text("stimulus_id"),
        units: fields.text("units"),
        sample_rate: fields.float("sample_rate"),
        payload: payload_of(raw, fields.text("h5path"), h5_file),
        stimulus_parameters,
    }
}

/// Builds the sample payload; samples already present in the source are kept.
fn payload_of(raw: &ValueMap, locator: String, default_file: &str) -> Payload {
    let file = raw
        .get("h5_file")
        .and_then(Value::as_str)
        .filter(|file| !file.is_empty())
        .unwrap_or(default_file)
        .to_string();
    let source = SampleRef { file, locator };

    match raw.get("data").and_then(Value::to_samples) {
        Some(samples) if !samples.is_empty() => Payload {
            source,
            data: SampleData::Inline(samples),
        },
        _ => Payload::lazy(source),
    }
}

/// Hands out sibling-unique ids in sibling order.
#[derive(Debug, Default)]
pub(crate) struct IdAllocator {
    used: BTreeSet<i64>,
}

impl IdAllocator {
    /// Keeps `candidate` when positive and unused, otherwise returns the next
    /// id above every id handed out so far. Falls back to the smallest unused
    /// positive id once `i64::MAX` is taken.
    pub(crate) fn claim(&mut self, candidate: i64, level: &str) -> i64 {
        if candidate > 0 && self.used.insert(candidate) {
            return candidate;
        }
        let assigned = match self.used.iter().next_back() {
            None => 1,
            Some(max) => max.checked_add(1).unwrap_or_else(|| self.lowest_free()),
        };
        self.used.insert(assigned);
        debug!(
            "event=id_assign module=transform status=reassigned level={} from={} to={}",
            level, candidate, assigned
        );
        assigned
    }

    fn lowest_free(&self) -> i64 {
        let mut next = 1;
        for &id in self.used.range(1..) {
            if id != next {
                break;
            }
            next += 1;
        }
        next
    }
}
