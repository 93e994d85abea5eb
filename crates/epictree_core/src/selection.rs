//! Per-epoch selection-mask artifact (`.ugm`).
//!
//! # Responsibility
//! - Write the analysis GUI's selection mask: one inclusion flag per epoch,
//!   keyed by the epoch's stable `h5_uuid`.
//! - Import a saved mask back into selected/excluded identifier lists.
//!
//! # Invariants
//! - Flags and identifiers are parallel arrays; import never truncates.
//! - Files without identifiers, or with only empty identifiers, are rejected.
//! - Empty identifiers are skipped on import, never reported as selected.

use crate::mat::{read_mat, write_mat, MatError, WriteOptions};
use crate::model::document::Document;
use crate::model::value::{Value, ValueMap};
use chrono::Local;
use log::{info, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::Path;

/// Current artifact version; the first version carrying identifiers.
pub const SELECTION_MASK_VERSION: &str = "1.1";
/// Name of the single struct variable in the artifact.
pub const SELECTION_MASK_VARIABLE: &str = "ugm";

#[derive(Debug)]
pub enum SelectionMaskError {
    Mat(MatError),
    /// The file is readable but not shaped like a selection mask.
    InvalidStructure(String),
    /// Stable identifiers are missing or all empty; the mask cannot be
    /// mapped back onto epochs.
    MissingReference { version: String, reason: String },
    LengthMismatch { flags: usize, identifiers: usize },
}

impl Display for SelectionMaskError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mat(err) => write!(f, "failed to read selection mask: {err}"),
            Self::InvalidStructure(reason) => write!(f, "invalid selection mask: {reason}"),
            Self::MissingReference { version, reason } => {
                write!(f, "selection mask (version {version}) {reason}")
            }
            Self::LengthMismatch { flags, identifiers } => write!(
                f,
                "selection mask has {flags} flags but {identifiers} epoch identifiers"
            ),
        }
    }
}

impl Error for SelectionMaskError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Mat(err) => Some(err),
            _ => None,
        }
    }
}

impl From<MatError> for SelectionMaskError {
    fn from(value: MatError) -> Self {
        Self::Mat(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionEntry {
    pub h5_uuid: String,
    pub selected: bool,
}

/// Selection mask ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionMask {
    pub created: String,
    pub entries: Vec<SelectionEntry>,
}

impl SelectionMask {
    /// One selected entry per epoch, in document order.
    pub fn from_document(document: &Document) -> Self {
        Self::from_entries(
            document
                .epochs()
                .map(|epoch| SelectionEntry {
                    h5_uuid: epoch.h5_uuid.clone(),
                    selected: true,
                })
                .collect(),
        )
    }

    pub fn from_entries(entries: Vec<SelectionEntry>) -> Self {
        Self {
            created: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            entries,
        }
    }

    /// Sets the flag of every entry with `h5_uuid`; returns how many matched.
    pub fn set_selected(&mut self, h5_uuid: &str, selected: bool) -> usize {
        let mut matched = 0;
        for entry in self.entries.iter_mut().filter(|e| e.h5_uuid == h5_uuid) {
            entry.selected = selected;
            matched += 1;
        }
        matched
    }

    /// Lowers the mask into the artifact's single `ugm` struct variable.
    pub fn to_variables(&self) -> ValueMap {
        let mut ugm = ValueMap::new();
        ugm.insert("version".to_string(), Value::from(SELECTION_MASK_VERSION));
        ugm.insert("created".to_string(), Value::from(self.created.as_str()));
        ugm.insert(
            "epoch_count".to_string(),
            Value::Int(self.entries.len() as i64),
        );
        ugm.insert(
            "selection_mask".to_string(),
            Value::List(
                self.entries
                    .iter()
                    .map(|entry| Value::Bool(entry.selected))
                    .collect(),
            ),
        );
        ugm.insert(
            "epoch_h5_uuids".to_string(),
            Value::List(
                self.entries
                    .iter()
                    .map(|entry| Value::from(entry.h5_uuid.as_str()))
                    .collect(),
            ),
        );

        let mut variables = ValueMap::new();
        variables.insert(SELECTION_MASK_VARIABLE.to_string(), Value::Map(ugm));
        variables
    }

    pub fn write(&self, path: &Path, options: &WriteOptions) -> Result<(), SelectionMaskError> {
        write_mat(path, &self.to_variables(), options)?;
        info!(
            "event=selection_mask_write module=selection status=ok epochs={}",
            self.entries.len()
        );
        Ok(())
    }
}

/// Imported selection state keyed by epoch identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionState {
    pub version: String,
    pub created: String,
    pub epoch_count: i64,
    pub selected_uuids: Vec<String>,
    pub excluded_uuids: Vec<String>,
}

impl SelectionState {
    pub fn selected_count(&self) -> usize {
        self.selected_uuids.len()
    }

    pub fn excluded_count(&self) -> usize {
        self.excluded_uuids.len()
    }
}

/// Reads and validates a selection-mask file.
pub fn read_selection_mask(path: &Path) -> Result<SelectionState, SelectionMaskError> {
    let variables = read_mat(path)?;
    let state = parse_selection_mask(&variables).map_err(|err| {
        warn!(
            "event=selection_mask_read module=selection status=error error={}",
            err
        );
        err
    })?;
    info!(
        "event=selection_mask_read module=selection status=ok selected={} excluded={}",
        state.selected_count(),
        state.excluded_count()
    );
    Ok(state)
}

/// Validates decoded artifact variables.
///
/// # Errors
/// - `InvalidStructure` when `ugm` or its mask field is absent or malformed.
/// - `MissingReference` when identifiers are absent or all empty.
/// - `LengthMismatch` when flags and identifiers differ in length.
pub fn parse_selection_mask(variables: &ValueMap) -> Result<SelectionState, SelectionMaskError> {
    let ugm = variables
        .get(SELECTION_MASK_VARIABLE)
        .and_then(Value::as_map)
        .ok_or_else(|| {
            SelectionMaskError::InvalidStructure("file does not contain a `ugm` struct".to_string())
        })?;

    let version = ugm.get("version").map(Value::to_text).unwrap_or_default();
    let created = ugm.get("created").map(Value::to_text).unwrap_or_default();
    let epoch_count = ugm.get("epoch_count").and_then(Value::as_i64).unwrap_or(0);
    let flags = ugm
        .get("selection_mask")
        .and_then(flags_of)
        .ok_or_else(|| {
            SelectionMaskError::InvalidStructure("`selection_mask` is missing or not logical".to_string())
        })?;

    let Some(raw_uuids) = ugm.get("epoch_h5_uuids") else {
        return Err(SelectionMaskError::MissingReference {
            version,
            reason: "does not contain epoch_h5_uuids; re-save it from a fresh export".to_string(),
        });
    };
    let uuids = identifiers_of(raw_uuids);

    if flags.len() != uuids.len() {
        return Err(SelectionMaskError::LengthMismatch {
            flags: flags.len(),
            identifiers: uuids.len(),
        });
    }
    if uuids.iter().all(String::is_empty) {
        return Err(SelectionMaskError::MissingReference {
            version,
            reason: "has only empty epoch identifiers; it was not saved from an export".to_string(),
        });
    }

    let mut selected_uuids = Vec::new();
    let mut excluded_uuids = Vec::new();
    for (uuid, selected) in uuids.into_iter().zip(flags) {
        if uuid.is_empty() {
            continue;
        }
        if selected {
            selected_uuids.push(uuid);
        } else {
            excluded_uuids.push(uuid);
        }
    }

    Ok(SelectionState {
        version,
        created,
        epoch_count,
        selected_uuids,
        excluded_uuids,
    })
}

fn flags_of(value: &Value) -> Option<Vec<bool>> {
    match value {
        Value::Bool(flag) => Some(vec![*flag]),
        Value::Int(int) => Some(vec![*int != 0]),
        Value::Float(float) => Some(vec![*float != 0.0]),
        Value::Array(samples) => Some(samples.iter().map(|s| *s != 0.0).collect()),
        Value::Bytes(bytes) => Some(bytes.iter().map(|b| *b != 0).collect()),
        Value::List(items) => items.iter().map(Value::as_bool).collect(),
        _ => None,
    }
}

fn identifiers_of(value: &Value) -> Vec<String> {
    match value {
        Value::List(items) => items.iter().map(Value::to_text).collect(),
        Value::Text(text) => vec![text.clone()],
        // Decoded empty cell.
        Value::Array(samples) if samples.is_empty() => Vec::new(),
        other => vec![other.to_text()],
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_selection_mask, SelectionEntry, SelectionMask, SelectionMaskError};
    use crate::model::value::{Value, ValueMap};

    fn entry(uuid: &str, selected: bool) -> SelectionEntry {
        SelectionEntry {
            h5_uuid: uuid.to_string(),
            selected,
        }
    }

    #[test]
    fn in_memory_variables_parse_back() {
        let mut mask = SelectionMask::from_entries(vec![
            entry("u1", true),
            entry("", true),
            entry("u3", true),
        ]);
        assert_eq!(mask.set_selected("u3", false), 1);

        let state = parse_selection_mask(&mask.to_variables()).unwrap();
        assert_eq!(state.version, "1.1");
        assert_eq!(state.epoch_count, 3);
        assert_eq!(state.selected_uuids, vec!["u1".to_string()]);
        assert_eq!(state.excluded_uuids, vec!["u3".to_string()]);
    }

    #[test]
    fn missing_struct_is_invalid() {
        let err = parse_selection_mask(&ValueMap::new()).expect_err("no ugm");
        assert!(matches!(err, SelectionMaskError::InvalidStructure(_)));
    }

    #[test]
    fn missing_identifier_field_is_a_missing_reference() {
        let mut variables = SelectionMask::from_entries(vec![entry("u1", true)]).to_variables();
        if let Some(Value::Map(ugm)) = variables.get_mut("ugm") {
            ugm.remove("epoch_h5_uuids");
        }
        let err = parse_selection_mask(&variables).expect_err("no identifiers");
        assert!(matches!(err, SelectionMaskError::MissingReference { .. }));
    }
}
