//! Core conversion engine for epictree.
//! Flattens variable-depth recording metadata into the canonical five-level
//! export document and writes it for the analysis GUI.

pub mod db;
pub mod logging;
pub mod mat;
pub mod model;
pub mod selection;
pub mod service;
pub mod source;
pub mod transform;

pub use logging::{default_log_level, init_logging, logging_status, LogTarget};
pub use model::document::{Document, FORMAT_VERSION};
pub use model::raw::{Level, RawNode};
pub use model::value::{Value, ValueMap};
pub use selection::{
    read_selection_mask, SelectionEntry, SelectionMask, SelectionMaskError, SelectionState,
};
pub use service::export_service::{
    ExperimentFailure, ExportError, ExportOptions, ExportService, RunSummary,
};
pub use source::{SourceAdapter, SourceError};
pub use transform::cell_types::CellTypeNaming;
pub use transform::flatten::{flatten_experiment, FlattenError, FlattenOptions};
pub use transform::resolve::{Materialization, ReadWarning, SampleReader};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
