//! Export use-case service.
//!
//! # Responsibility
//! - Flatten every raw experiment tree into one canonical document.
//! - Materialize sample references per the caller's mode.
//! - Sanitize the document and hand it to the interchange writer.
//!
//! # Invariants
//! - Each experiment is flattened independently; a failed experiment never
//!   leaves a partial subtree in the document.
//! - A single-experiment run fails when its experiment fails; batch runs
//!   skip failures and record them in the run summary.
//! - Experiment ids are unique across the document.

use crate::mat::{write_mat, MatError, WriteOptions};
use crate::model::document::{Document, ExportMetadata, FORMAT_VERSION};
use crate::model::raw::RawNode;
use crate::transform::cell_types::CellTypeNaming;
use crate::transform::flatten::{
    experiment_display_name, flatten_experiment, FlattenError, FlattenOptions, IdAllocator,
};
use crate::transform::resolve::{
    Materialization, ReadWarning, ReferenceResolver, ResolveError, SampleReader,
};
use crate::transform::sanitize::{sanitize_map, NullPolicy};
use chrono::Local;
use log::{error, info, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::time::Instant;

const EXPORT_FILE_PREFIX: &str = "epictree_export";

/// Caller-facing knobs for one export run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportOptions {
    /// Provenance written to `metadata.data_source`.
    pub data_source: String,
    pub notes: Option<String>,
    pub materialization: Materialization,
    pub compress: bool,
    pub cell_type_naming: CellTypeNaming,
    /// Recording file used for lazy references instead of each experiment's
    /// own data file.
    pub source_file: Option<String>,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            data_source: "DataJoint + H5 files".to_string(),
            notes: None,
            materialization: Materialization::Lazy,
            compress: true,
            cell_type_naming: CellTypeNaming::default(),
            source_file: None,
        }
    }
}

/// Service error for export use-cases.
#[derive(Debug)]
pub enum ExportError {
    /// The only experiment of a single-experiment run was rejected.
    Flatten(FlattenError),
    /// No experiment survived flattening.
    NothingToExport { failures: Vec<ExperimentFailure> },
    Resolve(ResolveError),
    Mat(MatError),
}

impl Display for ExportError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Flatten(err) => write!(f, "{err}"),
            Self::NothingToExport { failures } if failures.is_empty() => {
                write!(f, "no experiments to export")
            }
            Self::NothingToExport { failures } => {
                write!(f, "all {} experiments failed to export", failures.len())
            }
            Self::Resolve(err) => write!(f, "{err}"),
            Self::Mat(err) => write!(f, "failed to write export: {err}"),
        }
    }
}

impl Error for ExportError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Flatten(err) => Some(err),
            Self::Resolve(err) => Some(err),
            Self::Mat(err) => Some(err),
            Self::NothingToExport { .. } => None,
        }
    }
}

impl From<ResolveError> for ExportError {
    fn from(value: ResolveError) -> Self {
        Self::Resolve(value)
    }
}

impl From<MatError> for ExportError {
    fn from(value: MatError) -> Self {
        Self::Mat(value)
    }
}

/// One experiment omitted from a batch run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentFailure {
    pub experiment: String,
    pub reason: String,
}

/// Outcome of one export run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    /// Display names of exported experiments, in document order.
    pub exported: Vec<String>,
    pub failures: Vec<ExperimentFailure>,
    pub experiment_count: usize,
    pub cell_count: usize,
    pub epoch_count: usize,
    pub warnings: Vec<ReadWarning>,
    /// Written file; `None` until the document is persisted.
    pub output: Option<PathBuf>,
}

impl RunSummary {
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Builds and writes canonical export documents.
pub struct ExportService<'r> {
    options: ExportOptions,
    reader: Option<&'r dyn SampleReader>,
}

impl<'r> ExportService<'r> {
    pub fn new(options: ExportOptions) -> Self {
        Self {
            options,
            reader: None,
        }
    }

    /// Sample reader used by eager materialization.
    pub fn with_reader(mut self, reader: &'r dyn SampleReader) -> Self {
        self.reader = Some(reader);
        self
    }

    pub fn options(&self) -> &ExportOptions {
        &self.options
    }

    /// Flattens `roots` into one document and resolves sample references.
    ///
    /// # Errors
    /// - `Flatten` when the only experiment of a single-experiment run fails.
    /// - `NothingToExport` when no experiment survives.
    /// - `Resolve` when eager mode lacks a reader or a worker pool.
    pub fn build_document(
        &self,
        roots: &[RawNode],
        user: &str,
    ) -> Result<(Document, RunSummary), ExportError> {
        let started_at = Instant::now();
        info!(
            "event=export_start module=service status=ok experiments={} mode={:?}",
            roots.len(),
            self.options.materialization
        );

        let flatten_options = FlattenOptions {
            cell_type_naming: self.options.cell_type_naming,
            source_file: self.options.source_file.clone(),
        };
        let mut summary = RunSummary::default();
        let mut experiment_ids = IdAllocator::default();
        let mut experiments = Vec::new();

        for root in roots {
            match flatten_experiment(root, &flatten_options) {
                Ok(mut experiment) => {
                    experiment.id = experiment_ids.claim(experiment.id, "experiment");
                    summary.exported.push(experiment_display_name(
                        &experiment.exp_name,
                        &experiment.label,
                        experiment.id,
                    ));
                    experiments.push(experiment);
                }
                Err(err) if roots.len() == 1 => {
                    error!(
                        "event=experiment_flatten module=service status=error error={}",
                        err
                    );
                    return Err(ExportError::Flatten(err));
                }
                Err(err) => {
                    error!(
                        "event=experiment_flatten module=service status=skipped error={}",
                        err
                    );
                    summary.failures.push(failure_of(&err));
                }
            }
        }

        if experiments.is_empty() {
            return Err(ExportError::NothingToExport {
                failures: summary.failures,
            });
        }

        let mut document = Document {
            format_version: FORMAT_VERSION.to_string(),
            metadata: ExportMetadata {
                created_date: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
                data_source: self.options.data_source.clone(),
                export_user: user.to_string(),
                notes: self.options.notes.clone(),
            },
            experiments,
        };

        let resolver = ReferenceResolver::new(self.options.materialization, self.reader);
        summary.warnings = resolver.resolve(&mut document)?;
        summary.experiment_count = document.experiments.len();
        summary.cell_count = document.cell_count();
        summary.epoch_count = document.epoch_count();

        info!(
            "event=export_build module=service status={} experiments={} cells={} epochs={} failures={} warnings={} duration_ms={}",
            if summary.is_partial() { "partial" } else { "ok" },
            summary.experiment_count,
            summary.cell_count,
            summary.epoch_count,
            summary.failures.len(),
            summary.warnings.len(),
            started_at.elapsed().as_millis()
        );
        Ok((document, summary))
    }

    /// Builds, sanitizes and writes the document to `dest`.
    pub fn export(
        &self,
        roots: &[RawNode],
        user: &str,
        dest: &Path,
    ) -> Result<RunSummary, ExportError> {
        let (document, summary) = self.build_document(roots, user)?;
        self.write_document(&document, summary, dest)
    }

    /// Sanitizes and writes an already built document.
    ///
    /// A `dest` that is an existing directory receives a generated
    /// `epictree_export_%Y%m%d_%H%M%S.mat` file name.
    pub fn write_document(
        &self,
        document: &Document,
        mut summary: RunSummary,
        dest: &Path,
    ) -> Result<RunSummary, ExportError> {
        let path = output_path(dest);

        let variables = sanitize_map(&document.to_value(), NullPolicy::EmptyText);
        write_mat(
            &path,
            &variables,
            &WriteOptions {
                compress: self.options.compress,
            },
        )
        .map_err(|err| {
            error!(
                "event=export_write module=service status=error path={} error={}",
                path.display(),
                err
            );
            err
        })?;

        for warning in &summary.warnings {
            warn!(
                "event=export_write module=service status=degraded warning={}",
                warning
            );
        }
        info!(
            "event=export_write module=service status=ok path={}",
            path.display()
        );
        summary.output = Some(path);
        Ok(summary)
    }
}

/// Resolves the output file for `dest`.
pub fn output_path(dest: &Path) -> PathBuf {
    if dest.is_dir() {
        dest.join(format!(
            "{EXPORT_FILE_PREFIX}_{}.mat",
            Local::now().format("%Y%m%d_%H%M%S")
        ))
    } else {
        dest.to_path_buf()
    }
}

fn failure_of(err: &FlattenError) -> ExperimentFailure {
    let FlattenError::UnsupportedSource { experiment, .. } = err;
    ExperimentFailure {
        experiment: experiment.clone(),
        reason: err.to_string(),
    }
}
