//! Sample reference resolution.
//!
//! # Responsibility
//! - Keep response/stimulus sample payloads as references (lazy mode), or
//!   read them through a `SampleReader` on a bounded worker pool (eager mode).
//!
//! # Invariants
//! - A failed read never aborts the run: the payload keeps its reference,
//!   stays unloaded and one `ReadWarning` is recorded.
//! - Warnings are returned in document order, independent of worker count.
//! - Payloads already carrying samples are never re-read.

use crate::model::document::{Document, Payload, SampleData, SampleRef};
use log::{info, warn};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// When sample payloads are read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Materialization {
    /// Emit references only; consumers read on demand.
    #[default]
    Lazy,
    /// Read every payload during export. `workers == 0` uses one worker per
    /// available core.
    Eager { workers: usize },
}

/// Error returned by a sample reader for one payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadError {
    message: String,
}

impl ReadError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Display for ReadError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl Error for ReadError {}

/// Reads the samples a reference points at.
///
/// Implementations must be callable from several workers at once.
pub trait SampleReader: Send + Sync {
    fn read_samples(&self, source: &SampleRef) -> Result<Vec<f64>, ReadError>;
}

/// One payload that could not be materialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadWarning {
    pub file: String,
    pub locator: String,
    pub reason: String,
}

impl Display for ReadWarning {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "could not read `{}` from `{}`: {}",
            self.locator, self.file, self.reason
        )
    }
}

#[derive(Debug)]
pub enum ResolveError {
    /// Eager mode was requested without a reader.
    MissingReader,
    WorkerPool(ThreadPoolBuildError),
}

impl Display for ResolveError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingReader => write!(f, "eager materialization requires a sample reader"),
            Self::WorkerPool(err) => write!(f, "failed to start sample read workers: {err}"),
        }
    }
}

impl Error for ResolveError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::MissingReader => None,
            Self::WorkerPool(err) => Some(err),
        }
    }
}

impl From<ThreadPoolBuildError> for ResolveError {
    fn from(value: ThreadPoolBuildError) -> Self {
        Self::WorkerPool(value)
    }
}

/// Applies a `Materialization` policy to every payload of a document.
pub struct ReferenceResolver<'r> {
    mode: Materialization,
    reader: Option<&'r dyn SampleReader>,
}

impl<'r> ReferenceResolver<'r> {
    pub fn lazy() -> Self {
        Self {
            mode: Materialization::Lazy,
            reader: None,
        }
    }

    pub fn new(mode: Materialization, reader: Option<&'r dyn SampleReader>) -> Self {
        Self { mode, reader }
    }

    pub fn mode(&self) -> Materialization {
        self.mode
    }

    /// Resolves all payloads in place and returns the read warnings.
    ///
    /// # Errors
    /// - `MissingReader` for eager mode without a reader.
    /// - `WorkerPool` when the bounded pool cannot be started.
    pub fn resolve(&self, document: &mut Document) -> Result<Vec<ReadWarning>, ResolveError> {
        let Materialization::Eager { workers } = self.mode else {
            return Ok(Vec::new());
        };
        let reader = self.reader.ok_or(ResolveError::MissingReader)?;

        let mut pending: Vec<&mut Payload> = payloads_mut(document)
            .into_iter()
            .filter(|payload| matches!(payload.data, SampleData::Lazy))
            .collect();
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let pool = build_pool(workers)?;
        info!(
            "event=samples_resolve module=transform status=start payloads={} workers={}",
            pending.len(),
            pool.current_num_threads()
        );

        let warnings: Vec<ReadWarning> = pool.install(|| {
            pending
                .par_iter_mut()
                .filter_map(|payload| materialize(payload, reader))
                .collect()
        });

        info!(
            "event=samples_resolve module=transform status=ok warnings={}",
            warnings.len()
        );
        Ok(warnings)
    }
}

fn build_pool(workers: usize) -> Result<ThreadPool, ThreadPoolBuildError> {
    let mut builder = ThreadPoolBuilder::new().thread_name(|index| format!("epictree-read-{index}"));
    if workers > 0 {
        builder = builder.num_threads(workers);
    }
    builder.build()
}

fn materialize(payload: &mut Payload, reader: &dyn SampleReader) -> Option<ReadWarning> {
    if !payload.source.is_complete() {
        return Some(warning(&payload.source, "incomplete sample reference"));
    }
    match reader.read_samples(&payload.source) {
        Ok(samples) => {
            payload.data = SampleData::Inline(samples);
            None
        }
        Err(err) => Some(warning(&payload.source, &err.to_string())),
    }
}

fn warning(source: &SampleRef, reason: &str) -> ReadWarning {
    warn!(
        "event=sample_read module=transform status=error file={} locator={} reason={}",
        source.file, source.locator, reason
    );
    ReadWarning {
        file: source.file.clone(),
        locator: source.locator.clone(),
        reason: reason.to_string(),
    }
}

/// Mutable references to every response and stimulus payload, in document order.
fn payloads_mut(document: &mut Document) -> Vec<&mut Payload> {
    let mut payloads = Vec::new();
    for experiment in &mut document.experiments {
        for cell in &mut experiment.cells {
            for group in &mut cell.epoch_groups {
                for block in &mut group.epoch_blocks {
                    for epoch in &mut block.epochs {
                        payloads.extend(epoch.responses.iter_mut().map(|r| &mut r.payload));
                        payloads.extend(epoch.stimuli.iter_mut().map(|s| &mut s.payload));
                    }
                }
            }
        }
    }
    payloads
}

/// Sample reader over samples held in memory, keyed by file then locator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemorySampleReader {
    files: BTreeMap<String, BTreeMap<String, Vec<f64>>>,
}

impl MemorySampleReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, file: &str, locator: &str, samples: Vec<f64>) {
        self.files
            .entry(file.to_string())
            .or_default()
            .insert(locator.to_string(), samples);
    }

    /// Loads `{"<file>": {"<locator>": [samples...]}}`.
    pub fn from_json_str(text: &str) -> Result<Self, serde_json::Error> {
        let files = serde_json::from_str(text)?;
        Ok(Self { files })
    }
}

impl SampleReader for MemorySampleReader {
    fn read_samples(&self, source: &SampleRef) -> Result<Vec<f64>, ReadError> {
        let file = self
            .files
            .get(&source.file)
            .ok_or_else(|| ReadError::new(format!("unknown file `{}`", source.file)))?;
        file.get(&source.locator)
            .cloned()
            .ok_or_else(|| ReadError::new(format!("no dataset at `{}`", source.locator)))
    }
}
