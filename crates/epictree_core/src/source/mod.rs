//! Source adapters producing raw node trees.
//!
//! # Responsibility
//! - Hide where experiment metadata comes from (JSON dump, relational store,
//!   recording file) behind one ingestion trait.
//! - Emit one `RawNode` per experiment, children in source order.
//!
//! # Invariants
//! - Adapters never flatten, sanitize or read sample payloads.
//! - Levels that the canonical document does not keep are emitted as
//!   `Level::Other` nodes, not dropped.

use crate::db::DbError;
use crate::model::raw::RawNode;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;

pub mod json;
pub mod recording;
pub mod sqlite;

pub use json::JsonDumpSource;
pub use recording::{MemoryGroup, RecordingFileSource, RecordingGroup, RecordingSampleReader};
pub use sqlite::{open_query_store, SqliteQuerySource};

pub type SourceResult<T> = Result<T, SourceError>;

#[derive(Debug)]
pub enum SourceError {
    Io { path: PathBuf, source: std::io::Error },
    Json(serde_json::Error),
    Db(DbError),
    /// Input parsed but is not shaped like a source tree.
    InvalidData(String),
}

impl Display for SourceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "failed to read {}: {source}", path.display()),
            Self::Json(err) => write!(f, "invalid JSON source: {err}"),
            Self::Db(err) => write!(f, "{err}"),
            Self::InvalidData(message) => write!(f, "invalid source data: {message}"),
        }
    }
}

impl Error for SourceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Json(err) => Some(err),
            Self::Db(err) => Some(err),
            Self::InvalidData(_) => None,
        }
    }
}

impl From<serde_json::Error> for SourceError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

impl From<DbError> for SourceError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for SourceError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Ingestion interface shared by every source shape.
pub trait SourceAdapter {
    /// Short provenance label written to `metadata.data_source`.
    fn describe(&self) -> String;

    /// Loads all experiment trees, in source order.
    fn load_experiments(&self) -> SourceResult<Vec<RawNode>>;
}
