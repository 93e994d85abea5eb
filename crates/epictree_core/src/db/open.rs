//! Connection bootstrap for the relational metadata store.
//!
//! `open_db` and `open_db_in_memory` build or upgrade a store to the latest
//! schema and are what fixtures and loaders use. Export runs go through
//! `open_db_read_only`, which never creates, migrates or writes the file.

use super::migrations::{apply_migrations, ensure_latest};
use super::{DbError, DbResult};
use log::{error, info};
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
enum OpenMode {
    File,
    Memory,
    ReadOnly,
}

impl OpenMode {
    fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Memory => "memory",
            Self::ReadOnly => "read_only",
        }
    }
}

/// Opens (creating if needed) a store file and migrates it to the latest
/// schema.
pub fn open_db(path: impl AsRef<Path>) -> DbResult<Connection> {
    open_logged(OpenMode::File, || Connection::open(path.as_ref()))
}

/// Opens a migrated in-memory store.
pub fn open_db_in_memory() -> DbResult<Connection> {
    open_logged(OpenMode::Memory, Connection::open_in_memory)
}

/// Opens an existing store without write access.
///
/// Fails when the file cannot be opened or its schema version differs from
/// [`latest_version`](super::migrations::latest_version); the store is left
/// untouched either way.
pub fn open_db_read_only(path: impl AsRef<Path>) -> DbResult<Connection> {
    open_logged(OpenMode::ReadOnly, || {
        Connection::open_with_flags(path.as_ref(), OpenFlags::SQLITE_OPEN_READ_ONLY)
    })
}

fn open_logged(
    mode: OpenMode,
    open: impl FnOnce() -> rusqlite::Result<Connection>,
) -> DbResult<Connection> {
    let started_at = Instant::now();
    info!(
        "event=db_open module=db status=start mode={}",
        mode.as_str()
    );

    let result = open()
        .map_err(DbError::from)
        .and_then(|mut conn| prepare(&mut conn, mode).map(|()| conn));

    match &result {
        Ok(_) => info!(
            "event=db_open module=db status=ok mode={} duration_ms={}",
            mode.as_str(),
            started_at.elapsed().as_millis()
        ),
        Err(err) => error!(
            "event=db_open module=db status=error mode={} duration_ms={} error={}",
            mode.as_str(),
            started_at.elapsed().as_millis(),
            err
        ),
    }
    result
}

fn prepare(conn: &mut Connection, mode: OpenMode) -> DbResult<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.busy_timeout(Duration::from_secs(5))?;
    match mode {
        OpenMode::File | OpenMode::Memory => apply_migrations(conn),
        OpenMode::ReadOnly => ensure_latest(conn),
    }
}
