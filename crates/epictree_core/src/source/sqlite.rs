//! Relational query-source adapter.
//!
//! # Responsibility
//! - Read the experiment hierarchy from a migrated SQLite database and emit
//!   one raw tree per experiment.
//! - Attach tag rows to the nodes they annotate.
//!
//! # Invariants
//! - Rows are visited in ascending `id` order at every level.
//! - `animal` and `preparation` rows become `Level::Other` nodes between the
//!   experiment and its cells.
//! - JSON columns are passed through as text; flattening parses them later.

use super::{SourceAdapter, SourceError, SourceResult};
use crate::db::open_db_read_only;
use crate::model::raw::{Level, RawNode};
use crate::model::value::{Value, ValueMap};
use log::{debug, info};
use rusqlite::types::ValueRef;
use rusqlite::{params, params_from_iter, Connection};
use std::io;
use std::path::Path;
use std::time::Instant;

/// Opens an existing store for export without creating or migrating it.
pub fn open_query_store(path: impl AsRef<Path>) -> SourceResult<Connection> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(SourceError::Io {
            path: path.to_path_buf(),
            source: io::Error::new(io::ErrorKind::NotFound, "database file not found"),
        });
    }
    Ok(open_db_read_only(path)?)
}

/// Loads experiment trees from an open connection.
pub struct SqliteQuerySource<'conn> {
    conn: &'conn Connection,
    experiment_ids: Vec<i64>,
}

impl<'conn> SqliteQuerySource<'conn> {
    /// Creates a source over every experiment in the database.
    pub fn new(conn: &'conn Connection) -> Self {
        Self {
            conn,
            experiment_ids: Vec::new(),
        }
    }

    /// Restricts loading to the given experiment ids; empty means all.
    pub fn with_experiment_ids(mut self, experiment_ids: Vec<i64>) -> Self {
        self.experiment_ids = experiment_ids;
        self
    }

    fn experiment_rows(&self) -> SourceResult<Vec<ValueMap>> {
        let mut sql = String::from("SELECT * FROM experiment");
        if !self.experiment_ids.is_empty() {
            let placeholders = vec!["?"; self.experiment_ids.len()].join(", ");
            sql.push_str(&format!(" WHERE id IN ({placeholders})"));
        }
        sql.push_str(" ORDER BY id ASC");

        let mut stmt = self.conn.prepare(&sql)?;
        let columns = column_names(&stmt);
        let mut rows = stmt.query(params_from_iter(self.experiment_ids.iter()))?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(row_to_map(row, &columns)?);
        }
        Ok(records)
    }

    fn children(&self, table: &str, parent_column: &str, parent_id: i64) -> SourceResult<Vec<ValueMap>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT * FROM {table} WHERE {parent_column} = ?1 ORDER BY id ASC"
        ))?;
        let columns = column_names(&stmt);
        let mut rows = stmt.query(params![parent_id])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let mut record = row_to_map(row, &columns)?;
            record.remove(parent_column);
            records.push(record);
        }
        Ok(records)
    }

    fn tagged(&self, mut node: RawNode, table: &str, table_id: i64) -> SourceResult<RawNode> {
        let mut stmt = self.conn.prepare(
            "SELECT user, tag
             FROM tag
             WHERE table_name = ?1 AND table_id = ?2
             ORDER BY id ASC",
        )?;
        let mut rows = stmt.query(params![table, table_id])?;
        while let Some(row) = rows.next()? {
            let user: String = row.get("user")?;
            let tag: String = row.get("tag")?;
            node = node.with_tag(&user, &tag);
        }
        Ok(node)
    }

    fn experiment_node(&self, record: ValueMap) -> SourceResult<RawNode> {
        let experiment_id = row_id(&record);
        let mut node = RawNode::new(Level::Experiment).with_object(record);

        for animal in self.children("animal", "experiment_id", experiment_id)? {
            let animal_id = row_id(&animal);
            let mut animal_node = RawNode::new(Level::parse("animal")).with_object(animal);
            for preparation in self.children("preparation", "animal_id", animal_id)? {
                let preparation_id = row_id(&preparation);
                let mut preparation_node =
                    RawNode::new(Level::parse("preparation")).with_object(preparation);
                for cell in self.children("cell", "preparation_id", preparation_id)? {
                    preparation_node = preparation_node.with_child(self.cell_node(cell)?);
                }
                animal_node = animal_node.with_child(preparation_node);
            }
            node = node.with_child(animal_node);
        }

        self.tagged(node, "experiment", experiment_id)
    }

    fn cell_node(&self, record: ValueMap) -> SourceResult<RawNode> {
        let cell_id = row_id(&record);
        let mut node = RawNode::new(Level::Cell).with_object(record);
        for group in self.children("epoch_group", "cell_id", cell_id)? {
            let group_id = row_id(&group);
            let mut group_node = RawNode::new(Level::EpochGroup).with_object(group);
            for block in self.children("epoch_block", "epoch_group_id", group_id)? {
                group_node = group_node.with_child(self.epoch_block_node(block)?);
            }
            node = node.with_child(self.tagged(group_node, "epoch_group", group_id)?);
        }
        self.tagged(node, "cell", cell_id)
    }

    fn epoch_block_node(&self, record: ValueMap) -> SourceResult<RawNode> {
        let block_id = row_id(&record);
        let mut node = RawNode::new(Level::EpochBlock).with_object(record);
        for epoch in self.children("epoch", "epoch_block_id", block_id)? {
            let epoch_id = row_id(&epoch);
            let mut epoch_node = RawNode::new(Level::Epoch).with_object(epoch);
            for response in self.children("response", "epoch_id", epoch_id)? {
                epoch_node = epoch_node.with_response(response);
            }
            for stimulus in self.children("stimulus", "epoch_id", epoch_id)? {
                epoch_node = epoch_node.with_stimulus(stimulus);
            }
            node = node.with_child(self.tagged(epoch_node, "epoch", epoch_id)?);
        }
        self.tagged(node, "epoch_block", block_id)
    }
}

impl SourceAdapter for SqliteQuerySource<'_> {
    fn describe(&self) -> String {
        "SQLite query".to_string()
    }

    fn load_experiments(&self) -> SourceResult<Vec<RawNode>> {
        let started_at = Instant::now();
        let experiments = self
            .experiment_rows()?
            .into_iter()
            .map(|record| self.experiment_node(record))
            .collect::<SourceResult<Vec<_>>>()?;

        info!(
            "event=source_load module=source status=ok source=sqlite experiments={} duration_ms={}",
            experiments.len(),
            started_at.elapsed().as_millis()
        );
        Ok(experiments)
    }
}

fn column_names(stmt: &rusqlite::Statement<'_>) -> Vec<String> {
    stmt.column_names()
        .into_iter()
        .map(str::to_string)
        .collect()
}

fn row_to_map(row: &rusqlite::Row<'_>, columns: &[String]) -> SourceResult<ValueMap> {
    let mut record = ValueMap::new();
    for (index, column) in columns.iter().enumerate() {
        let value = match row.get_ref(index)? {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(int) => Value::Int(int),
            ValueRef::Real(float) => Value::Float(float),
            ValueRef::Text(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
            ValueRef::Blob(bytes) => Value::Bytes(bytes.to_vec()),
        };
        record.insert(column.clone(), value);
    }
    Ok(record)
}

fn row_id(record: &ValueMap) -> i64 {
    let id = record.get("id").and_then(Value::as_i64).unwrap_or(0);
    if id == 0 {
        debug!("event=source_load module=source status=degraded reason=row_without_id");
    }
    id
}
