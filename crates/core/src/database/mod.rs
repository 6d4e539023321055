//! Relational document store and hybrid query engine.
//!
//! Two permanent tables share the ANN label space:
//! - `documents(uid, data, tags, entry)`: structured inputs, stored verbatim;
//! - `sections(id, uid, text, tags, entry)`: one row per indexed text, `id`
//!   being the ANN label.
//!
//! Similarity results reach SQL through the `batch` and `scores` temp tables
//! (see [`staging`]). A connection runs one query evaluation at a time.

/// Column resolution and fragment translation.
pub mod expression;
/// Hybrid query description and SQL assembly.
pub mod query;
/// Input row types.
pub mod row;
/// Batch and score staging tables.
pub mod staging;

pub use query::{Query, SimilarClause};
pub use row::{Content, Row};

use crate::ann::Neighbor;
use crate::error::{Error, Result};
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, DatabaseName, ErrorCode, OpenFlags};
use serde_json::{Map, Number, Value};
use staging::{Keys, ScoreAccumulator};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// A result row keyed by output column name.
pub type Record = Map<String, Value>;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS documents (
    uid TEXT PRIMARY KEY,
    data JSON,
    tags TEXT,
    entry DATETIME
);
CREATE TABLE IF NOT EXISTS sections (
    id INTEGER PRIMARY KEY,
    uid TEXT,
    text TEXT,
    tags TEXT,
    entry DATETIME
);
CREATE INDEX IF NOT EXISTS section_uid ON sections(uid);
";

/// SQLite-backed document store.
pub struct Database {
    conn: Connection,
    path: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Database {
    /// Creates an empty in-memory store.
    pub fn new() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn,
            path: None,
            timeout: None,
        })
    }

    /// Opens an existing store file. Fails if `path` does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch(SCHEMA)?;
        tracing::info!("Loaded document store {:?}", path);
        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
            timeout: None,
        })
    }

    /// Sets the deadline applied to each structured query.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// File currently backing the connection, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Inserts rows, assigning section ids from `start`.
    ///
    /// Rows without text produce no section and consume no id. Returns the
    /// next unused id.
    pub fn insert(&mut self, rows: &[Row], start: i64) -> Result<i64> {
        let entry = chrono::Utc::now().to_rfc3339();
        let tx = self.conn.transaction()?;
        let mut next = start;
        {
            let mut documents = tx.prepare_cached(
                "INSERT OR REPLACE INTO documents (uid, data, tags, entry) VALUES (?1, ?2, ?3, ?4)",
            )?;
            let mut sections = tx.prepare_cached(
                "INSERT INTO sections (id, uid, text, tags, entry) VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;

            for row in rows {
                if let Some(data) = row.data() {
                    documents.execute(params![row.uid, data, row.tags, entry])?;
                }
                if let Some(text) = row.section_text() {
                    sections.execute(params![next, row.uid, text, row.tags, entry])?;
                    next += 1;
                }
            }
        }
        tx.commit()?;

        tracing::debug!(
            "Inserted {} rows as sections {}..{}",
            rows.len(),
            start,
            next
        );
        Ok(next)
    }

    /// Deletes documents and sections by uid. Absent uids are ignored.
    /// Returns the number of sections removed.
    pub fn delete(&mut self, uids: &[String]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        staging::batch(&tx, Keys::Uids(uids), 0)?;
        tx.execute(
            "DELETE FROM documents WHERE uid IN (SELECT uid FROM batch WHERE batch = 0)",
            [],
        )?;
        let removed = tx.execute(
            "DELETE FROM sections WHERE uid IN (SELECT uid FROM batch WHERE batch = 0)",
            [],
        )?;
        tx.commit()?;

        tracing::debug!("Deleted {} sections for {} uids", removed, uids.len());
        Ok(removed)
    }

    /// Section `(id, uid)` pairs for the given uids, in id order.
    pub fn ids(&self, uids: &[String]) -> Result<Vec<(i64, String)>> {
        staging::batch(&self.conn, Keys::Uids(uids), 0)?;
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, uid FROM sections \
             WHERE uid IN (SELECT uid FROM batch WHERE batch = 0) ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Uids for the given section ids. Unknown ids are skipped.
    pub fn uids(&self, ids: &[i64]) -> Result<Vec<(i64, String)>> {
        staging::batch(&self.conn, Keys::Ids(ids), 0)?;
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, uid FROM sections \
             WHERE id IN (SELECT id FROM batch WHERE batch = 0) ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Number of sections.
    pub fn count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT count(*) FROM sections", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Runs a hybrid query.
    ///
    /// `similarity` holds the ranked hits of each similarity clause, in clause
    /// order. Hits are staged as batches `0..n` and their scores are averaged
    /// per id. `limit` applies when the query has no limit of its own.
    pub fn query(
        &self,
        query: &Query,
        limit: usize,
        similarity: &[Vec<Neighbor>],
    ) -> Result<Vec<Record>> {
        if similarity.is_empty() {
            staging::clear_scores(&self.conn)?;
        } else {
            let mut accumulator = ScoreAccumulator::new();
            for (index, hits) in similarity.iter().enumerate() {
                let ids: Vec<i64> = hits.iter().map(|&(id, _)| i64::from(id)).collect();
                staging::batch(&self.conn, Keys::Ids(&ids), index)?;
                accumulator.extend(hits);
            }
            staging::scores(&self.conn, &accumulator)?;
        }

        let sql = query::compile(query, similarity.len(), limit)?;
        self.execute(&sql)
    }

    fn execute(&self, sql: &str) -> Result<Vec<Record>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .map_err(|e| self.query_error(sql, e))?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

        if let Some(timeout) = self.timeout {
            let deadline = Instant::now() + timeout;
            self.conn.progress_handler(
                crate::config::QUERY_PROGRESS_OPS,
                Some(move || Instant::now() >= deadline),
            );
        }

        let result = Self::collect(&mut stmt, &columns).map_err(|e| self.query_error(sql, e));
        tracing::debug!("Query returned {} rows", result.as_ref().map_or(0, Vec::len));

        if self.timeout.is_some() {
            self.conn.progress_handler(0, None::<fn() -> bool>);
        }
        result
    }

    fn collect(
        stmt: &mut rusqlite::Statement<'_>,
        columns: &[String],
    ) -> rusqlite::Result<Vec<Record>> {
        let mut rows = stmt.query([])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let mut record = Record::new();
            for (i, name) in columns.iter().enumerate() {
                // First occurrence of a duplicated column name wins
                if record.contains_key(name) {
                    continue;
                }
                record.insert(name.clone(), to_json(row.get_ref(i)?));
            }
            records.push(record);
        }
        Ok(records)
    }

    fn query_error(&self, sql: &str, err: rusqlite::Error) -> Error {
        match (&err, self.timeout) {
            (rusqlite::Error::SqliteFailure(e, _), Some(timeout))
                if e.code == ErrorCode::OperationInterrupted =>
            {
                tracing::warn!("Query interrupted after {:?}", timeout);
                Error::Timeout(timeout)
            }
            _ => Error::QuerySyntax {
                statement: sql.to_string(),
                message: err.to_string(),
            },
        }
    }

    /// Writes the store to `path` and moves the connection onto it.
    ///
    /// The current state is backed up to a temporary file that then replaces
    /// `path`. Saving to the file already backing the connection only commits.
    pub fn save(&mut self, path: &Path) -> Result<()> {
        if self.path.as_deref() == Some(path) {
            if !self.conn.is_autocommit() {
                self.conn.execute_batch("COMMIT")?;
            }
            return Ok(());
        }

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        if tmp.exists() {
            std::fs::remove_file(&tmp)?;
        }

        self.conn.backup(DatabaseName::Main, &tmp, None)?;
        std::fs::rename(&tmp, path)?;

        self.conn = Connection::open(path)?;
        self.path = Some(path.to_path_buf());
        tracing::info!("Saved document store to {:?}", path);
        Ok(())
    }
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Value::String(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}
