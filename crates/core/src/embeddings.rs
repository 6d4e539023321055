//! Hybrid index orchestration.
//!
//! [`Embeddings`] owns one ANN index and one [`Database`] and keeps their
//! label spaces aligned: the section with id `n` is always the vector with
//! label `n`. Similarity clauses of a [`Query`] are answered by the index and
//! staged into the database, which then runs the structured part.

use crate::ann::{self, Ann, Neighbor};
use crate::config::{self, IndexConfig};
use crate::database::{Database, Query, Record, Row};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

/// Embedding model collaborator. Turns rows into fixed-width vectors.
pub trait Vectors {
    /// Vector for a single row.
    fn transform(&self, row: &Row) -> Result<Vec<f32>>;

    /// Vectors for a batch of rows, in input order.
    /// Returns `(ids, dimensions, vectors)`.
    fn index(&self, rows: &[Row]) -> Result<(Vec<String>, usize, Vec<Vec<f32>>)>;
}

/// An ANN index and document store sharing one label space.
pub struct Embeddings {
    ann: Box<dyn Ann>,
    database: Database,
}

impl std::fmt::Debug for Embeddings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Embeddings")
            .field("backend", &self.ann.backend())
            .field("count", &self.ann.count())
            .field("database", &self.database)
            .finish()
    }
}

impl Embeddings {
    /// Creates an empty index for `config`.
    pub fn new(config: IndexConfig) -> Result<Self> {
        let mut database = Database::new()?;
        database.set_timeout(config.timeout());
        Ok(Self {
            ann: ann::create(config),
            database,
        })
    }

    /// Current configuration, including derived dimensions and metric.
    pub fn config(&self) -> &IndexConfig {
        self.ann.config()
    }

    pub fn ann(&self) -> &dyn Ann {
        self.ann.as_ref()
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    /// Rebuilds the index and store from `rows`.
    pub fn index(&mut self, rows: &[Row], vectors: &dyn Vectors) -> Result<()> {
        let embeddings = self.vectors(rows, vectors)?;

        let mut ann = ann::create(self.ann.config().clone());
        ann.index(&embeddings)?;

        let mut database = Database::new()?;
        database.set_timeout(ann.config().timeout());
        database.insert(rows, 0)?;

        tracing::info!(
            "Indexed {} rows into {} sections ({} backend)",
            rows.len(),
            ann.count(),
            ann.backend()
        );
        self.ann = ann;
        self.database = database;
        Ok(())
    }

    /// Replaces rows with matching uids and appends the rest.
    ///
    /// Requires a backend that supports append once the index holds vectors.
    /// While it holds none, the index is built from `rows` and documents
    /// already in the store are kept.
    pub fn upsert(&mut self, rows: &[Row], vectors: &dyn Vectors) -> Result<()> {
        let offset = self.ann.offset();
        if offset > 0 && !self.ann.capabilities().append {
            return Err(Error::unsupported("append", self.ann.backend()));
        }

        // Compute vectors before touching either store
        let embeddings = self.vectors(rows, vectors)?;
        let uids: Vec<String> = rows.iter().map(|row| row.uid.clone()).collect();

        if offset == 0 {
            let mut ann = ann::create(self.ann.config().clone());
            ann.index(&embeddings)?;
            self.database.delete(&uids)?;
            self.ann = ann;
        } else {
            self.delete(&uids)?;
            self.ann.append(&embeddings)?;
        }
        self.database.insert(rows, i64::from(offset))?;

        tracing::info!(
            "Upserted {} rows at offset {} ({} live sections)",
            rows.len(),
            offset,
            self.ann.count()
        );
        Ok(())
    }

    /// Removes rows by uid. Returns the uids that were present, in section order.
    pub fn delete(&mut self, uids: &[String]) -> Result<Vec<String>> {
        let pairs = self.database.ids(uids)?;
        if pairs.is_empty() {
            return Ok(Vec::new());
        }
        if !self.ann.capabilities().delete {
            return Err(Error::unsupported("delete", self.ann.backend()));
        }

        let labels: Vec<u32> = pairs
            .iter()
            .filter_map(|&(id, _)| u32::try_from(id).ok())
            .collect();
        let removed = self.ann.delete(&labels)?;
        self.database.delete(uids)?;

        let mut seen = HashSet::new();
        let deleted: Vec<String> = pairs
            .into_iter()
            .filter_map(|(_, uid)| seen.insert(uid.clone()).then_some(uid))
            .collect();
        tracing::debug!("Deleted {} uids ({} labels)", deleted.len(), removed);
        Ok(deleted)
    }

    /// Runs a hybrid query.
    ///
    /// Each similarity clause pulls `topn` candidates (default: the effective
    /// limit) from the index. `limit` applies when the query limit is unset
    /// or 0; a zero `limit` falls back to [`config::DEFAULT_SEARCH_LIMIT`].
    pub fn search(&self, query: &Query, limit: usize) -> Result<Vec<Record>> {
        let limit = if limit == 0 {
            config::DEFAULT_SEARCH_LIMIT
        } else {
            limit
        };
        let candidates = query.limit.filter(|&n| n > 0).unwrap_or(limit);

        let mut similarity: Vec<Vec<Neighbor>> = Vec::with_capacity(query.similar.len());
        for clause in &query.similar {
            let topn = clause.topn.unwrap_or(candidates);
            let hits = self
                .ann
                .search(std::slice::from_ref(&clause.vector), topn)?
                .into_iter()
                .next()
                .unwrap_or_default();
            similarity.push(hits);
        }

        self.database.query(query, limit, &similarity)
    }

    /// Nearest uids for a raw vector, best first.
    pub fn similar(&self, vector: &[f32], topn: usize) -> Result<Vec<(String, f32)>> {
        let hits = self
            .ann
            .search(&[vector.to_vec()], topn)?
            .into_iter()
            .next()
            .unwrap_or_default();
        let ids: Vec<i64> = hits.iter().map(|&(id, _)| i64::from(id)).collect();
        let uids: std::collections::HashMap<i64, String> =
            self.database.uids(&ids)?.into_iter().collect();

        Ok(hits
            .into_iter()
            .filter_map(|(id, score)| uids.get(&i64::from(id)).map(|uid| (uid.clone(), score)))
            .collect())
    }

    /// Number of live sections in the index.
    pub fn count(&self) -> usize {
        self.ann.count()
    }

    /// Saves configuration, index and store under `dir`.
    pub fn save(&mut self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let config = serde_json::to_string_pretty(self.ann.config())?;
        std::fs::write(dir.join(config::CONFIG_FILE), config)?;
        self.ann.save(&dir.join(config::EMBEDDINGS_FILE))?;
        self.database.save(&dir.join(config::DOCUMENTS_FILE))?;

        tracing::info!("Saved index to {:?}", dir);
        Ok(())
    }

    /// Loads an index saved with [`Embeddings::save`].
    pub fn load(dir: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(dir.join(config::CONFIG_FILE))?;
        let config = IndexConfig::from_json(&json)?;
        let timeout = config.timeout();

        let ann = ann::load(config, &dir.join(config::EMBEDDINGS_FILE))?;
        let mut database = Database::load(&dir.join(config::DOCUMENTS_FILE))?;
        database.set_timeout(timeout);

        tracing::info!("Loaded index from {:?} ({} sections)", dir, ann.count());
        Ok(Self { ann, database })
    }

    /// Wraps the index in a cloneable, lock-protected handle.
    pub fn into_shared(self) -> SharedEmbeddings {
        SharedEmbeddings {
            inner: Arc::new(Mutex::new(self)),
        }
    }

    /// Vectors for the rows that produce a section, in row order.
    fn vectors(&self, rows: &[Row], vectors: &dyn Vectors) -> Result<Vec<Vec<f32>>> {
        let sections: Vec<Row> = rows
            .iter()
            .filter(|row| row.section_text().is_some())
            .cloned()
            .collect();
        if sections.is_empty() {
            return Ok(Vec::new());
        }

        let (ids, dimensions, embeddings) = vectors.index(&sections)?;
        if embeddings.len() != sections.len() {
            return Err(Error::InvalidInput(format!(
                "expected {} vectors, got {} ({} ids)",
                sections.len(),
                embeddings.len(),
                ids.len()
            )));
        }
        if let Some(expected) = self.ann.config().dimensions {
            if expected != dimensions {
                return Err(Error::DimensionMismatch {
                    expected,
                    found: dimensions,
                });
            }
        }
        Ok(embeddings)
    }
}

/// Thread-safe handle to an [`Embeddings`] instance.
///
/// Every operation holds the lock for its whole duration, so one query
/// evaluation runs at a time. Cloning produces a new handle to the same index.
#[derive(Debug, Clone)]
pub struct SharedEmbeddings {
    inner: Arc<Mutex<Embeddings>>,
}

impl SharedEmbeddings {
    pub fn search(&self, query: &Query, limit: usize) -> Result<Vec<Record>> {
        self.inner.lock().search(query, limit)
    }

    pub fn upsert(&self, rows: &[Row], vectors: &dyn Vectors) -> Result<()> {
        self.inner.lock().upsert(rows, vectors)
    }

    pub fn delete(&self, uids: &[String]) -> Result<Vec<String>> {
        self.inner.lock().delete(uids)
    }

    pub fn count(&self) -> usize {
        self.inner.lock().count()
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        self.inner.lock().save(dir)
    }

    /// Runs `f` with exclusive access to the underlying index.
    pub fn with<T>(&self, f: impl FnOnce(&mut Embeddings) -> T) -> T {
        f(&mut self.inner.lock())
    }
}
