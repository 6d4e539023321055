//! Configuration for hybriddb.
//!
//! Tuning defaults are compile-time constants. Runtime configuration is an
//! [`IndexConfig`] deserialized from JSON; every field has a default and keys
//! that are not recognized are ignored.

use crate::ann::Metric;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of bidirectional links per HNSW node.
///
/// Higher values improve recall but increase memory and build time.
/// Typical range: 8–64. Default: 16.
pub const HNSW_DEFAULT_M: usize = 16;

/// Default ef parameter during HNSW index construction.
///
/// Controls the size of the dynamic candidate list during insertion.
pub const HNSW_DEFAULT_EF_CONSTRUCTION: usize = 200;

/// Default ef parameter during HNSW search.
pub const HNSW_DEFAULT_EF_SEARCH: usize = 50;

/// Maximum number of layers in the HNSW graph.
pub const HNSW_DEFAULT_MAX_LAYERS: usize = 16;

/// Default seed for HNSW level assignment.
pub const HNSW_DEFAULT_RANDOM_SEED: u64 = 100;

/// Default number of trees in a static forest index.
pub const FOREST_DEFAULT_TREES: usize = 10;

/// Maximum number of items stored in a forest leaf before it is split.
pub const FOREST_DEFAULT_LEAF_SIZE: usize = 16;

/// Default seed for forest hyperplane selection.
pub const FOREST_DEFAULT_RANDOM_SEED: u64 = 42;

/// Default number of rows returned by a query when neither the query nor the caller sets one.
pub const DEFAULT_SEARCH_LIMIT: usize = 3;

/// Number of SQLite VM instructions between deadline checks.
pub const QUERY_PROGRESS_OPS: i32 = 1_000;

/// File name of the serialized [`IndexConfig`] inside a saved index directory.
pub const CONFIG_FILE: &str = "config.json";

/// File name of the ANN blob inside a saved index directory.
pub const EMBEDDINGS_FILE: &str = "embeddings";

/// File name of the SQLite database inside a saved index directory.
pub const DOCUMENTS_FILE: &str = "documents";

/// ANN backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Incremental graph index with append and tombstoned delete.
    #[default]
    Hnsw,
    /// Static tree forest, rebuilt from scratch on every change.
    Annoy,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Hnsw => f.write_str("hnsw"),
            Backend::Annoy => f.write_str("annoy"),
        }
    }
}

/// Tuning knobs consumed only by the HNSW backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HnswSettings {
    /// Links per node (layer 0 uses twice this).
    pub m: usize,
    /// Candidate list size during construction.
    pub efconstruction: usize,
    /// Candidate list size during search.
    pub efsearch: Option<usize>,
    /// Seed for level assignment.
    pub randomseed: u64,
}

impl Default for HnswSettings {
    fn default() -> Self {
        Self {
            m: HNSW_DEFAULT_M,
            efconstruction: HNSW_DEFAULT_EF_CONSTRUCTION,
            efsearch: None,
            randomseed: HNSW_DEFAULT_RANDOM_SEED,
        }
    }
}

/// Tuning knobs consumed only by the static forest backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForestSettings {
    /// Number of trees built.
    pub ntrees: usize,
    /// Number of candidates inspected per query. Negative means `ntrees * limit`.
    pub searchk: i64,
    /// Seed for hyperplane selection.
    pub randomseed: u64,
}

impl Default for ForestSettings {
    fn default() -> Self {
        Self {
            ntrees: FOREST_DEFAULT_TREES,
            searchk: -1,
            randomseed: FOREST_DEFAULT_RANDOM_SEED,
        }
    }
}

/// Runtime configuration for an index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// ANN backend.
    pub backend: Backend,
    /// Vector width. Set from the data on first `index` when absent.
    pub dimensions: Option<usize>,
    /// Similarity space. Derived by the backend on `index`, never user-chosen.
    pub metric: Option<Metric>,
    pub hnsw: HnswSettings,
    pub annoy: ForestSettings,
    /// Deadline for a single structured query, in milliseconds.
    pub timeout_ms: Option<u64>,
}

impl IndexConfig {
    /// Creates a configuration for the given backend with all defaults.
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            ..Self::default()
        }
    }

    /// Parses a configuration from JSON, ignoring unknown keys.
    pub fn from_json(json: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Query deadline, if configured.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}
