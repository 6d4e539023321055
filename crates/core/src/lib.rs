//! # hybriddb-core
//!
//! Embeddable hybrid retrieval engine: an approximate nearest neighbor index
//! (incremental HNSW graph or static tree forest) paired with a SQLite
//! document store that shares its integer label space. Structured queries
//! can carry similarity clauses whose ranked hits are staged into SQL and
//! merged with filters, grouping and ordering.
//!
//! The crate is fully synchronous and does no internal locking beyond the
//! optional [`embeddings::SharedEmbeddings`] handle.

/// Approximate nearest neighbor indexes: the `Ann` contract, HNSW and forest backends, persistence.
pub mod ann;
/// Global configuration constants and the runtime `IndexConfig`.
pub mod config;
/// SQLite document store, batch/score staging and hybrid query compilation.
pub mod database;
/// Orchestration of one ANN index and one document store.
pub mod embeddings;
/// Error types.
pub mod error;

pub use ann::{Ann, Capabilities, Metric, Neighbor};
pub use config::{Backend, IndexConfig};
pub use database::{Content, Database, Query, Record, Row, SimilarClause};
pub use embeddings::{Embeddings, SharedEmbeddings, Vectors};
pub use error::{Error, Result};
