//! Hierarchical Navigable Small World (HNSW) incremental index.
//!
//! Vectors are normalized and compared with inner-product distance
//! (`1 - dot`), which equals cosine distance on unit vectors. Scores are
//! reported as `1 - distance`. Deletes are tombstones: the node stays in the
//! graph for navigation but is never returned or counted again.

/// HNSW graph structure and data storage.
pub mod graph;
/// HNSW insertion algorithm with bidirectional connections and heuristic pruning.
pub mod insert;
/// HNSW search: single-layer search and multi-layer KNN.
pub mod search;

pub use graph::HnswGraph;
pub use search::knn_search;

use crate::ann::persistence::{read_blob, write_blob};
use crate::ann::{
    check_dimensions, check_stored, normalize, rank, Ann, Capabilities, Metric, Neighbor,
};
use crate::config::{self, Backend, IndexConfig};
use crate::error::{Error, Result};
use std::collections::HashSet;
use std::path::Path;

/// Magic footer identifying HNSW blobs.
const HNSW_MAGIC: &[u8; 4] = b"HNW1";

/// Incremental ANN index backed by an [`HnswGraph`].
#[derive(Debug)]
pub struct Hnsw {
    config: IndexConfig,
    graph: Option<HnswGraph>,
}

impl Hnsw {
    /// Creates an empty, unbuilt index.
    pub fn new(config: IndexConfig) -> Self {
        Self {
            config,
            graph: None,
        }
    }

    /// Loads a persisted index, validating it against `config`.
    pub fn load(mut config: IndexConfig, path: &Path) -> Result<Self> {
        let mut graph: HnswGraph = read_blob(path, HNSW_MAGIC)?;
        graph.validate().map_err(Error::CorruptIndex)?;
        check_stored(&mut config, graph.dimension, Metric::Ip)?;
        graph.reseed();

        tracing::info!(
            "Loaded HNSW index {:?} ({} nodes, {} live)",
            path,
            graph.node_count,
            graph.len()
        );
        Ok(Self {
            config,
            graph: Some(graph),
        })
    }

    fn graph(&self) -> Result<&HnswGraph> {
        self.graph.as_ref().ok_or(Error::NotIndexed)
    }
}

impl Ann for Hnsw {
    fn backend(&self) -> Backend {
        Backend::Hnsw
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            append: true,
            delete: true,
        }
    }

    fn config(&self) -> &IndexConfig {
        &self.config
    }

    fn index(&mut self, vectors: &[Vec<f32>]) -> Result<()> {
        // Inner product equals cosine similarity on normalized vectors
        self.config.metric = Some(Metric::Ip);
        let dimension = check_dimensions(&mut self.config, vectors)?;

        let mut graph = HnswGraph::new(dimension, &self.config.hnsw);
        graph.reserve(vectors.len());
        for vector in vectors {
            graph.insert(&normalize(vector));
        }

        tracing::debug!("Built HNSW index with {} nodes", graph.node_count);
        self.graph = Some(graph);
        Ok(())
    }

    fn append(&mut self, vectors: &[Vec<f32>]) -> Result<()> {
        let graph = self.graph.as_mut().ok_or(Error::NotIndexed)?;
        if graph.node_count == 0 && graph.dimension == 0 {
            // Built over no vectors: the first append fixes the width
            graph.dimension = check_dimensions(&mut self.config, vectors)?;
        }
        for v in vectors {
            if v.len() != graph.dimension {
                return Err(Error::DimensionMismatch {
                    expected: graph.dimension,
                    found: v.len(),
                });
            }
        }

        // Grow capacity first, then insert at offset..offset + m
        graph.reserve(vectors.len());
        for vector in vectors {
            graph.insert(&normalize(vector));
        }

        tracing::debug!(
            "Appended {} vectors, offset now {}",
            vectors.len(),
            graph.node_count
        );
        Ok(())
    }

    fn delete(&mut self, labels: &[u32]) -> Result<usize> {
        let Some(graph) = self.graph.as_mut() else {
            return Ok(0);
        };
        let unique: HashSet<u32> = labels.iter().copied().collect();
        let deleted = unique
            .into_iter()
            .filter(|&label| graph.mark_deleted(label))
            .count();
        if deleted < labels.len() {
            tracing::debug!(
                "Ignored {} unknown or already deleted labels",
                labels.len() - deleted
            );
        }
        Ok(deleted)
    }

    fn search(&self, queries: &[Vec<f32>], limit: usize) -> Result<Vec<Vec<Neighbor>>> {
        let graph = self.graph()?;
        if graph.node_count == 0 {
            return Ok(vec![Vec::new(); queries.len()]);
        }
        let ef = self
            .config
            .hnsw
            .efsearch
            .unwrap_or(config::HNSW_DEFAULT_EF_SEARCH);

        queries
            .iter()
            .map(|query| {
                if query.len() != graph.dimension {
                    return Err(Error::DimensionMismatch {
                        expected: graph.dimension,
                        found: query.len(),
                    });
                }
                let query = normalize(query);
                let mut hits: Vec<Neighbor> = knn_search(graph, &query, limit, ef)
                    .into_iter()
                    .map(|(distance, id)| (id, 1.0 - distance))
                    .collect();
                rank(&mut hits, limit);
                Ok(hits)
            })
            .collect()
    }

    fn count(&self) -> usize {
        self.graph.as_ref().map_or(0, HnswGraph::len)
    }

    fn offset(&self) -> u32 {
        self.graph.as_ref().map_or(0, |g| g.node_count)
    }

    fn save(&self, path: &Path) -> Result<()> {
        write_blob(path, HNSW_MAGIC, self.graph()?)
    }
}
