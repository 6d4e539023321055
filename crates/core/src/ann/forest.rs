//! Static random-hyperplane forest.
//!
//! Each tree recursively splits the item set by the hyperplane equidistant
//! from two randomly chosen items until leaves hold at most
//! [`config::FOREST_DEFAULT_LEAF_SIZE`] items. Queries walk all trees through
//! one shared priority queue keyed by the smallest hyperplane margin seen on
//! the path, collect up to `searchk` candidates, and rerank them exactly.
//!
//! The forest is only ever bulk built. Growing or shrinking it means calling
//! [`Ann::index`] again with the full vector set.

use crate::ann::persistence::{read_blob, write_blob};
use crate::ann::{
    check_dimensions, check_stored, dot_product, normalize, rank, Ann, Capabilities, Metric,
    Neighbor,
};
use crate::config::{self, Backend, IndexConfig};
use crate::error::{Error, Result};
use ordered_float::OrderedFloat;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BinaryHeap, HashSet};
use std::path::Path;

/// Magic footer identifying forest blobs.
const FOREST_MAGIC: &[u8; 4] = b"FST1";

/// A node of a forest tree. Children are indexes into [`ForestData::nodes`].
#[derive(Debug, Clone, Serialize, Deserialize)]
enum Node {
    Leaf(Vec<u32>),
    Split {
        normal: Vec<f32>,
        offset: f32,
        /// Items with `dot(normal, v) <= offset`.
        below: u32,
        /// Items with `dot(normal, v) > offset`.
        above: u32,
    },
}

/// Serialized form of a built forest.
#[derive(Debug, Serialize, Deserialize)]
struct ForestData {
    dimension: usize,
    count: u32,
    vectors: Vec<f32>,
    nodes: Vec<Node>,
    roots: Vec<u32>,
}

impl ForestData {
    fn vector(&self, id: u32) -> &[f32] {
        let start = id as usize * self.dimension;
        &self.vectors[start..start + self.dimension]
    }

    fn validate(&self) -> std::result::Result<(), String> {
        let nc = self.count as usize;
        if self.vectors.len() != nc * self.dimension {
            return Err(format!(
                "vectors length {} != count({}) * dimension({})",
                self.vectors.len(),
                nc,
                self.dimension
            ));
        }
        let nodes = self.nodes.len();
        for &root in &self.roots {
            if root as usize >= nodes {
                return Err(format!("root {} >= node count {}", root, nodes));
            }
        }
        for node in &self.nodes {
            match node {
                Node::Leaf(items) => {
                    if let Some(&bad) = items.iter().find(|&&i| i as usize >= nc) {
                        return Err(format!("leaf item {} out of bounds (count={})", bad, nc));
                    }
                }
                Node::Split {
                    normal,
                    below,
                    above,
                    ..
                } => {
                    if normal.len() != self.dimension {
                        return Err(format!("split normal has width {}", normal.len()));
                    }
                    if *below as usize >= nodes || *above as usize >= nodes {
                        return Err(format!("split child out of bounds (nodes={})", nodes));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Tree builder holding the shared node arena and RNG.
struct Builder<'a> {
    data: &'a mut ForestData,
    rng: StdRng,
    leaf_size: usize,
}

impl Builder<'_> {
    fn build(&mut self, mut items: Vec<u32>) -> u32 {
        if items.len() <= self.leaf_size {
            return self.push(Node::Leaf(items));
        }

        let a = items[self.rng.gen_range(0..items.len())];
        let mut b = items[self.rng.gen_range(0..items.len())];
        if a == b {
            b = items[(items.iter().position(|&i| i == a).unwrap_or(0) + 1) % items.len()];
        }

        let va = self.data.vector(a);
        let vb = self.data.vector(b);
        let normal: Vec<f32> = va.iter().zip(vb).map(|(x, y)| x - y).collect();
        let midpoint: Vec<f32> = va.iter().zip(vb).map(|(x, y)| (x + y) / 2.0).collect();
        let offset = dot_product(&normal, &midpoint);

        let (mut above, mut below): (Vec<u32>, Vec<u32>) = items
            .iter()
            .partition(|&&id| dot_product(&normal, self.data.vector(id)) > offset);

        // Degenerate split (duplicates): fall back to a random halving with a
        // zero normal, which routes every query down both sides.
        let normal = if above.is_empty() || below.is_empty() {
            items.shuffle(&mut self.rng);
            let half = items.len() / 2;
            below = items[..half].to_vec();
            above = items[half..].to_vec();
            vec![0.0; self.data.dimension]
        } else {
            normal
        };
        let offset = if normal.iter().all(|&x| x == 0.0) {
            0.0
        } else {
            offset
        };

        let below = self.build(below);
        let above = self.build(above);
        self.push(Node::Split {
            normal,
            offset,
            below,
            above,
        })
    }

    fn push(&mut self, node: Node) -> u32 {
        self.data.nodes.push(node);
        (self.data.nodes.len() - 1) as u32
    }
}

/// Static ANN index backed by a forest of random-hyperplane trees.
#[derive(Debug)]
pub struct Forest {
    config: IndexConfig,
    data: Option<ForestData>,
}

impl Forest {
    /// Creates an empty, unbuilt index.
    pub fn new(config: IndexConfig) -> Self {
        Self { config, data: None }
    }

    /// Loads a persisted forest, validating it against `config`.
    pub fn load(mut config: IndexConfig, path: &Path) -> Result<Self> {
        let data: ForestData = read_blob(path, FOREST_MAGIC)?;
        data.validate().map_err(Error::CorruptIndex)?;
        check_stored(&mut config, data.dimension, Metric::Dot)?;

        tracing::info!(
            "Loaded forest index {:?} ({} items, {} trees)",
            path,
            data.count,
            data.roots.len()
        );
        Ok(Self {
            config,
            data: Some(data),
        })
    }

    fn search_one(&self, data: &ForestData, query: &[f32], limit: usize) -> Vec<Neighbor> {
        let search_k = match usize::try_from(self.config.annoy.searchk) {
            Ok(k) if k > 0 => k,
            _ => data.roots.len() * limit,
        }
        .max(limit);

        let mut queue: BinaryHeap<(OrderedFloat<f32>, u32)> = data
            .roots
            .iter()
            .map(|&root| (OrderedFloat(f32::INFINITY), root))
            .collect();
        let mut candidates: HashSet<u32> = HashSet::new();

        while candidates.len() < search_k {
            let Some((OrderedFloat(priority), node)) = queue.pop() else {
                break;
            };
            match &data.nodes[node as usize] {
                Node::Leaf(items) => candidates.extend(items.iter().copied()),
                Node::Split {
                    normal,
                    offset,
                    below,
                    above,
                } => {
                    let margin = dot_product(normal, query) - offset;
                    queue.push((OrderedFloat(priority.min(margin)), *above));
                    queue.push((OrderedFloat(priority.min(-margin)), *below));
                }
            }
        }

        let mut hits: Vec<Neighbor> = candidates
            .into_iter()
            .map(|id| (id, dot_product(query, data.vector(id))))
            .collect();
        rank(&mut hits, limit);
        hits
    }
}

impl Ann for Forest {
    fn backend(&self) -> Backend {
        Backend::Annoy
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            append: false,
            delete: false,
        }
    }

    fn config(&self) -> &IndexConfig {
        &self.config
    }

    fn index(&mut self, vectors: &[Vec<f32>]) -> Result<()> {
        // Dot product equals cosine similarity on normalized vectors
        self.config.metric = Some(Metric::Dot);
        let dimension = check_dimensions(&mut self.config, vectors)?;

        let mut data = ForestData {
            dimension,
            count: vectors.len() as u32,
            vectors: Vec::with_capacity(vectors.len() * dimension),
            nodes: Vec::new(),
            roots: Vec::new(),
        };
        for v in vectors {
            data.vectors.extend(normalize(v));
        }

        let trees = self.config.annoy.ntrees.max(1);
        let mut builder = Builder {
            data: &mut data,
            rng: StdRng::seed_from_u64(self.config.annoy.randomseed),
            leaf_size: config::FOREST_DEFAULT_LEAF_SIZE,
        };
        let mut roots = Vec::with_capacity(trees);
        for _ in 0..trees {
            roots.push(builder.build((0..vectors.len() as u32).collect()));
        }
        data.roots = roots;

        tracing::debug!(
            "Built forest with {} trees over {} items ({} nodes)",
            trees,
            data.count,
            data.nodes.len()
        );
        self.data = Some(data);
        Ok(())
    }

    fn search(&self, queries: &[Vec<f32>], limit: usize) -> Result<Vec<Vec<Neighbor>>> {
        let data = self.data.as_ref().ok_or(Error::NotIndexed)?;
        if data.count == 0 {
            return Ok(vec![Vec::new(); queries.len()]);
        }
        queries
            .iter()
            .map(|query| {
                if query.len() != data.dimension {
                    return Err(Error::DimensionMismatch {
                        expected: data.dimension,
                        found: query.len(),
                    });
                }
                Ok(self.search_one(data, &normalize(query), limit))
            })
            .collect()
    }

    fn count(&self) -> usize {
        self.data.as_ref().map_or(0, |d| d.count as usize)
    }

    fn offset(&self) -> u32 {
        self.data.as_ref().map_or(0, |d| d.count)
    }

    fn save(&self, path: &Path) -> Result<()> {
        let data = self.data.as_ref().ok_or(Error::NotIndexed)?;
        write_blob(path, FOREST_MAGIC, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn random_vectors(n: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect())
            .collect()
    }

    #[test]
    fn test_self_similarity() {
        let vectors = random_vectors(200, 8, 7);
        let mut forest = Forest::new(IndexConfig::new(Backend::Annoy));
        forest.index(&vectors).unwrap();
        let results = forest.search(&vectors[..20], 1).unwrap();
        for (i, hits) in results.iter().enumerate() {
            assert_eq!(hits[0].0, i as u32);
            assert!((hits[0].1 - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_append_and_delete_unsupported() {
        let mut forest = Forest::new(IndexConfig::new(Backend::Annoy));
        forest.index(&random_vectors(10, 4, 1)).unwrap();
        assert!(matches!(
            forest.append(&random_vectors(1, 4, 2)),
            Err(Error::UnsupportedOperation { operation: "append", .. })
        ));
        assert!(matches!(
            forest.delete(&[0]),
            Err(Error::UnsupportedOperation { operation: "delete", .. })
        ));
        assert_eq!(forest.count(), 10);
    }

    #[test]
    fn test_duplicate_vectors_terminate() {
        let vectors = vec![vec![1.0, 1.0, 0.0]; 100];
        let mut forest = Forest::new(IndexConfig::new(Backend::Annoy));
        forest.index(&vectors).unwrap();
        let hits = forest.search(&[vec![1.0, 1.0, 0.0]], 100).unwrap();
        assert_eq!(hits[0].len(), 100);
        let labels: Vec<u32> = hits[0].iter().take(5).map(|&(id, _)| id).collect();
        assert_eq!(labels, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_build_is_deterministic() {
        let vectors = random_vectors(64, 6, 3);
        let mut a = Forest::new(IndexConfig::new(Backend::Annoy));
        let mut b = Forest::new(IndexConfig::new(Backend::Annoy));
        a.index(&vectors).unwrap();
        b.index(&vectors).unwrap();
        let query = random_vectors(1, 6, 9);
        assert_eq!(a.search(&query, 5).unwrap(), b.search(&query, 5).unwrap());
    }

    #[test]
    fn test_search_before_index() {
        let forest = Forest::new(IndexConfig::new(Backend::Annoy));
        assert!(matches!(
            forest.search(&[vec![1.0]], 1),
            Err(Error::NotIndexed)
        ));
    }

    #[test]
    fn test_empty_forest_returns_no_hits() {
        let mut forest = Forest::new(IndexConfig::new(Backend::Annoy));
        forest.index(&[]).unwrap();
        assert_eq!(forest.config().dimensions, None);
        assert_eq!(forest.search(&[vec![1.0, 0.0]], 3).unwrap(), vec![Vec::new()]);
    }
}
