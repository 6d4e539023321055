//! HNSW graph structure.
//!
//! [`HnswGraph`] stores the graph using a Struct-of-Arrays layout: all vectors
//! live contiguously in one arena, with separate arrays for neighbor lists,
//! layer assignments and tombstones. Node ids double as labels.

use crate::ann::dot_product;
use crate::config::{self, HnswSettings};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// HNSW graph using Struct-of-Arrays (SoA) layout for cache-friendly access.
#[derive(Debug, Serialize, Deserialize)]
pub struct HnswGraph {
    /// Links per node above layer 0.
    pub m: usize,
    /// Links per node at layer 0.
    pub m_max0: usize,
    pub ef_construction: usize,
    pub max_layers: usize,
    pub seed: u64,
    // SoA: normalized f32 vector arena
    pub vectors: Vec<f32>,
    // SoA: graph structure
    pub neighbors: Vec<Vec<Vec<u32>>>, // [node_id][layer][neighbor_ids]
    pub layers: Vec<u8>,
    pub deleted: Vec<bool>,
    pub entry_point: Option<u32>,
    pub max_layer: usize,
    pub dimension: usize,
    pub node_count: u32,
    #[serde(skip, default = "unseeded")]
    rng: StdRng,
}

fn unseeded() -> StdRng {
    StdRng::seed_from_u64(0)
}

impl HnswGraph {
    /// Creates a new empty graph with the given dimension and settings.
    pub fn new(dimension: usize, settings: &HnswSettings) -> Self {
        let m = settings.m.max(2);
        Self {
            m,
            m_max0: m * 2,
            ef_construction: settings.efconstruction.max(1),
            max_layers: config::HNSW_DEFAULT_MAX_LAYERS,
            seed: settings.randomseed,
            vectors: Vec::new(),
            neighbors: Vec::new(),
            layers: Vec::new(),
            deleted: Vec::new(),
            entry_point: None,
            max_layer: 0,
            dimension,
            node_count: 0,
            rng: StdRng::seed_from_u64(settings.randomseed),
        }
    }

    /// Re-derives the level RNG after deserialization so appends stay
    /// deterministic for a given seed and node count.
    pub fn reseed(&mut self) {
        self.rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.node_count as u64));
    }

    /// Returns the number of non-deleted nodes in the graph.
    pub fn len(&self) -> usize {
        self.deleted.iter().filter(|&&d| !d).count()
    }

    /// Returns `true` if the graph contains no non-deleted nodes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Grows arena capacity ahead of a batch insert.
    pub fn reserve(&mut self, additional: usize) {
        self.vectors.reserve(additional * self.dimension);
        self.neighbors.reserve(additional);
        self.layers.reserve(additional);
        self.deleted.reserve(additional);
    }

    /// Generate a random layer for a new node using exponential distribution.
    pub fn random_level(&mut self) -> usize {
        let ml = 1.0 / (self.m as f64).ln();
        let r: f64 = self.rng.gen_range(f64::MIN_POSITIVE..1.0);
        let level = (-r.ln() * ml).floor() as usize;
        level.min(self.max_layers - 1)
    }

    /// Vector slice for the given node. O(1) slice into the arena.
    #[inline]
    pub fn vector(&self, id: u32) -> &[f32] {
        let start = id as usize * self.dimension;
        &self.vectors[start..start + self.dimension]
    }

    /// Inner-product distance between a query and a stored node: `1 - dot`.
    #[inline]
    pub fn distance(&self, query: &[f32], id: u32) -> f32 {
        1.0 - dot_product(query, self.vector(id))
    }

    /// Returns `true` if the node has been tombstoned.
    #[inline]
    pub fn is_deleted(&self, id: u32) -> bool {
        self.deleted[id as usize]
    }

    /// Tombstone a node. Returns `true` only if the node existed and was live.
    pub fn mark_deleted(&mut self, id: u32) -> bool {
        match self.deleted.get_mut(id as usize) {
            Some(flag) if !*flag => {
                *flag = true;
                true
            }
            _ => false,
        }
    }

    /// Check internal invariants after deserialization.
    ///
    /// Parallel arrays must have consistent lengths and every entry point and
    /// neighbor id must be in bounds. Each node carries one neighbor list per
    /// level up to its own, and `max_layer` is the highest node level.
    pub fn validate(&self) -> Result<(), String> {
        let nc = self.node_count as usize;

        if self.vectors.len() != nc * self.dimension {
            return Err(format!(
                "vectors length {} != node_count({}) * dimension({})",
                self.vectors.len(),
                nc,
                self.dimension
            ));
        }
        if self.neighbors.len() != nc {
            return Err(format!(
                "neighbors length {} != node_count {}",
                self.neighbors.len(),
                nc
            ));
        }
        if self.layers.len() != nc {
            return Err(format!(
                "layers length {} != node_count {}",
                self.layers.len(),
                nc
            ));
        }
        if self.deleted.len() != nc {
            return Err(format!(
                "deleted length {} != node_count {}",
                self.deleted.len(),
                nc
            ));
        }
        if self.m < 2 || self.max_layers == 0 {
            return Err(format!("invalid m={} max_layers={}", self.m, self.max_layers));
        }

        if let Some(ep) = self.entry_point {
            if ep as usize >= nc {
                return Err(format!("entry_point {} >= node_count {}", ep, nc));
            }
        }

        for (node_id, (node_neighbors, &level)) in
            self.neighbors.iter().zip(&self.layers).enumerate()
        {
            if node_neighbors.len() != level as usize + 1 {
                return Err(format!(
                    "node {} has {} neighbor layers but level {}",
                    node_id,
                    node_neighbors.len(),
                    level
                ));
            }
        }
        let top = self.layers.iter().max().map_or(0, |&l| l as usize);
        if self.max_layer != top {
            return Err(format!(
                "max_layer {} != highest node level {}",
                self.max_layer, top
            ));
        }

        for (node_id, node_neighbors) in self.neighbors.iter().enumerate() {
            for (layer, layer_neighbors) in node_neighbors.iter().enumerate() {
                for &neighbor in layer_neighbors {
                    if neighbor as usize >= nc {
                        return Err(format!(
                            "neighbor {} out of bounds (node_count={}) at node {} layer {}",
                            neighbor, nc, node_id, layer
                        ));
                    }
                }
            }
        }

        Ok(())
    }
}
