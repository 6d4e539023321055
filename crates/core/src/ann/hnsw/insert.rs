//! HNSW insertion algorithm.
//!
//! Inserts a vector into the graph with bidirectional connections and
//! heuristic neighbor pruning (Algorithm 4 from the HNSW paper).

use crate::ann::dot_product;
use crate::ann::hnsw::graph::HnswGraph;
use crate::ann::hnsw::search::{search_layer, Visited};

impl HnswGraph {
    /// Insert a normalized vector. Its node id is the current `node_count`,
    /// which is returned.
    pub fn insert(&mut self, vector: &[f32]) -> u32 {
        debug_assert_eq!(vector.len(), self.dimension);
        let internal_id = self.node_count;
        let level = self.random_level();

        // First node: push SoA fields and return
        let Some(entry_point) = self.entry_point else {
            self.push_node(vector, vec![Vec::new(); level + 1], level);
            self.entry_point = Some(internal_id);
            self.max_layer = level;
            return internal_id;
        };

        let mut current_ep = entry_point;
        let mut visited = Visited::default();

        // Phase 1: greedy descent from the top layer to level + 1
        for layer in (level + 1..=self.max_layer).rev() {
            let results = search_layer(
                self,
                vector,
                std::slice::from_ref(&current_ep),
                1,
                layer,
                &mut visited,
            );
            if let Some(&(_, nearest)) = results.first() {
                current_ep = nearest;
            }
        }

        // Phase 2: collect neighbor lists per layer, then push the node
        let top = level.min(self.max_layer);
        let mut node_neighbors: Vec<Vec<u32>> = vec![Vec::new(); level + 1];
        let mut layer_eps: Vec<u32> = vec![current_ep];
        for layer in (0..=top).rev() {
            let candidates = search_layer(
                self,
                vector,
                &layer_eps,
                self.ef_construction,
                layer,
                &mut visited,
            );

            let selected = select_neighbors_heuristic(self, &candidates, self.layer_capacity(layer));
            node_neighbors[layer] = selected.iter().map(|&(_, id)| id).collect();

            layer_eps.clear();
            layer_eps.extend(candidates.iter().map(|&(_, id)| id));
            if layer_eps.is_empty() {
                layer_eps.push(entry_point);
            }
        }

        self.push_node(vector, node_neighbors, level);

        // Phase 3: add reverse links and prune over-capacity neighbors
        for layer in 0..=top {
            let m_max = self.layer_capacity(layer);
            let my_neighbors: Vec<u32> = self.neighbors[internal_id as usize][layer].clone();
            for neighbor_id in my_neighbors {
                let nid = neighbor_id as usize;
                while self.neighbors[nid].len() <= layer {
                    self.neighbors[nid].push(Vec::new());
                }
                self.neighbors[nid][layer].push(internal_id);

                if self.neighbors[nid][layer].len() > m_max {
                    let base = self.vector(neighbor_id).to_vec();
                    let candidates: Vec<(f32, u32)> = self.neighbors[nid][layer]
                        .iter()
                        .map(|&cid| (self.distance(&base, cid), cid))
                        .collect();
                    let pruned = select_neighbors_heuristic(self, &candidates, m_max);
                    self.neighbors[nid][layer] = pruned.iter().map(|&(_, id)| id).collect();
                }
            }
        }

        if level > self.max_layer {
            self.max_layer = level;
            self.entry_point = Some(internal_id);
        }
        internal_id
    }

    fn layer_capacity(&self, layer: usize) -> usize {
        if layer == 0 {
            self.m_max0
        } else {
            self.m
        }
    }

    fn push_node(&mut self, vector: &[f32], neighbors: Vec<Vec<u32>>, level: usize) {
        self.vectors.extend_from_slice(vector);
        self.neighbors.push(neighbors);
        self.layers.push(level as u8);
        self.deleted.push(false);
        self.node_count += 1;
    }
}

/// Heuristic neighbor selection (Algorithm 4 from the HNSW paper).
/// A candidate is selected only if it is closer to the base node than to any
/// already-selected neighbor; remaining slots are filled with the closest
/// unused candidates.
fn select_neighbors_heuristic(
    graph: &HnswGraph,
    candidates: &[(f32, u32)],
    m: usize,
) -> Vec<(f32, u32)> {
    let mut sorted = candidates.to_vec();
    sorted.sort_unstable_by(|a, b| {
        a.0.partial_cmp(&b.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.1.cmp(&b.1))
    });

    let mut selected: Vec<(f32, u32)> = Vec::with_capacity(m);
    for &(dist_to_base, cid) in &sorted {
        if selected.len() >= m {
            break;
        }
        let candidate = graph.vector(cid);
        let is_diverse = selected.iter().all(|&(_, sid)| {
            let dist_to_selected = 1.0 - dot_product(candidate, graph.vector(sid));
            dist_to_base <= dist_to_selected
        });
        if is_diverse {
            selected.push((dist_to_base, cid));
        }
    }

    if selected.len() < m {
        let selected_ids: std::collections::HashSet<u32> =
            selected.iter().map(|&(_, id)| id).collect();
        for &(dist, cid) in &sorted {
            if selected.len() >= m {
                break;
            }
            if !selected_ids.contains(&cid) {
                selected.push((dist, cid));
            }
        }
    }

    selected
}
