//! HNSW search: single-layer best-first search and multi-layer KNN.
//!
//! Result admission is controlled by a predicate `Fn(u32) -> bool`. Rejected
//! nodes are still expanded, so tombstoned nodes keep the graph navigable
//! while staying out of search output.

use crate::ann::hnsw::graph::HnswGraph;
use ordered_float::OrderedFloat;
use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Visit marks for one traversal at a time.
///
/// A node is visited when its mark equals the current epoch, so starting a
/// new traversal is a counter bump rather than a clear.
#[derive(Debug, Default)]
pub struct Visited {
    marks: Vec<u32>,
    epoch: u32,
}

impl Visited {
    /// Starts a new traversal over a graph of `nodes` nodes.
    pub fn reset(&mut self, nodes: usize) {
        if self.marks.len() < nodes {
            self.marks.resize(nodes, 0);
        }
        self.epoch = self.epoch.wrapping_add(1);
        if self.epoch == 0 {
            self.marks.fill(0);
            self.epoch = 1;
        }
    }

    /// Returns `true` the first time `id` is seen in this traversal.
    #[inline]
    pub fn first_visit(&mut self, id: u32) -> bool {
        let mark = &mut self.marks[id as usize];
        let first = *mark != self.epoch;
        *mark = self.epoch;
        first
    }
}

thread_local! {
    static SEARCH_VISITED: RefCell<Visited> = RefCell::new(Visited::default());
}

type Scored = (OrderedFloat<f32>, u32);

/// Search one layer, admitting every node.
/// Used during construction, where tombstoned nodes remain valid neighbors.
pub fn search_layer(
    graph: &HnswGraph,
    query: &[f32],
    entry_points: &[u32],
    ef: usize,
    layer: usize,
    visited: &mut Visited,
) -> Vec<(f32, u32)> {
    search_layer_filtered(graph, query, entry_points, ef, layer, visited, &|_: u32| true)
}

/// Best-first search of one layer.
///
/// Returns up to `ef` admitted nodes, nearest first; equal distances keep the
/// lower id.
pub fn search_layer_filtered<F: Fn(u32) -> bool>(
    graph: &HnswGraph,
    query: &[f32],
    entry_points: &[u32],
    ef: usize,
    layer: usize,
    visited: &mut Visited,
    accept: &F,
) -> Vec<(f32, u32)> {
    visited.reset(graph.node_count as usize);

    // Min-heap of nodes to expand, max-heap of the best admitted nodes
    let mut frontier: BinaryHeap<Reverse<Scored>> = BinaryHeap::with_capacity(ef * 2);
    let mut best: BinaryHeap<Scored> = BinaryHeap::with_capacity(ef + 1);

    let admit = |best: &mut BinaryHeap<Scored>, dist: f32, id: u32| {
        if accept(id) {
            best.push((OrderedFloat(dist), id));
            if best.len() > ef {
                best.pop();
            }
        }
    };
    let bound = |best: &BinaryHeap<Scored>| {
        if best.len() >= ef {
            best.peek().map_or(f32::MAX, |&(d, _)| d.0)
        } else {
            f32::MAX
        }
    };

    for &ep in entry_points {
        if visited.first_visit(ep) {
            let dist = graph.distance(query, ep);
            frontier.push(Reverse((OrderedFloat(dist), ep)));
            admit(&mut best, dist, ep);
        }
    }

    while let Some(Reverse((OrderedFloat(dist), node))) = frontier.pop() {
        if dist > bound(&best) {
            break;
        }
        let Some(links) = graph.neighbors[node as usize].get(layer) else {
            continue;
        };

        for &neighbor in links {
            if !visited.first_visit(neighbor) {
                continue;
            }
            let dist = graph.distance(query, neighbor);
            if best.len() < ef || dist < bound(&best) {
                frontier.push(Reverse((OrderedFloat(dist), neighbor)));
                admit(&mut best, dist, neighbor);
            }
        }
    }

    best.into_sorted_vec()
        .into_iter()
        .map(|(dist, id)| (dist.0, id))
        .collect()
}

/// Multi-layer KNN search skipping tombstoned nodes.
///
/// If the first pass yields fewer than `k` live results (many tombstones),
/// retries with progressively larger ef, up to 4x.
/// Returns `(distance, id)` pairs, nearest first.
pub fn knn_search(graph: &HnswGraph, query: &[f32], k: usize, ef_search: usize) -> Vec<(f32, u32)> {
    let Some(entry_point) = graph.entry_point else {
        return Vec::new();
    };
    if k == 0 {
        return Vec::new();
    }

    SEARCH_VISITED.with(|cell| {
        let mut guard = cell.borrow_mut();
        let visited = &mut *guard;

        // Upper layers: greedy descent with ef=1
        let mut current = entry_point;
        for layer in (1..=graph.max_layer).rev() {
            let nearest = search_layer(graph, query, &[current], 1, layer, visited);
            if let Some(&(_, id)) = nearest.first() {
                current = id;
            }
        }

        let live = |id: u32| !graph.is_deleted(id);
        let base_ef = ef_search.max(k);
        let max_ef = (base_ef * 4).min(graph.node_count as usize).max(base_ef);
        let mut ef = base_ef;

        loop {
            let mut results =
                search_layer_filtered(graph, query, &[current], ef, 0, visited, &live);
            if results.len() >= k || ef >= max_ef {
                results.truncate(k);
                return results;
            }
            ef = (ef * 2).min(max_ef);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ann::normalize;
    use crate::config::HnswSettings;

    fn ring(n: usize) -> HnswGraph {
        let mut graph = HnswGraph::new(2, &HnswSettings::default());
        for i in 0..n {
            let angle = i as f32 * std::f32::consts::TAU / n as f32;
            graph.insert(&[angle.cos(), angle.sin()]);
        }
        graph
    }

    #[test]
    fn test_visited_epochs() {
        let mut visited = Visited::default();
        visited.reset(4);
        assert!(visited.first_visit(3));
        assert!(!visited.first_visit(3));
        visited.reset(8);
        assert!(visited.first_visit(3));
        assert!(visited.first_visit(7));
    }

    #[test]
    fn test_visited_epoch_wraps() {
        let mut visited = Visited::default();
        visited.reset(2);
        visited.epoch = u32::MAX;
        visited.first_visit(1);
        visited.reset(2);
        assert_eq!(visited.epoch, 1);
        assert!(visited.first_visit(1));
    }

    #[test]
    fn test_knn_empty_graph() {
        let graph = HnswGraph::new(2, &HnswSettings::default());
        assert!(knn_search(&graph, &[1.0, 0.0], 5, 50).is_empty());
    }

    #[test]
    fn test_knn_finds_exact_match() {
        let graph = ring(100);
        let query = normalize(&[1.0, 0.0]);
        let results = knn_search(&graph, &query, 3, 50);
        assert_eq!(results[0].1, 0);
        assert!(results[0].0.abs() < 1e-5);
    }

    #[test]
    fn test_knn_skips_deleted() {
        let mut graph = ring(50);
        graph.mark_deleted(0);
        let results = knn_search(&graph, &[1.0, 0.0], 10, 50);
        assert_eq!(results.len(), 10);
        assert!(results.iter().all(|&(_, id)| id != 0));
    }

    #[test]
    fn test_knn_results_sorted_by_distance() {
        let graph = ring(40);
        let results = knn_search(&graph, &normalize(&[0.3, 0.7]), 8, 50);
        for pair in results.windows(2) {
            assert!(pair[0].0 <= pair[1].0);
        }
    }
}
