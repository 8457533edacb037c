//! HNSW search: single-layer traversal, multi-layer KNN with a filter
//! predicate, and the exact brute-force sibling.
//!
//! The filter only gates result inclusion; filtered and soft-deleted nodes
//! still navigate, which keeps recall high under selective filters.

use std::collections::BinaryHeap;

use ordered_float::OrderedFloat;

use crate::hnsw::graph::HnswGraph;
use crate::hnsw::visited::VisitedSet;
use crate::space::Space;
use crate::types::IntId;

/// A traversal candidate ordered so the max-heap pops the closest first.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Candidate {
    neg_distance: OrderedFloat<f32>,
    id: IntId,
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.neg_distance
            .cmp(&other.neg_distance)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// A result entry ordered so the max-heap pops the worst (farthest) first.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ResultEntry {
    distance: OrderedFloat<f32>,
    id: IntId,
}

impl Ord for ResultEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.distance
            .cmp(&other.distance)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for ResultEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Search one layer, returning up to `ef` accepted nodes closest to the
/// query, sorted by ascending distance. `visited` is reused across layers.
pub(crate) fn search_layer<F: Fn(IntId) -> bool>(
    graph: &HnswGraph,
    query: &[u8],
    entry_points: &[IntId],
    ef: usize,
    layer: usize,
    visited: &mut VisitedSet,
    filter: &F,
) -> Vec<(f32, IntId)> {
    let mut candidates: BinaryHeap<Candidate> = BinaryHeap::with_capacity(ef * 2);
    let mut results: BinaryHeap<ResultEntry> = BinaryHeap::with_capacity(ef + 1);
    // Cached worst distance avoids a heap peek per neighbor.
    let mut worst = f32::MAX;

    for &ep in entry_points {
        if !visited.insert(ep) {
            continue;
        }
        let dist = graph.space.distance(query, graph.vector(ep));
        candidates.push(Candidate {
            neg_distance: OrderedFloat(-dist),
            id: ep,
        });
        if !graph.is_deleted(ep) && filter(ep) {
            results.push(ResultEntry {
                distance: OrderedFloat(dist),
                id: ep,
            });
            if results.len() >= ef {
                worst = results.peek().map_or(f32::MAX, |r| r.distance.0);
            }
        }
    }

    while let Some(candidate) = candidates.pop() {
        let c_dist = -candidate.neg_distance.0;
        if results.len() >= ef && c_dist > worst {
            break;
        }

        let slot = candidate.id as usize;
        if layer >= graph.state.neighbors[slot].len() {
            continue;
        }

        for &neighbor in &graph.state.neighbors[slot][layer] {
            if !visited.insert(neighbor) {
                continue;
            }
            let dist = graph.space.distance(query, graph.vector(neighbor));
            if results.len() >= ef && dist >= worst {
                continue;
            }
            candidates.push(Candidate {
                neg_distance: OrderedFloat(-dist),
                id: neighbor,
            });
            if !graph.is_deleted(neighbor) && filter(neighbor) {
                results.push(ResultEntry {
                    distance: OrderedFloat(dist),
                    id: neighbor,
                });
                if results.len() > ef {
                    results.pop();
                }
                worst = results.peek().map_or(f32::MAX, |r| r.distance.0);
            }
        }
    }

    results
        .into_sorted_vec()
        .into_iter()
        .map(|r| (r.distance.0, r.id))
        .collect()
}

impl HnswGraph {
    /// Approximate k-nearest-neighbor search.
    ///
    /// Descends the layer hierarchy greedily, then searches layer 0 with an
    /// effective candidate list of `max(ef, k)`. The `filter` predicate
    /// decides which nodes may appear in results; rejected nodes are still
    /// used for navigation. Results are `(distance, id)` pairs sorted by
    /// ascending distance.
    pub fn search_knn<F: Fn(IntId) -> bool>(
        &self,
        query: &[u8],
        k: usize,
        ef: usize,
        filter: &F,
    ) -> Vec<(f32, IntId)> {
        let Some(entry) = self.state.entry_point else {
            return Vec::new();
        };
        if k == 0 {
            return Vec::new();
        }

        let mut visited = VisitedSet::new(self.state.occupied.len());
        let accept_all = |_: IntId| true;

        let mut current = entry;
        for layer in (1..=self.state.max_layer).rev() {
            let nearest = search_layer(
                self,
                query,
                std::slice::from_ref(&current),
                1,
                layer,
                &mut visited,
                &accept_all,
            );
            if let Some(&(_, id)) = nearest.first() {
                current = id;
            }
        }

        let ef = ef.max(k).max(1);
        let mut results = search_layer(
            self,
            query,
            std::slice::from_ref(&current),
            ef,
            0,
            &mut visited,
            filter,
        );
        results.truncate(k);
        results
    }
}

/// Exact top-k over an explicit subset, ranked by the same distance function
/// as the graph. Used when a candidate set is already narrow enough that
/// graph traversal is not worth it.
pub fn brute_force_search(
    space: &Space,
    items: &[(IntId, &[u8])],
    query: &[u8],
    k: usize,
) -> Vec<(f32, IntId)> {
    let mut scored: Vec<(f32, IntId)> = items
        .iter()
        .map(|&(id, bytes)| (space.distance(query, bytes), id))
        .collect();
    scored.sort_unstable_by(|a, b| {
        a.0.partial_cmp(&b.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.1.cmp(&b.1))
    });
    scored.truncate(k);
    scored
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantization::QuantLevel;
    use crate::space::Metric;

    fn space() -> Space {
        Space::new(Metric::L2, 4, QuantLevel::F32).unwrap()
    }

    fn build_graph(vectors: &[(IntId, [f32; 4])]) -> HnswGraph {
        let space = space();
        let mut g = HnswGraph::new(space.clone(), 64);
        for &(id, v) in vectors {
            let bytes = space.quantize(&v).unwrap();
            g.add_point(&bytes, id, false).unwrap();
        }
        g
    }

    #[test]
    fn test_search_empty_graph() {
        let g = HnswGraph::new(space(), 8);
        let q = space().quantize(&[1.0, 0.0, 0.0, 0.0]).unwrap();
        assert!(g.search_knn(&q, 3, 10, &|_| true).is_empty());
    }

    #[test]
    fn test_search_finds_nearest() {
        let g = build_graph(&[
            (1, [1.0, 0.0, 0.0, 0.0]),
            (2, [0.0, 1.0, 0.0, 0.0]),
            (3, [0.0, 0.0, 1.0, 0.0]),
        ]);
        let q = space().quantize(&[1.0, 0.0, 0.0, 0.0]).unwrap();
        let results = g.search_knn(&q, 2, 10, &|_| true);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].1, 1, "nearest should be id 1");
        assert!(results[0].0 < results[1].0);
    }

    #[test]
    fn test_filter_excludes_but_navigates() {
        let g = build_graph(&[
            (1, [1.0, 0.0, 0.0, 0.0]),
            (2, [0.9, 0.1, 0.0, 0.0]),
            (3, [0.0, 0.0, 1.0, 0.0]),
        ]);
        let q = space().quantize(&[1.0, 0.0, 0.0, 0.0]).unwrap();
        let results = g.search_knn(&q, 3, 10, &|id| id != 1);
        assert!(!results.iter().any(|&(_, id)| id == 1));
        assert_eq!(results[0].1, 2);
    }

    #[test]
    fn test_deleted_excluded_from_results() {
        let mut g = build_graph(&[
            (1, [1.0, 0.0, 0.0, 0.0]),
            (2, [0.9, 0.1, 0.0, 0.0]),
            (3, [0.0, 0.0, 1.0, 0.0]),
        ]);
        g.remove_point(1).unwrap();
        let q = space().quantize(&[1.0, 0.0, 0.0, 0.0]).unwrap();
        let results = g.search_knn(&q, 3, 10, &|_| true);
        assert!(!results.iter().any(|&(_, id)| id == 1));
    }

    #[test]
    fn test_brute_force_matches_graph_on_small_set() {
        let space = space();
        let raw = [
            (1 as IntId, [1.0f32, 0.0, 0.0, 0.0]),
            (2, [0.0, 1.0, 0.0, 0.0]),
            (3, [0.5, 0.5, 0.0, 0.0]),
        ];
        let encoded: Vec<(IntId, Vec<u8>)> = raw
            .iter()
            .map(|&(id, v)| (id, space.quantize(&v).unwrap()))
            .collect();
        let items: Vec<(IntId, &[u8])> = encoded
            .iter()
            .map(|(id, b)| (*id, b.as_slice()))
            .collect();
        let q = space.quantize(&[1.0, 0.0, 0.0, 0.0]).unwrap();
        let exact = brute_force_search(&space, &items, &q, 2);
        assert_eq!(exact[0].1, 1);
        assert_eq!(exact.len(), 2);
    }

    #[test]
    fn test_larger_graph_recall() {
        let space = space();
        let mut g = HnswGraph::new(space.clone(), 256);
        for i in 1..=50u32 {
            let v = [
                (i as f32 * 0.37).sin(),
                (i as f32 * 0.51).cos(),
                (i as f32 * 0.13).sin(),
                (i as f32 * 0.71).cos(),
            ];
            let bytes = space.quantize(&v).unwrap();
            g.add_point(&bytes, i as IntId, false).unwrap();
        }
        // The stored vector for id 25 must come back first for its own query.
        let target = [
            (25f32 * 0.37).sin(),
            (25f32 * 0.51).cos(),
            (25f32 * 0.13).sin(),
            (25f32 * 0.71).cos(),
        ];
        let q = space.quantize(&target).unwrap();
        let results = g.search_knn(&q, 1, 32, &|_| true);
        assert_eq!(results[0].1, 25);
    }
}
