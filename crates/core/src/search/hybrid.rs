//! Hybrid fusion of dense and sparse ranked lists.
//!
//! Two strategies:
//! - **RRF** (Reciprocal Rank Fusion): rank-based and parameter-free,
//!   `score(d) = Σ 1 / (k + rank_i(d))`;
//! - **Linear**: min-max normalized scores combined as
//!   `alpha * dense + (1 - alpha) * sparse`.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use ordered_float::OrderedFloat;

use crate::config;
use crate::types::IntId;

/// Fusion strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FusionMethod {
    /// Reciprocal Rank Fusion.
    #[default]
    Rrf,
    /// Min-max normalized linear combination.
    Linear,
}

/// Reciprocal Rank Fusion over two ranked lists.
pub fn rrf_fusion(
    dense: &[(IntId, f32)],
    sparse: &[(IntId, f32)],
    k: usize,
) -> Vec<(IntId, f32)> {
    let rrf_k = config::RRF_K;
    let mut scores: HashMap<IntId, f32> = HashMap::with_capacity(dense.len() + sparse.len());
    for (rank, &(id, _)) in dense.iter().enumerate() {
        *scores.entry(id).or_insert(0.0) += 1.0 / (rrf_k + rank as f32 + 1.0);
    }
    for (rank, &(id, _)) in sparse.iter().enumerate() {
        *scores.entry(id).or_insert(0.0) += 1.0 / (rrf_k + rank as f32 + 1.0);
    }
    top_k(scores, k)
}

/// Linear combination with min-max normalization per list.
pub fn linear_fusion(
    dense: &[(IntId, f32)],
    sparse: &[(IntId, f32)],
    alpha: f32,
    k: usize,
) -> Vec<(IntId, f32)> {
    let mut scores: HashMap<IntId, f32> = HashMap::with_capacity(dense.len() + sparse.len());
    accumulate_normalized(&mut scores, dense, alpha);
    accumulate_normalized(&mut scores, sparse, 1.0 - alpha);
    top_k(scores, k)
}

fn accumulate_normalized(scores: &mut HashMap<IntId, f32>, results: &[(IntId, f32)], weight: f32) {
    let Some((min, max)) = min_max(results) else {
        return;
    };
    let range = max - min;
    for &(id, score) in results {
        let normalized = if range < f32::EPSILON {
            1.0
        } else {
            (score - min) / range
        };
        *scores.entry(id).or_insert(0.0) += weight * normalized;
    }
}

/// Partial sort: O(n log k) via a bounded min-heap.
fn top_k(scores: HashMap<IntId, f32>, k: usize) -> Vec<(IntId, f32)> {
    let mut heap: BinaryHeap<Reverse<(OrderedFloat<f32>, IntId)>> =
        BinaryHeap::with_capacity(k + 1);
    for (id, score) in scores {
        heap.push(Reverse((OrderedFloat(score), id)));
        if heap.len() > k {
            heap.pop();
        }
    }
    heap.into_sorted_vec()
        .into_iter()
        .map(|Reverse((score, id))| (id, score.0))
        .collect()
}

fn min_max(results: &[(IntId, f32)]) -> Option<(f32, f32)> {
    if results.is_empty() {
        return None;
    }
    let mut min = f32::MAX;
    let mut max = f32::MIN;
    for &(_, s) in results {
        if s < min {
            min = s;
        }
        if s > max {
            max = s;
        }
    }
    Some((min, max))
}
