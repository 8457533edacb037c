//! Search primitives shared by the engine: ranked hits and hybrid fusion.

/// Rank-list fusion strategies for hybrid search.
pub mod hybrid;

pub use hybrid::{linear_fusion, rrf_fusion, FusionMethod};

/// A ranked search result mapped back to its external ID.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    /// Client-chosen external ID.
    pub external_id: String,
    /// Internal ID, useful for follow-up lookups.
    pub id: crate::types::IntId,
    /// Similarity (dense), accumulated term score (sparse), or fused score
    /// (hybrid). Higher is better in every case.
    pub score: f32,
}
