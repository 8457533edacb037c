//! Hierarchical Navigable Small World (HNSW) approximate nearest neighbor
//! index over quantized byte vectors.
//!
//! The graph never sees floats, external IDs, or filter JSON: its whole
//! contract is the encoded byte vector from the space plus a predicate
//! callback applied at the base layer. Storage uses a Struct-of-Arrays
//! layout with one contiguous arena for vector bytes and per-slot arrays for
//! neighbor lists, layer assignments, and tombstones. Slots are addressed by
//! the mapper-assigned internal ID, so deleted slots can be re-linked in
//! place when an ID is recycled.

/// Graph structure, configuration, capacity accounting, and snapshots.
pub mod graph;
/// Insertion with bidirectional links and heuristic neighbor pruning.
pub mod insert;
/// Layered search with filter predicate, plus the brute-force sibling.
pub mod search;
/// Generation-based visited set for graph traversal.
pub mod visited;

pub use graph::{HnswConfig, HnswGraph};
pub use search::brute_force_search;
