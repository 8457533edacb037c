//! Sparse retrieval: packed sparse vectors, the Block-Max WAND index, and
//! the transactional storage that binds them.

/// Block-Max WAND posting blocks and top-k search.
pub mod bmw;
/// Docs table + BMW index behind single transactions.
pub mod storage;
/// Sparse vector type and wire format.
pub mod vector;

pub use bmw::BmwIndex;
pub use storage::SparseStorage;
pub use vector::SparseVector;
