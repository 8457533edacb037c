//! # quantadb-core
//!
//! Embeddable storage and retrieval core for a hybrid vector search
//! database: dense approximate-nearest-neighbor search over quantized
//! vectors (HNSW), sparse top-k retrieval with Block-Max WAND, categorical
//! and numeric filtering, crash-safe external↔internal ID mapping, and a
//! shared index metadata catalog.
//!
//! This is the synchronous core crate with no async or server
//! dependencies — suitable for embedding directly in Rust or behind any
//! RPC surface.

/// Global configuration constants and environment knobs.
pub mod config;
/// Crate-wide error type and `Result` alias.
pub mod error;
/// Filter facade with bitmap and numeric secondary indices.
pub mod filter;
/// HNSW approximate nearest neighbor graph over quantized byte vectors.
pub mod hnsw;
/// The index engine binding every subsystem together.
pub mod index;
/// Quantizer dispatch: byte encodings and distance kernels.
pub mod quantization;
/// Search primitives: ranked hits and hybrid fusion.
pub mod search;
/// Metric × quantization-level binding.
pub mod space;
/// Sparse vectors, the BMW index, and sparse storage.
pub mod sparse;
/// Key-value environments, ID mapper + WAL, metadata catalog.
pub mod storage;
/// Internal ID width configuration and shared aliases.
pub mod types;

pub use error::{Error, Result};
pub use index::{IndexOptions, VectorIndex, VectorRecord};
pub use quantization::QuantLevel;
pub use search::{FusionMethod, SearchHit};
pub use space::{Metric, Space};
pub use sparse::SparseVector;
pub use storage::meta::{IndexMetadata, MetadataCatalog};
pub use types::{Bitmap, IntId};
