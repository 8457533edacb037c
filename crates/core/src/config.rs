//! Global configuration constants and environment knobs.
//!
//! All tuning parameters and input validation limits live here as
//! compile-time constants. The per-subsystem key-value cache budgets are the
//! only runtime knobs, read once from `QDB_*_MAP_BITS` environment variables
//! when an environment is opened.

/// Default number of bidirectional links per HNSW node.
///
/// Higher values improve recall but increase memory and build time.
/// Typical range: 8–64.
pub const HNSW_DEFAULT_M: usize = 16;

/// Default ef parameter during HNSW index construction.
pub const HNSW_DEFAULT_EF_CONSTRUCTION: usize = 200;

/// Default ef parameter during HNSW search.
///
/// Higher values improve recall at the cost of latency.
pub const HNSW_DEFAULT_EF_SEARCH: usize = 50;

/// Maximum number of layers in the HNSW graph.
pub const HNSW_DEFAULT_MAX_LAYERS: usize = 16;

/// Maximum allowed dense vector dimension.
pub const MAX_DIMENSION: usize = 4096;

/// Target capacity of a BMW posting block. Splits restore blocks to at most
/// this many entries.
pub const MAX_BLOCK_SIZE: usize = 128;

/// Entry count at which an over-filled BMW block is split at its midpoint.
/// Blocks may transiently hold up to this many entries (`MAX_BLOCK_SIZE`
/// plus 25% slack) between the triggering insert and the split.
pub const SPLIT_THRESHOLD: usize = 160;

/// Serialized size of a BMW block header.
pub const BLOCK_HEADER_SIZE: usize = 16;

/// A doc-id gap of this size or larger forces a new BMW block so that the
/// preceding block keeps 16-bit doc diffs.
pub const BLOCK_GAP_LIMIT: u64 = 1 << 16;

/// Maximum entries per numeric bucket before a midpoint split.
pub const BUCKET_MAX_SIZE: usize = 512;

/// Reciprocal Rank Fusion constant `k` in `1 / (k + rank)`.
pub const RRF_K: f32 = 60.0;

/// Default log2 of the key-value cache budget per subsystem (64 MiB).
const DEFAULT_MAP_BITS: u32 = 26;

/// Largest accepted log2 cache budget (16 GiB); larger values are clamped.
const MAX_MAP_BITS: u32 = 34;

fn cache_bytes(var: &str) -> usize {
    let bits = std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(DEFAULT_MAP_BITS)
        .clamp(20, MAX_MAP_BITS);
    1usize << bits
}

/// Cache budget for the filter environment (`QDB_FILTER_MAP_BITS`).
pub fn filter_cache_bytes() -> usize {
    cache_bytes("QDB_FILTER_MAP_BITS")
}

/// Cache budget for the ID mapper environment (`QDB_IDMAP_MAP_BITS`).
pub fn id_mapper_cache_bytes() -> usize {
    cache_bytes("QDB_IDMAP_MAP_BITS")
}

/// Cache budget for the metadata catalog environment (`QDB_META_MAP_BITS`).
pub fn metadata_cache_bytes() -> usize {
    cache_bytes("QDB_META_MAP_BITS")
}

/// Cache budget for the sparse storage environment (`QDB_SPARSE_MAP_BITS`).
pub fn sparse_cache_bytes() -> usize {
    cache_bytes("QDB_SPARSE_MAP_BITS")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_cache_bytes() {
        // Unset variable falls back to the default budget.
        assert_eq!(cache_bytes("QDB_TEST_UNSET_MAP_BITS"), 1 << 26);
    }

    #[test]
    fn test_block_constants_consistent() {
        assert!(SPLIT_THRESHOLD > MAX_BLOCK_SIZE);
        assert_eq!(SPLIT_THRESHOLD, MAX_BLOCK_SIZE + MAX_BLOCK_SIZE / 4);
    }
}
