//! HNSW graph structure, configuration, and snapshot persistence.
//!
//! [`HnswGraph`] stores encoded vectors in a contiguous arena indexed by
//! internal ID. Capacity is fixed at construction (`max_elements`); inserts
//! past it fail with `Capacity`. Snapshots are bincode payloads with a CRC32
//! footer, written atomically via temp-file + rename.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config;
use crate::error::{Error, Result};
use crate::space::Space;
use crate::types::IntId;

/// Magic bytes preceding the CRC32 footer of a graph snapshot.
const SNAPSHOT_MAGIC: &[u8; 4] = b"QHG1";

/// Tuning parameters for graph construction and search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HnswConfig {
    /// Bidirectional links per node above layer 0.
    pub m: usize,
    /// Maximum links per node at layer 0 (typically `2 * m`).
    pub m_max0: usize,
    /// Candidate list size during construction.
    pub ef_construction: usize,
    /// Default candidate list size during search.
    pub ef_search: usize,
    /// Maximum number of layers.
    pub max_layers: usize,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            m: config::HNSW_DEFAULT_M,
            m_max0: config::HNSW_DEFAULT_M * 2,
            ef_construction: config::HNSW_DEFAULT_EF_CONSTRUCTION,
            ef_search: config::HNSW_DEFAULT_EF_SEARCH,
            max_layers: config::HNSW_DEFAULT_MAX_LAYERS,
        }
    }
}

/// Serializable graph state. Everything except the space binding, which is
/// re-supplied at load time.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct GraphState {
    pub config: HnswConfig,
    pub data_size: usize,
    pub max_elements: usize,
    /// Vector arena: `data_size` bytes per slot, contiguous.
    pub data: Vec<u8>,
    /// Slot holds a vector (live or tombstoned).
    pub occupied: Vec<bool>,
    /// Soft-delete flags; physical reclamation happens on re-link.
    pub deleted: Vec<bool>,
    pub layers: Vec<u8>,
    /// `[slot][layer][neighbor_ids]`
    pub neighbors: Vec<Vec<Vec<IntId>>>,
    pub entry_point: Option<IntId>,
    pub max_layer: usize,
}

/// HNSW proximity graph over encoded byte vectors.
pub struct HnswGraph {
    pub(crate) space: Space,
    pub(crate) state: GraphState,
}

impl std::fmt::Debug for HnswGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HnswGraph")
            .field("space", &self.space)
            .field("max_elements", &self.state.max_elements)
            .field("len", &self.len())
            .finish()
    }
}

impl HnswGraph {
    /// Create an empty graph bound to `space`, holding at most
    /// `max_elements` slots.
    pub fn new(space: Space, max_elements: usize) -> Self {
        Self::with_config(space, max_elements, HnswConfig::default())
    }

    /// Create an empty graph with explicit tuning parameters.
    pub fn with_config(space: Space, max_elements: usize, config: HnswConfig) -> Self {
        let data_size = space.data_size();
        Self {
            space,
            state: GraphState {
                config,
                data_size,
                max_elements,
                data: Vec::new(),
                occupied: Vec::new(),
                deleted: Vec::new(),
                layers: Vec::new(),
                neighbors: Vec::new(),
                entry_point: None,
                max_layer: 0,
            },
        }
    }

    pub fn config(&self) -> &HnswConfig {
        &self.state.config
    }

    pub fn space(&self) -> &Space {
        &self.space
    }

    pub fn capacity(&self) -> usize {
        self.state.max_elements
    }

    /// Number of live (occupied, non-deleted) nodes.
    pub fn len(&self) -> usize {
        self.state
            .occupied
            .iter()
            .zip(&self.state.deleted)
            .filter(|&(&o, &d)| o && !d)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slot holds a live vector.
    pub fn contains(&self, id: IntId) -> bool {
        let slot = id as usize;
        slot < self.state.occupied.len() && self.state.occupied[slot] && !self.state.deleted[slot]
    }

    #[inline]
    pub(crate) fn is_deleted(&self, id: IntId) -> bool {
        self.state.deleted[id as usize]
    }

    /// Encoded vector bytes for an occupied slot.
    #[inline]
    pub(crate) fn vector(&self, id: IntId) -> &[u8] {
        let start = id as usize * self.state.data_size;
        &self.state.data[start..start + self.state.data_size]
    }

    /// Grow arenas so `id` has a slot, enforcing `max_elements`.
    pub(crate) fn ensure_slot(&mut self, id: IntId) -> Result<()> {
        let slot = id as usize;
        if slot >= self.state.max_elements {
            return Err(Error::Capacity(format!(
                "graph is full: id {id} exceeds max_elements {}",
                self.state.max_elements
            )));
        }
        if slot >= self.state.occupied.len() {
            let new_len = slot + 1;
            self.state.data.resize(new_len * self.state.data_size, 0);
            self.state.occupied.resize(new_len, false);
            self.state.deleted.resize(new_len, false);
            self.state.layers.resize(new_len, 0);
            self.state.neighbors.resize(new_len, Vec::new());
        }
        Ok(())
    }

    /// Draw a layer for a new node from the exponential distribution.
    pub(crate) fn random_level(&self) -> usize {
        let ml = 1.0 / (self.state.config.m as f64).ln();
        let r: f64 = rand::random();
        let level = (-r.ln() * ml).floor() as usize;
        level.min(self.state.config.max_layers - 1)
    }

    /// Soft-delete a point. Physical space is reclaimed when the slot is
    /// re-linked for a recycled ID. Idempotent on already-deleted points.
    pub fn remove_point(&mut self, id: IntId) -> Result<()> {
        let slot = id as usize;
        if slot >= self.state.occupied.len() || !self.state.occupied[slot] {
            return Err(Error::NotFound(format!("graph point {id}")));
        }
        self.state.deleted[slot] = true;
        Ok(())
    }

    /// Persist the graph to `path` as `[bincode][magic][CRC32 BE]`,
    /// written atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        let payload = bincode::serialize(&self.state)
            .map_err(|e| Error::Internal(format!("graph serialization failed: {e}")))?;
        let crc = crc32fast::hash(&payload);

        let mut out = Vec::with_capacity(payload.len() + 8);
        out.extend_from_slice(&payload);
        out.extend_from_slice(SNAPSHOT_MAGIC);
        out.extend_from_slice(&crc.to_be_bytes());

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &out)?;
        fs::rename(&tmp, path)?;
        tracing::info!(path = %path.display(), bytes = payload.len(), "saved graph snapshot");
        Ok(())
    }

    /// Load a snapshot, verify its checksum, and re-bind it to `space`.
    pub fn load(path: &Path, space: Space) -> Result<Self> {
        let raw = fs::read(path)?;
        if raw.len() < 8 || &raw[raw.len() - 8..raw.len() - 4] != SNAPSHOT_MAGIC {
            return Err(Error::Corruption(format!(
                "graph snapshot {} has no checksum footer",
                path.display()
            )));
        }
        let payload = &raw[..raw.len() - 8];
        let stored = u32::from_be_bytes([
            raw[raw.len() - 4],
            raw[raw.len() - 3],
            raw[raw.len() - 2],
            raw[raw.len() - 1],
        ]);
        let computed = crc32fast::hash(payload);
        if stored != computed {
            return Err(Error::Corruption(format!(
                "graph snapshot CRC32 mismatch: stored {stored:#010x}, computed {computed:#010x}"
            )));
        }

        let state: GraphState = bincode::deserialize(payload)
            .map_err(|e| Error::Corruption(format!("graph snapshot decode failed: {e}")))?;
        validate(&state)?;
        if state.data_size != space.data_size() {
            return Err(Error::InvalidArgument(format!(
                "snapshot data size {} does not match space data size {}",
                state.data_size,
                space.data_size()
            )));
        }
        tracing::info!(path = %path.display(), slots = state.occupied.len(), "loaded graph snapshot");
        Ok(Self { space, state })
    }
}

/// Consistency checks applied after deserialization.
fn validate(state: &GraphState) -> Result<()> {
    let slots = state.occupied.len();
    let check = |name: &str, len: usize| -> Result<()> {
        if len != slots {
            return Err(Error::Corruption(format!(
                "{name} length {len} != slot count {slots}"
            )));
        }
        Ok(())
    };
    check("deleted", state.deleted.len())?;
    check("layers", state.layers.len())?;
    check("neighbors", state.neighbors.len())?;
    if state.data.len() != slots * state.data_size {
        return Err(Error::Corruption(format!(
            "data arena length {} != slots({slots}) * data_size({})",
            state.data.len(),
            state.data_size
        )));
    }
    if slots > state.max_elements {
        return Err(Error::Corruption(format!(
            "slot count {slots} exceeds max_elements {}",
            state.max_elements
        )));
    }
    if let Some(ep) = state.entry_point {
        if ep as usize >= slots || !state.occupied[ep as usize] {
            return Err(Error::Corruption(format!("entry point {ep} out of bounds")));
        }
    }
    for (slot, per_layer) in state.neighbors.iter().enumerate() {
        for (layer, list) in per_layer.iter().enumerate() {
            for &n in list {
                if n as usize >= slots || !state.occupied[n as usize] {
                    return Err(Error::Corruption(format!(
                        "neighbor {n} out of bounds at slot {slot} layer {layer}"
                    )));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantization::QuantLevel;
    use crate::space::Metric;

    fn small_space() -> Space {
        Space::new(Metric::L2, 4, QuantLevel::F32).unwrap()
    }

    #[test]
    fn test_new_empty() {
        let g = HnswGraph::new(small_space(), 100);
        assert!(g.is_empty());
        assert_eq!(g.capacity(), 100);
        assert!(g.state.entry_point.is_none());
    }

    #[test]
    fn test_capacity_enforced() {
        let mut g = HnswGraph::new(small_space(), 4);
        assert!(g.ensure_slot(3).is_ok());
        let err = g.ensure_slot(4).unwrap_err();
        assert!(matches!(err, Error::Capacity(_)));
    }

    #[test]
    fn test_remove_point_missing() {
        let mut g = HnswGraph::new(small_space(), 8);
        assert!(matches!(g.remove_point(3), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_random_level_bounded() {
        let g = HnswGraph::new(small_space(), 8);
        for _ in 0..200 {
            assert!(g.random_level() < g.config().max_layers);
        }
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.qhg");
        let space = small_space();
        let mut g = HnswGraph::new(space.clone(), 16);
        let v = space.quantize(&[1.0, 0.0, 0.0, 0.0]).unwrap();
        g.add_point(&v, 1, false).unwrap();
        g.save(&path).unwrap();

        let loaded = HnswGraph::load(&path, space).unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains(1));
    }

    #[test]
    fn test_load_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.qhg");
        let space = small_space();
        let g = HnswGraph::new(space.clone(), 16);
        g.save(&path).unwrap();

        let mut raw = std::fs::read(&path).unwrap();
        let mid = raw.len() / 2;
        raw[mid] ^= 0xFF;
        std::fs::write(&path, &raw).unwrap();

        assert!(matches!(
            HnswGraph::load(&path, space),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_load_rejects_wrong_space() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.qhg");
        let g = HnswGraph::new(small_space(), 16);
        g.save(&path).unwrap();

        let other = Space::new(Metric::L2, 8, QuantLevel::F32).unwrap();
        assert!(HnswGraph::load(&path, other).is_err());
    }
}
