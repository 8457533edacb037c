//! The index engine: one logical collection serving dense ANN, sparse
//! top-k, and hybrid queries.
//!
//! A [`VectorIndex`] binds the space, the HNSW graph, sparse storage, the
//! filter layer, and the ID mapper (with its WAL). Writes follow one
//! contract: allocate internal IDs, quantize dense vectors into the graph,
//! store sparse vectors, ingest filter fields, then refresh the catalog
//! count. Reads mirror it: the filter narrows candidates, graph or BMW
//! ranks internal IDs, and the mapper resolves them back to external
//! strings.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::hnsw::{HnswConfig, HnswGraph};
use crate::quantization::QuantLevel;
use crate::search::hybrid::{linear_fusion, rrf_fusion, FusionMethod};
use crate::search::SearchHit;
use crate::space::{Metric, Space};
use crate::sparse::{SparseStorage, SparseVector};
use crate::storage::id_mapper::IdMapper;
use crate::storage::meta::MetadataCatalog;
use crate::storage::wal::{WalOp, WalRecord};
use crate::types::{encode_id, Bitmap, IntId};

/// Caller-supplied metadata and filter payload, kept beside the ID mapping.
const PAYLOAD_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("payloads");

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredPayload {
    meta: Vec<u8>,
    filter: Option<String>,
}

/// Construction parameters for an index.
#[derive(Debug, Clone)]
pub struct IndexOptions {
    pub dim: usize,
    pub metric: Metric,
    pub quant_level: QuantLevel,
    pub max_elements: usize,
    pub hnsw: HnswConfig,
}

impl IndexOptions {
    /// Sensible defaults for a `dim`-dimensional collection: cosine metric,
    /// int8 quantization, one-million-point capacity.
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            metric: Metric::Cosine,
            quant_level: QuantLevel::Int8,
            max_elements: 1 << 20,
            hnsw: HnswConfig::default(),
        }
    }
}

/// One write-batch entry.
#[derive(Debug, Clone, Default)]
pub struct VectorRecord {
    pub external_id: String,
    pub meta: Vec<u8>,
    pub filter: Option<Value>,
    pub dense: Option<Vec<f32>>,
    pub sparse: Option<SparseVector>,
}

impl VectorRecord {
    pub fn new(external_id: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            ..Self::default()
        }
    }

    pub fn with_dense(mut self, vector: Vec<f32>) -> Self {
        self.dense = Some(vector);
        self
    }

    pub fn with_sparse(mut self, vector: SparseVector) -> Self {
        self.sparse = Some(vector);
        self
    }

    pub fn with_filter(mut self, filter: Value) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_meta(mut self, meta: Vec<u8>) -> Self {
        self.meta = meta;
        self
    }
}

/// One logical collection bound to its on-disk environments.
pub struct VectorIndex {
    space: Space,
    graph: RwLock<HnswGraph>,
    sparse: SparseStorage,
    filter: Filter,
    mapper: IdMapper,
    dir: PathBuf,
    catalog: Option<(Arc<MetadataCatalog>, String)>,
}

impl VectorIndex {
    /// Open (or create) an index under `dir` and run WAL recovery.
    pub fn open(dir: &Path, options: IndexOptions) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let space = Space::new(options.metric, options.dim, options.quant_level)?;

        let mapper = IdMapper::open(&dir.join("ids"))?;
        {
            let txn = mapper.database().begin_write()?;
            {
                txn.open_table(PAYLOAD_TABLE)?;
            }
            txn.commit()?;
        }

        let graph_path = dir.join("graph.qhg");
        let graph = if graph_path.exists() {
            HnswGraph::load(&graph_path, space.clone())?
        } else {
            HnswGraph::with_config(space.clone(), options.max_elements, options.hnsw.clone())
        };

        let sparse = SparseStorage::open(&dir.join("sparse"))?;
        let filter = Filter::open(&dir.join("filter"))?;

        let index = Self {
            space,
            graph: RwLock::new(graph),
            sparse,
            filter,
            mapper,
            dir: dir.to_path_buf(),
            catalog: None,
        };
        let report = index.mapper.recover()?;
        if report.records > 0 {
            tracing::info!(
                records = report.records,
                reclaimed = report.reclaimed,
                "replayed write-ahead log at startup"
            );
        }
        Ok(index)
    }

    /// Attach the shared catalog; element counts are pushed after writes.
    pub fn with_catalog(mut self, catalog: Arc<MetadataCatalog>, index_id: String) -> Self {
        self.catalog = Some((catalog, index_id));
        self
    }

    pub fn space(&self) -> &Space {
        &self.space
    }

    pub fn sparse(&self) -> &SparseStorage {
        &self.sparse
    }

    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    pub fn mapper(&self) -> &IdMapper {
        &self.mapper
    }

    /// Number of live external IDs.
    pub fn len(&self) -> Result<u64> {
        self.mapper.count()
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Ingest a batch of records, returning the internal ID per input.
    ///
    /// Per record: the ID is allocated (or resolved) through the mapper,
    /// the dense vector is quantized into the graph, the sparse vector
    /// lands in sparse storage, and filter fields are ingested best-effort.
    /// A graph-insert failure rolls back that record's fresh mapping and
    /// recycles its ID; earlier records in the batch stay applied.
    pub fn add_batch(&self, records: &[VectorRecord], reuse_deleted: bool) -> Result<Vec<IntId>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        for record in records {
            if let Some(dense) = &record.dense {
                if dense.len() != self.space.dim() {
                    return Err(Error::InvalidArgument(format!(
                        "record '{}' has dimension {}, index expects {}",
                        record.external_id,
                        dense.len(),
                        self.space.dim()
                    )));
                }
            }
        }

        // Which externals already exist decides update vs insert handling.
        let mut pre_existing = Vec::with_capacity(records.len());
        for record in records {
            pre_existing.push(self.mapper.get_id(&record.external_id)?.is_some());
        }

        let externals: Vec<String> = records.iter().map(|r| r.external_id.clone()).collect();
        let assigned = self.mapper.create_ids_batch(&externals, reuse_deleted)?;

        // Updates are logged so recovery knows these IDs were touched.
        let update_records: Vec<WalRecord> = assigned
            .iter()
            .zip(&pre_existing)
            .filter(|&(_, &existing)| existing)
            .map(|(&(id, _), _)| WalRecord {
                op: WalOp::Update,
                id,
            })
            .collect();
        self.mapper.wal().append(&update_records)?;

        // Old filter entries of updated records come out before re-ingest.
        for i in 0..records.len() {
            if !pre_existing[i] {
                continue;
            }
            let id = assigned[i].0;
            if let Some(old) = self.read_payload(id)? {
                if let Some(raw) = old.filter {
                    match serde_json::from_str::<Value>(&raw) {
                        Ok(parsed) => {
                            if let Err(e) = self.filter.remove_filters_from_json(id, &parsed) {
                                tracing::warn!(id = id as u64, error = %e, "stale filter removal failed");
                            }
                        }
                        Err(e) => {
                            tracing::warn!(id = id as u64, error = %e, "stored filter unparsable")
                        }
                    }
                }
            }
        }

        // Dense vectors into the graph.
        {
            let mut graph = self.graph.write();
            for (i, record) in records.iter().enumerate() {
                let Some(dense) = &record.dense else {
                    continue;
                };
                let (id, is_new) = assigned[i];
                let bytes = self.space.quantize(dense)?;
                if let Err(e) = graph.add_point(&bytes, id, !is_new) {
                    drop(graph);
                    if !pre_existing[i] {
                        // Fresh mapping: undo it and recycle the ID.
                        if let Err(cleanup) = self
                            .mapper
                            .delete_points(std::slice::from_ref(&record.external_id))
                        {
                            tracing::error!(
                                id = id as u64,
                                error = %cleanup,
                                "failed to reclaim id after graph insert failure"
                            );
                        }
                    }
                    return Err(e);
                }
            }
        }

        // Sparse vectors: fresh IDs batch in, updates replace postings.
        let mut fresh_sparse: Vec<(IntId, SparseVector)> = Vec::new();
        for (i, record) in records.iter().enumerate() {
            let Some(vector) = &record.sparse else {
                continue;
            };
            let id = assigned[i].0;
            if pre_existing[i] {
                self.sparse.update(id, vector)?;
            } else {
                fresh_sparse.push((id, vector.clone()));
            }
        }
        self.sparse.batch_store(&fresh_sparse)?;

        // Filter ingest is best-effort per field.
        let filter_items: Vec<(IntId, Value)> = records
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.filter.clone().map(|f| (assigned[i].0, f)))
            .collect();
        self.filter.add_filters_batch(&filter_items)?;

        self.write_payloads(records, &assigned)?;
        self.update_catalog_count();
        Ok(assigned.into_iter().map(|(id, _)| id).collect())
    }

    /// Convenience wrapper for a single record.
    pub fn add(&self, record: VectorRecord, reuse_deleted: bool) -> Result<IntId> {
        let ids = self.add_batch(std::slice::from_ref(&record), reuse_deleted)?;
        ids.into_iter()
            .next()
            .ok_or_else(|| Error::Internal("batch of one returned no id".into()))
    }

    /// Delete by external IDs; missing entries yield `0`.
    pub fn delete(&self, external_ids: &[String]) -> Result<Vec<IntId>> {
        let ids = self.mapper.delete_points(external_ids)?;
        for &id in ids.iter().filter(|&&id| id != 0) {
            {
                let mut graph = self.graph.write();
                if let Err(e) = graph.remove_point(id) {
                    tracing::debug!(id = id as u64, error = %e, "no dense point to remove");
                }
            }
            self.sparse.delete(id)?;
            if let Some(payload) = self.take_payload(id)? {
                if let Some(raw) = payload.filter {
                    match serde_json::from_str::<Value>(&raw) {
                        Ok(parsed) => {
                            if let Err(e) = self.filter.remove_filters_from_json(id, &parsed) {
                                tracing::warn!(id = id as u64, error = %e, "filter removal failed");
                            }
                        }
                        Err(e) => {
                            tracing::warn!(id = id as u64, error = %e, "stored filter unparsable")
                        }
                    }
                }
            }
        }
        self.update_catalog_count();
        Ok(ids)
    }

    /// Dense ANN search; `filter` narrows candidates before ranking.
    /// Scores are similarities (higher is better).
    pub fn search_dense(
        &self,
        query: &[f32],
        k: usize,
        ef: Option<usize>,
        filter: Option<&Value>,
    ) -> Result<Vec<SearchHit>> {
        let results = self.dense_candidates(query, k, ef, filter)?;
        self.to_hits(
            results
                .into_iter()
                .map(|(dist, id)| (id, self.space.similarity_from_distance(dist)))
                .collect(),
        )
    }

    /// Sparse top-k search through the BMW index.
    pub fn search_sparse(&self, query: &SparseVector, k: usize) -> Result<Vec<SearchHit>> {
        let results = self.sparse.search(query, k)?;
        self.to_hits(results)
    }

    /// Hybrid search: dense and sparse ranked lists fused into one.
    ///
    /// `alpha` weights the dense side under linear fusion and is ignored by
    /// RRF. The filter pre-narrows the dense side and post-filters the
    /// sparse side.
    #[allow(clippy::too_many_arguments)]
    pub fn search_hybrid(
        &self,
        dense_query: Option<&[f32]>,
        sparse_query: Option<&SparseVector>,
        k: usize,
        alpha: f32,
        method: FusionMethod,
        filter: Option<&Value>,
    ) -> Result<Vec<SearchHit>> {
        let dense_list: Vec<(IntId, f32)> = match dense_query {
            Some(query) => self
                .dense_candidates(query, k, None, filter)?
                .into_iter()
                .map(|(dist, id)| (id, self.space.similarity_from_distance(dist)))
                .collect(),
            None => Vec::new(),
        };

        let bitmap = self.filter_bitmap(filter)?;
        let sparse_list: Vec<(IntId, f32)> = match sparse_query {
            Some(query) => self
                .sparse
                .search(query, k)?
                .into_iter()
                .filter(|&(id, _)| bitmap.as_ref().map_or(true, |bm| bm.contains(id)))
                .collect(),
            None => Vec::new(),
        };

        let fused = match method {
            FusionMethod::Rrf => rrf_fusion(&dense_list, &sparse_list, k),
            FusionMethod::Linear => linear_fusion(&dense_list, &sparse_list, alpha, k),
        };
        self.to_hits(fused)
    }

    /// Caller metadata blob stored with a record.
    pub fn get_meta(&self, external_id: &str) -> Result<Option<Vec<u8>>> {
        let Some(id) = self.mapper.get_id(external_id)? else {
            return Ok(None);
        };
        Ok(self.read_payload(id)?.map(|p| p.meta))
    }

    /// Stored sparse vector for an external ID.
    pub fn get_sparse(&self, external_id: &str) -> Result<Option<SparseVector>> {
        let Some(id) = self.mapper.get_id(external_id)? else {
            return Ok(None);
        };
        self.sparse.get(id)
    }

    pub fn contains(&self, external_id: &str) -> Result<bool> {
        Ok(self.mapper.get_id(external_id)?.is_some())
    }

    /// Persist the graph snapshot next to the environments.
    pub fn snapshot(&self) -> Result<()> {
        self.graph.read().save(&self.dir.join("graph.qhg"))
    }

    fn filter_bitmap(&self, filter: Option<&Value>) -> Result<Option<Bitmap>> {
        match filter {
            Some(f) => Ok(Some(self.filter.compute_filter_bitmap(f)?)),
            None => Ok(None),
        }
    }

    fn dense_candidates(
        &self,
        query: &[f32],
        k: usize,
        ef: Option<usize>,
        filter: Option<&Value>,
    ) -> Result<Vec<(f32, IntId)>> {
        let bitmap = self.filter_bitmap(filter)?;
        let encoded = self.space.quantize(query)?;
        let graph = self.graph.read();
        let ef = ef.unwrap_or(graph.config().ef_search);
        let results = match &bitmap {
            Some(bm) => graph.search_knn(&encoded, k, ef, &|id| bm.contains(id)),
            None => graph.search_knn(&encoded, k, ef, &|_| true),
        };
        Ok(results)
    }

    fn to_hits(&self, scored: Vec<(IntId, f32)>) -> Result<Vec<SearchHit>> {
        let ids: Vec<IntId> = scored.iter().map(|&(id, _)| id).collect();
        let externals = self.mapper.resolve_externals(&ids)?;
        let mut hits = Vec::with_capacity(scored.len());
        for ((id, score), external) in scored.into_iter().zip(externals) {
            match external {
                Some(external_id) => hits.push(SearchHit {
                    external_id,
                    id,
                    score,
                }),
                None => tracing::warn!(id = id as u64, "ranked id has no external mapping"),
            }
        }
        Ok(hits)
    }

    fn write_payloads(&self, records: &[VectorRecord], assigned: &[(IntId, bool)]) -> Result<()> {
        let txn = self.mapper.database().begin_write()?;
        {
            let mut table = txn.open_table(PAYLOAD_TABLE)?;
            for (record, &(id, _)) in records.iter().zip(assigned) {
                let payload = StoredPayload {
                    meta: record.meta.clone(),
                    filter: record.filter.as_ref().map(|f| f.to_string()),
                };
                let encoded = bincode::serialize(&payload)
                    .map_err(|e| Error::Internal(format!("payload serialization failed: {e}")))?;
                table.insert(encode_id(id).as_slice(), encoded.as_slice())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    fn read_payload(&self, id: IntId) -> Result<Option<StoredPayload>> {
        let txn = self.mapper.database().begin_read()?;
        let table = txn.open_table(PAYLOAD_TABLE)?;
        match table.get(encode_id(id).as_slice())? {
            Some(guard) => Ok(Some(bincode::deserialize(guard.value()).map_err(|e| {
                Error::Corruption(format!("payload record decode failed: {e}"))
            })?)),
            None => Ok(None),
        }
    }

    fn take_payload(&self, id: IntId) -> Result<Option<StoredPayload>> {
        let txn = self.mapper.database().begin_write()?;
        let payload = {
            let mut table = txn.open_table(PAYLOAD_TABLE)?;
            let removed = match table.remove(encode_id(id).as_slice())? {
                Some(guard) => Some(bincode::deserialize(guard.value()).map_err(|e| {
                    Error::Corruption(format!("payload record decode failed: {e}"))
                })?),
                None => None,
            };
            removed
        };
        txn.commit()?;
        Ok(payload)
    }

    fn update_catalog_count(&self) {
        let Some((catalog, index_id)) = &self.catalog else {
            return;
        };
        match self.mapper.count() {
            Ok(count) => {
                if let Err(e) = catalog.update_element_count(index_id, count) {
                    tracing::warn!(index = %index_id, error = %e, "catalog count update failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "mapping count unavailable"),
        }
    }
}
