//! Block-Max WAND (BMW) index over quantized posting blocks.
//!
//! Postings for a term are cut into blocks keyed by `(term_id,
//! start_doc_id)`. Each block stores doc-id diffs against its start (16, 32,
//! or 64 bits wide, the narrowest that fits) and values quantized to u8
//! against the block's max value. The per-term `BlockIdx` list — start doc
//! id plus block max — is held in memory for the hot path and mirrored to
//! the `term_index` table.
//!
//! Search is document-at-a-time WAND: iterators stay sorted by current doc
//! id, the pivot is the first position where the cumulative upper bound
//! beats the running threshold, and blocks whose max contribution cannot
//! reach the threshold are skipped wholesale. Deletes tombstone values to
//! zero in place; [`BmwIndex::compact_term`] physically drops tombstones as
//! a maintenance pass.

use std::collections::HashMap;
use std::sync::Arc;

use ordered_float::OrderedFloat;
use parking_lot::RwLock;
use redb::{Database, ReadableTable, Table, TableDefinition, WriteTransaction};

use crate::config;
use crate::error::{Error, Result};
use crate::sparse::vector::SparseVector;
use crate::types::{decode_id, encode_id, IntId, EXHAUSTED, ID_BYTES};

const TERM_BLOCKS_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("term_blocks");
const TERM_INDEX_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("term_index");

const BLOCK_VERSION: u8 = 3;

/// Per-block entry of a term's in-memory (and mirrored) block list.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockIdx {
    pub start_doc_id: IntId,
    pub block_max_value: f32,
}

/// In-memory form of one posting entry while a block is being edited.
#[derive(Debug, Clone, Copy)]
struct BlockEntry {
    doc_diff: IntId,
    value: f32,
}

/// Fixed 16-byte packed block header.
#[derive(Debug, Clone, Copy)]
struct BlockHeader {
    diff_bits: u8,
    n: u16,
    live_count: u16,
    block_max_value: f32,
}

impl BlockHeader {
    fn encode(&self) -> [u8; config::BLOCK_HEADER_SIZE] {
        let mut buf = [0u8; config::BLOCK_HEADER_SIZE];
        buf[0] = BLOCK_VERSION;
        buf[1] = self.diff_bits;
        buf[2..4].copy_from_slice(&self.n.to_le_bytes());
        buf[4..6].copy_from_slice(&self.live_count.to_le_bytes());
        // bytes 6..8 explicit padding, 12..16 alignment pad, both zero
        buf[8..12].copy_from_slice(&self.block_max_value.to_le_bytes());
        buf
    }

    fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < config::BLOCK_HEADER_SIZE {
            return Err(Error::Corruption(format!(
                "block shorter than header: {} bytes",
                data.len()
            )));
        }
        if data[0] != BLOCK_VERSION {
            return Err(Error::Corruption(format!(
                "unsupported block version {}",
                data[0]
            )));
        }
        let diff_bits = data[1];
        let supported = diff_bits == 16 || diff_bits == 32 || (cfg!(feature = "wide-ids") && diff_bits == 64);
        if !supported {
            return Err(Error::Corruption(format!(
                "unsupported block diff width {diff_bits}"
            )));
        }
        Ok(Self {
            diff_bits,
            n: u16::from_le_bytes([data[2], data[3]]),
            live_count: u16::from_le_bytes([data[4], data[5]]),
            block_max_value: f32::from_le_bytes([data[8], data[9], data[10], data[11]]),
        })
    }
}

/// Per-block u8 quantization against the block max.
#[inline]
fn quantize_value(value: f32, block_max: f32) -> u8 {
    if block_max <= 1e-9 {
        return 0;
    }
    let scaled = (value / block_max) * 255.0;
    if scaled > 255.0 {
        255
    } else if scaled < 0.0 {
        0
    } else {
        scaled as u8
    }
}

#[inline]
fn dequantize_value(value: u8, block_max: f32) -> f32 {
    value as f32 * (1.0 / 255.0) * block_max
}

/// Pick the narrowest diff width that fits the largest doc diff.
fn choose_diff_bits(max_diff: IntId) -> u8 {
    let diff = max_diff as u64;
    if diff < 1 << 16 {
        return 16;
    }
    #[cfg(feature = "wide-ids")]
    if diff >= 1 << 32 {
        return 64;
    }
    32
}

/// Decoded doc-diff array, width preserved from disk.
#[derive(Debug)]
enum DiffArray {
    U16(Vec<u16>),
    U32(Vec<u32>),
    #[cfg(feature = "wide-ids")]
    U64(Vec<u64>),
}

/// Chunked scan for the first element at or after `target` in a sorted
/// slice, skipping whole chunks by their last element.
fn find_in<T: Copy + Ord>(arr: &[T], start: usize, target: T) -> usize {
    const CHUNK: usize = 16;
    let mut idx = start;
    while idx + CHUNK <= arr.len() {
        if arr[idx + CHUNK - 1] < target {
            idx += CHUNK;
            continue;
        }
        for (j, &v) in arr[idx..idx + CHUNK].iter().enumerate() {
            if v >= target {
                return idx + j;
            }
        }
        // The chunk's last element was >= target, so the scan above returned.
        return idx + CHUNK - 1;
    }
    while idx < arr.len() && arr[idx] < target {
        idx += 1;
    }
    idx
}

impl DiffArray {
    fn len(&self) -> usize {
        match self {
            DiffArray::U16(v) => v.len(),
            DiffArray::U32(v) => v.len(),
            #[cfg(feature = "wide-ids")]
            DiffArray::U64(v) => v.len(),
        }
    }

    #[inline]
    fn get(&self, i: usize) -> IntId {
        match self {
            DiffArray::U16(v) => v[i] as IntId,
            DiffArray::U32(v) => v[i] as IntId,
            #[cfg(feature = "wide-ids")]
            DiffArray::U64(v) => v[i] as IntId,
        }
    }

    /// First index at or after `start` whose diff is ≥ `target`, or `len`
    /// when the target exceeds every stored diff (including the case where
    /// it cannot be represented at this width at all).
    fn find_at_or_after(&self, start: usize, target: IntId) -> usize {
        match self {
            DiffArray::U16(v) => {
                if target > u16::MAX as IntId {
                    return v.len();
                }
                find_in(v, start, target as u16)
            }
            DiffArray::U32(v) => {
                #[cfg(feature = "wide-ids")]
                if target > u32::MAX as IntId {
                    return v.len();
                }
                find_in(v, start, target as u32)
            }
            #[cfg(feature = "wide-ids")]
            DiffArray::U64(v) => find_in(v, start, target),
        }
    }
}

/// Owned decode of one block's SoA arrays. Copied out of the read
/// transaction so no view outlives its snapshot.
#[derive(Debug)]
struct BlockData {
    diffs: DiffArray,
    values: Vec<u8>,
    block_max_value: f32,
}

/// Chunked scan for the first non-tombstone value at or after `start`.
fn find_next_live(values: &[u8], start: usize) -> usize {
    const CHUNK: usize = 32;
    let mut idx = start;
    while idx + CHUNK <= values.len() {
        let chunk = &values[idx..idx + CHUNK];
        let mut any = 0u8;
        for &v in chunk {
            any |= v;
        }
        if any != 0 {
            for (j, &v) in chunk.iter().enumerate() {
                if v != 0 {
                    return idx + j;
                }
            }
        }
        idx += CHUNK;
    }
    while idx < values.len() {
        if values[idx] != 0 {
            return idx;
        }
        idx += 1;
    }
    values.len()
}

fn term_key(term_id: u32) -> [u8; 4] {
    term_id.to_le_bytes()
}

fn block_key(term_id: u32, start_doc_id: IntId) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + ID_BYTES);
    key.extend_from_slice(&term_id.to_le_bytes());
    key.extend_from_slice(&encode_id(start_doc_id));
    key
}

fn encode_block_list(blocks: &[BlockIdx]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(blocks.len() * (ID_BYTES + 4));
    for b in blocks {
        buf.extend_from_slice(&encode_id(b.start_doc_id));
        buf.extend_from_slice(&b.block_max_value.to_le_bytes());
    }
    buf
}

fn decode_block_list(data: &[u8]) -> Result<Vec<BlockIdx>> {
    let entry = ID_BYTES + 4;
    if data.len() % entry != 0 {
        return Err(Error::Corruption(format!(
            "term index blob length {} not a multiple of {entry}",
            data.len()
        )));
    }
    let mut blocks = Vec::with_capacity(data.len() / entry);
    for chunk in data.chunks_exact(entry) {
        let start_doc_id = decode_id(chunk)?;
        let block_max_value = f32::from_le_bytes([
            chunk[ID_BYTES],
            chunk[ID_BYTES + 1],
            chunk[ID_BYTES + 2],
            chunk[ID_BYTES + 3],
        ]);
        blocks.push(BlockIdx {
            start_doc_id,
            block_max_value,
        });
    }
    Ok(blocks)
}

/// Serialize and store one block, recomputing its header stats. Returns the
/// block max written to the header.
fn save_block(
    table: &mut Table<'_, &'static [u8], &'static [u8]>,
    term_id: u32,
    start_doc_id: IntId,
    entries: &[BlockEntry],
) -> Result<f32> {
    let mut max_value = 0.0f32;
    let mut max_diff: IntId = 0;
    let mut live = 0u16;
    for e in entries {
        if e.value > max_value {
            max_value = e.value;
        }
        if e.doc_diff > max_diff {
            max_diff = e.doc_diff;
        }
        if e.value > 1e-9 {
            live += 1;
        }
    }

    let diff_bits = choose_diff_bits(max_diff);
    let header = BlockHeader {
        diff_bits,
        n: entries.len() as u16,
        live_count: live,
        block_max_value: max_value,
    };

    let diff_bytes = diff_bits as usize / 8;
    let mut buf =
        Vec::with_capacity(config::BLOCK_HEADER_SIZE + entries.len() * (diff_bytes + 1));
    buf.extend_from_slice(&header.encode());
    match diff_bits {
        16 => {
            for e in entries {
                buf.extend_from_slice(&(e.doc_diff as u16).to_le_bytes());
            }
        }
        32 => {
            for e in entries {
                buf.extend_from_slice(&(e.doc_diff as u32).to_le_bytes());
            }
        }
        _ => {
            for e in entries {
                buf.extend_from_slice(&(e.doc_diff as u64).to_le_bytes());
            }
        }
    }
    for e in entries {
        buf.push(quantize_value(e.value, max_value));
    }

    let key = block_key(term_id, start_doc_id);
    table.insert(key.as_slice(), buf.as_slice())?;
    Ok(max_value)
}

fn parse_block(data: &[u8]) -> Result<BlockData> {
    let header = BlockHeader::decode(data)?;
    let n = header.n as usize;
    let diff_bytes = header.diff_bits as usize / 8;
    let expected = config::BLOCK_HEADER_SIZE + n * (diff_bytes + 1);
    if data.len() != expected {
        return Err(Error::Corruption(format!(
            "block length {} does not match header (n={n}, diff_bits={})",
            data.len(),
            header.diff_bits
        )));
    }

    let body = &data[config::BLOCK_HEADER_SIZE..];
    let (diff_raw, value_raw) = body.split_at(n * diff_bytes);
    let diffs = match header.diff_bits {
        16 => DiffArray::U16(
            diff_raw
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect(),
        ),
        32 => DiffArray::U32(
            diff_raw
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        ),
        #[cfg(feature = "wide-ids")]
        64 => DiffArray::U64(
            diff_raw
                .chunks_exact(8)
                .map(|c| {
                    u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])
                })
                .collect(),
        ),
        other => {
            return Err(Error::Corruption(format!(
                "unsupported block diff width {other}"
            )))
        }
    };
    Ok(BlockData {
        diffs,
        values: value_raw.to_vec(),
        block_max_value: header.block_max_value,
    })
}

/// Load a block as an owned SoA copy, or `None` when it is not stored.
fn read_block_data<T: ReadableTable<&'static [u8], &'static [u8]>>(
    table: &T,
    term_id: u32,
    start_doc_id: IntId,
) -> Result<Option<BlockData>> {
    let key = block_key(term_id, start_doc_id);
    match table.get(key.as_slice())? {
        Some(guard) => Ok(Some(parse_block(guard.value())?)),
        None => Ok(None),
    }
}

/// Load a block as editable entries with dequantized values.
fn load_block_entries<T: ReadableTable<&'static [u8], &'static [u8]>>(
    table: &T,
    term_id: u32,
    start_doc_id: IntId,
) -> Result<Vec<BlockEntry>> {
    let Some(data) = read_block_data(table, term_id, start_doc_id)? else {
        return Err(Error::Corruption(format!(
            "block (term {term_id}, start {start_doc_id}) listed in index but missing"
        )));
    };
    let mut entries = Vec::with_capacity(data.values.len());
    for i in 0..data.values.len() {
        entries.push(BlockEntry {
            doc_diff: data.diffs.get(i),
            value: dequantize_value(data.values[i], data.block_max_value),
        });
    }
    Ok(entries)
}

/// Posting iterator over one term's blocks, with standard WAND semantics.
struct BlockIterator<'a> {
    term_id: u32,
    term_weight: f32,
    blocks: &'a [BlockIdx],
    block_pos: usize,
    data: Option<BlockData>,
    entry_pos: usize,
    current_doc_id: IntId,
    /// Dequantized stored value at the cursor; the score contribution is
    /// `current_value * term_weight`.
    current_value: f32,
}

type BlocksTable = redb::ReadOnlyTable<&'static [u8], &'static [u8]>;

impl<'a> BlockIterator<'a> {
    fn new(
        term_id: u32,
        term_weight: f32,
        blocks: &'a [BlockIdx],
        table: &BlocksTable,
    ) -> Result<Self> {
        let mut it = Self {
            term_id,
            term_weight,
            blocks,
            block_pos: 0,
            data: None,
            entry_pos: 0,
            current_doc_id: EXHAUSTED,
            current_value: 0.0,
        };
        it.load_block(table)?;
        it.advance_to_live(table)?;
        Ok(it)
    }

    fn load_block(&mut self, table: &BlocksTable) -> Result<()> {
        if self.block_pos >= self.blocks.len() {
            self.data = None;
            self.current_doc_id = EXHAUSTED;
            return Ok(());
        }
        let start = self.blocks[self.block_pos].start_doc_id;
        match read_block_data(table, self.term_id, start)? {
            Some(data) => {
                self.data = Some(data);
                self.entry_pos = 0;
                Ok(())
            }
            None => Err(Error::Corruption(format!(
                "block (term {}, start {start}) listed in index but missing",
                self.term_id
            ))),
        }
    }

    /// Move the cursor to the first live entry at or after `entry_pos`,
    /// crossing block boundaries lazily.
    fn advance_to_live(&mut self, table: &BlocksTable) -> Result<()> {
        loop {
            let Some(data) = &self.data else {
                self.current_doc_id = EXHAUSTED;
                return Ok(());
            };
            let next = find_next_live(&data.values, self.entry_pos);
            if next < data.values.len() {
                self.entry_pos = next;
                let start = self.blocks[self.block_pos].start_doc_id;
                self.current_doc_id = start + data.diffs.get(next);
                self.current_value = dequantize_value(data.values[next], data.block_max_value);
                return Ok(());
            }
            self.block_pos += 1;
            self.load_block(table)?;
        }
    }

    fn next(&mut self, table: &BlocksTable) -> Result<()> {
        self.entry_pos += 1;
        self.advance_to_live(table)
    }

    /// Advance to the first live entry with doc id ≥ `target`: skip whole
    /// blocks via the block list, then locate the entry within the landing
    /// block by a width-specialized scan.
    fn advance(&mut self, table: &BlocksTable, target: IntId) -> Result<()> {
        if self.current_doc_id >= target {
            return Ok(());
        }

        if self.block_pos + 1 < self.blocks.len()
            && self.blocks[self.block_pos + 1].start_doc_id <= target
        {
            let upper = self.blocks.partition_point(|b| b.start_doc_id <= target);
            self.block_pos = upper - 1;
            self.data = None;
            self.entry_pos = 0;
        }
        if self.data.is_none() {
            self.load_block(table)?;
        }
        let Some(data) = &self.data else {
            self.current_doc_id = EXHAUSTED;
            return Ok(());
        };

        let start = self.blocks[self.block_pos].start_doc_id;
        if target > start {
            self.entry_pos = data.diffs.find_at_or_after(self.entry_pos, target - start);
        }
        self.advance_to_live(table)
    }

    /// Best possible contribution from this iterator's current block.
    fn upper_bound(&self) -> f32 {
        if self.block_pos >= self.blocks.len() {
            return 0.0;
        }
        self.term_weight * self.blocks[self.block_pos].block_max_value
    }
}

/// Block-Max WAND index bound to a shared environment handle.
pub struct BmwIndex {
    db: Arc<Database>,
    /// Per-term block lists, mirrored to the `term_index` table.
    term_index: RwLock<HashMap<u32, Vec<BlockIdx>>>,
}

impl BmwIndex {
    /// Create tables and load the persisted term index.
    pub fn open(db: Arc<Database>) -> Result<Self> {
        let txn = db.begin_write()?;
        {
            txn.open_table(TERM_BLOCKS_TABLE)?;
            txn.open_table(TERM_INDEX_TABLE)?;
        }
        txn.commit()?;

        let mut term_index = HashMap::new();
        {
            let txn = db.begin_read()?;
            let table = txn.open_table(TERM_INDEX_TABLE)?;
            for entry in table.iter()? {
                let (key_guard, value_guard) = entry?;
                let key = key_guard.value();
                if key.len() != 4 {
                    tracing::warn!("skipping malformed term index key of {} bytes", key.len());
                    continue;
                }
                let term_id = u32::from_le_bytes([key[0], key[1], key[2], key[3]]);
                term_index.insert(term_id, decode_block_list(value_guard.value())?);
            }
        }
        Ok(Self {
            db,
            term_index: RwLock::new(term_index),
        })
    }

    /// Number of terms with at least one block.
    pub fn term_count(&self) -> usize {
        self.term_index.read().len()
    }

    /// Total number of posting blocks.
    pub fn block_count(&self) -> usize {
        self.term_index.read().values().map(Vec::len).sum()
    }

    /// Insert one document's postings inside the caller's transaction.
    pub fn add_document(
        &self,
        txn: &WriteTransaction,
        doc_id: IntId,
        vector: &SparseVector,
    ) -> Result<()> {
        self.add_documents_batch(txn, std::slice::from_ref(&(doc_id, vector.clone())))
    }

    /// Batch insert inside the caller's transaction.
    ///
    /// Updates are grouped per term and applied in ascending doc-id order so
    /// block accesses stay sequential; each term's block list snapshot is
    /// persisted once after its updates.
    pub fn add_documents_batch(
        &self,
        txn: &WriteTransaction,
        docs: &[(IntId, SparseVector)],
    ) -> Result<()> {
        if docs.is_empty() {
            return Ok(());
        }
        let mut index = self.term_index.write();

        let mut term_updates: HashMap<u32, Vec<(IntId, f32)>> = HashMap::new();
        for (doc_id, vector) in docs {
            for (i, &term) in vector.indices.iter().enumerate() {
                term_updates
                    .entry(term)
                    .or_default()
                    .push((*doc_id, vector.values[i]));
            }
        }

        let mut blocks_table = txn.open_table(TERM_BLOCKS_TABLE)?;
        let mut index_table = txn.open_table(TERM_INDEX_TABLE)?;
        for (term_id, mut updates) in term_updates {
            updates.sort_unstable_by_key(|&(doc_id, _)| doc_id);

            let mut blocks = index.get(&term_id).cloned().unwrap_or_default();
            for (doc_id, value) in updates {
                add_to_block(&mut blocks_table, &mut blocks, term_id, doc_id, value)?;
            }
            index_table.insert(term_key(term_id).as_slice(), encode_block_list(&blocks).as_slice())?;
            index.insert(term_id, blocks);
        }
        Ok(())
    }

    /// Tombstone one document's postings inside the caller's transaction.
    /// The block list keeps its cached max, which may now exceed the stored
    /// max; pruning stays sound because it only over-estimates.
    pub fn remove_document(
        &self,
        txn: &WriteTransaction,
        doc_id: IntId,
        vector: &SparseVector,
    ) -> Result<()> {
        let index = self.term_index.write();
        let mut blocks_table = txn.open_table(TERM_BLOCKS_TABLE)?;
        for &term_id in &vector.indices {
            let Some(blocks) = index.get(&term_id) else {
                continue;
            };
            let pos = blocks.partition_point(|b| b.start_doc_id <= doc_id);
            let Some(i) = pos.checked_sub(1) else {
                continue;
            };
            let start = blocks[i].start_doc_id;
            let mut entries = load_block_entries(&blocks_table, term_id, start)?;
            let doc_diff = doc_id - start;
            if let Ok(at) = entries.binary_search_by_key(&doc_diff, |e| e.doc_diff) {
                entries[at].value = 0.0;
                save_block(&mut blocks_table, term_id, start, &entries)?;
            }
        }
        Ok(())
    }

    /// Top-k retrieval with Block-Max WAND pruning.
    ///
    /// Deterministic for identical input; equal-score candidates keep the
    /// order in which they entered the heap.
    pub fn search(&self, query: &SparseVector, k: usize) -> Result<Vec<(IntId, f32)>> {
        if query.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let index = self.term_index.read();
        let txn = self.db.begin_read()?;
        let table = txn.open_table(TERM_BLOCKS_TABLE)?;

        let mut iterators: Vec<BlockIterator<'_>> = Vec::with_capacity(query.len());
        for (i, &term_id) in query.indices.iter().enumerate() {
            if let Some(blocks) = index.get(&term_id) {
                if !blocks.is_empty() {
                    iterators.push(BlockIterator::new(
                        term_id,
                        query.values[i],
                        blocks,
                        &table,
                    )?);
                }
            }
        }
        if iterators.is_empty() {
            return Ok(Vec::new());
        }

        let mut top_k: std::collections::BinaryHeap<std::cmp::Reverse<(OrderedFloat<f32>, IntId)>> =
            std::collections::BinaryHeap::with_capacity(k + 1);
        let mut threshold = 0.0f32;

        iterators.sort_by_key(|it| it.current_doc_id);
        loop {
            while iterators
                .last()
                .is_some_and(|it| it.current_doc_id == EXHAUSTED)
            {
                iterators.pop();
            }
            if iterators.is_empty() {
                break;
            }

            // Pivot: first position where the cumulative block-max upper
            // bound can beat the threshold.
            let mut upper_bound_sum = 0.0f32;
            let mut pivot = None;
            for (i, it) in iterators.iter().enumerate() {
                upper_bound_sum += it.upper_bound();
                if upper_bound_sum > threshold {
                    pivot = Some(i);
                    break;
                }
            }
            let Some(pivot) = pivot else {
                // No remaining document can beat the threshold.
                break;
            };
            let pivot_doc_id = iterators[pivot].current_doc_id;

            if iterators[0].current_doc_id == pivot_doc_id {
                // Scoring candidate: every aligned iterator contributes.
                let mut score = iterators[0].current_value * iterators[0].term_weight;
                iterators[0].next(&table)?;
                for it in iterators.iter_mut().skip(1) {
                    it.advance(&table, pivot_doc_id)?;
                    if it.current_doc_id == pivot_doc_id {
                        score += it.current_value * it.term_weight;
                        it.next(&table)?;
                    }
                }

                if top_k.len() < k {
                    top_k.push(std::cmp::Reverse((OrderedFloat(score), pivot_doc_id)));
                    if top_k.len() == k {
                        threshold = top_k
                            .peek()
                            .map_or(0.0, |std::cmp::Reverse((s, _))| s.0);
                    }
                } else if score > threshold {
                    top_k.pop();
                    top_k.push(std::cmp::Reverse((OrderedFloat(score), pivot_doc_id)));
                    threshold = top_k
                        .peek()
                        .map_or(0.0, |std::cmp::Reverse((s, _))| s.0);
                }
            } else {
                // Pivot is ahead: catch predecessors up to it.
                for it in iterators.iter_mut().take(pivot) {
                    it.advance(&table, pivot_doc_id)?;
                }
            }

            iterators.sort_by_key(|it| it.current_doc_id);
        }

        let results = top_k
            .into_sorted_vec()
            .into_iter()
            .map(|std::cmp::Reverse((score, doc_id))| (doc_id, score.0))
            .collect();
        Ok(results)
    }

    /// Maintenance pass: physically drop tombstoned entries for one term,
    /// deleting blocks (and the term) that end up empty. Never runs on the
    /// online write path.
    pub fn compact_term(&self, term_id: u32) -> Result<()> {
        let mut index = self.term_index.write();
        let Some(blocks) = index.get(&term_id).cloned() else {
            return Ok(());
        };

        let mut kept: Vec<BlockIdx> = Vec::with_capacity(blocks.len());
        let txn = self.db.begin_write()?;
        {
            let mut blocks_table = txn.open_table(TERM_BLOCKS_TABLE)?;
            let mut index_table = txn.open_table(TERM_INDEX_TABLE)?;
            for block in &blocks {
                let entries = load_block_entries(&blocks_table, term_id, block.start_doc_id)?;
                let live: Vec<BlockEntry> =
                    entries.into_iter().filter(|e| e.value > 1e-9).collect();
                if live.is_empty() {
                    blocks_table.remove(block_key(term_id, block.start_doc_id).as_slice())?;
                } else {
                    let max = save_block(&mut blocks_table, term_id, block.start_doc_id, &live)?;
                    kept.push(BlockIdx {
                        start_doc_id: block.start_doc_id,
                        block_max_value: max,
                    });
                }
            }
            if kept.is_empty() {
                index_table.remove(term_key(term_id).as_slice())?;
            } else {
                index_table
                    .insert(term_key(term_id).as_slice(), encode_block_list(&kept).as_slice())?;
            }
        }
        txn.commit()?;

        if kept.is_empty() {
            index.remove(&term_id);
        } else {
            index.insert(term_id, kept);
        }
        Ok(())
    }
}

/// Route one `(doc_id, value)` update into the right block, creating,
/// updating, or splitting as needed. `blocks` is the term's working block
/// list, mutated in place.
fn add_to_block(
    table: &mut Table<'_, &'static [u8], &'static [u8]>,
    blocks: &mut Vec<BlockIdx>,
    term_id: u32,
    doc_id: IntId,
    value: f32,
) -> Result<()> {
    let pos = blocks.partition_point(|b| b.start_doc_id <= doc_id);
    let new_block = match pos.checked_sub(1) {
        None => true,
        // A gap past the 16-bit window starts a new block so the old one
        // keeps narrow diffs.
        Some(i) => (doc_id - blocks[i].start_doc_id) as u64 >= config::BLOCK_GAP_LIMIT,
    };

    if new_block {
        let entries = [BlockEntry {
            doc_diff: 0,
            value,
        }];
        let max = save_block(table, term_id, doc_id, &entries)?;
        blocks.insert(
            pos,
            BlockIdx {
                start_doc_id: doc_id,
                block_max_value: max,
            },
        );
        return Ok(());
    }

    let i = pos - 1;
    let start = blocks[i].start_doc_id;
    let mut entries = load_block_entries(table, term_id, start)?;
    let doc_diff = doc_id - start;
    match entries.binary_search_by_key(&doc_diff, |e| e.doc_diff) {
        Ok(at) => entries[at].value = value,
        Err(at) => entries.insert(
            at,
            BlockEntry {
                doc_diff,
                value,
            },
        ),
    }

    if entries.len() > config::SPLIT_THRESHOLD {
        let mid = entries.len() / 2;
        let base = entries[mid].doc_diff;
        let new_start = start + base;
        let (lower, upper_raw) = entries.split_at(mid);
        let upper: Vec<BlockEntry> = upper_raw
            .iter()
            .map(|e| BlockEntry {
                doc_diff: e.doc_diff - base,
                value: e.value,
            })
            .collect();

        let lower_max = save_block(table, term_id, start, lower)?;
        let upper_max = save_block(table, term_id, new_start, &upper)?;
        blocks[i].block_max_value = lower_max;
        blocks.insert(
            i + 1,
            BlockIdx {
                start_doc_id: new_start,
                block_max_value: upper_max,
            },
        );
    } else {
        let max = save_block(table, term_id, start, &entries)?;
        if max > blocks[i].block_max_value {
            blocks[i].block_max_value = max;
        }
    }
    Ok(())
}
