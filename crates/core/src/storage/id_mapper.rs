//! External-string ↔ internal-integer ID mapping with crash-safe
//! allocation and ID recycling.
//!
//! The mapper owns one environment with three tables: `ext_to_int` (the
//! primary map), `int_to_ext` (the reverse map, maintained in the same
//! transactions so ranked results resolve back to external strings without
//! scanning), and `mapper_state` (`next_id` counter plus the pool of
//! recyclable deleted IDs). Every allocation is logged to the write-ahead
//! log *before* the mapping commits; startup recovery reconciles
//! allocations whose mapping never landed back into the pool.
//!
//! IDs start at 1; 0 is the "not found" sentinel in batch results.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};

use crate::config;
use crate::error::{Error, Result};
use crate::storage::open_database;
use crate::storage::wal::{WalOp, WalRecord, WriteAheadLog};
use crate::types::{decode_id, encode_id, IntId, ID_BYTES};

const EXT_TO_INT_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("ext_to_int");
const INT_TO_EXT_TABLE: TableDefinition<&[u8], &str> = TableDefinition::new("int_to_ext");
const STATE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("mapper_state");

const NEXT_ID_KEY: &str = "next_id";
const DELETED_IDS_KEY: &str = "deleted_ids";

/// Outcome of a WAL recovery pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Intact records replayed.
    pub records: usize,
    /// Allocations whose mapping never committed, returned to the pool.
    pub reclaimed: usize,
    /// Whether a truncated trailing record was dropped.
    pub truncated: bool,
}

fn decode_pool(data: &[u8]) -> Result<Vec<IntId>> {
    if data.len() % ID_BYTES != 0 {
        return Err(Error::Corruption(format!(
            "deleted-id pool length {} not a multiple of {ID_BYTES}",
            data.len()
        )));
    }
    data.chunks_exact(ID_BYTES).map(decode_id).collect()
}

fn encode_pool(ids: &[IntId]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(ids.len() * ID_BYTES);
    for &id in ids {
        buf.extend_from_slice(&encode_id(id));
    }
    buf
}

/// External ↔ internal ID mapper with WAL-backed allocation.
pub struct IdMapper {
    db: Arc<Database>,
    wal: WriteAheadLog,
    /// Guards `next_id` advancement; everything else relies on the store's
    /// own write serialization.
    next_id_lock: Mutex<()>,
}

impl IdMapper {
    /// Open the mapper environment and WAL under `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let db = open_database(&dir.join("ids.redb"), config::id_mapper_cache_bytes())?;
        let txn = db.begin_write()?;
        {
            txn.open_table(EXT_TO_INT_TABLE)?;
            txn.open_table(INT_TO_EXT_TABLE)?;
            let mut state = txn.open_table(STATE_TABLE)?;
            if state.get(NEXT_ID_KEY)?.is_none() {
                state.insert(NEXT_ID_KEY, encode_id(1).as_slice())?;
            }
        }
        txn.commit()?;

        let wal = WriteAheadLog::open(dir)?;
        Ok(Self {
            db,
            wal,
            next_id_lock: Mutex::new(()),
        })
    }

    /// Shared environment handle (the engine keeps its payload table here).
    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn wal(&self) -> &WriteAheadLog {
        &self.wal
    }

    /// Map a batch of external strings to internal IDs, in input order.
    ///
    /// Per input: an existing mapping returns `(old_id, false)`; a recycled
    /// ID returns `(id, false)` — it is written to the map but the graph
    /// must treat it as a replace, not a fresh insert; a fresh allocation
    /// returns `(id, true)`. Every allocated or reused ID is WAL-durable
    /// before the mapping commits. On a WAL failure the reserved IDs go
    /// back to the pool and the batch fails as a whole.
    pub fn create_ids_batch(
        &self,
        str_ids: &[String],
        reuse_deleted: bool,
    ) -> Result<Vec<(IntId, bool)>> {
        if str_ids.is_empty() {
            return Ok(Vec::new());
        }

        #[derive(Clone, Copy, Default)]
        struct Slot {
            id: IntId,
            needs_write: bool,
            reused: bool,
        }
        let mut slots = vec![Slot::default(); str_ids.len()];

        // Duplicates within the batch resolve to their first occurrence.
        let mut first_seen: HashMap<&str, usize> = HashMap::with_capacity(str_ids.len());
        let mut dup_of: Vec<Option<usize>> = vec![None; str_ids.len()];
        for (i, s) in str_ids.iter().enumerate() {
            match first_seen.get(s.as_str()) {
                Some(&j) => dup_of[i] = Some(j),
                None => {
                    first_seen.insert(s.as_str(), i);
                }
            }
        }

        {
            let txn = self.db.begin_read()?;
            let table = txn.open_table(EXT_TO_INT_TABLE)?;
            for (i, s) in str_ids.iter().enumerate() {
                if dup_of[i].is_some() {
                    continue;
                }
                match table.get(s.as_str())? {
                    Some(guard) => {
                        slots[i].id = decode_id(guard.value())?;
                    }
                    None => slots[i].needs_write = true,
                }
            }
        }

        let missing = slots.iter().filter(|s| s.needs_write).count();
        if missing > 0 {
            let recycled = if reuse_deleted {
                self.take_deleted_ids(missing)?
            } else {
                Vec::new()
            };
            {
                let mut pool = recycled.iter();
                for slot in slots.iter_mut().filter(|s| s.needs_write) {
                    match pool.next() {
                        Some(&id) => {
                            slot.id = id;
                            slot.reused = true;
                        }
                        None => break,
                    }
                }
            }
            let fresh = if missing > recycled.len() {
                self.next_ids(missing - recycled.len())?
            } else {
                Vec::new()
            };

            // WAL durable before the mapping commit.
            let mut wal_records: Vec<WalRecord> = recycled
                .iter()
                .chain(fresh.iter())
                .map(|&id| WalRecord {
                    op: WalOp::Add,
                    id,
                })
                .collect();
            wal_records.dedup();
            if let Err(e) = self.wal.append(&wal_records) {
                let mut reserved = recycled;
                reserved.extend_from_slice(&fresh);
                if let Err(reclaim_err) = self.reclaim_failed_ids(&reserved) {
                    tracing::error!(
                        error = %reclaim_err,
                        "failed to return reserved IDs after a WAL failure"
                    );
                }
                return Err(e);
            }

            let txn = self.db.begin_write()?;
            {
                let mut forward = txn.open_table(EXT_TO_INT_TABLE)?;
                let mut reverse = txn.open_table(INT_TO_EXT_TABLE)?;
                let mut fresh_iter = fresh.iter();
                for (i, slot) in slots.iter_mut().enumerate() {
                    if !slot.needs_write {
                        continue;
                    }
                    if slot.id == 0 {
                        let Some(&id) = fresh_iter.next() else {
                            return Err(Error::Internal(
                                "fresh id reservation ran short of the batch".into(),
                            ));
                        };
                        slot.id = id;
                    }
                    forward.insert(str_ids[i].as_str(), encode_id(slot.id).as_slice())?;
                    reverse.insert(encode_id(slot.id).as_slice(), str_ids[i].as_str())?;
                }
            }
            txn.commit()?;
        }

        Ok(str_ids
            .iter()
            .enumerate()
            .map(|(i, _)| {
                let slot = match dup_of[i] {
                    Some(j) => slots[j],
                    None => slots[i],
                };
                let is_new_to_graph = match dup_of[i] {
                    // The first occurrence already inserted this point.
                    Some(_) => false,
                    None => slot.needs_write && !slot.reused,
                };
                (slot.id, is_new_to_graph)
            })
            .collect())
    }

    /// Look up the internal ID for an external string.
    pub fn get_id(&self, str_id: &str) -> Result<Option<IntId>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(EXT_TO_INT_TABLE)?;
        match table.get(str_id)? {
            Some(guard) => Ok(Some(decode_id(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Look up the external string for an internal ID.
    pub fn get_external(&self, id: IntId) -> Result<Option<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(INT_TO_EXT_TABLE)?;
        match table.get(encode_id(id).as_slice())? {
            Some(guard) => Ok(Some(guard.value().to_string())),
            None => Ok(None),
        }
    }

    /// Resolve a batch of internal IDs in one snapshot.
    pub fn resolve_externals(&self, ids: &[IntId]) -> Result<Vec<Option<String>>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(INT_TO_EXT_TABLE)?;
        let mut out = Vec::with_capacity(ids.len());
        for &id in ids {
            if id == 0 {
                out.push(None);
                continue;
            }
            out.push(
                table
                    .get(encode_id(id).as_slice())?
                    .map(|guard| guard.value().to_string()),
            );
        }
        Ok(out)
    }

    /// Number of live mappings.
    pub fn count(&self) -> Result<u64> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(EXT_TO_INT_TABLE)?;
        Ok(table.len()?)
    }

    /// Erase mappings for the given strings, recycling their IDs.
    ///
    /// Missing strings yield `0` in the result. `DELETE` records hit the
    /// WAL before the mapping mutation commits.
    pub fn delete_points(&self, str_ids: &[String]) -> Result<Vec<IntId>> {
        if str_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut deleted = Vec::with_capacity(str_ids.len());
        let txn = self.db.begin_write()?;
        {
            let mut forward = txn.open_table(EXT_TO_INT_TABLE)?;
            let mut reverse = txn.open_table(INT_TO_EXT_TABLE)?;
            let mut state = txn.open_table(STATE_TABLE)?;

            for s in str_ids {
                let id = match forward.get(s.as_str())? {
                    Some(guard) => decode_id(guard.value())?,
                    None => 0,
                };
                deleted.push(id);
            }

            let records: Vec<WalRecord> = deleted
                .iter()
                .filter(|&&id| id != 0)
                .map(|&id| WalRecord {
                    op: WalOp::Delete,
                    id,
                })
                .collect();
            self.wal.append(&records)?;

            for (s, &id) in str_ids.iter().zip(&deleted) {
                if id != 0 {
                    forward.remove(s.as_str())?;
                    reverse.remove(encode_id(id).as_slice())?;
                }
            }

            let mut pool = match state.get(DELETED_IDS_KEY)? {
                Some(guard) => decode_pool(guard.value())?,
                None => Vec::new(),
            };
            let mut present: HashSet<IntId> = pool.iter().copied().collect();
            for &id in deleted.iter().filter(|&&id| id != 0) {
                if present.insert(id) {
                    pool.push(id);
                }
            }
            if pool.is_empty() {
                state.remove(DELETED_IDS_KEY)?;
            } else {
                state.insert(DELETED_IDS_KEY, encode_pool(&pool).as_slice())?;
            }
        }
        txn.commit()?;
        Ok(deleted)
    }

    /// Return reserved IDs to the recycling pool after a failed graph
    /// insert.
    pub fn reclaim_failed_ids(&self, ids: &[IntId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin_write()?;
        {
            let mut state = txn.open_table(STATE_TABLE)?;
            let mut pool = match state.get(DELETED_IDS_KEY)? {
                Some(guard) => decode_pool(guard.value())?,
                None => Vec::new(),
            };
            let mut present: HashSet<IntId> = pool.iter().copied().collect();
            for &id in ids {
                if id != 0 && present.insert(id) {
                    pool.push(id);
                }
            }
            state.insert(DELETED_IDS_KEY, encode_pool(&pool).as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Current recycling pool, oldest first. Read-only view for tests and
    /// diagnostics.
    pub fn deleted_ids(&self) -> Result<Vec<IntId>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(STATE_TABLE)?;
        match table.get(DELETED_IDS_KEY)? {
            Some(guard) => decode_pool(guard.value()),
            None => Ok(Vec::new()),
        }
    }

    /// Pop up to `max` IDs off the front of the recycling pool.
    fn take_deleted_ids(&self, max: usize) -> Result<Vec<IntId>> {
        let txn = self.db.begin_write()?;
        let taken = {
            let mut state = txn.open_table(STATE_TABLE)?;
            let pool = match state.get(DELETED_IDS_KEY)? {
                Some(guard) => decode_pool(guard.value())?,
                None => Vec::new(),
            };
            let count = max.min(pool.len());
            let taken = pool[..count].to_vec();
            let remaining = &pool[count..];
            if remaining.is_empty() {
                state.remove(DELETED_IDS_KEY)?;
            } else {
                state.insert(DELETED_IDS_KEY, encode_pool(remaining).as_slice())?;
            }
            taken
        };
        txn.commit()?;
        Ok(taken)
    }

    /// Atomically advance the counter and hand out `count` consecutive IDs.
    fn next_ids(&self, count: usize) -> Result<Vec<IntId>> {
        let _lock = self.next_id_lock.lock();
        let txn = self.db.begin_write()?;
        let start = {
            let mut state = txn.open_table(STATE_TABLE)?;
            let current = match state.get(NEXT_ID_KEY)? {
                Some(guard) => decode_id(guard.value())?,
                None => 1,
            };
            let next = current.checked_add(count as IntId).ok_or_else(|| {
                Error::Capacity("internal id counter exhausted".into())
            })?;
            state.insert(NEXT_ID_KEY, encode_id(next).as_slice())?;
            current
        };
        txn.commit()?;
        Ok((0..count).map(|i| start + i as IntId).collect())
    }

    /// Replay the WAL after a crash.
    ///
    /// `ADD`/`UPDATE` records whose ID has no live mapping were reserved
    /// but never committed — they return to the pool. `DELETE` records are
    /// verified against the map. The WAL is cleared after a successful
    /// pass.
    pub fn recover(&self) -> Result<RecoveryReport> {
        if !self.wal.has_entries() {
            return Ok(RecoveryReport::default());
        }
        self.wal.disable();
        let outcome = self.recover_inner();
        self.wal.enable();
        let report = outcome?;
        self.wal.clear()?;
        tracing::info!(
            records = report.records,
            reclaimed = report.reclaimed,
            truncated = report.truncated,
            "WAL recovery complete"
        );
        Ok(report)
    }

    fn recover_inner(&self) -> Result<RecoveryReport> {
        let (records, truncated) = self.wal.replay()?;

        let mut live: HashSet<IntId> = HashSet::new();
        {
            let txn = self.db.begin_read()?;
            let table = txn.open_table(INT_TO_EXT_TABLE)?;
            for entry in table.iter()? {
                let (key_guard, _) = entry?;
                live.insert(decode_id(key_guard.value())?);
            }
        }

        let mut reclaim: Vec<IntId> = Vec::new();
        for record in &records {
            match record.op {
                WalOp::Add | WalOp::Update => {
                    if !live.contains(&record.id) {
                        reclaim.push(record.id);
                    }
                }
                WalOp::Delete => {
                    if live.contains(&record.id) {
                        tracing::warn!(
                            id = record.id as u64,
                            "WAL delete never committed; mapping left intact"
                        );
                    }
                }
            }
        }
        reclaim.sort_unstable();
        reclaim.dedup();
        let reclaimed = reclaim.len();
        self.reclaim_failed_ids(&reclaim)?;

        Ok(RecoveryReport {
            records: records.len(),
            reclaimed,
            truncated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_mapper() -> (tempfile::TempDir, IdMapper) {
        let dir = tempfile::tempdir().unwrap();
        let mapper = IdMapper::open(dir.path()).unwrap();
        (dir, mapper)
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_fresh_allocation_is_monotone() {
        let (_dir, mapper) = open_mapper();
        let out = mapper
            .create_ids_batch(&strings(&["a", "b", "c"]), false)
            .unwrap();
        assert_eq!(out, vec![(1, true), (2, true), (3, true)]);
        assert_eq!(mapper.count().unwrap(), 3);
    }

    #[test]
    fn test_idempotent_on_existing() {
        let (_dir, mapper) = open_mapper();
        let first = mapper
            .create_ids_batch(&strings(&["a", "b"]), false)
            .unwrap();
        let second = mapper
            .create_ids_batch(&strings(&["a", "b"]), false)
            .unwrap();
        assert_eq!(second[0], (first[0].0, false));
        assert_eq!(second[1], (first[1].0, false));
    }

    #[test]
    fn test_duplicates_within_batch_share_id() {
        let (_dir, mapper) = open_mapper();
        let out = mapper
            .create_ids_batch(&strings(&["x", "x", "y"]), false)
            .unwrap();
        assert_eq!(out[0].0, out[1].0);
        assert!(out[0].1);
        assert!(!out[1].1);
        assert_eq!(mapper.count().unwrap(), 2);
    }

    #[test]
    fn test_delete_recycles_ids() {
        let (_dir, mapper) = open_mapper();
        mapper
            .create_ids_batch(&strings(&["x", "y"]), false)
            .unwrap();
        let deleted = mapper.delete_points(&strings(&["x", "missing"])).unwrap();
        assert_eq!(deleted, vec![1, 0]);
        assert_eq!(mapper.deleted_ids().unwrap(), vec![1]);
        assert_eq!(mapper.get_id("x").unwrap(), None);

        let out = mapper.create_ids_batch(&strings(&["z"]), true).unwrap();
        assert_eq!(out, vec![(1, false)], "recycled id is not new to the graph");
        assert!(mapper.deleted_ids().unwrap().is_empty());
    }

    #[test]
    fn test_no_reuse_without_flag() {
        let (_dir, mapper) = open_mapper();
        mapper.create_ids_batch(&strings(&["x"]), false).unwrap();
        mapper.delete_points(&strings(&["x"])).unwrap();
        let out = mapper.create_ids_batch(&strings(&["y"]), false).unwrap();
        assert_eq!(out, vec![(2, true)]);
        assert_eq!(mapper.deleted_ids().unwrap(), vec![1]);
    }

    #[test]
    fn test_reverse_mapping() {
        let (_dir, mapper) = open_mapper();
        mapper
            .create_ids_batch(&strings(&["alpha", "beta"]), false)
            .unwrap();
        assert_eq!(mapper.get_external(1).unwrap().as_deref(), Some("alpha"));
        assert_eq!(
            mapper.resolve_externals(&[2, 0, 9]).unwrap(),
            vec![Some("beta".to_string()), None, None]
        );
    }

    #[test]
    fn test_deleted_id_reassignable_to_new_string() {
        let (_dir, mapper) = open_mapper();
        mapper.create_ids_batch(&strings(&["old"]), false).unwrap();
        mapper.delete_points(&strings(&["old"])).unwrap();
        mapper.create_ids_batch(&strings(&["new"]), true).unwrap();
        assert_eq!(mapper.get_external(1).unwrap().as_deref(), Some("new"));
        assert_eq!(mapper.get_id("old").unwrap(), None);
    }

    #[test]
    fn test_reclaim_failed_ids_deduplicates() {
        let (_dir, mapper) = open_mapper();
        mapper.reclaim_failed_ids(&[5, 5, 6]).unwrap();
        mapper.reclaim_failed_ids(&[6, 7]).unwrap();
        assert_eq!(mapper.deleted_ids().unwrap(), vec![5, 6, 7]);
    }

    #[test]
    fn test_wal_records_allocation_before_commit() {
        let (_dir, mapper) = open_mapper();
        mapper
            .create_ids_batch(&strings(&["a", "b"]), false)
            .unwrap();
        let (records, _) = mapper.wal().replay().unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.op == WalOp::Add));
    }

    #[test]
    fn test_recover_clears_wal() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mapper = IdMapper::open(dir.path()).unwrap();
            let ids: Vec<String> = (0..100).map(|i| format!("doc-{i}")).collect();
            mapper.create_ids_batch(&ids, false).unwrap();
        }
        let mapper = IdMapper::open(dir.path()).unwrap();
        assert!(mapper.wal().has_entries());
        let report = mapper.recover().unwrap();
        assert_eq!(report.records, 100);
        assert_eq!(report.reclaimed, 0, "all mappings committed");
        assert!(!mapper.wal().has_entries());
    }

    #[test]
    fn test_recover_tolerates_truncated_tail() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mapper = IdMapper::open(dir.path()).unwrap();
            let ids: Vec<String> = (0..100).map(|i| format!("doc-{i}")).collect();
            mapper.create_ids_batch(&ids, false).unwrap();
        }
        let wal_path = dir.path().join("wal.bin");
        let raw = std::fs::read(&wal_path).unwrap();
        std::fs::write(&wal_path, &raw[..raw.len() - 3]).unwrap();

        let mapper = IdMapper::open(dir.path()).unwrap();
        let report = mapper.recover().unwrap();
        assert!(report.truncated);
        assert_eq!(report.records, 99);
        assert!(!mapper.wal().has_entries());
        assert_eq!(mapper.count().unwrap(), 100);
    }

    #[test]
    fn test_recover_reclaims_uncommitted_allocation() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mapper = IdMapper::open(dir.path()).unwrap();
            mapper.create_ids_batch(&strings(&["a"]), false).unwrap();
            // Simulate a crash between the WAL append and the mapping
            // commit: log an allocation that never reached the map.
            mapper
                .wal()
                .append_one(WalRecord {
                    op: WalOp::Add,
                    id: 2,
                })
                .unwrap();
        }
        let mapper = IdMapper::open(dir.path()).unwrap();
        let report = mapper.recover().unwrap();
        assert_eq!(report.reclaimed, 1);
        assert_eq!(mapper.deleted_ids().unwrap(), vec![2]);
    }
}
