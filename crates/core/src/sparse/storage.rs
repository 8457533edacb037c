//! Sparse vector storage: the docs table plus the BMW index, updated
//! together inside single transactions.
//!
//! The storage owns its environment and the BMW index; the BMW index sees
//! only the shared database handle, never this object. Every write is one
//! transaction spanning the docs-table change and all posting-block
//! updates — an abort leaves both untouched. The vector count is tracked
//! atomically and reconciled from the docs table at startup.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};

use crate::config;
use crate::error::Result;
use crate::sparse::bmw::BmwIndex;
use crate::sparse::vector::SparseVector;
use crate::storage::open_database;
use crate::types::{encode_id, IntId};

const SPARSE_DOCS_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("sparse_docs");

/// Sparse retrieval layer: packed document vectors plus the BMW index.
pub struct SparseStorage {
    db: Arc<Database>,
    bmw: BmwIndex,
    /// Writers exclusive, searches shared; the BMW index layers its own
    /// lock underneath.
    lock: RwLock<()>,
    vector_count: AtomicU64,
}

impl SparseStorage {
    /// Open the sparse environment under `dir`, creating it if needed.
    pub fn open(dir: &Path) -> Result<Self> {
        let db = open_database(&dir.join("sparse.redb"), config::sparse_cache_bytes())?;
        let txn = db.begin_write()?;
        {
            txn.open_table(SPARSE_DOCS_TABLE)?;
        }
        txn.commit()?;

        let bmw = BmwIndex::open(db.clone())?;

        let count = {
            let txn = db.begin_read()?;
            let table = txn.open_table(SPARSE_DOCS_TABLE)?;
            table.len()?
        };

        Ok(Self {
            db,
            bmw,
            lock: RwLock::new(()),
            vector_count: AtomicU64::new(count),
        })
    }

    /// Store one vector; postings and the docs table commit together.
    pub fn store(&self, doc_id: IntId, vector: &SparseVector) -> Result<()> {
        let _guard = self.lock.write();
        let txn = self.db.begin_write()?;
        let fresh = {
            let mut docs = txn.open_table(SPARSE_DOCS_TABLE)?;
            let packed = vector.pack()?;
            let key = encode_id(doc_id);
            let is_fresh = docs.insert(key.as_slice(), packed.as_slice())?.is_none();
            is_fresh
        };
        self.bmw.add_document(&txn, doc_id, vector)?;
        txn.commit()?;
        if fresh {
            self.vector_count.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Fetch a stored vector. Missing IDs are "no value", not an error.
    pub fn get(&self, doc_id: IntId) -> Result<Option<SparseVector>> {
        let _guard = self.lock.read();
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SPARSE_DOCS_TABLE)?;
        let key = encode_id(doc_id);
        match table.get(key.as_slice())? {
            Some(guard) => Ok(Some(SparseVector::unpack(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Delete one vector: tombstone its postings, drop the docs entry.
    /// Returns `false` when the ID holds no vector.
    pub fn delete(&self, doc_id: IntId) -> Result<bool> {
        let _guard = self.lock.write();
        let txn = self.db.begin_write()?;
        let existing = {
            let docs = txn.open_table(SPARSE_DOCS_TABLE)?;
            let key = encode_id(doc_id);
            let found = match docs.get(key.as_slice())? {
                Some(guard) => Some(SparseVector::unpack(guard.value())?),
                None => None,
            };
            found
        };
        let Some(vector) = existing else {
            return Ok(false);
        };

        self.bmw.remove_document(&txn, doc_id, &vector)?;
        {
            let mut docs = txn.open_table(SPARSE_DOCS_TABLE)?;
            let key = encode_id(doc_id);
            docs.remove(key.as_slice())?;
        }
        txn.commit()?;
        self.vector_count.fetch_sub(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Replace a vector: tombstone the old postings, store the new ones,
    /// all in one transaction.
    pub fn update(&self, doc_id: IntId, vector: &SparseVector) -> Result<()> {
        let _guard = self.lock.write();
        let txn = self.db.begin_write()?;
        let old = {
            let docs = txn.open_table(SPARSE_DOCS_TABLE)?;
            let key = encode_id(doc_id);
            let found = match docs.get(key.as_slice())? {
                Some(guard) => Some(SparseVector::unpack(guard.value())?),
                None => None,
            };
            found
        };
        if let Some(old_vector) = &old {
            self.bmw.remove_document(&txn, doc_id, old_vector)?;
        }
        {
            let mut docs = txn.open_table(SPARSE_DOCS_TABLE)?;
            let packed = vector.pack()?;
            let key = encode_id(doc_id);
            docs.insert(key.as_slice(), packed.as_slice())?;
        }
        self.bmw.add_document(&txn, doc_id, vector)?;
        txn.commit()?;
        if old.is_none() {
            self.vector_count.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Store a batch atomically: either every doc-store write and posting
    /// update lands, or none do.
    pub fn batch_store(&self, batch: &[(IntId, SparseVector)]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let _guard = self.lock.write();
        let mut fresh = 0u64;
        let txn = self.db.begin_write()?;
        {
            let mut docs = txn.open_table(SPARSE_DOCS_TABLE)?;
            for (doc_id, vector) in batch {
                let packed = vector.pack()?;
                let key = encode_id(*doc_id);
                if docs.insert(key.as_slice(), packed.as_slice())?.is_none() {
                    fresh += 1;
                }
            }
        }
        self.bmw.add_documents_batch(&txn, batch)?;
        txn.commit()?;
        self.vector_count.fetch_add(fresh, Ordering::Relaxed);
        Ok(())
    }

    /// Delete a batch in one transaction; missing IDs are skipped.
    /// Returns how many vectors were actually removed.
    pub fn batch_delete(&self, doc_ids: &[IntId]) -> Result<usize> {
        if doc_ids.is_empty() {
            return Ok(0);
        }
        let _guard = self.lock.write();
        let mut removed = 0usize;
        let txn = self.db.begin_write()?;
        for &doc_id in doc_ids {
            let existing = {
                let docs = txn.open_table(SPARSE_DOCS_TABLE)?;
                let key = encode_id(doc_id);
                let found = match docs.get(key.as_slice())? {
                    Some(guard) => Some(SparseVector::unpack(guard.value())?),
                    None => None,
                };
                found
            };
            let Some(vector) = existing else {
                continue;
            };
            self.bmw.remove_document(&txn, doc_id, &vector)?;
            {
                let mut docs = txn.open_table(SPARSE_DOCS_TABLE)?;
                let key = encode_id(doc_id);
                docs.remove(key.as_slice())?;
            }
            removed += 1;
        }
        txn.commit()?;
        self.vector_count
            .fetch_sub(removed as u64, Ordering::Relaxed);
        Ok(removed)
    }

    /// Top-k sparse retrieval through the BMW index.
    pub fn search(&self, query: &SparseVector, k: usize) -> Result<Vec<(IntId, f32)>> {
        let _guard = self.lock.read();
        self.bmw.search(query, k)
    }

    /// Number of stored vectors.
    pub fn vector_count(&self) -> u64 {
        self.vector_count.load(Ordering::Relaxed)
    }

    /// Number of indexed terms.
    pub fn term_count(&self) -> usize {
        self.bmw.term_count()
    }

    /// Number of posting blocks.
    pub fn block_count(&self) -> usize {
        self.bmw.block_count()
    }

    /// Maintenance: physically compact one term's tombstones.
    pub fn compact_term(&self, term_id: u32) -> Result<()> {
        let _guard = self.lock.write();
        self.bmw.compact_term(term_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sv(pairs: &[(u32, f32)]) -> SparseVector {
        SparseVector::new(
            pairs.iter().map(|&(t, _)| t).collect(),
            pairs.iter().map(|&(_, v)| v).collect(),
        )
        .unwrap()
    }

    fn open() -> (tempfile::TempDir, SparseStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = SparseStorage::open(dir.path()).unwrap();
        (dir, storage)
    }

    #[test]
    fn test_store_get_roundtrip() {
        let (_dir, storage) = open();
        let v = sv(&[(10, 1.0), (20, 0.5)]);
        storage.store(7, &v).unwrap();
        let got = storage.get(7).unwrap().unwrap();
        assert_eq!(got.indices, v.indices);
        assert_eq!(storage.vector_count(), 1);
        assert!(storage.get(8).unwrap().is_none());
    }

    #[test]
    fn test_store_then_search() {
        let (_dir, storage) = open();
        storage.store(1, &sv(&[(10, 1.0), (20, 0.5)])).unwrap();
        storage.store(2, &sv(&[(10, 0.2), (30, 2.0)])).unwrap();
        storage.store(3, &sv(&[(20, 1.5), (30, 0.1)])).unwrap();

        let results = storage.search(&sv(&[(10, 1.0), (30, 1.0)]), 2).unwrap();
        assert_eq!(results[0].0, 2);
        assert_eq!(results[1].0, 1);
    }

    #[test]
    fn test_delete_removes_everywhere() {
        let (_dir, storage) = open();
        storage.store(1, &sv(&[(10, 1.0)])).unwrap();
        assert!(storage.delete(1).unwrap());
        assert!(!storage.delete(1).unwrap());
        assert!(storage.get(1).unwrap().is_none());
        assert!(storage.search(&sv(&[(10, 1.0)]), 5).unwrap().is_empty());
        assert_eq!(storage.vector_count(), 0);
    }

    #[test]
    fn test_update_replaces_postings() {
        let (_dir, storage) = open();
        storage.store(1, &sv(&[(10, 1.0)])).unwrap();
        storage.update(1, &sv(&[(20, 2.0)])).unwrap();
        assert!(storage.search(&sv(&[(10, 1.0)]), 5).unwrap().is_empty());
        let results = storage.search(&sv(&[(20, 1.0)]), 5).unwrap();
        assert_eq!(results[0].0, 1);
        assert_eq!(storage.vector_count(), 1);
    }

    #[test]
    fn test_batch_store_and_delete() {
        let (_dir, storage) = open();
        let batch: Vec<(IntId, SparseVector)> = (1..=10)
            .map(|i| (i as IntId, sv(&[(5, i as f32)])))
            .collect();
        storage.batch_store(&batch).unwrap();
        assert_eq!(storage.vector_count(), 10);

        let removed = storage.batch_delete(&[1, 2, 3, 99]).unwrap();
        assert_eq!(removed, 3);
        assert_eq!(storage.vector_count(), 7);
        let results = storage.search(&sv(&[(5, 1.0)]), 20).unwrap();
        assert_eq!(results.len(), 7);
    }

    #[test]
    fn test_count_reconciled_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = SparseStorage::open(dir.path()).unwrap();
            storage.store(1, &sv(&[(1, 1.0)])).unwrap();
            storage.store(2, &sv(&[(2, 1.0)])).unwrap();
        }
        let storage = SparseStorage::open(dir.path()).unwrap();
        assert_eq!(storage.vector_count(), 2);
        let results = storage.search(&sv(&[(1, 1.0)]), 5).unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_store_same_id_does_not_double_count() {
        let (_dir, storage) = open();
        storage.store(1, &sv(&[(1, 1.0)])).unwrap();
        storage.store(1, &sv(&[(1, 2.0)])).unwrap();
        assert_eq!(storage.vector_count(), 1);
    }
}
