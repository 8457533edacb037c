//! Bitmap filter index: one roaring bitmap per `(field, value)` pair.
//!
//! Postings live in the filter environment under `"{field}:{value}"` keys,
//! serialized in roaring's portable format. Mutations are read-modify-write
//! cycles inside a single write transaction.

use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};

use crate::error::{Error, Result};
use crate::types::{Bitmap, IntId};

const BITMAP_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("bitmap_postings");

/// Encode a bitmap in roaring's portable serialization.
pub(crate) fn encode_bitmap(bitmap: &Bitmap) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(bitmap.serialized_size());
    bitmap
        .serialize_into(&mut buf)
        .map_err(|e| Error::Internal(format!("bitmap serialization failed: {e}")))?;
    Ok(buf)
}

/// Decode a stored posting; damage surfaces as `Corruption`.
pub(crate) fn decode_bitmap(data: &[u8]) -> Result<Bitmap> {
    Bitmap::deserialize_from(data)
        .map_err(|e| Error::Corruption(format!("bitmap posting decode failed: {e}")))
}

/// Categorical/boolean equality index backed by roaring bitmaps.
pub struct BitmapIndex {
    db: Arc<Database>,
}

impl BitmapIndex {
    /// Bind to the filter environment, creating the postings table.
    pub fn new(db: Arc<Database>) -> Result<Self> {
        let txn = db.begin_write()?;
        {
            txn.open_table(BITMAP_TABLE)?;
        }
        txn.commit()?;
        Ok(Self { db })
    }

    /// Posting key for a field/value pair.
    pub fn posting_key(field: &str, value: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(field.len() + value.len() + 1);
        key.extend_from_slice(field.as_bytes());
        key.push(b':');
        key.extend_from_slice(value.as_bytes());
        key
    }

    /// Load the posting for a field/value pair; missing keys yield an empty
    /// bitmap rather than an error.
    pub fn get_bitmap(&self, field: &str, value: &str) -> Result<Bitmap> {
        self.get_bitmap_by_key(&Self::posting_key(field, value))
    }

    /// Load a posting by its already-formatted key.
    pub fn get_bitmap_by_key(&self, key: &[u8]) -> Result<Bitmap> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(BITMAP_TABLE)?;
        match table.get(key)? {
            Some(guard) => decode_bitmap(guard.value()),
            None => Ok(Bitmap::new()),
        }
    }

    /// Add one ID to a posting.
    pub fn add(&self, field: &str, value: &str, id: IntId) -> Result<()> {
        self.update_posting(&Self::posting_key(field, value), |bitmap| {
            bitmap.insert(id);
        })
    }

    /// Remove one ID from a posting.
    pub fn remove(&self, field: &str, value: &str, id: IntId) -> Result<()> {
        self.update_posting(&Self::posting_key(field, value), |bitmap| {
            bitmap.remove(id);
        })
    }

    /// Membership test without materializing the caller's own bitmap.
    pub fn contains(&self, field: &str, value: &str, id: IntId) -> Result<bool> {
        Ok(self.get_bitmap(field, value)?.contains(id))
    }

    /// Bulk-add IDs to a posting addressed by its formatted key. The batch
    /// ingest path groups IDs per key to pay the read-modify-write once.
    pub fn add_batch_by_key(&self, key: &[u8], ids: &[IntId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.update_posting(key, |bitmap| {
            for &id in ids {
                bitmap.insert(id);
            }
        })
    }

    fn update_posting(&self, key: &[u8], mutate: impl FnOnce(&mut Bitmap)) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(BITMAP_TABLE)?;
            let mut bitmap = match table.get(key)? {
                Some(guard) => decode_bitmap(guard.value())?,
                None => Bitmap::new(),
            };
            mutate(&mut bitmap);
            let encoded = encode_bitmap(&bitmap)?;
            table.insert(key, encoded.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }
}
