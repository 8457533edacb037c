//! Numeric secondary index: sortable-encoded values in ordered buckets.
//!
//! Values are mapped to `u32` keys whose unsigned byte-lexicographic order
//! matches numeric order (sign bit flipped for integers; sign flipped and
//! magnitude inverted for negative floats). Two sub-stores:
//!
//! - *forward*: `(field, id) → sortable value`, for point-in-range checks
//!   without scanning buckets;
//! - *inverted*: `"{field}:" ‖ be_u32(start)` → serialized bucket of
//!   `(value, id)` pairs sorted by value.
//!
//! A bucket splits at its midpoint when it reaches capacity; a delete that
//! empties a bucket removes it from the ordered index. Range queries seek
//! the bucket covering the lower bound and walk forward while bucket starts
//! stay inside the range.

use std::sync::Arc;

use redb::{Database, ReadableTable, Table, TableDefinition};

use crate::config;
use crate::error::{Error, Result};
use crate::types::{decode_id, encode_id, Bitmap, IntId, ID_BYTES};

const FORWARD_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("numeric_forward");
const INVERTED_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("numeric_inverted");

/// Map a signed integer to a `u32` preserving order under unsigned
/// comparison: flip the sign bit.
#[inline]
pub fn int_to_sortable(i: i32) -> u32 {
    (i as u32) ^ 0x8000_0000
}

/// Inverse of [`int_to_sortable`].
#[inline]
pub fn sortable_to_int(u: u32) -> i32 {
    (u ^ 0x8000_0000) as i32
}

/// Map an IEEE-754 float to a `u32` preserving order: non-negative floats
/// get the sign bit set; negative floats get all bits flipped so larger
/// magnitudes sort lower.
#[inline]
pub fn float_to_sortable(f: f32) -> u32 {
    let bits = f.to_bits();
    let mask = (((bits as i32) >> 31) as u32) | 0x8000_0000;
    bits ^ mask
}

/// Inverse of [`float_to_sortable`].
#[inline]
pub fn sortable_to_float(u: u32) -> f32 {
    let mask = ((u >> 31).wrapping_sub(1)) | 0x8000_0000;
    f32::from_bits(u ^ mask)
}

/// Sortable encoding for a JSON number: integers in i32 range use the
/// integer mapping, everything else goes through f32.
pub(crate) fn json_number_to_sortable(value: &serde_json::Value) -> Option<u32> {
    if let Some(i) = value.as_i64() {
        if (i32::MIN as i64..=i32::MAX as i64).contains(&i) {
            return Some(int_to_sortable(i as i32));
        }
        return Some(float_to_sortable(i as f32));
    }
    value.as_f64().map(|f| float_to_sortable(f as f32))
}

/// One ordered bucket of `(sortable value, id)` pairs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bucket {
    pub entries: Vec<(u32, IntId)>,
}

impl Bucket {
    /// Wire format: `u32 count LE ‖ (u32 value LE ‖ IntId LE)[count]`.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.entries.len() * (4 + ID_BYTES));
        buf.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for &(value, id) in &self.entries {
            buf.extend_from_slice(&value.to_le_bytes());
            buf.extend_from_slice(&encode_id(id));
        }
        buf
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::Corruption("bucket blob shorter than header".into()));
        }
        let count = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        let entry_size = 4 + ID_BYTES;
        if data.len() != 4 + count * entry_size {
            return Err(Error::Corruption(format!(
                "bucket blob length {} does not match count {count}",
                data.len()
            )));
        }
        let mut entries = Vec::with_capacity(count);
        let mut at = 4;
        for _ in 0..count {
            let value = u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
            let id = decode_id(&data[at + 4..])?;
            entries.push((value, id));
            at += entry_size;
        }
        Ok(Self { entries })
    }

    /// Insert keeping entries sorted by value.
    pub fn add(&mut self, value: u32, id: IntId) {
        self.entries.push((value, id));
        self.entries.sort_unstable();
    }

    /// Drop every entry for `id`. Returns whether anything was removed.
    pub fn remove(&mut self, id: IntId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|&(_, e)| e != id);
        self.entries.len() != before
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Split off the upper half, leaving the lower half in place.
    pub fn split(&mut self) -> Bucket {
        let mid = self.entries.len() / 2;
        Bucket {
            entries: self.entries.split_off(mid),
        }
    }

    pub fn min_val(&self) -> u32 {
        self.entries.first().map_or(0, |&(v, _)| v)
    }
}

/// Ordered bucket index over one environment.
pub struct NumericIndex {
    db: Arc<Database>,
    bucket_capacity: usize,
}

fn field_prefix(field: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(field.len() + 1);
    prefix.extend_from_slice(field.as_bytes());
    prefix.push(b':');
    prefix
}

/// Inverted key: `"{field}:" ‖ be_u32(start)` so byte order matches value
/// order within a field.
fn bucket_key(field: &str, start: u32) -> Vec<u8> {
    let mut key = field_prefix(field);
    key.extend_from_slice(&start.to_be_bytes());
    key
}

fn forward_key(field: &str, id: IntId) -> Vec<u8> {
    let mut key = field_prefix(field);
    key.extend_from_slice(&encode_id(id));
    key
}

fn parse_bucket_start(key: &[u8]) -> Result<u32> {
    if key.len() < 4 {
        return Err(Error::Corruption("bucket key shorter than start value".into()));
    }
    let at = key.len() - 4;
    Ok(u32::from_be_bytes([
        key[at],
        key[at + 1],
        key[at + 2],
        key[at + 3],
    ]))
}

/// Largest bucket key ≤ the target within the same field, together with its
/// decoded bucket. The redb rendition of a set-range seek followed by a
/// step to the previous key.
fn locate_bucket<T: ReadableTable<&'static [u8], &'static [u8]>>(
    table: &T,
    field: &str,
    value: u32,
) -> Result<Option<(Vec<u8>, Bucket)>> {
    let prefix = field_prefix(field);
    let target = bucket_key(field, value);
    let located = {
        let mut range = table.range::<&[u8]>(..=target.as_slice())?;
        match range.next_back() {
            Some(entry) => {
                let (key_guard, value_guard) = entry?;
                let key = key_guard.value().to_vec();
                if key.starts_with(&prefix) {
                    Some((key, Bucket::deserialize(value_guard.value())?))
                } else {
                    None
                }
            }
            None => None,
        }
    };
    Ok(located)
}

impl NumericIndex {
    /// Bind to the filter environment with the default bucket capacity.
    pub fn new(db: Arc<Database>) -> Result<Self> {
        Self::with_bucket_capacity(db, config::BUCKET_MAX_SIZE)
    }

    /// Bind with an explicit bucket capacity.
    pub fn with_bucket_capacity(db: Arc<Database>, bucket_capacity: usize) -> Result<Self> {
        let txn = db.begin_write()?;
        {
            txn.open_table(FORWARD_TABLE)?;
            txn.open_table(INVERTED_TABLE)?;
        }
        txn.commit()?;
        Ok(Self {
            db,
            bucket_capacity: bucket_capacity.max(2),
        })
    }

    /// Insert or update the sortable `value` for `(field, id)`.
    pub fn put(&self, field: &str, id: IntId, value: u32) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut forward = txn.open_table(FORWARD_TABLE)?;
            let mut inverted = txn.open_table(INVERTED_TABLE)?;

            let fwd_key = forward_key(field, id);
            let old = match forward.get(fwd_key.as_slice())? {
                Some(guard) => {
                    let raw = guard.value();
                    if raw.len() != 4 {
                        return Err(Error::Corruption("forward entry has wrong width".into()));
                    }
                    Some(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
                }
                None => None,
            };

            if old == Some(value) {
                // Same sortable value: nothing to move.
                return Ok(());
            }
            if let Some(old_value) = old {
                self.remove_from_bucket(&mut inverted, field, old_value, id)?;
            }
            forward.insert(fwd_key.as_slice(), value.to_le_bytes().as_slice())?;
            self.add_to_bucket(&mut inverted, field, value, id)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Drop the `(field, id)` entry from both sub-stores.
    pub fn remove(&self, field: &str, id: IntId) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut forward = txn.open_table(FORWARD_TABLE)?;
            let mut inverted = txn.open_table(INVERTED_TABLE)?;

            let fwd_key = forward_key(field, id);
            let old = match forward.get(fwd_key.as_slice())? {
                Some(guard) => {
                    let raw = guard.value();
                    if raw.len() != 4 {
                        return Err(Error::Corruption("forward entry has wrong width".into()));
                    }
                    Some(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
                }
                None => None,
            };
            if let Some(old_value) = old {
                self.remove_from_bucket(&mut inverted, field, old_value, id)?;
                forward.remove(fwd_key.as_slice())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// IDs whose value falls inside `[min, max]` (sortable space, inclusive).
    pub fn range(&self, field: &str, min: u32, max: u32) -> Result<Bitmap> {
        let mut out = Bitmap::new();
        let txn = self.db.begin_read()?;
        let table = txn.open_table(INVERTED_TABLE)?;
        let prefix = field_prefix(field);

        // Start at the bucket covering `min`, or at the field's first bucket
        // when `min` precedes every bucket start.
        let start_key = match locate_bucket(&table, field, min)? {
            Some((key, _)) => key,
            None => prefix.clone(),
        };

        for entry in table.range::<&[u8]>(start_key.as_slice()..)? {
            let (key_guard, value_guard) = entry?;
            let key = key_guard.value();
            if !key.starts_with(&prefix) {
                break;
            }
            if parse_bucket_start(key)? > max {
                break;
            }
            let bucket = Bucket::deserialize(value_guard.value())?;
            for &(value, id) in &bucket.entries {
                if value >= min && value <= max {
                    out.insert(id);
                }
            }
        }
        Ok(out)
    }

    /// Point check through the forward store: does `(field, id)` carry a
    /// value in `[min, max]`?
    pub fn check_range(&self, field: &str, id: IntId, min: u32, max: u32) -> Result<bool> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(FORWARD_TABLE)?;
        let key = forward_key(field, id);
        match table.get(key.as_slice())? {
            Some(guard) => {
                let raw = guard.value();
                if raw.len() != 4 {
                    return Err(Error::Corruption("forward entry has wrong width".into()));
                }
                let value = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
                Ok(value >= min && value <= max)
            }
            None => Ok(false),
        }
    }

    /// Number of buckets currently held for a field. Test and maintenance
    /// visibility only.
    pub fn bucket_count(&self, field: &str) -> Result<usize> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(INVERTED_TABLE)?;
        let prefix = field_prefix(field);
        let mut count = 0;
        for entry in table.range::<&[u8]>(prefix.as_slice()..)? {
            let (key_guard, _) = entry?;
            if !key_guard.value().starts_with(&prefix) {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    fn add_to_bucket(
        &self,
        table: &mut Table<'_, &'static [u8], &'static [u8]>,
        field: &str,
        value: u32,
        id: IntId,
    ) -> Result<()> {
        // A value before the field's first bucket starts a new head bucket;
        // the old head keeps its key.
        let (key, mut bucket) = match locate_bucket(table, field, value)? {
            Some(found) => found,
            None => (bucket_key(field, value), Bucket::default()),
        };

        bucket.add(value, id);
        if bucket.entries.len() >= self.bucket_capacity {
            let upper = bucket.split();
            let upper_key = bucket_key(field, upper.min_val());
            table.insert(key.as_slice(), bucket.serialize().as_slice())?;
            table.insert(upper_key.as_slice(), upper.serialize().as_slice())?;
        } else {
            table.insert(key.as_slice(), bucket.serialize().as_slice())?;
        }
        Ok(())
    }

    fn remove_from_bucket(
        &self,
        table: &mut Table<'_, &'static [u8], &'static [u8]>,
        field: &str,
        value: u32,
        id: IntId,
    ) -> Result<()> {
        let Some((key, mut bucket)) = locate_bucket(table, field, value)? else {
            return Ok(());
        };
        if bucket.remove(id) {
            if bucket.is_empty() {
                table.remove(key.as_slice())?;
            } else {
                table.insert(key.as_slice(), bucket.serialize().as_slice())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index(capacity: usize) -> (tempfile::TempDir, NumericIndex) {
        let dir = tempfile::tempdir().unwrap();
        let db = crate::storage::open_database(&dir.path().join("filter.redb"), 1 << 20).unwrap();
        (
            dir,
            NumericIndex::with_bucket_capacity(db, capacity).unwrap(),
        )
    }

    fn ids(bm: &Bitmap) -> Vec<IntId> {
        bm.iter().collect()
    }

    #[test]
    fn test_int_sortable_order() {
        let values = [i32::MIN, -100, -1, 0, 1, 42, i32::MAX];
        for pair in values.windows(2) {
            assert!(
                int_to_sortable(pair[0]) < int_to_sortable(pair[1]),
                "order broken between {} and {}",
                pair[0],
                pair[1]
            );
        }
        for v in values {
            assert_eq!(sortable_to_int(int_to_sortable(v)), v);
        }
    }

    #[test]
    fn test_float_sortable_order() {
        let values = [
            f32::NEG_INFINITY,
            -1.0e10,
            -3.5,
            -0.0,
            0.0,
            1.0e-10,
            2.5,
            7.25e8,
            f32::INFINITY,
        ];
        for pair in values.windows(2) {
            assert!(
                float_to_sortable(pair[0]) <= float_to_sortable(pair[1]),
                "order broken between {} and {}",
                pair[0],
                pair[1]
            );
        }
        for v in [-3.5f32, 0.0, 2.5, 7.25e8] {
            assert_eq!(sortable_to_float(float_to_sortable(v)), v);
        }
    }

    #[test]
    fn test_bucket_serialize_roundtrip() {
        let mut bucket = Bucket::default();
        bucket.add(int_to_sortable(5), 2);
        bucket.add(int_to_sortable(1), 1);
        let decoded = Bucket::deserialize(&bucket.serialize()).unwrap();
        assert_eq!(decoded, bucket);
        assert!(decoded.entries[0].0 < decoded.entries[1].0);
    }

    #[test]
    fn test_bucket_deserialize_rejects_truncation() {
        let mut bucket = Bucket::default();
        bucket.add(1, 1);
        let mut raw = bucket.serialize();
        raw.pop();
        assert!(matches!(
            Bucket::deserialize(&raw),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_put_and_range() {
        let (_dir, idx) = index(config::BUCKET_MAX_SIZE);
        for i in 1..=9 {
            idx.put("x", i as IntId, int_to_sortable(i)).unwrap();
        }
        let bm = idx
            .range("x", int_to_sortable(3), int_to_sortable(7))
            .unwrap();
        assert_eq!(ids(&bm), vec![3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_bucket_split_keeps_range_correct() {
        let (_dir, idx) = index(4);
        for i in 1..=9 {
            idx.put("x", i as IntId, int_to_sortable(i)).unwrap();
            if i == 5 {
                assert!(
                    idx.bucket_count("x").unwrap() >= 2,
                    "bucket should have split by the fifth insert"
                );
            }
        }
        let bm = idx
            .range("x", int_to_sortable(3), int_to_sortable(7))
            .unwrap();
        assert_eq!(ids(&bm), vec![3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_update_moves_value() {
        let (_dir, idx) = index(config::BUCKET_MAX_SIZE);
        idx.put("price", 1, int_to_sortable(10)).unwrap();
        idx.put("price", 1, int_to_sortable(99)).unwrap();
        let low = idx
            .range("price", int_to_sortable(0), int_to_sortable(50))
            .unwrap();
        assert!(low.is_empty());
        let high = idx
            .range("price", int_to_sortable(90), int_to_sortable(100))
            .unwrap();
        assert_eq!(ids(&high), vec![1]);
    }

    #[test]
    fn test_remove_empties_bucket() {
        let (_dir, idx) = index(config::BUCKET_MAX_SIZE);
        idx.put("n", 1, int_to_sortable(7)).unwrap();
        assert_eq!(idx.bucket_count("n").unwrap(), 1);
        idx.remove("n", 1).unwrap();
        assert_eq!(idx.bucket_count("n").unwrap(), 0);
        assert!(idx
            .range("n", 0, u32::MAX)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_value_before_first_bucket() {
        let (_dir, idx) = index(4);
        for i in [10, 11, 12] {
            idx.put("x", i as IntId, int_to_sortable(i)).unwrap();
        }
        // A value before every existing bucket start creates a head bucket.
        idx.put("x", 1, int_to_sortable(1)).unwrap();
        let bm = idx
            .range("x", int_to_sortable(0), int_to_sortable(12))
            .unwrap();
        assert_eq!(ids(&bm), vec![1, 10, 11, 12]);
    }

    #[test]
    fn test_fields_do_not_interfere() {
        let (_dir, idx) = index(config::BUCKET_MAX_SIZE);
        idx.put("a", 1, int_to_sortable(5)).unwrap();
        idx.put("b", 2, int_to_sortable(5)).unwrap();
        let bm = idx.range("a", 0, u32::MAX).unwrap();
        assert_eq!(ids(&bm), vec![1]);
    }

    #[test]
    fn test_check_range_uses_forward_store() {
        let (_dir, idx) = index(config::BUCKET_MAX_SIZE);
        idx.put("p", 3, int_to_sortable(20)).unwrap();
        assert!(idx
            .check_range("p", 3, int_to_sortable(15), int_to_sortable(40))
            .unwrap());
        assert!(!idx
            .check_range("p", 3, int_to_sortable(21), int_to_sortable(40))
            .unwrap());
        assert!(!idx
            .check_range("p", 4, 0, u32::MAX)
            .unwrap());
    }

    #[test]
    fn test_repeated_range_is_stable() {
        let (_dir, idx) = index(4);
        for i in 1..=20 {
            idx.put("x", i as IntId, int_to_sortable(i)).unwrap();
        }
        let first = idx
            .range("x", int_to_sortable(5), int_to_sortable(15))
            .unwrap();
        let second = idx
            .range("x", int_to_sortable(5), int_to_sortable(15))
            .unwrap();
        assert_eq!(first, second);
    }
}
