//! Filter facade: JSON filter evaluation over the bitmap and numeric
//! indices, plus the per-index field schema.
//!
//! A filter is an array of conjuncts, each a single-field object
//! `{field: {op: value}}` with `$eq`, `$in`, or `$range`. Conjuncts are
//! AND-ed; an empty array matches nothing. Field types are registered on
//! first ingest and immutable afterwards: a query that disagrees with the
//! schema fails with `TypeMismatch`, while ingest skips the offending field
//! and keeps going.

/// Roaring bitmap postings for categorical/boolean equality.
pub mod bitmap;
/// Ordered numeric buckets with sortable encoding.
pub mod numeric;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use redb::{Database, ReadableTable, TableDefinition};
use serde_json::Value;

use crate::config;
use crate::error::{Error, Result};
use crate::filter::bitmap::BitmapIndex;
use crate::filter::numeric::{json_number_to_sortable, NumericIndex};
use crate::storage::open_database;
use crate::types::{Bitmap, IntId};

const SCHEMA_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("schema");
const SCHEMA_KEY: &str = "__schema_v1__";

/// Type a field is locked to once first ingested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Number,
    Bool,
}

impl FieldType {
    fn as_u8(self) -> u8 {
        match self {
            FieldType::String => 1,
            FieldType::Number => 2,
            FieldType::Bool => 4,
        }
    }

    fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(FieldType::String),
            2 => Some(FieldType::Number),
            4 => Some(FieldType::Bool),
            _ => None,
        }
    }
}

/// Infer the schema type a JSON value would register under.
fn value_type(value: &Value) -> Option<FieldType> {
    match value {
        Value::Bool(_) => Some(FieldType::Bool),
        Value::Number(_) => Some(FieldType::Number),
        Value::String(_) => Some(FieldType::String),
        _ => None,
    }
}

fn bool_str(b: bool) -> &'static str {
    if b {
        "true"
    } else {
        "false"
    }
}

/// Filter layer owning its environment, both secondary indices, and the
/// schema cache.
pub struct Filter {
    db: Arc<Database>,
    numeric: NumericIndex,
    bitmaps: BitmapIndex,
    /// Copy-on-write schema snapshot: readers clone the `Arc`, writers swap
    /// in a rebuilt map under the mutex.
    schema: Mutex<Arc<HashMap<String, FieldType>>>,
}

impl Filter {
    /// Open the filter environment under `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        let db = open_database(&dir.join("filter.redb"), config::filter_cache_bytes())?;
        let txn = db.begin_write()?;
        {
            txn.open_table(SCHEMA_TABLE)?;
        }
        txn.commit()?;

        let numeric = NumericIndex::new(db.clone())?;
        let bitmaps = BitmapIndex::new(db.clone())?;
        let schema = Mutex::new(Arc::new(load_schema(&db)?));
        Ok(Self {
            db,
            numeric,
            bitmaps,
            schema,
        })
    }

    /// Registered type for a field, if any.
    pub fn field_type(&self, field: &str) -> Option<FieldType> {
        self.schema.lock().get(field).copied()
    }

    /// Direct access to the numeric sub-index (point-in-range checks).
    pub fn numeric(&self) -> &NumericIndex {
        &self.numeric
    }

    /// Direct access to the bitmap sub-index.
    pub fn bitmaps(&self) -> &BitmapIndex {
        &self.bitmaps
    }

    /// Register a field's type on first use. Returns `false` when the field
    /// is already registered under a different type.
    fn register_field_type(&self, field: &str, ty: FieldType) -> Result<bool> {
        let mut guard = self.schema.lock();
        if let Some(&existing) = guard.get(field) {
            return Ok(existing == ty);
        }

        let mut next: HashMap<String, FieldType> = (**guard).clone();
        next.insert(field.to_string(), ty);
        let encoded: HashMap<&str, u8> = next.iter().map(|(k, v)| (k.as_str(), v.as_u8())).collect();
        let json = serde_json::to_vec(&encoded)
            .map_err(|e| Error::Internal(format!("schema serialization failed: {e}")))?;

        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(SCHEMA_TABLE)?;
            table.insert(SCHEMA_KEY, json.as_slice())?;
        }
        txn.commit()?;

        *guard = Arc::new(next);
        Ok(true)
    }

    /// Evaluate a JSON filter array into a bitmap of matching IDs.
    pub fn compute_filter_bitmap(&self, filter: &Value) -> Result<Bitmap> {
        let conjuncts = filter
            .as_array()
            .ok_or_else(|| Error::InvalidArgument("filter must be an array".into()))?;
        if conjuncts.is_empty() {
            return Ok(Bitmap::new());
        }

        let mut result: Option<Bitmap> = None;
        for conjunct in conjuncts {
            let obj = conjunct
                .as_object()
                .filter(|o| o.len() == 1)
                .ok_or_else(|| {
                    Error::InvalidArgument("each condition must be a single-field object".into())
                })?;
            let (field, expr) = obj
                .iter()
                .next()
                .ok_or_else(|| Error::Internal("single-entry object had no entry".into()))?;
            if field.is_empty() {
                return Err(Error::InvalidArgument(
                    "filter field name cannot be empty".into(),
                ));
            }
            let expr_obj = expr
                .as_object()
                .filter(|o| o.len() == 1)
                .ok_or_else(|| {
                    Error::InvalidArgument("operator must be a single-field object".into())
                })?;
            let (op, operand) = expr_obj
                .iter()
                .next()
                .ok_or_else(|| Error::Internal("single-entry object had no entry".into()))?;

            let registered = self.field_type(field);
            let matched = match op.as_str() {
                "$eq" => self.eval_eq(field, registered, operand)?,
                "$in" => {
                    let elements = operand.as_array().ok_or_else(|| {
                        Error::InvalidArgument("$in operand must be an array".into())
                    })?;
                    let mut acc = Bitmap::new();
                    for element in elements {
                        acc |= self.eval_eq(field, registered, element)?;
                    }
                    acc
                }
                "$range" => self.eval_range(field, registered, operand)?,
                other => {
                    return Err(Error::InvalidArgument(format!(
                        "unsupported filter operator '{other}'"
                    )))
                }
            };

            result = Some(match result {
                None => matched,
                Some(mut acc) => {
                    acc &= matched;
                    acc
                }
            });
        }
        Ok(result.unwrap_or_default())
    }

    fn eval_eq(&self, field: &str, registered: Option<FieldType>, value: &Value) -> Result<Bitmap> {
        let vt = value_type(value).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "$eq value for field '{field}' must be a string, number, or boolean"
            ))
        })?;
        if let Some(rt) = registered {
            if rt != vt {
                return Err(Error::TypeMismatch(field.to_string()));
            }
        }
        match vt {
            FieldType::Number => {
                let sortable = json_number_to_sortable(value).ok_or_else(|| {
                    Error::InvalidArgument(format!("non-finite number for field '{field}'"))
                })?;
                self.numeric.range(field, sortable, sortable)
            }
            FieldType::String => self
                .bitmaps
                .get_bitmap(field, value.as_str().unwrap_or_default()),
            FieldType::Bool => self
                .bitmaps
                .get_bitmap(field, bool_str(value.as_bool().unwrap_or_default())),
        }
    }

    fn eval_range(
        &self,
        field: &str,
        registered: Option<FieldType>,
        operand: &Value,
    ) -> Result<Bitmap> {
        if matches!(registered, Some(FieldType::String) | Some(FieldType::Bool)) {
            return Err(Error::TypeMismatch(field.to_string()));
        }
        let bounds = operand
            .as_array()
            .filter(|a| a.len() == 2)
            .ok_or_else(|| {
                Error::InvalidArgument("$range operand must be a [start, end] pair".into())
            })?;
        let lo = json_number_to_sortable(&bounds[0])
            .ok_or_else(|| Error::InvalidArgument("range start must be a number".into()))?;
        let hi = json_number_to_sortable(&bounds[1])
            .ok_or_else(|| Error::InvalidArgument("range end must be a number".into()))?;
        if lo > hi {
            return Err(Error::InvalidArgument("invalid range: start > end".into()));
        }
        self.numeric.range(field, lo, hi)
    }

    /// IDs matching a filter, materialized in ascending order.
    pub fn ids_matching(&self, filter: &Value) -> Result<Vec<IntId>> {
        Ok(self.compute_filter_bitmap(filter)?.iter().collect())
    }

    /// Cardinality of the filter result.
    pub fn count_matching(&self, filter: &Value) -> Result<u64> {
        Ok(self.compute_filter_bitmap(filter)?.len())
    }

    /// Ingest one document's filter object (`{field: value, ...}`).
    ///
    /// Best-effort per field: an unsupported value type or a schema type
    /// mismatch logs and skips that field, other fields continue.
    pub fn add_filters_from_json(&self, id: IntId, filter: &Value) -> Result<()> {
        let obj = filter
            .as_object()
            .ok_or_else(|| Error::InvalidArgument("filter payload must be an object".into()))?;
        for (field, value) in obj {
            let Some(vt) = value_type(value) else {
                tracing::debug!(field = %field, "unsupported filter value type, skipping");
                continue;
            };
            if !self.register_field_type(field, vt)? {
                tracing::warn!(field = %field, "field type mismatch, skipping filter entry");
                continue;
            }
            match vt {
                FieldType::String => {
                    self.bitmaps
                        .add(field, value.as_str().unwrap_or_default(), id)?
                }
                FieldType::Bool => {
                    self.bitmaps
                        .add(field, bool_str(value.as_bool().unwrap_or_default()), id)?
                }
                FieldType::Number => {
                    let sortable = json_number_to_sortable(value).ok_or_else(|| {
                        Error::InvalidArgument(format!("non-finite number for field '{field}'"))
                    })?;
                    self.numeric.put(field, id, sortable)?;
                }
            }
        }
        Ok(())
    }

    /// Batch ingest, grouping bitmap updates per posting key so each posting
    /// pays its read-modify-write once.
    pub fn add_filters_batch(&self, items: &[(IntId, Value)]) -> Result<()> {
        let mut posting_ids: HashMap<Vec<u8>, Vec<IntId>> = HashMap::new();
        for (id, filter) in items {
            let Some(obj) = filter.as_object() else {
                tracing::warn!(id = *id as u64, "filter payload is not an object, skipping");
                continue;
            };
            for (field, value) in obj {
                let Some(vt) = value_type(value) else {
                    tracing::debug!(field = %field, "unsupported filter value type, skipping");
                    continue;
                };
                if !self.register_field_type(field, vt)? {
                    tracing::warn!(field = %field, "field type mismatch, skipping filter entry");
                    continue;
                }
                match vt {
                    FieldType::String => {
                        let key =
                            BitmapIndex::posting_key(field, value.as_str().unwrap_or_default());
                        posting_ids.entry(key).or_default().push(*id);
                    }
                    FieldType::Bool => {
                        let key = BitmapIndex::posting_key(
                            field,
                            bool_str(value.as_bool().unwrap_or_default()),
                        );
                        posting_ids.entry(key).or_default().push(*id);
                    }
                    FieldType::Number => {
                        let sortable = json_number_to_sortable(value).ok_or_else(|| {
                            Error::InvalidArgument(format!("non-finite number for field '{field}'"))
                        })?;
                        self.numeric.put(field, *id, sortable)?;
                    }
                }
            }
        }
        for (key, ids) in posting_ids {
            self.bitmaps.add_batch_by_key(&key, &ids)?;
        }
        Ok(())
    }

    /// Remove one document's filter entries; the mirror of ingest.
    pub fn remove_filters_from_json(&self, id: IntId, filter: &Value) -> Result<()> {
        let obj = filter
            .as_object()
            .ok_or_else(|| Error::InvalidArgument("filter payload must be an object".into()))?;
        for (field, value) in obj {
            match value {
                Value::String(s) => self.bitmaps.remove(field, s, id)?,
                Value::Bool(b) => self.bitmaps.remove(field, bool_str(*b), id)?,
                Value::Number(_) => self.numeric.remove(field, id)?,
                _ => {}
            }
        }
        Ok(())
    }

    /// Membership test for a categorical posting.
    pub fn contains(&self, field: &str, value: &str, id: IntId) -> Result<bool> {
        self.bitmaps.contains(field, value, id)
    }
}

fn load_schema(db: &Database) -> Result<HashMap<String, FieldType>> {
    let txn = db.begin_read()?;
    let table = txn.open_table(SCHEMA_TABLE)?;
    let Some(guard) = table.get(SCHEMA_KEY)? else {
        return Ok(HashMap::new());
    };
    let raw: HashMap<String, u8> = serde_json::from_slice(guard.value())
        .map_err(|e| Error::Corruption(format!("schema record decode failed: {e}")))?;
    let mut schema = HashMap::with_capacity(raw.len());
    for (field, tag) in raw {
        match FieldType::from_u8(tag) {
            Some(ty) => {
                schema.insert(field, ty);
            }
            None => tracing::warn!(field = %field, tag, "unknown field type tag in schema, dropping"),
        }
    }
    Ok(schema)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn filter() -> (tempfile::TempDir, Filter) {
        let dir = tempfile::tempdir().unwrap();
        let f = Filter::open(dir.path()).unwrap();
        (dir, f)
    }

    fn ids(bm: &Bitmap) -> Vec<IntId> {
        bm.iter().collect()
    }

    #[test]
    fn test_empty_filter_matches_nothing() {
        let (_dir, f) = filter();
        f.add_filters_from_json(1, &json!({"color": "red"})).unwrap();
        let bm = f.compute_filter_bitmap(&json!([])).unwrap();
        assert!(bm.is_empty());
    }

    #[test]
    fn test_eq_string() {
        let (_dir, f) = filter();
        f.add_filters_from_json(1, &json!({"color": "red"})).unwrap();
        f.add_filters_from_json(2, &json!({"color": "blue"})).unwrap();
        let bm = f
            .compute_filter_bitmap(&json!([{"color": {"$eq": "red"}}]))
            .unwrap();
        assert_eq!(ids(&bm), vec![1]);
    }

    #[test]
    fn test_eq_bool() {
        let (_dir, f) = filter();
        f.add_filters_from_json(1, &json!({"active": true})).unwrap();
        f.add_filters_from_json(2, &json!({"active": false})).unwrap();
        let bm = f
            .compute_filter_bitmap(&json!([{"active": {"$eq": true}}]))
            .unwrap();
        assert_eq!(ids(&bm), vec![1]);
    }

    #[test]
    fn test_eq_number_uses_numeric_index() {
        let (_dir, f) = filter();
        f.add_filters_from_json(1, &json!({"price": 10})).unwrap();
        f.add_filters_from_json(2, &json!({"price": 30})).unwrap();
        let bm = f
            .compute_filter_bitmap(&json!([{"price": {"$eq": 30}}]))
            .unwrap();
        assert_eq!(ids(&bm), vec![2]);
    }

    #[test]
    fn test_and_of_string_and_range() {
        let (_dir, f) = filter();
        f.add_filters_from_json(1, &json!({"color": "red", "price": 10}))
            .unwrap();
        f.add_filters_from_json(2, &json!({"color": "red", "price": 30}))
            .unwrap();
        f.add_filters_from_json(3, &json!({"color": "blue", "price": 20}))
            .unwrap();
        let bm = f
            .compute_filter_bitmap(&json!([
                {"color": {"$eq": "red"}},
                {"price": {"$range": [15, 40]}}
            ]))
            .unwrap();
        assert_eq!(ids(&bm), vec![2]);
    }

    #[test]
    fn test_conjunct_order_does_not_matter() {
        let (_dir, f) = filter();
        f.add_filters_from_json(1, &json!({"color": "red", "price": 10}))
            .unwrap();
        f.add_filters_from_json(2, &json!({"color": "red", "price": 30}))
            .unwrap();
        let a = f
            .compute_filter_bitmap(&json!([
                {"color": {"$eq": "red"}},
                {"price": {"$range": [15, 40]}}
            ]))
            .unwrap();
        let b = f
            .compute_filter_bitmap(&json!([
                {"price": {"$range": [15, 40]}},
                {"color": {"$eq": "red"}}
            ]))
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_in_operator() {
        let (_dir, f) = filter();
        f.add_filters_from_json(1, &json!({"lang": "en"})).unwrap();
        f.add_filters_from_json(2, &json!({"lang": "it"})).unwrap();
        f.add_filters_from_json(3, &json!({"lang": "de"})).unwrap();
        let bm = f
            .compute_filter_bitmap(&json!([{"lang": {"$in": ["en", "it"]}}]))
            .unwrap();
        assert_eq!(ids(&bm), vec![1, 2]);
    }

    #[test]
    fn test_empty_in_yields_empty_conjunct() {
        let (_dir, f) = filter();
        f.add_filters_from_json(1, &json!({"lang": "en"})).unwrap();
        let bm = f
            .compute_filter_bitmap(&json!([{"lang": {"$in": []}}]))
            .unwrap();
        assert!(bm.is_empty());
    }

    #[test]
    fn test_unknown_operator_fails() {
        let (_dir, f) = filter();
        let err = f
            .compute_filter_bitmap(&json!([{"x": {"$gt": 5}}]))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_query_type_mismatch_fails() {
        let (_dir, f) = filter();
        f.add_filters_from_json(1, &json!({"price": 10})).unwrap();
        let err = f
            .compute_filter_bitmap(&json!([{"price": {"$eq": "ten"}}]))
            .unwrap_err();
        assert!(matches!(err, Error::TypeMismatch(_)));

        // $range on a Number field is fine; on a String field it is not.
        f.add_filters_from_json(1, &json!({"color": "red"})).unwrap();
        let err = f
            .compute_filter_bitmap(&json!([{"color": {"$range": [1, 2]}}]))
            .unwrap_err();
        assert!(matches!(err, Error::TypeMismatch(_)));
    }

    #[test]
    fn test_unknown_field_typed_by_value() {
        let (_dir, f) = filter();
        // No schema entry for "ghost": a string probe hits the bitmap path
        // and returns empty instead of failing.
        let bm = f
            .compute_filter_bitmap(&json!([{"ghost": {"$eq": "x"}}]))
            .unwrap();
        assert!(bm.is_empty());
        // A numeric probe goes to the numeric index.
        let bm = f
            .compute_filter_bitmap(&json!([{"ghost2": {"$range": [0, 10]}}]))
            .unwrap();
        assert!(bm.is_empty());
    }

    #[test]
    fn test_bad_range_rejected() {
        let (_dir, f) = filter();
        let err = f
            .compute_filter_bitmap(&json!([{"x": {"$range": [10, 2]}}]))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        let err = f
            .compute_filter_bitmap(&json!([{"x": {"$range": [1]}}]))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_ingest_type_mismatch_is_skipped() {
        let (_dir, f) = filter();
        f.add_filters_from_json(1, &json!({"price": 10})).unwrap();
        // Second doc misuses "price" as a string: that field is skipped,
        // "color" still lands.
        f.add_filters_from_json(2, &json!({"price": "cheap", "color": "red"}))
            .unwrap();
        assert!(f.contains("color", "red", 2).unwrap());
        let bm = f
            .compute_filter_bitmap(&json!([{"price": {"$eq": 10}}]))
            .unwrap();
        assert_eq!(ids(&bm), vec![1]);
    }

    #[test]
    fn test_remove_filters() {
        let (_dir, f) = filter();
        f.add_filters_from_json(1, &json!({"color": "red", "price": 10}))
            .unwrap();
        f.remove_filters_from_json(1, &json!({"color": "red", "price": 10}))
            .unwrap();
        assert!(!f.contains("color", "red", 1).unwrap());
        let bm = f
            .compute_filter_bitmap(&json!([{"price": {"$eq": 10}}]))
            .unwrap();
        assert!(bm.is_empty());
    }

    #[test]
    fn test_batch_ingest_groups_postings() {
        let (_dir, f) = filter();
        let items = vec![
            (1 as IntId, json!({"color": "red", "price": 5})),
            (2, json!({"color": "red"})),
            (3, json!({"color": "blue"})),
        ];
        f.add_filters_batch(&items).unwrap();
        let bm = f
            .compute_filter_bitmap(&json!([{"color": {"$eq": "red"}}]))
            .unwrap();
        assert_eq!(ids(&bm), vec![1, 2]);
        let bm = f
            .compute_filter_bitmap(&json!([{"price": {"$eq": 5}}]))
            .unwrap();
        assert_eq!(ids(&bm), vec![1]);
    }

    #[test]
    fn test_schema_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let f = Filter::open(dir.path()).unwrap();
            f.add_filters_from_json(1, &json!({"price": 10})).unwrap();
        }
        let f = Filter::open(dir.path()).unwrap();
        assert_eq!(f.field_type("price"), Some(FieldType::Number));
        let err = f
            .compute_filter_bitmap(&json!([{"price": {"$eq": "x"}}]))
            .unwrap_err();
        assert!(matches!(err, Error::TypeMismatch(_)));
    }
}
