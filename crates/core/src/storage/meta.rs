//! Index metadata catalog, shared by every index of a server.
//!
//! Records are JSON blobs keyed `"{owner}/{index_name}"`. The catalog
//! validates record shape on read and nothing across indexes; a malformed
//! record is skipped (with a warning) when listing.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::config;
use crate::error::{Error, Result};
use crate::quantization::QuantLevel;
use crate::space::Metric;
use crate::storage::open_database;

const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("index_meta");

/// Per-index descriptor persisted in the catalog.
///
/// Field names are the wire contract: `space_type_str` is one of
/// `"l2"`/`"ip"`/`"cosine"`, `quant_level` the numeric level tag, and
/// `created_at` seconds since the epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub name: String,
    pub dimension: u64,
    #[serde(default)]
    pub sparse_dim: u64,
    #[serde(rename = "space_type_str")]
    pub space_type: Metric,
    pub quant_level: u8,
    pub checksum: i32,
    pub total_elements: u64,
    #[serde(rename = "M")]
    pub m: u64,
    pub ef_con: u64,
    pub created_at: u64,
}

impl IndexMetadata {
    /// Decode the numeric quantization tag.
    pub fn quant_level(&self) -> Result<QuantLevel> {
        QuantLevel::from_u8(self.quant_level)
    }
}

/// Key-value catalog of index descriptors.
pub struct MetadataCatalog {
    db: Arc<Database>,
}

impl MetadataCatalog {
    /// Open the catalog environment under `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        let db = open_database(&dir.join("meta.redb"), config::metadata_cache_bytes())?;
        let txn = db.begin_write()?;
        {
            txn.open_table(META_TABLE)?;
        }
        txn.commit()?;
        Ok(Self { db })
    }

    /// Store (or replace) the descriptor for `index_id`
    /// (`"{owner}/{index_name}"`).
    pub fn store(&self, index_id: &str, metadata: &IndexMetadata) -> Result<()> {
        let json = serde_json::to_vec(metadata)
            .map_err(|e| Error::Internal(format!("metadata serialization failed: {e}")))?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(META_TABLE)?;
            table.insert(index_id, json.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Fetch a descriptor. Missing entries are "no value", not an error.
    pub fn get(&self, index_id: &str) -> Result<Option<IndexMetadata>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(META_TABLE)?;
        match table.get(index_id)? {
            Some(guard) => Ok(Some(parse_metadata(index_id, guard.value())?)),
            None => Ok(None),
        }
    }

    /// Rewrite only the element count of an existing descriptor.
    pub fn update_element_count(&self, index_id: &str, count: u64) -> Result<()> {
        let mut metadata = self
            .get(index_id)?
            .ok_or_else(|| Error::NotFound(format!("index metadata '{index_id}'")))?;
        metadata.total_elements = count;
        self.store(index_id, &metadata)
    }

    /// Delete a descriptor. Returns whether it existed.
    pub fn delete(&self, index_id: &str) -> Result<bool> {
        let txn = self.db.begin_write()?;
        let existed = {
            let mut table = txn.open_table(META_TABLE)?;
            let existed = table.remove(index_id)?.is_some();
            existed
        };
        txn.commit()?;
        Ok(existed)
    }

    /// Every descriptor, keyed by its full `"{owner}/{name}"` id. Records
    /// that fail to parse are skipped with a warning.
    pub fn list_all(&self) -> Result<Vec<(String, IndexMetadata)>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(META_TABLE)?;
        let mut out = Vec::new();
        for entry in table.iter()? {
            let (key_guard, value_guard) = entry?;
            let key = key_guard.value().to_string();
            match parse_metadata(&key, value_guard.value()) {
                Ok(metadata) => out.push((key, metadata)),
                Err(e) => tracing::warn!(index = %key, error = %e, "skipping bad metadata record"),
            }
        }
        Ok(out)
    }

    /// Descriptors for one owner, names returned without the owner prefix.
    pub fn list_by_owner(&self, owner: &str) -> Result<Vec<(String, IndexMetadata)>> {
        let prefix = format!("{owner}/");
        let txn = self.db.begin_read()?;
        let table = txn.open_table(META_TABLE)?;
        let mut out = Vec::new();
        for entry in table.range::<&str>(prefix.as_str()..)? {
            let (key_guard, value_guard) = entry?;
            let key = key_guard.value();
            let Some(name) = key.strip_prefix(&prefix) else {
                break;
            };
            match parse_metadata(key, value_guard.value()) {
                Ok(metadata) => out.push((name.to_string(), metadata)),
                Err(e) => tracing::warn!(index = %key, error = %e, "skipping bad metadata record"),
            }
        }
        Ok(out)
    }
}

fn parse_metadata(index_id: &str, raw: &[u8]) -> Result<IndexMetadata> {
    serde_json::from_slice(raw).map_err(|e| {
        Error::Corruption(format!("metadata record '{index_id}' failed to parse: {e}"))
    })
}
