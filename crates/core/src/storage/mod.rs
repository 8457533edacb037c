//! Durable storage: embedded key-value environments, the ID mapper with its
//! write-ahead log, and the shared index metadata catalog.
//!
//! Each index exclusively owns one environment per subsystem (filter,
//! id-mapper, sparse); the metadata catalog is shared by every index of a
//! server. An environment is a [`redb::Database`] holding named tables, and
//! a logical write is one scoped transaction: committed on explicit success,
//! aborted when the transaction handle drops on any other path.

/// External↔internal ID mapping with recycling and WAL-backed allocation.
pub mod id_mapper;
/// Per-server index metadata catalog.
pub mod meta;
/// Append-only binary write-ahead log.
pub mod wal;

use std::path::Path;
use std::sync::Arc;

use redb::Database;

use crate::error::Result;

/// Open (or create) an environment file with the given cache budget.
pub(crate) fn open_database(path: &Path, cache_bytes: usize) -> Result<Arc<Database>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut builder = Database::builder();
    builder.set_cache_size(cache_bytes);
    let db = builder.create(path)?;
    Ok(Arc::new(db))
}
