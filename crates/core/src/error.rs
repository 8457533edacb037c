//! Crate-wide error type and `Result` alias.
//!
//! Every fallible operation in the core returns [`Result`]. The variants map
//! one-to-one onto the failure classes the engine can surface: caller errors
//! (`InvalidArgument`, `TypeMismatch`), missing data (`NotFound`), resource
//! exhaustion (`Capacity`), storage-engine and file failures (`Storage`,
//! `Io`), on-disk damage (`Corruption`), and broken internal invariants
//! (`Internal`).

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure classes surfaced by the storage and retrieval core.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Dimension mismatch, unknown metric, malformed filter, or bad
    /// sparse-vector packing.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A filter field was used with a different type than the one registered
    /// in the schema.
    #[error("type mismatch for field '{0}'")]
    TypeMismatch(String),

    /// Vector, index, or metadata record missing.
    #[error("not found: {0}")]
    NotFound(String),

    /// Graph capacity exhausted or a quota violated.
    #[error("capacity exceeded: {0}")]
    Capacity(String),

    /// Any failure reported by the embedded key-value engine.
    #[error("storage error: {0}")]
    Storage(#[from] redb::Error),

    /// File-level I/O failure (WAL, snapshots).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Header version mismatch, size/length inconsistency, or a record
    /// damaged beyond a tolerated truncation.
    #[error("corruption: {0}")]
    Corruption(String),

    /// Invariant violation that should never happen in a healthy process.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<redb::TransactionError> for Error {
    fn from(e: redb::TransactionError) -> Self {
        Error::Storage(e.into())
    }
}

impl From<redb::TableError> for Error {
    fn from(e: redb::TableError) -> Self {
        Error::Storage(e.into())
    }
}

impl From<redb::StorageError> for Error {
    fn from(e: redb::StorageError) -> Self {
        Error::Storage(e.into())
    }
}

impl From<redb::CommitError> for Error {
    fn from(e: redb::CommitError) -> Self {
        Error::Storage(e.into())
    }
}

impl From<redb::DatabaseError> for Error {
    fn from(e: redb::DatabaseError) -> Self {
        Error::Storage(e.into())
    }
}
