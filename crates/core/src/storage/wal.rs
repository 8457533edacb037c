//! Append-only binary write-ahead log.
//!
//! Each record is `u8 op ‖ IntId id` (little-endian). Appends are flushed
//! and fsynced before returning so an allocation is durable before the
//! mapping that depends on it commits. Replay scans to EOF and tolerates a
//! truncated trailing record — the partial bytes are simply dropped.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::types::{decode_id, encode_id, IntId, ID_BYTES};

/// Serialized size of one WAL record.
pub const RECORD_SIZE: usize = 1 + ID_BYTES;

/// Operation tag of a WAL record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalOp {
    Add = 1,
    Delete = 2,
    Update = 3,
}

impl WalOp {
    fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(WalOp::Add),
            2 => Some(WalOp::Delete),
            3 => Some(WalOp::Update),
            _ => None,
        }
    }
}

/// One logged operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalRecord {
    pub op: WalOp,
    pub id: IntId,
}

/// Append-only `wal.bin` with mutex-serialized writers.
pub struct WriteAheadLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    enabled: AtomicBool,
    entry_count: AtomicU64,
}

impl WriteAheadLog {
    /// Open or create `wal.bin` under `dir` in append mode.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join("wal.bin");
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let existing = file.metadata()?.len() / RECORD_SIZE as u64;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
            enabled: AtomicBool::new(true),
            entry_count: AtomicU64::new(existing),
        })
    }

    /// Whether the log holds records needing recovery.
    pub fn has_entries(&self) -> bool {
        self.entry_count.load(Ordering::Acquire) > 0
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count.load(Ordering::Acquire)
    }

    /// Append records and make them durable before returning.
    pub fn append(&self, records: &[WalRecord]) -> Result<()> {
        if records.is_empty() || !self.enabled.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut framed = Vec::with_capacity(records.len() * RECORD_SIZE);
        for record in records {
            framed.push(record.op as u8);
            framed.extend_from_slice(&encode_id(record.id));
        }

        let mut writer = self.writer.lock();
        writer.write_all(&framed)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        self.entry_count
            .fetch_add(records.len() as u64, Ordering::AcqRel);
        Ok(())
    }

    /// Append a single record.
    pub fn append_one(&self, record: WalRecord) -> Result<()> {
        self.append(std::slice::from_ref(&record))
    }

    /// Read every intact record. The boolean reports whether a truncated
    /// trailing record was dropped.
    pub fn replay(&self) -> Result<(Vec<WalRecord>, bool)> {
        let mut raw = Vec::new();
        File::open(&self.path)?.read_to_end(&mut raw)?;

        let mut records = Vec::with_capacity(raw.len() / RECORD_SIZE);
        let mut chunks = raw.chunks_exact(RECORD_SIZE);
        for chunk in &mut chunks {
            let op = WalOp::from_u8(chunk[0]).ok_or_else(|| {
                Error::Corruption(format!("unknown WAL operation tag {}", chunk[0]))
            })?;
            records.push(WalRecord {
                op,
                id: decode_id(&chunk[1..])?,
            });
        }
        let truncated = !chunks.remainder().is_empty();
        if truncated {
            tracing::warn!(
                bytes = chunks.remainder().len(),
                "WAL ends in a truncated record, dropping it"
            );
        }
        Ok((records, truncated))
    }

    /// Truncate the log after a successful recovery.
    pub fn clear(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        let truncated = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        truncated.sync_all()?;
        *writer = BufWriter::new(OpenOptions::new().create(true).append(true).open(&self.path)?);
        self.entry_count.store(0, Ordering::Release);
        Ok(())
    }

    /// Suppress logging (used while recovery re-applies operations).
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_wal() -> (tempfile::TempDir, WriteAheadLog) {
        let dir = tempfile::tempdir().unwrap();
        let wal = WriteAheadLog::open(dir.path()).unwrap();
        (dir, wal)
    }

    #[test]
    fn test_append_and_replay() {
        let (_dir, wal) = open_wal();
        wal.append(&[
            WalRecord { op: WalOp::Add, id: 1 },
            WalRecord { op: WalOp::Add, id: 2 },
            WalRecord { op: WalOp::Delete, id: 1 },
        ])
        .unwrap();
        assert!(wal.has_entries());

        let (records, truncated) = wal.replay().unwrap();
        assert!(!truncated);
        assert_eq!(records.len(), 3);
        assert_eq!(records[2], WalRecord { op: WalOp::Delete, id: 1 });
    }

    #[test]
    fn test_truncated_tail_is_dropped() {
        let (dir, wal) = open_wal();
        for id in 1..=10 {
            wal.append_one(WalRecord { op: WalOp::Add, id }).unwrap();
        }
        drop(wal);

        // Chop 3 bytes off the tail, leaving 9 intact records + a partial.
        let path = dir.path().join("wal.bin");
        let raw = std::fs::read(&path).unwrap();
        std::fs::write(&path, &raw[..raw.len() - 3]).unwrap();

        let wal = WriteAheadLog::open(dir.path()).unwrap();
        let (records, truncated) = wal.replay().unwrap();
        assert!(truncated);
        assert_eq!(records.len(), 9);
        assert_eq!(records[8].id, 9);
    }

    #[test]
    fn test_clear_resets() {
        let (_dir, wal) = open_wal();
        wal.append_one(WalRecord { op: WalOp::Add, id: 5 }).unwrap();
        wal.clear().unwrap();
        assert!(!wal.has_entries());
        let (records, truncated) = wal.replay().unwrap();
        assert!(records.is_empty());
        assert!(!truncated);

        // The log keeps accepting appends after a clear.
        wal.append_one(WalRecord { op: WalOp::Update, id: 6 }).unwrap();
        assert_eq!(wal.entry_count(), 1);
    }

    #[test]
    fn test_disable_suppresses_appends() {
        let (_dir, wal) = open_wal();
        wal.disable();
        wal.append_one(WalRecord { op: WalOp::Add, id: 1 }).unwrap();
        assert!(!wal.has_entries());
        wal.enable();
        wal.append_one(WalRecord { op: WalOp::Add, id: 1 }).unwrap();
        assert!(wal.has_entries());
    }

    #[test]
    fn test_unknown_op_is_corruption() {
        let (dir, wal) = open_wal();
        wal.append_one(WalRecord { op: WalOp::Add, id: 1 }).unwrap();
        drop(wal);

        let path = dir.path().join("wal.bin");
        let mut raw = std::fs::read(&path).unwrap();
        raw[0] = 0xEE;
        std::fs::write(&path, &raw).unwrap();

        let wal = WriteAheadLog::open(dir.path()).unwrap();
        assert!(matches!(wal.replay(), Err(Error::Corruption(_))));
    }
}
