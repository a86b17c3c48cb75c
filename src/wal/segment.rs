//! A single append-only segment file (component C2).
//!
//! [`SegmentWriter`] owns one open file plus a [`BufWriter`] acting as the
//! in-memory write buffer. It never retries a failed write — a write error
//! aborts the append and leaves the segment in an un-acknowledged state;
//! retrying is the collaborator's concern (here, the file manager's).

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::error::WalError;
use crate::wal::entry::LSN;
use crate::wal::layout::segment_path;

/// Point-in-time metadata about a segment, active or closed.
#[derive(Debug, Clone)]
pub struct SegmentMeta {
    pub segment_number: u64,
    pub path: PathBuf,
    pub size: u64,
    pub created_at: SystemTime,
    pub last_write_at: SystemTime,
    pub min_lsn: Option<LSN>,
    pub max_lsn: Option<LSN>,
    pub entry_count: u64,
    pub open: bool,
}

impl SegmentMeta {
    fn new(segment_number: u64, path: PathBuf) -> Self {
        let now = SystemTime::now();
        Self {
            segment_number,
            path,
            size: 0,
            created_at: now,
            last_write_at: now,
            min_lsn: None,
            max_lsn: None,
            entry_count: 0,
            open: true,
        }
    }

    fn record_append(&mut self, lsn: LSN, bytes_written: u64) {
        self.size += bytes_written;
        self.last_write_at = SystemTime::now();
        self.entry_count += 1;
        self.min_lsn = Some(self.min_lsn.map_or(lsn, |min| min.min(lsn)));
        self.max_lsn = Some(self.max_lsn.map_or(lsn, |max| max.max(lsn)));
    }
}

/// The current append target: one open file plus its buffer.
pub struct SegmentWriter {
    meta: SegmentMeta,
    file: BufWriter<File>,
}

impl SegmentWriter {
    /// Create a brand-new segment file. Fails (`RotationError`) if the file
    /// already exists, since segment numbers must never be reused.
    pub fn create(dir: &Path, segment_number: u64, buffer_bytes: usize) -> Result<Self, WalError> {
        let path = segment_path(dir, segment_number);
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                WalError::RotationError(format!(
                    "failed to create segment {segment_number} at {}: {e}",
                    path.display()
                ))
            })?;

        Ok(Self {
            meta: SegmentMeta::new(segment_number, path),
            file: BufWriter::with_capacity(buffer_bytes.max(1), file),
        })
    }

    /// Re-open an existing segment file for append, recomputing its
    /// metadata from a caller-supplied scan (the file manager derives this
    /// by decoding the segment's existing records on startup).
    ///
    /// `size` is the offset of the last intact, decodable record the scan
    /// reached — it may be shorter than the file's physical length if a
    /// crash left a torn tail. The file is truncated to `size` before any
    /// append is accepted: `O_APPEND` writes at the *physical* end of file,
    /// so leaving torn-tail garbage in place would push every subsequent
    /// append past bytes the reader stops at, making them unreachable.
    pub fn open_existing(
        path: PathBuf,
        segment_number: u64,
        buffer_bytes: usize,
        size: u64,
        min_lsn: Option<LSN>,
        max_lsn: Option<LSN>,
        entry_count: u64,
    ) -> Result<Self, WalError> {
        let file = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|e| WalError::io(path.clone(), e))?;
        file.set_len(size).map_err(|e| WalError::io(path.clone(), e))?;

        let now = SystemTime::now();
        let meta = SegmentMeta {
            segment_number,
            path,
            size,
            created_at: now,
            last_write_at: now,
            min_lsn,
            max_lsn,
            entry_count,
            open: true,
        };

        Ok(Self {
            meta,
            file: BufWriter::with_capacity(buffer_bytes.max(1), file),
        })
    }

    pub fn meta(&self) -> &SegmentMeta {
        &self.meta
    }

    /// Append pre-encoded bytes for `lsn`. Bytes accepted here appear on
    /// disk in the order accepted; no partial record is ever observed
    /// between fsync boundaries if the caller respects the chosen sync
    /// mode.
    pub fn append(&mut self, bytes: &[u8], lsn: LSN) -> Result<(), WalError> {
        self.file
            .write_all(bytes)
            .map_err(|e| WalError::io(self.meta.path.clone(), e))?;
        self.meta.record_append(lsn, bytes.len() as u64);
        Ok(())
    }

    /// Push buffered bytes to the OS. Does not guarantee durability across
    /// a crash — use [`SegmentWriter::fsync`] for that.
    pub fn flush(&mut self) -> Result<(), WalError> {
        self.file
            .flush()
            .map_err(|e| WalError::io(self.meta.path.clone(), e))
    }

    /// Flush, then force the file to stable storage.
    pub fn fsync(&mut self) -> Result<(), WalError> {
        self.flush()?;
        self.file
            .get_ref()
            .sync_all()
            .map_err(|e| WalError::io(self.meta.path.clone(), e))
    }

    /// Flush, fsync, and mark the segment closed, returning its final
    /// metadata for the active segment table.
    pub fn close(mut self) -> Result<SegmentMeta, WalError> {
        self.fsync()?;
        self.meta.open = false;
        Ok(self.meta)
    }
}
