//! Segment lifecycle and LSN allocation (component C3).
//!
//! [`FileManager`] is the single writer of the log: every append, rotation,
//! and archival decision passes through its internal lock, mirroring the
//! teacher's `WALManager`, which serializes group-commit buffers behind one
//! `parking_lot::Mutex`. A background flusher task (spawned only in
//! [`SyncMode::Buffered`]) is the one piece of state that lives outside that
//! lock, and is cancelled independently on [`FileManager::close`].

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{SyncMode, WalConfig};
use crate::error::WalError;
use crate::wal::entry::{self, LogEntry, LSN};
use crate::wal::layout::{list_segment_files, segment_path};
use crate::wal::segment::{SegmentMeta, SegmentWriter};

/// Point-in-time counters exposed for observability, modeled on the
/// teacher's `WALStats`.
#[derive(Debug, Clone, Default)]
pub struct WalStats {
    pub entries_written: u64,
    pub bytes_written: u64,
    pub rotations: u64,
    pub fsyncs: u64,
    /// Number of `write_batch` calls completed.
    pub batches_written: u64,
    /// Largest number of entries seen in a single `write_batch` call.
    pub largest_batch: usize,
}

struct Inner {
    current: SegmentWriter,
    closed: Vec<SegmentMeta>,
    stats: WalStats,
    /// Set when the current segment has unflushed Batched-mode writes that
    /// have not yet seen a terminal (Commit/Abort) record.
    pending_batch: bool,
}

/// Owns every active and recently-closed segment and hands out LSNs.
///
/// Cloning a `FileManager` is cheap and shares state: it is `Arc`-backed
/// internally, following the teacher's pattern of wrapping manager state in
/// `Arc<RwLock<_>>`/`Arc<Mutex<_>>` so handles can be held by both the
/// foreground append path and the background flusher task.
pub struct FileManager {
    config: WalConfig,
    next_lsn: Arc<AtomicU64>,
    next_segment_number: Arc<AtomicU64>,
    inner: Arc<Mutex<Inner>>,
    shutdown: Arc<AtomicBool>,
    flusher: Option<JoinHandle<()>>,
}

impl FileManager {
    /// Open (or create) the log at `config.wal_dir`, rescanning every
    /// existing segment to seed the LSN counter at the true max LSN on
    /// disk. A full rescan costs one linear pass over the log at startup in
    /// exchange for never trusting a separately-persisted "last LSN"
    /// value that could itself be stale after a crash.
    pub async fn open(config: WalConfig) -> Result<Self, WalError> {
        std::fs::create_dir_all(&config.wal_dir)
            .map_err(|e| WalError::io(config.wal_dir.clone(), e))?;
        std::fs::create_dir_all(config.archive_dir())
            .map_err(|e| WalError::io(config.archive_dir(), e))?;

        let existing = list_segment_files(&config.wal_dir)
            .map_err(|e| WalError::io(config.wal_dir.clone(), e))?;

        let mut closed = Vec::new();
        let mut max_lsn: LSN = 0;
        let mut max_segment_number: u64 = 0;

        for (number, path) in &existing {
            max_segment_number = max_segment_number.max(*number);
            let (meta, segment_max_lsn) = rescan_segment(*number, path)?;
            max_lsn = max_lsn.max(segment_max_lsn);
            closed.push(meta);
        }

        let next_segment_number = max_segment_number + if existing.is_empty() { 0 } else { 1 };
        let current_meta_to_reopen = closed.last().cloned();

        let current = if let Some(meta) = current_meta_to_reopen {
            closed.pop();
            info!(segment = meta.segment_number, "reopening last segment for append");
            SegmentWriter::open_existing(
                meta.path,
                meta.segment_number,
                config.buffer_bytes,
                meta.size,
                meta.min_lsn,
                meta.max_lsn,
                meta.entry_count,
            )?
        } else {
            SegmentWriter::create(&config.wal_dir, next_segment_number, config.buffer_bytes)?
        };

        let next_segment_number = if current.meta().segment_number >= next_segment_number {
            current.meta().segment_number + 1
        } else {
            next_segment_number
        };

        let shutdown = Arc::new(AtomicBool::new(false));
        let inner = Arc::new(Mutex::new(Inner {
            current,
            closed,
            stats: WalStats::default(),
            pending_batch: false,
        }));

        let mut manager = Self {
            config: config.clone(),
            next_lsn: Arc::new(AtomicU64::new(max_lsn + 1)),
            next_segment_number: Arc::new(AtomicU64::new(next_segment_number)),
            inner,
            shutdown,
            flusher: None,
        };

        if config.sync_mode == SyncMode::Buffered {
            manager.spawn_flusher();
        }

        Ok(manager)
    }

    fn spawn_flusher(&mut self) {
        let inner = Arc::clone(&self.inner);
        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.config.sync_interval;
        self.flusher = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if shutdown.load(Ordering::Acquire) {
                    break;
                }
                let mut guard = inner.lock();
                if let Err(err) = guard.current.fsync() {
                    warn!(error = %err, "background flush failed");
                } else {
                    guard.stats.fsyncs += 1;
                    debug!("background flush completed");
                }
            }
        }));
    }

    /// Allocate the next LSN without writing anything. Exposed so callers
    /// can stamp an entry before constructing it (e.g. to compute an undo
    /// record's LSN ahead of time).
    pub fn next_lsn(&self) -> LSN {
        self.next_lsn.load(Ordering::SeqCst)
    }

    pub fn current_lsn(&self) -> LSN {
        self.next_lsn().saturating_sub(1)
    }

    pub fn stats(&self) -> WalStats {
        self.inner.lock().stats.clone()
    }

    /// Append a single entry, assigning it the next LSN if `entry.lsn == 0`,
    /// and applying this manager's configured durability mode.
    ///
    /// LSN allocation happens under the same lock as the append itself, so
    /// a concurrent `write_entry`/`write_batch` can never allocate an LSN or
    /// physically append in between — the two are atomic as a pair.
    pub fn write_entry(&self, mut entry: LogEntry) -> Result<LSN, WalError> {
        let mut guard = self.inner.lock();

        if entry.lsn == 0 {
            entry.lsn = self.next_lsn.fetch_add(1, Ordering::SeqCst);
        } else if entry.lsn < self.next_lsn.load(Ordering::SeqCst) {
            return Err(WalError::invalid_lsn(format!(
                "explicit lsn {} is not ahead of the next allocatable lsn",
                entry.lsn
            )));
        } else {
            self.next_lsn.store(entry.lsn + 1, Ordering::SeqCst);
        }

        let is_terminal = entry.op_type.is_terminal();
        let bytes = entry::encode(&entry);
        let lsn = entry.lsn;

        self.maybe_rotate(&mut guard, bytes.len() as u64)?;
        guard.current.append(&bytes, lsn)?;
        guard.stats.entries_written += 1;
        guard.stats.bytes_written += bytes.len() as u64;

        match self.config.sync_mode {
            SyncMode::Sync => {
                guard.current.fsync()?;
                guard.stats.fsyncs += 1;
            }
            SyncMode::Batched => {
                if is_terminal {
                    guard.current.fsync()?;
                    guard.stats.fsyncs += 1;
                    guard.pending_batch = false;
                } else {
                    guard.current.flush()?;
                    guard.pending_batch = true;
                }
            }
            SyncMode::Buffered => {
                guard.current.flush()?;
            }
        }

        Ok(lsn)
    }

    /// Append a batch as one logical unit. Only the final entry triggers an
    /// fsync (for `Sync`/`Batched`); `Buffered` defers to the background
    /// task as usual.
    ///
    /// The manager lock is held for the whole batch, not per entry: LSN
    /// allocation and every append in the batch happen without releasing it,
    /// so no other `write_entry`/`write_batch` call can allocate an LSN or
    /// physically append between two entries of this batch. That makes the
    /// batch's LSNs contiguous and the batch atomic with respect to other
    /// writers.
    pub fn write_batch(&self, entries: Vec<LogEntry>) -> Result<Vec<LSN>, WalError> {
        let batch_size = entries.len();
        let mut lsns = Vec::with_capacity(batch_size);
        let last_index = batch_size.saturating_sub(1);

        let mut guard = self.inner.lock();

        for (index, mut entry) in entries.into_iter().enumerate() {
            if entry.lsn == 0 {
                entry.lsn = self.next_lsn.fetch_add(1, Ordering::SeqCst);
            } else {
                self.next_lsn.store(entry.lsn + 1, Ordering::SeqCst);
            }
            let bytes = entry::encode(&entry);
            let lsn = entry.lsn;

            self.maybe_rotate(&mut guard, bytes.len() as u64)?;
            guard.current.append(&bytes, lsn)?;
            guard.stats.entries_written += 1;
            guard.stats.bytes_written += bytes.len() as u64;

            let is_last = index == last_index;
            match self.config.sync_mode {
                SyncMode::Sync if is_last => {
                    guard.current.fsync()?;
                    guard.stats.fsyncs += 1;
                }
                SyncMode::Batched if is_last => {
                    guard.current.fsync()?;
                    guard.stats.fsyncs += 1;
                }
                _ => {
                    guard.current.flush()?;
                }
            }
            lsns.push(lsn);
        }

        guard.stats.batches_written += 1;
        guard.stats.largest_batch = guard.stats.largest_batch.max(batch_size);
        drop(guard);

        Ok(lsns)
    }

    /// Force an fsync of the active segment regardless of sync mode.
    pub fn sync(&self) -> Result<(), WalError> {
        let mut guard = self.inner.lock();
        guard.current.fsync()?;
        guard.stats.fsyncs += 1;
        Ok(())
    }

    fn maybe_rotate(&self, guard: &mut Inner, incoming_bytes: u64) -> Result<(), WalError> {
        let meta = guard.current.meta();
        let would_be_size = meta.size + incoming_bytes + crate::wal::entry::HEADER_SIZE as u64;
        let too_big = would_be_size > self.config.max_segment_bytes;
        let too_old = meta
            .created_at
            .elapsed()
            .map(|age| age > self.config.max_segment_age)
            .unwrap_or(false);

        if !too_big && !too_old {
            return Ok(());
        }

        let next_number = self.next_segment_number.fetch_add(1, Ordering::SeqCst);
        let new_writer = SegmentWriter::create(&self.config.wal_dir, next_number, self.config.buffer_bytes)?;
        let old_writer = std::mem::replace(&mut guard.current, new_writer);
        let old_meta = old_writer.close()?;
        info!(
            segment = old_meta.segment_number,
            next = next_number,
            "rotated wal segment"
        );
        guard.closed.push(old_meta);
        guard.stats.rotations += 1;
        Ok(())
    }

    /// Segments still inside `wal_dir` (closed and current), oldest first.
    pub fn list_active_files(&self) -> Vec<SegmentMeta> {
        let guard = self.inner.lock();
        let mut all = guard.closed.clone();
        all.push(guard.current.meta().clone());
        all
    }

    /// Segments already moved into `archive/`, oldest first by file name.
    pub fn list_archived_files(&self) -> Result<Vec<PathBuf>, WalError> {
        let archive_dir = self.config.archive_dir();
        if !archive_dir.exists() {
            return Ok(Vec::new());
        }
        let mut found = Vec::new();
        for entry in std::fs::read_dir(&archive_dir).map_err(|e| WalError::io(archive_dir.clone(), e))? {
            let entry = entry.map_err(|e| WalError::io(archive_dir.clone(), e))?;
            found.push(entry.path());
        }
        found.sort();
        Ok(found)
    }

    /// Move closed segments older than `retention` into `archive/`, then
    /// delete archived segments older than `retention` again, matching the
    /// two-stage aging described for the retention pass: a segment ages
    /// once toward archival, then again toward deletion.
    ///
    /// Skipped entirely while a recovery scan holds the advisory directory
    /// lock, so archived files are never removed out from under an
    /// in-progress recovery.
    pub fn cleanup_old_files(&self) -> Result<(), WalError> {
        if self.config.recovery_dir_lock_path().exists() {
            debug!("recovery lock held, skipping retention pass");
            return Ok(());
        }

        let archive_dir = self.config.archive_dir();
        let mut guard = self.inner.lock();

        let mut still_closed = Vec::with_capacity(guard.closed.len());
        for meta in guard.closed.drain(..) {
            let age = meta
                .last_write_at
                .elapsed()
                .unwrap_or(std::time::Duration::ZERO);
            if age >= self.config.retention {
                let dest = archive_dir.join(
                    meta.path
                        .file_name()
                        .expect("segment path always has a file name"),
                );
                std::fs::rename(&meta.path, &dest).map_err(|e| WalError::io(meta.path.clone(), e))?;
                info!(segment = meta.segment_number, "archived wal segment");
            } else {
                still_closed.push(meta);
            }
        }
        guard.closed = still_closed;
        drop(guard);

        if archive_dir.exists() {
            for entry in std::fs::read_dir(&archive_dir).map_err(|e| WalError::io(archive_dir.clone(), e))? {
                let entry = entry.map_err(|e| WalError::io(archive_dir.clone(), e))?;
                let modified = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .unwrap_or(SystemTime::now());
                let age = modified.elapsed().unwrap_or(std::time::Duration::ZERO);
                if age >= self.config.retention {
                    std::fs::remove_file(entry.path()).map_err(|e| WalError::io(entry.path(), e))?;
                    info!(path = %entry.path().display(), "deleted archived wal segment");
                }
            }
        }

        Ok(())
    }

    /// Stop the background flusher (if any) and fsync the active segment.
    pub async fn close(mut self) -> Result<(), WalError> {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.flusher.take() {
            handle.abort();
            let _ = handle.await;
        }
        self.sync()
    }
}

/// Re-derive a closed segment's metadata by decoding every record in it.
/// Tolerates a torn tail (a final, incomplete record left by a crash
/// mid-write) by stopping at the first undecodable byte range rather than
/// failing the whole scan.
fn rescan_segment(segment_number: u64, path: &PathBuf) -> Result<(SegmentMeta, LSN), WalError> {
    let bytes = std::fs::read(path).map_err(|e| WalError::io(path.clone(), e))?;
    let metadata = std::fs::metadata(path).map_err(|e| WalError::io(path.clone(), e))?;

    let mut offset = 0usize;
    let mut min_lsn = None;
    let mut max_lsn: LSN = 0;
    let mut entry_count = 0u64;

    while offset < bytes.len() {
        let Some(record_len) = entry::peek_record_len(&bytes[offset..]) else {
            break;
        };
        if offset + record_len > bytes.len() {
            break;
        }
        match entry::decode(&bytes[offset..offset + record_len]) {
            Ok(decoded) => {
                min_lsn = Some(min_lsn.map_or(decoded.lsn, |m: LSN| m.min(decoded.lsn)));
                max_lsn = max_lsn.max(decoded.lsn);
                entry_count += 1;
                offset += record_len;
            }
            Err(_) => break,
        }
    }

    let expected_path = segment_path(path.parent().unwrap_or(std::path::Path::new(".")), segment_number);
    let meta = SegmentMeta {
        segment_number,
        path: expected_path,
        size: offset as u64,
        created_at: metadata.created().unwrap_or_else(|_| SystemTime::now()),
        last_write_at: metadata.modified().unwrap_or_else(|_| SystemTime::now()),
        min_lsn,
        max_lsn: if entry_count > 0 { Some(max_lsn) } else { None },
        entry_count,
        open: false,
    };
    Ok((meta, max_lsn))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_entry_assigns_increasing_lsns() {
        let dir = tempfile::tempdir().unwrap();
        let config = WalConfig::new(dir.path());
        let manager = FileManager::open(config).await.unwrap();

        let lsn1 = manager.write_entry(LogEntry::insert(1, b"a".to_vec(), b"1".to_vec())).unwrap();
        let lsn2 = manager.write_entry(LogEntry::insert(1, b"b".to_vec(), b"2".to_vec())).unwrap();

        assert_eq!(lsn1, 1);
        assert_eq!(lsn2, 2);
        assert_eq!(manager.current_lsn(), 2);
    }

    #[tokio::test]
    async fn rotation_creates_a_new_segment_when_size_threshold_is_crossed() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = WalConfig::new(dir.path());
        config.max_segment_bytes = 64;
        let manager = FileManager::open(config).await.unwrap();

        for i in 0..20u64 {
            manager
                .write_entry(LogEntry::insert(1, format!("k{i}"), format!("v{i}")))
                .unwrap();
        }

        let files = manager.list_active_files();
        assert!(files.len() > 1, "expected rotation to have occurred");
        assert_eq!(manager.stats().rotations as usize, files.len() - 1);
    }

    #[tokio::test]
    async fn reopen_after_close_continues_lsn_sequence() {
        let dir = tempfile::tempdir().unwrap();
        {
            let config = WalConfig::new(dir.path());
            let manager = FileManager::open(config).await.unwrap();
            manager.write_entry(LogEntry::insert(1, b"a".to_vec(), b"1".to_vec())).unwrap();
            manager.write_entry(LogEntry::commit(1)).unwrap();
            manager.close().await.unwrap();
        }

        let config = WalConfig::new(dir.path());
        let manager = FileManager::open(config).await.unwrap();
        assert_eq!(manager.current_lsn(), 2);
        let lsn = manager.write_entry(LogEntry::insert(2, b"b".to_vec(), b"2".to_vec())).unwrap();
        assert_eq!(lsn, 3);
    }

    #[tokio::test]
    async fn reopen_after_torn_tail_truncates_before_appending() {
        let dir = tempfile::tempdir().unwrap();
        let segment_path = segment_path(dir.path(), 0);
        {
            let config = WalConfig::new(dir.path());
            let manager = FileManager::open(config).await.unwrap();
            manager
                .write_entry(LogEntry::insert(1, b"a".to_vec(), b"1".to_vec()))
                .unwrap();
            manager.write_entry(LogEntry::commit(1)).unwrap();
            manager.sync().unwrap();
            manager.close().await.unwrap();
        }

        let intact_len = std::fs::metadata(&segment_path).unwrap().len();
        // Simulate a crash mid-write: append a truncated header past the
        // last intact record, as `O_APPEND` would leave behind.
        {
            use std::io::Write as _;
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&segment_path)
                .unwrap();
            file.write_all(&[0xAB; 10]).unwrap();
        }
        assert_eq!(
            std::fs::metadata(&segment_path).unwrap().len(),
            intact_len + 10
        );

        let config = WalConfig::new(dir.path());
        let manager = FileManager::open(config.clone()).await.unwrap();
        manager
            .write_entry(LogEntry::insert(2, b"b".to_vec(), b"2".to_vec()))
            .unwrap();
        manager.sync().unwrap();
        manager.close().await.unwrap();

        assert_eq!(std::fs::metadata(&segment_path).unwrap().len(), intact_len + {
            let mut e = LogEntry::insert(2, b"b".to_vec(), b"2".to_vec());
            e.lsn = 3;
            entry::encode(&e).len() as u64
        });

        let reader = crate::wal::reader::SegmentReader::new(
            &config.wal_dir,
            crate::config::ValidationMode::Strict,
        );
        let (entries, corrupted) = reader.read_from_lsn(1).unwrap();
        assert!(corrupted.is_empty());
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].key, b"b".to_vec());
        assert_eq!(entries[2].lsn, 3);
    }

    #[tokio::test]
    async fn write_batch_tracks_batch_stats() {
        let dir = tempfile::tempdir().unwrap();
        let config = WalConfig::new(dir.path());
        let manager = FileManager::open(config).await.unwrap();

        manager
            .write_batch(vec![
                LogEntry::insert(1, b"a".to_vec(), b"1".to_vec()),
                LogEntry::commit(1),
            ])
            .unwrap();
        manager
            .write_batch(vec![LogEntry::insert(2, b"b".to_vec(), b"2".to_vec())])
            .unwrap();

        let stats = manager.stats();
        assert_eq!(stats.batches_written, 2);
        assert_eq!(stats.largest_batch, 2);
        assert_eq!(stats.entries_written, 3);
    }
}
