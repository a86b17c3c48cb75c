//! Configuration surface for the WAL and recovery engine.
//!
//! A single [`WalConfig`] aggregates every tunable named in the external
//! interface, following the rest of the engine's one-struct-per-subsystem
//! convention (c.f. `WALConfig`, `RecoveryConfig`).

use std::path::PathBuf;
use std::time::Duration;

use crate::wal::entry::LSN;

/// How an appended entry is made durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// fsync after every append.
    Sync,
    /// Buffer appends; a background task flushes on `sync_interval`.
    Buffered,
    /// Buffer appends; fsync is deferred until an explicit batch boundary
    /// (typically a Commit record).
    Batched,
}

/// How strictly the validator and reader treat invariant violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    /// Fail on the first violation.
    Strict,
    /// Collect violations and continue.
    Relaxed,
    /// Bypass validation entirely. Only for explicit performance testing.
    Skip,
}

/// Configuration for [`crate::wal::manager::FileManager`] and
/// [`crate::recovery::RecoveryEngine`].
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Base directory holding active segments and the `archive/` subdir.
    pub wal_dir: PathBuf,
    /// Rotation size threshold.
    pub max_segment_bytes: u64,
    /// Rotation age threshold.
    pub max_segment_age: Duration,
    /// In-memory write buffer size for buffered/batched modes.
    pub buffer_bytes: usize,
    /// Durability mode for the append path.
    pub sync_mode: SyncMode,
    /// Background flush period for buffered mode.
    pub sync_interval: Duration,
    /// Age after which a non-current segment is archived, and an archived
    /// segment is deleted.
    pub retention: Duration,
    /// Validation strictness for the reader and recovery validator.
    pub validation_mode: ValidationMode,
    /// Per-entry replay retry cap during redo.
    pub max_recovery_retries: u32,
    /// Backoff between redo retries.
    pub recovery_retry_delay: Duration,
    /// Enter safe mode instead of failing recovery outright.
    pub safe_mode_on_failure: bool,
    /// Run the post-replay consistency checks of §8.
    pub consistency_checks: bool,
    /// Re-verify per-file CRCs after replay.
    pub integrity_checks: bool,
    /// Lower bound below which the analysis scan need not look — the data
    /// stores already reflect everything at or below this LSN. Maintained
    /// by the collaborator; the log itself never mutates it.
    pub checkpoint_lsn: LSN,
}

impl WalConfig {
    /// Build a config rooted at `wal_dir` with every other field at its
    /// documented default.
    pub fn new(wal_dir: impl Into<PathBuf>) -> Self {
        Self {
            wal_dir: wal_dir.into(),
            ..Self::default()
        }
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.wal_dir.join("archive")
    }

    pub fn crash_marker_path(&self) -> PathBuf {
        self.wal_dir.join("crash_detection.lock")
    }

    pub fn safe_mode_marker_path(&self) -> PathBuf {
        self.wal_dir.join("safe_mode.lock")
    }

    pub fn recovery_dir_lock_path(&self) -> PathBuf {
        self.wal_dir.join("recovery.lock")
    }
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            wal_dir: PathBuf::from("./wal"),
            max_segment_bytes: 64 * 1024 * 1024,
            max_segment_age: Duration::from_secs(60 * 60),
            buffer_bytes: 64 * 1024,
            sync_mode: SyncMode::Sync,
            sync_interval: Duration::from_secs(1),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            validation_mode: ValidationMode::Strict,
            max_recovery_retries: 3,
            recovery_retry_delay: Duration::from_millis(50),
            safe_mode_on_failure: true,
            consistency_checks: true,
            integrity_checks: true,
            checkpoint_lsn: 0,
        }
    }
}
