//! Error types for the write-ahead log and recovery subsystem.
//!
//! Mirrors the rest of the engine's convention of a single `thiserror`-derived
//! enum per subsystem rather than a tree of nested error types.

use std::path::PathBuf;

use thiserror::Error;

use crate::wal::entry::LSN;

/// Result type alias used throughout this crate.
pub type Result<T> = std::result::Result<T, WalError>;

/// Errors surfaced by the entry codec, file manager, reader, validator, and
/// recovery engine.
#[derive(Debug, Error)]
pub enum WalError {
    /// Input too short for a header, or `payload_len` runs past the end of
    /// the buffer.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The stored CRC-32 does not match the checksum computed over the
    /// decoded bytes.
    #[error("checksum mismatch at lsn {lsn:?} (offset {offset}): {detail}")]
    ChecksumMismatch {
        lsn: Option<LSN>,
        offset: u64,
        detail: String,
    },

    /// Zero LSN, or a non-monotonic LSN encountered during a sequence check.
    #[error("invalid lsn: {0}")]
    InvalidLsn(String),

    /// Zero txn_id, or an op_type outside the five enumerated values.
    #[error("invalid transaction record: {0}")]
    InvalidTxn(String),

    /// Underlying read/write/fsync/rename failure.
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Could not create, close, or archive a segment.
    #[error("segment rotation failed: {0}")]
    RotationError(String),

    /// Replay exceeded its retry budget, or validation failed with safe mode
    /// disabled.
    #[error("recovery failed: {0}")]
    RecoveryFailed(String),

    /// The engine is in read-only safe mode; the operation was rejected.
    #[error("engine is in safe mode: {0}")]
    SafeMode(String),
}

impl WalError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        WalError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn malformed(detail: impl Into<String>) -> Self {
        WalError::MalformedFrame(detail.into())
    }

    pub fn invalid_lsn(detail: impl Into<String>) -> Self {
        WalError::InvalidLsn(detail.into())
    }

    pub fn invalid_txn(detail: impl Into<String>) -> Self {
        WalError::InvalidTxn(detail.into())
    }

    /// True for error kinds that the per-entry validator/reader should treat
    /// as a recoverable, per-entry corruption rather than a fatal condition.
    pub fn is_entry_corruption(&self) -> bool {
        matches!(
            self,
            WalError::MalformedFrame(_) | WalError::ChecksumMismatch { .. }
        )
    }
}
