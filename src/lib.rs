//! Write-ahead log and ARIES-style crash recovery for a transactional
//! storage engine: durable, checksummed log entries; segment rotation and
//! retention; and a recovery engine that replays committed work and rolls
//! back the rest on restart.
//!
//! | Module | Responsibility |
//! |---|---|
//! | [`wal`] | Entry codec, segment writer, file manager, reader, validator |
//! | [`recovery`] | Crash detection, analysis, redo/undo, safe mode |
//! | [`config`] | The tunables every subsystem above reads from |
//! | [`error`] | `WalError`, shared across the crate |

pub mod config;
pub mod error;
pub mod recovery;
pub mod wal;

pub use config::{SyncMode, ValidationMode, WalConfig};
pub use error::{Result, WalError};
pub use recovery::{RecoveryEngine, RecoveryOutcome, RecoveryPlan, ReplayCallback, ReplayContext};
pub use wal::{FileManager, LogEntry, OpType, SegmentReader, LSN, TxnId};
