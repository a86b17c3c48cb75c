//! The output of the analysis phase: everything needed to drive redo, undo,
//! and post-replay validation without re-scanning the log.

use std::collections::HashMap;

use crate::wal::entry::{LogEntry, LSN, TxnId};
use crate::wal::reader::CorruptedEntry;

use super::state::TransactionState;

/// A key-to-transaction multimap built during analysis. Exposed to
/// collaborators for inspection; never consulted by the engine itself —
/// LSN order alone is authoritative for replay.
pub type ConflictMatrix = HashMap<Vec<u8>, Vec<TxnId>>;

/// The reconstructed shape of the log between `start_lsn` and `end_lsn`,
/// produced once by the analysis phase and consumed by redo, undo, and
/// validation without re-reading the segments.
#[derive(Debug, Clone)]
pub struct RecoveryPlan {
    pub start_lsn: LSN,
    pub end_lsn: LSN,
    pub transactions: HashMap<TxnId, TransactionState>,
    /// Non-terminal entries of `Committed` transactions, LSN-sorted.
    pub replay_list: Vec<LogEntry>,
    pub corrupted: Vec<CorruptedEntry>,
    pub conflict_matrix: ConflictMatrix,
}

impl RecoveryPlan {
    /// Transactions left `Active` or explicitly `Aborted` at crash time —
    /// the undo set, in no particular cross-transaction order (each
    /// transaction's own operations are undone in reverse LSN order).
    pub fn undo_transactions(&self) -> impl Iterator<Item = &TransactionState> {
        self.transactions
            .values()
            .filter(|txn| !matches!(txn.status, super::state::TransactionStatus::Committed))
    }
}
