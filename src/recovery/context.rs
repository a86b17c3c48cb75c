//! Replay Context (component C7): the in-memory transaction-state table and
//! conflict graph a collaborator's `apply_entry` callback can inspect while
//! redo/undo are in flight.

use std::collections::HashMap;

use crate::wal::entry::{LogEntry, OpType, LSN, TxnId};

use super::plan::ConflictMatrix;
use super::state::TransactionState;

/// One entry in the ordered undo/redo trail recorded as replay proceeds.
/// Kept for observability and for collaborators that want to audit what
/// the engine actually applied, distinct from what the log itself records.
#[derive(Debug, Clone)]
pub struct RollbackLogEntry {
    pub txn_id: TxnId,
    pub lsn: LSN,
    pub operation: OpType,
    pub timestamp: i64,
}

/// The view a `ReplayCallback` receives alongside each entry it is asked to
/// apply. Single-threaded for the duration of one recovery run — the
/// engine never hands out a context while replay is still mutating it.
#[derive(Debug, Clone)]
pub struct ReplayContext {
    pub active_txns: HashMap<TxnId, TransactionState>,
    pub committed_txns: HashMap<TxnId, TransactionState>,
    pub aborted_txns: HashMap<TxnId, TransactionState>,
    pub conflict_matrix: ConflictMatrix,
    pub rollback_log: Vec<RollbackLogEntry>,
    pub checkpoint_lsn: LSN,
}

impl ReplayContext {
    pub fn new(conflict_matrix: ConflictMatrix, checkpoint_lsn: LSN) -> Self {
        Self {
            active_txns: HashMap::new(),
            committed_txns: HashMap::new(),
            aborted_txns: HashMap::new(),
            conflict_matrix,
            rollback_log: Vec::new(),
            checkpoint_lsn,
        }
    }

    /// Every other transaction, besides `txn_id` itself, that touched `key`
    /// anywhere in the scanned range. Informational only — does not change
    /// replay order.
    pub fn conflicting_txns(&self, key: &[u8], txn_id: TxnId) -> Vec<TxnId> {
        self.conflict_matrix
            .get(key)
            .map(|txns| txns.iter().copied().filter(|&t| t != txn_id).collect())
            .unwrap_or_default()
    }

    pub fn record_applied(&mut self, entry: &LogEntry) {
        self.rollback_log.push(RollbackLogEntry {
            txn_id: entry.txn_id,
            lsn: entry.lsn,
            operation: entry.op_type,
            timestamp: entry.timestamp,
        });
    }
}
