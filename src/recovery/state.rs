//! Transaction-state reconstruction used by the analysis phase (part of C6)
//! and the data model that feeds the replay context (C7).

use crate::wal::entry::{LogEntry, LSN, TxnId};

/// Where the [`RecoveryEngine`](super::engine::RecoveryEngine) is in its
/// startup state machine. Reported through a `tokio::sync::watch` channel
/// so a caller can observe phase transitions without polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStatus {
    Idle,
    Analyzing,
    Replaying,
    Validating,
    Completed,
    Failed,
}

/// A transaction's outcome as reconstructed from the log, independent of
/// whatever the transaction coordinator believed before the crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// No terminal record was found — the crash interrupted this txn.
    Active,
    Committed,
    Aborted,
}

/// Everything the recovery engine knows about one transaction after the
/// analysis phase. Not persisted; rebuilt from the log on every recovery.
#[derive(Debug, Clone)]
pub struct TransactionState {
    pub txn_id: TxnId,
    pub status: TransactionStatus,
    /// Non-terminal (Insert/Update/Delete) entries, in LSN order.
    pub operations: Vec<LogEntry>,
    pub start_lsn: LSN,
    pub end_lsn: Option<LSN>,
}

impl TransactionState {
    pub fn new(txn_id: TxnId, start_lsn: LSN) -> Self {
        Self {
            txn_id,
            status: TransactionStatus::Active,
            operations: Vec::new(),
            start_lsn,
            end_lsn: None,
        }
    }

    pub fn push_operation(&mut self, entry: LogEntry) {
        self.operations.push(entry);
    }

    pub fn mark_committed(&mut self, lsn: LSN) {
        self.status = TransactionStatus::Committed;
        self.end_lsn = Some(lsn);
    }

    pub fn mark_aborted(&mut self, lsn: LSN) {
        self.status = TransactionStatus::Aborted;
        self.end_lsn = Some(lsn);
    }

    /// The redo contribution of this transaction: its own operations,
    /// already in LSN order, if and only if it committed. Empty otherwise.
    pub fn redo_entries(&self) -> &[LogEntry] {
        match self.status {
            TransactionStatus::Committed => &self.operations,
            TransactionStatus::Active | TransactionStatus::Aborted => &[],
        }
    }

    /// Synthesized inverse entries in reverse application order, for
    /// `Active` and `Aborted` transactions. Empty for `Committed`.
    pub fn undo_entries(&self) -> Vec<LogEntry> {
        match self.status {
            TransactionStatus::Committed => Vec::new(),
            TransactionStatus::Active | TransactionStatus::Aborted => self
                .operations
                .iter()
                .rev()
                .filter_map(|op| {
                    let mut undo = op.undo_of()?;
                    // Stamp with the original op's lsn so the rollback log
                    // stays traceable to the record that prompted the undo;
                    // synthesized undo entries are never themselves written.
                    undo.lsn = op.lsn;
                    Some(undo)
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::entry::LogEntry;

    #[test]
    fn undo_entries_reverse_and_invert_operations() {
        let mut txn = TransactionState::new(1, 1);
        txn.push_operation({
            let mut e = LogEntry::insert(1, b"a".to_vec(), b"1".to_vec());
            e.lsn = 1;
            e
        });
        txn.push_operation({
            let mut e = LogEntry::update(1, b"a".to_vec(), b"2".to_vec(), b"1".to_vec());
            e.lsn = 2;
            e
        });
        txn.mark_aborted(3);

        let undo = txn.undo_entries();
        assert_eq!(undo.len(), 2);
        // Reverse order: the update's undo comes first, then the insert's.
        assert_eq!(undo[0].value, b"1");
        assert_eq!(undo[1].key, b"a");
        assert_eq!(undo[1].old_value, b"1");
    }

    #[test]
    fn redo_entries_empty_unless_committed() {
        let mut active = TransactionState::new(1, 1);
        active.push_operation(LogEntry::insert(1, b"a".to_vec(), b"1".to_vec()));
        assert!(active.redo_entries().is_empty());

        let mut committed = TransactionState::new(2, 1);
        committed.push_operation(LogEntry::insert(2, b"b".to_vec(), b"2".to_vec()));
        committed.mark_committed(2);
        assert_eq!(committed.redo_entries().len(), 1);
    }
}
