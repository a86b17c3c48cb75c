//! Crash recovery engine (component C6): unclean-shutdown detection,
//! segment scan, transaction-state reconstruction, ARIES-style redo/undo,
//! post-replay validation, and the read-only safe-mode fallback.

use std::collections::HashMap;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::{ValidationMode, WalConfig};
use crate::error::WalError;
use crate::wal::entry::{LogEntry, OpType, TxnId, LSN};
use crate::wal::reader::SegmentReader;
use crate::wal::validator::Validator;

use super::context::ReplayContext;
use super::marker::{self, RecoveryDirLock, SafeModeMarker};
use super::plan::RecoveryPlan;
use super::state::{RecoveryStatus, TransactionState, TransactionStatus};

/// The collaborator-supplied callback the engine drives during redo and
/// undo. A trait rather than a bare closure so recovery can be driven by
/// any data store (key/value, document, columnar) without the engine
/// depending on one of them.
///
/// Implementations must be idempotent: the engine may replay the same
/// entry more than once across a retry.
pub trait ReplayCallback: Send + Sync {
    fn apply_entry(&self, entry: &LogEntry, ctx: &ReplayContext) -> Result<(), WalError>;
}

/// Blanket impl so a plain closure can be used directly in tests and small
/// collaborators without defining a named type.
impl<F> ReplayCallback for F
where
    F: Fn(&LogEntry, &ReplayContext) -> Result<(), WalError> + Send + Sync,
{
    fn apply_entry(&self, entry: &LogEntry, ctx: &ReplayContext) -> Result<(), WalError> {
        self(entry, ctx)
    }
}

/// What a completed `startup` call found.
#[derive(Debug, Clone)]
pub enum RecoveryOutcome {
    /// The crash marker was absent: the previous run shut down cleanly and
    /// no replay was necessary.
    CleanShutdown,
    /// Replay ran to completion and validation passed. Carries the plan so
    /// callers can inspect what was redone/undone.
    Recovered(RecoveryPlan),
    /// Validation failed and `safe_mode_on_failure` was set; the engine is
    /// now read-only until an operator clears the marker.
    SafeMode(SafeModeMarker),
}

enum ValidationOutcome {
    Clean,
    Failed { errors: usize, detail: String },
}

/// Drives the startup flow described in §4.6: crash detection, analysis,
/// redo, undo, and post-replay validation.
pub struct RecoveryEngine {
    config: WalConfig,
    status_tx: watch::Sender<RecoveryStatus>,
}

impl RecoveryEngine {
    pub fn new(config: WalConfig) -> Self {
        let (status_tx, _rx) = watch::channel(RecoveryStatus::Idle);
        Self { config, status_tx }
    }

    /// Subscribe to state-machine transitions as they happen.
    pub fn subscribe(&self) -> watch::Receiver<RecoveryStatus> {
        self.status_tx.subscribe()
    }

    pub fn status(&self) -> RecoveryStatus {
        *self.status_tx.borrow()
    }

    fn set_status(&self, status: RecoveryStatus) {
        let _ = self.status_tx.send(status);
    }

    /// Run the full startup flow. Call once, before accepting new writes.
    /// On `SafeMode`, the caller must reject writes until the operator
    /// clears `safe_mode.lock` and a subsequent `startup` call validates
    /// cleanly.
    pub async fn startup(
        &self,
        callback: &dyn ReplayCallback,
    ) -> Result<RecoveryOutcome, WalError> {
        let crash_marker = self.config.crash_marker_path();

        if marker::safe_mode_marker_present(&self.config.safe_mode_marker_path()) {
            let existing = marker::read_safe_mode_marker(&self.config.safe_mode_marker_path())?
                .unwrap_or_else(|| SafeModeMarker::new("safe mode marker present", 0));
            warn!(reason = %existing.reason, "refusing startup: safe mode marker still present");
            self.set_status(RecoveryStatus::Failed);
            return Ok(RecoveryOutcome::SafeMode(existing));
        }

        let outcome = if !marker::crash_marker_present(&crash_marker) {
            self.set_status(RecoveryStatus::Completed);
            RecoveryOutcome::CleanShutdown
        } else {
            info!("crash marker present, running recovery");
            self.recover(callback).await?
        };

        marker::write_crash_marker(&crash_marker)?;
        Ok(outcome)
    }

    /// Clear the crash marker on a clean shutdown. Idempotent.
    pub fn shutdown(&self) -> Result<(), WalError> {
        marker::clear_crash_marker(&self.config.crash_marker_path())
    }

    async fn recover(&self, callback: &dyn ReplayCallback) -> Result<RecoveryOutcome, WalError> {
        self.set_status(RecoveryStatus::Analyzing);
        let dir_lock = RecoveryDirLock::acquire(self.config.recovery_dir_lock_path())?;

        let plan = match self.analyze() {
            Ok(plan) => plan,
            Err(err) => {
                drop(dir_lock);
                return self.fail_or_safe_mode(format!("analysis failed: {err}"), 1);
            }
        };
        info!(
            txns = plan.transactions.len(),
            replay = plan.replay_list.len(),
            corrupted = plan.corrupted.len(),
            "analysis complete"
        );

        let mut ctx = ReplayContext::new(plan.conflict_matrix.clone(), plan.start_lsn);
        for txn in plan.transactions.values() {
            match txn.status {
                TransactionStatus::Active => {
                    ctx.active_txns.insert(txn.txn_id, txn.clone());
                }
                TransactionStatus::Committed => {
                    ctx.committed_txns.insert(txn.txn_id, txn.clone());
                }
                TransactionStatus::Aborted => {
                    ctx.aborted_txns.insert(txn.txn_id, txn.clone());
                }
            }
        }

        self.set_status(RecoveryStatus::Replaying);
        if let Err(err) = self.redo(&plan, &mut ctx, callback).await {
            drop(dir_lock);
            return self.fail_or_safe_mode(format!("redo failed: {err}"), 1);
        }
        if let Err(err) = self.undo(&plan, &mut ctx, callback).await {
            drop(dir_lock);
            return self.fail_or_safe_mode(format!("undo failed: {err}"), 1);
        }

        self.set_status(RecoveryStatus::Validating);
        let validation = if self.config.consistency_checks {
            self.validate(&plan)?
        } else {
            ValidationOutcome::Clean
        };
        drop(dir_lock);

        match validation {
            ValidationOutcome::Clean => {
                self.set_status(RecoveryStatus::Completed);
                Ok(RecoveryOutcome::Recovered(plan))
            }
            ValidationOutcome::Failed { errors, detail } => {
                self.fail_or_safe_mode(detail, errors)
            }
        }
    }

    fn fail_or_safe_mode(
        &self,
        reason: String,
        errors: usize,
    ) -> Result<RecoveryOutcome, WalError> {
        self.set_status(RecoveryStatus::Failed);
        if self.config.safe_mode_on_failure {
            let marker = SafeModeMarker::new(reason.clone(), errors);
            marker::write_safe_mode_marker(&self.config.safe_mode_marker_path(), &marker)?;
            warn!(reason = %reason, errors, "recovery entering safe mode");
            Ok(RecoveryOutcome::SafeMode(marker))
        } else {
            Err(WalError::RecoveryFailed(reason))
        }
    }

    /// Scan the log from the checkpoint LSN (or LSN 1) and reconstruct a
    /// transaction table, conflict matrix, and redo list. See §4.6.2.
    fn analyze(&self) -> Result<RecoveryPlan, WalError> {
        let reader = SegmentReader::new(&self.config.wal_dir, self.config.validation_mode);
        let from_lsn = self.config.checkpoint_lsn.max(1);
        let (entries, corrupted) = reader.read_from_lsn(from_lsn)?;

        let mut transactions: HashMap<u64, TransactionState> = HashMap::new();
        let mut conflict_matrix = HashMap::new();
        let mut start_lsn: Option<LSN> = None;
        let mut end_lsn: LSN = from_lsn.saturating_sub(1);
        let mut seen_lsns = std::collections::HashSet::with_capacity(entries.len());

        for entry in &entries {
            if !seen_lsns.insert(entry.lsn) {
                return Err(WalError::invalid_lsn(format!(
                    "duplicate lsn {} observed during analysis",
                    entry.lsn
                )));
            }
            start_lsn.get_or_insert(entry.lsn);
            end_lsn = entry.lsn;

            let txn = transactions
                .entry(entry.txn_id)
                .or_insert_with(|| TransactionState::new(entry.txn_id, entry.lsn));

            match entry.op_type {
                crate::wal::entry::OpType::Commit => txn.mark_committed(entry.lsn),
                crate::wal::entry::OpType::Abort => txn.mark_aborted(entry.lsn),
                _ => {
                    if !entry.key.is_empty() {
                        conflict_matrix
                            .entry(entry.key.clone())
                            .or_insert_with(Vec::new)
                            .push(entry.txn_id);
                    }
                    txn.push_operation(entry.clone());
                }
            }
        }

        let mut replay_list: Vec<LogEntry> = transactions
            .values()
            .flat_map(|txn| txn.redo_entries().to_vec())
            .collect();
        replay_list.sort_by_key(|e| e.lsn);

        Ok(RecoveryPlan {
            start_lsn: start_lsn.unwrap_or(from_lsn),
            end_lsn,
            transactions,
            replay_list,
            corrupted,
            conflict_matrix,
        })
    }

    /// Forward-apply every operation belonging to a `Committed` transaction,
    /// in LSN order, retrying transient failures up to the configured cap.
    async fn redo(
        &self,
        plan: &RecoveryPlan,
        ctx: &mut ReplayContext,
        callback: &dyn ReplayCallback,
    ) -> Result<(), WalError> {
        for entry in &plan.replay_list {
            self.apply_with_retries(entry, ctx, callback).await?;
        }
        Ok(())
    }

    /// Reverse-apply synthesized undo entries for every `Active` or
    /// `Aborted` transaction, one transaction's operations in reverse LSN
    /// order, crossing transactions in no particular order (each is
    /// independent once redo has settled the committed state).
    async fn undo(
        &self,
        plan: &RecoveryPlan,
        ctx: &mut ReplayContext,
        callback: &dyn ReplayCallback,
    ) -> Result<(), WalError> {
        let mut txns: Vec<&TransactionState> = plan.undo_transactions().collect();
        txns.sort_by_key(|txn| txn.txn_id);

        for txn in txns {
            for undo_entry in txn.undo_entries() {
                self.apply_with_retries(&undo_entry, ctx, callback).await?;
            }
        }
        Ok(())
    }

    async fn apply_with_retries(
        &self,
        entry: &LogEntry,
        ctx: &mut ReplayContext,
        callback: &dyn ReplayCallback,
    ) -> Result<(), WalError> {
        let mut attempt = 0u32;
        loop {
            match callback.apply_entry(entry, ctx) {
                Ok(()) => {
                    ctx.record_applied(entry);
                    return Ok(());
                }
                Err(err) if attempt < self.config.max_recovery_retries => {
                    attempt += 1;
                    warn!(
                        lsn = entry.lsn,
                        attempt,
                        error = %err,
                        "replay callback failed, retrying"
                    );
                    tokio::time::sleep(self.config.recovery_retry_delay).await;
                }
                Err(err) => {
                    return Err(WalError::RecoveryFailed(format!(
                        "lsn {} exceeded {} replay retries: {err}",
                        entry.lsn, self.config.max_recovery_retries
                    )));
                }
            }
        }
    }

    /// Re-scan the log in strict mode and re-verify per-file integrity.
    /// Matches the universal invariant that LSN order stays monotonic and
    /// every committed transaction's Commit record is still present.
    fn validate(&self, plan: &RecoveryPlan) -> Result<ValidationOutcome, WalError> {
        let reader = SegmentReader::new(&self.config.wal_dir, ValidationMode::Strict);
        let scan = reader.read_from_lsn(1);

        let (entries, corrupted) = match scan {
            Ok(result) => result,
            Err(err) => {
                return Ok(ValidationOutcome::Failed {
                    errors: 1,
                    detail: format!("post-replay re-scan failed: {err}"),
                });
            }
        };

        if self.config.integrity_checks && !corrupted.is_empty() {
            return Ok(ValidationOutcome::Failed {
                errors: corrupted.len(),
                detail: format!("{} corrupted entries survived replay", corrupted.len()),
            });
        }

        let validator = Validator::new(ValidationMode::Strict);
        match validator.validate_sequence(&entries) {
            Ok(report) if report.is_clean() => {}
            Ok(report) => {
                return Ok(ValidationOutcome::Failed {
                    errors: report.violations.len(),
                    detail: "post-replay sequence validation found violations".to_string(),
                });
            }
            Err(err) => {
                return Ok(ValidationOutcome::Failed {
                    errors: 1,
                    detail: format!("post-replay sequence validation failed: {err}"),
                });
            }
        }

        let committed_without_commit_record: Vec<TxnId> = plan
            .transactions
            .values()
            .filter(|txn| matches!(txn.status, TransactionStatus::Committed))
            .filter(|txn| {
                !entries
                    .iter()
                    .any(|e| e.txn_id == txn.txn_id && e.op_type == OpType::Commit)
            })
            .map(|txn| txn.txn_id)
            .collect();

        if !committed_without_commit_record.is_empty() {
            return Ok(ValidationOutcome::Failed {
                errors: committed_without_commit_record.len(),
                detail: format!(
                    "{} transaction(s) marked committed lack a surviving Commit record: {committed_without_commit_record:?}",
                    committed_without_commit_record.len()
                ),
            });
        }

        Ok(ValidationOutcome::Clean)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::entry::LogEntry;
    use crate::wal::manager::FileManager;
    use std::sync::Mutex;

    struct RecordingCallback {
        state: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    }

    impl RecordingCallback {
        fn new() -> Self {
            Self {
                state: Mutex::new(HashMap::new()),
            }
        }

        fn snapshot(&self) -> HashMap<Vec<u8>, Vec<u8>> {
            self.state.lock().unwrap().clone()
        }
    }

    impl ReplayCallback for RecordingCallback {
        fn apply_entry(&self, entry: &LogEntry, _ctx: &ReplayContext) -> Result<(), WalError> {
            let mut state = self.state.lock().unwrap();
            match entry.op_type {
                crate::wal::entry::OpType::Insert | crate::wal::entry::OpType::Update => {
                    state.insert(entry.key.clone(), entry.value.clone());
                }
                crate::wal::entry::OpType::Delete => {
                    state.remove(&entry.key);
                }
                crate::wal::entry::OpType::Commit | crate::wal::entry::OpType::Abort => {}
            }
            Ok(())
        }
    }

    fn test_config(dir: &std::path::Path) -> WalConfig {
        let mut config = WalConfig::new(dir);
        config.validation_mode = ValidationMode::Relaxed;
        config
    }

    #[tokio::test]
    async fn clean_shutdown_skips_replay() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let engine = RecoveryEngine::new(config);
        let callback = RecordingCallback::new();

        let outcome = engine.startup(&callback).await.unwrap();
        assert!(matches!(outcome, RecoveryOutcome::CleanShutdown));
        assert!(callback.snapshot().is_empty());
    }

    #[tokio::test]
    async fn s1_commit_survives_crash() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        {
            let manager = FileManager::open(config.clone()).await.unwrap();
            manager
                .write_entry(LogEntry::insert(1, b"a".to_vec(), b"1".to_vec()))
                .unwrap();
            manager.write_entry(LogEntry::commit(1)).unwrap();
            manager.sync().unwrap();
            manager.close().await.unwrap();
        }
        marker::write_crash_marker(&config.crash_marker_path()).unwrap();

        let engine = RecoveryEngine::new(config);
        let callback = RecordingCallback::new();
        let outcome = engine.startup(&callback).await.unwrap();

        assert!(matches!(outcome, RecoveryOutcome::Recovered(_)));
        assert_eq!(callback.snapshot().get(b"a".as_slice()), Some(&b"1".to_vec()));
    }

    #[tokio::test]
    async fn s2_abort_is_skipped_and_undone() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        {
            let manager = FileManager::open(config.clone()).await.unwrap();
            manager
                .write_entry(LogEntry::insert(2, b"b".to_vec(), b"2".to_vec()))
                .unwrap();
            manager.write_entry(LogEntry::abort(2)).unwrap();
            manager.sync().unwrap();
            manager.close().await.unwrap();
        }
        marker::write_crash_marker(&config.crash_marker_path()).unwrap();

        let engine = RecoveryEngine::new(config);
        let callback = RecordingCallback::new();
        let outcome = engine.startup(&callback).await.unwrap();

        match outcome {
            RecoveryOutcome::Recovered(plan) => assert!(plan.replay_list.is_empty()),
            other => panic!("expected Recovered, got {other:?}"),
        }
        assert!(callback.snapshot().get(b"b".as_slice()).is_none());
    }

    #[tokio::test]
    async fn s3_incomplete_txn_is_classified_active_and_undone() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        {
            let manager = FileManager::open(config.clone()).await.unwrap();
            manager
                .write_entry(LogEntry::insert(3, b"c".to_vec(), b"3".to_vec()))
                .unwrap();
            manager.sync().unwrap();
            manager.close().await.unwrap();
        }
        marker::write_crash_marker(&config.crash_marker_path()).unwrap();

        let engine = RecoveryEngine::new(config);
        let callback = RecordingCallback::new();
        let outcome = engine.startup(&callback).await.unwrap();

        match outcome {
            RecoveryOutcome::Recovered(plan) => {
                let txn = &plan.transactions[&3];
                assert_eq!(txn.status as u8, TransactionStatus::Active as u8);
            }
            other => panic!("expected Recovered, got {other:?}"),
        }
        assert!(callback.snapshot().get(b"c".as_slice()).is_none());
    }

    #[tokio::test]
    async fn s5_checksum_tamper_enters_safe_mode() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.validation_mode = ValidationMode::Strict;
        config.safe_mode_on_failure = true;
        {
            let manager = FileManager::open(config.clone()).await.unwrap();
            for i in 0..5u64 {
                manager
                    .write_entry(LogEntry::insert(1, format!("k{i}"), format!("v{i}")))
                    .unwrap();
            }
            manager.sync().unwrap();
            manager.close().await.unwrap();
        }

        // Flip a bit inside the third entry's payload.
        let segment_path = crate::wal::layout::segment_path(dir.path(), 0);
        let mut bytes = std::fs::read(&segment_path).unwrap();
        let target = crate::wal::entry::HEADER_SIZE + 4;
        bytes[target] ^= 0xFF;
        std::fs::write(&segment_path, bytes).unwrap();

        marker::write_crash_marker(&config.crash_marker_path()).unwrap();

        let engine = RecoveryEngine::new(config.clone());
        let callback = RecordingCallback::new();
        let outcome = engine.startup(&callback).await.unwrap();

        match outcome {
            RecoveryOutcome::SafeMode(marker) => assert_eq!(marker.errors, 1),
            other => panic!("expected SafeMode, got {other:?}"),
        }
        assert!(marker::safe_mode_marker_present(&config.safe_mode_marker_path()));
    }

    #[tokio::test]
    async fn validate_rejects_a_committed_txn_whose_commit_record_vanished() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        {
            let manager = FileManager::open(config.clone()).await.unwrap();
            manager
                .write_entry(LogEntry::insert(1, b"a".to_vec(), b"1".to_vec()))
                .unwrap();
            manager.write_entry(LogEntry::commit(1)).unwrap();
            manager.sync().unwrap();
            manager.close().await.unwrap();
        }

        let engine = RecoveryEngine::new(config.clone());
        let plan = engine.analyze().unwrap();
        assert_eq!(
            plan.transactions[&1].status as u8,
            TransactionStatus::Committed as u8
        );

        // Drop the Commit record from the segment without re-running
        // analysis, simulating a plan that has gone stale relative to disk.
        let segment_path = crate::wal::layout::segment_path(dir.path(), 0);
        let bytes = std::fs::read(&segment_path).unwrap();
        let insert_len = crate::wal::entry::peek_record_len(&bytes).unwrap();
        std::fs::write(&segment_path, &bytes[..insert_len]).unwrap();

        let outcome = engine.validate(&plan).unwrap();
        match outcome {
            ValidationOutcome::Failed { errors, .. } => assert_eq!(errors, 1),
            ValidationOutcome::Clean => panic!("expected validation to fail"),
        }
    }
}
