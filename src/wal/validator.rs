//! Per-entry and per-sequence invariant checks (component C5).
//!
//! The entry codec already rejects a malformed frame or a failed checksum
//! at decode time; this module checks the invariants that only make sense
//! across a sequence of already-decoded entries — LSN monotonicity, no
//! duplicate LSNs, and (outside `Skip` mode) that every op_type is one of
//! the five enumerated values, which `OpType::from_u32` already guarantees
//! by construction but is re-asserted here defensively for entries that
//! arrive from a source other than [`crate::wal::entry::decode`].

use std::collections::HashSet;

use crate::config::ValidationMode;
use crate::error::WalError;
use crate::wal::entry::{LogEntry, OpType};

/// A single invariant violation found while validating a sequence.
#[derive(Debug, Clone)]
pub struct ValidationViolation {
    pub lsn: u64,
    pub detail: String,
}

/// Result of validating a full sequence in `Relaxed` or `Skip` mode, where
/// violations are collected rather than raised immediately.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub violations: Vec<ValidationViolation>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Validates a sequence of decoded entries against the configured mode.
pub struct Validator {
    mode: ValidationMode,
}

impl Validator {
    pub fn new(mode: ValidationMode) -> Self {
        Self { mode }
    }

    /// Check `entries` (assumed already sorted by LSN by the reader).
    /// `Strict` returns the first violation as an error; `Relaxed` collects
    /// every violation into the returned report; `Skip` returns an empty
    /// report without inspecting anything.
    pub fn validate_sequence(&self, entries: &[LogEntry]) -> Result<ValidationReport, WalError> {
        if self.mode == ValidationMode::Skip {
            return Ok(ValidationReport::default());
        }

        let mut report = ValidationReport::default();
        let mut seen_lsns = HashSet::with_capacity(entries.len());
        let mut previous_lsn: Option<u64> = None;

        for entry in entries {
            if entry.lsn == 0 {
                let violation = ValidationViolation {
                    lsn: entry.lsn,
                    detail: "lsn 0 is reserved and never valid".to_string(),
                };
                if self.raise_or_collect(violation, &mut report)? {
                    return Ok(report);
                }
            }

            if !seen_lsns.insert(entry.lsn) {
                let violation = ValidationViolation {
                    lsn: entry.lsn,
                    detail: format!("duplicate lsn {}", entry.lsn),
                };
                if self.raise_or_collect(violation, &mut report)? {
                    return Ok(report);
                }
            }

            if let Some(previous) = previous_lsn {
                if entry.lsn <= previous {
                    let violation = ValidationViolation {
                        lsn: entry.lsn,
                        detail: format!("lsn {} does not follow previous lsn {previous}", entry.lsn),
                    };
                    if self.raise_or_collect(violation, &mut report)? {
                        return Ok(report);
                    }
                }
            }

            if entry.txn_id == 0 {
                let violation = ValidationViolation {
                    lsn: entry.lsn,
                    detail: "txn_id 0 is reserved and never valid".to_string(),
                };
                if self.raise_or_collect(violation, &mut report)? {
                    return Ok(report);
                }
            }

            if entry.op_type.is_data_op() && entry.key.is_empty() {
                let violation = ValidationViolation {
                    lsn: entry.lsn,
                    detail: format!("{:?} at lsn {} must carry a non-empty key", entry.op_type, entry.lsn),
                };
                if self.raise_or_collect(violation, &mut report)? {
                    return Ok(report);
                }
            }

            if self.mode == ValidationMode::Strict
                && entry.op_type == OpType::Insert
                && entry.value.is_empty()
            {
                let violation = ValidationViolation {
                    lsn: entry.lsn,
                    detail: format!("Insert at lsn {} must carry a non-empty value in strict mode", entry.lsn),
                };
                if self.raise_or_collect(violation, &mut report)? {
                    return Ok(report);
                }
            }

            previous_lsn = Some(entry.lsn);
        }

        Ok(report)
    }

    /// Returns `Ok(true)` when the caller should stop immediately because
    /// `Strict` mode turned the violation into a hard error. Never called
    /// in `Skip` mode, since `validate_sequence` returns before inspecting
    /// anything in that mode.
    fn raise_or_collect(
        &self,
        violation: ValidationViolation,
        report: &mut ValidationReport,
    ) -> Result<bool, WalError> {
        match self.mode {
            ValidationMode::Strict => Err(WalError::invalid_lsn(violation.detail)),
            ValidationMode::Relaxed => {
                report.violations.push(violation);
                Ok(false)
            }
            ValidationMode::Skip => Ok(false),
        }
    }
}
