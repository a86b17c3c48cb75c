//! Crash recovery: unclean-shutdown detection, segment scan,
//! transaction-state reconstruction, ARIES-style redo/undo, and the
//! read-only safe-mode fallback.
//!
//! | Module | Responsibility |
//! |---|---|
//! | [`state`] | `TransactionState`/`RecoveryStatus` — the analysis output shape |
//! | [`plan`] | `RecoveryPlan` — analysis result consumed by redo/undo/validation |
//! | [`context`] | `ReplayContext` (C7) handed to the collaborator's callback |
//! | [`marker`] | Crash marker, safe-mode marker, and the recovery directory lock |
//! | [`engine`] | `RecoveryEngine` (C6) — the startup state machine itself |

pub mod context;
pub mod engine;
pub mod marker;
pub mod plan;
pub mod state;

pub use context::{ReplayContext, RollbackLogEntry};
pub use engine::{RecoveryEngine, RecoveryOutcome, ReplayCallback};
pub use marker::SafeModeMarker;
pub use plan::{ConflictMatrix, RecoveryPlan};
pub use state::{RecoveryStatus, TransactionState, TransactionStatus};
