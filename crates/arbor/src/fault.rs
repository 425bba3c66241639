//! # Fault Escalation
//!
//! ```text
//!   RunError ──kind()──▶ FaultKind ──FaultPolicy──▶ FaultAction
//!                                     │
//!          Configuration ─────────────┼──▶ Usage (exit 0)
//!          group already aborted ─────┼──▶ ExitLocal
//!          anything else, 1 rank ─────┼──▶ ExitLocal
//!          anything else, >1 rank ────┴──▶ AbortGroup
//! ```
//!
//! Aborting marks the whole group; every blocked collective on every rank
//! returns instead of waiting forever. Ending the process stays with the
//! caller.

use arbor_core::{GroupError, ProcessGroup};

use crate::error::{FaultKind, RunError};

/// What to do about a failed run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultAction {
    /// Print usage and exit successfully.
    Usage,
    /// Exit this process only.
    ExitLocal {
        /// Exit status.
        code: i32,
    },
    /// Abort every rank, then exit.
    AbortGroup {
        /// Abort code and exit status.
        code: i32,
    },
}

impl FaultAction {
    /// Exit status of this action.
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Usage => 0,
            Self::ExitLocal { code } | Self::AbortGroup { code } => code,
        }
    }
}

/// Chooses between local exit and group abort from the participant count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FaultPolicy {
    participants: usize,
}

impl FaultPolicy {
    /// Policy for a group of `participants` ranks.
    #[must_use]
    pub const fn new(participants: usize) -> Self {
        Self { participants }
    }

    /// Decides without side effects.
    #[must_use]
    pub fn decide(&self, err: &RunError) -> FaultAction {
        let kind = err.kind();
        let code = kind.exit_code();
        match (kind, err) {
            (FaultKind::Configuration, _) => FaultAction::Usage,
            (_, RunError::Group(GroupError::Aborted { code: peer })) => {
                FaultAction::ExitLocal { code: *peer }
            }
            _ if self.participants > 1 => FaultAction::AbortGroup { code },
            _ => FaultAction::ExitLocal { code },
        }
    }

    /// Logs `err` with the rank identity, aborts the group when the policy
    /// says so and returns the exit status.
    pub fn escalate(&self, err: &RunError, group: &dyn ProcessGroup) -> i32 {
        let action = self.decide(err);
        let rank = group.rank();
        match action {
            FaultAction::Usage => {
                tracing::error!(rank, %err, "configuration rejected");
            }
            FaultAction::ExitLocal { code } => {
                tracing::error!(rank, code, kind = ?err.kind(), %err, "process failed");
            }
            FaultAction::AbortGroup { code } => {
                tracing::error!(rank, code, kind = ?err.kind(), %err, "aborting process group");
                group.abort(code);
            }
        }
        action.exit_code()
    }
}
