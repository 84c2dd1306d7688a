//! Typed error taxonomy for coordination operations.
//!
//! The coordinator never retries internally. Every operation returns a
//! `CoordError` and the caller (or the [`crate::retry`] wrapper) decides what
//! to do with it. Only [`CoordError::LockTimeout`] and
//! [`CoordError::Workspace`] are transient; everything else is either a
//! caller logic error or a business-rule rejection and must surface
//! immediately.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias for coordination operations.
pub type CoordResult<T> = Result<T, CoordError>;

#[derive(Debug, Error)]
pub enum CoordError {
    /// Failed to acquire a record lock within the configured budget.
    #[error("timed out acquiring lock {path} after {waited_ms}ms")]
    LockTimeout { path: PathBuf, waited_ms: u64 },

    /// The transition table has no entry for `(state, event)`.
    #[error("{entity} '{id}': no transition from '{state}' on event '{event}'")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        state: String,
        event: String,
    },

    /// A guard predicate rejected an otherwise legal transition.
    #[error("{entity} '{id}': guard '{guard}' rejected event '{event}': {reason}")]
    GuardRejected {
        entity: &'static str,
        id: String,
        event: String,
        guard: String,
        reason: String,
    },

    /// The task is already owned by another session.
    #[error("task '{task}' is already claimed by session '{owner}'")]
    ClaimConflict { task: String, owner: String },

    /// The validator already submitted a report for this round.
    #[error("validator '{validator}' already reported for round {round} of task '{task}'")]
    DuplicateReport {
        task: String,
        round: u32,
        validator: String,
    },

    /// The round was already promoted or rejected.
    #[error("round {round} of task '{task}' is closed")]
    RoundClosed { task: String, round: u32 },

    /// Promotion refused; `missing` names the cluster members or validators
    /// whose evidence is absent.
    #[error("promotion denied for task '{task}': {reason}")]
    PromotionDenied {
        task: String,
        reason: String,
        missing: Vec<String>,
    },

    /// No record exists for the given id.
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    /// An id failed slug validation (charset, length, path safety).
    #[error("invalid {kind} id '{id}': {reason}")]
    InvalidId {
        kind: &'static str,
        id: String,
        reason: String,
    },

    /// Workspace materialization failed; the descriptor stays at `creating`
    /// and the operation may be retried.
    #[error("workspace operation failed for session '{session}': {message}")]
    Workspace { session: String, message: String },

    /// Storage plumbing failure (serialization, filesystem).
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl CoordError {
    /// True for errors a resilience layer may retry with backoff.
    ///
    /// Guard failures and table rejections are caller logic errors and must
    /// never be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordError::LockTimeout { .. } | CoordError::Workspace { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_timeout_is_retryable() {
        let err = CoordError::LockTimeout {
            path: PathBuf::from("/tmp/x.lock"),
            waited_ms: 5000,
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn guard_and_claim_errors_are_not_retryable() {
        let guard = CoordError::GuardRejected {
            entity: "task",
            id: "t1".to_string(),
            event: "validate".to_string(),
            guard: "bundle_approved".to_string(),
            reason: "no approved bundle".to_string(),
        };
        let claim = CoordError::ClaimConflict {
            task: "t1".to_string(),
            owner: "s1".to_string(),
        };
        assert!(!guard.is_retryable());
        assert!(!claim.is_retryable());
    }

    #[test]
    fn promotion_denied_names_missing_members() {
        let err = CoordError::PromotionDenied {
            task: "t1".to_string(),
            reason: "round 1 incomplete".to_string(),
            missing: vec!["performance".to_string()],
        };
        assert!(err.to_string().contains("t1"));
        assert!(!err.is_retryable());
    }
}
