//! Session records, workspace descriptors, and the session state machine.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::fsm::{GuardContext, GuardVerdict, Machine, Transition};

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Closed,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::Closed => write!(f, "closed"),
        }
    }
}

/// Events accepted by the session machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// `active -> active`: workspace descriptor advanced one step.
    AdvanceWorkspace,
    /// `active -> closed`.
    Close,
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::AdvanceWorkspace => write!(f, "advance_workspace"),
            SessionEvent::Close => write!(f, "close"),
        }
    }
}

/// Guard tags for session transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionGuard {
    /// A closed session holds zero claims.
    NoClaimsHeld,
    /// Workspace state only moves forward (never ready -> creating).
    WorkspaceAdvances,
}

impl fmt::Display for SessionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionGuard::NoClaimsHeld => write!(f, "no_claims_held"),
            SessionGuard::WorkspaceAdvances => write!(f, "workspace_advances"),
        }
    }
}

/// Post-transition actions for sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    /// Closing moves the workspace toward `archived`.
    ArchiveWorkspace,
}

/// How the session operator drives the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    Interactive,
    Autonomous,
}

/// Workspace lifecycle state. Monotonic: the ordering below is the only
/// permitted direction of travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceState {
    None,
    Creating,
    Ready,
    Archived,
}

impl fmt::Display for WorkspaceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkspaceState::None => "none",
            WorkspaceState::Creating => "creating",
            WorkspaceState::Ready => "ready",
            WorkspaceState::Archived => "archived",
        };
        write!(f, "{s}")
    }
}

/// Path plus lifecycle state of a session's isolated working copy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkspaceDescriptor {
    pub path: Option<PathBuf>,
    pub state: WorkspaceState,
}

impl Default for WorkspaceDescriptor {
    fn default() -> Self {
        Self {
            path: None,
            state: WorkspaceState::None,
        }
    }
}

/// Persisted session record (`sessions/<id>.json`).
///
/// Invariants: workspace state is monotonic; a closed session holds zero
/// claims.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionRecord {
    pub id: String,
    /// Human label for whoever (or whatever) drives this session.
    pub owner: String,
    pub mode: SessionMode,
    pub status: SessionStatus,
    pub workspace: WorkspaceDescriptor,
    /// Task ids currently claimed by this session.
    pub claims: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    /// Refreshed by `heartbeat`; stale heartbeats make claims recoverable.
    pub last_heartbeat: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(id: impl Into<String>, owner: impl Into<String>, mode: SessionMode) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            owner: owner.into(),
            mode,
            status: session_machine().initial(),
            workspace: WorkspaceDescriptor::default(),
            claims: BTreeSet::new(),
            created_at: now,
            last_heartbeat: now,
        }
    }
}

/// Facts assembled before firing a session event.
#[derive(Debug, Clone, Default)]
pub struct SessionFacts {
    pub claims_held: Vec<String>,
    /// `(current, requested)` workspace states for an advancement.
    pub workspace_step: Option<(WorkspaceState, WorkspaceState)>,
}

impl GuardContext<SessionGuard> for SessionFacts {
    fn evaluate(&self, guard: &SessionGuard) -> GuardVerdict {
        match guard {
            SessionGuard::NoClaimsHeld if self.claims_held.is_empty() => GuardVerdict::Allow,
            SessionGuard::NoClaimsHeld => GuardVerdict::deny(format!(
                "session still holds claims: {}",
                self.claims_held.join(", ")
            )),
            SessionGuard::WorkspaceAdvances => match self.workspace_step {
                Some((current, requested)) if requested >= current => GuardVerdict::Allow,
                Some((current, requested)) => GuardVerdict::deny(format!(
                    "workspace state may not regress from '{current}' to '{requested}'"
                )),
                None => GuardVerdict::deny("no workspace advancement requested"),
            },
        }
    }
}

/// Transition table for sessions: `active -> closed`, plus self-transitions
/// for workspace advancement. The `closed` self-transition exists because
/// archival finishes after the status change has committed.
pub fn session_machine() -> Machine<SessionStatus, SessionEvent, SessionGuard, SessionAction> {
    use SessionStatus::{Active, Closed};
    Machine::define(
        "session",
        vec![Active, Closed],
        Active,
        vec![
            Transition::new(Active, SessionEvent::AdvanceWorkspace, Active)
                .guarded_by(SessionGuard::WorkspaceAdvances),
            Transition::new(Closed, SessionEvent::AdvanceWorkspace, Closed)
                .guarded_by(SessionGuard::WorkspaceAdvances),
            Transition::new(Active, SessionEvent::Close, Closed)
                .guarded_by(SessionGuard::NoClaimsHeld)
                .then(SessionAction::ArchiveWorkspace),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fsm::Fired;
    use crate::error::CoordError;

    #[test]
    fn close_refused_while_claims_held() {
        let m = session_machine();
        let facts = SessionFacts {
            claims_held: vec!["t1".to_string()],
            workspace_step: None,
        };
        let err = m
            .fire("s1", SessionStatus::Active, SessionEvent::Close, &facts)
            .expect_err("claims held");
        match err {
            CoordError::GuardRejected { reason, .. } => assert!(reason.contains("t1")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn close_with_no_claims_archives_workspace() {
        let m = session_machine();
        match m
            .fire(
                "s1",
                SessionStatus::Active,
                SessionEvent::Close,
                &SessionFacts::default(),
            )
            .expect("close")
        {
            Fired::Moved { to, actions, .. } => {
                assert_eq!(to, SessionStatus::Closed);
                assert_eq!(actions, &[SessionAction::ArchiveWorkspace]);
            }
            Fired::AlreadyThere(_) => panic!("expected Moved"),
        }
    }

    #[test]
    fn workspace_state_never_regresses() {
        let m = session_machine();
        let facts = SessionFacts {
            claims_held: Vec::new(),
            workspace_step: Some((WorkspaceState::Ready, WorkspaceState::Creating)),
        };
        let err = m
            .fire(
                "s1",
                SessionStatus::Active,
                SessionEvent::AdvanceWorkspace,
                &facts,
            )
            .expect_err("regression");
        assert!(matches!(err, CoordError::GuardRejected { .. }));
    }

    #[test]
    fn closing_a_closed_session_is_idempotent() {
        let m = session_machine();
        let fired = m
            .fire(
                "s1",
                SessionStatus::Closed,
                SessionEvent::Close,
                &SessionFacts::default(),
            )
            .expect("idempotent close");
        assert_eq!(fired, Fired::AlreadyThere(SessionStatus::Closed));
    }
}
