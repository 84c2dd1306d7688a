//! QA briefs: per-task validation status, tracked independently of the task.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::fsm::{GuardContext, GuardVerdict, Machine, Transition};

/// QA brief status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QaStatus {
    Waiting,
    Todo,
    Wip,
    Done,
    Validated,
    Blocked,
}

impl fmt::Display for QaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QaStatus::Waiting => "waiting",
            QaStatus::Todo => "todo",
            QaStatus::Wip => "wip",
            QaStatus::Done => "done",
            QaStatus::Validated => "validated",
            QaStatus::Blocked => "blocked",
        };
        write!(f, "{s}")
    }
}

/// Events accepted by the QA brief machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QaEvent {
    /// `waiting -> todo`: brief becomes eligible for validation.
    Activate,
    /// `todo -> wip`: a round opens.
    Begin,
    /// `wip -> done`: every expected validator reported.
    Finish,
    /// `done -> validated`: bundle approved.
    Approve,
    /// `wip|done -> todo`: bundle rejected, next round required.
    Reject,
    /// Any non-terminal state `-> blocked`.
    Block,
    /// `blocked -> todo`: retry with a fresh round.
    Retry,
}

impl fmt::Display for QaEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QaEvent::Activate => "activate",
            QaEvent::Begin => "begin",
            QaEvent::Finish => "finish",
            QaEvent::Approve => "approve",
            QaEvent::Reject => "reject",
            QaEvent::Block => "block",
            QaEvent::Retry => "retry",
        };
        write!(f, "{s}")
    }
}

/// Guard tags for QA transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QaGuard {
    /// Approval requires the latest round to be complete and approved.
    RoundApproved,
}

impl fmt::Display for QaGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QaGuard::RoundApproved => write!(f, "round_approved"),
        }
    }
}

/// Post-transition actions for QA briefs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QaAction {
    /// Stamp the current round manifest closed.
    CloseRound,
}

/// One append-only history entry on a brief.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QaHistoryEntry {
    pub at: DateTime<Utc>,
    /// Who drove the change (session id, validator id, or "operator").
    pub actor: String,
    pub from: QaStatus,
    pub to: QaStatus,
    pub note: String,
}

/// Persisted QA brief (`qa/<task-id>.json`), created when the task enters
/// `done`. `round` is the current round number, 0 before the first round.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QaBrief {
    pub task_id: String,
    pub round: u32,
    pub status: QaStatus,
    /// Append-only status change history.
    pub history: Vec<QaHistoryEntry>,
    pub created_at: DateTime<Utc>,
}

impl QaBrief {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            round: 0,
            status: qa_machine().initial(),
            history: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Record a status change in the append-only history.
    pub fn record(&mut self, actor: &str, from: QaStatus, to: QaStatus, note: impl Into<String>) {
        self.history.push(QaHistoryEntry {
            at: Utc::now(),
            actor: actor.to_string(),
            from,
            to,
            note: note.into(),
        });
        self.status = to;
    }
}

/// Facts assembled before firing a QA event.
#[derive(Debug, Clone, Default)]
pub struct QaFacts {
    pub round_approved: bool,
}

impl GuardContext<QaGuard> for QaFacts {
    fn evaluate(&self, guard: &QaGuard) -> GuardVerdict {
        match guard {
            QaGuard::RoundApproved if self.round_approved => GuardVerdict::Allow,
            QaGuard::RoundApproved => {
                GuardVerdict::deny("latest round is not complete and approved")
            }
        }
    }
}

/// Transition table for QA briefs:
/// `waiting -> todo -> wip -> done -> validated`, `blocked` reachable from
/// every non-terminal state, `retry` returning `blocked -> todo`.
pub fn qa_machine() -> Machine<QaStatus, QaEvent, QaGuard, QaAction> {
    use QaStatus::{Blocked, Done, Todo, Validated, Waiting, Wip};
    Machine::define(
        "qa-brief",
        vec![Waiting, Todo, Wip, Done, Validated, Blocked],
        Waiting,
        vec![
            Transition::new(Waiting, QaEvent::Activate, Todo),
            Transition::new(Todo, QaEvent::Begin, Wip),
            Transition::new(Wip, QaEvent::Finish, Done),
            Transition::new(Done, QaEvent::Approve, Validated)
                .guarded_by(QaGuard::RoundApproved)
                .then(QaAction::CloseRound),
            Transition::new(Done, QaEvent::Reject, Todo).then(QaAction::CloseRound),
            Transition::new(Wip, QaEvent::Reject, Todo).then(QaAction::CloseRound),
            Transition::new(Waiting, QaEvent::Block, Blocked),
            Transition::new(Todo, QaEvent::Block, Blocked),
            Transition::new(Wip, QaEvent::Block, Blocked),
            Transition::new(Done, QaEvent::Block, Blocked),
            Transition::new(Blocked, QaEvent::Retry, Todo),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fsm::Fired;
    use crate::error::CoordError;

    #[test]
    fn blocked_is_reachable_from_every_non_terminal_state() {
        let m = qa_machine();
        for state in [QaStatus::Waiting, QaStatus::Todo, QaStatus::Wip, QaStatus::Done] {
            let fired = m
                .fire("t1", state, QaEvent::Block, &QaFacts::default())
                .expect("block");
            assert!(matches!(
                fired,
                Fired::Moved {
                    to: QaStatus::Blocked,
                    ..
                }
            ));
        }
    }

    #[test]
    fn validated_cannot_block() {
        let m = qa_machine();
        let err = m
            .fire("t1", QaStatus::Validated, QaEvent::Block, &QaFacts::default())
            .expect_err("terminal state");
        assert!(matches!(err, CoordError::InvalidTransition { .. }));
    }

    #[test]
    fn approve_requires_round_approved() {
        let m = qa_machine();
        let err = m
            .fire("t1", QaStatus::Done, QaEvent::Approve, &QaFacts::default())
            .expect_err("round not approved");
        assert!(matches!(err, CoordError::GuardRejected { .. }));

        let fired = m
            .fire(
                "t1",
                QaStatus::Done,
                QaEvent::Approve,
                &QaFacts {
                    round_approved: true,
                },
            )
            .expect("approve");
        assert!(matches!(
            fired,
            Fired::Moved {
                to: QaStatus::Validated,
                ..
            }
        ));
    }

    #[test]
    fn retry_returns_blocked_brief_to_todo() {
        let m = qa_machine();
        let fired = m
            .fire("t1", QaStatus::Blocked, QaEvent::Retry, &QaFacts::default())
            .expect("retry");
        assert!(matches!(
            fired,
            Fired::Moved {
                to: QaStatus::Todo,
                ..
            }
        ));
    }

    #[test]
    fn history_is_append_only_and_tracks_status() {
        let mut brief = QaBrief::new("t1");
        assert_eq!(brief.status, QaStatus::Waiting);

        brief.record("operator", QaStatus::Waiting, QaStatus::Todo, "activated");
        brief.record("s1", QaStatus::Todo, QaStatus::Wip, "round 1 opened");

        assert_eq!(brief.status, QaStatus::Wip);
        assert_eq!(brief.history.len(), 2);
        assert_eq!(brief.history[0].to, QaStatus::Todo);
    }
}
