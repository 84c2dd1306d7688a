//! Task records and the task state machine.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::fsm::{GuardContext, GuardVerdict, Machine, Transition};

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Todo,
    Wip,
    Done,
    Validated,
    Blocked,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Todo => "todo",
            TaskStatus::Wip => "wip",
            TaskStatus::Done => "done",
            TaskStatus::Validated => "validated",
            TaskStatus::Blocked => "blocked",
        };
        write!(f, "{s}")
    }
}

/// Events accepted by the task machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskEvent {
    /// `todo -> wip`: a claiming session starts work.
    Start,
    /// `wip -> done`: work finished, implementation report on file.
    Complete,
    /// `done -> validated`: approved bundle for the current round.
    Validate,
    /// `wip|done -> blocked`.
    Block,
    /// `blocked -> todo`: release the claim and requeue.
    Recover,
}

impl fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskEvent::Start => "start",
            TaskEvent::Complete => "complete",
            TaskEvent::Validate => "validate",
            TaskEvent::Block => "block",
            TaskEvent::Recover => "recover",
        };
        write!(f, "{s}")
    }
}

/// Guard tags for task transitions, evaluated against [`TaskFacts`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskGuard {
    /// The task must be claimed before work starts.
    Claimed,
    /// Leaving `wip` requires an implementation report on file.
    HasImplementationReport,
    /// Reaching `validated` requires an approved bundle for the current round.
    BundleApproved,
    /// A task with children cannot validate while any child is unresolved.
    ChildrenResolved,
}

impl fmt::Display for TaskGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskGuard::Claimed => "claimed",
            TaskGuard::HasImplementationReport => "has_implementation_report",
            TaskGuard::BundleApproved => "bundle_approved",
            TaskGuard::ChildrenResolved => "children_resolved",
        };
        write!(f, "{s}")
    }
}

/// Post-transition actions for tasks. Best-effort side effects run after the
/// status write commits; failures are logged, never rolled back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskAction {
    /// Entering `done` creates the QA brief (idempotent).
    OpenQaBrief,
    /// Recovering from `blocked` releases the owning claim.
    ReleaseClaim,
}

/// Task classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Feature,
    Bug,
    Chore,
}

/// Persisted task record (`tasks/<id>.json`).
///
/// Invariants: at most one non-null `owner` at any time; status transitions
/// follow the task machine; a task with unresolved children cannot reach
/// `validated`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskRecord {
    /// Stable, human-meaningful slug.
    pub id: String,
    /// Ordering group; lower waves are scheduled first.
    pub wave: u32,
    pub kind: TaskKind,
    pub status: TaskStatus,
    /// Session currently holding the claim, if any.
    pub owner: Option<String>,
    pub parent: Option<String>,
    pub children: BTreeSet<String>,
    /// Explicitly linked cluster members (symmetric, used by bundle scope).
    #[serde(default)]
    pub links: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(id: impl Into<String>, wave: u32, kind: TaskKind) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            wave,
            kind,
            status: task_machine().initial(),
            owner: None,
            parent: None,
            children: BTreeSet::new(),
            links: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status == TaskStatus::Validated
    }
}

/// Facts assembled by the registry before firing a task event.
#[derive(Debug, Clone, Default)]
pub struct TaskFacts {
    /// The task has a non-null owner.
    pub claimed: bool,
    /// `evidence/<task>/implementation.json` exists.
    pub has_implementation_report: bool,
    /// The caller computed an `approve` bundle for the current round.
    pub bundle_approved: bool,
    /// Child ids not yet `validated`.
    pub unresolved_children: Vec<String>,
}

impl GuardContext<TaskGuard> for TaskFacts {
    fn evaluate(&self, guard: &TaskGuard) -> GuardVerdict {
        match guard {
            TaskGuard::Claimed if self.claimed => GuardVerdict::Allow,
            TaskGuard::Claimed => GuardVerdict::deny("task is not claimed by any session"),
            TaskGuard::HasImplementationReport if self.has_implementation_report => {
                GuardVerdict::Allow
            }
            TaskGuard::HasImplementationReport => {
                GuardVerdict::deny("no implementation report on file")
            }
            TaskGuard::BundleApproved if self.bundle_approved => GuardVerdict::Allow,
            TaskGuard::BundleApproved => {
                GuardVerdict::deny("no approved bundle for the current round")
            }
            TaskGuard::ChildrenResolved if self.unresolved_children.is_empty() => {
                GuardVerdict::Allow
            }
            TaskGuard::ChildrenResolved => GuardVerdict::deny(format!(
                "unresolved children: {}",
                self.unresolved_children.join(", ")
            )),
        }
    }
}

/// Transition table for tasks:
/// `todo -> wip -> done -> validated`, `blocked` from `wip`/`done`, and a
/// recovery path `blocked -> todo`.
pub fn task_machine() -> Machine<TaskStatus, TaskEvent, TaskGuard, TaskAction> {
    use TaskStatus::{Blocked, Done, Todo, Validated, Wip};
    Machine::define(
        "task",
        vec![Todo, Wip, Done, Validated, Blocked],
        Todo,
        vec![
            Transition::new(Todo, TaskEvent::Start, Wip).guarded_by(TaskGuard::Claimed),
            Transition::new(Wip, TaskEvent::Complete, Done)
                .guarded_by(TaskGuard::HasImplementationReport)
                .then(TaskAction::OpenQaBrief),
            Transition::new(Done, TaskEvent::Validate, Validated)
                .guarded_by(TaskGuard::BundleApproved)
                .guarded_by(TaskGuard::ChildrenResolved),
            Transition::new(Wip, TaskEvent::Block, Blocked),
            Transition::new(Done, TaskEvent::Block, Blocked),
            Transition::new(Blocked, TaskEvent::Recover, Todo).then(TaskAction::ReleaseClaim),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fsm::Fired;
    use crate::error::CoordError;

    fn facts_all_clear() -> TaskFacts {
        TaskFacts {
            claimed: true,
            has_implementation_report: true,
            bundle_approved: true,
            unresolved_children: Vec::new(),
        }
    }

    #[test]
    fn happy_path_walks_the_full_table() {
        let m = task_machine();
        let facts = facts_all_clear();

        let mut status = m.initial();
        for event in [TaskEvent::Start, TaskEvent::Complete, TaskEvent::Validate] {
            match m.fire("t1", status, event, &facts).expect("fire") {
                Fired::Moved { to, .. } => status = to,
                Fired::AlreadyThere(_) => panic!("expected Moved for {event}"),
            }
        }
        assert_eq!(status, TaskStatus::Validated);
    }

    #[test]
    fn validate_rejected_with_unresolved_children() {
        let m = task_machine();
        let facts = TaskFacts {
            unresolved_children: vec!["t1-a".to_string()],
            ..facts_all_clear()
        };
        let err = m
            .fire("t1", TaskStatus::Done, TaskEvent::Validate, &facts)
            .expect_err("children unresolved");
        match err {
            CoordError::GuardRejected { guard, reason, .. } => {
                assert_eq!(guard, "children_resolved");
                assert!(reason.contains("t1-a"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn complete_requires_implementation_report() {
        let m = task_machine();
        let facts = TaskFacts {
            has_implementation_report: false,
            ..facts_all_clear()
        };
        let err = m
            .fire("t1", TaskStatus::Wip, TaskEvent::Complete, &facts)
            .expect_err("missing report");
        assert!(matches!(err, CoordError::GuardRejected { .. }));
    }

    #[test]
    fn validate_on_validated_task_is_idempotent() {
        let m = task_machine();
        let fired = m
            .fire(
                "t1",
                TaskStatus::Validated,
                TaskEvent::Validate,
                &TaskFacts::default(),
            )
            .expect("idempotent");
        assert_eq!(fired, Fired::AlreadyThere(TaskStatus::Validated));
    }

    #[test]
    fn recover_releases_claim() {
        let m = task_machine();
        match m
            .fire(
                "t1",
                TaskStatus::Blocked,
                TaskEvent::Recover,
                &TaskFacts::default(),
            )
            .expect("recover")
        {
            Fired::Moved { to, actions, .. } => {
                assert_eq!(to, TaskStatus::Todo);
                assert_eq!(actions, &[TaskAction::ReleaseClaim]);
            }
            Fired::AlreadyThere(_) => panic!("expected Moved"),
        }
    }

    #[test]
    fn block_from_todo_is_invalid() {
        let m = task_machine();
        let err = m
            .fire(
                "t1",
                TaskStatus::Todo,
                TaskEvent::Block,
                &TaskFacts::default(),
            )
            .expect_err("todo cannot block");
        assert!(matches!(err, CoordError::InvalidTransition { .. }));
    }
}
