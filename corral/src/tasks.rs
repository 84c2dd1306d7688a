//! Task registry: CRUD, the claim protocol, transitions, and links.
//!
//! The claim protocol records the task/session relationship in both files:
//! owner on the task record, claimed-set on the session record. The two
//! updates are each atomic but are not one cross-file transaction; a
//! session-side failure triggers a best-effort task rollback and the
//! `repair` sweep reconciles whatever window remains.

use std::collections::BTreeSet;

use chrono::Utc;
use tracing::{debug, instrument, warn};

use crate::coordinator::CoordContext;
use crate::core::brief::QaBrief;
use crate::core::fsm::Fired;
use crate::core::graph::{self, TaskIndex};
use crate::core::session::{SessionRecord, SessionStatus};
use crate::core::task::{
    TaskAction, TaskEvent, TaskFacts, TaskKind, TaskRecord, TaskStatus, task_machine,
};
use crate::error::{CoordError, CoordResult};
use crate::io::layout::validate_id;
use crate::io::record;

/// Inputs for creating a task record.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub id: String,
    pub wave: u32,
    pub kind: TaskKind,
    pub parent: Option<String>,
}

/// Claim options. `reclaim` takes over from a different (possibly stale)
/// session; `force` bypasses all claim guards and is logged.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClaimOptions {
    pub reclaim: bool,
    pub force: bool,
}

pub struct TaskRegistry<'a> {
    ctx: &'a CoordContext,
}

impl<'a> TaskRegistry<'a> {
    pub fn new(ctx: &'a CoordContext) -> Self {
        Self { ctx }
    }

    /// Create a task record. With a parent, the child is linked on both
    /// sides and cycle creation is rejected.
    pub fn create(&self, spec: &NewTask) -> CoordResult<TaskRecord> {
        validate_id("task", &spec.id, self.ctx.config().ids.max_len)?;

        let mut task = TaskRecord::new(&spec.id, spec.wave, spec.kind);
        if let Some(parent_id) = &spec.parent {
            let index = self.index()?;
            if !index.contains_key(parent_id) {
                return Err(CoordError::NotFound {
                    kind: "task",
                    id: parent_id.clone(),
                });
            }
            if graph::would_create_cycle(&index, parent_id, &spec.id) {
                return Err(CoordError::Storage(anyhow::anyhow!(
                    "linking '{}' under '{}' would create a cycle",
                    spec.id,
                    parent_id
                )));
            }
            task.parent = Some(parent_id.clone());
        }

        let path = self.ctx.layout().task_path(&spec.id);
        record::create_atomic("task", &spec.id, &path, self.ctx.lock_settings(), &task)?;

        if let Some(parent_id) = &spec.parent {
            let parent_path = self.ctx.layout().task_path(parent_id);
            record::update_atomic(
                "task",
                parent_id,
                &parent_path,
                self.ctx.lock_settings(),
                |parent: &mut TaskRecord| {
                    parent.children.insert(spec.id.clone());
                    parent.updated_at = Utc::now();
                    Ok(())
                },
            )?;
        }
        debug!(task = %spec.id, parent = ?spec.parent, "task created");
        Ok(task)
    }

    /// Lockless read; tolerates staleness.
    pub fn get(&self, task_id: &str) -> CoordResult<TaskRecord> {
        record::require_json("task", task_id, &self.ctx.layout().task_path(task_id))
    }

    /// Snapshot of all task records, keyed by id.
    pub fn index(&self) -> CoordResult<TaskIndex> {
        let layout = self.ctx.layout();
        let mut index = TaskIndex::new();
        for id in layout.list_ids(&layout.tasks_dir())? {
            if let Some(task) = record::read_json::<TaskRecord>(&layout.task_path(&id))? {
                index.insert(task.id.clone(), task);
            }
        }
        Ok(index)
    }

    /// Tasks in `todo` with satisfied dependencies, ordered by wave then
    /// creation time.
    pub fn list_ready(&self) -> CoordResult<Vec<TaskRecord>> {
        let index = self.index()?;
        Ok(graph::ready_tasks(&index).into_iter().cloned().collect())
    }

    /// Claim a task exclusively for a session.
    ///
    /// Exactly one of N concurrent claimants wins; the rest receive
    /// [`CoordError::ClaimConflict`]. Re-claiming by the current owner is
    /// idempotent.
    #[instrument(skip(self))]
    pub fn claim(
        &self,
        task_id: &str,
        session_id: &str,
        opts: ClaimOptions,
    ) -> CoordResult<TaskRecord> {
        let layout = self.ctx.layout();
        let settings = self.ctx.lock_settings();

        // The session must exist and be open before we touch the task.
        let session: SessionRecord =
            record::require_json("session", session_id, &layout.session_path(session_id))?;
        if session.status == SessionStatus::Closed {
            return Err(CoordError::GuardRejected {
                entity: "session",
                id: session_id.to_string(),
                event: "claim".to_string(),
                guard: "session_active".to_string(),
                reason: "closed sessions cannot claim tasks".to_string(),
            });
        }

        if opts.force {
            warn!(task = task_id, session = session_id, "force-claim bypasses claim guards");
        }

        let mut previous_owner: Option<String> = None;
        let claimed = record::update_atomic(
            "task",
            task_id,
            &layout.task_path(task_id),
            settings,
            |task: &mut TaskRecord| {
                if task.is_terminal() && !opts.force {
                    return Err(CoordError::GuardRejected {
                        entity: "task",
                        id: task_id.to_string(),
                        event: "claim".to_string(),
                        guard: "not_validated".to_string(),
                        reason: "task is already validated".to_string(),
                    });
                }
                match task.owner.clone() {
                    Some(owner) if owner == session_id => {}
                    Some(owner) if !opts.reclaim && !opts.force => {
                        return Err(CoordError::ClaimConflict {
                            task: task_id.to_string(),
                            owner,
                        });
                    }
                    Some(owner) => {
                        previous_owner = Some(owner);
                        task.owner = Some(session_id.to_string());
                        task.updated_at = Utc::now();
                    }
                    None => {
                        task.owner = Some(session_id.to_string());
                        task.updated_at = Utc::now();
                    }
                }
                Ok(task.clone())
            },
        )?;

        // Second file of the claim. Not transactional with the first; on
        // failure we roll the task side back best-effort and report.
        let session_side = record::update_atomic(
            "session",
            session_id,
            &layout.session_path(session_id),
            settings,
            |session: &mut SessionRecord| {
                if session.status == SessionStatus::Closed {
                    return Err(CoordError::GuardRejected {
                        entity: "session",
                        id: session_id.to_string(),
                        event: "claim".to_string(),
                        guard: "session_active".to_string(),
                        reason: "session closed mid-claim".to_string(),
                    });
                }
                session.claims.insert(task_id.to_string());
                Ok(())
            },
        );
        if let Err(err) = session_side {
            warn!(task = task_id, session = session_id, %err, "claim session update failed, rolling back task owner");
            let rollback = record::update_atomic(
                "task",
                task_id,
                &layout.task_path(task_id),
                settings,
                |task: &mut TaskRecord| {
                    if task.owner.as_deref() == Some(session_id) {
                        task.owner = previous_owner.clone();
                        task.updated_at = Utc::now();
                    }
                    Ok(())
                },
            );
            if let Err(rollback_err) = rollback {
                warn!(task = task_id, %rollback_err, "claim rollback failed; repair sweep will reconcile");
            }
            return Err(err);
        }

        if let Some(prev) = previous_owner {
            self.remove_session_claim(&prev, task_id);
        }

        debug!(task = task_id, session = session_id, "claim established");
        Ok(claimed)
    }

    /// Release a claim held by `session_id`. A task released from `wip`
    /// returns to `todo`.
    pub fn release(&self, task_id: &str, session_id: &str) -> CoordResult<TaskRecord> {
        let layout = self.ctx.layout();
        let released = record::update_atomic(
            "task",
            task_id,
            &layout.task_path(task_id),
            self.ctx.lock_settings(),
            |task: &mut TaskRecord| {
                if task.owner.as_deref() == Some(session_id) {
                    task.owner = None;
                    if task.status == TaskStatus::Wip {
                        task.status = TaskStatus::Todo;
                    }
                    task.updated_at = Utc::now();
                }
                Ok(task.clone())
            },
        )?;
        self.remove_session_claim(session_id, task_id);
        Ok(released)
    }

    /// Fire a task event. `bundle_approved` is supplied by the evidence
    /// pipeline when promoting; direct callers leave it false and the
    /// `bundle_approved` guard rejects premature validation.
    #[instrument(skip(self))]
    pub fn transition(
        &self,
        task_id: &str,
        event: TaskEvent,
        bundle_approved: bool,
    ) -> CoordResult<TaskRecord> {
        let machine = task_machine();
        let layout = self.ctx.layout();
        let has_implementation_report = layout.implementation_path(task_id).exists();
        let unresolved_children = self.unresolved_children(task_id)?;

        let mut pending_actions: Vec<TaskAction> = Vec::new();
        let updated = record::update_atomic(
            "task",
            task_id,
            &layout.task_path(task_id),
            self.ctx.lock_settings(),
            |task: &mut TaskRecord| {
                let facts = TaskFacts {
                    claimed: task.owner.is_some(),
                    has_implementation_report,
                    bundle_approved,
                    unresolved_children: unresolved_children.clone(),
                };
                match machine.fire(task_id, task.status, event, &facts)? {
                    Fired::Moved { from, to, actions } => {
                        debug!(task = task_id, %from, %to, %event, "task transition");
                        task.status = to;
                        task.updated_at = Utc::now();
                        pending_actions = actions.to_vec();
                    }
                    Fired::AlreadyThere(state) => {
                        debug!(task = task_id, %state, %event, "transition already satisfied");
                    }
                }
                Ok(task.clone())
            },
        )?;

        // Post-transition actions run after the committed write; failures
        // are reported but never roll the state change back.
        for action in pending_actions {
            if let Err(err) = self.run_action(&updated, action) {
                warn!(task = task_id, ?action, %err, "post-transition action failed");
            }
        }
        Ok(updated)
    }

    /// Link an existing task under a parent. Rejects cycles and re-parenting.
    pub fn link_child(&self, parent_id: &str, child_id: &str) -> CoordResult<()> {
        let layout = self.ctx.layout();
        let index = self.index()?;
        if !index.contains_key(parent_id) {
            return Err(CoordError::NotFound {
                kind: "task",
                id: parent_id.to_string(),
            });
        }
        if graph::would_create_cycle(&index, parent_id, child_id) {
            return Err(CoordError::Storage(anyhow::anyhow!(
                "linking '{child_id}' under '{parent_id}' would create a cycle"
            )));
        }
        record::update_atomic(
            "task",
            child_id,
            &layout.task_path(child_id),
            self.ctx.lock_settings(),
            |child: &mut TaskRecord| {
                match &child.parent {
                    Some(existing) if existing != parent_id => {
                        Err(CoordError::Storage(anyhow::anyhow!(
                            "task '{child_id}' already has parent '{existing}'"
                        )))
                    }
                    _ => {
                        child.parent = Some(parent_id.to_string());
                        child.updated_at = Utc::now();
                        Ok(())
                    }
                }
            },
        )?;
        record::update_atomic(
            "task",
            parent_id,
            &layout.task_path(parent_id),
            self.ctx.lock_settings(),
            |parent: &mut TaskRecord| {
                parent.children.insert(child_id.to_string());
                parent.updated_at = Utc::now();
                Ok(())
            },
        )?;
        Ok(())
    }

    /// Record a symmetric cluster link between two tasks.
    pub fn link_cluster(&self, a: &str, b: &str) -> CoordResult<()> {
        if a == b {
            return Err(CoordError::Storage(anyhow::anyhow!(
                "cannot link task '{a}' to itself"
            )));
        }
        let layout = self.ctx.layout();
        // Both must exist before either record is touched.
        self.get(a)?;
        self.get(b)?;
        for (this, other) in [(a, b), (b, a)] {
            record::update_atomic(
                "task",
                this,
                &layout.task_path(this),
                self.ctx.lock_settings(),
                |task: &mut TaskRecord| {
                    task.links.insert(other.to_string());
                    task.updated_at = Utc::now();
                    Ok(())
                },
            )?;
        }
        Ok(())
    }

    /// Clear the owner of a task regardless of which session holds it, for
    /// operator recovery sweeps. Returns the displaced owner, if any.
    pub fn force_release(&self, task_id: &str) -> CoordResult<Option<String>> {
        let layout = self.ctx.layout();
        record::update_atomic(
            "task",
            task_id,
            &layout.task_path(task_id),
            self.ctx.lock_settings(),
            |task: &mut TaskRecord| {
                let previous = task.owner.take();
                if previous.is_some() {
                    if task.status == TaskStatus::Wip {
                        task.status = TaskStatus::Todo;
                    }
                    task.updated_at = Utc::now();
                }
                Ok(previous)
            },
        )
    }

    fn unresolved_children(&self, task_id: &str) -> CoordResult<Vec<String>> {
        let layout = self.ctx.layout();
        let Some(task) = record::read_json::<TaskRecord>(&layout.task_path(task_id))? else {
            return Err(CoordError::NotFound {
                kind: "task",
                id: task_id.to_string(),
            });
        };
        let mut unresolved = Vec::new();
        for child_id in &task.children {
            let resolved = record::read_json::<TaskRecord>(&layout.task_path(child_id))?
                .is_some_and(|child| child.status == TaskStatus::Validated);
            if !resolved {
                unresolved.push(child_id.clone());
            }
        }
        Ok(unresolved)
    }

    fn run_action(&self, task: &TaskRecord, action: TaskAction) -> CoordResult<()> {
        match action {
            TaskAction::OpenQaBrief => {
                let path = self.ctx.layout().brief_path(&task.id);
                if path.exists() {
                    return Ok(());
                }
                record::write_json(&path, &QaBrief::new(&task.id))?;
                debug!(task = %task.id, "qa brief opened");
                Ok(())
            }
            TaskAction::ReleaseClaim => {
                if let Some(owner) = self.force_release(&task.id)? {
                    self.remove_session_claim(&owner, &task.id);
                }
                Ok(())
            }
        }
    }

    /// Best-effort removal of a task from a session's claimed-set; failures
    /// are left to the repair sweep.
    fn remove_session_claim(&self, session_id: &str, task_id: &str) {
        let layout = self.ctx.layout();
        let result = record::update_atomic(
            "session",
            session_id,
            &layout.session_path(session_id),
            self.ctx.lock_settings(),
            |session: &mut SessionRecord| {
                session.claims.remove(task_id);
                Ok(())
            },
        );
        if let Err(err) = result {
            warn!(session = session_id, task = task_id, %err, "failed to drop session claim entry");
        }
    }

    /// Task ids whose recorded owner no longer exists, is closed, or does
    /// not list the claim: one direction of the repair sweep.
    pub fn orphaned_claims(&self) -> CoordResult<Vec<(String, String)>> {
        let layout = self.ctx.layout();
        let mut orphaned = Vec::new();
        for (task_id, task) in self.index()? {
            let Some(owner) = &task.owner else { continue };
            let session =
                record::read_json::<SessionRecord>(&layout.session_path(owner))?;
            let intact = session.is_some_and(|s| {
                s.status == SessionStatus::Active && s.claims.contains(&task_id)
            });
            if !intact {
                orphaned.push((task_id, owner.clone()));
            }
        }
        Ok(orphaned)
    }

    /// Session claim entries whose task does not record the session as
    /// owner: the other direction of the repair sweep.
    pub fn dangling_session_claims(
        &self,
        session: &SessionRecord,
    ) -> CoordResult<BTreeSet<String>> {
        let layout = self.ctx.layout();
        let mut dangling = BTreeSet::new();
        for task_id in &session.claims {
            let owned = record::read_json::<TaskRecord>(&layout.task_path(task_id))?
                .is_some_and(|task| task.owner.as_deref() == Some(session.id.as_str()));
            if !owned {
                dangling.insert(task_id.clone());
            }
        }
        Ok(dangling)
    }
}
