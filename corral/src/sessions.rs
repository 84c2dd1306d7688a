//! Session registry: lifecycle, workspace materialization, heartbeats, and
//! the recovery sweeps.
//!
//! Workspace provider calls are slow and external, so they always run
//! outside any record lock; the descriptor is advanced in separate atomic
//! steps (`creating` before the call, `ready` after), which means a crash
//! mid-call leaves an honest `creating` marker behind for `resume_workspace`
//! to pick up.

use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::coordinator::CoordContext;
use crate::core::fsm::Fired;
use crate::core::session::{
    SessionAction, SessionEvent, SessionFacts, SessionMode, SessionRecord, SessionStatus,
    WorkspaceState, session_machine,
};
use crate::error::{CoordError, CoordResult};
use crate::io::layout::validate_id;
use crate::io::record;
use crate::io::workspace::WorkspaceProvider;
use crate::tasks::TaskRegistry;

/// Close options. `archive_workspace` detaches the working copy;
/// `force_release` drops held claims first instead of refusing to close.
#[derive(Debug, Clone, Copy, Default)]
pub struct CloseOptions {
    pub archive_workspace: bool,
    pub force_release: bool,
}

/// One claim returned to the pool by a recovery sweep.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ReclaimedClaim {
    pub session_id: String,
    pub task_id: String,
}

/// Outcome of the claim reconciliation sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RepairReport {
    /// Tasks whose recorded owner was missing, closed, or disagreed.
    pub cleared_task_owners: Vec<String>,
    /// `(session, task)` claim entries dropped because the task disagreed.
    pub dropped_session_claims: Vec<ReclaimedClaim>,
}

impl RepairReport {
    pub fn is_clean(&self) -> bool {
        self.cleared_task_owners.is_empty() && self.dropped_session_claims.is_empty()
    }
}

pub struct SessionRegistry<'a> {
    ctx: &'a CoordContext,
}

impl<'a> SessionRegistry<'a> {
    pub fn new(ctx: &'a CoordContext) -> Self {
        Self { ctx }
    }

    /// Register a session; optionally materialize its workspace right away.
    #[instrument(skip(self, provider))]
    pub fn create<W: WorkspaceProvider>(
        &self,
        id: &str,
        owner: &str,
        mode: SessionMode,
        with_workspace: bool,
        provider: &W,
    ) -> CoordResult<SessionRecord> {
        validate_id("session", id, self.ctx.config().ids.max_len)?;
        let session = SessionRecord::new(id, owner, mode);
        record::create_atomic(
            "session",
            id,
            &self.ctx.layout().session_path(id),
            self.ctx.lock_settings(),
            &session,
        )?;
        debug!(session = id, owner, "session registered");
        if with_workspace {
            self.materialize_workspace(id, provider)
        } else {
            Ok(session)
        }
    }

    /// Lockless read; tolerates staleness.
    pub fn get(&self, id: &str) -> CoordResult<SessionRecord> {
        record::require_json("session", id, &self.ctx.layout().session_path(id))
    }

    pub fn list(&self) -> CoordResult<Vec<SessionRecord>> {
        let layout = self.ctx.layout();
        let mut sessions = Vec::new();
        for id in layout.list_ids(&layout.sessions_dir())? {
            if let Some(session) = record::read_json(&layout.session_path(&id))? {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    /// Materialize the workspace: advance the descriptor to `creating`,
    /// invoke the provider, then advance to `ready` with the path. A
    /// provider failure leaves `creating` recorded and surfaces as a
    /// retryable [`CoordError::Workspace`].
    #[instrument(skip(self, provider))]
    pub fn materialize_workspace<W: WorkspaceProvider>(
        &self,
        id: &str,
        provider: &W,
    ) -> CoordResult<SessionRecord> {
        let current = self.get(id)?;
        match current.workspace.state {
            WorkspaceState::Ready => return Ok(current),
            WorkspaceState::Archived => {
                return Err(CoordError::Workspace {
                    session: id.to_string(),
                    message: "workspace is archived; it cannot be re-created".to_string(),
                });
            }
            WorkspaceState::None | WorkspaceState::Creating => {}
        }

        self.advance_workspace(id, WorkspaceState::Creating, None)?;
        match provider.create(id) {
            Ok(path) => self.advance_workspace(id, WorkspaceState::Ready, Some(path)),
            Err(err) => {
                warn!(session = id, error = %format!("{err:#}"), "workspace creation failed");
                Err(CoordError::Workspace {
                    session: id.to_string(),
                    message: format!("{err:#}"),
                })
            }
        }
    }

    /// Bring a session's workspace back to a usable state: retry a stuck
    /// `creating` materialization, or re-materialize a `ready` workspace
    /// whose directory has gone missing.
    pub fn resume_workspace<W: WorkspaceProvider>(
        &self,
        id: &str,
        provider: &W,
    ) -> CoordResult<SessionRecord> {
        let session = self.get(id)?;
        match session.workspace.state {
            WorkspaceState::None | WorkspaceState::Creating => {
                self.materialize_workspace(id, provider)
            }
            WorkspaceState::Ready => {
                if let Some(path) = &session.workspace.path {
                    provider.restore(path).map_err(|err| CoordError::Workspace {
                        session: id.to_string(),
                        message: format!("{err:#}"),
                    })?;
                }
                self.get(id)
            }
            WorkspaceState::Archived => Err(CoordError::Workspace {
                session: id.to_string(),
                message: "workspace is archived; it cannot be resumed".to_string(),
            }),
        }
    }

    /// Refresh the liveness timestamp. Closed sessions have no heartbeat.
    pub fn heartbeat(&self, id: &str) -> CoordResult<SessionRecord> {
        record::update_atomic(
            "session",
            id,
            &self.ctx.layout().session_path(id),
            self.ctx.lock_settings(),
            |session: &mut SessionRecord| {
                if session.status == SessionStatus::Closed {
                    return Err(CoordError::GuardRejected {
                        entity: "session",
                        id: id.to_string(),
                        event: "heartbeat".to_string(),
                        guard: "session_active".to_string(),
                        reason: "closed sessions cannot heartbeat".to_string(),
                    });
                }
                session.last_heartbeat = Utc::now();
                Ok(session.clone())
            },
        )
    }

    /// Close a session. Refused while claims are held unless
    /// `force_release` returns them to the pool first. Archiving the
    /// workspace is a post-transition action: its failure is reported but
    /// never un-closes the session.
    #[instrument(skip(self, provider, tasks))]
    pub fn close<W: WorkspaceProvider>(
        &self,
        id: &str,
        opts: CloseOptions,
        provider: &W,
        tasks: &TaskRegistry<'_>,
    ) -> CoordResult<SessionRecord> {
        if opts.force_release {
            let session = self.get(id)?;
            for task_id in &session.claims {
                warn!(session = id, task = %task_id, "force-releasing claim on close");
                if let Err(err) = tasks.release(task_id, id) {
                    warn!(session = id, task = %task_id, %err, "force-release failed");
                }
            }
        }

        let machine = session_machine();
        let mut pending: Vec<SessionAction> = Vec::new();
        let closed = record::update_atomic(
            "session",
            id,
            &self.ctx.layout().session_path(id),
            self.ctx.lock_settings(),
            |session: &mut SessionRecord| {
                let facts = SessionFacts {
                    claims_held: session.claims.iter().cloned().collect(),
                    workspace_step: None,
                };
                match machine.fire(id, session.status, SessionEvent::Close, &facts)? {
                    Fired::Moved { to, actions, .. } => {
                        session.status = to;
                        pending = actions.to_vec();
                    }
                    Fired::AlreadyThere(_) => {
                        debug!(session = id, "session already closed");
                    }
                }
                Ok(session.clone())
            },
        )?;

        for action in pending {
            match action {
                SessionAction::ArchiveWorkspace => {
                    if opts.archive_workspace {
                        if let Err(err) = self.archive_workspace(&closed, provider) {
                            warn!(session = id, %err, "workspace archive failed after close");
                        }
                    }
                }
            }
        }
        self.get(id)
    }

    /// Return claims held by sessions whose heartbeat is older than
    /// `max_age` (default: the configured heartbeat timeout). Released
    /// tasks drop back to `todo` with no owner.
    #[instrument(skip(self, tasks))]
    pub fn recover_timed_out_claims(
        &self,
        max_age: Option<Duration>,
        tasks: &TaskRegistry<'_>,
    ) -> CoordResult<Vec<ReclaimedClaim>> {
        let max_age = max_age.unwrap_or_else(|| self.ctx.config().heartbeat_timeout());
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|err| CoordError::Storage(anyhow::anyhow!("max_age out of range: {err}")))?;
        let cutoff = Utc::now() - max_age;

        let mut reclaimed = Vec::new();
        for session in self.list()? {
            if session.status == SessionStatus::Closed
                || session.claims.is_empty()
                || session.last_heartbeat >= cutoff
            {
                continue;
            }
            warn!(
                session = %session.id,
                last_heartbeat = %session.last_heartbeat,
                claims = session.claims.len(),
                "recovering claims from timed-out session"
            );
            for task_id in &session.claims {
                match tasks.release(task_id, &session.id) {
                    Ok(_) => reclaimed.push(ReclaimedClaim {
                        session_id: session.id.clone(),
                        task_id: task_id.clone(),
                    }),
                    Err(err) => {
                        warn!(session = %session.id, task = %task_id, %err, "claim recovery failed");
                    }
                }
            }
        }
        Ok(reclaimed)
    }

    /// Reconcile the two halves of the claim protocol: clear task owners
    /// whose session does not corroborate the claim, and drop session claim
    /// entries whose task does not.
    #[instrument(skip(self, tasks))]
    pub fn repair(&self, tasks: &TaskRegistry<'_>) -> CoordResult<RepairReport> {
        let mut report = RepairReport::default();

        for (task_id, owner) in tasks.orphaned_claims()? {
            warn!(task = %task_id, session = %owner, "clearing unconfirmed task owner");
            tasks.force_release(&task_id)?;
            report.cleared_task_owners.push(task_id);
        }

        for session in self.list()? {
            if session.status == SessionStatus::Closed && session.claims.is_empty() {
                continue;
            }
            let dangling = tasks.dangling_session_claims(&session)?;
            if dangling.is_empty() {
                continue;
            }
            record::update_atomic(
                "session",
                &session.id,
                &self.ctx.layout().session_path(&session.id),
                self.ctx.lock_settings(),
                |record: &mut SessionRecord| {
                    for task_id in &dangling {
                        record.claims.remove(task_id);
                    }
                    Ok(())
                },
            )?;
            for task_id in dangling {
                report.dropped_session_claims.push(ReclaimedClaim {
                    session_id: session.id.clone(),
                    task_id,
                });
            }
        }
        Ok(report)
    }

    /// Advance the workspace descriptor one step through the session
    /// machine's self-transition, enforcing monotonicity.
    fn advance_workspace(
        &self,
        id: &str,
        target: WorkspaceState,
        path: Option<PathBuf>,
    ) -> CoordResult<SessionRecord> {
        let machine = session_machine();
        record::update_atomic(
            "session",
            id,
            &self.ctx.layout().session_path(id),
            self.ctx.lock_settings(),
            |session: &mut SessionRecord| {
                let facts = SessionFacts {
                    claims_held: Vec::new(),
                    workspace_step: Some((session.workspace.state, target)),
                };
                machine.fire(id, session.status, SessionEvent::AdvanceWorkspace, &facts)?;
                session.workspace.state = target;
                if let Some(path) = &path {
                    session.workspace.path = Some(path.clone());
                }
                Ok(session.clone())
            },
        )
    }

    /// Detach the workspace via the provider (outside any lock), then mark
    /// the descriptor archived.
    fn archive_workspace<W: WorkspaceProvider>(
        &self,
        session: &SessionRecord,
        provider: &W,
    ) -> CoordResult<()> {
        if session.workspace.state != WorkspaceState::Ready {
            return Ok(());
        }
        let Some(path) = &session.workspace.path else {
            return Ok(());
        };
        provider.archive(path).map_err(|err| CoordError::Workspace {
            session: session.id.clone(),
            message: format!("{err:#}"),
        })?;
        self.advance_workspace(&session.id, WorkspaceState::Archived, None)?;
        Ok(())
    }
}
