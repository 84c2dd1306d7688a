//! The coordination facade: one context, three registries, one entry point.
//!
//! [`CoordContext`] resolves configuration once (validator triggers
//! compiled, lock settings materialized) and owns the store layout.
//! [`Coordinator`] wires the registries to a workspace provider and exposes
//! the operation surface that agents and the CLI call.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, instrument};

use crate::core::bundle::{Bundle, BundleScope};
use crate::core::report::{RoundManifest, ValidatorReport};
use crate::core::session::{SessionMode, SessionRecord};
use crate::core::task::{TaskEvent, TaskRecord};
use crate::error::CoordResult;
use crate::evidence::{
    EvidencePipeline, ImplementationReport, PromoteOptions, PromotionOutcome,
};
use crate::io::config::{CoordConfig, ValidatorRoster, load_config};
use crate::io::layout::StoreLayout;
use crate::io::lock::{self, LockSettings};
use crate::io::workspace::WorkspaceProvider;
use crate::sessions::{CloseOptions, ReclaimedClaim, RepairReport, SessionRegistry};
use crate::tasks::{ClaimOptions, NewTask, TaskRegistry};

/// Resolved environment for one coordination root.
#[derive(Debug, Clone)]
pub struct CoordContext {
    config: CoordConfig,
    layout: StoreLayout,
    roster: ValidatorRoster,
    lock: LockSettings,
}

impl CoordContext {
    /// Load `<root>/corral.toml` (defaults when missing), compile the
    /// validator triggers, and create the record directories.
    pub fn open(root: impl Into<PathBuf>) -> CoordResult<Self> {
        let root = root.into();
        let config = load_config(&root.join("corral.toml"))?;
        Self::with_config(root, config)
    }

    /// Build a context from an already-resolved configuration.
    pub fn with_config(root: impl Into<PathBuf>, config: CoordConfig) -> CoordResult<Self> {
        config.validate()?;
        let layout = StoreLayout::new(root, config.naming.clone());
        layout.ensure()?;
        let roster = ValidatorRoster::compile(&config)?;
        let lock = config.lock_settings();
        Ok(Self {
            config,
            layout,
            roster,
            lock,
        })
    }

    pub fn config(&self) -> &CoordConfig {
        &self.config
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn roster(&self) -> &ValidatorRoster {
        &self.roster
    }

    pub fn lock_settings(&self) -> &LockSettings {
        &self.lock
    }
}

/// Facade over the registries, generic over how workspaces are provided.
pub struct Coordinator<W> {
    ctx: CoordContext,
    workspaces: W,
}

impl<W: WorkspaceProvider> Coordinator<W> {
    pub fn new(ctx: CoordContext, workspaces: W) -> Self {
        Self { ctx, workspaces }
    }

    pub fn context(&self) -> &CoordContext {
        &self.ctx
    }

    pub fn tasks(&self) -> TaskRegistry<'_> {
        TaskRegistry::new(&self.ctx)
    }

    pub fn sessions(&self) -> SessionRegistry<'_> {
        SessionRegistry::new(&self.ctx)
    }

    pub fn evidence(&self) -> EvidencePipeline<'_> {
        EvidencePipeline::new(&self.ctx)
    }

    // --- tasks ---

    pub fn create_task(&self, spec: &NewTask) -> CoordResult<TaskRecord> {
        self.tasks().create(spec)
    }

    pub fn get_task(&self, task_id: &str) -> CoordResult<TaskRecord> {
        self.tasks().get(task_id)
    }

    pub fn claim_task(
        &self,
        task_id: &str,
        session_id: &str,
        opts: ClaimOptions,
    ) -> CoordResult<TaskRecord> {
        self.tasks().claim(task_id, session_id, opts)
    }

    pub fn release_task(&self, task_id: &str, session_id: &str) -> CoordResult<TaskRecord> {
        self.tasks().release(task_id, session_id)
    }

    pub fn transition_task(&self, task_id: &str, event: TaskEvent) -> CoordResult<TaskRecord> {
        self.tasks().transition(task_id, event, false)
    }

    pub fn link_child(&self, parent_id: &str, child_id: &str) -> CoordResult<()> {
        self.tasks().link_child(parent_id, child_id)
    }

    pub fn link_cluster(&self, a: &str, b: &str) -> CoordResult<()> {
        self.tasks().link_cluster(a, b)
    }

    pub fn ready_tasks(&self) -> CoordResult<Vec<TaskRecord>> {
        self.tasks().list_ready()
    }

    // --- sessions ---

    pub fn create_session(
        &self,
        session_id: &str,
        owner: &str,
        mode: SessionMode,
        with_workspace: bool,
    ) -> CoordResult<SessionRecord> {
        self.sessions()
            .create(session_id, owner, mode, with_workspace, &self.workspaces)
    }

    pub fn get_session(&self, session_id: &str) -> CoordResult<SessionRecord> {
        self.sessions().get(session_id)
    }

    pub fn resume_workspace(&self, session_id: &str) -> CoordResult<SessionRecord> {
        self.sessions().resume_workspace(session_id, &self.workspaces)
    }

    pub fn heartbeat(&self, session_id: &str) -> CoordResult<SessionRecord> {
        self.sessions().heartbeat(session_id)
    }

    pub fn close_session(
        &self,
        session_id: &str,
        opts: CloseOptions,
    ) -> CoordResult<SessionRecord> {
        self.sessions()
            .close(session_id, opts, &self.workspaces, &self.tasks())
    }

    // --- evidence ---

    pub fn submit_implementation(&self, report: &ImplementationReport) -> CoordResult<()> {
        self.evidence().submit_implementation(report)
    }

    pub fn start_round(
        &self,
        task_id: &str,
        actor: &str,
        changed_files: Option<&[String]>,
    ) -> CoordResult<RoundManifest> {
        self.evidence().start_round(task_id, actor, changed_files)
    }

    pub fn submit_report(&self, task_id: &str, report: &ValidatorReport) -> CoordResult<()> {
        self.evidence().submit_report(task_id, report)
    }

    pub fn compute_bundle(&self, task_id: &str, scope: BundleScope) -> CoordResult<Bundle> {
        self.evidence().compute_bundle(task_id, scope, &self.tasks())
    }

    pub fn promote(
        &self,
        task_id: &str,
        opts: &PromoteOptions,
    ) -> CoordResult<PromotionOutcome> {
        self.evidence().promote(task_id, opts, &self.tasks())
    }

    // --- recovery ---

    /// Return claims held by sessions with stale heartbeats to the pool.
    pub fn recover_timed_out_claims(
        &self,
        max_age: Option<Duration>,
    ) -> CoordResult<Vec<ReclaimedClaim>> {
        self.sessions()
            .recover_timed_out_claims(max_age, &self.tasks())
    }

    /// Reconcile the two halves of the claim protocol after crashes.
    pub fn repair(&self) -> CoordResult<RepairReport> {
        self.sessions().repair(&self.tasks())
    }

    /// Remove lock files older than `max_age` (default: the configured
    /// staleness threshold) left behind by dead processes.
    #[instrument(skip(self))]
    pub fn clear_stale_locks(&self, max_age: Option<Duration>) -> CoordResult<Vec<PathBuf>> {
        let max_age = max_age.unwrap_or(self.ctx.lock_settings().stale_after);
        let cleared = lock::sweep_stale_locks(self.ctx.layout().root(), max_age)?;
        debug!(count = cleared.len(), "stale locks cleared");
        Ok(cleared)
    }
}

impl<W> Coordinator<W> {
    pub fn root(&self) -> &Path {
        self.ctx.layout().root()
    }
}
