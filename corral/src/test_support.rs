//! Shared helpers for tests.
//!
//! Available to unit tests and, behind the `test-support` feature, to
//! integration tests and downstream crates' test suites. Helpers panic on
//! setup failure instead of returning errors; a broken fixture is a bug in
//! the test, not a condition to handle.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Utc;

use crate::coordinator::{CoordContext, Coordinator};
use crate::core::report::{Verdict, ValidatorReport};
use crate::core::session::SessionMode;
use crate::core::task::{TaskKind, TaskRecord};
use crate::io::config::CoordConfig;
use crate::io::workspace::WorkspaceProvider;
use crate::tasks::NewTask;

/// A coordination root in a temp directory, dropped with it.
pub struct TestStore {
    pub temp: tempfile::TempDir,
    pub ctx: CoordContext,
}

impl TestStore {
    pub fn root(&self) -> &Path {
        self.ctx.layout().root()
    }

    pub fn coordinator(&self) -> Coordinator<DirWorkspaces> {
        Coordinator::new(self.ctx.clone(), DirWorkspaces::new(self.temp.path()))
    }
}

/// Fresh store with default configuration.
pub fn store() -> TestStore {
    store_with(CoordConfig::default())
}

/// Fresh store with the given configuration.
pub fn store_with(config: CoordConfig) -> TestStore {
    let temp = tempfile::tempdir().expect("create temp dir");
    let root = temp.path().join("store");
    let ctx = CoordContext::with_config(&root, config).expect("open context");
    TestStore { temp, ctx }
}

/// Config with lock budgets tightened so contention tests fail fast.
pub fn fast_lock_config() -> CoordConfig {
    let mut config = CoordConfig::default();
    config.lock.timeout_ms = 500;
    config.lock.poll_ms = 5;
    config
}

/// Plain-directory workspace provider: no git, no subprocesses.
#[derive(Debug, Clone)]
pub struct DirWorkspaces {
    live: PathBuf,
    archived: PathBuf,
}

impl DirWorkspaces {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        Self {
            live: base.join("workspaces"),
            archived: base.join("archived"),
        }
    }
}

impl WorkspaceProvider for DirWorkspaces {
    fn create(&self, session_id: &str) -> Result<PathBuf> {
        let path = self.live.join(session_id);
        fs::create_dir_all(&path)
            .with_context(|| format!("create workspace {}", path.display()))?;
        Ok(path)
    }

    fn archive(&self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }
        let name = path
            .file_name()
            .context("workspace path has no final component")?;
        fs::create_dir_all(&self.archived)?;
        fs::rename(path, self.archived.join(name))
            .with_context(|| format!("archive workspace {}", path.display()))?;
        Ok(())
    }

    fn restore(&self, path: &Path) -> Result<()> {
        if path.exists() {
            return Ok(());
        }
        let name = path
            .file_name()
            .context("workspace path has no final component")?;
        let archived = self.archived.join(name);
        if archived.exists() {
            fs::rename(&archived, path)
                .with_context(|| format!("restore workspace {}", path.display()))?;
        } else {
            fs::create_dir_all(path)
                .with_context(|| format!("recreate workspace {}", path.display()))?;
        }
        Ok(())
    }
}

/// Provider whose `create` always fails, for materialization-failure paths.
#[derive(Debug, Clone, Copy)]
pub struct FailingWorkspaces;

impl WorkspaceProvider for FailingWorkspaces {
    fn create(&self, _session_id: &str) -> Result<PathBuf> {
        bail!("workspace backend unavailable")
    }

    fn archive(&self, _path: &Path) -> Result<()> {
        bail!("workspace backend unavailable")
    }

    fn restore(&self, _path: &Path) -> Result<()> {
        bail!("workspace backend unavailable")
    }
}

/// Create a feature task in wave 0.
pub fn seed_task(ctx: &CoordContext, id: &str) -> TaskRecord {
    crate::tasks::TaskRegistry::new(ctx)
        .create(&NewTask {
            id: id.to_string(),
            wave: 0,
            kind: TaskKind::Feature,
            parent: None,
        })
        .expect("seed task")
}

/// Register a workspace-less autonomous session.
pub fn seed_session(ctx: &CoordContext, id: &str) {
    crate::sessions::SessionRegistry::new(ctx)
        .create(id, "tester", SessionMode::Autonomous, false, &FailingWorkspaces)
        .expect("seed session");
}

/// A minimal report for the given validator and round.
pub fn report(validator: &str, round: u32, verdict: Verdict) -> ValidatorReport {
    ValidatorReport {
        round,
        validator: validator.to_string(),
        reviewer: format!("{validator}-reviewer"),
        verdict,
        findings: Vec::new(),
        follow_ups: Vec::new(),
        submitted_at: Utc::now(),
    }
}
