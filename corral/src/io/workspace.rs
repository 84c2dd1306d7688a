//! Workspace materialization via the version-control collaborator.
//!
//! The coordinator treats workspace operations as black-box, retryable, and
//! idempotent-on-failure. The default provider uses `git worktree` to give
//! each session an isolated working copy on its own branch; tests substitute
//! a plain-directory provider. Provider calls always happen outside any
//! record lock.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, bail};
use tracing::{debug, instrument};

/// External collaborator contract for isolated working copies.
pub trait WorkspaceProvider {
    /// Materialize a workspace for the session and return its path.
    /// Must be idempotent: re-invoking after a partial failure converges.
    fn create(&self, session_id: &str) -> Result<PathBuf>;

    /// Detach the workspace, keeping its committed work reachable.
    fn archive(&self, path: &Path) -> Result<()>;

    /// Re-materialize a previously archived workspace at the same path.
    fn restore(&self, path: &Path) -> Result<()>;
}

/// `git worktree`-backed provider. Each session gets
/// `<worktrees_dir>/<session-id>` checked out on branch `agent/<session-id>`.
#[derive(Debug, Clone)]
pub struct GitWorktreeProvider {
    repo_root: PathBuf,
    worktrees_dir: PathBuf,
}

impl GitWorktreeProvider {
    pub fn new(repo_root: impl Into<PathBuf>, worktrees_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            worktrees_dir: worktrees_dir.into(),
        }
    }

    fn branch_name(session_id: &str) -> String {
        format!("agent/{session_id}")
    }

    fn branch_exists(&self, branch: &str) -> Result<bool> {
        let output = Command::new("git")
            .args([
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])
            .current_dir(&self.repo_root)
            .output()
            .context("spawn git show-ref")?;
        Ok(output.status.success())
    }

    fn run_git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_root)
            .output()
            .with_context(|| format!("run git {:?}", args))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git {:?} failed: {}", args, stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl WorkspaceProvider for GitWorktreeProvider {
    #[instrument(skip_all, fields(session_id))]
    fn create(&self, session_id: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.worktrees_dir).with_context(|| {
            format!("create worktrees dir {}", self.worktrees_dir.display())
        })?;
        let path = self.worktrees_dir.join(session_id);
        if path.join(".git").exists() {
            debug!(path = %path.display(), "worktree already materialized");
            return Ok(path);
        }

        let branch = Self::branch_name(session_id);
        let path_str = path.to_string_lossy().to_string();
        if self.branch_exists(&branch)? {
            self.run_git(&["worktree", "add", &path_str, &branch])?;
        } else {
            self.run_git(&["worktree", "add", "-b", &branch, &path_str])?;
        }
        debug!(path = %path.display(), branch, "worktree created");
        Ok(path)
    }

    #[instrument(skip_all)]
    fn archive(&self, path: &Path) -> Result<()> {
        if !path.exists() {
            debug!(path = %path.display(), "worktree already gone");
            return Ok(());
        }
        let path_str = path.to_string_lossy().to_string();
        self.run_git(&["worktree", "remove", "--force", &path_str])?;
        self.run_git(&["worktree", "prune"])?;
        Ok(())
    }

    #[instrument(skip_all)]
    fn restore(&self, path: &Path) -> Result<()> {
        if path.join(".git").exists() {
            return Ok(());
        }
        let session_id = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .context("workspace path has no final component")?;
        let branch = Self::branch_name(&session_id);
        if !self.branch_exists(&branch)? {
            bail!("no branch '{branch}' to restore workspace from");
        }
        let path_str = path.to_string_lossy().to_string();
        self.run_git(&["worktree", "add", &path_str, &branch])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_repo(root: &Path) {
        for args in [
            vec!["init"],
            vec!["config", "user.email", "test@example.com"],
            vec!["config", "user.name", "test"],
        ] {
            let status = Command::new("git")
                .args(&args)
                .current_dir(root)
                .status()
                .expect("git");
            assert!(status.success(), "git {args:?}");
        }
        fs::write(root.join("README.md"), "hi\n").expect("write");
        for args in [vec!["add", "."], vec!["commit", "-m", "chore: init"]] {
            let status = Command::new("git")
                .args(&args)
                .current_dir(root)
                .status()
                .expect("git");
            assert!(status.success(), "git {args:?}");
        }
    }

    #[test]
    fn create_is_idempotent_and_archive_keeps_branch() {
        let temp = tempfile::tempdir().expect("tempdir");
        let repo = temp.path().join("repo");
        fs::create_dir_all(&repo).expect("mkdir");
        init_repo(&repo);

        let provider = GitWorktreeProvider::new(&repo, temp.path().join("worktrees"));

        let path = provider.create("s1").expect("create");
        assert!(path.join(".git").exists());
        let again = provider.create("s1").expect("recreate");
        assert_eq!(path, again);

        provider.archive(&path).expect("archive");
        assert!(!path.exists());
        assert!(provider.branch_exists("agent/s1").expect("branch check"));

        provider.restore(&path).expect("restore");
        assert!(path.join(".git").exists());
    }
}
