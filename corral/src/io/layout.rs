//! On-disk layout of the coordination root (stable contract).
//!
//! ```text
//! <root>/
//!   corral.toml
//!   tasks/<task-id>.json
//!   sessions/<session-id>.json
//!   qa/<task-id>.json
//!   evidence/<task-id>/implementation.json
//!   evidence/<task-id>/round-00N/round.json
//!   evidence/<task-id>/round-00N/<validator>.report.json
//!   evidence/<task-id>/round-00N/bundle.summary.json
//! ```
//!
//! Record ids become file and directory names, so they are validated as
//! path-safe slugs before any path is built.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context as _;

use crate::error::{CoordError, CoordResult};
use crate::io::config::NamingConfig;

/// Resolved paths under one coordination root.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
    naming: NamingConfig,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>, naming: NamingConfig) -> Self {
        Self {
            root: root.into(),
            naming,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("corral.toml")
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.root.join("tasks")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    pub fn qa_dir(&self) -> PathBuf {
        self.root.join("qa")
    }

    pub fn evidence_dir(&self) -> PathBuf {
        self.root.join("evidence")
    }

    pub fn task_path(&self, task_id: &str) -> PathBuf {
        self.tasks_dir().join(format!("{task_id}.json"))
    }

    pub fn session_path(&self, session_id: &str) -> PathBuf {
        self.sessions_dir().join(format!("{session_id}.json"))
    }

    pub fn brief_path(&self, task_id: &str) -> PathBuf {
        self.qa_dir().join(format!("{task_id}.json"))
    }

    pub fn task_evidence_dir(&self, task_id: &str) -> PathBuf {
        self.evidence_dir().join(task_id)
    }

    pub fn implementation_path(&self, task_id: &str) -> PathBuf {
        self.task_evidence_dir(task_id)
            .join(&self.naming.implementation)
    }

    pub fn round_dir(&self, task_id: &str, round: u32) -> PathBuf {
        let name = format!(
            "{}-{:0width$}",
            self.naming.round_prefix,
            round,
            width = self.naming.round_width
        );
        self.task_evidence_dir(task_id).join(name)
    }

    pub fn round_manifest_path(&self, task_id: &str, round: u32) -> PathBuf {
        self.round_dir(task_id, round).join("round.json")
    }

    pub fn report_path(&self, task_id: &str, round: u32, validator: &str) -> PathBuf {
        self.round_dir(task_id, round)
            .join(format!("{validator}.{}", self.naming.report_suffix))
    }

    pub fn bundle_summary_path(&self, task_id: &str, round: u32) -> PathBuf {
        self.round_dir(task_id, round).join(&self.naming.bundle_summary)
    }

    /// Report files present in a round directory, sorted. The manifest and
    /// any cached bundle summary are not reports.
    pub fn report_paths(&self, task_id: &str, round: u32) -> CoordResult<Vec<PathBuf>> {
        let dir = self.round_dir(task_id, round);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let suffix = format!(".{}", self.naming.report_suffix);
        let mut paths = Vec::new();
        let entries =
            fs::read_dir(&dir).with_context(|| format!("read directory {}", dir.display()))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("read dir entry in {}", dir.display()))?;
            let name = entry.file_name();
            if name.to_string_lossy().ends_with(&suffix) {
                paths.push(entry.path());
            }
        }
        paths.sort();
        Ok(paths)
    }

    /// Create the record directories if missing.
    pub fn ensure(&self) -> CoordResult<()> {
        for dir in [
            self.tasks_dir(),
            self.sessions_dir(),
            self.qa_dir(),
            self.evidence_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("create directory {}", dir.display()))?;
        }
        Ok(())
    }

    /// Record ids present in a record directory (`<id>.json`), sorted.
    pub fn list_ids(&self, dir: &Path) -> CoordResult<Vec<String>> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        let entries =
            fs::read_dir(dir).with_context(|| format!("read directory {}", dir.display()))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("read dir entry in {}", dir.display()))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(id) = name.strip_suffix(".json") {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Validate an id as a path-safe slug: ASCII alphanumerics, `-` and `_`,
/// starting with an alphanumeric, within the configured length limit.
pub fn validate_id(kind: &'static str, id: &str, max_len: usize) -> CoordResult<()> {
    if id.is_empty() {
        return Err(invalid(kind, id, "must not be empty"));
    }
    if id.len() > max_len {
        return Err(invalid(
            kind,
            id,
            format!("exceeds {max_len} character limit"),
        ));
    }
    if !id.chars().next().is_some_and(|c| c.is_ascii_alphanumeric()) {
        return Err(invalid(kind, id, "must start with a letter or digit"));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(invalid(
            kind,
            id,
            "only ASCII letters, digits, '-' and '_' are allowed",
        ));
    }
    Ok(())
}

fn invalid(kind: &'static str, id: &str, reason: impl Into<String>) -> CoordError {
    CoordError::InvalidId {
        kind,
        id: id.to_string(),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::NamingConfig;

    fn layout(root: &Path) -> StoreLayout {
        StoreLayout::new(root, NamingConfig::default())
    }

    #[test]
    fn round_dirs_are_zero_padded() {
        let temp = tempfile::tempdir().expect("tempdir");
        let layout = layout(temp.path());
        assert!(
            layout
                .round_manifest_path("t1", 7)
                .ends_with("evidence/t1/round-007/round.json")
        );
        assert!(
            layout
                .report_path("t1", 7, "security")
                .ends_with("round-007/security.report.json")
        );
    }

    #[test]
    fn list_ids_strips_json_suffix_and_sorts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let layout = layout(temp.path());
        layout.ensure().expect("ensure");
        fs::write(layout.task_path("b-task"), "{}").expect("write");
        fs::write(layout.task_path("a-task"), "{}").expect("write");
        fs::write(layout.tasks_dir().join("a-task.json.lock"), "").expect("write");

        let ids = layout.list_ids(&layout.tasks_dir()).expect("list");
        assert_eq!(ids, vec!["a-task", "b-task"]);
    }

    #[test]
    fn id_validation_rejects_path_hostile_slugs() {
        assert!(validate_id("task", "good-slug_1", 64).is_ok());
        assert!(validate_id("task", "", 64).is_err());
        assert!(validate_id("task", "../escape", 64).is_err());
        assert!(validate_id("task", "has/slash", 64).is_err());
        assert!(validate_id("task", ".hidden", 64).is_err());
        assert!(validate_id("task", "x".repeat(65).as_str(), 64).is_err());
    }
}
