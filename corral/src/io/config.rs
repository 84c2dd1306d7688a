//! Coordination configuration stored at `<root>/corral.toml`.
//!
//! This file is intended to be edited by humans and must remain stable and
//! automatable. Missing fields default to sensible values. The core consumes
//! resolved values only; validator file-pattern triggers are compiled into a
//! [`ValidatorRoster`] once, at context construction.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::io::lock::{LockSettings, LockStrategy};

/// Coordination configuration (TOML).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CoordConfig {
    pub lock: LockConfig,
    pub ids: IdConfig,
    pub naming: NamingConfig,
    pub retry: RetryConfig,
    pub claims: ClaimConfig,
    /// Roster used when no trigger pattern matches the changed file set.
    pub default_validators: Vec<String>,
    /// File-pattern triggers; the expected set for a round is the union of
    /// rosters whose pattern matches any changed file.
    pub validators: Vec<ValidatorTrigger>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LockConfig {
    /// Acquire budget in milliseconds.
    pub timeout_ms: u64,
    /// Poll cadence in milliseconds.
    pub poll_ms: u64,
    /// Operator-configured staleness threshold for abandoned locks.
    pub stale_after_secs: u64,
    pub strategy: LockStrategy,
    /// Permit lockless reads after timeout (never writes).
    pub fail_open_reads: bool,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            poll_ms: 50,
            stale_after_secs: 600,
            strategy: LockStrategy::Native,
            fail_open_reads: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IdConfig {
    /// Task/session slug length limit.
    pub max_len: usize,
}

impl Default for IdConfig {
    fn default() -> Self {
        Self { max_len: 64 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NamingConfig {
    /// Round directories: `round-001`, `round-002`, ...
    pub round_prefix: String,
    pub round_width: usize,
    /// Report files: `<validator>.<report_suffix>`.
    pub report_suffix: String,
    pub bundle_summary: String,
    pub implementation: String,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            round_prefix: "round".to_string(),
            round_width: 3,
            report_suffix: "report.json".to_string(),
            bundle_summary: "bundle.summary.json".to_string(),
            implementation: "implementation.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    /// Bounded attempt count for the resilience wrapper.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 50,
            max_delay_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClaimConfig {
    /// Default max-age for `recover_timed_out_claims`.
    pub heartbeat_timeout_secs: u64,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: 900,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidatorTrigger {
    /// Regex matched against each changed file path.
    pub pattern: String,
    pub roster: Vec<String>,
}

impl Default for CoordConfig {
    fn default() -> Self {
        Self {
            lock: LockConfig::default(),
            ids: IdConfig::default(),
            naming: NamingConfig::default(),
            retry: RetryConfig::default(),
            claims: ClaimConfig::default(),
            default_validators: vec!["review".to_string()],
            validators: vec![ValidatorTrigger {
                pattern: r"\.rs$".to_string(),
                roster: vec!["security".to_string(), "performance".to_string()],
            }],
        }
    }
}

impl CoordConfig {
    pub fn validate(&self) -> Result<()> {
        if self.lock.timeout_ms == 0 {
            return Err(anyhow!("lock.timeout_ms must be > 0"));
        }
        if self.lock.poll_ms == 0 {
            return Err(anyhow!("lock.poll_ms must be > 0"));
        }
        if self.lock.stale_after_secs == 0 {
            return Err(anyhow!("lock.stale_after_secs must be > 0"));
        }
        if self.ids.max_len == 0 {
            return Err(anyhow!("ids.max_len must be > 0"));
        }
        if self.naming.round_prefix.trim().is_empty() {
            return Err(anyhow!("naming.round_prefix must be non-empty"));
        }
        if self.retry.max_attempts == 0 {
            return Err(anyhow!("retry.max_attempts must be > 0"));
        }
        if self.default_validators.is_empty() {
            return Err(anyhow!("default_validators must name at least one validator"));
        }
        for trigger in &self.validators {
            Regex::new(&trigger.pattern)
                .with_context(|| format!("invalid validator pattern '{}'", trigger.pattern))?;
            if trigger.roster.is_empty() {
                return Err(anyhow!(
                    "validator trigger '{}' has an empty roster",
                    trigger.pattern
                ));
            }
        }
        Ok(())
    }

    /// Resolved lock parameters.
    pub fn lock_settings(&self) -> LockSettings {
        LockSettings {
            timeout: Duration::from_millis(self.lock.timeout_ms),
            poll: Duration::from_millis(self.lock.poll_ms),
            stale_after: Duration::from_secs(self.lock.stale_after_secs),
            strategy: self.lock.strategy,
        }
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.claims.heartbeat_timeout_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `CoordConfig::default()`.
pub fn load_config(path: &Path) -> Result<CoordConfig> {
    if !path.exists() {
        let cfg = CoordConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: CoordConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &CoordConfig) -> Result<()> {
    cfg.validate()?;
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

/// Validator triggers compiled at startup. Closed registry: every validator
/// id that can ever be expected is named here.
#[derive(Debug, Clone)]
pub struct ValidatorRoster {
    triggers: Vec<(Regex, Vec<String>)>,
    default: Vec<String>,
}

impl ValidatorRoster {
    pub fn compile(cfg: &CoordConfig) -> Result<Self> {
        let mut triggers = Vec::with_capacity(cfg.validators.len());
        for trigger in &cfg.validators {
            let regex = Regex::new(&trigger.pattern)
                .with_context(|| format!("compile validator pattern '{}'", trigger.pattern))?;
            triggers.push((regex, trigger.roster.clone()));
        }
        Ok(Self {
            triggers,
            default: cfg.default_validators.clone(),
        })
    }

    /// Expected validator ids for a changed file set: the union of rosters
    /// whose pattern matches any file, or the default roster when none match.
    pub fn expected(&self, changed_files: &[String]) -> BTreeSet<String> {
        let mut expected = BTreeSet::new();
        for (regex, roster) in &self.triggers {
            if changed_files.iter().any(|f| regex.is_match(f)) {
                expected.extend(roster.iter().cloned());
            }
        }
        if expected.is_empty() {
            expected.extend(self.default.iter().cloned());
        }
        expected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, CoordConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("corral.toml");
        let cfg = CoordConfig::default();
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn validate_rejects_bad_pattern() {
        let mut cfg = CoordConfig::default();
        cfg.validators.push(ValidatorTrigger {
            pattern: "[unclosed".to_string(),
            roster: vec!["review".to_string()],
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn roster_unions_matching_triggers() {
        let mut cfg = CoordConfig::default();
        cfg.validators = vec![
            ValidatorTrigger {
                pattern: r"\.rs$".to_string(),
                roster: vec!["security".to_string()],
            },
            ValidatorTrigger {
                pattern: r"^docs/".to_string(),
                roster: vec!["docs".to_string()],
            },
        ];
        let roster = ValidatorRoster::compile(&cfg).expect("compile");

        let expected = roster.expected(&["src/lib.rs".to_string(), "docs/guide.md".to_string()]);
        let ids: Vec<&str> = expected.iter().map(String::as_str).collect();
        assert_eq!(ids, vec!["docs", "security"]);
    }

    #[test]
    fn roster_falls_back_to_default() {
        let cfg = CoordConfig::default();
        let roster = ValidatorRoster::compile(&cfg).expect("compile");
        let expected = roster.expected(&["assets/logo.png".to_string()]);
        let ids: Vec<&str> = expected.iter().map(String::as_str).collect();
        assert_eq!(ids, vec!["review"]);
    }
}
