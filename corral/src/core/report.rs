//! Evidence types: round manifests and validator reports.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A validator's overall verdict for one round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Approve,
    Reject,
    /// The validator could not complete its review.
    Blocked,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::Approve => "approve",
            Verdict::Reject => "reject",
            Verdict::Blocked => "blocked",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Minor,
    Major,
    Critical,
}

/// One reviewer finding inside a report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Finding {
    pub severity: Severity,
    /// Free-form category ("correctness", "style", ...).
    pub category: String,
    /// Where the finding applies (path, path:line, or module name).
    pub location: String,
    pub description: String,
}

/// A follow-up task suggested by a reviewer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FollowUp {
    /// Slug for the task to create.
    pub id: String,
    pub title: String,
}

/// Write-once report submitted by one validator for one round
/// (`evidence/<task>/round-00N/<validator>.report.json`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidatorReport {
    pub round: u32,
    /// Roster id ("security", "performance", ...).
    pub validator: String,
    /// Model or human reviewer identity behind the validator id.
    pub reviewer: String,
    pub verdict: Verdict,
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub follow_ups: Vec<FollowUp>,
    pub submitted_at: DateTime<Utc>,
}

/// Round manifest (`evidence/<task>/round-00N/round.json`).
///
/// Round numbers are monotonic per task, starting at 1. A round is complete
/// when every expected validator has a report on file; it is closed once the
/// bundle has been promoted or rejected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoundManifest {
    pub round: u32,
    /// Validator ids expected to report, derived from the configured
    /// file-pattern triggers over the changed file set.
    pub expected: BTreeSet<String>,
    pub opened_at: DateTime<Utc>,
    /// Stamped by promote (approve or reject); reports are refused after.
    pub closed_at: Option<DateTime<Utc>>,
}

impl RoundManifest {
    pub fn open(round: u32, expected: BTreeSet<String>) -> Self {
        Self {
            round,
            expected,
            opened_at: Utc::now(),
            closed_at: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed_at.is_some()
    }

    /// Expected validators with no report among `reported`.
    pub fn missing<'a>(&'a self, reported: &BTreeSet<String>) -> Vec<&'a str> {
        self.expected
            .iter()
            .filter(|v| !reported.contains(*v))
            .map(String::as_str)
            .collect()
    }

    /// True when every expected validator id appears in `reported`.
    pub fn is_complete(&self, reported: &BTreeSet<String>) -> bool {
        self.missing(reported).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expected(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn round_completeness_tracks_expected_set() {
        let manifest = RoundManifest::open(1, expected(&["security", "performance"]));

        let none = BTreeSet::new();
        assert!(!manifest.is_complete(&none));
        assert_eq!(manifest.missing(&none), vec!["performance", "security"]);

        let partial = expected(&["security"]);
        assert_eq!(manifest.missing(&partial), vec!["performance"]);

        let all = expected(&["security", "performance"]);
        assert!(manifest.is_complete(&all));
    }

    #[test]
    fn extra_reports_do_not_break_completeness() {
        let manifest = RoundManifest::open(1, expected(&["security"]));
        let reported = expected(&["security", "style"]);
        assert!(manifest.is_complete(&reported));
    }
}
