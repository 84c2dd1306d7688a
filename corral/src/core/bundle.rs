//! Bundle aggregation: folding independent validator reports into one
//! promotion verdict.
//!
//! A bundle is a derived, cached view. It is a pure function of the stored
//! round manifests and reports, recomputable at any time, and never itself a
//! point of synchronization.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::report::{RoundManifest, ValidatorReport, Verdict};

/// Which records feed the aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BundleScope {
    /// Only the task's own latest round.
    #[serde(rename = "self")]
    SelfOnly,
    /// The task plus all descendants.
    #[serde(rename = "hierarchy")]
    Hierarchy,
    /// The task plus its explicitly linked cluster.
    #[serde(rename = "bundle")]
    Bundle,
}

impl fmt::Display for BundleScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BundleScope::SelfOnly => "self",
            BundleScope::Hierarchy => "hierarchy",
            BundleScope::Bundle => "bundle",
        };
        write!(f, "{s}")
    }
}

/// Evidence gathered for one cluster member: its latest round manifest (if
/// any) and the reports filed for that round.
#[derive(Debug, Clone)]
pub struct MemberEvidence {
    pub task_id: String,
    pub manifest: Option<RoundManifest>,
    pub reports: Vec<ValidatorReport>,
}

/// Per-member aggregation result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemberSummary {
    pub task_id: String,
    /// Latest round number, or `None` when no round was ever opened.
    pub round: Option<u32>,
    pub verdict: Verdict,
    /// Expected validators that have not reported.
    pub missing_validators: Vec<String>,
    pub detail: String,
}

/// Aggregate verdict across one or more related tasks' latest rounds
/// (`evidence/<task>/round-00N/bundle.summary.json` when cached).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Bundle {
    pub scope: BundleScope,
    pub root_task: String,
    /// The root task's latest round number (0 when none opened).
    pub round: u32,
    pub verdict: Verdict,
    pub members: Vec<MemberSummary>,
    pub summary: String,
    pub computed_at: DateTime<Utc>,
}

impl Bundle {
    /// Flat `task:validator` list of everything still missing, for
    /// `PromotionDenied` errors.
    pub fn missing(&self) -> Vec<String> {
        let mut out = Vec::new();
        for member in &self.members {
            if member.round.is_none() {
                out.push(format!("{}:<no round>", member.task_id));
                continue;
            }
            for validator in &member.missing_validators {
                out.push(format!("{}:{}", member.task_id, validator));
            }
        }
        out
    }
}

/// Fold member evidence into a bundle.
///
/// `approve` only when every member's latest round is complete and every
/// report in it approves. A definite `reject` anywhere outweighs missing
/// evidence; otherwise any incomplete round (or report-level `blocked`)
/// makes the bundle `blocked`.
pub fn aggregate(scope: BundleScope, root_task: &str, members: &[MemberEvidence]) -> Bundle {
    let summaries: Vec<MemberSummary> = members.iter().map(summarize_member).collect();

    let verdict = if summaries.iter().any(|m| m.verdict == Verdict::Reject) {
        Verdict::Reject
    } else if summaries.iter().any(|m| m.verdict == Verdict::Blocked) {
        Verdict::Blocked
    } else {
        Verdict::Approve
    };

    let round = members
        .iter()
        .find(|m| m.task_id == root_task)
        .and_then(|m| m.manifest.as_ref())
        .map_or(0, |manifest| manifest.round);

    let summary = render_summary(verdict, &summaries);

    Bundle {
        scope,
        root_task: root_task.to_string(),
        round,
        verdict,
        members: summaries,
        summary,
        computed_at: Utc::now(),
    }
}

fn summarize_member(member: &MemberEvidence) -> MemberSummary {
    let Some(manifest) = &member.manifest else {
        return MemberSummary {
            task_id: member.task_id.clone(),
            round: None,
            verdict: Verdict::Blocked,
            missing_validators: Vec::new(),
            detail: "no validation round opened".to_string(),
        };
    };

    // Ignore stray reports from other rounds; only the latest round counts.
    let reports: Vec<&ValidatorReport> = member
        .reports
        .iter()
        .filter(|r| r.round == manifest.round)
        .collect();
    let reported: BTreeSet<String> = reports.iter().map(|r| r.validator.clone()).collect();
    let missing: Vec<String> = manifest
        .missing(&reported)
        .iter()
        .map(|s| s.to_string())
        .collect();

    let rejected: Vec<&str> = reports
        .iter()
        .filter(|r| r.verdict == Verdict::Reject)
        .map(|r| r.validator.as_str())
        .collect();
    let blocked: Vec<&str> = reports
        .iter()
        .filter(|r| r.verdict == Verdict::Blocked)
        .map(|r| r.validator.as_str())
        .collect();

    let (verdict, detail) = if !rejected.is_empty() {
        (
            Verdict::Reject,
            format!("rejected by {}", rejected.join(", ")),
        )
    } else if !missing.is_empty() {
        (
            Verdict::Blocked,
            format!("round {} incomplete: missing {}", manifest.round, missing.join(", ")),
        )
    } else if !blocked.is_empty() {
        (
            Verdict::Blocked,
            format!("blocked by {}", blocked.join(", ")),
        )
    } else {
        (
            Verdict::Approve,
            format!("round {} approved by all validators", manifest.round),
        )
    };

    MemberSummary {
        task_id: member.task_id.clone(),
        round: Some(manifest.round),
        verdict,
        missing_validators: missing,
        detail,
    }
}

fn render_summary(verdict: Verdict, members: &[MemberSummary]) -> String {
    let approved = members
        .iter()
        .filter(|m| m.verdict == Verdict::Approve)
        .count();
    let mut lines = vec![format!(
        "{verdict}: {approved}/{} members approved",
        members.len()
    )];
    for member in members {
        lines.push(format!("- {}: {}", member.task_id, member.detail));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn report(validator: &str, round: u32, verdict: Verdict) -> ValidatorReport {
        ValidatorReport {
            round,
            validator: validator.to_string(),
            reviewer: format!("{validator}-model"),
            verdict,
            findings: Vec::new(),
            follow_ups: Vec::new(),
            submitted_at: Utc::now(),
        }
    }

    fn member(task_id: &str, expected: &[&str], reports: Vec<ValidatorReport>) -> MemberEvidence {
        MemberEvidence {
            task_id: task_id.to_string(),
            manifest: Some(RoundManifest::open(
                1,
                expected.iter().map(|s| s.to_string()).collect(),
            )),
            reports,
        }
    }

    #[test]
    fn all_approve_yields_approve() {
        let members = [member(
            "t1",
            &["a", "b"],
            vec![report("a", 1, Verdict::Approve), report("b", 1, Verdict::Approve)],
        )];
        let bundle = aggregate(BundleScope::SelfOnly, "t1", &members);
        assert_eq!(bundle.verdict, Verdict::Approve);
        assert_eq!(bundle.round, 1);
        assert!(bundle.missing().is_empty());
    }

    #[test]
    fn missing_validator_yields_blocked() {
        let members = [member("t1", &["a", "b"], vec![report("a", 1, Verdict::Approve)])];
        let bundle = aggregate(BundleScope::SelfOnly, "t1", &members);
        assert_eq!(bundle.verdict, Verdict::Blocked);
        assert_eq!(bundle.missing(), vec!["t1:b".to_string()]);
    }

    #[test]
    fn any_reject_yields_reject() {
        let members = [member(
            "t1",
            &["a", "b"],
            vec![report("a", 1, Verdict::Approve), report("b", 1, Verdict::Reject)],
        )];
        let bundle = aggregate(BundleScope::SelfOnly, "t1", &members);
        assert_eq!(bundle.verdict, Verdict::Reject);
    }

    /// A definite reject on one member outweighs missing evidence on another.
    #[test]
    fn reject_takes_precedence_over_blocked_across_members() {
        let members = [
            member("t1", &["a"], vec![report("a", 1, Verdict::Reject)]),
            member("t2", &["a"], Vec::new()),
        ];
        let bundle = aggregate(BundleScope::Hierarchy, "t1", &members);
        assert_eq!(bundle.verdict, Verdict::Reject);
    }

    #[test]
    fn member_without_round_blocks_the_bundle() {
        let members = [
            member("t1", &["a"], vec![report("a", 1, Verdict::Approve)]),
            MemberEvidence {
                task_id: "t2".to_string(),
                manifest: None,
                reports: Vec::new(),
            },
        ];
        let bundle = aggregate(BundleScope::Hierarchy, "t1", &members);
        assert_eq!(bundle.verdict, Verdict::Blocked);
        assert_eq!(bundle.missing(), vec!["t2:<no round>".to_string()]);
    }

    #[test]
    fn stale_round_reports_are_ignored() {
        let mut evidence = member("t1", &["a"], vec![report("a", 1, Verdict::Approve)]);
        evidence.manifest = Some(RoundManifest::open(
            2,
            ["a".to_string()].into_iter().collect(),
        ));
        let bundle = aggregate(BundleScope::SelfOnly, "t1", &[evidence]);
        assert_eq!(bundle.verdict, Verdict::Blocked);
        assert_eq!(bundle.round, 2);
    }

    #[test]
    fn blocked_report_blocks_without_reject() {
        let members = [member("t1", &["a"], vec![report("a", 1, Verdict::Blocked)])];
        let bundle = aggregate(BundleScope::SelfOnly, "t1", &members);
        assert_eq!(bundle.verdict, Verdict::Blocked);
    }
}
