//! Evidence pipeline: implementation reports, validation rounds, validator
//! reports, bundles, and promotion.
//!
//! Round state lives in two places with distinct jobs: the QA brief carries
//! the current round number and status, while the round manifest under
//! `evidence/` carries the expected validator set and the closure stamp.
//! The manifest lock is the critical section for report submission; the
//! brief lock is the critical section for round allocation.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::coordinator::CoordContext;
use crate::core::brief::{QaAction, QaBrief, QaEvent, QaFacts, QaStatus, qa_machine};
use crate::core::bundle::{self, Bundle, BundleScope, MemberEvidence};
use crate::core::fsm::Fired;
use crate::core::graph;
use crate::core::report::{RoundManifest, ValidatorReport, Verdict};
use crate::core::task::{TaskEvent, TaskRecord};
use crate::error::{CoordError, CoordResult};
use crate::io::layout::validate_id;
use crate::io::{lock, record};
use crate::tasks::{NewTask, TaskRegistry};

/// Implementation evidence filed by the working session before a task can
/// reach `done` (`evidence/<task>/implementation.json`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImplementationReport {
    pub task_id: String,
    pub session_id: String,
    pub summary: String,
    /// Paths touched by the work; drives the expected validator set for
    /// each round via the configured file-pattern triggers.
    #[serde(default)]
    pub changed_files: Vec<String>,
    pub submitted_at: chrono::DateTime<chrono::Utc>,
}

/// Promotion inputs.
#[derive(Debug, Clone)]
pub struct PromoteOptions {
    pub scope: BundleScope,
    /// Create tasks from reviewer follow-up suggestions on reject.
    pub create_follow_ups: bool,
    /// Recorded in the brief history.
    pub actor: String,
}

impl Default for PromoteOptions {
    fn default() -> Self {
        Self {
            scope: BundleScope::SelfOnly,
            create_follow_ups: false,
            actor: "operator".to_string(),
        }
    }
}

/// What promotion did.
#[derive(Debug, Clone)]
pub enum PromotionOutcome {
    /// Bundle approved; the task is `validated`.
    Promoted { task: TaskRecord, bundle: Bundle },
    /// Bundle rejected; the brief is back in `todo` for another round.
    Rejected {
        bundle: Bundle,
        /// Ids of follow-up tasks created from reviewer suggestions.
        follow_ups: Vec<String>,
    },
}

pub struct EvidencePipeline<'a> {
    ctx: &'a CoordContext,
}

impl<'a> EvidencePipeline<'a> {
    pub fn new(ctx: &'a CoordContext) -> Self {
        Self { ctx }
    }

    /// Lockless brief read; tolerates staleness.
    pub fn brief(&self, task_id: &str) -> CoordResult<QaBrief> {
        record::require_json("qa-brief", task_id, &self.ctx.layout().brief_path(task_id))
    }

    /// Create the brief at `waiting` if it does not exist yet. Normally the
    /// task machine opens it when a task completes; this covers operator
    /// workflows that validate out-of-band work.
    pub fn ensure_brief(&self, task_id: &str) -> CoordResult<QaBrief> {
        let path = self.ctx.layout().brief_path(task_id);
        if let Some(brief) = record::read_json(&path)? {
            return Ok(brief);
        }
        let brief = QaBrief::new(task_id);
        record::write_json(&path, &brief)?;
        Ok(brief)
    }

    /// File (or refresh) the implementation report for a task.
    #[instrument(skip(self, report))]
    pub fn submit_implementation(&self, report: &ImplementationReport) -> CoordResult<()> {
        let layout = self.ctx.layout();
        // The task must exist; the report is meaningless without it.
        record::require_json::<TaskRecord>("task", &report.task_id, &layout.task_path(&report.task_id))?;
        record::write_json(&layout.implementation_path(&report.task_id), report)?;
        debug!(task = %report.task_id, session = %report.session_id, files = report.changed_files.len(), "implementation report filed");
        Ok(())
    }

    pub fn implementation(&self, task_id: &str) -> CoordResult<Option<ImplementationReport>> {
        record::read_json(&self.ctx.layout().implementation_path(task_id))
    }

    /// Open the next validation round.
    ///
    /// The expected validator set comes from the file-pattern triggers over
    /// `changed_files`; passing `None` uses the implementation report's
    /// changed file set. Round numbers are allocated under the brief lock,
    /// and the manifest is on disk before the brief points at it.
    #[instrument(skip(self, changed_files))]
    pub fn start_round(
        &self,
        task_id: &str,
        actor: &str,
        changed_files: Option<&[String]>,
    ) -> CoordResult<RoundManifest> {
        let layout = self.ctx.layout();
        let owned_files;
        let files: &[String] = match changed_files {
            Some(files) => files,
            None => {
                owned_files = self
                    .implementation(task_id)?
                    .map(|r| r.changed_files)
                    .unwrap_or_default();
                &owned_files
            }
        };
        let expected = self.ctx.roster().expected(files);

        let machine = qa_machine();
        let brief_path = layout.brief_path(task_id);
        let mut handle = lock::acquire(&brief_path, self.ctx.lock_settings())?;
        let result = (|| {
            let mut brief: QaBrief = record::require_json("qa-brief", task_id, &brief_path)?;

            if brief.status == QaStatus::Waiting {
                if let Fired::Moved { from, to, .. } =
                    machine.fire(task_id, brief.status, QaEvent::Activate, &QaFacts::default())?
                {
                    brief.record(actor, from, to, "brief activated");
                }
            }
            // `begin` is only legal from todo or wip; anything else (done,
            // validated, blocked) is refused by the machine.
            if brief.status == QaStatus::Todo {
                if let Fired::Moved { from, to, .. } =
                    machine.fire(task_id, brief.status, QaEvent::Begin, &QaFacts::default())?
                {
                    brief.record(actor, from, to, "validation begun");
                }
            } else if brief.status != QaStatus::Wip {
                machine.fire(task_id, brief.status, QaEvent::Begin, &QaFacts::default())?;
            }

            let round = brief.round + 1;
            let manifest = RoundManifest::open(round, expected.clone());
            record::write_json(&layout.round_manifest_path(task_id, round), &manifest)?;

            brief.round = round;
            brief.history.push(crate::core::brief::QaHistoryEntry {
                at: Utc::now(),
                actor: actor.to_string(),
                from: brief.status,
                to: brief.status,
                note: format!("round {round} opened, expecting [{}]", join(&expected)),
            });
            record::write_json(&brief_path, &brief)?;
            debug!(task = task_id, round, expected = %join(&expected), "round opened");
            Ok(manifest)
        })();
        handle.release();
        result
    }

    /// Accept one write-once validator report for the current round.
    #[instrument(skip(self, report), fields(task = task_id, validator = %report.validator, round = report.round))]
    pub fn submit_report(&self, task_id: &str, report: &ValidatorReport) -> CoordResult<()> {
        validate_id("validator", &report.validator, self.ctx.config().ids.max_len)?;
        let layout = self.ctx.layout();
        let brief = self.brief(task_id)?;
        if report.round != brief.round {
            return Err(CoordError::RoundClosed {
                task: task_id.to_string(),
                round: report.round,
            });
        }

        let manifest_path = layout.round_manifest_path(task_id, report.round);
        let mut handle = lock::acquire(&manifest_path, self.ctx.lock_settings())?;
        let result = (|| {
            let manifest: RoundManifest =
                record::require_json("round", task_id, &manifest_path)?;
            if manifest.is_closed() {
                return Err(CoordError::RoundClosed {
                    task: task_id.to_string(),
                    round: report.round,
                });
            }
            if !manifest.expected.contains(&report.validator) {
                return Err(CoordError::GuardRejected {
                    entity: "round",
                    id: task_id.to_string(),
                    event: "submit_report".to_string(),
                    guard: "expected_validator".to_string(),
                    reason: format!(
                        "validator '{}' is not expected in round {} ([{}])",
                        report.validator,
                        manifest.round,
                        join(&manifest.expected)
                    ),
                });
            }
            let report_path = layout.report_path(task_id, report.round, &report.validator);
            if report_path.exists() {
                return Err(CoordError::DuplicateReport {
                    task: task_id.to_string(),
                    round: report.round,
                    validator: report.validator.clone(),
                });
            }
            record::write_json(&report_path, report)?;
            Ok(manifest)
        })();
        handle.release();
        let manifest = result?;

        // Once the last expected report lands, the brief moves to done.
        // Best-effort: the report is durable either way, and promotion
        // finishes a brief left in wip itself, so a transient failure here
        // must not surface as an error the validator would retry into
        // `DuplicateReport`.
        let reported = self.reported_validators(task_id, report.round)?;
        if manifest.is_complete(&reported) {
            if let Err(err) = self.fire_brief(
                task_id,
                &report.validator,
                QaEvent::Finish,
                &QaFacts::default(),
                "all expected reports filed",
            ) {
                warn!(task = task_id, round = report.round, %err, "brief auto-finish failed");
            }
        }
        Ok(())
    }

    /// Mark validation blocked (operator or validator escalation).
    pub fn block(&self, task_id: &str, actor: &str, note: &str) -> CoordResult<QaBrief> {
        let (brief, _) =
            self.fire_brief(task_id, actor, QaEvent::Block, &QaFacts::default(), note)?;
        Ok(brief)
    }

    /// Return a blocked brief to `todo` so a fresh round can open.
    pub fn retry(&self, task_id: &str, actor: &str) -> CoordResult<QaBrief> {
        let (brief, _) = self.fire_brief(
            task_id,
            actor,
            QaEvent::Retry,
            &QaFacts::default(),
            "validation unblocked",
        )?;
        Ok(brief)
    }

    /// Evidence backing one cluster member: latest manifest and its reports.
    ///
    /// The round is read under its manifest lock so aggregation never sees a
    /// half-submitted round; with `lock.fail_open_reads` the read proceeds
    /// lockless after the timeout instead of failing.
    pub fn member_evidence(&self, task_id: &str) -> CoordResult<MemberEvidence> {
        let layout = self.ctx.layout();
        let round = record::read_json::<QaBrief>(&layout.brief_path(task_id))?
            .map_or(0, |brief| brief.round);
        if round == 0 {
            return Ok(MemberEvidence {
                task_id: task_id.to_string(),
                manifest: None,
                reports: Vec::new(),
            });
        }

        let manifest_path = layout.round_manifest_path(task_id, round);
        let settings = self.ctx.lock_settings();
        let mut guard = if self.ctx.config().lock.fail_open_reads {
            lock::acquire_fail_open(&manifest_path, settings)?
        } else {
            Some(lock::acquire(&manifest_path, settings)?)
        };
        let result = (|| {
            let manifest = record::read_json(&manifest_path)?;
            let mut reports = Vec::new();
            for path in layout.report_paths(task_id, round)? {
                if let Some(report) = record::read_json::<ValidatorReport>(&path)? {
                    reports.push(report);
                }
            }
            Ok(MemberEvidence {
                task_id: task_id.to_string(),
                manifest,
                reports,
            })
        })();
        if let Some(handle) = guard.as_mut() {
            handle.release();
        }
        result
    }

    /// Aggregate the scope's latest rounds into a bundle and cache it.
    pub fn compute_bundle(
        &self,
        task_id: &str,
        scope: BundleScope,
        tasks: &TaskRegistry<'_>,
    ) -> CoordResult<Bundle> {
        self.compute(task_id, scope, tasks, true)
    }

    /// Promote a task from its bundle verdict.
    ///
    /// Approve validates the task and closes the round; reject returns the
    /// brief to `todo`, closes the round, and optionally creates follow-up
    /// tasks; an incomplete bundle is refused without mutating anything.
    /// Promoting an already-validated task is a no-op.
    #[instrument(skip(self, opts, tasks), fields(scope = %opts.scope))]
    pub fn promote(
        &self,
        task_id: &str,
        opts: &PromoteOptions,
        tasks: &TaskRegistry<'_>,
    ) -> CoordResult<PromotionOutcome> {
        let task = tasks.get(task_id)?;
        if task.is_terminal() {
            debug!(task = task_id, "already validated; promotion is a no-op");
            let bundle = self.compute(task_id, opts.scope, tasks, false)?;
            return Ok(PromotionOutcome::Promoted { task, bundle });
        }

        let bundle = self.compute(task_id, opts.scope, tasks, true)?;
        match bundle.verdict {
            Verdict::Approve => {
                // Brief first: if it cannot accept the approval (an
                // operator hold, say) the task stays untouched. The reverse
                // order strands a validated task behind a stuck brief. A
                // brief still in wip means the submit-side auto-finish was
                // missed; catch up before approving.
                if self.brief(task_id)?.status == QaStatus::Wip {
                    self.fire_brief(
                        task_id,
                        &opts.actor,
                        QaEvent::Finish,
                        &QaFacts::default(),
                        "all expected reports filed",
                    )?;
                }
                let (_, actions) = self.fire_brief(
                    task_id,
                    &opts.actor,
                    QaEvent::Approve,
                    &QaFacts {
                        round_approved: true,
                    },
                    format!("bundle approved ({} scope)", opts.scope),
                )?;
                let task = tasks.transition(task_id, TaskEvent::Validate, true)?;
                self.run_actions(task_id, bundle.round, &actions);
                Ok(PromotionOutcome::Promoted { task, bundle })
            }
            Verdict::Reject => {
                let (_, actions) = self.fire_brief(
                    task_id,
                    &opts.actor,
                    QaEvent::Reject,
                    &QaFacts::default(),
                    format!("bundle rejected ({} scope)", opts.scope),
                )?;
                self.run_actions(task_id, bundle.round, &actions);
                let follow_ups = if opts.create_follow_ups {
                    self.create_follow_ups(task_id, bundle.round, tasks)?
                } else {
                    Vec::new()
                };
                Ok(PromotionOutcome::Rejected { bundle, follow_ups })
            }
            Verdict::Blocked => Err(CoordError::PromotionDenied {
                task: task_id.to_string(),
                reason: "bundle evidence is incomplete".to_string(),
                missing: bundle.missing(),
            }),
        }
    }

    fn compute(
        &self,
        task_id: &str,
        scope: BundleScope,
        tasks: &TaskRegistry<'_>,
        cache: bool,
    ) -> CoordResult<Bundle> {
        tasks.get(task_id)?;
        let member_ids = match scope {
            BundleScope::SelfOnly => vec![task_id.to_string()],
            BundleScope::Hierarchy => graph::hierarchy(&tasks.index()?, task_id),
            BundleScope::Bundle => graph::link_cluster(&tasks.index()?, task_id),
        };
        let mut members = Vec::with_capacity(member_ids.len());
        for member_id in &member_ids {
            members.push(self.member_evidence(member_id)?);
        }
        let bundle = bundle::aggregate(scope, task_id, &members);

        // The cached summary is a derived view; losing the write is fine.
        if cache && bundle.round > 0 {
            let path = self.ctx.layout().bundle_summary_path(task_id, bundle.round);
            if let Err(err) = record::write_json(&path, &bundle) {
                warn!(task = task_id, round = bundle.round, %err, "bundle cache write failed");
            }
        }
        Ok(bundle)
    }

    fn reported_validators(
        &self,
        task_id: &str,
        round: u32,
    ) -> CoordResult<std::collections::BTreeSet<String>> {
        let mut reported = std::collections::BTreeSet::new();
        for path in self.ctx.layout().report_paths(task_id, round)? {
            if let Some(report) = record::read_json::<ValidatorReport>(&path)? {
                reported.insert(report.validator);
            }
        }
        Ok(reported)
    }

    /// Fire a brief event under the brief lock, recording history. An event
    /// whose target state already holds is a silent no-op.
    fn fire_brief(
        &self,
        task_id: &str,
        actor: &str,
        event: QaEvent,
        facts: &QaFacts,
        note: impl Into<String>,
    ) -> CoordResult<(QaBrief, Vec<QaAction>)> {
        let machine = qa_machine();
        let note = note.into();
        let actor = actor.to_string();
        record::update_atomic(
            "qa-brief",
            task_id,
            &self.ctx.layout().brief_path(task_id),
            self.ctx.lock_settings(),
            |brief: &mut QaBrief| {
                let mut actions = Vec::new();
                match machine.fire(task_id, brief.status, event, facts)? {
                    Fired::Moved { from, to, actions: fired } => {
                        brief.record(&actor, from, to, note.clone());
                        actions = fired.to_vec();
                    }
                    Fired::AlreadyThere(state) => {
                        debug!(task = task_id, %state, %event, "brief event already satisfied");
                    }
                }
                Ok((brief.clone(), actions))
            },
        )
    }

    /// Post-transition brief actions; failures are reported, never rolled
    /// back.
    fn run_actions(&self, task_id: &str, round: u32, actions: &[QaAction]) {
        for action in actions {
            match action {
                QaAction::CloseRound => {
                    if round == 0 {
                        continue;
                    }
                    let path = self.ctx.layout().round_manifest_path(task_id, round);
                    let result = record::update_atomic(
                        "round",
                        task_id,
                        &path,
                        self.ctx.lock_settings(),
                        |manifest: &mut RoundManifest| {
                            if manifest.closed_at.is_none() {
                                manifest.closed_at = Some(Utc::now());
                            }
                            Ok(())
                        },
                    );
                    if let Err(err) = result {
                        warn!(task = task_id, round, %err, "failed to close round manifest");
                    }
                }
            }
        }
    }

    /// Create tasks from reviewer follow-up suggestions in the rejected
    /// round, as children of the rejected task in the next wave. Already
    /// existing ids are skipped.
    fn create_follow_ups(
        &self,
        task_id: &str,
        round: u32,
        tasks: &TaskRegistry<'_>,
    ) -> CoordResult<Vec<String>> {
        if round == 0 {
            return Ok(Vec::new());
        }
        let parent = tasks.get(task_id)?;
        let mut created = Vec::new();
        for path in self.ctx.layout().report_paths(task_id, round)? {
            let Some(report) = record::read_json::<ValidatorReport>(&path)? else {
                continue;
            };
            for follow_up in &report.follow_ups {
                let spec = NewTask {
                    id: follow_up.id.clone(),
                    wave: parent.wave + 1,
                    kind: parent.kind,
                    parent: Some(task_id.to_string()),
                };
                match tasks.create(&spec) {
                    Ok(_) => {
                        debug!(task = %follow_up.id, from = %report.validator, title = %follow_up.title, "follow-up task created");
                        created.push(follow_up.id.clone());
                    }
                    Err(err) => {
                        debug!(task = %follow_up.id, %err, "follow-up task skipped");
                    }
                }
            }
        }
        Ok(created)
    }
}

fn join(ids: &std::collections::BTreeSet<String>) -> String {
    ids.iter().cloned().collect::<Vec<_>>().join(", ")
}
