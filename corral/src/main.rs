//! Thin CLI over the coordination library.
//!
//! Every command prints its result record as pretty JSON on stdout so agent
//! harnesses can drive coordination from shell scripts. Diagnostics go to
//! stderr via `RUST_LOG`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;

use corral::coordinator::{CoordContext, Coordinator};
use corral::core::bundle::BundleScope;
use corral::core::report::{Verdict, ValidatorReport};
use corral::core::session::SessionMode;
use corral::core::task::{TaskEvent, TaskKind};
use corral::evidence::{ImplementationReport, PromoteOptions, PromotionOutcome};
use corral::io::config::{CoordConfig, write_config};
use corral::io::workspace::GitWorktreeProvider;
use corral::sessions::CloseOptions;
use corral::tasks::{ClaimOptions, NewTask};

#[derive(Parser)]
#[command(name = "corral", version, about = "Filesystem-backed coordination for autonomous agents")]
struct Cli {
    /// Coordination root directory.
    #[arg(long, default_value = ".corral", global = true)]
    root: PathBuf,

    /// Repository the workspace worktrees are created from.
    #[arg(long, default_value = ".", global = true)]
    repo: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default corral.toml and create the record directories.
    Init,
    #[command(subcommand)]
    Task(TaskCommand),
    #[command(subcommand)]
    Session(SessionCommand),
    #[command(subcommand)]
    Evidence(EvidenceCommand),
    /// Release claims held by sessions with stale heartbeats.
    Recover {
        /// Heartbeat age threshold in seconds (default from config).
        #[arg(long)]
        max_age_secs: Option<u64>,
    },
    /// Reconcile task owners against session claim sets.
    Repair,
    /// Remove lock files older than the staleness threshold.
    ClearLocks {
        #[arg(long)]
        max_age_secs: Option<u64>,
    },
}

#[derive(Subcommand)]
enum TaskCommand {
    Create {
        id: String,
        #[arg(long, default_value_t = 0)]
        wave: u32,
        #[arg(long, value_enum, default_value_t = KindArg::Feature)]
        kind: KindArg,
        #[arg(long)]
        parent: Option<String>,
    },
    Show {
        id: String,
    },
    /// Unclaimed todo tasks whose dependencies are satisfied.
    Ready,
    Claim {
        id: String,
        #[arg(long)]
        session: String,
        /// Take over from the current (possibly stale) owner.
        #[arg(long)]
        reclaim: bool,
        /// Bypass claim guards entirely.
        #[arg(long)]
        force: bool,
    },
    Release {
        id: String,
        #[arg(long)]
        session: String,
    },
    /// Fire a lifecycle event (start, complete, block, recover).
    Fire {
        id: String,
        #[arg(value_enum)]
        event: EventArg,
    },
    /// Make one task a child of another.
    LinkChild {
        parent: String,
        child: String,
    },
    /// Record a symmetric cluster link between two tasks.
    LinkCluster {
        a: String,
        b: String,
    },
}

#[derive(Subcommand)]
enum SessionCommand {
    Create {
        id: String,
        #[arg(long, default_value = "operator")]
        owner: String,
        #[arg(long, value_enum, default_value_t = ModeArg::Autonomous)]
        mode: ModeArg,
        /// Materialize a git worktree workspace for the session.
        #[arg(long)]
        workspace: bool,
    },
    Show {
        id: String,
    },
    Heartbeat {
        id: String,
    },
    /// Retry or re-materialize the session workspace.
    Resume {
        id: String,
    },
    Close {
        id: String,
        #[arg(long)]
        archive: bool,
        /// Drop held claims instead of refusing to close.
        #[arg(long)]
        force_release: bool,
    },
}

#[derive(Subcommand)]
enum EvidenceCommand {
    /// File the implementation report for a task.
    Implementation {
        task: String,
        #[arg(long)]
        session: String,
        #[arg(long)]
        summary: String,
        /// Changed file paths (repeatable).
        #[arg(long = "file")]
        files: Vec<String>,
    },
    /// Open the next validation round.
    StartRound {
        task: String,
        #[arg(long, default_value = "operator")]
        actor: String,
        /// Override the changed file set (defaults to the implementation
        /// report's).
        #[arg(long = "file")]
        files: Vec<String>,
    },
    /// Submit one validator report for the current round.
    Report {
        task: String,
        #[arg(long)]
        round: u32,
        #[arg(long)]
        validator: String,
        #[arg(long)]
        reviewer: String,
        #[arg(long, value_enum)]
        verdict: VerdictArg,
    },
    /// Mark validation blocked.
    Block {
        task: String,
        #[arg(long, default_value = "operator")]
        actor: String,
        #[arg(long)]
        note: String,
    },
    /// Return a blocked brief to todo.
    Retry {
        task: String,
        #[arg(long, default_value = "operator")]
        actor: String,
    },
    /// Aggregate the latest rounds into a bundle verdict.
    Bundle {
        task: String,
        #[arg(long, value_enum, default_value_t = ScopeArg::SelfOnly)]
        scope: ScopeArg,
    },
    /// Promote a task from its bundle verdict.
    Promote {
        task: String,
        #[arg(long, value_enum, default_value_t = ScopeArg::SelfOnly)]
        scope: ScopeArg,
        /// Create follow-up tasks from reviewer suggestions on reject.
        #[arg(long)]
        follow_ups: bool,
        #[arg(long, default_value = "operator")]
        actor: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Feature,
    Bug,
    Chore,
}

impl From<KindArg> for TaskKind {
    fn from(value: KindArg) -> Self {
        match value {
            KindArg::Feature => TaskKind::Feature,
            KindArg::Bug => TaskKind::Bug,
            KindArg::Chore => TaskKind::Chore,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum EventArg {
    Start,
    Complete,
    Block,
    Recover,
}

impl From<EventArg> for TaskEvent {
    fn from(value: EventArg) -> Self {
        match value {
            EventArg::Start => TaskEvent::Start,
            EventArg::Complete => TaskEvent::Complete,
            EventArg::Block => TaskEvent::Block,
            EventArg::Recover => TaskEvent::Recover,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Interactive,
    Autonomous,
}

impl From<ModeArg> for SessionMode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Interactive => SessionMode::Interactive,
            ModeArg::Autonomous => SessionMode::Autonomous,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ScopeArg {
    #[value(name = "self")]
    SelfOnly,
    Hierarchy,
    Bundle,
}

impl From<ScopeArg> for BundleScope {
    fn from(value: ScopeArg) -> Self {
        match value {
            ScopeArg::SelfOnly => BundleScope::SelfOnly,
            ScopeArg::Hierarchy => BundleScope::Hierarchy,
            ScopeArg::Bundle => BundleScope::Bundle,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum VerdictArg {
    Approve,
    Reject,
    Blocked,
}

impl From<VerdictArg> for Verdict {
    fn from(value: VerdictArg) -> Self {
        match value {
            VerdictArg::Approve => Verdict::Approve,
            VerdictArg::Reject => Verdict::Reject,
            VerdictArg::Blocked => Verdict::Blocked,
        }
    }
}

fn emit<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<()> {
    corral::logging::init();
    let cli = Cli::parse();

    if let Command::Init = cli.command {
        let config = CoordConfig::default();
        write_config(&cli.root.join("corral.toml"), &config)?;
        let ctx = CoordContext::with_config(&cli.root, config)?;
        println!("initialized {}", ctx.layout().root().display());
        return Ok(());
    }

    let ctx = CoordContext::open(&cli.root)?;
    let worktrees = cli.root.join("worktrees");
    let coordinator = Coordinator::new(ctx, GitWorktreeProvider::new(&cli.repo, worktrees));

    match cli.command {
        Command::Init => unreachable!("handled above"),
        Command::Task(cmd) => run_task(&coordinator, cmd),
        Command::Session(cmd) => run_session(&coordinator, cmd),
        Command::Evidence(cmd) => run_evidence(&coordinator, cmd),
        Command::Recover { max_age_secs } => {
            let reclaimed =
                coordinator.recover_timed_out_claims(max_age_secs.map(Duration::from_secs))?;
            emit(&reclaimed)
        }
        Command::Repair => {
            let report = coordinator.repair()?;
            emit(&report)
        }
        Command::ClearLocks { max_age_secs } => {
            let cleared = coordinator.clear_stale_locks(max_age_secs.map(Duration::from_secs))?;
            emit(&cleared)
        }
    }
}

fn run_task(coordinator: &Coordinator<GitWorktreeProvider>, cmd: TaskCommand) -> Result<()> {
    match cmd {
        TaskCommand::Create {
            id,
            wave,
            kind,
            parent,
        } => {
            let task = coordinator.create_task(&NewTask {
                id,
                wave,
                kind: kind.into(),
                parent,
            })?;
            emit(&task)
        }
        TaskCommand::Show { id } => emit(&coordinator.get_task(&id)?),
        TaskCommand::Ready => emit(&coordinator.ready_tasks()?),
        TaskCommand::Claim {
            id,
            session,
            reclaim,
            force,
        } => {
            // Ride out transient lock contention with other agents.
            let retry_cfg = coordinator.context().config().retry.clone();
            let task = corral::retry::with_backoff(&retry_cfg, || {
                coordinator.claim_task(&id, &session, ClaimOptions { reclaim, force })
            })?;
            emit(&task)
        }
        TaskCommand::Release { id, session } => emit(&coordinator.release_task(&id, &session)?),
        TaskCommand::Fire { id, event } => {
            emit(&coordinator.transition_task(&id, event.into())?)
        }
        TaskCommand::LinkChild { parent, child } => {
            coordinator.link_child(&parent, &child)?;
            emit(&coordinator.get_task(&child)?)
        }
        TaskCommand::LinkCluster { a, b } => {
            coordinator.link_cluster(&a, &b)?;
            emit(&coordinator.get_task(&a)?)
        }
    }
}

fn run_session(coordinator: &Coordinator<GitWorktreeProvider>, cmd: SessionCommand) -> Result<()> {
    match cmd {
        SessionCommand::Create {
            id,
            owner,
            mode,
            workspace,
        } => emit(&coordinator.create_session(&id, &owner, mode.into(), workspace)?),
        SessionCommand::Show { id } => emit(&coordinator.get_session(&id)?),
        SessionCommand::Heartbeat { id } => emit(&coordinator.heartbeat(&id)?),
        SessionCommand::Resume { id } => emit(&coordinator.resume_workspace(&id)?),
        SessionCommand::Close {
            id,
            archive,
            force_release,
        } => emit(&coordinator.close_session(
            &id,
            CloseOptions {
                archive_workspace: archive,
                force_release,
            },
        )?),
    }
}

fn run_evidence(
    coordinator: &Coordinator<GitWorktreeProvider>,
    cmd: EvidenceCommand,
) -> Result<()> {
    match cmd {
        EvidenceCommand::Implementation {
            task,
            session,
            summary,
            files,
        } => {
            let report = ImplementationReport {
                task_id: task.clone(),
                session_id: session,
                summary,
                changed_files: files,
                submitted_at: Utc::now(),
            };
            coordinator.submit_implementation(&report)?;
            emit(&report)
        }
        EvidenceCommand::StartRound { task, actor, files } => {
            let files = if files.is_empty() { None } else { Some(files) };
            emit(&coordinator.start_round(&task, &actor, files.as_deref())?)
        }
        EvidenceCommand::Report {
            task,
            round,
            validator,
            reviewer,
            verdict,
        } => {
            let report = ValidatorReport {
                round,
                validator,
                reviewer,
                verdict: verdict.into(),
                findings: Vec::new(),
                follow_ups: Vec::new(),
                submitted_at: Utc::now(),
            };
            coordinator.submit_report(&task, &report)?;
            emit(&report)
        }
        EvidenceCommand::Block { task, actor, note } => {
            emit(&coordinator.evidence().block(&task, &actor, &note)?)
        }
        EvidenceCommand::Retry { task, actor } => {
            emit(&coordinator.evidence().retry(&task, &actor)?)
        }
        EvidenceCommand::Bundle { task, scope } => {
            emit(&coordinator.compute_bundle(&task, scope.into())?)
        }
        EvidenceCommand::Promote {
            task,
            scope,
            follow_ups,
            actor,
        } => {
            let outcome = coordinator.promote(
                &task,
                &PromoteOptions {
                    scope: scope.into(),
                    create_follow_ups: follow_ups,
                    actor,
                },
            )?;
            match outcome {
                PromotionOutcome::Promoted { task, bundle } => {
                    emit(&serde_json::json!({ "promoted": task, "bundle": bundle }))
                }
                PromotionOutcome::Rejected { bundle, follow_ups } => {
                    emit(&serde_json::json!({ "rejected": bundle, "follow_ups": follow_ups }))
                }
            }
        }
    }
}
