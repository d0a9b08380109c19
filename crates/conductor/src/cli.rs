//! CLI surface: subcommands, flags, and the risk-acknowledgment ritual
//!
//! Thin dispatch layer over the orchestrator and worker. Presentation is
//! deliberately plain; exit codes are the contract (0 success, 1
//! unrecoverable failure, 2 failed risk acknowledgment).

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;

use harness::events::tracing_sink;
use harness::{SessionStore, WorkflowState, WorkflowStatus, DEFAULT_QUEUE_CAPACITY};

use crate::autonomous::{AutonomousWorker, HttpEventSource, SignalDirSource, WorkSource};
use crate::autonomous::worker::{ConfirmFn, WorkerConfig};
use crate::config::EngineConfig;
use crate::orchestrator::{ApprovalVerdict, Orchestrator, RunOptions, RunOutcome};
use crate::provider::OpenAiCompatProvider;
use crate::workflows::WorkflowType;

/// Exact phrase required by the interactive risk acknowledgment.
const RISK_PHRASE: &str = "I understand the risks";

/// Attempts allowed to type the phrase.
const RISK_ATTEMPTS: u32 = 3;

#[derive(Parser)]
#[command(
    name = "conductor",
    version,
    about = "Autonomous multi-phase workflow engine driving LLM agent pipelines"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Whether any subcommand requested verbose logging.
    pub fn verbose(&self) -> bool {
        match &self.command {
            Command::NewFeature { run, .. }
            | Command::BugFix { run, .. }
            | Command::Refactor { run, .. } => run.verbose,
            _ => false,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Run the new-feature workflow for a description
    NewFeature {
        description: String,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Run the bug-fix workflow for a description
    BugFix {
        description: String,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Run the refactor workflow for a description
    Refactor {
        description: String,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Show the most recent session (or all with --all)
    Status {
        #[arg(long)]
        all: bool,
    },
    /// Resume a suspended or interrupted session
    Resume {
        /// Session id (prefix accepted); defaults to the latest resumable
        session_id: Option<String>,
        /// Approve the pending gate non-interactively
        #[arg(long, conflicts_with = "reject")]
        approve: bool,
        /// Reject the pending gate non-interactively
        #[arg(long)]
        reject: bool,
        /// Feedback text carried into the next phase
        #[arg(long)]
        feedback: Option<String>,
    },
    /// Inspect and maintain persisted sessions
    Sessions {
        #[command(subcommand)]
        command: SessionsCommand,
    },
    /// Control the autonomous worker
    Worker {
        #[command(subcommand)]
        command: WorkerCommand,
    },
}

#[derive(Subcommand)]
enum SessionsCommand {
    /// List all persisted sessions
    List,
    /// Remove old terminal sessions
    Cleanup {
        #[arg(long, default_value_t = 7)]
        days: i64,
        #[arg(long)]
        include_failed: bool,
    },
}

#[derive(Subcommand)]
enum WorkerCommand {
    /// Start the autonomous worker loop (single instance)
    Start,
    /// Signal a running worker to stop at its next tick
    Stop,
    /// Show worker state and queue snapshot
    Status,
}

#[derive(Args, Clone)]
struct RunArgs {
    /// Cost ceiling in USD, or `unlimited`
    #[arg(long, default_value = "unlimited")]
    budget: String,
    /// Model id override
    #[arg(long)]
    model: Option<String>,
    /// Skip approval gates
    #[arg(long)]
    no_approval: bool,
    /// Fully unattended execution; requires risk acknowledgment
    #[arg(long)]
    dangerously_autonomous: bool,
    /// Wall-clock ceiling in minutes, checked between phases
    #[arg(long)]
    max_duration: Option<u64>,
    /// Run against an isolated sandbox clone (default)
    #[arg(long, overrides_with = "no_sandbox")]
    sandbox: bool,
    /// Run directly against the working tree
    #[arg(long)]
    no_sandbox: bool,
    /// Disable stall detection
    #[arg(long)]
    no_stall_detection: bool,
    /// Disable phase retries
    #[arg(long)]
    no_retry: bool,
    /// Disable checkpoint tags
    #[arg(long)]
    no_checkpoints: bool,
    #[arg(long, short)]
    verbose: bool,
}

impl RunArgs {
    fn budget_usd(&self) -> Result<Option<f64>> {
        if self.budget.eq_ignore_ascii_case("unlimited") {
            return Ok(None);
        }
        let amount: f64 = self
            .budget
            .parse()
            .with_context(|| format!("invalid --budget value `{}`", self.budget))?;
        Ok(Some(amount))
    }

    fn options(&self, config: &EngineConfig) -> Result<RunOptions> {
        Ok(RunOptions {
            budget_usd: self.budget_usd()?,
            approvals_enabled: !(self.no_approval || self.dangerously_autonomous),
            // Sandbox unless explicitly pointed at the real tree
            sandbox: self.sandbox || !self.no_sandbox,
            stall_detection: !self.no_stall_detection,
            retries_enabled: !self.no_retry,
            max_phase_retries: 1,
            checkpoints: !self.no_checkpoints,
            max_duration: self.max_duration.map(|m| Duration::from_secs(m * 60)),
            max_turns: config.max_turns,
            context_limit_tokens: config.context_limit_tokens,
            shell_timeout: Duration::from_secs(config.shell_timeout_secs),
        })
    }
}

/// Execute the parsed CLI. Returns the process exit code.
pub async fn run(cli: Cli) -> Result<i32> {
    let project_root = std::env::current_dir()?;

    match cli.command {
        Command::NewFeature { description, run } => {
            run_workflow(WorkflowType::NewFeature, &description, &run, &project_root).await
        }
        Command::BugFix { description, run } => {
            run_workflow(WorkflowType::BugFix, &description, &run, &project_root).await
        }
        Command::Refactor { description, run } => {
            run_workflow(WorkflowType::Refactor, &description, &run, &project_root).await
        }
        Command::Status { all } => status(&project_root, all),
        Command::Resume {
            session_id,
            approve,
            reject,
            feedback,
        } => resume(&project_root, session_id, approve, reject, feedback).await,
        Command::Sessions { command } => sessions(&project_root, command),
        Command::Worker { command } => worker(&project_root, command).await,
    }
}

fn build_orchestrator(
    project_root: &PathBuf,
    config: &EngineConfig,
    model_override: Option<&str>,
    options: RunOptions,
) -> Result<Orchestrator> {
    let store = SessionStore::open(project_root)?;
    let model = model_override.unwrap_or(&config.model);
    let provider = Arc::new(OpenAiCompatProvider::new(
        &config.model_url,
        model,
        config.api_key.clone(),
    ));
    Ok(Orchestrator::new(
        provider,
        store,
        project_root.clone(),
        options,
        tracing_sink(),
    ))
}

async fn run_workflow(
    workflow_type: WorkflowType,
    description: &str,
    args: &RunArgs,
    project_root: &PathBuf,
) -> Result<i32> {
    if args.dangerously_autonomous && !acknowledge_risk()? {
        eprintln!("risk acknowledgment failed; refusing to run unattended");
        return Ok(2);
    }

    let config = EngineConfig::load(project_root)?;
    let options = args.options(&config)?;
    let orchestrator =
        build_orchestrator(project_root, &config, args.model.as_deref(), options)?;

    info!(workflow = %workflow_type, "starting run");
    let outcome = orchestrator.run(workflow_type, description).await?;
    Ok(report_outcome(&outcome))
}

fn report_outcome(outcome: &RunOutcome) -> i32 {
    let state = outcome.state();
    match outcome {
        RunOutcome::Completed(_) => {
            println!(
                "completed session {} | {} phases | ${:.2} | {} turns",
                state.short_id(),
                state.phase_results.len(),
                state.total_cost_usd,
                state.total_turns
            );
            0
        }
        RunOutcome::AwaitingApproval(_) => {
            let gated = state.current_phase_index.saturating_sub(1);
            println!(
                "session {} is awaiting approval after phase {} (${:.2} spent)",
                state.short_id(),
                gated,
                state.total_cost_usd
            );
            println!(
                "run `conductor resume {} --approve` or `--reject` to continue",
                state.short_id()
            );
            0
        }
        RunOutcome::Cancelled(_) => {
            println!(
                "session {} cancelled (${:.2} spent)",
                state.short_id(),
                state.total_cost_usd
            );
            0
        }
        RunOutcome::Failed(_) => {
            let detail = state
                .error
                .as_ref()
                .map(|f| format!("{}: {}", f.phase, f.error))
                .unwrap_or_else(|| "unknown failure".to_string());
            eprintln!(
                "session {} failed at {detail} (${:.2} spent)",
                state.short_id(),
                state.total_cost_usd
            );
            1
        }
    }
}

fn status(project_root: &PathBuf, all: bool) -> Result<i32> {
    let store = SessionStore::open(project_root)?;
    let sessions = store.list()?;
    if sessions.is_empty() {
        println!("no sessions");
        return Ok(0);
    }
    let shown: Vec<&WorkflowState> = if all {
        sessions.iter().collect()
    } else {
        sessions.iter().take(1).collect()
    };
    for state in shown {
        print_session_line(state);
    }
    Ok(0)
}

fn print_session_line(state: &WorkflowState) {
    println!(
        "{}  {:18} {:18} phase {:>2}  ${:<8.2} {}",
        state.short_id(),
        state.workflow_type,
        state.status.to_string(),
        state.current_phase_index,
        state.total_cost_usd,
        state.description.chars().take(60).collect::<String>()
    );
}

async fn resume(
    project_root: &PathBuf,
    session_id: Option<String>,
    approve: bool,
    reject: bool,
    feedback: Option<String>,
) -> Result<i32> {
    let config = EngineConfig::load(project_root)?;
    let store = SessionStore::open(project_root)?;

    let state = match &session_id {
        Some(prefix) => store.find(prefix)?,
        None => store
            .latest_resumable()?
            .context("no resumable session found")?,
    };

    let verdict = if state.status == WorkflowStatus::AwaitingApproval {
        let approved = if approve {
            true
        } else if reject {
            false
        } else {
            prompt_approval(&state)?
        };
        Some(ApprovalVerdict { approved, feedback })
    } else {
        None
    };

    let orchestrator = build_orchestrator(
        project_root,
        &config,
        None,
        RunOptions {
            max_turns: config.max_turns,
            context_limit_tokens: config.context_limit_tokens,
            shell_timeout: Duration::from_secs(config.shell_timeout_secs),
            ..Default::default()
        },
    )?;

    let outcome = orchestrator.resume(&state.session_id, verdict).await?;
    Ok(report_outcome(&outcome))
}

/// Interactive approval prompt for `resume` without a flag.
fn prompt_approval(state: &WorkflowState) -> Result<bool> {
    let gated = state.current_phase_index.saturating_sub(1);
    println!(
        "session {} is awaiting approval after phase {gated} ({})",
        state.short_id(),
        state.workflow_type
    );
    if let Some((agent, result)) = state.phase_results.iter().last() {
        println!("latest result from {agent}:\n{}", result.output.as_text());
    }
    print!("approve and continue? [y/N] ");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(matches!(line.trim(), "y" | "Y" | "yes"))
}

fn sessions(project_root: &PathBuf, command: SessionsCommand) -> Result<i32> {
    let store = SessionStore::open(project_root)?;
    match command {
        SessionsCommand::List => {
            let sessions = store.list()?;
            if sessions.is_empty() {
                println!("no sessions");
            }
            for state in &sessions {
                print_session_line(state);
            }
            Ok(0)
        }
        SessionsCommand::Cleanup {
            days,
            include_failed,
        } => {
            let removed = store.cleanup(days, include_failed)?;
            println!("removed {removed} session(s)");
            Ok(0)
        }
    }
}

async fn worker(project_root: &PathBuf, command: WorkerCommand) -> Result<i32> {
    let store = SessionStore::open(project_root)?;
    match command {
        WorkerCommand::Start => {
            let unattended = unattended_signals_present();
            if !acknowledge_risk()? {
                eprintln!("risk acknowledgment failed; refusing to start worker");
                return Ok(2);
            }
            let config = EngineConfig::load(project_root)?;

            let mut sources: Vec<Box<dyn WorkSource>> =
                vec![Box::new(SignalDirSource::new(store.signals_dir()))];
            if let Some(url) = &config.worker.http_source_url {
                sources.push(Box::new(HttpEventSource::new(url.clone())));
            }

            // Attended workers can ask; unattended ones escalate instead.
            let confirm: Option<ConfirmFn> = if unattended {
                None
            } else {
                Some(Arc::new(|item: &harness::DiscoveredWork| {
                    print!(
                        "execute `{}` ({}, tier {})? [y/N] ",
                        item.summary, item.priority, item.tier
                    );
                    let _ = std::io::stdout().flush();
                    let mut line = String::new();
                    let _ = std::io::stdin().lock().read_line(&mut line);
                    matches!(line.trim(), "y" | "Y" | "yes")
                }))
            };

            let worker_config = WorkerConfig {
                poll_interval: Duration::from_secs(config.worker.poll_interval_secs),
                per_item_budget_usd: config.worker.per_item_budget_usd,
                total_budget_usd: config.worker.total_budget_usd,
                queue_capacity: DEFAULT_QUEUE_CAPACITY,
                policy: Default::default(),
                confirm,
            };
            let orchestrator = build_orchestrator(
                project_root,
                &config,
                None,
                RunOptions {
                    approvals_enabled: false,
                    max_turns: config.max_turns,
                    context_limit_tokens: config.context_limit_tokens,
                    shell_timeout: Duration::from_secs(config.shell_timeout_secs),
                    ..Default::default()
                },
            )?;

            let worker =
                AutonomousWorker::new(store, orchestrator, sources, worker_config);
            let report = worker.run().await?;
            println!(
                "worker stopped | discovered {} | completed {} | escalated {} | deferred {} | failed {} | ${:.2} spent",
                report.items_discovered,
                report.items_completed,
                report.items_escalated,
                report.items_deferred,
                report.items_failed,
                report.total_spent_usd
            );
            println!("audit log: {}", report.audit_log.display());
            Ok(0)
        }
        WorkerCommand::Stop => {
            store.request_stop()?;
            println!("stop requested; the worker exits at its next tick");
            Ok(0)
        }
        WorkerCommand::Status => {
            match store.read_worker_status()? {
                None => println!("no worker status recorded"),
                Some(status) => {
                    println!(
                        "worker {:?} | updated {} | completed {} | escalated {} | failed {} | ${:.2} spent",
                        status.state,
                        status.updated_at,
                        status.items_completed,
                        status.items_escalated,
                        status.items_failed,
                        status.total_spent_usd
                    );
                    for item in &status.queue {
                        println!(
                            "  [{}] {} {:?} tier {} - {}",
                            item.priority, item.id, item.status, item.tier, item.summary
                        );
                    }
                }
            }
            Ok(0)
        }
    }
}

/// Both environment signals required for unattended autonomous execution.
fn unattended_signals_present() -> bool {
    std::env::var("CONDUCTOR_AUTONOMOUS").map(|v| v == "1").unwrap_or(false)
        && std::env::var("CONDUCTOR_I_ACCEPT_THE_RISK")
            .map(|v| v == "yes")
            .unwrap_or(false)
}

/// Risk acknowledgment: both env signals, or the interactive ritual of a
/// countdown followed by typing the exact phrase within a bounded number
/// of attempts.
fn acknowledge_risk() -> Result<bool> {
    if unattended_signals_present() {
        info!("risk acknowledged via environment signals");
        return Ok(true);
    }

    println!("Autonomous execution lets an LLM agent modify files and run commands");
    println!("in this project without per-step human review.");
    print!("Starting in");
    for i in (1..=5).rev() {
        print!(" {i}...");
        std::io::stdout().flush()?;
        std::thread::sleep(Duration::from_secs(1));
    }
    println!();

    let stdin = std::io::stdin();
    for attempt in 1..=RISK_ATTEMPTS {
        print!("Type exactly `{RISK_PHRASE}` to continue ({attempt}/{RISK_ATTEMPTS}): ");
        std::io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            // EOF: non-interactive invocation without the env signals
            return Ok(false);
        }
        if line.trim() == RISK_PHRASE {
            return Ok(true);
        }
    }
    Ok(false)
}
