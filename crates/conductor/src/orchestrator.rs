//! Orchestrator: the run state machine
//!
//! Sequences a workflow's declared phases, enforcing the cost budget
//! before each phase, checkpointing, validating results, retrying
//! recoverable failures, suspending at approval gates, and emitting
//! events. All checks happen between phases; an in-flight phase is never
//! interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use harness::events::{EventSink, WorkflowEvent};
use harness::types::{AgentResult, PhaseFailure, WorkflowState, WorkflowStatus};
use harness::{AuditLog, CheckpointManager, GitManager, SandboxManager, SessionStore};

use crate::agent::{AgentRunner, RunnerConfig};
use crate::provider::{CostModel, ModelProvider};
use crate::tools::ToolRegistry;
use crate::workflows::{build_phase_input, definition, WorkflowDefinition, WorkflowType};

/// Per-run options, assembled from CLI flags and config.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Cost ceiling in USD; `None` means unlimited.
    pub budget_usd: Option<f64>,
    /// Suspend at phases marked `approval_required`.
    pub approvals_enabled: bool,
    /// Execute in an isolated clone and copy changes back on success.
    pub sandbox: bool,
    /// Detect and intervene on stalled agents.
    pub stall_detection: bool,
    /// Retry recoverable phase failures.
    pub retries_enabled: bool,
    /// Attempts per phase beyond the first.
    pub max_phase_retries: u32,
    /// Create checkpoint tags before phases.
    pub checkpoints: bool,
    /// Wall-clock ceiling for the whole run, checked between phases.
    pub max_duration: Option<Duration>,
    /// Maximum model turns per phase.
    pub max_turns: u32,
    /// Model context window for compaction.
    pub context_limit_tokens: usize,
    /// Timeout for individual shell tool invocations.
    pub shell_timeout: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            budget_usd: None,
            approvals_enabled: true,
            sandbox: false,
            stall_detection: true,
            retries_enabled: true,
            max_phase_retries: 1,
            checkpoints: true,
            max_duration: None,
            max_turns: 30,
            context_limit_tokens: 128_000,
            shell_timeout: Duration::from_secs(120),
        }
    }
}

/// How a call into the orchestrator ended.
#[derive(Debug)]
pub enum RunOutcome {
    Completed(WorkflowState),
    AwaitingApproval(WorkflowState),
    Failed(WorkflowState),
    Cancelled(WorkflowState),
}

impl RunOutcome {
    pub fn state(&self) -> &WorkflowState {
        match self {
            Self::Completed(s) | Self::AwaitingApproval(s) | Self::Failed(s) | Self::Cancelled(s) => s,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

/// Verdict passed to `resume` for a run awaiting approval.
#[derive(Debug, Clone)]
pub struct ApprovalVerdict {
    pub approved: bool,
    pub feedback: Option<String>,
}

/// Drives workflow runs against one project directory.
pub struct Orchestrator {
    provider: Arc<dyn ModelProvider>,
    cost: CostModel,
    store: SessionStore,
    project_root: PathBuf,
    options: RunOptions,
    events: EventSink,
    audit: Option<AuditLog>,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        store: SessionStore,
        project_root: PathBuf,
        options: RunOptions,
        events: EventSink,
    ) -> Self {
        Self {
            provider,
            cost: CostModel::default(),
            store,
            project_root,
            options,
            events,
            audit: None,
        }
    }

    /// Attach an audit log (autonomous runs).
    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    fn emit(&self, event: WorkflowEvent) {
        if let Some(audit) = &self.audit {
            audit.append(
                event.name(),
                serde_json::to_value(&event).unwrap_or(serde_json::Value::Null),
            );
        }
        (self.events)(&event);
    }

    /// Start a new run and drive it to its first suspension or terminal state.
    pub async fn run(
        &self,
        workflow_type: WorkflowType,
        description: &str,
    ) -> harness::HarnessResult<RunOutcome> {
        self.run_with_budget(workflow_type, description, self.options.budget_usd)
            .await
    }

    /// Start a run under a caller-supplied budget ceiling (the autonomous
    /// worker's per-item budget), overriding the configured one.
    pub async fn run_with_budget(
        &self,
        workflow_type: WorkflowType,
        description: &str,
        budget_usd: Option<f64>,
    ) -> harness::HarnessResult<RunOutcome> {
        let def = definition(workflow_type);
        let mut state = WorkflowState::new(workflow_type.as_str(), description);
        state.transition(WorkflowStatus::Running)?;

        self.emit(WorkflowEvent::RunStarted {
            session_id: state.session_id.clone(),
            workflow_type: workflow_type.to_string(),
            description: description.to_string(),
            timestamp: Utc::now(),
        });

        // Infrastructure work happens before any agent spends money.
        if self.options.sandbox {
            let info = SandboxManager::create(&self.project_root)?;
            state.sandbox = Some(info);
        }
        self.store.save(&state)?;

        self.advance(def, &mut state, None, budget_usd).await
    }

    /// Resume a persisted run: after a restart, or with an approval verdict.
    pub async fn resume(
        &self,
        session_id: &str,
        verdict: Option<ApprovalVerdict>,
    ) -> harness::HarnessResult<RunOutcome> {
        let mut state = self.store.find(session_id)?;
        let workflow_type: WorkflowType = state
            .workflow_type
            .parse()
            .map_err(harness::HarnessError::session)?;
        let def = definition(workflow_type);

        let mut feedback = None;
        match state.status {
            WorkflowStatus::AwaitingApproval => {
                let verdict = verdict.ok_or_else(|| {
                    harness::HarnessError::session("run is awaiting approval; a verdict is required")
                })?;
                self.emit(WorkflowEvent::ApprovalResolved {
                    session_id: state.session_id.clone(),
                    approved: verdict.approved,
                    timestamp: Utc::now(),
                });
                if !verdict.approved {
                    return self.reject(def, state);
                }
                feedback = verdict.feedback;
                state.transition(WorkflowStatus::Running)?;
            }
            WorkflowStatus::Running => {
                // Process died mid-phase; re-run the current phase.
                info!(session = state.short_id(), "resuming interrupted run");
            }
            WorkflowStatus::NotStarted => {
                state.transition(WorkflowStatus::Running)?;
            }
            terminal => {
                return Err(harness::HarnessError::session(format!(
                    "session is already {terminal}"
                )));
            }
        }
        self.store.save(&state)?;

        self.advance(def, &mut state, feedback, self.options.budget_usd)
            .await
    }

    /// Rejection path: optional rollback, then cancellation.
    fn reject(
        &self,
        def: &'static WorkflowDefinition,
        mut state: WorkflowState,
    ) -> harness::HarnessResult<RunOutcome> {
        // The gated phase is the one just before current_phase_index.
        let gated_phase = state.current_phase_index.checked_sub(1);
        if let Some(idx) = gated_phase {
            if let Some(phase) = def.phase(idx) {
                let rollback_allowed = state.sandbox.is_none();
                if let (true, Some(tag)) =
                    (rollback_allowed, state.checkpoints.get(&phase.agent).cloned())
                {
                    let ckpt = CheckpointManager::new(&self.project_root);
                    match ckpt.rollback(&tag) {
                        Ok(()) => self.emit(WorkflowEvent::RolledBack {
                            session_id: state.session_id.clone(),
                            tag,
                            timestamp: Utc::now(),
                        }),
                        Err(e) => warn!(error = %e, "rollback on rejection failed"),
                    }
                }
            }
        }

        // A rejected sandbox run is abandoned wholesale.
        if let Some(sandbox) = &state.sandbox {
            SandboxManager::cleanup(&sandbox.sandbox_dir);
        }

        state.transition(WorkflowStatus::Cancelled)?;
        self.store.save(&state)?;
        self.cleanup_checkpoints(&state);
        self.emit(WorkflowEvent::RunCancelled {
            session_id: state.session_id.clone(),
            timestamp: Utc::now(),
        });
        Ok(RunOutcome::Cancelled(state))
    }

    /// The phase loop. Runs until completion, failure, or an approval gate.
    async fn advance(
        &self,
        def: &'static WorkflowDefinition,
        state: &mut WorkflowState,
        mut feedback: Option<String>,
        budget_usd: Option<f64>,
    ) -> harness::HarnessResult<RunOutcome> {
        let working_dir = state
            .sandbox
            .as_ref()
            .map(|s| s.sandbox_dir.clone())
            .unwrap_or_else(|| self.project_root.clone());
        let tools = ToolRegistry::builtin(&working_dir, self.options.shell_timeout);
        let git = GitManager::new(&working_dir);
        let git_ref = git.is_repository().then_some(&git);
        let checkpoints = CheckpointManager::new(&working_dir);

        while state.current_phase_index < def.len() {
            let phase_index = state.current_phase_index;
            let phase = &def.phases[phase_index];

            // Wall-clock ceiling, checked between phases only.
            if let Some(max) = self.options.max_duration {
                let elapsed = (Utc::now() - state.started_at)
                    .to_std()
                    .unwrap_or_default();
                if elapsed >= max {
                    return self.fail_run(
                        state,
                        PhaseFailure {
                            phase: phase.name.to_string(),
                            error: format!(
                                "run exceeded maximum duration of {}s",
                                max.as_secs()
                            ),
                            recoverable: false,
                        },
                    );
                }
            }

            // Budget check strictly before the phase starts. The upcoming
            // phase is costed at the average of the completed ones, so a
            // run does not enter a phase it cannot afford to finish.
            if let Some(budget) = budget_usd {
                let completed = state.phase_results.len();
                let estimate = if completed > 0 {
                    state.total_cost_usd / completed as f64
                } else {
                    0.0
                };
                if state.total_cost_usd >= budget || state.total_cost_usd + estimate > budget {
                    self.emit(WorkflowEvent::BudgetExceeded {
                        session_id: state.session_id.clone(),
                        total_cost_usd: state.total_cost_usd,
                        budget_usd: budget,
                        timestamp: Utc::now(),
                    });
                    return self.fail_run(
                        state,
                        PhaseFailure {
                            phase: phase.name.to_string(),
                            error: format!(
                                "budget exhausted: ${:.2} spent of ${budget:.2} before phase `{}`",
                                state.total_cost_usd, phase.name
                            ),
                            recoverable: false,
                        },
                    );
                }
            }

            // Checkpoint the pre-phase tree.
            let mut checkpoint_tag = None;
            if self.options.checkpoints {
                if let Some(ckpt) =
                    checkpoints.create(&state.session_id, phase_index, phase.name)?
                {
                    self.emit(WorkflowEvent::CheckpointCreated {
                        session_id: state.session_id.clone(),
                        tag: ckpt.tag.clone(),
                        commit: ckpt.commit.clone(),
                        timestamp: Utc::now(),
                    });
                    state.record_checkpoint(phase.agent, ckpt.tag.clone());
                    checkpoint_tag = Some(ckpt.tag);
                }
            }

            self.emit(WorkflowEvent::PhaseStarted {
                session_id: state.session_id.clone(),
                phase_index,
                agent: phase.agent.to_string(),
                timestamp: Utc::now(),
            });

            // Attempt loop: first try plus configured retries.
            let max_attempts = if self.options.retries_enabled {
                1 + self.options.max_phase_retries
            } else {
                1
            };
            let mut result: Option<AgentResult> = None;
            for attempt in 1..=max_attempts {
                let input = build_phase_input(def, state, phase_index, feedback.as_deref());
                let runner_config = RunnerConfig {
                    max_turns: self.options.max_turns,
                    context_limit_tokens: self.options.context_limit_tokens,
                    stall: self
                        .options
                        .stall_detection
                        .then(harness::StallConfig::default),
                    truncation: harness::TruncationConfig::default(),
                };
                let runner =
                    AgentRunner::new(self.provider.as_ref(), &tools, &self.cost, runner_config);
                let attempt_result = runner
                    .run(phase.agent, &input.render(), git_ref)
                    .await;

                let valid = attempt_result.success && (phase.validate)(&attempt_result);
                if valid {
                    result = Some(attempt_result);
                    break;
                }

                let reason = attempt_result
                    .error
                    .clone()
                    .unwrap_or_else(|| "phase result failed validation".to_string());

                if attempt < max_attempts {
                    if let Some(tag) = &checkpoint_tag {
                        if let Err(e) = checkpoints.rollback(tag) {
                            warn!(error = %e, "rollback before retry failed");
                        }
                    }
                    self.emit(WorkflowEvent::PhaseRetry {
                        session_id: state.session_id.clone(),
                        phase_index,
                        agent: phase.agent.to_string(),
                        attempt,
                        reason: reason.clone(),
                        timestamp: Utc::now(),
                    });
                    self.store.save(state)?;
                    continue;
                }

                return self.fail_run(
                    state,
                    PhaseFailure {
                        phase: phase.name.to_string(),
                        error: reason,
                        recoverable: true,
                    },
                );
            }
            let result = result.expect("loop either set a result or returned");

            self.emit(WorkflowEvent::PhaseCompleted {
                session_id: state.session_id.clone(),
                phase_index,
                agent: phase.agent.to_string(),
                cost_usd: result.cost_usd,
                turns: result.turns_used,
                timestamp: Utc::now(),
            });
            state.record_result(result);
            state.advance_phase();
            feedback = None;
            self.store.save(state)?;

            // Approval gate: suspend and hand control back to the caller.
            if phase.approval_required && self.options.approvals_enabled {
                state.transition(WorkflowStatus::AwaitingApproval)?;
                self.store.save(state)?;
                self.emit(WorkflowEvent::ApprovalRequired {
                    session_id: state.session_id.clone(),
                    phase_index,
                    agent: phase.agent.to_string(),
                    timestamp: Utc::now(),
                });
                return Ok(RunOutcome::AwaitingApproval(state.clone()));
            }
        }

        self.complete(state)
    }

    /// Completion path: copy sandbox changes back, drop checkpoints.
    fn complete(&self, state: &mut WorkflowState) -> harness::HarnessResult<RunOutcome> {
        if let Some(sandbox) = state.sandbox.clone() {
            let report = SandboxManager::copy_back(&sandbox)?;
            info!(
                copied = report.copied.len(),
                skipped = report.skipped.len(),
                "sandbox results merged"
            );
            SandboxManager::cleanup(&sandbox.sandbox_dir);
        }

        state.transition(WorkflowStatus::Completed)?;
        self.store.save(state)?;
        self.cleanup_checkpoints(state);
        self.emit(WorkflowEvent::RunCompleted {
            session_id: state.session_id.clone(),
            total_cost_usd: state.total_cost_usd,
            timestamp: Utc::now(),
        });
        Ok(RunOutcome::Completed(state.clone()))
    }

    /// Failure path: persist the typed failure and clean up.
    fn fail_run(
        &self,
        state: &mut WorkflowState,
        failure: PhaseFailure,
    ) -> harness::HarnessResult<RunOutcome> {
        warn!(
            session = state.short_id(),
            phase = %failure.phase,
            error = %failure.error,
            "run failed"
        );
        if let Some(sandbox) = &state.sandbox {
            // Failed work stays in the sandbox; nothing is merged back.
            SandboxManager::cleanup(&sandbox.sandbox_dir);
        }
        self.emit(WorkflowEvent::RunFailed {
            session_id: state.session_id.clone(),
            phase: Some(failure.phase.clone()),
            error: failure.error.clone(),
            timestamp: Utc::now(),
        });
        state.fail(failure);
        self.store.save(state)?;
        self.cleanup_checkpoints(state);
        Ok(RunOutcome::Failed(state.clone()))
    }

    /// Terminal states drop their checkpoint tags.
    fn cleanup_checkpoints(&self, state: &WorkflowState) {
        if !self.options.checkpoints {
            return;
        }
        let dir = state
            .sandbox
            .as_ref()
            .map(|s| s.sandbox_dir.clone())
            .unwrap_or_else(|| self.project_root.clone());
        let ckpt = CheckpointManager::new(dir);
        if let Err(e) = ckpt.cleanup(&state.session_id) {
            warn!(error = %e, "checkpoint cleanup failed");
        }
    }
}
