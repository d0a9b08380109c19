//! Core workflow data model
//!
//! The state that survives process restarts: one `WorkflowState` per run,
//! one `AgentResult` per completed phase attempt. Mutation happens only in
//! the orchestrator; everything here is plain serializable data plus the
//! transition rules of the run state machine.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, HarnessResult};

/// The agent roles a phase can be executed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentType {
    DesignReview,
    Specify,
    GenerateTests,
    Implement,
    Review,
    Verify,
}

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DesignReview => "design-review",
            Self::Specify => "specify",
            Self::GenerateTests => "generate-tests",
            Self::Implement => "implement",
            Self::Review => "review",
            Self::Verify => "verify",
        }
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowStatus {
    NotStarted,
    Running,
    AwaitingApproval,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    /// Terminal states are never left.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotStarted => "not-started",
            Self::Running => "running",
            Self::AwaitingApproval => "awaiting-approval",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Structured output extracted from an agent's final answer.
///
/// Parsing is best-effort: when the final answer carries no parseable JSON
/// block the raw text is preserved instead. Validators must handle the
/// `Raw` case; an unparseable result is a validation failure, not a crash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum AgentOutput {
    Parsed(serde_json::Value),
    Raw(String),
}

impl AgentOutput {
    /// Fetch a string field from parsed output, `None` for raw fallbacks.
    pub fn field(&self, key: &str) -> Option<String> {
        match self {
            Self::Parsed(v) => v.get(key).map(|f| match f {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
            Self::Raw(_) => None,
        }
    }

    /// Fetch a boolean field from parsed output.
    pub fn bool_field(&self, key: &str) -> Option<bool> {
        match self {
            Self::Parsed(v) => v.get(key).and_then(|f| f.as_bool()),
            Self::Raw(_) => None,
        }
    }

    /// Render the output as display text regardless of variant.
    pub fn as_text(&self) -> String {
        match self {
            Self::Parsed(v) => serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string()),
            Self::Raw(s) => s.clone(),
        }
    }

    pub fn is_parsed(&self) -> bool {
        matches!(self, Self::Parsed(_))
    }
}

/// Result of one phase attempt. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub agent: AgentType,
    pub success: bool,
    pub output: AgentOutput,
    #[serde(default)]
    pub files_created: Vec<String>,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub commits: Vec<String>,
    pub cost_usd: f64,
    pub turns_used: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentResult {
    /// Shorthand for a failed attempt with no useful output.
    pub fn failure(agent: AgentType, error: impl Into<String>, cost_usd: f64, turns: u32) -> Self {
        Self {
            agent,
            success: false,
            output: AgentOutput::Raw(String::new()),
            files_created: Vec::new(),
            files_modified: Vec::new(),
            commits: Vec::new(),
            cost_usd,
            turns_used: turns,
            error: Some(error.into()),
        }
    }
}

/// A typed phase failure carried on the workflow state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseFailure {
    pub phase: String,
    pub error: String,
    pub recoverable: bool,
}

/// Sandbox bookkeeping for a run, recorded so resume finds the clone again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxInfo {
    pub sandbox_dir: PathBuf,
    pub source_dir: PathBuf,
    pub start_commit: String,
}

/// Full persisted state of one workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub session_id: String,
    pub workflow_type: String,
    pub description: String,
    pub current_phase_index: usize,
    pub status: WorkflowStatus,
    /// Keyed by agent type: when the same agent runs twice in one workflow
    /// the later execution overwrites the earlier entry.
    #[serde(default)]
    pub phase_results: BTreeMap<AgentType, AgentResult>,
    /// Checkpoint tags, keyed the same way (same overwrite semantics).
    #[serde(default)]
    pub checkpoints: BTreeMap<AgentType, String>,
    pub total_cost_usd: f64,
    pub total_turns: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PhaseFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<SandboxInfo>,
}

impl WorkflowState {
    /// Create a fresh run in `NotStarted`.
    pub fn new(workflow_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            workflow_type: workflow_type.into(),
            description: description.into(),
            current_phase_index: 0,
            status: WorkflowStatus::NotStarted,
            phase_results: BTreeMap::new(),
            checkpoints: BTreeMap::new(),
            total_cost_usd: 0.0,
            total_turns: 0,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            sandbox: None,
        }
    }

    /// First 8 characters of the session id, for tags and log lines.
    pub fn short_id(&self) -> &str {
        &self.session_id[..8.min(self.session_id.len())]
    }

    /// Transition the run status, enforcing the state machine.
    pub fn transition(&mut self, to: WorkflowStatus) -> HarnessResult<()> {
        use WorkflowStatus::*;
        let ok = matches!(
            (self.status, to),
            (NotStarted, Running)
                | (Running, AwaitingApproval)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (AwaitingApproval, Running)
                | (AwaitingApproval, Cancelled)
                | (AwaitingApproval, Failed)
        );
        if !ok {
            return Err(HarnessError::InvalidStateTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        if to.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Record a successful phase result, accumulating cost and turns.
    ///
    /// The result lands under its agent-type key; a second execution of the
    /// same agent type replaces the first and its cost replaces the first
    /// result's contribution (total stays the sum of stored results).
    pub fn record_result(&mut self, result: AgentResult) {
        self.total_turns += result.turns_used;
        self.phase_results.insert(result.agent, result);
        self.total_cost_usd = self.phase_results.values().map(|r| r.cost_usd).sum();
    }

    /// Record a checkpoint tag for a phase's agent.
    pub fn record_checkpoint(&mut self, agent: AgentType, tag: impl Into<String>) {
        self.checkpoints.insert(agent, tag.into());
    }

    /// Advance to the next phase. The index never decreases.
    pub fn advance_phase(&mut self) {
        self.current_phase_index += 1;
    }

    /// Whether this run can still make progress.
    pub fn is_resumable(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Mark the run failed with a typed failure.
    pub fn fail(&mut self, failure: PhaseFailure) {
        self.error = Some(failure);
        // A failure can strike from any live state.
        self.status = WorkflowStatus::Failed;
        self.completed_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(agent: AgentType, cost: f64) -> AgentResult {
        AgentResult {
            agent,
            success: true,
            output: AgentOutput::Raw("done".into()),
            files_created: vec![],
            files_modified: vec![],
            commits: vec![],
            cost_usd: cost,
            turns_used: 3,
            error: None,
        }
    }

    #[test]
    fn test_status_transitions() {
        let mut state = WorkflowState::new("new-feature", "add widget");
        assert_eq!(state.status, WorkflowStatus::NotStarted);

        state.transition(WorkflowStatus::Running).unwrap();
        state.transition(WorkflowStatus::AwaitingApproval).unwrap();
        state.transition(WorkflowStatus::Running).unwrap();
        state.transition(WorkflowStatus::Completed).unwrap();
        assert!(state.status.is_terminal());
        assert!(state.completed_at.is_some());

        // Terminal states are final
        assert!(state.transition(WorkflowStatus::Running).is_err());
    }

    #[test]
    fn test_illegal_transition() {
        let mut state = WorkflowState::new("bug-fix", "fix crash");
        let err = state.transition(WorkflowStatus::Completed).unwrap_err();
        assert!(matches!(
            err,
            HarnessError::InvalidStateTransition { .. }
        ));
    }

    #[test]
    fn test_cost_is_sum_of_recorded_results() {
        let mut state = WorkflowState::new("new-feature", "x");
        state.record_result(result(AgentType::Specify, 1.0));
        state.record_result(result(AgentType::Implement, 2.5));
        assert!((state.total_cost_usd - 3.5).abs() < f64::EPSILON);
        assert_eq!(state.total_turns, 6);
    }

    #[test]
    fn test_duplicate_agent_type_overwrites() {
        // bug-fix runs verify twice: the final verification replaces the
        // baseline under the same key. Preserved (risky) behavior.
        let mut state = WorkflowState::new("bug-fix", "x");
        state.record_result(result(AgentType::Verify, 1.0));
        state.record_result(result(AgentType::Verify, 0.25));
        assert_eq!(state.phase_results.len(), 1);
        assert!((state.total_cost_usd - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_agent_output_field_access() {
        let parsed = AgentOutput::Parsed(serde_json::json!({
            "passed": true,
            "summary": "all green",
        }));
        assert_eq!(parsed.bool_field("passed"), Some(true));
        assert_eq!(parsed.field("summary").as_deref(), Some("all green"));

        let raw = AgentOutput::Raw("could not parse".into());
        assert_eq!(raw.bool_field("passed"), None);
        assert_eq!(raw.field("summary"), None);
        assert!(!raw.is_parsed());
    }

    #[test]
    fn test_state_serde_round_trip() {
        let mut state = WorkflowState::new("refactor", "extract module");
        state.transition(WorkflowStatus::Running).unwrap();
        state.record_result(result(AgentType::Implement, 0.42));
        state.record_checkpoint(AgentType::Implement, "conductor/abc/01-implement");

        let json = serde_json::to_string_pretty(&state).unwrap();
        let restored: WorkflowState = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.session_id, state.session_id);
        assert_eq!(restored.status, WorkflowStatus::Running);
        assert_eq!(restored.phase_results.len(), 1);
        assert_eq!(
            restored.checkpoints.get(&AgentType::Implement).unwrap(),
            "conductor/abc/01-implement"
        );
    }
}
