//! Workflow events emitted by the orchestrator
//!
//! Serializable notifications for progress display, audit logging, and
//! tests. Delivered through a shared callback sink.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Everything observable about a run from the outside.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    RunStarted {
        session_id: String,
        workflow_type: String,
        description: String,
        timestamp: DateTime<Utc>,
    },
    PhaseStarted {
        session_id: String,
        phase_index: usize,
        agent: String,
        timestamp: DateTime<Utc>,
    },
    PhaseCompleted {
        session_id: String,
        phase_index: usize,
        agent: String,
        cost_usd: f64,
        turns: u32,
        timestamp: DateTime<Utc>,
    },
    PhaseRetry {
        session_id: String,
        phase_index: usize,
        agent: String,
        attempt: u32,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    CheckpointCreated {
        session_id: String,
        tag: String,
        commit: String,
        timestamp: DateTime<Utc>,
    },
    RolledBack {
        session_id: String,
        tag: String,
        timestamp: DateTime<Utc>,
    },
    ApprovalRequired {
        session_id: String,
        phase_index: usize,
        agent: String,
        timestamp: DateTime<Utc>,
    },
    ApprovalResolved {
        session_id: String,
        approved: bool,
        timestamp: DateTime<Utc>,
    },
    StallIntervention {
        session_id: String,
        kind: String,
        interventions: u32,
        timestamp: DateTime<Utc>,
    },
    BudgetExceeded {
        session_id: String,
        total_cost_usd: f64,
        budget_usd: f64,
        timestamp: DateTime<Utc>,
    },
    RunCompleted {
        session_id: String,
        total_cost_usd: f64,
        timestamp: DateTime<Utc>,
    },
    RunFailed {
        session_id: String,
        phase: Option<String>,
        error: String,
        timestamp: DateTime<Utc>,
    },
    RunCancelled {
        session_id: String,
        timestamp: DateTime<Utc>,
    },
}

impl WorkflowEvent {
    /// Short name for logs and audit entries.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::PhaseStarted { .. } => "phase_started",
            Self::PhaseCompleted { .. } => "phase_completed",
            Self::PhaseRetry { .. } => "phase_retry",
            Self::CheckpointCreated { .. } => "checkpoint_created",
            Self::RolledBack { .. } => "rolled_back",
            Self::ApprovalRequired { .. } => "approval_required",
            Self::ApprovalResolved { .. } => "approval_resolved",
            Self::StallIntervention { .. } => "stall_intervention",
            Self::BudgetExceeded { .. } => "budget_exceeded",
            Self::RunCompleted { .. } => "run_completed",
            Self::RunFailed { .. } => "run_failed",
            Self::RunCancelled { .. } => "run_cancelled",
        }
    }
}

/// Shared event callback.
pub type EventSink = Arc<dyn Fn(&WorkflowEvent) + Send + Sync>;

/// Sink that forwards every event to the tracing log.
pub fn tracing_sink() -> EventSink {
    Arc::new(|event: &WorkflowEvent| {
        info!(event = event.name(), detail = ?event, "workflow event");
    })
}

/// Sink that drops everything, for tests.
pub fn null_sink() -> EventSink {
    Arc::new(|_| {})
}
