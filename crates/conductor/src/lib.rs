//! Conductor: an autonomous multi-phase workflow engine
//!
//! Drives named pipelines of LLM-backed agent phases (design-review →
//! specify → generate-tests → implement → review → verify) with the
//! safety apparatus to run unattended: cost budgets, approval gates,
//! sandbox isolation, checkpoints, and stall detection. The companion
//! autonomous worker discovers candidate work from signal sources,
//! classifies it by risk tier, and feeds approved items through the same
//! engine under tighter budgets.
//!
//! The safety primitives themselves live in the `harness` crate; this
//! crate contributes the orchestration, the agent tool loop, the model
//! and tool provider seams, and the CLI.

#![allow(clippy::uninlined_format_args)]

pub mod agent;
pub mod autonomous;
pub mod cli;
pub mod config;
pub mod orchestrator;
pub mod provider;
pub mod tools;
pub mod workflows;

pub use orchestrator::{ApprovalVerdict, Orchestrator, RunOptions, RunOutcome};
pub use provider::{CostModel, ModelProvider, ModelReply, ModelTurn, TokenUsage, ToolSpec};
pub use workflows::{definition, WorkflowType};
