//! Safety apparatus for autonomous workflow runs
//!
//! Everything an unattended multi-phase agent pipeline needs to not hurt
//! itself or the repository it works on:
//!
//! - git checkpoints bracketing each phase, with rollback
//! - sandbox clones so the real tree is only touched on success
//! - tool-output truncation and history compaction under a token budget
//! - stall detection over hashed tool-call patterns
//! - durable session state, a persistent work queue, and approval routing
//! - an advisory worker lock and append-only audit logging
//!
//! The engine crate (`conductor`) drives these pieces; this crate stays
//! synchronous and free of model or tool specifics.

pub mod audit;
pub mod checkpoint;
pub mod context;
pub mod error;
pub mod events;
pub mod git;
pub mod lock;
pub mod policy;
pub mod queue;
pub mod sandbox;
pub mod session;
pub mod stall;
pub mod types;

pub use audit::AuditLog;
pub use checkpoint::{slug, CheckpointManager, CheckpointRef};
pub use context::{
    truncate_tool_output, CompactionReport, Compactor, ToolClass, TruncationConfig, Turn,
    TurnMeta, TurnRole,
};
pub use error::{HarnessError, HarnessResult};
pub use events::{null_sink, tracing_sink, EventSink, WorkflowEvent};
pub use git::GitManager;
pub use lock::WorkerLock;
pub use policy::{ApprovalDecision, ApprovalPolicy, Decision};
pub use queue::{
    DiscoveredWork, Priority, SuggestedWorkflow, WorkItemStatus, WorkQueue,
    DEFAULT_QUEUE_CAPACITY,
};
pub use sandbox::{CopyBackReport, SandboxManager};
pub use session::{
    atomic_write, SessionStore, WorkerState, WorkerStatus, STATE_DIR_NAME,
};
pub use stall::{input_hash, StallConfig, StallKind, StallTracker, ToolCallRecord};
pub use types::{
    AgentOutput, AgentResult, AgentType, PhaseFailure, SandboxInfo, WorkflowState, WorkflowStatus,
};
