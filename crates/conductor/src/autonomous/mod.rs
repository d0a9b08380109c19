//! Autonomous operation: sources, policy-gated execution, the worker loop

pub mod sources;
pub mod worker;

pub use sources::{HttpEventSource, SignalDirSource, WorkSource};
pub use worker::{AutonomousWorker, WorkerConfig, WorkerReport};
