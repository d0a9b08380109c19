//! Agent execution: one phase's bounded tool loop

pub mod runner;

pub use runner::{AgentRunner, RunnerConfig};
