//! Tool executors available to agent phases
//!
//! Each tool validates its JSON input, performs one domain operation
//! inside the working directory, and returns structured output. Errors
//! become typed failed outputs for the model to react to, never panics.

pub mod exec_tool;
pub mod fs_tools;
pub mod search_tool;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::provider::ToolSpec;

/// Errors that can occur during tool execution.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("path `{0}` escapes the working directory")]
    Sandbox(String),

    #[error("command `{command}` not in allowlist")]
    CommandNotAllowed { command: String },

    #[error("command timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("no such tool: {0}")]
    UnknownTool(String),
}

/// Output of one tool execution, with the bookkeeping the agent runner
/// needs for stall detection and result accounting.
#[derive(Debug, Clone, Default)]
pub struct ToolOutcome {
    pub content: String,
    /// Whether the call mutated the filesystem.
    pub touched_filesystem: bool,
    pub files_created: Vec<String>,
    pub files_modified: Vec<String>,
}

impl ToolOutcome {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }
}

/// One callable tool.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Schema advertised to the model.
    fn spec(&self) -> ToolSpec;

    async fn execute(&self, input: serde_json::Value) -> Result<ToolOutcome, ToolError>;
}

/// The tool set for one working directory.
pub struct ToolRegistry {
    tools: Vec<Box<dyn ToolExecutor>>,
}

impl ToolRegistry {
    /// The built-in bundle: file read/write/edit, search, shell.
    pub fn builtin(working_dir: &Path, shell_timeout: Duration) -> Self {
        Self {
            tools: vec![
                Box::new(fs_tools::ReadFileTool::new(working_dir)),
                Box::new(fs_tools::WriteFileTool::new(working_dir)),
                Box::new(fs_tools::EditFileTool::new(working_dir)),
                Box::new(search_tool::SearchFilesTool::new(working_dir)),
                Box::new(exec_tool::RunCommandTool::new(working_dir, shell_timeout)),
            ],
        }
    }

    /// Registry with extra (e.g. vendor-API) tools appended.
    pub fn with_extra(mut self, extra: Vec<Box<dyn ToolExecutor>>) -> Self {
        self.tools.extend(extra);
        self
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(|t| t.spec()).collect()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    /// Execute a named tool.
    pub async fn execute(
        &self,
        name: &str,
        input: serde_json::Value,
    ) -> Result<ToolOutcome, ToolError> {
        let tool = self
            .tools
            .iter()
            .find(|t| t.name() == name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        tool.execute(input).await
    }
}

/// Validate that a resolved path stays within the working directory.
///
/// Returns the canonicalized path on success. Paths that do not exist
/// yet (writes into new directories) resolve through their deepest
/// existing ancestor, so symlink and `..` escapes are still caught.
pub fn sandbox_check(working_dir: &Path, relative_path: &str) -> Result<PathBuf, ToolError> {
    if Path::new(relative_path).is_absolute() {
        return Err(ToolError::Sandbox(relative_path.to_string()));
    }
    let candidate = working_dir.join(relative_path);

    let mut existing = candidate.clone();
    let mut remainder: Vec<std::ffi::OsString> = Vec::new();
    while !existing.exists() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                remainder.push(name.to_os_string());
                existing = parent.to_path_buf();
            }
            _ => return Err(ToolError::Sandbox(relative_path.to_string())),
        }
    }

    let mut resolved = existing.canonicalize().map_err(ToolError::Io)?;
    for part in remainder.iter().rev() {
        resolved.push(part);
    }

    let canon_root = working_dir.canonicalize().map_err(ToolError::Io)?;
    if !resolved.starts_with(&canon_root) {
        return Err(ToolError::Sandbox(relative_path.to_string()));
    }
    Ok(resolved)
}

/// Deserialize tool arguments, mapping failures to `InvalidArgs`.
pub(crate) fn parse_args<T: serde::de::DeserializeOwned>(
    input: serde_json::Value,
) -> Result<T, ToolError> {
    serde_json::from_value(input).map_err(|e| ToolError::InvalidArgs(e.to_string()))
}
