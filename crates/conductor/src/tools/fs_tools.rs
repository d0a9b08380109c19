//! File system tools: read, write, and edit files within the working tree

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use super::{parse_args, sandbox_check, ToolError, ToolExecutor, ToolOutcome};
use crate::provider::ToolSpec;

// ---------------------------------------------------------------------------
// ReadFileTool
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ReadFileArgs {
    /// Relative path within the working directory.
    path: String,
    /// First line to read (1-indexed, inclusive).
    start_line: Option<u32>,
    /// Last line to read (1-indexed, inclusive).
    end_line: Option<u32>,
}

/// Read a file. Path must stay within the working directory.
pub struct ReadFileTool {
    working_dir: PathBuf,
}

impl ReadFileTool {
    pub fn new(working_dir: &Path) -> Self {
        Self {
            working_dir: working_dir.to_path_buf(),
        }
    }
}

#[async_trait]
impl ToolExecutor for ReadFileTool {
    fn name(&self) -> &'static str {
        "read_file"
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "read_file".into(),
            description: "Read the contents of a file in the workspace. \
                          Use start_line/end_line to read a range when the file is large."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Relative path to the file within the workspace"
                    },
                    "start_line": {
                        "type": "integer",
                        "description": "First line to read (1-indexed, inclusive)"
                    },
                    "end_line": {
                        "type": "integer",
                        "description": "Last line to read (1-indexed, inclusive)"
                    }
                },
                "required": ["path"]
            }),
        }
    }

    async fn execute(&self, input: serde_json::Value) -> Result<ToolOutcome, ToolError> {
        let args: ReadFileArgs = parse_args(input)?;
        let full_path = sandbox_check(&self.working_dir, &args.path)?;
        let content = std::fs::read_to_string(&full_path)?;

        let content = if args.start_line.is_some() || args.end_line.is_some() {
            let lines: Vec<&str> = content.lines().collect();
            let total = lines.len();
            let start = args
                .start_line
                .map(|n| (n as usize).saturating_sub(1))
                .unwrap_or(0)
                .min(total);
            let end = args.end_line.map(|n| (n as usize).min(total)).unwrap_or(total);
            if start >= end {
                return Ok(ToolOutcome::text(format!(
                    "[Empty range: start_line={} end_line={end} total_lines={total}]",
                    start + 1
                )));
            }
            let annotated: String = lines[start..end]
                .iter()
                .enumerate()
                .map(|(i, line)| format!("{:>5}: {}", start + i + 1, line))
                .collect::<Vec<_>>()
                .join("\n");
            format!("[Lines {}-{end} of {total} total]\n{annotated}", start + 1)
        } else {
            content
        };

        Ok(ToolOutcome::text(content))
    }
}

// ---------------------------------------------------------------------------
// WriteFileTool
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct WriteFileArgs {
    path: String,
    content: String,
}

/// Write content to a file, creating parent directories.
pub struct WriteFileTool {
    working_dir: PathBuf,
}

impl WriteFileTool {
    pub fn new(working_dir: &Path) -> Self {
        Self {
            working_dir: working_dir.to_path_buf(),
        }
    }
}

#[async_trait]
impl ToolExecutor for WriteFileTool {
    fn name(&self) -> &'static str {
        "write_file"
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "write_file".into(),
            description:
                "Write content to a file in the workspace. Creates parent directories if needed."
                    .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Relative path to the file within the workspace"
                    },
                    "content": {
                        "type": "string",
                        "description": "The full content to write"
                    }
                },
                "required": ["path", "content"]
            }),
        }
    }

    async fn execute(&self, input: serde_json::Value) -> Result<ToolOutcome, ToolError> {
        let args: WriteFileArgs = parse_args(input)?;
        let full_path = sandbox_check(&self.working_dir, &args.path)?;
        if !args.path.contains('/') {
            warn!(path = %args.path, "write_file: no directory component, writing to workspace root");
        }

        if let Some(parent) = full_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let existed = full_path.exists();
        let bytes = args.content.len();
        std::fs::write(&full_path, &args.content)?;

        let mut outcome = ToolOutcome::text(format!("Wrote {bytes} bytes to {}", args.path));
        outcome.touched_filesystem = true;
        if existed {
            outcome.files_modified.push(args.path);
        } else {
            outcome.files_created.push(args.path);
        }
        Ok(outcome)
    }
}

// ---------------------------------------------------------------------------
// EditFileTool
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct EditFileArgs {
    path: String,
    /// Exact text to replace. Must appear exactly once.
    old_string: String,
    new_string: String,
}

/// Targeted text replacement within one file.
pub struct EditFileTool {
    working_dir: PathBuf,
}

impl EditFileTool {
    pub fn new(working_dir: &Path) -> Self {
        Self {
            working_dir: working_dir.to_path_buf(),
        }
    }
}

#[async_trait]
impl ToolExecutor for EditFileTool {
    fn name(&self) -> &'static str {
        "edit_file"
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "edit_file".into(),
            description: "Replace an exact text snippet in a file. The old text must \
                          appear exactly once; include enough context to make it unique."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Relative path to the file within the workspace"
                    },
                    "old_string": {
                        "type": "string",
                        "description": "Exact text to replace (must be unique in the file)"
                    },
                    "new_string": {
                        "type": "string",
                        "description": "Replacement text"
                    }
                },
                "required": ["path", "old_string", "new_string"]
            }),
        }
    }

    async fn execute(&self, input: serde_json::Value) -> Result<ToolOutcome, ToolError> {
        let args: EditFileArgs = parse_args(input)?;
        let full_path = sandbox_check(&self.working_dir, &args.path)?;
        let content = std::fs::read_to_string(&full_path)?;

        let occurrences = content.matches(&args.old_string).count();
        if occurrences == 0 {
            return Ok(ToolOutcome::text(format!(
                "No match for old_string in {}; file unchanged. \
                 Re-read the file and retry with the exact current text.",
                args.path
            )));
        }
        if occurrences > 1 {
            return Ok(ToolOutcome::text(format!(
                "old_string appears {occurrences} times in {}; file unchanged. \
                 Add surrounding context to make it unique.",
                args.path
            )));
        }

        let updated = content.replacen(&args.old_string, &args.new_string, 1);
        std::fs::write(&full_path, &updated)?;

        let mut outcome = ToolOutcome::text(format!("Edited {}", args.path));
        outcome.touched_filesystem = true;
        outcome.files_modified.push(args.path);
        Ok(outcome)
    }
}
