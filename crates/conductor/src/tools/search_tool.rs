//! Regex search over the working tree

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{parse_args, sandbox_check, ToolError, ToolExecutor, ToolOutcome};
use crate::provider::ToolSpec;

/// Hard cap on collected matches; the context manager trims further.
const MAX_COLLECTED_MATCHES: usize = 500;

/// Directories never worth searching.
const SKIP_DIRS: &[&str] = &["target", "node_modules", ".venv"];

#[derive(Deserialize)]
struct SearchFilesArgs {
    /// Regex pattern to search for.
    pattern: String,
    /// Relative directory to search under (default: workspace root).
    path: Option<String>,
}

/// Search file contents with a regex, reporting `path:line: text` matches.
pub struct SearchFilesTool {
    working_dir: PathBuf,
}

impl SearchFilesTool {
    pub fn new(working_dir: &Path) -> Self {
        Self {
            working_dir: working_dir.to_path_buf(),
        }
    }

    fn walk(dir: &Path, files: &mut Vec<PathBuf>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || SKIP_DIRS.contains(&name.as_str()) {
                continue;
            }
            if path.is_dir() {
                Self::walk(&path, files);
            } else {
                files.push(path);
            }
        }
    }
}

#[async_trait]
impl ToolExecutor for SearchFilesTool {
    fn name(&self) -> &'static str {
        "search_files"
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "search_files".into(),
            description: "Search file contents in the workspace with a regular expression. \
                          Returns matches as `path:line: text`."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "pattern": {
                        "type": "string",
                        "description": "Regular expression to search for"
                    },
                    "path": {
                        "type": "string",
                        "description": "Relative directory to search under (default: workspace root)"
                    }
                },
                "required": ["pattern"]
            }),
        }
    }

    async fn execute(&self, input: serde_json::Value) -> Result<ToolOutcome, ToolError> {
        let args: SearchFilesArgs = parse_args(input)?;
        let regex = regex::Regex::new(&args.pattern)
            .map_err(|e| ToolError::InvalidArgs(format!("bad pattern: {e}")))?;

        let root = match &args.path {
            Some(rel) if !rel.is_empty() => sandbox_check(&self.working_dir, rel)?,
            _ => self.working_dir.clone(),
        };

        let mut files = Vec::new();
        Self::walk(&root, &mut files);
        files.sort();

        let mut matches = Vec::new();
        'outer: for file in &files {
            // Binary or unreadable files are skipped silently
            let Ok(content) = std::fs::read_to_string(file) else {
                continue;
            };
            let rel = file
                .strip_prefix(&self.working_dir)
                .unwrap_or(file)
                .display();
            for (lineno, line) in content.lines().enumerate() {
                if regex.is_match(line) {
                    matches.push(format!("{rel}:{}: {}", lineno + 1, line.trim_end()));
                    if matches.len() >= MAX_COLLECTED_MATCHES {
                        matches.push(format!("[match cap of {MAX_COLLECTED_MATCHES} reached]"));
                        break 'outer;
                    }
                }
            }
        }

        if matches.is_empty() {
            return Ok(ToolOutcome::text(format!(
                "No matches for `{}`",
                args.pattern
            )));
        }
        Ok(ToolOutcome::text(matches.join("\n")))
    }
}
