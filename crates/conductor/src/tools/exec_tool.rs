//! Shell command execution with allowlist and process-killing timeout

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{parse_args, ToolError, ToolExecutor, ToolOutcome};
use crate::provider::ToolSpec;

/// Programs the agent may invoke.
const ALLOWED_COMMANDS: &[&str] = &[
    // Build / test / vcs
    "cargo", "git", "npm", "npx", "pip", "python", "python3", "make",
    // Modern CLI tools and their classic fallbacks
    "rg", "fd", "ls", "wc", "find", "grep", "cat", "head", "tail", "sed", "awk", "sort", "uniq",
    "diff", "echo", "touch", "mkdir",
];

#[derive(Deserialize)]
struct RunCommandArgs {
    /// The command line to run (e.g. "cargo test").
    command: String,
}

/// Run an allowlisted shell command in the working directory.
///
/// The process is killed when the timeout elapses; partial output is
/// discarded and the timeout is reported to the model.
pub struct RunCommandTool {
    working_dir: PathBuf,
    timeout: Duration,
}

impl RunCommandTool {
    pub fn new(working_dir: &Path, timeout: Duration) -> Self {
        Self {
            working_dir: working_dir.to_path_buf(),
            timeout,
        }
    }
}

#[async_trait]
impl ToolExecutor for RunCommandTool {
    fn name(&self) -> &'static str {
        "run_command"
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "run_command".into(),
            description: "Run a shell command in the workspace. Allowed programs: \
                          cargo, git, npm, pip, python, make, rg, fd, ls, grep, cat, \
                          head, tail, sed, awk, sort, uniq, diff, wc, find, echo, \
                          touch, mkdir."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "command": {
                        "type": "string",
                        "description": "The command to run (e.g. 'cargo test', 'git diff')"
                    }
                },
                "required": ["command"]
            }),
        }
    }

    async fn execute(&self, input: serde_json::Value) -> Result<ToolOutcome, ToolError> {
        let args: RunCommandArgs = parse_args(input)?;

        let program = shlex::split(&args.command)
            .and_then(|parts| parts.into_iter().next())
            .ok_or_else(|| ToolError::InvalidArgs("empty or unparseable command".into()))?;

        if !ALLOWED_COMMANDS.contains(&program.as_str()) {
            return Err(ToolError::CommandNotAllowed { command: program });
        }

        debug!(command = %args.command, "running shell command");
        let mut child = tokio::process::Command::new("sh")
            .args(["-c", &args.command])
            .current_dir(&self.working_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                // wait_with_output consumed the child; kill_on_drop has
                // already reaped the process at this point.
                return Err(ToolError::Timeout {
                    seconds: self.timeout.as_secs(),
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        // Non-zero exits are results, not errors: the agent needs to see
        // compiler and test failures to react to them.
        let content = if output.status.success() {
            format!("{stdout}{stderr}")
        } else {
            let code = output.status.code().unwrap_or(-1);
            format!("EXIT CODE: {code}\nSTDOUT:\n{stdout}\nSTDERR:\n{stderr}")
        };

        let mut outcome = ToolOutcome::text(content);
        // Shell commands may mutate the tree; count them as file activity.
        outcome.touched_filesystem = true;
        Ok(outcome)
    }
}
