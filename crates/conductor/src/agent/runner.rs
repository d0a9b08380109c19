//! The phase loop: prompt → tool calls → structured result
//!
//! Sends system instructions plus accumulated history to the model,
//! executes requested tool calls one at a time, truncates every result
//! before it enters history, watches for stalls, and compacts history as
//! the token estimate grows. Ends with a best-effort structured parse of
//! the final answer.

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use harness::context::{Compactor, TruncationConfig, Turn, TurnMeta};
use harness::stall::{StallConfig, StallKind, StallTracker, ToolCallRecord};
use harness::types::{AgentOutput, AgentResult, AgentType};
use harness::GitManager;

use crate::provider::{CostModel, ModelProvider, ModelReply, TokenUsage};
use crate::tools::ToolRegistry;
use crate::workflows::system_prompt;

/// Knobs for one phase execution.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Maximum model turns before the phase is abandoned.
    pub max_turns: u32,
    /// Model context window, for the compaction threshold.
    pub context_limit_tokens: usize,
    /// Stall detection; `None` disables it.
    pub stall: Option<StallConfig>,
    pub truncation: TruncationConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_turns: 30,
            context_limit_tokens: 128_000,
            stall: Some(StallConfig::default()),
            truncation: TruncationConfig::default(),
        }
    }
}

/// Executes one phase against a model provider and a tool registry.
pub struct AgentRunner<'a> {
    provider: &'a dyn ModelProvider,
    tools: &'a ToolRegistry,
    cost: &'a CostModel,
    config: RunnerConfig,
}

impl<'a> AgentRunner<'a> {
    pub fn new(
        provider: &'a dyn ModelProvider,
        tools: &'a ToolRegistry,
        cost: &'a CostModel,
        config: RunnerConfig,
    ) -> Self {
        Self {
            provider,
            tools,
            cost,
            config,
        }
    }

    /// Run the loop to completion for one phase.
    ///
    /// `git` (when the working directory is under version control) is used
    /// to list commits the phase produced. Every model and tool error is
    /// converted into a failed `AgentResult`; this function does not error.
    pub async fn run(
        &self,
        agent: AgentType,
        prompt: &str,
        git: Option<&GitManager>,
    ) -> AgentResult {
        let system = system_prompt(agent);
        let compactor = Compactor::new(self.config.context_limit_tokens);
        let mut stall = self.config.stall.clone().map(StallTracker::new);
        let mut history: Vec<Turn> = vec![Turn::user(prompt)];

        let start_commit = git.and_then(|g| g.current_commit().ok());
        let mut usage = TokenUsage::default();
        let mut files_created: BTreeSet<String> = BTreeSet::new();
        let mut files_modified: BTreeSet<String> = BTreeSet::new();
        let mut turns: u32 = 0;

        let outcome = loop {
            if turns >= self.config.max_turns {
                break Err(format!(
                    "phase abandoned after {} turns without a final answer",
                    self.config.max_turns
                ));
            }
            turns += 1;

            let turn = match self
                .provider
                .complete(&system, &history, &self.tools.specs())
                .await
            {
                Ok(turn) => turn,
                Err(e) => break Err(format!("model call failed: {e}")),
            };
            usage.add(turn.usage);

            match turn.reply {
                ModelReply::Final { text } => {
                    debug!(agent = %agent, turns, "agent returned final answer");
                    break Ok(parse_structured_output(&text));
                }
                ModelReply::ToolCalls { text, calls } => {
                    let call_names: Vec<String> =
                        calls.iter().map(|c| c.name.clone()).collect();
                    history.push(Turn::assistant(
                        text.unwrap_or_else(|| format!("[calling {}]", call_names.join(", "))),
                    ));

                    let mut records = Vec::with_capacity(calls.len());
                    let mut touched = false;
                    for call in calls {
                        records.push(ToolCallRecord::new(call.name.clone(), &call.input));

                        let (content, meta) = match self
                            .tools
                            .execute(&call.name, call.input)
                            .await
                        {
                            Ok(out) => {
                                touched |= out.touched_filesystem;
                                files_created.extend(out.files_created.iter().cloned());
                                files_modified.extend(out.files_modified.iter().cloned());
                                let meta = TurnMeta {
                                    tools: vec![call.name.clone()],
                                    files: out
                                        .files_created
                                        .iter()
                                        .chain(out.files_modified.iter())
                                        .cloned()
                                        .collect(),
                                    failed: false,
                                };
                                (out.content, meta)
                            }
                            Err(e) => {
                                // Tool errors go back to the model as text
                                // so it can self-correct.
                                let meta = TurnMeta {
                                    tools: vec![call.name.clone()],
                                    files: vec![],
                                    failed: true,
                                };
                                (format!("ERROR: {e}"), meta)
                            }
                        };

                        let truncated = harness::truncate_tool_output(
                            &call.name,
                            &content,
                            &self.config.truncation,
                        );
                        history.push(
                            Turn::user(format!("[{}] {}", call.name, truncated)).with_meta(meta),
                        );
                    }

                    // Stall check happens between steps, never mid-call.
                    if let Some(tracker) = stall.as_mut() {
                        if let Some(kind) = tracker.record_turn(&records, touched) {
                            if tracker.should_abort() {
                                warn!(agent = %agent, %kind, "stall interventions exhausted, hard-stopping phase");
                                break Err(stall_stop_message(kind, &files_created, &files_modified));
                            }
                            tracker.record_intervention();
                            info!(agent = %agent, %kind, interventions = tracker.interventions(), "injecting stall intervention");
                            history.push(Turn::user(kind.nudge().to_string()));
                        }
                    }
                }
            }

            if compactor.needs_compaction(&history) {
                compactor.compact(&mut history);
            }
        };

        let cost_usd = self.cost.cost_usd(self.provider.model_id(), usage);
        let commits = match (git, &start_commit) {
            (Some(g), Some(start)) => g.commits_since(start).unwrap_or_default(),
            _ => Vec::new(),
        };

        match outcome {
            Ok(output) => AgentResult {
                agent,
                success: true,
                output,
                files_created: files_created.into_iter().collect(),
                files_modified: files_modified.into_iter().collect(),
                commits,
                cost_usd,
                turns_used: turns,
                error: None,
            },
            Err(error) => AgentResult {
                agent,
                success: false,
                output: AgentOutput::Raw(String::new()),
                files_created: files_created.into_iter().collect(),
                files_modified: files_modified.into_iter().collect(),
                commits,
                cost_usd,
                turns_used: turns,
                error: Some(error),
            },
        }
    }
}

/// Diagnostic summary for a stall hard-stop: what got done, what blocked.
fn stall_stop_message(
    kind: StallKind,
    created: &BTreeSet<String>,
    modified: &BTreeSet<String>,
) -> String {
    let accomplished = if created.is_empty() && modified.is_empty() {
        "no files were changed".to_string()
    } else {
        format!(
            "files created: [{}], files modified: [{}]",
            created.iter().cloned().collect::<Vec<_>>().join(", "),
            modified.iter().cloned().collect::<Vec<_>>().join(", ")
        )
    };
    format!(
        "stalled ({kind}) after repeated interventions; {accomplished}; \
         blocking condition: agent kept {} without converging",
        match kind {
            StallKind::Repetition => "repeating the same tool call",
            StallKind::Oscillation => "alternating between two tool calls",
            StallKind::Idle => "reading without making changes",
        }
    )
}

/// Best-effort extraction of a structured result from final answer text.
///
/// Accepts a fenced ```json block anywhere in the text, a bare JSON
/// object, or falls back to wrapping the raw text.
pub fn parse_structured_output(text: &str) -> AgentOutput {
    if let Some(start) = text.find("```json") {
        let after = &text[start + 7..];
        if let Some(end) = after.find("```") {
            if let Ok(value) = serde_json::from_str(after[..end].trim()) {
                return AgentOutput::Parsed(value);
            }
        }
    }

    let trimmed = text.trim();
    if trimmed.starts_with('{') {
        if let Ok(value) = serde_json::from_str(trimmed) {
            return AgentOutput::Parsed(value);
        }
        // A JSON object followed by prose: try up to the last brace
        if let Some(end) = trimmed.rfind('}') {
            if let Ok(value) = serde_json::from_str(&trimmed[..=end]) {
                return AgentOutput::Parsed(value);
            }
        }
    }

    AgentOutput::Raw(text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ScriptedProvider, TokenUsage};
    use crate::tools::ToolRegistry;
    use serde_json::json;
    use std::time::Duration;

    fn usage() -> TokenUsage {
        TokenUsage {
            input_tokens: 1000,
            output_tokens: 100,
        }
    }

    fn registry(dir: &std::path::Path) -> ToolRegistry {
        ToolRegistry::builtin(dir, Duration::from_secs(10))
    }

    #[test]
    fn test_parse_fenced_json_block() {
        let text = "Here is my report.\n```json\n{\"passed\": true}\n```\nDone.";
        match parse_structured_output(text) {
            AgentOutput::Parsed(v) => assert_eq!(v["passed"], true),
            other => panic!("expected parsed, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_bare_json_object() {
        match parse_structured_output("{\"summary\": \"ok\"}") {
            AgentOutput::Parsed(v) => assert_eq!(v["summary"], "ok"),
            other => panic!("expected parsed, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_falls_back_to_raw() {
        let text = "I could not produce a structured result.";
        match parse_structured_output(text) {
            AgentOutput::Raw(s) => assert_eq!(s, text),
            other => panic!("expected raw, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_malformed_fence_falls_back() {
        let text = "```json\n{not valid json}\n```";
        assert!(matches!(parse_structured_output(text), AgentOutput::Raw(_)));
    }

    #[tokio::test]
    async fn test_run_executes_tools_then_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![
            ScriptedProvider::tool_turn(
                "write_file",
                json!({"path": "src/out.rs", "content": "pub fn x() {}"}),
                usage(),
            ),
            ScriptedProvider::final_turn("```json\n{\"done\": true}\n```", usage()),
        ]);
        let tools = registry(dir.path());
        let cost = CostModel::default();
        let runner = AgentRunner::new(&provider, &tools, &cost, RunnerConfig::default());

        let result = runner.run(AgentType::Implement, "implement x", None).await;
        assert!(result.success);
        assert_eq!(result.turns_used, 2);
        assert_eq!(result.files_created, vec!["src/out.rs".to_string()]);
        assert!(result.cost_usd > 0.0);
        assert!(result.output.is_parsed());
        assert!(dir.path().join("src/out.rs").exists());
    }

    #[tokio::test]
    async fn test_run_survives_tool_errors() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![
            ScriptedProvider::tool_turn("read_file", json!({"path": "missing.rs"}), usage()),
            ScriptedProvider::final_turn("could not read the file", usage()),
        ]);
        let tools = registry(dir.path());
        let cost = CostModel::default();
        let runner = AgentRunner::new(&provider, &tools, &cost, RunnerConfig::default());

        let result = runner.run(AgentType::Review, "review it", None).await;
        // The tool error was surfaced to the model, not thrown
        assert!(result.success);
        assert!(matches!(result.output, AgentOutput::Raw(_)));
    }

    #[tokio::test]
    async fn test_run_fails_when_provider_errors() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![]);
        let tools = registry(dir.path());
        let cost = CostModel::default();
        let runner = AgentRunner::new(&provider, &tools, &cost, RunnerConfig::default());

        let result = runner.run(AgentType::Verify, "verify", None).await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("model call failed"));
    }

    #[tokio::test]
    async fn test_run_hard_stops_on_persistent_stall() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "fn a() {}").unwrap();

        // Enough identical read calls to trip repetition twice over
        let mut turns = Vec::new();
        for _ in 0..12 {
            turns.push(ScriptedProvider::tool_turn(
                "read_file",
                json!({"path": "a.rs"}),
                usage(),
            ));
        }
        let provider = ScriptedProvider::new(turns);
        let tools = registry(dir.path());
        let cost = CostModel::default();
        let runner = AgentRunner::new(&provider, &tools, &cost, RunnerConfig::default());

        let result = runner.run(AgentType::Implement, "implement", None).await;
        assert!(!result.success);
        let error = result.error.unwrap();
        assert!(error.contains("stalled"), "got: {error}");
        assert!(error.contains("repetition"), "got: {error}");
        // Stopped well before the turn budget
        assert!(result.turns_used < 12);
    }

    #[tokio::test]
    async fn test_run_respects_max_turns() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "fn a() {}").unwrap();

        let mut turns = Vec::new();
        for i in 0..40 {
            // Distinct inputs so stall detection stays quiet
            turns.push(ScriptedProvider::tool_turn(
                "write_file",
                json!({"path": format!("f{i}.rs"), "content": "x"}),
                usage(),
            ));
        }
        let provider = ScriptedProvider::new(turns);
        let tools = registry(dir.path());
        let cost = CostModel::default();
        let config = RunnerConfig {
            max_turns: 5,
            ..Default::default()
        };
        let runner = AgentRunner::new(&provider, &tools, &cost, config);

        let result = runner.run(AgentType::Implement, "implement", None).await;
        assert!(!result.success);
        assert_eq!(result.turns_used, 5);
        assert!(result.error.as_deref().unwrap().contains("5 turns"));
    }

    #[tokio::test]
    async fn test_stall_disabled_runs_to_turn_budget() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "fn a() {}").unwrap();

        let mut turns = Vec::new();
        for _ in 0..8 {
            turns.push(ScriptedProvider::tool_turn(
                "read_file",
                json!({"path": "a.rs"}),
                usage(),
            ));
        }
        let provider = ScriptedProvider::new(turns);
        let tools = registry(dir.path());
        let cost = CostModel::default();
        let config = RunnerConfig {
            max_turns: 8,
            stall: None,
            ..Default::default()
        };
        let runner = AgentRunner::new(&provider, &tools, &cost, config);

        let result = runner.run(AgentType::Review, "review", None).await;
        assert!(!result.success);
        // Exhausted the turn budget instead of stall-stopping
        assert_eq!(result.turns_used, 8);
        assert!(!result.error.unwrap().contains("stalled"));
    }
}
