//! Context manager: tool-output truncation and history compaction
//!
//! Tool results are trimmed with a per-tool strategy before they enter
//! conversation history. Once the estimated token count approaches the
//! model's context limit, older turn-pairs are collapsed into a heuristic
//! summary while the task prompt and the most recent turns survive intact.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Rough chars-per-token ratio used for estimation.
const CHARS_PER_TOKEN: usize = 4;

// ---------------------------------------------------------------------------
// Tool output truncation
// ---------------------------------------------------------------------------

/// How a tool's output should be trimmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolClass {
    /// Shell commands: keep head and tail, errors live at the end.
    Shell,
    /// File reads: cut from the middle to a char budget.
    FileRead,
    /// Search: cap the number of match lines.
    Search,
    /// Anything else: plain char budget, cut from the middle.
    Other,
}

impl ToolClass {
    /// Classify by tool name.
    pub fn of(tool_name: &str) -> Self {
        match tool_name {
            "run_command" => Self::Shell,
            "read_file" => Self::FileRead,
            "search_files" => Self::Search,
            _ => Self::Other,
        }
    }
}

/// Limits for each truncation strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TruncationConfig {
    pub shell_head_lines: usize,
    pub shell_tail_lines: usize,
    pub file_char_budget: usize,
    pub search_max_matches: usize,
    pub other_char_budget: usize,
}

impl Default for TruncationConfig {
    fn default() -> Self {
        Self {
            shell_head_lines: 150,
            shell_tail_lines: 150,
            file_char_budget: 6000,
            search_max_matches: 50,
            other_char_budget: 8000,
        }
    }
}

/// Truncate one tool result according to its class.
pub fn truncate_tool_output(tool_name: &str, output: &str, config: &TruncationConfig) -> String {
    match ToolClass::of(tool_name) {
        ToolClass::Shell => truncate_head_tail(output, config.shell_head_lines, config.shell_tail_lines),
        ToolClass::FileRead => truncate_middle(output, config.file_char_budget),
        ToolClass::Search => truncate_matches(output, config.search_max_matches),
        ToolClass::Other => truncate_middle(output, config.other_char_budget),
    }
}

/// Keep the first and last N lines. Shell errors surface at the tail, so
/// both ends are preserved.
fn truncate_head_tail(output: &str, head: usize, tail: usize) -> String {
    let lines: Vec<&str> = output.lines().collect();
    if lines.len() <= head + tail {
        return output.to_string();
    }
    let omitted = lines.len() - head - tail;
    let mut out = lines[..head].join("\n");
    out.push_str(&format!("\n[... {omitted} lines omitted ...]\n"));
    out.push_str(&lines[lines.len() - tail..].join("\n"));
    out
}

/// Cut from the middle so that both the opening and the end of the content
/// stay visible, fitting a character budget.
fn truncate_middle(output: &str, budget: usize) -> String {
    if output.len() <= budget {
        return output.to_string();
    }
    let half = budget / 2;
    let head_end = floor_char_boundary(output, half);
    let tail_start = ceil_char_boundary(output, output.len() - half);
    let omitted = output.len() - head_end - (output.len() - tail_start);
    format!(
        "{}\n[... {omitted} chars truncated ...]\n{}",
        &output[..head_end],
        &output[tail_start..]
    )
}

/// Cap search output at a match count.
fn truncate_matches(output: &str, max_matches: usize) -> String {
    let lines: Vec<&str> = output.lines().collect();
    if lines.len() <= max_matches {
        return output.to_string();
    }
    let extra = lines.len() - max_matches;
    let mut out = lines[..max_matches].join("\n");
    out.push_str(&format!("\n[... {extra} more matches truncated ...]"));
    out
}

fn floor_char_boundary(s: &str, mut i: usize) -> usize {
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn ceil_char_boundary(s: &str, mut i: usize) -> usize {
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}

// ---------------------------------------------------------------------------
// Conversation turns
// ---------------------------------------------------------------------------

/// Conversation role. Tool results enter history as user turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
}

/// Metadata attached to tool-result turns, feeding the compaction summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnMeta {
    pub tools: Vec<String>,
    pub files: Vec<String>,
    pub failed: bool,
}

/// One entry of conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<TurnMeta>,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
            meta: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
            meta: None,
        }
    }

    pub fn with_meta(mut self, meta: TurnMeta) -> Self {
        self.meta = Some(meta);
        self
    }
}

// ---------------------------------------------------------------------------
// History compaction
// ---------------------------------------------------------------------------

/// Result of a compaction pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionReport {
    pub turns_replaced: usize,
    pub tokens_before: usize,
    pub tokens_after: usize,
}

/// Compacts conversation history once a token budget is approached.
#[derive(Debug, Clone)]
pub struct Compactor {
    /// Model context limit in tokens.
    pub context_limit_tokens: usize,
    /// Fraction of the limit that triggers compaction.
    pub threshold: f64,
    /// Recent turn-pairs that always survive intact.
    pub keep_recent_pairs: usize,
}

impl Default for Compactor {
    fn default() -> Self {
        Self {
            context_limit_tokens: 128_000,
            threshold: 0.6,
            keep_recent_pairs: 3,
        }
    }
}

impl Compactor {
    pub fn new(context_limit_tokens: usize) -> Self {
        Self {
            context_limit_tokens,
            ..Self::default()
        }
    }

    /// Estimated token count of the history.
    pub fn estimated_tokens(turns: &[Turn]) -> usize {
        turns.iter().map(|t| t.content.len() / CHARS_PER_TOKEN).sum()
    }

    /// Whether the history has crossed the compaction threshold.
    pub fn needs_compaction(&self, turns: &[Turn]) -> bool {
        let budget = (self.context_limit_tokens as f64 * self.threshold) as usize;
        Self::estimated_tokens(turns) >= budget
    }

    /// Replace older turn-pairs with a heuristic summary.
    ///
    /// The first turn (the task prompt) and the most recent
    /// `keep_recent_pairs` pairs are always preserved; whatever sits
    /// between them collapses into a single summary turn. Afterwards the
    /// history is renormalized to strict user/assistant alternation.
    ///
    /// Returns `None` when there is nothing to compact.
    pub fn compact(&self, turns: &mut Vec<Turn>) -> Option<CompactionReport> {
        let keep_tail = self.keep_recent_pairs * 2;
        if turns.len() <= 1 + keep_tail + 1 {
            return None;
        }

        let tokens_before = Self::estimated_tokens(turns);
        let tail_start = turns.len() - keep_tail;
        let middle = &turns[1..tail_start];
        let summary = summarize_turns(middle);

        let mut compacted = Vec::with_capacity(2 + keep_tail);
        compacted.push(turns[0].clone());
        compacted.push(Turn::assistant(summary));
        compacted.extend_from_slice(&turns[tail_start..]);
        normalize_alternation(&mut compacted);

        let tokens_after = Self::estimated_tokens(&compacted);
        let report = CompactionReport {
            turns_replaced: middle.len(),
            tokens_before,
            tokens_after,
        };
        debug!(
            replaced = report.turns_replaced,
            before = tokens_before,
            after = tokens_after,
            "history compacted"
        );
        *turns = compacted;
        Some(report)
    }
}

/// Heuristic summary of a turn range: tool usage counts, files touched,
/// and the most recent pass/fail signal.
fn summarize_turns(turns: &[Turn]) -> String {
    let mut tool_counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut files: BTreeSet<String> = BTreeSet::new();
    let mut last_failed: Option<bool> = None;

    for turn in turns {
        if let Some(meta) = &turn.meta {
            for tool in &meta.tools {
                *tool_counts.entry(tool.clone()).or_default() += 1;
            }
            files.extend(meta.files.iter().cloned());
            last_failed = Some(meta.failed);
        }
    }

    let mut summary = format!(
        "[Earlier context compacted: {} turns elided.]",
        turns.len()
    );
    if !tool_counts.is_empty() {
        let tools: Vec<String> = tool_counts
            .iter()
            .map(|(name, count)| format!("{name}x{count}"))
            .collect();
        summary.push_str(&format!(" Tools used: {}.", tools.join(", ")));
    }
    if !files.is_empty() {
        summary.push_str(&format!(
            " Files touched: {}.",
            files.into_iter().collect::<Vec<_>>().join(", ")
        ));
    }
    if let Some(failed) = last_failed {
        summary.push_str(if failed {
            " Last observed result: failing."
        } else {
            " Last observed result: passing."
        });
    }
    summary
}

/// Merge adjacent same-role turns so the history strictly alternates.
fn normalize_alternation(turns: &mut Vec<Turn>) {
    let mut merged: Vec<Turn> = Vec::with_capacity(turns.len());
    for turn in turns.drain(..) {
        match merged.last_mut() {
            Some(prev) if prev.role == turn.role => {
                prev.content.push_str("\n\n");
                prev.content.push_str(&turn.content);
                if prev.meta.is_none() {
                    prev.meta = turn.meta;
                }
            }
            _ => merged.push(turn),
        }
    }
    *turns = merged;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_truncation_preserves_error_tail() {
        let mut lines: Vec<String> = (0..400).map(|i| format!("line {i}")).collect();
        lines.push("error[E0308]: mismatched types".to_string());
        let output = lines.join("\n");

        let cfg = TruncationConfig::default();
        let truncated = truncate_tool_output("run_command", &output, &cfg);

        assert!(truncated.contains("line 0"));
        assert!(truncated.contains("error[E0308]"));
        assert!(truncated.contains("lines omitted"));
        assert!(truncated.len() < output.len());
    }

    #[test]
    fn test_shell_short_output_untouched() {
        let cfg = TruncationConfig::default();
        let out = truncate_tool_output("run_command", "ok\n", &cfg);
        assert_eq!(out, "ok\n");
    }

    #[test]
    fn test_file_truncation_cuts_middle() {
        let content = format!("HEAD{}TAIL", "x".repeat(20_000));
        let cfg = TruncationConfig::default();
        let truncated = truncate_tool_output("read_file", &content, &cfg);

        assert!(truncated.starts_with("HEAD"));
        assert!(truncated.ends_with("TAIL"));
        assert!(truncated.contains("chars truncated"));
        assert!(truncated.len() < content.len());
    }

    #[test]
    fn test_search_truncation_caps_matches() {
        let output: String = (0..120)
            .map(|i| format!("src/file{i}.rs:1: match"))
            .collect::<Vec<_>>()
            .join("\n");
        let cfg = TruncationConfig::default();
        let truncated = truncate_tool_output("search_files", &output, &cfg);

        assert_eq!(truncated.lines().count(), cfg.search_max_matches + 1);
        assert!(truncated.contains("70 more matches truncated"));
    }

    #[test]
    fn test_middle_truncation_respects_char_boundaries() {
        let content = "é".repeat(10_000);
        let truncated = truncate_middle(&content, 100);
        assert!(truncated.contains("chars truncated"));
    }

    fn tool_turn(i: usize) -> Turn {
        Turn::user(format!("[read_file] content of file {i}: {}", "x".repeat(400))).with_meta(
            TurnMeta {
                tools: vec!["read_file".into()],
                files: vec![format!("src/f{i}.rs")],
                failed: i % 2 == 0,
            },
        )
    }

    fn long_history(pairs: usize) -> Vec<Turn> {
        let mut turns = vec![Turn::user("Task: implement the widget")];
        for i in 0..pairs {
            turns.push(Turn::assistant(format!("calling read_file on f{i}")));
            turns.push(tool_turn(i));
        }
        turns
    }

    #[test]
    fn test_needs_compaction_threshold() {
        let compactor = Compactor::new(1000); // threshold at 600 tokens
        let small = long_history(1);
        assert!(!compactor.needs_compaction(&small));

        let big = long_history(20);
        assert!(compactor.needs_compaction(&big));
    }

    #[test]
    fn test_compaction_preserves_prompt_and_recent_pairs() {
        let compactor = Compactor::new(1000);
        let mut turns = long_history(10);
        let original_len = turns.len();
        let last = turns.last().unwrap().content.clone();

        let report = compactor.compact(&mut turns).unwrap();
        assert!(report.turns_replaced > 0);
        assert!(report.tokens_after < report.tokens_before);
        assert!(turns.len() < original_len);

        // Task prompt survives verbatim at the front
        assert_eq!(turns[0].content, "Task: implement the widget");
        // Most recent turn survives verbatim at the back
        assert_eq!(turns.last().unwrap().content, last);
        // Summary mentions the tools and a pass/fail signal
        let summary = &turns[1].content;
        assert!(summary.contains("read_file"));
        assert!(summary.contains("Last observed result"));
    }

    #[test]
    fn test_compaction_restores_strict_alternation() {
        let compactor = Compactor::new(1000);
        let mut turns = long_history(10);
        compactor.compact(&mut turns).unwrap();

        for pair in turns.windows(2) {
            assert_ne!(pair[0].role, pair[1].role, "roles must alternate");
        }
        assert_eq!(turns[0].role, TurnRole::User);
    }

    #[test]
    fn test_compaction_noop_on_short_history() {
        let compactor = Compactor::new(1000);
        let mut turns = long_history(3); // 1 + 6 turns, nothing to elide
        assert!(compactor.compact(&mut turns).is_none());
    }

    #[test]
    fn test_summary_counts_tools() {
        let turns: Vec<Turn> = (0..4).map(tool_turn).collect();
        let summary = summarize_turns(&turns);
        assert!(summary.contains("read_filex4"));
        assert!(summary.contains("src/f0.rs"));
    }
}
