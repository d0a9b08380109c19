//! Stall tracker: detect non-productive agent tool-call patterns
//!
//! Each turn's tool invocations are hashed and remembered. Three patterns
//! count as a stall, checked in fixed priority order: repetition (same
//! turn signature N times), oscillation (two signatures strictly
//! alternating), and idleness (no filesystem activity for too long).
//! Detection injects a nudge; repeated detection hard-stops the phase.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// One tool invocation as seen by the tracker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ToolCallRecord {
    pub tool: String,
    pub input_hash: String,
}

impl ToolCallRecord {
    pub fn new(tool: impl Into<String>, input: &serde_json::Value) -> Self {
        Self {
            tool: tool.into(),
            input_hash: input_hash(input),
        }
    }
}

/// Deterministic hash of a tool input, invariant to object key order.
pub fn input_hash(value: &serde_json::Value) -> String {
    let canonical = canonical_json(value);
    let digest = blake3::hash(canonical.as_bytes());
    digest.to_hex()[..16].to_string()
}

/// Serialize with recursively sorted object keys.
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::Value::String(k.clone()),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        serde_json::Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", parts.join(","))
        }
        other => other.to_string(),
    }
}

/// The detected stall pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StallKind {
    Repetition,
    Oscillation,
    Idle,
}

impl std::fmt::Display for StallKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Repetition => "repetition",
            Self::Oscillation => "oscillation",
            Self::Idle => "idle",
        };
        f.write_str(s)
    }
}

impl StallKind {
    /// Type-specific intervention text injected into the conversation.
    pub fn nudge(&self) -> &'static str {
        match self {
            Self::Repetition => {
                "You have issued the same tool call several times in a row with \
                 identical input. The result will not change. Step back, state what \
                 you learned from the last result, and take a different action."
            }
            Self::Oscillation => {
                "You are alternating between the same two tool calls without making \
                 progress. Stop switching back and forth; pick one concrete next step \
                 that moves the task forward and commit to it."
            }
            Self::Idle => {
                "Many turns have passed without touching any files. If you have \
                 enough information, start making the change now; if something is \
                 blocking you, say exactly what it is."
            }
        }
    }
}

/// Thresholds for the three detectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StallConfig {
    /// Identical consecutive turn signatures that count as repetition.
    pub repetition_window: usize,
    /// Window length for oscillation (even, at least 4).
    pub oscillation_window: usize,
    /// Turns without filesystem activity that count as idle.
    pub idle_threshold: u32,
    /// Interventions before the phase is hard-stopped.
    pub max_interventions: u32,
}

impl Default for StallConfig {
    fn default() -> Self {
        Self {
            repetition_window: 3,
            oscillation_window: 6,
            idle_threshold: 10,
            max_interventions: 2,
        }
    }
}

/// Signature of one turn: the ordered list of (tool, input hash) pairs.
type TurnSignature = Vec<(String, String)>;

/// Tracks turn signatures and filesystem activity for one phase.
#[derive(Debug)]
pub struct StallTracker {
    config: StallConfig,
    history: VecDeque<TurnSignature>,
    turns_since_file_activity: u32,
    interventions: u32,
}

impl StallTracker {
    pub fn new(config: StallConfig) -> Self {
        Self {
            config,
            history: VecDeque::new(),
            turns_since_file_activity: 0,
            interventions: 0,
        }
    }

    /// Record one turn and report a detected stall, if any.
    ///
    /// Detection priority is fixed: repetition, then oscillation, then
    /// idle. Turns with no tool calls only feed the idle counter.
    pub fn record_turn(
        &mut self,
        calls: &[ToolCallRecord],
        touched_filesystem: bool,
    ) -> Option<StallKind> {
        let signature: TurnSignature = calls
            .iter()
            .map(|c| (c.tool.clone(), c.input_hash.clone()))
            .collect();
        self.history.push_back(signature);
        let window = self.config.oscillation_window.max(self.config.repetition_window);
        while self.history.len() > window {
            self.history.pop_front();
        }

        if touched_filesystem {
            self.turns_since_file_activity = 0;
        } else {
            self.turns_since_file_activity += 1;
        }

        let detected = if self.detect_repetition() {
            Some(StallKind::Repetition)
        } else if self.detect_oscillation() {
            Some(StallKind::Oscillation)
        } else if self.turns_since_file_activity >= self.config.idle_threshold {
            Some(StallKind::Idle)
        } else {
            None
        };

        if let Some(kind) = detected {
            debug!(%kind, interventions = self.interventions, "stall detected");
        }
        detected
    }

    fn detect_repetition(&self) -> bool {
        let n = self.config.repetition_window;
        if self.history.len() < n {
            return false;
        }
        let recent: Vec<&TurnSignature> = self.history.iter().rev().take(n).collect();
        let first = recent[0];
        !first.is_empty() && recent.iter().all(|sig| *sig == first)
    }

    fn detect_oscillation(&self) -> bool {
        let w = self.config.oscillation_window;
        if w < 4 || w % 2 != 0 || self.history.len() < w {
            return false;
        }
        let recent: Vec<&TurnSignature> = self
            .history
            .iter()
            .skip(self.history.len() - w)
            .collect();
        let a = recent[0];
        let b = recent[1];
        if a.is_empty() || b.is_empty() || a == b {
            return false;
        }
        recent
            .iter()
            .enumerate()
            .all(|(i, sig)| if i % 2 == 0 { *sig == a } else { *sig == b })
    }

    /// Count an injected intervention and reset the detectors so the agent
    /// gets a fresh window to recover in.
    pub fn record_intervention(&mut self) {
        self.interventions += 1;
        self.history.clear();
        self.turns_since_file_activity = 0;
    }

    /// Whether the intervention budget is exhausted and the phase should
    /// hard-stop instead of spending more turns.
    pub fn should_abort(&self) -> bool {
        self.interventions >= self.config.max_interventions
    }

    pub fn interventions(&self) -> u32 {
        self.interventions
    }
}

impl Default for StallTracker {
    fn default() -> Self {
        Self::new(StallConfig::default())
    }
}
