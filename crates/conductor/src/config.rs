//! Engine configuration
//!
//! Defaults, overlaid by an optional `conductor.toml` in the project
//! root, overlaid by `CONDUCTOR_*` environment variables. CLI flags win
//! over everything and are applied by the CLI layer.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Autonomous worker settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub poll_interval_secs: u64,
    pub per_item_budget_usd: f64,
    pub total_budget_usd: f64,
    /// Optional JSON event feed polled as a work source.
    pub http_source_url: Option<String>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            per_item_budget_usd: 2.0,
            total_budget_usd: 20.0,
            http_source_url: None,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Base URL of an OpenAI-compatible chat-completions endpoint.
    pub model_url: String,
    /// Default model id.
    pub model: String,
    /// API key; usually supplied via `CONDUCTOR_API_KEY`.
    pub api_key: Option<String>,
    /// Timeout for individual shell tool invocations.
    pub shell_timeout_secs: u64,
    /// Maximum model turns per phase.
    pub max_turns: u32,
    /// Model context window used for the compaction threshold.
    pub context_limit_tokens: usize,
    pub worker: WorkerSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            shell_timeout_secs: 120,
            max_turns: 30,
            context_limit_tokens: 128_000,
            worker: WorkerSettings::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration for a project directory.
    pub fn load(project_root: &Path) -> Result<Self> {
        let mut config = Self::default();

        let path = project_root.join("conductor.toml");
        if path.exists() {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            config = toml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
        }

        config.apply_env();
        Ok(config)
    }

    /// Environment overrides, applied after file config.
    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("CONDUCTOR_MODEL_URL") {
            self.model_url = url;
        }
        if let Ok(model) = std::env::var("CONDUCTOR_MODEL") {
            self.model = model;
        }
        if let Ok(key) = std::env::var("CONDUCTOR_API_KEY") {
            self.api_key = Some(key);
        }
        if let Some(secs) = env_parse("CONDUCTOR_SHELL_TIMEOUT_SECS") {
            self.shell_timeout_secs = secs;
        }
        if let Some(turns) = env_parse("CONDUCTOR_MAX_TURNS") {
            self.max_turns = turns;
        }
        if let Some(limit) = env_parse("CONDUCTOR_CONTEXT_LIMIT_TOKENS") {
            self.context_limit_tokens = limit;
        }
        if let Some(url) = std::env::var("CONDUCTOR_WORKER_SOURCE_URL").ok().filter(|s| !s.is_empty()) {
            self.worker.http_source_url = Some(url);
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.model, "gpt-4o-mini");
        assert_eq!(config.shell_timeout_secs, 120);
        assert_eq!(config.worker.poll_interval_secs, 30);
    }

    #[test]
    fn test_load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("conductor.toml"),
            r#"
model = "claude-sonnet-4"
max_turns = 12

[worker]
per_item_budget_usd = 0.5
"#,
        )
        .unwrap();

        let config = EngineConfig::load(dir.path()).unwrap();
        assert_eq!(config.model, "claude-sonnet-4");
        assert_eq!(config.max_turns, 12);
        assert!((config.worker.per_item_budget_usd - 0.5).abs() < f64::EPSILON);
        // Unspecified fields keep their defaults
        assert_eq!(config.shell_timeout_secs, 120);
    }

    #[test]
    fn test_malformed_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("conductor.toml"), "model = [broken").unwrap();
        assert!(EngineConfig::load(dir.path()).is_err());
    }
}
