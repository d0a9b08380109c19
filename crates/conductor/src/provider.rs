//! Model provider contract and the OpenAI-compatible implementation
//!
//! The engine talks to language models through one trait: instructions,
//! history, and tool schemas go in; either a final answer or tool-call
//! requests come out, plus token usage for cost accounting. Everything
//! vendor-specific stays behind this seam.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use harness::context::{Turn, TurnRole};

/// Schema of one tool offered to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's input object.
    pub parameters: serde_json::Value,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub name: String,
    pub input: serde_json::Value,
}

/// Token accounting for one model call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// What the model did with its turn.
#[derive(Debug, Clone)]
pub enum ModelReply {
    /// Final answer text; the loop ends here.
    Final { text: String },
    /// One or more tool invocations to execute before continuing.
    ToolCalls {
        text: Option<String>,
        calls: Vec<ToolCallRequest>,
    },
}

/// A completed model call.
#[derive(Debug, Clone)]
pub struct ModelTurn {
    pub reply: ModelReply,
    pub usage: TokenUsage,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("model API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("malformed model response: {0}")]
    Malformed(String),
}

/// The language-model collaborator contract.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Model identifier, used for cost lookup and logging.
    fn model_id(&self) -> &str;

    /// One completion call: system instructions, conversation history,
    /// and the available tool schemas.
    async fn complete(
        &self,
        system: &str,
        history: &[Turn],
        tools: &[ToolSpec],
    ) -> Result<ModelTurn, ProviderError>;
}

// ---------------------------------------------------------------------------
// Cost model
// ---------------------------------------------------------------------------

/// Per-model USD rates, matched by model-id prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostModel {
    /// (model id prefix, input $/Mtok, output $/Mtok)
    rates: Vec<(String, f64, f64)>,
    /// Fallback rates for unknown models.
    default_rates: (f64, f64),
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            rates: vec![
                ("gpt-4o-mini".into(), 0.15, 0.60),
                ("gpt-4o".into(), 2.50, 10.00),
                ("claude-3-5-haiku".into(), 0.80, 4.00),
                ("claude-sonnet".into(), 3.00, 15.00),
                ("claude-opus".into(), 15.00, 75.00),
            ],
            default_rates: (1.00, 5.00),
        }
    }
}

impl CostModel {
    /// USD cost of one call's token usage.
    pub fn cost_usd(&self, model: &str, usage: TokenUsage) -> f64 {
        let (input_rate, output_rate) = self
            .rates
            .iter()
            .find(|(prefix, _, _)| model.starts_with(prefix.as_str()))
            .map(|(_, i, o)| (*i, *o))
            .unwrap_or(self.default_rates);
        (usage.input_tokens as f64 * input_rate + usage.output_tokens as f64 * output_rate)
            / 1_000_000.0
    }
}

// ---------------------------------------------------------------------------
// OpenAI-compatible HTTP provider
// ---------------------------------------------------------------------------

/// Chat-completions provider for any OpenAI-compatible endpoint.
pub struct OpenAiCompatProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiCompatProvider {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
        }
    }

    fn wire_messages(system: &str, history: &[Turn]) -> Vec<serde_json::Value> {
        let mut messages = vec![json!({"role": "system", "content": system})];
        for turn in history {
            let role = match turn.role {
                TurnRole::User => "user",
                TurnRole::Assistant => "assistant",
            };
            messages.push(json!({"role": role, "content": turn.content}));
        }
        messages
    }

    fn wire_tools(tools: &[ToolSpec]) -> Vec<serde_json::Value> {
        tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect()
    }
}

#[async_trait]
impl ModelProvider for OpenAiCompatProvider {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        system: &str,
        history: &[Turn],
        tools: &[ToolSpec],
    ) -> Result<ModelTurn, ProviderError> {
        let mut body = json!({
            "model": self.model,
            "messages": Self::wire_messages(system, history),
        });
        if !tools.is_empty() {
            body["tools"] = serde_json::Value::Array(Self::wire_tools(tools));
        }

        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let payload: serde_json::Value = response.json().await?;
        let usage = TokenUsage {
            input_tokens: payload["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            output_tokens: payload["usage"]["completion_tokens"].as_u64().unwrap_or(0),
        };

        let message = payload["choices"]
            .get(0)
            .map(|c| &c["message"])
            .ok_or_else(|| ProviderError::Malformed("no choices in response".into()))?;

        let reply = match message.get("tool_calls").and_then(|t| t.as_array()) {
            Some(raw_calls) if !raw_calls.is_empty() => {
                let mut calls = Vec::with_capacity(raw_calls.len());
                for raw in raw_calls {
                    let name = raw["function"]["name"]
                        .as_str()
                        .ok_or_else(|| ProviderError::Malformed("tool call without name".into()))?
                        .to_string();
                    // Arguments arrive as a JSON-encoded string; an
                    // unparseable blob is preserved as raw text so the tool
                    // layer can reject it with a useful message.
                    let args = raw["function"]["arguments"].as_str().unwrap_or("{}");
                    let input = serde_json::from_str(args)
                        .unwrap_or_else(|_| serde_json::Value::String(args.to_string()));
                    calls.push(ToolCallRequest { name, input });
                }
                ModelReply::ToolCalls {
                    text: message["content"].as_str().map(|s| s.to_string()),
                    calls,
                }
            }
            _ => ModelReply::Final {
                text: message["content"].as_str().unwrap_or_default().to_string(),
            },
        };

        debug!(
            model = %self.model,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "model call completed"
        );
        Ok(ModelTurn { reply, usage })
    }
}

// ---------------------------------------------------------------------------
// Scripted provider
// ---------------------------------------------------------------------------

/// Deterministic provider that replays a fixed sequence of turns.
///
/// Drives the engine in tests and dry runs without a model endpoint.
pub struct ScriptedProvider {
    model: String,
    turns: Mutex<VecDeque<ModelTurn>>,
}

impl ScriptedProvider {
    pub fn new(turns: Vec<ModelTurn>) -> Self {
        Self {
            model: "scripted".to_string(),
            turns: Mutex::new(turns.into()),
        }
    }

    /// A turn that ends the loop with final text.
    pub fn final_turn(text: impl Into<String>, usage: TokenUsage) -> ModelTurn {
        ModelTurn {
            reply: ModelReply::Final { text: text.into() },
            usage,
        }
    }

    /// A turn that requests a single tool call.
    pub fn tool_turn(name: &str, input: serde_json::Value, usage: TokenUsage) -> ModelTurn {
        ModelTurn {
            reply: ModelReply::ToolCalls {
                text: None,
                calls: vec![ToolCallRequest {
                    name: name.to_string(),
                    input,
                }],
            },
            usage,
        }
    }

    pub fn remaining(&self) -> usize {
        self.turns.lock().expect("scripted provider lock").len()
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        _system: &str,
        _history: &[Turn],
        _tools: &[ToolSpec],
    ) -> Result<ModelTurn, ProviderError> {
        self.turns
            .lock()
            .expect("scripted provider lock")
            .pop_front()
            .ok_or_else(|| ProviderError::Malformed("scripted provider exhausted".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cost_model_prefix_match() {
        let cost = CostModel::default();
        let usage = TokenUsage {
            input_tokens: 1_000_000,
            output_tokens: 1_000_000,
        };
        // gpt-4o-mini must match before the shorter gpt-4o prefix
        assert!((cost.cost_usd("gpt-4o-mini-2024", usage) - 0.75).abs() < 1e-9);
        assert!((cost.cost_usd("gpt-4o-2024", usage) - 12.50).abs() < 1e-9);
        // Unknown models use the fallback
        assert!((cost.cost_usd("mystery-model", usage) - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_cost_model_scales_with_usage() {
        let cost = CostModel::default();
        let usage = TokenUsage {
            input_tokens: 2_000,
            output_tokens: 500,
        };
        let expected = (2_000.0 * 3.00 + 500.0 * 15.00) / 1_000_000.0;
        assert!((cost.cost_usd("claude-sonnet-4", usage) - expected).abs() < 1e-12);
    }

    #[test]
    fn test_usage_accumulation() {
        let mut total = TokenUsage::default();
        total.add(TokenUsage {
            input_tokens: 100,
            output_tokens: 50,
        });
        total.add(TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
        });
        assert_eq!(total.input_tokens, 110);
        assert_eq!(total.output_tokens, 55);
    }

    #[tokio::test]
    async fn test_scripted_provider_replays_in_order() {
        let provider = ScriptedProvider::new(vec![
            ScriptedProvider::tool_turn(
                "read_file",
                serde_json::json!({"path": "a.rs"}),
                TokenUsage::default(),
            ),
            ScriptedProvider::final_turn("done", TokenUsage::default()),
        ]);

        let first = provider.complete("sys", &[], &[]).await.unwrap();
        assert!(matches!(first.reply, ModelReply::ToolCalls { .. }));

        let second = provider.complete("sys", &[], &[]).await.unwrap();
        match second.reply {
            ModelReply::Final { text } => assert_eq!(text, "done"),
            other => panic!("expected final, got {other:?}"),
        }

        assert!(provider.complete("sys", &[], &[]).await.is_err());
    }

    #[test]
    fn test_wire_messages_shape() {
        let history = vec![Turn::user("hello"), Turn::assistant("hi")];
        let messages = OpenAiCompatProvider::wire_messages("be helpful", &history);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["role"], "user");
        assert_eq!(messages[2]["role"], "assistant");
    }
}
