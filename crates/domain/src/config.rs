//! Request configuration and the model selector grammar.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LlmError, Result};
use crate::tool::{FunctionTool, ProviderTool, ToolChoice};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response format
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A named JSON Schema for constrained generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredOutputFormat {
    pub name: String,
    pub schema: serde_json::Value,
}

impl StructuredOutputFormat {
    pub fn new(name: impl Into<String>, schema: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            schema,
        }
    }
}

/// What shape the model's output should take.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    #[default]
    Text,
    /// Any valid JSON object.
    JsonObject,
    /// JSON constrained by the given schema, enforced natively where the
    /// provider supports it.
    JsonSchema(StructuredOutputFormat),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LlmConfig
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The full configuration for one provider instance.
///
/// Configs are immutable by convention: the builder produces fresh copies and
/// factories clone what they keep, so mutating a builder after a build never
/// alters an already-built model.
#[derive(Debug, Clone, Default)]
pub struct LlmConfig {
    /// API key; adapters fall back to their provider's conventional env var
    /// when absent.
    pub api_key: Option<String>,
    /// Endpoint base URL. Empty means "use the factory default".
    pub base_url: String,
    /// Model identifier. Empty means "use the factory default".
    pub model: String,
    /// Per-request deadline. The tool loop does not reset it between
    /// iterations.
    pub timeout: Option<Duration>,

    // ── Sampling ───────────────────────────────────────────────────
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub stop_sequences: Vec<String>,

    pub system_prompt: Option<String>,
    pub tools: Vec<FunctionTool>,
    pub provider_tools: Vec<ProviderTool>,
    pub tool_choice: Option<ToolChoice>,
    /// End-user identifier forwarded where the wire supports it.
    pub user: Option<String>,
    pub service_tier: Option<String>,
    pub response_format: ResponseFormat,

    /// Transport tunables (custom headers, logging toggles), string-keyed.
    pub transport_options: HashMap<String, serde_json::Value>,
    /// Provider-specific tunables: provider id → string-keyed json.
    pub provider_options: HashMap<String, HashMap<String, serde_json::Value>>,
}

impl LlmConfig {
    /// A config preloaded with a model id.
    pub fn for_model(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    /// The options map for one provider id, if any were set.
    pub fn options_for(&self, provider_id: &str) -> Option<&HashMap<String, serde_json::Value>> {
        self.provider_options.get(provider_id)
    }

    /// One provider option value.
    pub fn provider_option(&self, provider_id: &str, key: &str) -> Option<&serde_json::Value> {
        self.provider_options.get(provider_id)?.get(key)
    }

    /// Fill empty `base_url` / `model` from factory defaults. Fields already
    /// set by the caller always win.
    pub fn with_defaults(mut self, defaults: &LlmConfig) -> Self {
        if self.base_url.is_empty() {
            self.base_url = defaults.base_url.clone();
        }
        if self.model.is_empty() {
            self.model = defaults.model.clone();
        }
        if self.max_tokens.is_none() {
            self.max_tokens = defaults.max_tokens;
        }
        if self.timeout.is_none() {
            self.timeout = defaults.timeout;
        }
        self
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Model selector
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Split a `"provider:model"` selector into `(provider_id, model_id)`.
///
/// Case-sensitive; the split happens on the *first* colon, so model ids may
/// themselves contain colons (`"ollama:llama3:8b"`).
pub fn parse_selector(selector: &str) -> Result<(&str, &str)> {
    match selector.split_once(':') {
        Some((provider, model)) if !provider.is_empty() && !model.is_empty() => {
            Ok((provider, model))
        }
        _ => Err(LlmError::InvalidRequest(format!(
            "invalid model selector '{selector}' (expected 'provider:model')"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_splits_on_first_colon() {
        let (p, m) = parse_selector("ollama:llama3:8b").unwrap();
        assert_eq!(p, "ollama");
        assert_eq!(m, "llama3:8b");
    }

    #[test]
    fn selector_rejects_missing_parts() {
        assert!(parse_selector("openai").is_err());
        assert!(parse_selector(":gpt-4o").is_err());
        assert!(parse_selector("openai:").is_err());
        assert!(parse_selector("").is_err());
    }

    #[test]
    fn selector_is_case_sensitive() {
        let (p, _) = parse_selector("OpenAI:gpt-4o").unwrap();
        assert_eq!(p, "OpenAI"); // no normalization
    }

    #[test]
    fn defaults_fill_only_empty_fields() {
        let defaults = LlmConfig {
            base_url: "https://api.example.com/v1".into(),
            model: "default-model".into(),
            max_tokens: Some(4096),
            ..Default::default()
        };
        let cfg = LlmConfig {
            model: "user-model".into(),
            ..Default::default()
        }
        .with_defaults(&defaults);
        assert_eq!(cfg.base_url, "https://api.example.com/v1");
        assert_eq!(cfg.model, "user-model");
        assert_eq!(cfg.max_tokens, Some(4096));
    }

    #[test]
    fn provider_options_lookup() {
        let mut cfg = LlmConfig::default();
        cfg.provider_options
            .entry("anthropic".into())
            .or_default()
            .insert("thinking_budget".into(), serde_json::json!(2048));
        assert_eq!(
            cfg.provider_option("anthropic", "thinking_budget"),
            Some(&serde_json::json!(2048))
        );
        assert!(cfg.provider_option("openai", "thinking_budget").is_none());
    }
}
