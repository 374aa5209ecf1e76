//! OpenAI-compatible adapter.
//!
//! One adapter covers every endpoint speaking the chat-completions contract:
//! OpenAI itself, DeepSeek, Groq, xAI, Phind, and arbitrary self-hosted
//! gateways. Per-provider differences (base url, defaults, capability set,
//! auth env var) live in a [`Flavor`] table rather than in code.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use chorus_domain::capability::CapabilityKind;
use chorus_domain::config::{LlmConfig, ResponseFormat};
use chorus_domain::error::{LlmError, Result, Warning};
use chorus_domain::message::{ContentPart, ModelMessage, Role, ToolCall};
use chorus_domain::stream::{ChatResponse, EventStream, StreamEvent, Usage};
use chorus_domain::tool::{FunctionTool, ProviderTool, ToolChoice, ToolChoiceMode};

use crate::convert::{data_url, encode_base64, unsupported_part};
use crate::factory::{validate_sampling, ProviderFactory};
use crate::sse::{event_stream, Framing};
use crate::traits::{
    AudioTranslationCapability, ChatCapability, ChatRequest, CompletionCapability,
    CompletionRequest, CompletionResponse, EmbeddingCapability, GeneratedImage,
    ImageGenerationCapability, ImageRequest, ImageResponse, ModerationCapability,
    ModerationResult, Provider, SpeechToTextCapability, SttRequest, SttResponse,
    TextToSpeechCapability, TtsRequest, TtsResponse, WordTiming,
};
use crate::util::{from_reqwest, resolve_api_key, send_checked, send_json};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Flavors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-provider parameters for the shared adapter.
#[derive(Debug)]
pub struct Flavor {
    pub provider_id: &'static str,
    pub display_name: &'static str,
    pub base_url: &'static str,
    pub chat_model: &'static str,
    pub embedding_model: &'static str,
    pub tts_model: &'static str,
    pub tts_voice: &'static str,
    pub stt_model: &'static str,
    pub image_model: &'static str,
    /// Path of the FIM completions endpoint, relative to the base url.
    pub completion_path: &'static str,
    pub api_key_env: &'static str,
    /// Local/self-hosted endpoints may run without credentials.
    pub requires_api_key: bool,
    pub capabilities: &'static [CapabilityKind],
}

use CapabilityKind as C;

pub static OPENAI: Flavor = Flavor {
    provider_id: "openai",
    display_name: "OpenAI",
    base_url: "https://api.openai.com/v1",
    chat_model: "gpt-4o",
    embedding_model: "text-embedding-3-small",
    tts_model: "tts-1",
    tts_voice: "alloy",
    stt_model: "whisper-1",
    image_model: "dall-e-3",
    completion_path: "/completions",
    api_key_env: "OPENAI_API_KEY",
    requires_api_key: true,
    capabilities: &[
        C::Chat,
        C::Streaming,
        C::ToolCalling,
        C::StructuredOutput,
        C::Vision,
        C::Embedding,
        C::TextToSpeech,
        C::SpeechToText,
        C::AudioTranslation,
        C::Moderation,
        C::ImageGeneration,
        C::Completion,
    ],
};

pub static DEEPSEEK: Flavor = Flavor {
    provider_id: "deepseek",
    display_name: "DeepSeek",
    base_url: "https://api.deepseek.com/v1",
    chat_model: "deepseek-chat",
    embedding_model: "",
    tts_model: "",
    tts_voice: "",
    stt_model: "",
    image_model: "",
    // FIM sits on the beta surface.
    completion_path: "/beta/completions",
    api_key_env: "DEEPSEEK_API_KEY",
    requires_api_key: true,
    capabilities: &[
        C::Chat,
        C::Streaming,
        C::ToolCalling,
        C::Reasoning,
        C::Completion,
    ],
};

pub static GROQ: Flavor = Flavor {
    provider_id: "groq",
    display_name: "Groq",
    base_url: "https://api.groq.com/openai/v1",
    chat_model: "llama-3.3-70b-versatile",
    embedding_model: "",
    tts_model: "",
    tts_voice: "",
    stt_model: "whisper-large-v3",
    image_model: "",
    completion_path: "/completions",
    api_key_env: "GROQ_API_KEY",
    requires_api_key: true,
    capabilities: &[
        C::Chat,
        C::Streaming,
        C::ToolCalling,
        C::SpeechToText,
        C::AudioTranslation,
    ],
};

pub static XAI: Flavor = Flavor {
    provider_id: "xai",
    display_name: "xAI",
    base_url: "https://api.x.ai/v1",
    chat_model: "grok-3",
    embedding_model: "",
    tts_model: "",
    tts_voice: "",
    stt_model: "",
    image_model: "grok-2-image",
    completion_path: "/completions",
    api_key_env: "XAI_API_KEY",
    requires_api_key: true,
    capabilities: &[
        C::Chat,
        C::Streaming,
        C::ToolCalling,
        C::StructuredOutput,
        C::Vision,
        C::ImageGeneration,
    ],
};

pub static PHIND: Flavor = Flavor {
    provider_id: "phind",
    display_name: "Phind",
    base_url: "https://api.phind.com/v1",
    chat_model: "Phind-70B",
    embedding_model: "",
    tts_model: "",
    tts_voice: "",
    stt_model: "",
    image_model: "",
    completion_path: "/completions",
    api_key_env: "PHIND_API_KEY",
    requires_api_key: true,
    capabilities: &[C::Chat, C::Streaming],
};

/// Generic flavor for self-hosted OpenAI-compatible gateways (vLLM,
/// LM Studio, LiteLLM, ...). Requires an explicit base url and model.
pub static COMPATIBLE: Flavor = Flavor {
    provider_id: "openai-compatible",
    display_name: "OpenAI-compatible",
    base_url: "",
    chat_model: "",
    embedding_model: "",
    tts_model: "",
    tts_voice: "",
    stt_model: "",
    image_model: "",
    completion_path: "/completions",
    api_key_env: "OPENAI_COMPAT_API_KEY",
    requires_api_key: false,
    capabilities: &[
        C::Chat,
        C::Streaming,
        C::ToolCalling,
        C::Embedding,
        C::Completion,
    ],
};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Factory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct OpenAiCompatFactory {
    flavor: &'static Flavor,
}

impl OpenAiCompatFactory {
    pub fn new(flavor: &'static Flavor) -> Self {
        Self { flavor }
    }
}

impl ProviderFactory for OpenAiCompatFactory {
    fn provider_id(&self) -> &'static str {
        self.flavor.provider_id
    }

    fn display_name(&self) -> &'static str {
        self.flavor.display_name
    }

    fn capabilities(&self) -> &'static [CapabilityKind] {
        self.flavor.capabilities
    }

    fn defaults(&self) -> LlmConfig {
        LlmConfig {
            base_url: self.flavor.base_url.to_string(),
            model: self.flavor.chat_model.to_string(),
            ..Default::default()
        }
    }

    fn validate(&self, config: &LlmConfig) -> Result<()> {
        if self.flavor.base_url.is_empty() && config.base_url.is_empty() {
            return Err(LlmError::InvalidRequest(format!(
                "provider '{}' needs an explicit base_url",
                self.flavor.provider_id
            )));
        }
        if self.flavor.chat_model.is_empty() && config.model.is_empty() {
            return Err(LlmError::InvalidRequest(format!(
                "provider '{}' needs an explicit model",
                self.flavor.provider_id
            )));
        }
        validate_sampling(config)
    }

    fn create(&self, config: &LlmConfig) -> Result<Arc<dyn Provider>> {
        Ok(Arc::new(OpenAiCompatProvider::new(self.flavor, config)?))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A configured provider instance speaking the OpenAI wire format.
pub struct OpenAiCompatProvider {
    flavor: &'static Flavor,
    id: String,
    base_url: String,
    api_key: Option<String>,
    /// Chat model after default merging.
    model: String,
    /// Embedding model: explicit config wins, flavor default otherwise.
    embedding_model: String,
    config: LlmConfig,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(flavor: &'static Flavor, config: &LlmConfig) -> Result<Self> {
        let api_key = if flavor.requires_api_key {
            Some(resolve_api_key(config, flavor.api_key_env, flavor.provider_id)?)
        } else {
            config
                .api_key
                .clone()
                .or_else(|| std::env::var(flavor.api_key_env).ok())
        };

        // Merge before storing so empty fields pick up flavor defaults; keep
        // the raw model around to tell "explicit" from "defaulted".
        let explicit_model = !config.model.is_empty();
        let factory_defaults = LlmConfig {
            base_url: flavor.base_url.to_string(),
            model: flavor.chat_model.to_string(),
            ..Default::default()
        };
        let config = config.clone().with_defaults(&factory_defaults);

        let embedding_model = if explicit_model {
            config.model.clone()
        } else {
            flavor.embedding_model.to_string()
        };

        let client = reqwest::Client::builder().build().map_err(from_reqwest)?;

        Ok(Self {
            flavor,
            id: flavor.provider_id.to_string(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            embedding_model,
            config,
            client,
        })
    }

    // ── Internal: authenticated request builders ───────────────────

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let mut rb = self.client.post(format!("{}{}", self.base_url, path));
        if let Some(ref key) = self.api_key {
            rb = rb.header("Authorization", format!("Bearer {key}"));
        }
        if let Some(Value::Object(headers)) = self.config.transport_options.get("headers") {
            for (name, value) in headers {
                if let Some(v) = value.as_str() {
                    rb = rb.header(name.as_str(), v);
                }
            }
        }
        if let Some(t) = self.config.timeout {
            rb = rb.timeout(t);
        }
        rb
    }

    // ── Internal: build the chat body ──────────────────────────────

    fn build_chat_body(&self, req: &ChatRequest, stream: bool) -> (Value, Vec<Warning>) {
        let mut warnings = Vec::new();
        let messages = map_messages(
            &self.id,
            self.config.system_prompt.as_deref(),
            &req.messages,
            &mut warnings,
        );

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": stream,
        });

        let tools = effective_tools(&req.tools, &self.config.tools);
        let mut tool_arr: Vec<Value> = tools.iter().map(tool_to_wire).collect();
        for pt in &req.provider_tools {
            if pt.namespace() == self.id {
                tool_arr.push(provider_tool_to_wire(pt));
            }
        }
        if !tool_arr.is_empty() {
            body["tools"] = Value::Array(tool_arr);
        }
        if let Some(ref choice) = req.tool_choice {
            body["tool_choice"] = tool_choice_to_wire(choice);
            if choice.disable_parallel {
                body["parallel_tool_calls"] = Value::Bool(false);
            }
        }

        match &req.response_format {
            ResponseFormat::Text => {}
            ResponseFormat::JsonObject => {
                body["response_format"] = serde_json::json!({"type": "json_object"});
            }
            ResponseFormat::JsonSchema(format) => {
                body["response_format"] = serde_json::json!({
                    "type": "json_schema",
                    "json_schema": {
                        "name": format.name,
                        "schema": format.schema,
                        "strict": true,
                    }
                });
            }
        }

        if let Some(t) = self.config.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        if let Some(m) = self.config.max_tokens {
            body["max_tokens"] = serde_json::json!(m);
        }
        if let Some(p) = self.config.top_p {
            body["top_p"] = serde_json::json!(p);
        }
        if !self.config.stop_sequences.is_empty() {
            body["stop"] = serde_json::json!(self.config.stop_sequences);
        }
        if let Some(ref user) = self.config.user {
            body["user"] = Value::String(user.clone());
        }
        if let Some(ref tier) = self.config.service_tier {
            body["service_tier"] = Value::String(tier.clone());
        }
        if stream {
            body["stream_options"] = serde_json::json!({"include_usage": true});
        }

        // Provider-specific tunables pass straight through.
        if let Some(options) = self.config.options_for(&self.id) {
            for (k, v) in options {
                body[k.as_str()] = v.clone();
            }
        }

        (body, warnings)
    }
}

fn effective_tools<'a>(request: &'a [FunctionTool], configured: &'a [FunctionTool]) -> &'a [FunctionTool] {
    if request.is_empty() {
        configured
    } else {
        request
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message serialization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn map_messages(
    provider_id: &str,
    system_prompt: Option<&str>,
    messages: &[ModelMessage],
    warnings: &mut Vec<Warning>,
) -> Vec<Value> {
    let mut out = Vec::with_capacity(messages.len() + 1);

    if let Some(prompt) = system_prompt {
        if !prompt.is_empty() {
            out.push(serde_json::json!({"role": "system", "content": prompt}));
        }
    }

    for msg in messages {
        match msg.role {
            Role::System => {
                out.push(serde_json::json!({
                    "role": "system",
                    "content": msg.joined_text(),
                }));
            }
            Role::Assistant => out.push(assistant_to_wire(provider_id, msg)),
            Role::User => user_to_wire(provider_id, msg, warnings, &mut out),
        }
    }
    out
}

fn assistant_to_wire(provider_id: &str, msg: &ModelMessage) -> Value {
    let mut text_parts: Vec<&str> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    for part in &msg.parts {
        match part {
            ContentPart::Text { text } => text_parts.push(text),
            ContentPart::ToolCall(call) => {
                // Arguments pass through as the verbatim string.
                tool_calls.push(serde_json::json!({
                    "id": call.id,
                    "type": "function",
                    "function": {
                        "name": call.name,
                        "arguments": call.arguments,
                    }
                }));
            }
            _ => {}
        }
    }

    let mut obj = serde_json::json!({"role": "assistant"});
    obj["content"] = if text_parts.is_empty() {
        Value::Null
    } else {
        Value::String(text_parts.join("\n"))
    };
    if !tool_calls.is_empty() {
        obj["tool_calls"] = Value::Array(tool_calls);
    }
    apply_extensions(provider_id, msg, obj)
}

/// User messages fan out: tool-result parts become `role:"tool"` wire
/// messages (the provider's tool-result channel), everything else folds into
/// one user message with a content array.
fn user_to_wire(
    provider_id: &str,
    msg: &ModelMessage,
    warnings: &mut Vec<Warning>,
    out: &mut Vec<Value>,
) {
    let mut content: Vec<Value> = Vec::new();

    for part in &msg.parts {
        match part {
            ContentPart::ToolResult(result) => {
                out.push(serde_json::json!({
                    "role": "tool",
                    "tool_call_id": result.call_id,
                    "content": result.payload_text(),
                }));
            }
            ContentPart::Text { text } => {
                content.push(serde_json::json!({"type": "text", "text": text}));
            }
            ContentPart::ImageInline { data, mime } => {
                content.push(serde_json::json!({
                    "type": "image_url",
                    "image_url": {"url": data_url(mime, data)},
                }));
            }
            ContentPart::ImageUrl { url } => {
                content.push(serde_json::json!({
                    "type": "image_url",
                    "image_url": {"url": url},
                }));
            }
            ContentPart::FileInline { data, mime, filename } => {
                content.push(serde_json::json!({
                    "type": "file",
                    "file": {
                        "filename": filename.as_deref().unwrap_or("file"),
                        "file_data": data_url(mime, data),
                    }
                }));
            }
            ContentPart::Audio {
                source: chorus_domain::message::MediaSource::Inline(data),
                mime,
            } => {
                let format = mime.strip_prefix("audio/").unwrap_or("wav");
                content.push(serde_json::json!({
                    "type": "input_audio",
                    "input_audio": {"data": encode_base64(data), "format": format},
                }));
            }
            other => {
                let (placeholder, warning) = unsupported_part(provider_id, other);
                warnings.push(warning);
                content.push(serde_json::json!({"type": "text", "text": placeholder}));
            }
        }
    }

    if content.is_empty() {
        return;
    }

    // A lone text part stays a plain string for wire compatibility.
    let content = if content.len() == 1 && content[0]["type"] == "text" {
        content[0]["text"].clone()
    } else {
        Value::Array(content)
    };

    let mut obj = serde_json::json!({"role": "user", "content": content});
    if let Some(ref name) = msg.name {
        obj["name"] = Value::String(name.clone());
    }
    out.push(apply_extensions(provider_id, msg, obj));
}

/// Merge this provider's `provider_extensions` entry into the wire message.
fn apply_extensions(provider_id: &str, msg: &ModelMessage, mut obj: Value) -> Value {
    if let Some(Value::Object(ext)) = msg.provider_extensions.get(provider_id) {
        if let Value::Object(ref mut map) = obj {
            for (k, v) in ext {
                map.insert(k.clone(), v.clone());
            }
        }
    }
    obj
}

fn tool_to_wire(tool: &FunctionTool) -> Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

fn provider_tool_to_wire(tool: &ProviderTool) -> Value {
    let mut obj = serde_json::json!({"type": tool.tool_name()});
    if let (Value::Object(ref mut map), Value::Object(options)) = (&mut obj, &tool.options) {
        for (k, v) in options {
            map.insert(k.clone(), v.clone());
        }
    }
    obj
}

fn tool_choice_to_wire(choice: &ToolChoice) -> Value {
    match &choice.mode {
        ToolChoiceMode::Auto => Value::String("auto".into()),
        ToolChoiceMode::None => Value::String("none".into()),
        ToolChoiceMode::Required => Value::String("required".into()),
        ToolChoiceMode::Specific(name) => serde_json::json!({
            "type": "function",
            "function": {"name": name},
        }),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response deserialization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_chat_response(provider_id: &str, body: &Value) -> Result<ChatResponse> {
    let message = body
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
        .and_then(|c| c.get("message"))
        .ok_or_else(|| {
            LlmError::ResponseFormat(format!("{provider_id}: no choices[0].message in response"))
        })?;

    let text = message
        .get("content")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(String::from);
    let thinking = message
        .get("reasoning_content")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(String::from);

    let tool_calls = parse_tool_calls(message);
    let usage = body.get("usage").and_then(parse_usage);

    let mut provider_metadata = HashMap::new();
    if let Some(id) = body.get("id").and_then(|v| v.as_str()) {
        provider_metadata.insert(
            provider_id.to_string(),
            serde_json::json!({"response_id": id}),
        );
    }

    Ok(ChatResponse {
        text,
        thinking,
        tool_calls,
        usage,
        warnings: Vec::new(),
        provider_metadata,
    })
}

fn parse_tool_calls(message: &Value) -> Vec<ToolCall> {
    let arr = match message.get("tool_calls").and_then(|v| v.as_array()) {
        Some(a) => a,
        None => return Vec::new(),
    };
    arr.iter()
        .filter_map(|tc| {
            let id = tc.get("id")?.as_str()?.to_string();
            let func = tc.get("function")?;
            let name = func.get("name")?.as_str()?.to_string();
            let arguments = func
                .get("arguments")
                .and_then(|v| v.as_str())
                .unwrap_or("{}")
                .to_string();
            Some(ToolCall { id, name, arguments })
        })
        .collect()
}

fn parse_usage(v: &Value) -> Option<Usage> {
    let prompt = v.get("prompt_tokens").and_then(Value::as_u64);
    let completion = v.get("completion_tokens").and_then(Value::as_u64);
    let total = v.get("total_tokens").and_then(Value::as_u64);
    let reasoning = v
        .get("completion_tokens_details")
        .and_then(|d| d.get("reasoning_tokens"))
        .and_then(Value::as_u64);
    if prompt.is_none() && completion.is_none() && total.is_none() {
        return None;
    }
    Some(Usage {
        prompt_tokens: prompt.map(|n| n as u32),
        completion_tokens: completion.map(|n| n as u32),
        total_tokens: total.map(|n| n as u32),
        reasoning_tokens: reasoning.map(|n| n as u32),
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming state machine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Per-stream assembly state: open text/reasoning segments and partial tool
/// calls keyed by the wire's `index` field.
struct StreamState {
    provider_id: String,
    text: String,
    text_open: bool,
    reasoning: String,
    reasoning_open: bool,
    calls: Vec<PartialCall>,
    call_index: HashMap<u64, usize>,
    usage: Option<Usage>,
    response_id: Option<String>,
    finished: bool,
}

impl StreamState {
    fn new(provider_id: String) -> Self {
        Self {
            provider_id,
            text: String::new(),
            text_open: false,
            reasoning: String::new(),
            reasoning_open: false,
            calls: Vec::new(),
            call_index: HashMap::new(),
            usage: None,
            response_id: None,
            finished: false,
        }
    }

    /// Close open segments in bracketing order, then emit `Finish`.
    fn finalize(&mut self) -> Vec<Result<StreamEvent>> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;

        let mut events: Vec<Result<StreamEvent>> = Vec::new();
        if self.reasoning_open {
            events.push(Ok(StreamEvent::ReasoningEnd {
                text: self.reasoning.clone(),
            }));
            self.reasoning_open = false;
        }
        if self.text_open {
            events.push(Ok(StreamEvent::TextEnd {
                text: self.text.clone(),
            }));
            self.text_open = false;
        }

        let tool_calls: Vec<ToolCall> = self
            .calls
            .drain(..)
            .map(|c| ToolCall {
                id: c.id,
                name: c.name,
                arguments: c.arguments,
            })
            .collect();
        for call in &tool_calls {
            events.push(Ok(StreamEvent::ToolCallEnd { call: call.clone() }));
        }

        let mut provider_metadata = HashMap::new();
        if let Some(ref id) = self.response_id {
            provider_metadata.insert(
                self.provider_id.clone(),
                serde_json::json!({"response_id": id}),
            );
        }

        events.push(Ok(StreamEvent::Finish(ChatResponse {
            text: (!self.text.is_empty()).then(|| self.text.clone()),
            thinking: (!self.reasoning.is_empty()).then(|| self.reasoning.clone()),
            tool_calls,
            usage: self.usage,
            warnings: Vec::new(),
            provider_metadata,
        })));
        events
    }
}

fn parse_stream_payload(data: &str, state: &mut StreamState) -> Vec<Result<StreamEvent>> {
    if state.finished {
        return Vec::new();
    }
    if data.trim() == "[DONE]" {
        return state.finalize();
    }

    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => return vec![Err(LlmError::Json(e))],
    };

    if state.response_id.is_none() {
        if let Some(id) = v.get("id").and_then(Value::as_str) {
            state.response_id = Some(id.to_string());
        }
    }
    if let Some(usage) = v.get("usage").and_then(parse_usage) {
        state.usage = Some(usage);
    }

    let delta = match v
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
        .and_then(|c| c.get("delta"))
    {
        Some(d) => d,
        None => return Vec::new(), // usage-only chunk
    };

    let mut events: Vec<Result<StreamEvent>> = Vec::new();

    if let Some(text) = delta.get("reasoning_content").and_then(Value::as_str) {
        if !text.is_empty() {
            if !state.reasoning_open {
                state.reasoning_open = true;
                events.push(Ok(StreamEvent::ReasoningStart));
            }
            state.reasoning.push_str(text);
            events.push(Ok(StreamEvent::ReasoningDelta {
                delta: text.to_string(),
            }));
        }
    }

    if let Some(text) = delta.get("content").and_then(Value::as_str) {
        if !text.is_empty() {
            // Reasoning always precedes content; close the segment on switch.
            if state.reasoning_open {
                state.reasoning_open = false;
                events.push(Ok(StreamEvent::ReasoningEnd {
                    text: state.reasoning.clone(),
                }));
            }
            if !state.text_open {
                state.text_open = true;
                events.push(Ok(StreamEvent::TextStart));
            }
            state.text.push_str(text);
            events.push(Ok(StreamEvent::TextDelta {
                delta: text.to_string(),
            }));
        }
    }

    if let Some(tc_arr) = delta.get("tool_calls").and_then(Value::as_array) {
        for tc in tc_arr {
            let index = tc.get("index").and_then(Value::as_u64).unwrap_or(0);

            if let Some(id) = tc.get("id").and_then(Value::as_str) {
                let name = tc
                    .get("function")
                    .and_then(|f| f.get("name"))
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                events.push(Ok(StreamEvent::ToolCallStart {
                    id: id.to_string(),
                    name: name.clone(),
                }));
                state.calls.push(PartialCall {
                    id: id.to_string(),
                    name,
                    arguments: String::new(),
                });
                state.call_index.insert(index, state.calls.len() - 1);
            }

            if let Some(args) = tc
                .get("function")
                .and_then(|f| f.get("arguments"))
                .and_then(Value::as_str)
            {
                if !args.is_empty() {
                    if let Some(&slot) = state.call_index.get(&index) {
                        let call = &mut state.calls[slot];
                        call.arguments.push_str(args);
                        events.push(Ok(StreamEvent::ToolCallDelta {
                            id: call.id.clone(),
                            delta: args.to_string(),
                        }));
                    }
                }
            }
        }
    }

    events
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Capability implementations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl ChatCapability for OpenAiCompatProvider {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let (body, warnings) = self.build_chat_body(req, false);

        tracing::debug!(provider = %self.id, model = %self.model, "chat request");

        let json = send_json(&self.id, self.post("/chat/completions").json(&body), &req.cancel).await?;
        let mut response = parse_chat_response(&self.id, &json)?;
        response.warnings.extend(warnings);
        Ok(response)
    }

    async fn chat_stream(&self, req: &ChatRequest) -> Result<EventStream> {
        let (body, warnings) = self.build_chat_body(req, true);
        if !warnings.is_empty() {
            tracing::warn!(provider = %self.id, count = warnings.len(), "request parts dropped");
        }

        tracing::debug!(provider = %self.id, model = %self.model, "chat stream request");

        let response =
            send_checked(&self.id, self.post("/chat/completions").json(&body), &req.cancel).await?;

        let mut state = StreamState::new(self.id.clone());
        Ok(event_stream(response, Framing::Sse, req.cancel.clone(), move |data| {
            parse_stream_payload(data, &mut state)
        }))
    }
}

#[async_trait::async_trait]
impl EmbeddingCapability for OpenAiCompatProvider {
    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let cancel = chorus_domain::cancel::CancellationToken::new();
        let body = serde_json::json!({
            "model": self.embedding_model,
            "input": inputs,
        });
        let json = send_json(&self.id, self.post("/embeddings").json(&body), &cancel).await?;

        let data = json
            .get("data")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                LlmError::ResponseFormat(format!("{}: missing 'data' in embeddings response", self.id))
            })?;

        let mut vectors = Vec::with_capacity(data.len());
        for item in data {
            let embedding = item
                .get("embedding")
                .and_then(Value::as_array)
                .ok_or_else(|| {
                    LlmError::ResponseFormat(format!("{}: embedding row is not an array", self.id))
                })?;
            vectors.push(
                embedding
                    .iter()
                    .filter_map(|v| v.as_f64().map(|f| f as f32))
                    .collect(),
            );
        }
        Ok(vectors)
    }
}

#[async_trait::async_trait]
impl ModerationCapability for OpenAiCompatProvider {
    async fn moderate(&self, input: &str) -> Result<ModerationResult> {
        let cancel = chorus_domain::cancel::CancellationToken::new();
        let body = serde_json::json!({"input": input});
        let json = send_json(&self.id, self.post("/moderations").json(&body), &cancel).await?;

        let result = json
            .get("results")
            .and_then(Value::as_array)
            .and_then(|a| a.first())
            .ok_or_else(|| {
                LlmError::ResponseFormat(format!("{}: missing results[0] in moderation response", self.id))
            })?;

        let flagged = result.get("flagged").and_then(Value::as_bool).unwrap_or(false);
        let categories = result
            .get("categories")
            .and_then(Value::as_object)
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_bool().map(|b| (k.clone(), b)))
                    .collect()
            })
            .unwrap_or_default();
        let scores = result
            .get("category_scores")
            .and_then(Value::as_object)
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_f64().map(|f| (k.clone(), f)))
                    .collect()
            })
            .unwrap_or_default();

        Ok(ModerationResult {
            flagged,
            categories,
            scores,
        })
    }
}

#[async_trait::async_trait]
impl ImageGenerationCapability for OpenAiCompatProvider {
    async fn generate_image(&self, req: &ImageRequest) -> Result<ImageResponse> {
        let cancel = chorus_domain::cancel::CancellationToken::new();
        let mut body = serde_json::json!({
            "model": self.flavor.image_model,
            "prompt": req.prompt,
            "n": req.count.unwrap_or(1),
            "response_format": "b64_json",
        });
        if let Some(ref size) = req.size {
            body["size"] = Value::String(size.clone());
        }
        let json = send_json(&self.id, self.post("/images/generations").json(&body), &cancel).await?;

        let data = json.get("data").and_then(Value::as_array).ok_or_else(|| {
            LlmError::ResponseFormat(format!("{}: missing 'data' in image response", self.id))
        })?;

        let mut images = Vec::with_capacity(data.len());
        for item in data {
            if let Some(b64) = item.get("b64_json").and_then(Value::as_str) {
                use base64::Engine as _;
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(b64)
                    .map_err(|e| {
                        LlmError::ResponseFormat(format!("{}: invalid image base64: {e}", self.id))
                    })?;
                images.push(GeneratedImage::Bytes(bytes));
            } else if let Some(url) = item.get("url").and_then(Value::as_str) {
                images.push(GeneratedImage::Url(url.to_string()));
            }
        }
        Ok(ImageResponse { images })
    }
}

#[async_trait::async_trait]
impl CompletionCapability for OpenAiCompatProvider {
    async fn complete(&self, req: &CompletionRequest) -> Result<CompletionResponse> {
        let mut body = serde_json::json!({
            "model": self.model,
            "prompt": req.prompt,
        });
        if let Some(ref suffix) = req.suffix {
            body["suffix"] = Value::String(suffix.clone());
        }
        if let Some(m) = req.max_tokens.or(self.config.max_tokens) {
            body["max_tokens"] = serde_json::json!(m);
        }
        if let Some(t) = req.temperature.or(self.config.temperature) {
            body["temperature"] = serde_json::json!(t);
        }

        let json = send_json(
            &self.id,
            self.post(self.flavor.completion_path).json(&body),
            &req.cancel,
        )
        .await?;

        let text = json
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|a| a.first())
            .and_then(|c| c.get("text"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        Ok(CompletionResponse {
            text,
            usage: json.get("usage").and_then(parse_usage),
        })
    }
}

// ── Audio ──────────────────────────────────────────────────────────

#[async_trait::async_trait]
impl TextToSpeechCapability for OpenAiCompatProvider {
    async fn synthesize(&self, req: &TtsRequest) -> Result<TtsResponse> {
        let mut body = serde_json::json!({
            "model": req.model.as_deref().unwrap_or(self.flavor.tts_model),
            "input": req.text,
            "voice": req.voice.as_deref().unwrap_or(self.flavor.tts_voice),
        });
        if let Some(ref format) = req.format {
            body["response_format"] = Value::String(format.clone());
        }
        if let Some(speed) = req.speed {
            body["speed"] = serde_json::json!(speed);
        }

        let response =
            send_checked(&self.id, self.post("/audio/speech").json(&body), &req.cancel).await?;
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("audio/mpeg")
            .to_string();
        let audio = response.bytes().await.map_err(from_reqwest)?.to_vec();

        Ok(TtsResponse {
            audio,
            content_type,
            sample_rate: None,
        })
    }
}

impl OpenAiCompatProvider {
    async fn transcribe_at(&self, path: &str, req: &SttRequest, translate: bool) -> Result<SttResponse> {
        let mime = if req.mime.is_empty() { "audio/wav" } else { &req.mime };
        let part = reqwest::multipart::Part::bytes(req.audio.clone())
            .file_name(if req.filename.is_empty() {
                "audio.wav".to_string()
            } else {
                req.filename.clone()
            })
            .mime_str(mime)
            .map_err(|e| LlmError::InvalidRequest(format!("bad audio mime '{mime}': {e}")))?;

        let mut form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", req.model.clone().unwrap_or_else(|| self.flavor.stt_model.to_string()))
            .text("response_format", "verbose_json");
        if req.word_timestamps {
            form = form.text("timestamp_granularities[]", "word");
        }
        if !translate {
            if let Some(ref lang) = req.language {
                form = form.text("language", lang.clone());
            }
        }

        let json = send_json(&self.id, self.post(path).multipart(form), &req.cancel).await?;

        let words = json
            .get("words")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(|w| {
                        Some(WordTiming {
                            word: w.get("word")?.as_str()?.to_string(),
                            start: w.get("start")?.as_f64()?,
                            end: w.get("end")?.as_f64()?,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(SttResponse {
            text: json
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            language: json
                .get("language")
                .and_then(Value::as_str)
                .map(String::from),
            words,
        })
    }
}

#[async_trait::async_trait]
impl SpeechToTextCapability for OpenAiCompatProvider {
    async fn transcribe(&self, req: &SttRequest) -> Result<SttResponse> {
        self.transcribe_at("/audio/transcriptions", req, false).await
    }
}

#[async_trait::async_trait]
impl AudioTranslationCapability for OpenAiCompatProvider {
    async fn translate(&self, req: &SttRequest) -> Result<SttResponse> {
        self.transcribe_at("/audio/translations", req, true).await
    }
}

// ── Provider aggregate ─────────────────────────────────────────────

impl Provider for OpenAiCompatProvider {
    fn provider_id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> &[CapabilityKind] {
        self.flavor.capabilities
    }

    fn as_chat(&self) -> Option<&dyn ChatCapability> {
        self.supports(C::Chat).then_some(self as &dyn ChatCapability)
    }
    fn as_embedding(&self) -> Option<&dyn EmbeddingCapability> {
        self.supports(C::Embedding)
            .then_some(self as &dyn EmbeddingCapability)
    }
    fn as_tts(&self) -> Option<&dyn TextToSpeechCapability> {
        self.supports(C::TextToSpeech)
            .then_some(self as &dyn TextToSpeechCapability)
    }
    fn as_stt(&self) -> Option<&dyn SpeechToTextCapability> {
        self.supports(C::SpeechToText)
            .then_some(self as &dyn SpeechToTextCapability)
    }
    fn as_audio_translation(&self) -> Option<&dyn AudioTranslationCapability> {
        self.supports(C::AudioTranslation)
            .then_some(self as &dyn AudioTranslationCapability)
    }
    fn as_moderation(&self) -> Option<&dyn ModerationCapability> {
        self.supports(C::Moderation)
            .then_some(self as &dyn ModerationCapability)
    }
    fn as_image(&self) -> Option<&dyn ImageGenerationCapability> {
        self.supports(C::ImageGeneration)
            .then_some(self as &dyn ImageGenerationCapability)
    }
    fn as_completion(&self) -> Option<&dyn CompletionCapability> {
        self.supports(C::Completion)
            .then_some(self as &dyn CompletionCapability)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_domain::message::{MessageBuilder, ToolResult};

    fn provider() -> OpenAiCompatProvider {
        let config = LlmConfig {
            api_key: Some("sk-test".into()),
            ..Default::default()
        };
        OpenAiCompatProvider::new(&OPENAI, &config).unwrap()
    }

    #[test]
    fn defaults_applied_from_flavor() {
        let p = provider();
        assert_eq!(p.base_url, "https://api.openai.com/v1");
        assert_eq!(p.model, "gpt-4o");
        assert_eq!(p.embedding_model, "text-embedding-3-small");
    }

    #[test]
    fn explicit_model_used_for_embeddings_too() {
        let config = LlmConfig {
            api_key: Some("sk-test".into()),
            model: "text-embedding-3-large".into(),
            ..Default::default()
        };
        let p = OpenAiCompatProvider::new(&OPENAI, &config).unwrap();
        assert_eq!(p.embedding_model, "text-embedding-3-large");
    }

    #[test]
    fn custom_flavor_requires_base_url() {
        let f = OpenAiCompatFactory::new(&COMPATIBLE);
        let err = f.validate(&LlmConfig::default()).unwrap_err();
        assert!(matches!(err, LlmError::InvalidRequest(_)));

        let cfg = LlmConfig {
            base_url: "http://localhost:8000/v1".into(),
            model: "local-model".into(),
            ..Default::default()
        };
        f.validate(&cfg).unwrap();
    }

    #[test]
    fn body_includes_sampling_and_tools() {
        let mut config = LlmConfig {
            api_key: Some("sk-test".into()),
            temperature: Some(0.3),
            max_tokens: Some(512),
            user: Some("u-1".into()),
            ..Default::default()
        };
        config.stop_sequences.push("END".into());
        let p = OpenAiCompatProvider::new(&OPENAI, &config).unwrap();

        let req = ChatRequest::new(vec![ModelMessage::user("hi")])
            .with_tools(vec![FunctionTool::new(
                "add",
                "add two ints",
                serde_json::json!({"type": "object"}),
            )])
            .with_tool_choice(ToolChoice::required().without_parallel());

        let (body, warnings) = p.build_chat_body(&req, false);
        assert!(warnings.is_empty());
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["temperature"], 0.3);
        assert_eq!(body["max_tokens"], 512);
        assert_eq!(body["stop"][0], "END");
        assert_eq!(body["user"], "u-1");
        assert_eq!(body["tools"][0]["function"]["name"], "add");
        assert_eq!(body["tool_choice"], "required");
        assert_eq!(body["parallel_tool_calls"], false);
    }

    #[test]
    fn system_prompt_prepended_as_system_message() {
        let config = LlmConfig {
            api_key: Some("sk-test".into()),
            system_prompt: Some("be brief".into()),
            ..Default::default()
        };
        let p = OpenAiCompatProvider::new(&OPENAI, &config).unwrap();
        let req = ChatRequest::new(vec![ModelMessage::user("hi")]);
        let (body, _) = p.build_chat_body(&req, false);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "be brief");
        assert_eq!(body["messages"][1]["role"], "user");
    }

    #[test]
    fn assistant_tool_calls_round_trip_verbatim() {
        let p = provider();
        let raw_args = "{\"a\": 2, \"b\": 3}";
        let history = vec![
            ModelMessage::user("add 2 and 3"),
            ModelMessage::assistant_tool_calls(None, vec![ToolCall::new("call_1", "add", raw_args)]),
            ModelMessage::tool_results(vec![ToolResult::text("call_1", "add", "5")]),
        ];
        let (body, _) = p.build_chat_body(&ChatRequest::new(history), false);

        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages[1]["role"], "assistant");
        assert_eq!(messages[1]["tool_calls"][0]["id"], "call_1");
        // The verbatim string, not re-serialized JSON.
        assert_eq!(messages[1]["tool_calls"][0]["function"]["arguments"], raw_args);
        assert_eq!(messages[2]["role"], "tool");
        assert_eq!(messages[2]["tool_call_id"], "call_1");
        assert_eq!(messages[2]["content"], "5");
    }

    #[test]
    fn multipart_user_message_preserves_order() {
        let p = provider();
        let msg = MessageBuilder::new(Role::User)
            .text("look at this")
            .image_url("https://example.com/x.png")
            .build();
        let (body, _) = p.build_chat_body(&ChatRequest::new(vec![msg]), false);
        let content = body["messages"][0]["content"].as_array().unwrap();
        assert_eq!(content[0]["type"], "text");
        assert_eq!(content[1]["type"], "image_url");
    }

    #[test]
    fn unsupported_part_becomes_placeholder_with_warning() {
        let p = provider();
        let msg = MessageBuilder::new(Role::User)
            .text("listen")
            .file_url("https://example.com/doc.pdf")
            .build();
        let (body, warnings) = p.build_chat_body(&ChatRequest::new(vec![msg]), false);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].code, chorus_domain::error::codes::UNSUPPORTED_PART);
        let content = body["messages"][0]["content"].as_array().unwrap();
        assert!(content[1]["text"].as_str().unwrap().contains("omitted"));
    }

    #[test]
    fn provider_tool_serialized_for_matching_namespace() {
        let config = LlmConfig {
            api_key: Some("xai-test".into()),
            ..Default::default()
        };
        let p = OpenAiCompatProvider::new(&XAI, &config).unwrap();
        let mut req = ChatRequest::new(vec![ModelMessage::user("search")]);
        req.provider_tools = vec![
            ProviderTool::new("xai.web_search", serde_json::json!({"max_results": 3})),
            ProviderTool::new("anthropic.web_search", serde_json::json!({})),
        ];
        let (body, _) = p.build_chat_body(&req, false);
        let tools = body["tools"].as_array().unwrap();
        // Only the xai-namespaced tool made it through.
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["type"], "web_search");
        assert_eq!(tools[0]["max_results"], 3);
    }

    #[test]
    fn response_format_json_schema() {
        let p = provider();
        let req = ChatRequest::new(vec![ModelMessage::user("go")]).with_response_format(
            ResponseFormat::JsonSchema(chorus_domain::config::StructuredOutputFormat::new(
                "person",
                serde_json::json!({"type": "object"}),
            )),
        );
        let (body, _) = p.build_chat_body(&req, false);
        assert_eq!(body["response_format"]["type"], "json_schema");
        assert_eq!(body["response_format"]["json_schema"]["name"], "person");
    }

    #[test]
    fn parse_sync_response() {
        let body = serde_json::json!({
            "id": "chatcmpl-1",
            "choices": [{"message": {"content": "pong", "role": "assistant"}}],
            "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2},
        });
        let resp = parse_chat_response("openai", &body).unwrap();
        assert_eq!(resp.text.as_deref(), Some("pong"));
        assert!(resp.tool_calls.is_empty());
        assert_eq!(resp.usage.unwrap().total_tokens, Some(2));
        assert_eq!(resp.provider_metadata["openai"]["response_id"], "chatcmpl-1");
    }

    #[test]
    fn parse_response_with_tool_calls() {
        let body = serde_json::json!({
            "choices": [{"message": {
                "content": null,
                "tool_calls": [{
                    "id": "call_9",
                    "type": "function",
                    "function": {"name": "add", "arguments": "{\"a\":2,\"b\":3}"},
                }],
            }}],
        });
        let resp = parse_chat_response("openai", &body).unwrap();
        assert!(resp.text.is_none());
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].arguments, "{\"a\":2,\"b\":3}");
    }

    #[test]
    fn stream_text_bracketing() {
        let mut state = StreamState::new("openai".into());
        let mut events = Vec::new();
        for data in [
            r#"{"id":"r1","choices":[{"delta":{"content":"he"}}]}"#,
            r#"{"choices":[{"delta":{"content":"llo"}}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
            r#"{"choices":[],"usage":{"prompt_tokens":3,"completion_tokens":2,"total_tokens":5}}"#,
            "[DONE]",
        ] {
            events.extend(parse_stream_payload(data, &mut state));
        }
        let events: Vec<StreamEvent> = events.into_iter().map(|e| e.unwrap()).collect();

        assert!(matches!(events[0], StreamEvent::TextStart));
        assert!(matches!(&events[1], StreamEvent::TextDelta { delta } if delta == "he"));
        assert!(matches!(&events[2], StreamEvent::TextDelta { delta } if delta == "llo"));
        assert!(matches!(&events[3], StreamEvent::TextEnd { text } if text == "hello"));
        match &events[4] {
            StreamEvent::Finish(resp) => {
                assert_eq!(resp.text.as_deref(), Some("hello"));
                assert_eq!(resp.usage.unwrap().total_tokens, Some(5));
                assert_eq!(resp.provider_metadata["openai"]["response_id"], "r1");
            }
            other => panic!("expected Finish, got {other:?}"),
        }
    }

    #[test]
    fn stream_reasoning_closes_before_text() {
        let mut state = StreamState::new("deepseek".into());
        let mut events = Vec::new();
        for data in [
            r#"{"choices":[{"delta":{"reasoning_content":"think"}}]}"#,
            r#"{"choices":[{"delta":{"content":"hi"}}]}"#,
            "[DONE]",
        ] {
            events.extend(parse_stream_payload(data, &mut state));
        }
        let events: Vec<StreamEvent> = events.into_iter().map(|e| e.unwrap()).collect();
        assert!(matches!(events[0], StreamEvent::ReasoningStart));
        assert!(matches!(&events[1], StreamEvent::ReasoningDelta { delta } if delta == "think"));
        assert!(matches!(&events[2], StreamEvent::ReasoningEnd { text } if text == "think"));
        assert!(matches!(events[3], StreamEvent::TextStart));
        assert!(matches!(&events[4], StreamEvent::TextDelta { delta } if delta == "hi"));
        assert!(matches!(&events[5], StreamEvent::TextEnd { text } if text == "hi"));
        assert!(matches!(events[6], StreamEvent::Finish(_)));
    }

    #[test]
    fn stream_tool_call_assembly() {
        let mut state = StreamState::new("openai".into());
        let mut events = Vec::new();
        for data in [
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"add","arguments":""}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"a\":"}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"2}"}}]}}]}"#,
            "[DONE]",
        ] {
            events.extend(parse_stream_payload(data, &mut state));
        }
        let events: Vec<StreamEvent> = events.into_iter().map(|e| e.unwrap()).collect();

        assert!(matches!(&events[0], StreamEvent::ToolCallStart { id, name } if id == "call_1" && name == "add"));
        assert!(matches!(&events[1], StreamEvent::ToolCallDelta { id, .. } if id == "call_1"));
        match &events[3] {
            StreamEvent::ToolCallEnd { call } => {
                assert_eq!(call.arguments, "{\"a\":2}");
            }
            other => panic!("expected ToolCallEnd, got {other:?}"),
        }
        match &events[4] {
            StreamEvent::Finish(resp) => assert_eq!(resp.tool_calls.len(), 1),
            other => panic!("expected Finish, got {other:?}"),
        }
    }

    #[test]
    fn stream_ignores_payloads_after_done() {
        let mut state = StreamState::new("openai".into());
        let _ = parse_stream_payload("[DONE]", &mut state);
        let after = parse_stream_payload(r#"{"choices":[{"delta":{"content":"x"}}]}"#, &mut state);
        assert!(after.is_empty());
    }
}
