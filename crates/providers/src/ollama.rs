//! Ollama adapter for local model runtimes.
//!
//! Speaks the native `/api/chat` and `/api/embed` endpoints. Streaming is
//! NDJSON (one JSON object per line) rather than SSE, framed by the shared
//! [`LineBuffer`](crate::sse::LineBuffer). The wire carries no tool-call
//! ids, so the adapter synthesizes them.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use chorus_domain::capability::CapabilityKind;
use chorus_domain::config::{LlmConfig, ResponseFormat};
use chorus_domain::error::{LlmError, Result, Warning};
use chorus_domain::message::{ContentPart, ModelMessage, Role, ToolCall};
use chorus_domain::stream::{ChatResponse, EventStream, StreamEvent, Usage};
use chorus_domain::tool::FunctionTool;

use crate::convert::{encode_base64, unsupported_part};
use crate::factory::{validate_sampling, ProviderFactory};
use crate::sse::{event_stream, Framing};
use crate::traits::{ChatCapability, ChatRequest, EmbeddingCapability, Provider};
use crate::util::{from_reqwest, send_checked, send_json};

const DEFAULT_BASE_URL: &str = "http://localhost:11434";
const DEFAULT_MODEL: &str = "llama3.2";

const CAPABILITIES: &[CapabilityKind] = &[
    CapabilityKind::Chat,
    CapabilityKind::Streaming,
    CapabilityKind::ToolCalling,
    CapabilityKind::Vision,
    CapabilityKind::Embedding,
];

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Factory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct OllamaFactory;

impl ProviderFactory for OllamaFactory {
    fn provider_id(&self) -> &'static str {
        "ollama"
    }

    fn display_name(&self) -> &'static str {
        "Ollama"
    }

    fn capabilities(&self) -> &'static [CapabilityKind] {
        CAPABILITIES
    }

    fn defaults(&self) -> LlmConfig {
        LlmConfig {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            ..Default::default()
        }
    }

    fn validate(&self, config: &LlmConfig) -> Result<()> {
        validate_sampling(config)
    }

    fn create(&self, config: &LlmConfig) -> Result<Arc<dyn Provider>> {
        Ok(Arc::new(OllamaProvider::new(config)?))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct OllamaProvider {
    id: String,
    base_url: String,
    model: String,
    config: LlmConfig,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        // Local runtime, no credentials.
        let config = config.clone().with_defaults(&LlmConfig {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            ..Default::default()
        });
        let client = reqwest::Client::builder().build().map_err(from_reqwest)?;

        Ok(Self {
            id: "ollama".to_string(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            config,
            client,
        })
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let mut rb = self.client.post(format!("{}{}", self.base_url, path));
        if let Some(t) = self.config.timeout {
            rb = rb.timeout(t);
        }
        rb
    }

    fn build_chat_body(&self, req: &ChatRequest, stream: bool) -> (Value, Vec<Warning>) {
        let mut warnings = Vec::new();
        let mut messages: Vec<Value> = Vec::new();

        if let Some(ref prompt) = self.config.system_prompt {
            if !prompt.is_empty() {
                messages.push(serde_json::json!({"role": "system", "content": prompt}));
            }
        }
        for msg in &req.messages {
            map_message(&self.id, msg, &mut warnings, &mut messages);
        }

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": stream,
        });

        let tools = if req.tools.is_empty() {
            &self.config.tools
        } else {
            &req.tools
        };
        if !tools.is_empty() {
            let arr: Vec<Value> = tools.iter().map(tool_to_wire).collect();
            body["tools"] = Value::Array(arr);
        }

        if matches!(req.response_format, ResponseFormat::JsonObject) {
            body["format"] = Value::String("json".into());
        } else if let ResponseFormat::JsonSchema(ref format) = req.response_format {
            body["format"] = format.schema.clone();
        }

        let mut options = serde_json::Map::new();
        if let Some(t) = self.config.temperature {
            options.insert("temperature".into(), serde_json::json!(t));
        }
        if let Some(m) = self.config.max_tokens {
            options.insert("num_predict".into(), serde_json::json!(m));
        }
        if let Some(p) = self.config.top_p {
            options.insert("top_p".into(), serde_json::json!(p));
        }
        if let Some(k) = self.config.top_k {
            options.insert("top_k".into(), serde_json::json!(k));
        }
        if !self.config.stop_sequences.is_empty() {
            options.insert("stop".into(), serde_json::json!(self.config.stop_sequences));
        }
        if let Some(extra) = self.config.options_for(&self.id) {
            for (k, v) in extra {
                options.insert(k.clone(), v.clone());
            }
        }
        if !options.is_empty() {
            body["options"] = Value::Object(options);
        }

        (body, warnings)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message serialization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn map_message(
    provider_id: &str,
    msg: &ModelMessage,
    warnings: &mut Vec<Warning>,
    out: &mut Vec<Value>,
) {
    let role = match msg.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    };

    let mut text_parts: Vec<String> = Vec::new();
    let mut images: Vec<String> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    for part in &msg.parts {
        match part {
            ContentPart::Text { text } => text_parts.push(text.clone()),
            ContentPart::ImageInline { data, .. } => images.push(encode_base64(data)),
            ContentPart::ToolCall(call) => {
                let args = call
                    .arguments_json()
                    .unwrap_or_else(|_| Value::Object(Default::default()));
                tool_calls.push(serde_json::json!({
                    "function": {"name": call.name, "arguments": args},
                }));
            }
            ContentPart::ToolResult(result) => {
                // The wire has a dedicated "tool" role per result.
                out.push(serde_json::json!({
                    "role": "tool",
                    "content": result.payload_text(),
                }));
            }
            other => {
                let (placeholder, warning) = unsupported_part(provider_id, other);
                warnings.push(warning);
                text_parts.push(placeholder);
            }
        }
    }

    if text_parts.is_empty() && images.is_empty() && tool_calls.is_empty() {
        return;
    }

    let mut obj = serde_json::json!({
        "role": role,
        "content": text_parts.join("\n"),
    });
    if !images.is_empty() {
        obj["images"] = serde_json::json!(images);
    }
    if !tool_calls.is_empty() {
        obj["tool_calls"] = Value::Array(tool_calls);
    }
    out.push(obj);
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

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response deserialization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn synthesize_call_id() -> String {
    format!("call-{}", uuid::Uuid::new_v4().simple())
}

fn parse_tool_calls(message: &Value) -> Vec<ToolCall> {
    message
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|tc| {
                    let func = tc.get("function")?;
                    let name = func.get("name")?.as_str()?.to_string();
                    let arguments = func
                        .get("arguments")
                        .map(|a| a.to_string())
                        .unwrap_or_else(|| "{}".to_string());
                    Some(ToolCall {
                        id: synthesize_call_id(),
                        name,
                        arguments,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_usage(v: &Value) -> Option<Usage> {
    let prompt = v.get("prompt_eval_count").and_then(Value::as_u64);
    let completion = v.get("eval_count").and_then(Value::as_u64);
    if prompt.is_none() && completion.is_none() {
        return None;
    }
    let p = prompt.unwrap_or(0) as u32;
    let c = completion.unwrap_or(0) as u32;
    Some(Usage {
        prompt_tokens: prompt.map(|n| n as u32),
        completion_tokens: completion.map(|n| n as u32),
        total_tokens: Some(p + c),
        reasoning_tokens: None,
    })
}

fn parse_response(provider_id: &str, body: &Value) -> Result<ChatResponse> {
    let message = body.get("message").ok_or_else(|| {
        LlmError::ResponseFormat(format!("{provider_id}: no 'message' in chat response"))
    })?;

    let text = message
        .get("content")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from);

    Ok(ChatResponse {
        text,
        thinking: None,
        tool_calls: parse_tool_calls(message),
        usage: parse_usage(body),
        warnings: Vec::new(),
        provider_metadata: HashMap::new(),
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming (NDJSON)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct StreamState {
    text: String,
    text_open: bool,
    tool_calls: Vec<ToolCall>,
    finished: bool,
}

impl StreamState {
    fn new() -> Self {
        Self {
            text: String::new(),
            text_open: false,
            tool_calls: Vec::new(),
            finished: false,
        }
    }
}

fn parse_stream_payload(data: &str, state: &mut StreamState) -> Vec<Result<StreamEvent>> {
    if state.finished {
        return Vec::new();
    }

    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => return vec![Err(LlmError::Json(e))],
    };

    let mut events: Vec<Result<StreamEvent>> = Vec::new();

    if let Some(message) = v.get("message") {
        if let Some(t) = message.get("content").and_then(Value::as_str) {
            if !t.is_empty() {
                if !state.text_open {
                    state.text_open = true;
                    events.push(Ok(StreamEvent::TextStart));
                }
                state.text.push_str(t);
                events.push(Ok(StreamEvent::TextDelta { delta: t.to_string() }));
            }
        }
        for call in parse_tool_calls(message) {
            events.push(Ok(StreamEvent::ToolCallStart {
                id: call.id.clone(),
                name: call.name.clone(),
            }));
            events.push(Ok(StreamEvent::ToolCallDelta {
                id: call.id.clone(),
                delta: call.arguments.clone(),
            }));
            state.tool_calls.push(call.clone());
            events.push(Ok(StreamEvent::ToolCallEnd { call }));
        }
    }

    if v.get("done").and_then(Value::as_bool).unwrap_or(false) {
        state.finished = true;
        if state.text_open {
            events.push(Ok(StreamEvent::TextEnd {
                text: state.text.clone(),
            }));
        }
        events.push(Ok(StreamEvent::Finish(ChatResponse {
            text: (!state.text.is_empty()).then(|| state.text.clone()),
            thinking: None,
            tool_calls: std::mem::take(&mut state.tool_calls),
            usage: parse_usage(&v),
            warnings: Vec::new(),
            provider_metadata: HashMap::new(),
        })));
    }

    events
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl ChatCapability for OllamaProvider {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let (body, warnings) = self.build_chat_body(req, false);

        tracing::debug!(provider = %self.id, model = %self.model, "chat request");

        let json = send_json(&self.id, self.post("/api/chat").json(&body), &req.cancel).await?;
        let mut response = parse_response(&self.id, &json)?;
        response.warnings.extend(warnings);
        Ok(response)
    }

    async fn chat_stream(&self, req: &ChatRequest) -> Result<EventStream> {
        let (body, warnings) = self.build_chat_body(req, true);
        if !warnings.is_empty() {
            tracing::warn!(provider = %self.id, count = warnings.len(), "request parts dropped");
        }

        tracing::debug!(provider = %self.id, model = %self.model, "chat stream request");

        let response = send_checked(&self.id, self.post("/api/chat").json(&body), &req.cancel).await?;

        let mut state = StreamState::new();
        Ok(event_stream(
            response,
            Framing::Ndjson,
            req.cancel.clone(),
            move |data| parse_stream_payload(data, &mut state),
        ))
    }
}

#[async_trait::async_trait]
impl EmbeddingCapability for OllamaProvider {
    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let cancel = chorus_domain::cancel::CancellationToken::new();
        let body = serde_json::json!({
            "model": self.model,
            "input": inputs,
        });
        let json = send_json(&self.id, self.post("/api/embed").json(&body), &cancel).await?;

        let rows = json
            .get("embeddings")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                LlmError::ResponseFormat(format!("{}: missing 'embeddings' in response", self.id))
            })?;

        Ok(rows
            .iter()
            .map(|row| {
                row.as_array()
                    .map(|vals| {
                        vals.iter()
                            .filter_map(|v| v.as_f64().map(|f| f as f32))
                            .collect()
                    })
                    .unwrap_or_default()
            })
            .collect())
    }
}

impl Provider for OllamaProvider {
    fn provider_id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> &[CapabilityKind] {
        CAPABILITIES
    }

    fn as_chat(&self) -> Option<&dyn ChatCapability> {
        Some(self)
    }

    fn as_embedding(&self) -> Option<&dyn EmbeddingCapability> {
        Some(self)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
