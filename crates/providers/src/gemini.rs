//! Google Gemini adapter.
//!
//! Speaks the Generative Language API: `contents`/`parts` message shape,
//! `functionCall`/`functionResponse` tool plumbing keyed by name, and
//! `streamGenerateContent?alt=sse` for streaming. Auth is via an API key
//! passed as a query parameter (`key={api_key}`).

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use chorus_domain::capability::CapabilityKind;
use chorus_domain::config::{LlmConfig, ResponseFormat};
use chorus_domain::error::{LlmError, Result, Warning};
use chorus_domain::message::{ContentPart, MediaSource, ModelMessage, Role, ToolCall};
use chorus_domain::stream::{ChatResponse, EventStream, StreamEvent, Usage};
use chorus_domain::tool::{FunctionTool, ToolChoice, ToolChoiceMode};

use crate::convert::{collect_system_text, encode_base64, unsupported_part};
use crate::factory::{validate_sampling, ProviderFactory};
use crate::sse::{event_stream, Framing};
use crate::traits::{ChatCapability, ChatRequest, EmbeddingCapability, Provider};
use crate::util::{from_reqwest, resolve_api_key, send_checked, send_json};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const DEFAULT_MODEL: &str = "gemini-2.0-flash";
const DEFAULT_EMBED_MODEL: &str = "text-embedding-004";

const CAPABILITIES: &[CapabilityKind] = &[
    CapabilityKind::Chat,
    CapabilityKind::Streaming,
    CapabilityKind::ToolCalling,
    CapabilityKind::StructuredOutput,
    CapabilityKind::Vision,
    CapabilityKind::Embedding,
];

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Factory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct GeminiFactory;

impl ProviderFactory for GeminiFactory {
    fn provider_id(&self) -> &'static str {
        "gemini"
    }

    fn display_name(&self) -> &'static str {
        "Google Gemini"
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
        Ok(Arc::new(GeminiProvider::new(config)?))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct GeminiProvider {
    id: String,
    base_url: String,
    api_key: String,
    model: String,
    config: LlmConfig,
    client: reqwest::Client,
}

/// Redact the API key from a URL for safe logging.
fn redact_url_key(url: &str) -> String {
    match url.find("key=") {
        Some(idx) => format!("{}key=***", &url[..idx]),
        None => url.to_string(),
    }
}

impl GeminiProvider {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = resolve_api_key(config, "GEMINI_API_KEY", "gemini")?;
        let config = config.clone().with_defaults(&LlmConfig {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            ..Default::default()
        });
        let client = reqwest::Client::builder().build().map_err(from_reqwest)?;

        Ok(Self {
            id: "gemini".to_string(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            config,
            client,
        })
    }

    fn generate_url(&self, stream: bool) -> String {
        if stream {
            format!(
                "{}/v1beta/models/{}:streamGenerateContent?alt=sse&key={}",
                self.base_url, self.model, self.api_key
            )
        } else {
            format!(
                "{}/v1beta/models/{}:generateContent?key={}",
                self.base_url, self.model, self.api_key
            )
        }
    }

    fn post(&self, url: &str) -> reqwest::RequestBuilder {
        let mut rb = self
            .client
            .post(url)
            .header("Content-Type", "application/json");
        if let Some(t) = self.config.timeout {
            rb = rb.timeout(t);
        }
        rb
    }

    fn build_generate_body(&self, req: &ChatRequest) -> (Value, Vec<Warning>) {
        let mut warnings = Vec::new();
        let mut contents: Vec<Value> = Vec::new();

        for msg in &req.messages {
            match msg.role {
                Role::System => {} // collapsed into systemInstruction
                Role::User => {
                    contents.push(serde_json::json!({
                        "role": "user",
                        "parts": parts_to_wire(&self.id, msg, &mut warnings),
                    }));
                }
                Role::Assistant => {
                    contents.push(serde_json::json!({
                        "role": "model",
                        "parts": parts_to_wire(&self.id, msg, &mut warnings),
                    }));
                }
            }
        }

        let mut body = serde_json::json!({"contents": contents});

        if let Some(system) =
            collect_system_text(self.config.system_prompt.as_deref(), &req.messages)
        {
            body["systemInstruction"] = serde_json::json!({"parts": [{"text": system}]});
        }

        let tools = if req.tools.is_empty() {
            &self.config.tools
        } else {
            &req.tools
        };
        if !tools.is_empty() {
            let declarations: Vec<Value> = tools.iter().map(tool_to_wire).collect();
            body["tools"] = serde_json::json!([{"functionDeclarations": declarations}]);
        }
        if let Some(ref choice) = req.tool_choice {
            body["toolConfig"] = serde_json::json!({
                "functionCallingConfig": tool_choice_to_wire(choice),
            });
        }

        let mut generation = serde_json::Map::new();
        if let Some(t) = self.config.temperature {
            generation.insert("temperature".into(), serde_json::json!(t));
        }
        if let Some(m) = self.config.max_tokens {
            generation.insert("maxOutputTokens".into(), serde_json::json!(m));
        }
        if let Some(p) = self.config.top_p {
            generation.insert("topP".into(), serde_json::json!(p));
        }
        if let Some(k) = self.config.top_k {
            generation.insert("topK".into(), serde_json::json!(k));
        }
        if !self.config.stop_sequences.is_empty() {
            generation.insert(
                "stopSequences".into(),
                serde_json::json!(self.config.stop_sequences),
            );
        }
        match &req.response_format {
            ResponseFormat::Text => {}
            ResponseFormat::JsonObject => {
                generation.insert(
                    "responseMimeType".into(),
                    Value::String("application/json".into()),
                );
            }
            ResponseFormat::JsonSchema(format) => {
                generation.insert(
                    "responseMimeType".into(),
                    Value::String("application/json".into()),
                );
                generation.insert("responseSchema".into(), format.schema.clone());
            }
        }
        if !generation.is_empty() {
            body["generationConfig"] = Value::Object(generation);
        }

        if let Some(options) = self.config.options_for(&self.id) {
            for (k, v) in options {
                body[k.as_str()] = v.clone();
            }
        }

        (body, warnings)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message serialization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parts_to_wire(provider_id: &str, msg: &ModelMessage, warnings: &mut Vec<Warning>) -> Vec<Value> {
    let mut parts: Vec<Value> = Vec::new();

    for part in &msg.parts {
        match part {
            ContentPart::Text { text } => {
                parts.push(serde_json::json!({"text": text}));
            }
            ContentPart::ImageInline { data, mime } => {
                parts.push(serde_json::json!({
                    "inlineData": {"mimeType": mime, "data": encode_base64(data)},
                }));
            }
            ContentPart::FileInline { data, mime, .. } => {
                parts.push(serde_json::json!({
                    "inlineData": {"mimeType": mime, "data": encode_base64(data)},
                }));
            }
            ContentPart::ImageUrl { url } | ContentPart::FileUrl { url } => {
                parts.push(serde_json::json!({"fileData": {"fileUri": url}}));
            }
            ContentPart::Audio {
                source: MediaSource::Inline(data),
                mime,
            } => {
                parts.push(serde_json::json!({
                    "inlineData": {"mimeType": mime, "data": encode_base64(data)},
                }));
            }
            ContentPart::ToolCall(call) => {
                let args = call
                    .arguments_json()
                    .unwrap_or_else(|_| Value::Object(Default::default()));
                parts.push(serde_json::json!({
                    "functionCall": {"name": call.name, "args": args},
                }));
            }
            // The tool-result channel is keyed by function name here; call
            // ids are a client-side notion for this provider.
            ContentPart::ToolResult(result) => {
                let response = match &result.payload {
                    chorus_domain::message::ToolPayload::Json(v) => v.clone(),
                    chorus_domain::message::ToolPayload::Text(t) => {
                        serde_json::json!({"result": t})
                    }
                    chorus_domain::message::ToolPayload::Error(e) => {
                        serde_json::json!({"error": e})
                    }
                };
                parts.push(serde_json::json!({
                    "functionResponse": {"name": result.name, "response": response},
                }));
            }
            other => {
                let (placeholder, warning) = unsupported_part(provider_id, other);
                warnings.push(warning);
                parts.push(serde_json::json!({"text": placeholder}));
            }
        }
    }
    parts
}

fn tool_to_wire(tool: &FunctionTool) -> Value {
    serde_json::json!({
        "name": tool.name,
        "description": tool.description,
        "parameters": tool.parameters,
    })
}

fn tool_choice_to_wire(choice: &ToolChoice) -> Value {
    match &choice.mode {
        ToolChoiceMode::Auto => serde_json::json!({"mode": "AUTO"}),
        ToolChoiceMode::None => serde_json::json!({"mode": "NONE"}),
        ToolChoiceMode::Required => serde_json::json!({"mode": "ANY"}),
        ToolChoiceMode::Specific(name) => serde_json::json!({
            "mode": "ANY",
            "allowedFunctionNames": [name],
        }),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response deserialization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn synthesize_call_id() -> String {
    format!("call-{}", uuid::Uuid::new_v4().simple())
}

fn parse_response(provider_id: &str, body: &Value) -> Result<ChatResponse> {
    let parts = body
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|a| a.first())
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(Value::as_array)
        .ok_or_else(|| {
            LlmError::ResponseFormat(format!(
                "{provider_id}: no candidates[0].content.parts in response"
            ))
        })?;

    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    for part in parts {
        if let Some(t) = part.get("text").and_then(Value::as_str) {
            text_parts.push(t.to_string());
        }
        if let Some(call) = part.get("functionCall") {
            let name = call
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            let arguments = call
                .get("args")
                .map(|v| v.to_string())
                .unwrap_or_else(|| "{}".to_string());
            tool_calls.push(ToolCall {
                id: synthesize_call_id(),
                name,
                arguments,
            });
        }
    }

    Ok(ChatResponse {
        text: (!text_parts.is_empty()).then(|| text_parts.join("")),
        thinking: None,
        tool_calls,
        usage: body.get("usageMetadata").and_then(parse_usage),
        warnings: Vec::new(),
        provider_metadata: HashMap::new(),
    })
}

fn parse_usage(v: &Value) -> Option<Usage> {
    let prompt = v.get("promptTokenCount").and_then(Value::as_u64);
    let completion = v.get("candidatesTokenCount").and_then(Value::as_u64);
    let total = v.get("totalTokenCount").and_then(Value::as_u64);
    if prompt.is_none() && completion.is_none() && total.is_none() {
        return None;
    }
    Some(Usage {
        prompt_tokens: prompt.map(|n| n as u32),
        completion_tokens: completion.map(|n| n as u32),
        total_tokens: total.map(|n| n as u32),
        reasoning_tokens: v
            .get("thoughtsTokenCount")
            .and_then(Value::as_u64)
            .map(|n| n as u32),
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Chunk-level state. Gemini streams whole `functionCall` parts, so tool
/// calls emit a Start/Delta/End triple per part; text needs bracketing.
struct StreamState {
    text: String,
    text_open: bool,
    tool_calls: Vec<ToolCall>,
    usage: Option<Usage>,
    finished: bool,
}

impl StreamState {
    fn new() -> Self {
        Self {
            text: String::new(),
            text_open: false,
            tool_calls: Vec::new(),
            usage: None,
            finished: false,
        }
    }

    fn finalize(&mut self) -> Vec<Result<StreamEvent>> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;

        let mut events: Vec<Result<StreamEvent>> = Vec::new();
        if self.text_open {
            events.push(Ok(StreamEvent::TextEnd {
                text: self.text.clone(),
            }));
            self.text_open = false;
        }
        events.push(Ok(StreamEvent::Finish(ChatResponse {
            text: (!self.text.is_empty()).then(|| self.text.clone()),
            thinking: None,
            tool_calls: std::mem::take(&mut self.tool_calls),
            usage: self.usage,
            warnings: Vec::new(),
            provider_metadata: HashMap::new(),
        })));
        events
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

    if let Some(usage) = v.get("usageMetadata").and_then(parse_usage) {
        state.usage = Some(usage);
    }

    let candidate = v
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|a| a.first());

    if let Some(parts) = candidate
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(Value::as_array)
    {
        for part in parts {
            if let Some(t) = part.get("text").and_then(Value::as_str) {
                if !t.is_empty() {
                    if !state.text_open {
                        state.text_open = true;
                        events.push(Ok(StreamEvent::TextStart));
                    }
                    state.text.push_str(t);
                    events.push(Ok(StreamEvent::TextDelta { delta: t.to_string() }));
                }
            }
            if let Some(call) = part.get("functionCall") {
                let name = call
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                let arguments = call
                    .get("args")
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "{}".to_string());
                let id = synthesize_call_id();
                events.push(Ok(StreamEvent::ToolCallStart {
                    id: id.clone(),
                    name: name.clone(),
                }));
                events.push(Ok(StreamEvent::ToolCallDelta {
                    id: id.clone(),
                    delta: arguments.clone(),
                }));
                let call = ToolCall { id, name, arguments };
                state.tool_calls.push(call.clone());
                events.push(Ok(StreamEvent::ToolCallEnd { call }));
            }
        }
    }

    if candidate
        .and_then(|c| c.get("finishReason"))
        .and_then(Value::as_str)
        .is_some()
    {
        events.extend(state.finalize());
    }

    events
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl ChatCapability for GeminiProvider {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let (body, warnings) = self.build_generate_body(req);
        let url = self.generate_url(false);

        tracing::debug!(provider = %self.id, url = %redact_url_key(&url), "chat request");

        let json = send_json(&self.id, self.post(&url).json(&body), &req.cancel).await?;
        let mut response = parse_response(&self.id, &json)?;
        response.warnings.extend(warnings);
        Ok(response)
    }

    async fn chat_stream(&self, req: &ChatRequest) -> Result<EventStream> {
        let (body, warnings) = self.build_generate_body(req);
        if !warnings.is_empty() {
            tracing::warn!(provider = %self.id, count = warnings.len(), "request parts dropped");
        }
        let url = self.generate_url(true);

        tracing::debug!(provider = %self.id, url = %redact_url_key(&url), "chat stream request");

        let response = send_checked(&self.id, self.post(&url).json(&body), &req.cancel).await?;

        let mut state = StreamState::new();
        Ok(event_stream(response, Framing::Sse, req.cancel.clone(), move |data| {
            parse_stream_payload(data, &mut state)
        }))
    }
}

#[async_trait::async_trait]
impl EmbeddingCapability for GeminiProvider {
    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let cancel = chorus_domain::cancel::CancellationToken::new();
        let model = if self.model == DEFAULT_MODEL {
            DEFAULT_EMBED_MODEL
        } else {
            self.model.as_str()
        };
        let url = format!(
            "{}/v1beta/models/{}:batchEmbedContents?key={}",
            self.base_url, model, self.api_key
        );
        let requests: Vec<Value> = inputs
            .iter()
            .map(|text| {
                serde_json::json!({
                    "model": format!("models/{model}"),
                    "content": {"parts": [{"text": text}]},
                })
            })
            .collect();
        let body = serde_json::json!({"requests": requests});

        let json = send_json(&self.id, self.post(&url).json(&body), &cancel).await?;

        let rows = json
            .get("embeddings")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                LlmError::ResponseFormat(format!("{}: missing 'embeddings' in response", self.id))
            })?;

        Ok(rows
            .iter()
            .map(|row| {
                row.get("values")
                    .and_then(Value::as_array)
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

impl Provider for GeminiProvider {
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
