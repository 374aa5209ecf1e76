//! Anthropic-native adapter.
//!
//! Implements the Anthropic Messages API: the separate top-level `system`
//! channel, content blocks (text / thinking / tool_use / tool_result /
//! image / document), and the content-block streaming event machine.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use chorus_domain::capability::CapabilityKind;
use chorus_domain::config::LlmConfig;
use chorus_domain::error::{LlmError, Result, Warning};
use chorus_domain::message::{ContentPart, ModelMessage, Role, ToolCall};
use chorus_domain::stream::{ChatResponse, EventStream, StreamEvent, Usage};
use chorus_domain::tool::{FunctionTool, ProviderTool, ToolChoice, ToolChoiceMode};

use crate::convert::{collect_system_text, encode_base64, unsupported_part};
use crate::factory::{validate_sampling, ProviderFactory};
use crate::sse::{event_stream, Framing};
use crate::traits::{ChatCapability, ChatRequest, Provider};
use crate::util::{from_reqwest, resolve_api_key, send_checked, send_json};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
const DEFAULT_MAX_TOKENS: u32 = 4096;

const CAPABILITIES: &[CapabilityKind] = &[
    CapabilityKind::Chat,
    CapabilityKind::Streaming,
    CapabilityKind::ToolCalling,
    CapabilityKind::Vision,
    CapabilityKind::Reasoning,
];

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Factory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct AnthropicFactory;

impl ProviderFactory for AnthropicFactory {
    fn provider_id(&self) -> &'static str {
        "anthropic"
    }

    fn display_name(&self) -> &'static str {
        "Anthropic"
    }

    fn capabilities(&self) -> &'static [CapabilityKind] {
        CAPABILITIES
    }

    fn defaults(&self) -> LlmConfig {
        LlmConfig {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            max_tokens: Some(DEFAULT_MAX_TOKENS),
            ..Default::default()
        }
    }

    fn validate(&self, config: &LlmConfig) -> Result<()> {
        validate_sampling(config)
    }

    fn create(&self, config: &LlmConfig) -> Result<Arc<dyn Provider>> {
        Ok(Arc::new(AnthropicProvider::new(config)?))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct AnthropicProvider {
    id: String,
    base_url: String,
    api_key: String,
    model: String,
    config: LlmConfig,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = resolve_api_key(config, "ANTHROPIC_API_KEY", "anthropic")?;
        let config = config.clone().with_defaults(&LlmConfig {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            max_tokens: Some(DEFAULT_MAX_TOKENS),
            ..Default::default()
        });
        let client = reqwest::Client::builder().build().map_err(from_reqwest)?;

        Ok(Self {
            id: "anthropic".to_string(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            config,
            client,
        })
    }

    fn messages_post(&self) -> reqwest::RequestBuilder {
        let mut rb = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json");
        if let Some(t) = self.config.timeout {
            rb = rb.timeout(t);
        }
        rb
    }

    fn build_messages_body(&self, req: &ChatRequest, stream: bool) -> (Value, Vec<Warning>) {
        let mut warnings = Vec::new();
        let mut api_messages: Vec<Value> = Vec::new();

        for msg in &req.messages {
            match msg.role {
                // System parts collapse into the top-level channel below.
                Role::System => {}
                Role::User => api_messages.push(user_to_wire(&self.id, msg, &mut warnings)),
                Role::Assistant => api_messages.push(assistant_to_wire(msg)),
            }
        }

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": api_messages,
            "max_tokens": self.config.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "stream": stream,
        });

        if let Some(system) =
            collect_system_text(self.config.system_prompt.as_deref(), &req.messages)
        {
            body["system"] = Value::String(system);
        }

        let tools = if req.tools.is_empty() {
            &self.config.tools
        } else {
            &req.tools
        };
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
        }

        if let Some(t) = self.config.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        if let Some(p) = self.config.top_p {
            body["top_p"] = serde_json::json!(p);
        }
        if let Some(k) = self.config.top_k {
            body["top_k"] = serde_json::json!(k);
        }
        if !self.config.stop_sequences.is_empty() {
            body["stop_sequences"] = serde_json::json!(self.config.stop_sequences);
        }
        if let Some(ref user) = self.config.user {
            body["metadata"] = serde_json::json!({"user_id": user});
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

fn user_to_wire(provider_id: &str, msg: &ModelMessage, warnings: &mut Vec<Warning>) -> Value {
    let mut content: Vec<Value> = Vec::new();

    for part in &msg.parts {
        match part {
            ContentPart::Text { text } => {
                content.push(serde_json::json!({"type": "text", "text": text}));
            }
            ContentPart::ImageInline { data, mime } => {
                content.push(serde_json::json!({
                    "type": "image",
                    "source": {
                        "type": "base64",
                        "media_type": mime,
                        "data": encode_base64(data),
                    }
                }));
            }
            ContentPart::ImageUrl { url } => {
                content.push(serde_json::json!({
                    "type": "image",
                    "source": {"type": "url", "url": url},
                }));
            }
            ContentPart::FileInline { data, mime, .. } if mime == "application/pdf" => {
                content.push(serde_json::json!({
                    "type": "document",
                    "source": {
                        "type": "base64",
                        "media_type": mime,
                        "data": encode_base64(data),
                    }
                }));
            }
            ContentPart::FileUrl { url } if url.ends_with(".pdf") => {
                content.push(serde_json::json!({
                    "type": "document",
                    "source": {"type": "url", "url": url},
                }));
            }
            ContentPart::ToolResult(result) => {
                content.push(serde_json::json!({
                    "type": "tool_result",
                    "tool_use_id": result.call_id,
                    "content": result.payload_text(),
                    "is_error": result.is_error(),
                }));
            }
            other => {
                let (placeholder, warning) = unsupported_part(provider_id, other);
                warnings.push(warning);
                content.push(serde_json::json!({"type": "text", "text": placeholder}));
            }
        }
    }

    serde_json::json!({"role": "user", "content": content})
}

fn assistant_to_wire(msg: &ModelMessage) -> Value {
    let mut content: Vec<Value> = Vec::new();

    for part in &msg.parts {
        match part {
            ContentPart::Text { text } => {
                content.push(serde_json::json!({"type": "text", "text": text}));
            }
            ContentPart::ToolCall(call) => {
                // The wire wants a JSON object; an unparseable argument
                // string degrades to an empty object.
                let input = call
                    .arguments_json()
                    .unwrap_or_else(|_| Value::Object(Default::default()));
                content.push(serde_json::json!({
                    "type": "tool_use",
                    "id": call.id,
                    "name": call.name,
                    "input": input,
                }));
            }
            _ => {}
        }
    }

    serde_json::json!({"role": "assistant", "content": content})
}

fn tool_to_wire(tool: &FunctionTool) -> Value {
    serde_json::json!({
        "name": tool.name,
        "description": tool.description,
        "input_schema": tool.parameters,
    })
}

fn provider_tool_to_wire(tool: &ProviderTool) -> Value {
    let mut obj = serde_json::json!({
        "type": tool.tool_name(),
        "name": tool.tool_name(),
    });
    if let (Value::Object(ref mut map), Value::Object(options)) = (&mut obj, &tool.options) {
        for (k, v) in options {
            map.insert(k.clone(), v.clone());
        }
    }
    obj
}

fn tool_choice_to_wire(choice: &ToolChoice) -> Value {
    let mut obj = match &choice.mode {
        ToolChoiceMode::Auto => serde_json::json!({"type": "auto"}),
        ToolChoiceMode::None => serde_json::json!({"type": "none"}),
        ToolChoiceMode::Required => serde_json::json!({"type": "any"}),
        ToolChoiceMode::Specific(name) => serde_json::json!({"type": "tool", "name": name}),
    };
    if choice.disable_parallel {
        obj["disable_parallel_tool_use"] = Value::Bool(true);
    }
    obj
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response deserialization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_response(provider_id: &str, body: &Value) -> Result<ChatResponse> {
    let empty = Vec::new();
    let blocks = body
        .get("content")
        .and_then(Value::as_array)
        .unwrap_or(&empty);

    let mut text_parts: Vec<String> = Vec::new();
    let mut thinking_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    for block in blocks {
        match block.get("type").and_then(Value::as_str).unwrap_or("") {
            "text" => {
                if let Some(t) = block.get("text").and_then(Value::as_str) {
                    text_parts.push(t.to_string());
                }
            }
            "thinking" => {
                if let Some(t) = block.get("thinking").and_then(Value::as_str) {
                    thinking_parts.push(t.to_string());
                }
            }
            "tool_use" => {
                let id = block
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                let name = block
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                let arguments = block
                    .get("input")
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "{}".to_string());
                tool_calls.push(ToolCall { id, name, arguments });
            }
            _ => {}
        }
    }

    let mut provider_metadata = HashMap::new();
    if let Some(id) = body.get("id").and_then(Value::as_str) {
        provider_metadata.insert(
            provider_id.to_string(),
            serde_json::json!({"response_id": id}),
        );
    }

    Ok(ChatResponse {
        text: (!text_parts.is_empty()).then(|| text_parts.join("")),
        thinking: (!thinking_parts.is_empty()).then(|| thinking_parts.join("")),
        tool_calls,
        usage: body.get("usage").and_then(parse_usage),
        warnings: Vec::new(),
        provider_metadata,
    })
}

fn parse_usage(v: &Value) -> Option<Usage> {
    let input = v.get("input_tokens").and_then(Value::as_u64)?;
    let output = v.get("output_tokens").and_then(Value::as_u64).unwrap_or(0);
    Some(Usage {
        prompt_tokens: Some(input as u32),
        completion_tokens: Some(output as u32),
        total_tokens: Some((input + output) as u32),
        reasoning_tokens: None,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming event machine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One open content block, keyed by the wire's block index.
enum OpenBlock {
    Text(String),
    Thinking(String),
    ToolUse { id: String, name: String, args: String },
}

/// Per-stream assembly state. Anthropic's block events map one-to-one onto
/// the start/delta/end bracketing, so this just tracks open blocks and
/// running totals for the final response.
struct StreamState {
    provider_id: String,
    blocks: HashMap<u64, OpenBlock>,
    text: String,
    thinking: String,
    tool_calls: Vec<ToolCall>,
    usage: Option<Usage>,
    response_id: Option<String>,
    finished: bool,
}

impl StreamState {
    fn new(provider_id: String) -> Self {
        Self {
            provider_id,
            blocks: HashMap::new(),
            text: String::new(),
            thinking: String::new(),
            tool_calls: Vec::new(),
            usage: None,
            response_id: None,
            finished: false,
        }
    }

    fn finish_response(&mut self) -> ChatResponse {
        let mut provider_metadata = HashMap::new();
        if let Some(ref id) = self.response_id {
            provider_metadata.insert(
                self.provider_id.clone(),
                serde_json::json!({"response_id": id}),
            );
        }
        ChatResponse {
            text: (!self.text.is_empty()).then(|| self.text.clone()),
            thinking: (!self.thinking.is_empty()).then(|| self.thinking.clone()),
            tool_calls: std::mem::take(&mut self.tool_calls),
            usage: self.usage,
            warnings: Vec::new(),
            provider_metadata,
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

    match v.get("type").and_then(Value::as_str).unwrap_or("") {
        "message_start" => {
            if let Some(msg) = v.get("message") {
                state.usage = msg.get("usage").and_then(parse_usage);
                if let Some(id) = msg.get("id").and_then(Value::as_str) {
                    state.response_id = Some(id.to_string());
                }
            }
        }

        "content_block_start" => {
            let idx = v.get("index").and_then(Value::as_u64).unwrap_or(0);
            let Some(block) = v.get("content_block") else {
                return events;
            };
            match block.get("type").and_then(Value::as_str).unwrap_or("") {
                "text" => {
                    state.blocks.insert(idx, OpenBlock::Text(String::new()));
                    events.push(Ok(StreamEvent::TextStart));
                }
                "thinking" => {
                    state.blocks.insert(idx, OpenBlock::Thinking(String::new()));
                    events.push(Ok(StreamEvent::ReasoningStart));
                }
                "tool_use" => {
                    let id = block
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string();
                    let name = block
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string();
                    events.push(Ok(StreamEvent::ToolCallStart {
                        id: id.clone(),
                        name: name.clone(),
                    }));
                    state.blocks.insert(
                        idx,
                        OpenBlock::ToolUse {
                            id,
                            name,
                            args: String::new(),
                        },
                    );
                }
                _ => {}
            }
        }

        "content_block_delta" => {
            let idx = v.get("index").and_then(Value::as_u64).unwrap_or(0);
            let Some(delta) = v.get("delta") else {
                return events;
            };
            match delta.get("type").and_then(Value::as_str).unwrap_or("") {
                "text_delta" => {
                    if let Some(t) = delta.get("text").and_then(Value::as_str) {
                        if let Some(OpenBlock::Text(buf)) = state.blocks.get_mut(&idx) {
                            buf.push_str(t);
                            state.text.push_str(t);
                            events.push(Ok(StreamEvent::TextDelta { delta: t.to_string() }));
                        }
                    }
                }
                "thinking_delta" => {
                    if let Some(t) = delta.get("thinking").and_then(Value::as_str) {
                        if let Some(OpenBlock::Thinking(buf)) = state.blocks.get_mut(&idx) {
                            buf.push_str(t);
                            state.thinking.push_str(t);
                            events.push(Ok(StreamEvent::ReasoningDelta { delta: t.to_string() }));
                        }
                    }
                }
                "input_json_delta" => {
                    if let Some(partial) = delta.get("partial_json").and_then(Value::as_str) {
                        if let Some(OpenBlock::ToolUse { id, args, .. }) = state.blocks.get_mut(&idx)
                        {
                            args.push_str(partial);
                            events.push(Ok(StreamEvent::ToolCallDelta {
                                id: id.clone(),
                                delta: partial.to_string(),
                            }));
                        }
                    }
                }
                _ => {}
            }
        }

        "content_block_stop" => {
            let idx = v.get("index").and_then(Value::as_u64).unwrap_or(0);
            match state.blocks.remove(&idx) {
                Some(OpenBlock::Text(buf)) => {
                    events.push(Ok(StreamEvent::TextEnd { text: buf }));
                }
                Some(OpenBlock::Thinking(buf)) => {
                    events.push(Ok(StreamEvent::ReasoningEnd { text: buf }));
                }
                Some(OpenBlock::ToolUse { id, name, args }) => {
                    let call = ToolCall {
                        id,
                        name,
                        arguments: if args.is_empty() { "{}".into() } else { args },
                    };
                    state.tool_calls.push(call.clone());
                    events.push(Ok(StreamEvent::ToolCallEnd { call }));
                }
                None => {}
            }
        }

        "message_delta" => {
            if let Some(output) = v
                .get("usage")
                .and_then(|u| u.get("output_tokens"))
                .and_then(Value::as_u64)
            {
                let mut usage = state.usage.unwrap_or_default();
                usage.completion_tokens = Some(output as u32);
                usage.total_tokens =
                    Some(usage.prompt_tokens.unwrap_or(0) + output as u32);
                state.usage = Some(usage);
            }
        }

        "message_stop" => {
            state.finished = true;
            events.push(Ok(StreamEvent::Finish(state.finish_response())));
        }

        "error" => {
            let message = v
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("unknown streaming error")
                .to_string();
            events.push(Err(LlmError::Provider {
                provider: state.provider_id.clone(),
                message,
            }));
        }

        // ping and future event types
        _ => {}
    }

    events
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl ChatCapability for AnthropicProvider {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let (body, warnings) = self.build_messages_body(req, false);

        tracing::debug!(provider = %self.id, model = %self.model, "chat request");

        let json = send_json(&self.id, self.messages_post().json(&body), &req.cancel).await?;
        let mut response = parse_response(&self.id, &json)?;
        response.warnings.extend(warnings);
        Ok(response)
    }

    async fn chat_stream(&self, req: &ChatRequest) -> Result<EventStream> {
        let (body, warnings) = self.build_messages_body(req, true);
        if !warnings.is_empty() {
            tracing::warn!(provider = %self.id, count = warnings.len(), "request parts dropped");
        }

        tracing::debug!(provider = %self.id, model = %self.model, "chat stream request");

        let response = send_checked(&self.id, self.messages_post().json(&body), &req.cancel).await?;

        let mut state = StreamState::new(self.id.clone());
        Ok(event_stream(response, Framing::Sse, req.cancel.clone(), move |data| {
            parse_stream_payload(data, &mut state)
        }))
    }
}

impl Provider for AnthropicProvider {
    fn provider_id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> &[CapabilityKind] {
        CAPABILITIES
    }

    fn as_chat(&self) -> Option<&dyn ChatCapability> {
        Some(self)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_domain::message::{MediaSource, ToolResult};

    fn provider() -> AnthropicProvider {
        AnthropicProvider::new(&LlmConfig {
            api_key: Some("sk-ant-test".into()),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn system_goes_to_top_level_channel() {
        let p = provider();
        let req = ChatRequest::new(vec![
            ModelMessage::system("be terse"),
            ModelMessage::user("hi"),
        ]);
        let (body, _) = p.build_messages_body(&req, false);
        assert_eq!(body["system"], "be terse");
        // The system message does not appear in the messages array.
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "user");
    }

    #[test]
    fn tool_results_become_tool_result_blocks() {
        let p = provider();
        let req = ChatRequest::new(vec![ModelMessage::tool_results(vec![ToolResult::error(
            "toolu_1",
            "lookup",
            "not found",
        )])]);
        let (body, _) = p.build_messages_body(&req, false);
        let block = &body["messages"][0]["content"][0];
        assert_eq!(block["type"], "tool_result");
        assert_eq!(block["tool_use_id"], "toolu_1");
        assert_eq!(block["is_error"], true);
    }

    #[test]
    fn assistant_tool_call_serializes_parsed_input() {
        let p = provider();
        let req = ChatRequest::new(vec![ModelMessage::assistant_tool_calls(
            Some("on it".into()),
            vec![ToolCall::new("toolu_1", "add", "{\"a\":2,\"b\":3}")],
        )]);
        let (body, _) = p.build_messages_body(&req, false);
        let content = body["messages"][0]["content"].as_array().unwrap();
        assert_eq!(content[0]["type"], "text");
        assert_eq!(content[1]["type"], "tool_use");
        assert_eq!(content[1]["input"]["a"], 2);
    }

    #[test]
    fn tool_choice_required_maps_to_any() {
        let p = provider();
        let req = ChatRequest::new(vec![ModelMessage::user("go")])
            .with_tool_choice(ToolChoice::required().without_parallel());
        let (body, _) = p.build_messages_body(&req, false);
        assert_eq!(body["tool_choice"]["type"], "any");
        assert_eq!(body["tool_choice"]["disable_parallel_tool_use"], true);
    }

    #[test]
    fn inline_image_is_base64_block() {
        let p = provider();
        let msg = chorus_domain::message::MessageBuilder::new(Role::User)
            .image_inline(vec![1, 2, 3], "image/png")
            .build();
        let (body, warnings) = p.build_messages_body(&ChatRequest::new(vec![msg]), false);
        assert!(warnings.is_empty());
        let block = &body["messages"][0]["content"][0];
        assert_eq!(block["type"], "image");
        assert_eq!(block["source"]["type"], "base64");
        assert_eq!(block["source"]["media_type"], "image/png");
    }

    #[test]
    fn audio_part_dropped_with_warning() {
        let p = provider();
        let msg = chorus_domain::message::MessageBuilder::new(Role::User)
            .text("listen to this")
            .audio(MediaSource::Url("https://example.com/a.mp3".into()), "audio/mpeg")
            .build();
        let (body, warnings) = p.build_messages_body(&ChatRequest::new(vec![msg]), false);
        assert_eq!(warnings.len(), 1);
        let content = body["messages"][0]["content"].as_array().unwrap();
        assert!(content[1]["text"].as_str().unwrap().contains("omitted"));
    }

    #[test]
    fn parse_sync_response_with_tool_use() {
        let body = serde_json::json!({
            "id": "msg_1",
            "content": [
                {"type": "text", "text": "let me add those"},
                {"type": "tool_use", "id": "toolu_9", "name": "add", "input": {"a": 2, "b": 3}},
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 12, "output_tokens": 8},
        });
        let resp = parse_response("anthropic", &body).unwrap();
        assert_eq!(resp.text.as_deref(), Some("let me add those"));
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].id, "toolu_9");
        assert_eq!(resp.usage.unwrap().total_tokens, Some(20));
        assert_eq!(resp.provider_metadata["anthropic"]["response_id"], "msg_1");
    }

    #[test]
    fn stream_blocks_map_to_bracketed_events() {
        let mut state = StreamState::new("anthropic".into());
        let payloads = [
            r#"{"type":"message_start","message":{"id":"msg_s","usage":{"input_tokens":5,"output_tokens":0}}}"#,
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"thinking"}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"hmm"}}"#,
            r#"{"type":"content_block_stop","index":0}"#,
            r#"{"type":"content_block_start","index":1,"content_block":{"type":"text"}}"#,
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"text_delta","text":"he"}}"#,
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"text_delta","text":"llo"}}"#,
            r#"{"type":"content_block_stop","index":1}"#,
            r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":7}}"#,
            r#"{"type":"message_stop"}"#,
        ];
        let mut events = Vec::new();
        for p in payloads {
            events.extend(parse_stream_payload(p, &mut state));
        }
        let events: Vec<StreamEvent> = events.into_iter().map(|e| e.unwrap()).collect();

        assert!(matches!(events[0], StreamEvent::ReasoningStart));
        assert!(matches!(&events[1], StreamEvent::ReasoningDelta { delta } if delta == "hmm"));
        assert!(matches!(&events[2], StreamEvent::ReasoningEnd { text } if text == "hmm"));
        assert!(matches!(events[3], StreamEvent::TextStart));
        assert!(matches!(&events[6], StreamEvent::TextEnd { text } if text == "hello"));
        match events.last().unwrap() {
            StreamEvent::Finish(resp) => {
                assert_eq!(resp.text.as_deref(), Some("hello"));
                assert_eq!(resp.thinking.as_deref(), Some("hmm"));
                let usage = resp.usage.unwrap();
                assert_eq!(usage.prompt_tokens, Some(5));
                assert_eq!(usage.completion_tokens, Some(7));
                assert_eq!(usage.total_tokens, Some(12));
            }
            other => panic!("expected Finish, got {other:?}"),
        }
    }

    #[test]
    fn stream_tool_use_assembly() {
        let mut state = StreamState::new("anthropic".into());
        let payloads = [
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"toolu_1","name":"add"}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"a\":"}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"2}"}}"#,
            r#"{"type":"content_block_stop","index":0}"#,
            r#"{"type":"message_stop"}"#,
        ];
        let mut events = Vec::new();
        for p in payloads {
            events.extend(parse_stream_payload(p, &mut state));
        }
        let events: Vec<StreamEvent> = events.into_iter().map(|e| e.unwrap()).collect();

        assert!(matches!(&events[0], StreamEvent::ToolCallStart { id, .. } if id == "toolu_1"));
        match &events[3] {
            StreamEvent::ToolCallEnd { call } => assert_eq!(call.arguments, "{\"a\":2}"),
            other => panic!("expected ToolCallEnd, got {other:?}"),
        }
        match events.last().unwrap() {
            StreamEvent::Finish(resp) => assert_eq!(resp.tool_calls.len(), 1),
            other => panic!("expected Finish, got {other:?}"),
        }
    }

    #[test]
    fn stream_error_event_maps_to_provider_error() {
        let mut state = StreamState::new("anthropic".into());
        let events =
            parse_stream_payload(r#"{"type":"error","error":{"message":"overloaded"}}"#, &mut state);
        assert!(matches!(
            &events[0],
            Err(LlmError::Provider { message, .. }) if message == "overloaded"
        ));
    }
}
