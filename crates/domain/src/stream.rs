//! Streaming event model and chat response types.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;

use crate::error::Warning;
use crate::message::{ToolCall, ToolResult};

/// A boxed async stream, used for LLM streaming responses.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// The stream type produced by `chat_stream`: events in production order,
/// terminated by exactly one `Finish` event or one terminal `Err` item
/// (after which nothing follows).
pub type EventStream = BoxStream<'static, crate::error::Result<StreamEvent>>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Usage accounting
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Token usage for a completion. Fields are optional because providers
/// report them unevenly; addition is component-wise with absent values
/// coerced to zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_tokens: Option<u32>,
}

impl Usage {
    pub fn new(prompt: u32, completion: u32) -> Self {
        Self {
            prompt_tokens: Some(prompt),
            completion_tokens: Some(completion),
            total_tokens: Some(prompt + completion),
            reasoning_tokens: None,
        }
    }

    /// True when no component is reported.
    pub fn is_empty(&self) -> bool {
        self.prompt_tokens.is_none()
            && self.completion_tokens.is_none()
            && self.total_tokens.is_none()
            && self.reasoning_tokens.is_none()
    }
}

fn add_components(a: Option<u32>, b: Option<u32>) -> Option<u32> {
    match (a, b) {
        (None, None) => None,
        (a, b) => Some(a.unwrap_or(0) + b.unwrap_or(0)),
    }
}

impl std::ops::Add for Usage {
    type Output = Usage;

    fn add(self, rhs: Usage) -> Usage {
        Usage {
            prompt_tokens: add_components(self.prompt_tokens, rhs.prompt_tokens),
            completion_tokens: add_components(self.completion_tokens, rhs.completion_tokens),
            total_tokens: add_components(self.total_tokens, rhs.total_tokens),
            reasoning_tokens: add_components(self.reasoning_tokens, rhs.reasoning_tokens),
        }
    }
}

impl std::ops::AddAssign for Usage {
    fn add_assign(&mut self, rhs: Usage) {
        *self = *self + rhs;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Chat response
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A provider-agnostic chat completion response.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChatResponse {
    /// Assistant text, when the turn produced any.
    pub text: Option<String>,
    /// Reasoning/thinking content, for providers that expose it.
    pub thinking: Option<String>,
    /// Tool calls issued by the model.
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<Usage>,
    /// Non-fatal degradations accumulated while building the response.
    pub warnings: Vec<Warning>,
    /// Opaque vendor extras, namespaced by provider id.
    pub provider_metadata: HashMap<String, serde_json::Value>,
}

impl ChatResponse {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    /// Whether the model asked for tools this turn.
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// The text content, or empty string.
    pub fn text_or_empty(&self) -> &str {
        self.text.as_deref().unwrap_or("")
    }

    pub fn push_warning(&mut self, warning: Warning) {
        self.warnings.push(warning);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stream events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Events emitted during chat streaming (provider-agnostic).
///
/// Ordering within one stream:
/// - `TextStart` precedes any `TextDelta`; `TextEnd` carries the full
///   accumulated text. Same bracketing for reasoning.
/// - `ToolCallStart` precedes `ToolCallDelta`* precedes `ToolCallEnd`;
///   argument deltas accumulate monotonically into the final call.
/// - `ProviderMetadata` may interleave but always precedes `Finish`.
/// - Exactly one `Finish` terminates a successful stream. A failed stream
///   ends with a single `Err` item instead, and nothing follows it.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    TextStart,
    TextDelta { delta: String },
    TextEnd { text: String },
    ReasoningStart,
    ReasoningDelta { delta: String },
    ReasoningEnd { text: String },
    ToolCallStart { id: String, name: String },
    ToolCallDelta { id: String, delta: String },
    ToolCallEnd { call: ToolCall },
    ToolResult(ToolResult),
    ProviderMetadata {
        provider_id: String,
        metadata: serde_json::Value,
    },
    Finish(ChatResponse),
}

impl StreamEvent {
    /// Whether this event terminates the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Finish(_))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stream accumulation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Folds a stream of events back into a [`ChatResponse`]; used by consumers
/// that want the final result and by adapters building their `Finish` event.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    text: String,
    thinking: String,
    tool_calls: Vec<ToolCall>,
    usage: Option<Usage>,
    provider_metadata: HashMap<String, serde_json::Value>,
    finished: Option<ChatResponse>,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::TextDelta { delta } => self.text.push_str(delta),
            StreamEvent::ReasoningDelta { delta } => self.thinking.push_str(delta),
            StreamEvent::ToolCallEnd { call } => self.tool_calls.push(call.clone()),
            StreamEvent::ProviderMetadata {
                provider_id,
                metadata,
            } => {
                self.provider_metadata
                    .insert(provider_id.clone(), metadata.clone());
            }
            StreamEvent::Finish(resp) => {
                self.usage = resp.usage;
                self.finished = Some(resp.clone());
            }
            _ => {}
        }
    }

    /// Accumulated text so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// The final response: the `Finish` payload when one arrived, otherwise
    /// a response assembled from the accumulated pieces.
    pub fn into_response(self) -> ChatResponse {
        if let Some(resp) = self.finished {
            return resp;
        }
        ChatResponse {
            text: (!self.text.is_empty()).then_some(self.text),
            thinking: (!self.thinking.is_empty()).then_some(self.thinking),
            tool_calls: self.tool_calls,
            usage: self.usage,
            warnings: Vec::new(),
            provider_metadata: self.provider_metadata,
        }
    }
}
