//! The prompt intermediate representation: provider-agnostic messages and
//! content parts. Every adapter converts this IR to/from its wire format.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{LlmError, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Roles and parts
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Where a media payload lives: carried inline or referenced by URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MediaSource {
    Url(String),
    Inline(Vec<u8>),
}

/// A tool invocation issued by the model.
///
/// `arguments` is the raw JSON string exactly as the provider produced it;
/// it round-trips verbatim through assistant history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    /// Parse the arguments string as JSON. An empty string parses as `{}`
    /// so executors that expect an object always receive one.
    pub fn arguments_json(&self) -> Result<serde_json::Value> {
        let trimmed = self.arguments.trim();
        if trimmed.is_empty() {
            return Ok(serde_json::json!({}));
        }
        serde_json::from_str(trimmed).map_err(|e| {
            LlmError::InvalidRequest(format!("tool call '{}' has malformed arguments: {e}", self.name))
        })
    }
}

/// The outcome of executing a tool call, fed back to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Must match the id of the originating [`ToolCall`].
    pub call_id: String,
    pub name: String,
    pub payload: ToolPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum ToolPayload {
    Json(serde_json::Value),
    Text(String),
    Error(String),
}

impl ToolResult {
    pub fn json(call_id: impl Into<String>, name: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            call_id: call_id.into(),
            name: name.into(),
            payload: ToolPayload::Json(value),
        }
    }

    pub fn text(call_id: impl Into<String>, name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            name: name.into(),
            payload: ToolPayload::Text(text.into()),
        }
    }

    pub fn error(call_id: impl Into<String>, name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            name: name.into(),
            payload: ToolPayload::Error(message.into()),
        }
    }

    /// Whether this result reports a failed execution.
    pub fn is_error(&self) -> bool {
        matches!(self.payload, ToolPayload::Error(_))
    }

    /// Render the payload as the string adapters put on the wire.
    pub fn payload_text(&self) -> String {
        match &self.payload {
            ToolPayload::Json(v) => v.to_string(),
            ToolPayload::Text(t) => t.clone(),
            ToolPayload::Error(e) => e.clone(),
        }
    }
}

/// One piece of message content (tagged variant, exhaustively matched).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    ImageInline {
        data: Vec<u8>,
        mime: String,
    },
    ImageUrl {
        url: String,
    },
    FileInline {
        data: Vec<u8>,
        mime: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
    },
    FileUrl {
        url: String,
    },
    Audio {
        source: MediaSource,
        mime: String,
    },
    ToolCall(ToolCall),
    ToolResult(ToolResult),
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// A short label for placeholders and diagnostics.
    pub fn describe(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::ImageInline { .. } => "inline image",
            Self::ImageUrl { .. } => "image url",
            Self::FileInline { .. } => "inline file",
            Self::FileUrl { .. } => "file url",
            Self::Audio { .. } => "audio",
            Self::ToolCall(_) => "tool call",
            Self::ToolResult(_) => "tool result",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A message in the conversation (provider-agnostic).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMessage {
    pub role: Role,
    /// Ordered content parts; a valid message has at least one.
    pub parts: Vec<ContentPart>,
    /// Optional participant name, forwarded where the wire supports it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Vendor escape hatch: provider id → opaque json merged into the wire
    /// message by the matching adapter, ignored by all others.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub provider_extensions: HashMap<String, serde_json::Value>,
}

impl ModelMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self::single(Role::System, ContentPart::text(text))
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::single(Role::User, ContentPart::text(text))
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::single(Role::Assistant, ContentPart::text(text))
    }

    /// An assistant turn consisting of tool calls (optionally preceded by text).
    pub fn assistant_tool_calls(text: Option<String>, calls: Vec<ToolCall>) -> Self {
        let mut parts = Vec::with_capacity(calls.len() + 1);
        if let Some(t) = text {
            if !t.is_empty() {
                parts.push(ContentPart::text(t));
            }
        }
        parts.extend(calls.into_iter().map(ContentPart::ToolCall));
        Self {
            role: Role::Assistant,
            parts,
            name: None,
            provider_extensions: HashMap::new(),
        }
    }

    /// A user turn carrying tool results back to the model.
    pub fn tool_results(results: Vec<ToolResult>) -> Self {
        Self {
            role: Role::User,
            parts: results.into_iter().map(ContentPart::ToolResult).collect(),
            name: None,
            provider_extensions: HashMap::new(),
        }
    }

    fn single(role: Role, part: ContentPart) -> Self {
        Self {
            role,
            parts: vec![part],
            name: None,
            provider_extensions: HashMap::new(),
        }
    }

    /// Join all text parts into one string (non-text parts are skipped).
    pub fn joined_text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// All tool calls carried by this message.
    pub fn tool_calls(&self) -> Vec<&ToolCall> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::ToolCall(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    /// All tool results carried by this message.
    pub fn tool_results_parts(&self) -> Vec<&ToolResult> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::ToolResult(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    /// Check the message invariants.
    ///
    /// - at least one part
    /// - tool calls only on assistant messages
    /// - tool results only on user messages
    /// - inline media carries a recognized mime type
    pub fn validate(&self) -> Result<()> {
        if self.parts.is_empty() {
            return Err(LlmError::InvalidRequest("message has no content parts".into()));
        }
        for part in &self.parts {
            match part {
                ContentPart::ToolCall(_) if self.role != Role::Assistant => {
                    return Err(LlmError::InvalidRequest(
                        "tool call parts may only appear in assistant messages".into(),
                    ));
                }
                ContentPart::ToolResult(_) if self.role != Role::User => {
                    return Err(LlmError::InvalidRequest(
                        "tool result parts may only appear in user messages".into(),
                    ));
                }
                ContentPart::ImageInline { mime, .. }
                | ContentPart::FileInline { mime, .. }
                | ContentPart::Audio { mime, .. } => {
                    if !is_recognized_mime(mime) {
                        return Err(LlmError::InvalidRequest(format!(
                            "inline media has unrecognized mime type '{mime}'"
                        )));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn is_recognized_mime(mime: &str) -> bool {
    let (kind, rest) = match mime.split_once('/') {
        Some(pair) => pair,
        None => return false,
    };
    !rest.is_empty()
        && matches!(kind, "image" | "audio" | "video" | "text" | "application")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Multi-part builder
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Fluent builder for multi-part messages.
///
/// ```
/// use chorus_domain::message::{MessageBuilder, Role};
///
/// let msg = MessageBuilder::new(Role::User)
///     .text("what is in this picture?")
///     .image_url("https://example.com/cat.png")
///     .build();
/// assert_eq!(msg.parts.len(), 2);
/// ```
#[derive(Debug)]
pub struct MessageBuilder {
    message: ModelMessage,
}

impl MessageBuilder {
    pub fn new(role: Role) -> Self {
        Self {
            message: ModelMessage {
                role,
                parts: Vec::new(),
                name: None,
                provider_extensions: HashMap::new(),
            },
        }
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.message.parts.push(ContentPart::text(text));
        self
    }

    pub fn image_inline(mut self, data: Vec<u8>, mime: impl Into<String>) -> Self {
        self.message.parts.push(ContentPart::ImageInline {
            data,
            mime: mime.into(),
        });
        self
    }

    pub fn image_url(mut self, url: impl Into<String>) -> Self {
        self.message.parts.push(ContentPart::ImageUrl { url: url.into() });
        self
    }

    pub fn file_inline(
        mut self,
        data: Vec<u8>,
        mime: impl Into<String>,
        filename: Option<String>,
    ) -> Self {
        self.message.parts.push(ContentPart::FileInline {
            data,
            mime: mime.into(),
            filename,
        });
        self
    }

    pub fn file_url(mut self, url: impl Into<String>) -> Self {
        self.message.parts.push(ContentPart::FileUrl { url: url.into() });
        self
    }

    pub fn audio(mut self, source: MediaSource, mime: impl Into<String>) -> Self {
        self.message.parts.push(ContentPart::Audio {
            source,
            mime: mime.into(),
        });
        self
    }

    pub fn part(mut self, part: ContentPart) -> Self {
        self.message.parts.push(part);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.message.name = Some(name.into());
        self
    }

    pub fn provider_extension(mut self, provider_id: impl Into<String>, value: serde_json::Value) -> Self {
        self.message.provider_extensions.insert(provider_id.into(), value);
        self
    }

    pub fn build(self) -> ModelMessage {
        self.message
    }
}
