//! Structured-output generation: schema-constrained chat decoded into typed
//! values, one-shot and streaming.
//!
//! Providers advertising native constrained output get the schema attached
//! as a response format; everyone else gets a respond-only-with-JSON system
//! instruction. The response text then goes through a tolerant JSON scanner
//! (code fences stripped, first balanced value located), a shallow schema
//! check, and `serde_json::from_value`.

use serde::de::DeserializeOwned;
use serde_json::Value;

use chorus_domain::cancel::CancellationToken;
use chorus_domain::capability::CapabilityKind;
use chorus_domain::config::{ResponseFormat, StructuredOutputFormat};
use chorus_domain::error::{LlmError, Result};
use chorus_domain::message::ModelMessage;
use chorus_domain::stream::{EventStream, StreamEvent};
use chorus_providers::ChatRequest;

use crate::builder::LanguageModel;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// JSON extraction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Strip a surrounding markdown code fence (``` or ```json) if present.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json", "JSON", ...) up to the first newline.
    let rest = match rest.split_once('\n') {
        Some((_info, body)) => body,
        None => rest,
    };
    match rest.rfind("```") {
        Some(end) => rest[..end].trim(),
        None => rest.trim(),
    }
}

/// Locate the first balanced JSON object or array in `text`, string- and
/// escape-aware. Returns the span.
fn first_balanced_json(text: &str) -> Option<(usize, usize)> {
    let bytes = text.as_bytes();
    let start = bytes.iter().position(|&b| b == b'{' || b == b'[')?;
    let open = bytes[start];
    let close = if open == b'{' { b'}' } else { b']' };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            _ if b == open => depth += 1,
            _ if b == close => {
                depth -= 1;
                if depth == 0 {
                    return Some((start, i + 1));
                }
            }
            _ => {}
        }
    }
    None
}

/// Extract the first JSON value from model output.
///
/// Code fences are stripped and leading prose is skipped. Trailing garbage
/// after the value is rejected unless `permissive`.
pub fn extract_json(text: &str, permissive: bool) -> Result<Value> {
    let text = strip_code_fence(text);
    let (start, end) = first_balanced_json(text).ok_or_else(|| {
        LlmError::ResponseFormat("no JSON object or array found in response text".into())
    })?;

    if !permissive {
        let trailing = text[end..].trim();
        if !trailing.is_empty() {
            return Err(LlmError::ResponseFormat(format!(
                "trailing content after JSON value: '{}'",
                truncate_for_display(trailing, 60)
            )));
        }
    }

    serde_json::from_str(&text[start..end])
        .map_err(|e| LlmError::ResponseFormat(format!("malformed JSON in response: {e}")))
}

fn truncate_for_display(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    &s[..cut]
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Schema validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Shallow JSON-Schema check: `type` and `required` at every object level,
/// primitive types for leaves. Enough to catch the model answering with the
/// wrong shape before deserialization produces a confusing error.
pub fn validate_schema(schema: &Value, value: &Value) -> Result<()> {
    validate_at(schema, value, "$")
}

fn validate_at(schema: &Value, value: &Value, path: &str) -> Result<()> {
    if let Some(expected) = schema.get("type").and_then(Value::as_str) {
        let ok = match expected {
            "object" => value.is_object(),
            "array" => value.is_array(),
            "string" => value.is_string(),
            "integer" => value.is_i64() || value.is_u64(),
            "number" => value.is_number(),
            "boolean" => value.is_boolean(),
            "null" => value.is_null(),
            _ => true,
        };
        if !ok {
            return Err(LlmError::ResponseFormat(format!(
                "{path}: expected {expected}, got {}",
                type_name(value)
            )));
        }
    }

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            if value.get(field).is_none() {
                return Err(LlmError::ResponseFormat(format!(
                    "{path}: missing required field '{field}'"
                )));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (name, prop_schema) in properties {
            if let Some(prop_value) = value.get(name) {
                validate_at(prop_schema, prop_value, &format!("{path}.{name}"))?;
            }
        }
    }

    if let Some(item_schema) = schema.get("items") {
        if let Some(items) = value.as_array() {
            for (i, item) in items.iter().enumerate() {
                validate_at(item_schema, item, &format!("{path}[{i}]"))?;
            }
        }
    }

    Ok(())
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// generate_object
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn schema_instruction(format: &StructuredOutputFormat) -> String {
    format!(
        "Respond ONLY with a JSON value matching this JSON Schema (no prose, no code fences):\n{}",
        format.schema
    )
}

/// Prepare the request: native constrained output when the provider has it,
/// prompt augmentation otherwise.
fn object_request(
    model: &LanguageModel,
    format: &StructuredOutputFormat,
    mut messages: Vec<ModelMessage>,
    cancel: CancellationToken,
) -> ChatRequest {
    let native = model.supports(CapabilityKind::StructuredOutput);
    let mut req = ChatRequest::new(Vec::new()).with_cancel(cancel);
    if native {
        req.response_format = ResponseFormat::JsonSchema(format.clone());
    } else {
        messages.insert(0, ModelMessage::system(schema_instruction(format)));
    }
    req.messages = messages;
    req
}

/// Decode response text into a schema-validated typed value.
fn decode_object<T: DeserializeOwned>(
    format: &StructuredOutputFormat,
    text: &str,
) -> Result<T> {
    let value = extract_json(text, false)?;
    validate_schema(&format.schema, &value)?;
    serde_json::from_value(value)
        .map_err(|e| LlmError::ResponseFormat(format!("typed decode failed: {e}")))
}

/// Run a chat constrained to `format`'s schema and decode the result as `T`.
pub async fn generate_object<T: DeserializeOwned>(
    model: &LanguageModel,
    format: &StructuredOutputFormat,
    messages: Vec<ModelMessage>,
    cancel: CancellationToken,
) -> Result<T> {
    let req = object_request(model, format, messages, cancel);
    let response = model.chat(&req).await?;
    let text = response.text.as_deref().ok_or_else(|| {
        LlmError::ResponseFormat("model returned no text to parse".into())
    })?;
    decode_object(format, text)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// stream_object
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A streaming structured-output run: the raw event stream plus a future for
/// the final typed object.
pub struct ObjectStream<T> {
    /// The re-yielded chat events, consumable as they arrive.
    pub events: EventStream,
    object_rx: tokio::sync::oneshot::Receiver<Result<T>>,
}

impl<T> ObjectStream<T> {
    /// Drive any unconsumed events to completion and return the final typed
    /// object (or the stream's error).
    pub async fn object(mut self) -> Result<T> {
        use futures_util::StreamExt;
        while self.events.next().await.is_some() {}
        match self.object_rx.await {
            Ok(result) => result,
            Err(_) => Err(LlmError::ResponseFormat(
                "stream ended without producing a final object".into(),
            )),
        }
    }
}

/// An error clone preserving the kind (the source error is not `Clone`).
fn clone_error(e: &LlmError) -> LlmError {
    match e {
        LlmError::Auth(m) => LlmError::Auth(m.clone()),
        LlmError::InvalidRequest(m) => LlmError::InvalidRequest(m.clone()),
        LlmError::RateLimit { retry_after } => LlmError::RateLimit {
            retry_after: *retry_after,
        },
        LlmError::Provider { provider, message } => LlmError::Provider {
            provider: provider.clone(),
            message: message.clone(),
        },
        LlmError::Timeout(m) => LlmError::Timeout(m.clone()),
        LlmError::Cancelled { reason } => LlmError::Cancelled {
            reason: reason.clone(),
        },
        LlmError::ResponseFormat(m) => LlmError::ResponseFormat(m.clone()),
        LlmError::UnsupportedCapability(m) => LlmError::UnsupportedCapability(m.clone()),
        LlmError::Http(m) => LlmError::Http(m.clone()),
        LlmError::Json(e) => LlmError::ResponseFormat(e.to_string()),
        LlmError::Generic(m) => LlmError::Generic(m.clone()),
    }
}

/// Stream a schema-constrained chat: events are re-yielded as they arrive
/// while the accumulated text is parsed into the final object once the
/// stream finishes. A stream error completes the object future with the
/// same error.
pub async fn stream_object<T: DeserializeOwned + Send + 'static>(
    model: &LanguageModel,
    format: &StructuredOutputFormat,
    messages: Vec<ModelMessage>,
    cancel: CancellationToken,
) -> Result<ObjectStream<T>> {
    let req = object_request(model, format, messages, cancel);
    let inner = model.chat_stream(&req).await?;
    let format = format.clone();
    let (tx, rx) = tokio::sync::oneshot::channel::<Result<T>>();

    let events: EventStream = Box::pin(async_stream::stream! {
        use futures_util::StreamExt;
        let mut inner = inner;
        let mut text = String::new();
        let mut tx = Some(tx);

        while let Some(item) = inner.next().await {
            match item {
                Ok(event) => {
                    if let StreamEvent::TextDelta { ref delta } = event {
                        text.push_str(delta);
                    }
                    if let StreamEvent::Finish(ref response) = event {
                        // Prefer the response's own text; fall back to the
                        // accumulated deltas.
                        let final_text = response
                            .text
                            .clone()
                            .unwrap_or_else(|| text.clone());
                        if let Some(tx) = tx.take() {
                            let _ = tx.send(decode_object::<T>(&format, &final_text));
                        }
                    }
                    yield Ok(event);
                }
                Err(e) => {
                    if let Some(tx) = tx.take() {
                        let _ = tx.send(Err(clone_error(&e)));
                    }
                    yield Err(e);
                    return;
                }
            }
        }
    });

    Ok(ObjectStream { events, object_rx: rx })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
