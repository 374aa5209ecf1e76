//! Shared IR → wire helpers used by every adapter: system-channel collapse,
//! inline-media encoding, and the unsupported-part policy.

use base64::Engine as _;

use chorus_domain::error::{codes, Warning};
use chorus_domain::message::{ContentPart, ModelMessage, Role};

/// Base64-encode inline media.
pub(crate) fn encode_base64(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

/// A `data:` URL for wire formats that take inline media as URLs.
pub(crate) fn data_url(mime: &str, data: &[u8]) -> String {
    format!("data:{mime};base64,{}", encode_base64(data))
}

/// Collapse system-role parts (and the configured system prompt) into one
/// string for providers with a single system channel. The configured prompt
/// comes first; message order is preserved after it.
pub(crate) fn collect_system_text(
    configured: Option<&str>,
    messages: &[ModelMessage],
) -> Option<String> {
    let mut parts: Vec<String> = Vec::new();
    if let Some(p) = configured {
        if !p.is_empty() {
            parts.push(p.to_string());
        }
    }
    for msg in messages {
        if msg.role == Role::System {
            let text = msg.joined_text();
            if !text.is_empty() {
                parts.push(text);
            }
        }
    }
    (!parts.is_empty()).then(|| parts.join("\n\n"))
}

/// The textual placeholder an adapter emits for a part it cannot represent,
/// plus the matching warning. The placeholder goes on the wire so the model
/// knows content was dropped; the warning goes on the response.
pub(crate) fn unsupported_part(provider_id: &str, part: &ContentPart) -> (String, Warning) {
    let label = part.describe();
    let placeholder = format!("[{label} omitted: not representable by this provider]");
    let warning = Warning::new(
        codes::UNSUPPORTED_PART,
        format!("{provider_id}: dropped a {label} part this provider cannot represent"),
    );
    (placeholder, warning)
}
