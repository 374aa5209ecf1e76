//! Capability descriptors: every provider factory advertises the operation
//! families it supports, and the registry filters on them.

use serde::{Deserialize, Serialize};

/// One operation family a provider may implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    Chat,
    /// Incremental chat responses over SSE/NDJSON.
    Streaming,
    ToolCalling,
    /// Native schema-constrained output.
    StructuredOutput,
    Vision,
    Reasoning,
    Embedding,
    TextToSpeech,
    StreamingTextToSpeech,
    SpeechToText,
    AudioTranslation,
    Moderation,
    Rerank,
    ImageGeneration,
    /// Fill-in-the-middle text completion.
    Completion,
}

impl CapabilityKind {
    /// A stable lowercase label, used in diagnostics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Streaming => "streaming",
            Self::ToolCalling => "tool_calling",
            Self::StructuredOutput => "structured_output",
            Self::Vision => "vision",
            Self::Reasoning => "reasoning",
            Self::Embedding => "embedding",
            Self::TextToSpeech => "text_to_speech",
            Self::StreamingTextToSpeech => "streaming_text_to_speech",
            Self::SpeechToText => "speech_to_text",
            Self::AudioTranslation => "audio_translation",
            Self::Moderation => "moderation",
            Self::Rerank => "rerank",
            Self::ImageGeneration => "image_generation",
            Self::Completion => "completion",
        }
    }
}

impl std::fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}
