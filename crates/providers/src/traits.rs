//! Capability traits and their request/response types.
//!
//! Each operation family is its own trait; a [`Provider`] exposes the
//! concrete interfaces it supports through `as_*` accessors so callers get
//! typed handles without downcasting.

use std::collections::HashMap;

use chorus_domain::cancel::CancellationToken;
use chorus_domain::capability::CapabilityKind;
use chorus_domain::config::ResponseFormat;
use chorus_domain::error::Result;
use chorus_domain::message::ModelMessage;
use chorus_domain::stream::{BoxStream, ChatResponse, EventStream, Usage};
use chorus_domain::tool::{FunctionTool, ProviderTool, ToolChoice};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Chat
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A provider-agnostic chat completion request.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// The conversation, in prompt-IR form.
    pub messages: Vec<ModelMessage>,
    /// Function tools the model may invoke (executed by the caller).
    pub tools: Vec<FunctionTool>,
    /// Provider-native tools, serialized into the vendor tool array and
    /// executed server-side.
    pub provider_tools: Vec<ProviderTool>,
    pub tool_choice: Option<ToolChoice>,
    pub response_format: ResponseFormat,
    /// Cancellation signal; observed before dispatch and per stream chunk.
    pub cancel: CancellationToken,
}

impl ChatRequest {
    pub fn new(messages: Vec<ModelMessage>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn with_tools(mut self, tools: Vec<FunctionTool>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_tool_choice(mut self, choice: ToolChoice) -> Self {
        self.tool_choice = Some(choice);
        self
    }

    pub fn with_response_format(mut self, format: ResponseFormat) -> Self {
        self.response_format = format;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Chat generation: one-shot and streaming.
#[async_trait::async_trait]
pub trait ChatCapability: Send + Sync {
    /// Send a chat completion request and wait for the full response.
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse>;

    /// Send a chat completion request and return a stream of events.
    async fn chat_stream(&self, req: &ChatRequest) -> Result<EventStream>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Embeddings
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Text embeddings. The output is row-aligned with the input slice.
#[async_trait::async_trait]
pub trait EmbeddingCapability: Send + Sync {
    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Audio
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A text-to-speech request.
#[derive(Debug, Clone, Default)]
pub struct TtsRequest {
    pub text: String,
    /// Voice identifier; provider default when absent.
    pub voice: Option<String>,
    pub model: Option<String>,
    /// Output container ("mp3", "wav", ...); provider default when absent.
    pub format: Option<String>,
    pub speed: Option<f32>,
    pub cancel: CancellationToken,
}

impl TtsRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

/// A synthesized audio clip.
#[derive(Debug, Clone)]
pub struct TtsResponse {
    pub audio: Vec<u8>,
    pub content_type: String,
    pub sample_rate: Option<u32>,
}

/// Events of a streaming synthesis: metadata first, then ordered audio
/// chunks, then `Finish`.
#[derive(Debug, Clone)]
pub enum TtsEvent {
    Metadata {
        content_type: String,
        sample_rate: Option<u32>,
    },
    AudioChunk(Vec<u8>),
    Finish,
}

#[async_trait::async_trait]
pub trait TextToSpeechCapability: Send + Sync {
    async fn synthesize(&self, req: &TtsRequest) -> Result<TtsResponse>;
}

#[async_trait::async_trait]
pub trait StreamingTextToSpeechCapability: Send + Sync {
    async fn synthesize_stream(&self, req: &TtsRequest)
        -> Result<BoxStream<'static, Result<TtsEvent>>>;
}

/// A speech-to-text request. `audio` is the raw container bytes; `filename`
/// and `mime` describe it for multipart upload.
#[derive(Debug, Clone, Default)]
pub struct SttRequest {
    pub audio: Vec<u8>,
    pub filename: String,
    pub mime: String,
    pub model: Option<String>,
    /// Hint for the spoken language (ISO 639-1).
    pub language: Option<String>,
    /// Request per-word timing where the provider supports it.
    pub word_timestamps: bool,
    pub cancel: CancellationToken,
}

/// Timing of one recognized word, in seconds from clip start.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct WordTiming {
    pub word: String,
    pub start: f64,
    pub end: f64,
}

#[derive(Debug, Clone, Default)]
pub struct SttResponse {
    pub text: String,
    pub language: Option<String>,
    pub words: Vec<WordTiming>,
}

#[async_trait::async_trait]
pub trait SpeechToTextCapability: Send + Sync {
    async fn transcribe(&self, req: &SttRequest) -> Result<SttResponse>;
}

/// Speech translation: transcribe audio in any language into English text.
#[async_trait::async_trait]
pub trait AudioTranslationCapability: Send + Sync {
    async fn translate(&self, req: &SttRequest) -> Result<SttResponse>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Rerank / moderation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default)]
pub struct RerankRequest {
    pub query: String,
    pub documents: Vec<String>,
    /// Return at most this many results.
    pub top_n: Option<usize>,
}

/// One reranked document: the index into the request's document list plus
/// its relevance score. Results are sorted by score, descending.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedDocument {
    pub index: usize,
    pub score: f64,
}

#[async_trait::async_trait]
pub trait RerankCapability: Send + Sync {
    async fn rerank(&self, req: &RerankRequest) -> Result<Vec<RankedDocument>>;
}

#[derive(Debug, Clone, Default)]
pub struct ModerationResult {
    pub flagged: bool,
    pub categories: HashMap<String, bool>,
    pub scores: HashMap<String, f64>,
}

#[async_trait::async_trait]
pub trait ModerationCapability: Send + Sync {
    async fn moderate(&self, input: &str) -> Result<ModerationResult>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Images / completion
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default)]
pub struct ImageRequest {
    pub prompt: String,
    /// "1024x1024" and friends; provider default when absent.
    pub size: Option<String>,
    pub count: Option<u32>,
}

/// One generated image, delivered inline or by URL depending on the provider.
#[derive(Debug, Clone)]
pub enum GeneratedImage {
    Bytes(Vec<u8>),
    Url(String),
}

#[derive(Debug, Clone, Default)]
pub struct ImageResponse {
    pub images: Vec<GeneratedImage>,
}

#[async_trait::async_trait]
pub trait ImageGenerationCapability: Send + Sync {
    async fn generate_image(&self, req: &ImageRequest) -> Result<ImageResponse>;
}

/// Fill-in-the-middle completion request.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub prompt: String,
    /// Text that should follow the completion (FIM).
    pub suffix: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Default)]
pub struct CompletionResponse {
    pub text: String,
    pub usage: Option<Usage>,
}

#[async_trait::async_trait]
pub trait CompletionCapability: Send + Sync {
    async fn complete(&self, req: &CompletionRequest) -> Result<CompletionResponse>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Provider aggregate
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A configured provider instance: the set of concrete capability interfaces
/// it supports, reachable without downcasts.
pub trait Provider: Send + Sync {
    /// The registry id of this provider ("openai", "anthropic", ...).
    fn provider_id(&self) -> &str;

    /// The operation families this instance supports.
    fn capabilities(&self) -> &[CapabilityKind];

    fn as_chat(&self) -> Option<&dyn ChatCapability> {
        None
    }
    fn as_embedding(&self) -> Option<&dyn EmbeddingCapability> {
        None
    }
    fn as_tts(&self) -> Option<&dyn TextToSpeechCapability> {
        None
    }
    fn as_streaming_tts(&self) -> Option<&dyn StreamingTextToSpeechCapability> {
        None
    }
    fn as_stt(&self) -> Option<&dyn SpeechToTextCapability> {
        None
    }
    fn as_audio_translation(&self) -> Option<&dyn AudioTranslationCapability> {
        None
    }
    fn as_moderation(&self) -> Option<&dyn ModerationCapability> {
        None
    }
    fn as_rerank(&self) -> Option<&dyn RerankCapability> {
        None
    }
    fn as_image(&self) -> Option<&dyn ImageGenerationCapability> {
        None
    }
    fn as_completion(&self) -> Option<&dyn CompletionCapability> {
        None
    }

    /// Whether this instance advertises the given capability.
    fn supports(&self, kind: CapabilityKind) -> bool {
        self.capabilities().contains(&kind)
    }
}
