//! Provider layer for the chorus LLM client: capability traits, the factory
//! contract, the process-global registry, shared SSE/NDJSON framing, and the
//! vendor adapters.
//!
//! This crate never self-registers adapters; the `chorus` umbrella crate
//! registers the built-in factories on first use.

pub mod anthropic;
pub mod elevenlabs;
pub mod factory;
pub mod gemini;
pub mod ollama;
pub mod openai_compat;
pub mod registry;
pub mod sse;
pub mod traits;
pub(crate) mod convert;
pub(crate) mod util;

// Re-exports for convenience.
pub use factory::ProviderFactory;
pub use sse::LineBuffer;
pub use traits::{
    AudioTranslationCapability, ChatCapability, ChatRequest, CompletionCapability,
    CompletionRequest, CompletionResponse, EmbeddingCapability, GeneratedImage,
    ImageGenerationCapability, ImageRequest, ImageResponse, ModerationCapability,
    ModerationResult, Provider, RankedDocument, RerankCapability, RerankRequest,
    SpeechToTextCapability, SttRequest, SttResponse, StreamingTextToSpeechCapability,
    TextToSpeechCapability, TtsEvent, TtsRequest, TtsResponse, WordTiming,
};
