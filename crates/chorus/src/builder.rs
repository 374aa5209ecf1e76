//! Fluent configuration builder and the typed model handles it produces.
//!
//! The builder accumulates a partial [`LlmConfig`] plus a provider id and a
//! middleware list, then resolves the factory through the registry and
//! returns statically-typed capability handles. Building clones the config:
//! mutating a builder afterwards never changes an already-built model.

use std::sync::Arc;
use std::time::Duration;

use chorus_domain::capability::CapabilityKind;
use chorus_domain::config::{parse_selector, LlmConfig, ResponseFormat};
use chorus_domain::error::{LlmError, Result};
use chorus_domain::stream::{ChatResponse, EventStream};
use chorus_domain::tool::{FunctionTool, ProviderTool, ToolChoice};
use chorus_providers::registry;
use chorus_providers::{
    AudioTranslationCapability, ChatCapability, ChatRequest, CompletionCapability,
    CompletionRequest, CompletionResponse, EmbeddingCapability, ImageGenerationCapability,
    ImageRequest, ImageResponse, ModerationCapability, ModerationResult, Provider,
    RankedDocument, RerankCapability, RerankRequest, SpeechToTextCapability, SttRequest,
    SttResponse, StreamingTextToSpeechCapability, TextToSpeechCapability, TtsEvent, TtsRequest,
    TtsResponse,
};

use crate::middleware::{apply_middleware, Middleware};

/// Start a fresh builder.
pub fn builder() -> LlmBuilder {
    LlmBuilder::new()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Builder
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct LlmBuilder {
    provider_id: Option<String>,
    config: LlmConfig,
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl LlmBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Provider selection ─────────────────────────────────────────

    pub fn provider(mut self, id: impl Into<String>) -> Self {
        self.provider_id = Some(id.into());
        self
    }

    /// Select provider and model in one go from a `"provider:model"`
    /// selector (the model id may itself contain colons).
    pub fn use_model(mut self, selector: &str) -> Result<Self> {
        let (provider, model) = parse_selector(selector)?;
        self.provider_id = Some(provider.to_string());
        self.config.model = model.to_string();
        Ok(self)
    }

    pub fn openai(self) -> Self {
        self.provider("openai")
    }
    pub fn anthropic(self) -> Self {
        self.provider("anthropic")
    }
    pub fn gemini(self) -> Self {
        self.provider("gemini")
    }
    pub fn deepseek(self) -> Self {
        self.provider("deepseek")
    }
    pub fn groq(self) -> Self {
        self.provider("groq")
    }
    pub fn xai(self) -> Self {
        self.provider("xai")
    }
    pub fn phind(self) -> Self {
        self.provider("phind")
    }
    pub fn ollama(self) -> Self {
        self.provider("ollama")
    }
    pub fn elevenlabs(self) -> Self {
        self.provider("elevenlabs")
    }

    // ── Config ─────────────────────────────────────────────────────

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.api_key = Some(key.into());
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.base_url = url.into();
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.config.temperature = Some(temperature);
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.config.max_tokens = Some(max_tokens);
        self
    }

    pub fn top_p(mut self, top_p: f32) -> Self {
        self.config.top_p = Some(top_p);
        self
    }

    pub fn top_k(mut self, top_k: u32) -> Self {
        self.config.top_k = Some(top_k);
        self
    }

    pub fn stop_sequences(mut self, sequences: Vec<String>) -> Self {
        self.config.stop_sequences = sequences;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.config.user = Some(user.into());
        self
    }

    pub fn service_tier(mut self, tier: impl Into<String>) -> Self {
        self.config.service_tier = Some(tier.into());
        self
    }

    pub fn response_format(mut self, format: ResponseFormat) -> Self {
        self.config.response_format = format;
        self
    }

    pub fn tools(mut self, tools: Vec<FunctionTool>) -> Self {
        self.config.tools = tools;
        self
    }

    pub fn tool_choice(mut self, choice: ToolChoice) -> Self {
        self.config.tool_choice = Some(choice);
        self
    }

    pub fn provider_tool(mut self, tool: ProviderTool) -> Self {
        self.config.provider_tools.push(tool);
        self
    }

    /// Transport tunable (custom header map, logging toggles, ...).
    pub fn transport_option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.config.transport_options.insert(key.into(), value);
        self
    }

    /// Provider-specific tunable under the given provider id's namespace.
    pub fn provider_option(
        mut self,
        provider_id: impl Into<String>,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        self.config
            .provider_options
            .entry(provider_id.into())
            .or_default()
            .insert(key.into(), value);
        self
    }

    /// Shorthand: a provider option for the currently-selected provider.
    pub fn extension(self, key: impl Into<String>, value: serde_json::Value) -> Self {
        let provider = self.provider_id.clone().unwrap_or_default();
        self.provider_option(provider, key, value)
    }

    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub fn middlewares(mut self, middlewares: Vec<Arc<dyn Middleware>>) -> Self {
        self.middlewares.extend(middlewares);
        self
    }

    // ── Builds ─────────────────────────────────────────────────────

    fn resolve(&self, needs: CapabilityKind) -> Result<(Arc<dyn Provider>, String)> {
        crate::ensure_builtin_providers();

        let provider_id = self.provider_id.clone().ok_or_else(|| {
            LlmError::InvalidRequest("no provider selected (call .provider() or .use_model())".into())
        })?;
        let factory = registry::lookup(&provider_id).ok_or_else(|| {
            LlmError::InvalidRequest(format!(
                "unknown provider '{provider_id}' (registered: {})",
                registry::list().join(", ")
            ))
        })?;
        if !factory.supports(needs) {
            return Err(LlmError::UnsupportedCapability(format!(
                "provider '{provider_id}' does not support {needs}"
            )));
        }
        factory.validate(&self.config)?;
        let provider = factory.create(&self.config)?;
        Ok((provider, provider_id))
    }

    /// Build the chat capability with the middleware chain applied.
    pub fn build(self) -> Result<Arc<dyn ChatCapability>> {
        let (provider, _) = self.resolve(CapabilityKind::Chat)?;
        let chat: Arc<dyn ChatCapability> = Arc::new(ProviderChat { provider });
        Ok(apply_middleware(chat, self.middlewares))
    }

    /// Build a [`LanguageModel`] handle: the chat capability plus the
    /// identity and capability set needed by the structured-output pipeline.
    pub fn build_language_model(self) -> Result<LanguageModel> {
        let (provider, provider_id) = self.resolve(CapabilityKind::Chat)?;
        let capabilities = provider.capabilities().to_vec();
        let model_id = if self.config.model.is_empty() {
            registry::lookup(&provider_id)
                .map(|f| f.defaults().model)
                .unwrap_or_default()
        } else {
            self.config.model.clone()
        };
        let chat: Arc<dyn ChatCapability> = Arc::new(ProviderChat { provider });
        Ok(LanguageModel {
            provider_id,
            model_id,
            capabilities,
            chat: apply_middleware(chat, self.middlewares),
        })
    }

    pub fn build_embedding(self) -> Result<EmbeddingModel> {
        let (provider, _) = self.resolve(CapabilityKind::Embedding)?;
        Ok(EmbeddingModel { provider })
    }

    pub fn build_tts(self) -> Result<SpeechModel> {
        let (provider, _) = self.resolve(CapabilityKind::TextToSpeech)?;
        Ok(SpeechModel { provider })
    }

    pub fn build_streaming_tts(self) -> Result<StreamingSpeechModel> {
        let (provider, _) = self.resolve(CapabilityKind::StreamingTextToSpeech)?;
        Ok(StreamingSpeechModel { provider })
    }

    pub fn build_stt(self) -> Result<TranscriptionModel> {
        let (provider, _) = self.resolve(CapabilityKind::SpeechToText)?;
        Ok(TranscriptionModel { provider })
    }

    pub fn build_audio_translation(self) -> Result<TranslationModel> {
        let (provider, _) = self.resolve(CapabilityKind::AudioTranslation)?;
        Ok(TranslationModel { provider })
    }

    pub fn build_moderation(self) -> Result<ModerationModel> {
        let (provider, _) = self.resolve(CapabilityKind::Moderation)?;
        Ok(ModerationModel { provider })
    }

    pub fn build_rerank(self) -> Result<RerankModel> {
        let (provider, _) = self.resolve(CapabilityKind::Rerank)?;
        Ok(RerankModel { provider })
    }

    pub fn build_image(self) -> Result<ImageModel> {
        let (provider, _) = self.resolve(CapabilityKind::ImageGeneration)?;
        Ok(ImageModel { provider })
    }

    pub fn build_completion(self) -> Result<CompletionModel> {
        let (provider, _) = self.resolve(CapabilityKind::Completion)?;
        Ok(CompletionModel { provider })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handles
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Adapts an `Arc<dyn Provider>` to its chat interface.
struct ProviderChat {
    provider: Arc<dyn Provider>,
}

impl ProviderChat {
    fn chat_capability(&self) -> Result<&dyn ChatCapability> {
        self.provider.as_chat().ok_or_else(|| {
            LlmError::UnsupportedCapability(format!(
                "provider '{}' does not support chat",
                self.provider.provider_id()
            ))
        })
    }
}

#[async_trait::async_trait]
impl ChatCapability for ProviderChat {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        self.chat_capability()?.chat(req).await
    }

    async fn chat_stream(&self, req: &ChatRequest) -> Result<EventStream> {
        self.chat_capability()?.chat_stream(req).await
    }
}

/// A chat model handle that knows where it came from.
#[derive(Clone)]
pub struct LanguageModel {
    provider_id: String,
    model_id: String,
    capabilities: Vec<CapabilityKind>,
    chat: Arc<dyn ChatCapability>,
}

impl LanguageModel {
    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn supports(&self, kind: CapabilityKind) -> bool {
        self.capabilities.contains(&kind)
    }

    /// The underlying (middleware-wrapped) chat capability.
    pub fn chat_handle(&self) -> Arc<dyn ChatCapability> {
        self.chat.clone()
    }

    pub async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        self.chat.chat(req).await
    }

    pub async fn chat_stream(&self, req: &ChatRequest) -> Result<EventStream> {
        self.chat.chat_stream(req).await
    }
}

#[async_trait::async_trait]
impl ChatCapability for LanguageModel {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        self.chat.chat(req).await
    }

    async fn chat_stream(&self, req: &ChatRequest) -> Result<EventStream> {
        self.chat.chat_stream(req).await
    }
}

macro_rules! capability_handle {
    ($handle:ident, $accessor:ident, $capability:literal, $trait_obj:ty) => {
        pub struct $handle {
            provider: Arc<dyn Provider>,
        }

        impl $handle {
            fn inner(&self) -> Result<&$trait_obj> {
                self.provider.$accessor().ok_or_else(|| {
                    LlmError::UnsupportedCapability(format!(
                        "provider '{}' does not support {}",
                        self.provider.provider_id(),
                        $capability
                    ))
                })
            }

            pub fn provider_id(&self) -> &str {
                self.provider.provider_id()
            }
        }
    };
}

capability_handle!(EmbeddingModel, as_embedding, "embeddings", dyn EmbeddingCapability);
capability_handle!(SpeechModel, as_tts, "text-to-speech", dyn TextToSpeechCapability);
capability_handle!(
    StreamingSpeechModel,
    as_streaming_tts,
    "streaming text-to-speech",
    dyn StreamingTextToSpeechCapability
);
capability_handle!(TranscriptionModel, as_stt, "speech-to-text", dyn SpeechToTextCapability);
capability_handle!(
    TranslationModel,
    as_audio_translation,
    "audio translation",
    dyn AudioTranslationCapability
);
capability_handle!(ModerationModel, as_moderation, "moderation", dyn ModerationCapability);
capability_handle!(RerankModel, as_rerank, "rerank", dyn RerankCapability);
capability_handle!(ImageModel, as_image, "image generation", dyn ImageGenerationCapability);
capability_handle!(CompletionModel, as_completion, "completion", dyn CompletionCapability);

impl EmbeddingModel {
    /// Embed each input; the output is row-aligned with the inputs.
    pub async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        self.inner()?.embed(inputs).await
    }
}

impl SpeechModel {
    pub async fn synthesize(&self, req: &TtsRequest) -> Result<TtsResponse> {
        self.inner()?.synthesize(req).await
    }
}

impl StreamingSpeechModel {
    pub async fn synthesize_stream(
        &self,
        req: &TtsRequest,
    ) -> Result<chorus_domain::stream::BoxStream<'static, Result<TtsEvent>>> {
        self.inner()?.synthesize_stream(req).await
    }
}

impl TranscriptionModel {
    pub async fn transcribe(&self, req: &SttRequest) -> Result<SttResponse> {
        self.inner()?.transcribe(req).await
    }
}

impl TranslationModel {
    pub async fn translate(&self, req: &SttRequest) -> Result<SttResponse> {
        self.inner()?.translate(req).await
    }
}

impl ModerationModel {
    pub async fn moderate(&self, input: &str) -> Result<ModerationResult> {
        self.inner()?.moderate(input).await
    }
}

impl RerankModel {
    /// Rank documents against the query, best first.
    pub async fn rerank(&self, req: &RerankRequest) -> Result<Vec<RankedDocument>> {
        self.inner()?.rerank(req).await
    }
}

impl ImageModel {
    pub async fn generate_image(&self, req: &ImageRequest) -> Result<ImageResponse> {
        self.inner()?.generate_image(req).await
    }
}

impl CompletionModel {
    pub async fn complete(&self, req: &CompletionRequest) -> Result<CompletionResponse> {
        self.inner()?.complete(req).await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_sets_provider_and_model() {
        let b = builder().use_model("ollama:llama3:8b").unwrap();
        assert_eq!(b.provider_id.as_deref(), Some("ollama"));
        assert_eq!(b.config.model, "llama3:8b");
    }

    #[test]
    fn selector_rejects_garbage() {
        assert!(builder().use_model("nocolon").is_err());
    }

    #[test]
    fn build_without_provider_fails() {
        let err = match builder().model("gpt-4o").build() {
            Ok(_) => panic!("expected an error"),
            Err(err) => err,
        };
        assert!(matches!(err, LlmError::InvalidRequest(_)));
    }

    #[test]
    fn unsupported_capability_build_fails() {
        // ElevenLabs has no chat surface.
        let err = match builder().elevenlabs().api_key("xi-test").build() {
            Ok(_) => panic!("expected an error"),
            Err(err) => err,
        };
        assert!(matches!(err, LlmError::UnsupportedCapability(_)));

        // Phind has no embeddings.
        let err = match builder().phind().api_key("ph-test").build_embedding() {
            Ok(_) => panic!("expected an error"),
            Err(err) => err,
        };
        assert!(matches!(err, LlmError::UnsupportedCapability(_)));
    }

    #[test]
    fn typed_builds_resolve_capabilities() {
        let stt = builder()
            .elevenlabs()
            .api_key("xi-test")
            .build_stt()
            .unwrap();
        assert_eq!(stt.provider_id(), "elevenlabs");

        let chat = builder().ollama().build();
        assert!(chat.is_ok());
    }

    #[test]
    fn extension_targets_selected_provider() {
        let b = builder()
            .anthropic()
            .api_key("k")
            .extension("thinking_budget", serde_json::json!(1024));
        assert_eq!(
            b.config.provider_option("anthropic", "thinking_budget"),
            Some(&serde_json::json!(1024))
        );
    }

    #[test]
    fn builder_mutation_after_build_does_not_leak() {
        // Copy-on-write: the built model keeps the config it was built with.
        let model = builder()
            .ollama()
            .model("llama3.2")
            .build_language_model()
            .unwrap();
        assert_eq!(model.model_id(), "llama3.2");

        // A second, different build from a fresh builder leaves the first
        // handle untouched.
        let other = builder()
            .ollama()
            .model("qwen2.5")
            .build_language_model()
            .unwrap();
        assert_eq!(model.model_id(), "llama3.2");
        assert_eq!(other.model_id(), "qwen2.5");
    }

    #[test]
    fn language_model_reports_capabilities() {
        let model = builder().ollama().build_language_model().unwrap();
        assert_eq!(model.provider_id(), "ollama");
        assert!(model.supports(CapabilityKind::Chat));
        assert!(model.supports(CapabilityKind::ToolCalling));
        assert!(!model.supports(CapabilityKind::TextToSpeech));
    }
}
