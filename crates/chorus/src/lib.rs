//! chorus: a unified, multi-provider LLM client.
//!
//! One provider-agnostic API for chat, streaming, tool calling, structured
//! output, embeddings, and audio across heterogeneous back-ends. Start from
//! the [`builder`]:
//!
//! ```no_run
//! use chorus::prelude::*;
//!
//! # async fn demo() -> chorus::Result<()> {
//! let model = chorus::builder()
//!     .use_model("openai:gpt-4o-mini")?
//!     .temperature(0.2)
//!     .build()?;
//!
//! let response = model
//!     .chat(&ChatRequest::new(vec![ModelMessage::user("ping")]))
//!     .await?;
//! println!("{}", response.text_or_empty());
//! # Ok(())
//! # }
//! ```

use std::sync::Once;

pub mod agent;
pub mod builder;
pub mod middleware;
pub mod object;

// Re-export the domain and provider surface so callers need one crate.
pub use chorus_domain::cancel::CancellationToken;
pub use chorus_domain::capability::CapabilityKind;
pub use chorus_domain::config::{LlmConfig, ResponseFormat, StructuredOutputFormat};
pub use chorus_domain::error::{codes, LlmError, Result, Warning};
pub use chorus_domain::message::{
    ContentPart, MediaSource, MessageBuilder, ModelMessage, Role, ToolCall, ToolPayload, ToolResult,
};
pub use chorus_domain::stream::{ChatResponse, EventStream, StreamEvent, Usage};
pub use chorus_domain::tool::{ExecutableTool, FunctionTool, ProviderTool, ToolChoice};
pub use chorus_providers::registry;
pub use chorus_providers::{ChatCapability, ChatRequest, Provider, ProviderFactory};

pub use builder::{builder, LanguageModel, LlmBuilder};

/// Everything most callers want in scope.
pub mod prelude {
    pub use crate::agent::{ToolLoopAgent, ToolLoopConfig};
    pub use crate::builder::{builder, LanguageModel, LlmBuilder};
    pub use crate::middleware::Middleware;
    pub use crate::object::{generate_object, stream_object};
    pub use chorus_domain::cancel::CancellationToken;
    pub use chorus_domain::config::StructuredOutputFormat;
    pub use chorus_domain::error::{LlmError, Result};
    pub use chorus_domain::message::{MessageBuilder, ModelMessage, Role};
    pub use chorus_domain::stream::{ChatResponse, StreamEvent};
    pub use chorus_domain::tool::{ExecutableTool, FunctionTool, ToolChoice};
    pub use chorus_providers::{ChatCapability, ChatRequest};
}

static REGISTER_BUILTINS: Once = Once::new();

/// Register every built-in provider factory, exactly once per process.
///
/// The first builder call runs this implicitly; user registrations made
/// earlier win their id (the duplicate here is skipped).
pub fn ensure_builtin_providers() {
    use chorus_providers::openai_compat::{
        OpenAiCompatFactory, COMPATIBLE, DEEPSEEK, GROQ, OPENAI, PHIND, XAI,
    };
    use std::sync::Arc;

    REGISTER_BUILTINS.call_once(|| {
        let factories: Vec<Arc<dyn ProviderFactory>> = vec![
            Arc::new(OpenAiCompatFactory::new(&OPENAI)),
            Arc::new(OpenAiCompatFactory::new(&DEEPSEEK)),
            Arc::new(OpenAiCompatFactory::new(&GROQ)),
            Arc::new(OpenAiCompatFactory::new(&XAI)),
            Arc::new(OpenAiCompatFactory::new(&PHIND)),
            Arc::new(OpenAiCompatFactory::new(&COMPATIBLE)),
            Arc::new(chorus_providers::anthropic::AnthropicFactory),
            Arc::new(chorus_providers::gemini::GeminiFactory),
            Arc::new(chorus_providers::ollama::OllamaFactory),
            Arc::new(chorus_providers::elevenlabs::ElevenLabsFactory),
        ];
        for factory in factories {
            let id = factory.provider_id();
            if let Err(e) = registry::register(factory) {
                tracing::debug!(provider_id = id, error = %e, "built-in registration skipped");
            }
        }
    });
}
