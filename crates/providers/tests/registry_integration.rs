//! Integration tests for the factory registry and the built-in factories'
//! creation paths.

use std::sync::Mutex;

use chorus_domain::capability::CapabilityKind;
use chorus_domain::config::LlmConfig;
use chorus_domain::error::LlmError;
use chorus_providers::anthropic::AnthropicFactory;
use chorus_providers::elevenlabs::ElevenLabsFactory;
use chorus_providers::gemini::GeminiFactory;
use chorus_providers::ollama::OllamaFactory;
use chorus_providers::openai_compat::{self, OpenAiCompatFactory};
use chorus_providers::registry;
use chorus_providers::ProviderFactory;

use std::sync::Arc;

// The registry is process-global; serialize every test that touches it.
static LOCK: Mutex<()> = Mutex::new(());

fn register_builtins() {
    registry::clear();
    registry::register(Arc::new(OpenAiCompatFactory::new(&openai_compat::OPENAI))).unwrap();
    registry::register(Arc::new(OpenAiCompatFactory::new(&openai_compat::DEEPSEEK))).unwrap();
    registry::register(Arc::new(OpenAiCompatFactory::new(&openai_compat::GROQ))).unwrap();
    registry::register(Arc::new(AnthropicFactory)).unwrap();
    registry::register(Arc::new(GeminiFactory)).unwrap();
    registry::register(Arc::new(OllamaFactory)).unwrap();
    registry::register(Arc::new(ElevenLabsFactory)).unwrap();
}

#[test]
fn builtins_register_and_enumerate() {
    let _g = LOCK.lock().unwrap();
    register_builtins();

    let ids = registry::list();
    assert_eq!(
        ids,
        vec![
            "anthropic",
            "deepseek",
            "elevenlabs",
            "gemini",
            "groq",
            "ollama",
            "openai",
        ]
    );
    registry::clear();
}

#[test]
fn capability_queries_cut_across_vendors() {
    let _g = LOCK.lock().unwrap();
    register_builtins();

    let chat = registry::providers_with(CapabilityKind::Chat);
    assert!(chat.contains(&"openai".to_string()));
    assert!(chat.contains(&"anthropic".to_string()));
    assert!(!chat.contains(&"elevenlabs".to_string()));

    let tts = registry::providers_with(CapabilityKind::TextToSpeech);
    assert_eq!(tts, vec!["elevenlabs", "openai"]);

    let stt = registry::providers_with(CapabilityKind::SpeechToText);
    assert_eq!(stt, vec!["elevenlabs", "groq", "openai"]);

    let reasoning = registry::providers_with(CapabilityKind::Reasoning);
    assert_eq!(reasoning, vec!["anthropic", "deepseek"]);
    registry::clear();
}

#[test]
fn create_path_validates_then_constructs() {
    let _g = LOCK.lock().unwrap();
    register_builtins();

    // Unknown provider id.
    let err = match registry::create("nope", &LlmConfig::default()) {
        Ok(_) => panic!("expected an error"),
        Err(err) => err,
    };
    assert!(matches!(err, LlmError::InvalidRequest(_)));

    // Bad sampling config caught by validate before create.
    let bad = LlmConfig {
        api_key: Some("k".into()),
        temperature: Some(9.0),
        ..Default::default()
    };
    let err = match registry::create("openai", &bad) {
        Ok(_) => panic!("expected an error"),
        Err(err) => err,
    };
    assert!(matches!(err, LlmError::InvalidRequest(_)));

    // Missing key surfaces as Auth at construction.
    std::env::remove_var("OPENAI_API_KEY");
    let err = match registry::create("openai", &LlmConfig::default()) {
        Ok(_) => panic!("expected an error"),
        Err(err) => err,
    };
    assert!(matches!(err, LlmError::Auth(_)));

    // A keyless local runtime constructs fine.
    let provider = registry::create("ollama", &LlmConfig::default()).unwrap();
    assert_eq!(provider.provider_id(), "ollama");
    assert!(provider.as_chat().is_some());
    assert!(provider.as_embedding().is_some());
    assert!(provider.as_tts().is_none());
    registry::clear();
}

#[test]
fn factory_defaults_fill_config_gaps() {
    let _g = LOCK.lock().unwrap();

    let factory = OpenAiCompatFactory::new(&openai_compat::OPENAI);
    let defaults = factory.defaults();
    assert_eq!(defaults.base_url, "https://api.openai.com/v1");
    assert_eq!(defaults.model, "gpt-4o");

    let merged = LlmConfig {
        model: "gpt-4o-mini".into(),
        ..Default::default()
    }
    .with_defaults(&defaults);
    assert_eq!(merged.base_url, "https://api.openai.com/v1");
    assert_eq!(merged.model, "gpt-4o-mini");
}

#[test]
fn provider_capability_accessors_match_advertisement() {
    let _g = LOCK.lock().unwrap();

    let provider = ElevenLabsFactory
        .create(&LlmConfig {
            api_key: Some("xi-test".into()),
            ..Default::default()
        })
        .unwrap();

    assert!(provider.as_tts().is_some());
    assert!(provider.as_streaming_tts().is_some());
    assert!(provider.as_stt().is_some());
    assert!(provider.as_chat().is_none());
    assert!(provider.supports(CapabilityKind::TextToSpeech));
    assert!(!provider.supports(CapabilityKind::Chat));
}
