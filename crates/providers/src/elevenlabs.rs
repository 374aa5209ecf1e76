//! ElevenLabs adapter: text-to-speech (one-shot and streamed) and
//! speech-to-text with per-word timings.

use std::sync::Arc;

use serde_json::Value;

use chorus_domain::capability::CapabilityKind;
use chorus_domain::config::LlmConfig;
use chorus_domain::error::{LlmError, Result};
use chorus_domain::stream::BoxStream;

use crate::factory::ProviderFactory;
use crate::traits::{
    Provider, SpeechToTextCapability, SttRequest, SttResponse, StreamingTextToSpeechCapability,
    TextToSpeechCapability, TtsEvent, TtsRequest, TtsResponse, WordTiming,
};
use crate::util::{from_reqwest, resolve_api_key, send_checked, send_json};

const DEFAULT_BASE_URL: &str = "https://api.elevenlabs.io";
const DEFAULT_TTS_MODEL: &str = "eleven_multilingual_v2";
const DEFAULT_STT_MODEL: &str = "scribe_v1";
/// "Rachel", the service's standard demo voice.
const DEFAULT_VOICE_ID: &str = "21m00Tcm4TlvDq8ikWAM";

const CAPABILITIES: &[CapabilityKind] = &[
    CapabilityKind::TextToSpeech,
    CapabilityKind::StreamingTextToSpeech,
    CapabilityKind::SpeechToText,
];

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Factory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ElevenLabsFactory;

impl ProviderFactory for ElevenLabsFactory {
    fn provider_id(&self) -> &'static str {
        "elevenlabs"
    }

    fn display_name(&self) -> &'static str {
        "ElevenLabs"
    }

    fn capabilities(&self) -> &'static [CapabilityKind] {
        CAPABILITIES
    }

    fn defaults(&self) -> LlmConfig {
        LlmConfig {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_TTS_MODEL.to_string(),
            ..Default::default()
        }
    }

    fn validate(&self, _config: &LlmConfig) -> Result<()> {
        Ok(())
    }

    fn create(&self, config: &LlmConfig) -> Result<Arc<dyn Provider>> {
        Ok(Arc::new(ElevenLabsProvider::new(config)?))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ElevenLabsProvider {
    id: String,
    base_url: String,
    api_key: String,
    model: String,
    config: LlmConfig,
    client: reqwest::Client,
}

impl ElevenLabsProvider {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = resolve_api_key(config, "ELEVENLABS_API_KEY", "elevenlabs")?;
        let config = config.clone().with_defaults(&LlmConfig {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_TTS_MODEL.to_string(),
            ..Default::default()
        });
        let client = reqwest::Client::builder().build().map_err(from_reqwest)?;

        Ok(Self {
            id: "elevenlabs".to_string(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            config,
            client,
        })
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let mut rb = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header("xi-api-key", &self.api_key);
        if let Some(t) = self.config.timeout {
            rb = rb.timeout(t);
        }
        rb
    }

    fn tts_body(&self, req: &TtsRequest) -> Value {
        let mut body = serde_json::json!({
            "text": req.text,
            "model_id": req.model.as_deref().unwrap_or(&self.model),
        });
        if let Some(speed) = req.speed {
            body["voice_settings"] = serde_json::json!({"speed": speed});
        }
        body
    }

    fn voice_id<'a>(&'a self, req: &'a TtsRequest) -> &'a str {
        req.voice.as_deref().unwrap_or(DEFAULT_VOICE_ID)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl TextToSpeechCapability for ElevenLabsProvider {
    async fn synthesize(&self, req: &TtsRequest) -> Result<TtsResponse> {
        let path = format!("/v1/text-to-speech/{}", self.voice_id(req));
        let body = self.tts_body(req);

        tracing::debug!(provider = %self.id, voice = %self.voice_id(req), "tts request");

        let response = send_checked(&self.id, self.post(&path).json(&body), &req.cancel).await?;
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("audio/mpeg")
            .to_string();
        let audio = response.bytes().await.map_err(from_reqwest)?.to_vec();

        Ok(TtsResponse {
            audio,
            content_type,
            sample_rate: None,
        })
    }
}

#[async_trait::async_trait]
impl StreamingTextToSpeechCapability for ElevenLabsProvider {
    async fn synthesize_stream(
        &self,
        req: &TtsRequest,
    ) -> Result<BoxStream<'static, Result<TtsEvent>>> {
        let path = format!("/v1/text-to-speech/{}/stream", self.voice_id(req));
        let body = self.tts_body(req);

        tracing::debug!(provider = %self.id, voice = %self.voice_id(req), "tts stream request");

        let response = send_checked(&self.id, self.post(&path).json(&body), &req.cancel).await?;
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("audio/mpeg")
            .to_string();
        let cancel = req.cancel.clone();

        let stream = async_stream::stream! {
            yield Ok(TtsEvent::Metadata {
                content_type,
                sample_rate: None,
            });

            let mut response = response;
            loop {
                let chunk = tokio::select! {
                    c = response.chunk() => c,
                    _ = cancel.cancelled() => {
                        yield Err(cancel.as_error());
                        return;
                    }
                };
                match chunk {
                    Ok(Some(bytes)) => yield Ok(TtsEvent::AudioChunk(bytes.to_vec())),
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(from_reqwest(e));
                        return;
                    }
                }
            }

            yield Ok(TtsEvent::Finish);
        };

        Ok(Box::pin(stream))
    }
}

#[async_trait::async_trait]
impl SpeechToTextCapability for ElevenLabsProvider {
    async fn transcribe(&self, req: &SttRequest) -> Result<SttResponse> {
        let mime = if req.mime.is_empty() { "audio/wav" } else { &req.mime };
        let part = reqwest::multipart::Part::bytes(req.audio.clone())
            .file_name(if req.filename.is_empty() {
                "audio.wav".to_string()
            } else {
                req.filename.clone()
            })
            .mime_str(mime)
            .map_err(|e| LlmError::InvalidRequest(format!("bad audio mime '{mime}': {e}")))?;

        let mut form = reqwest::multipart::Form::new().part("file", part).text(
            "model_id",
            req.model.clone().unwrap_or_else(|| DEFAULT_STT_MODEL.to_string()),
        );
        if let Some(ref lang) = req.language {
            form = form.text("language_code", lang.clone());
        }

        tracing::debug!(provider = %self.id, "stt request");

        let json = send_json(
            &self.id,
            self.post("/v1/speech-to-text").multipart(form),
            &req.cancel,
        )
        .await?;

        Ok(parse_stt_response(&json))
    }
}

fn parse_stt_response(json: &Value) -> SttResponse {
    let words = json
        .get("words")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                // Spacing entries carry type "spacing"; only words have timings
                // worth surfacing.
                .filter(|w| {
                    w.get("type").and_then(Value::as_str).unwrap_or("word") == "word"
                })
                .filter_map(|w| {
                    Some(WordTiming {
                        word: w.get("text")?.as_str()?.to_string(),
                        start: w.get("start")?.as_f64()?,
                        end: w.get("end")?.as_f64()?,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    SttResponse {
        text: json
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        language: json
            .get("language_code")
            .and_then(Value::as_str)
            .map(String::from),
        words,
    }
}

impl Provider for ElevenLabsProvider {
    fn provider_id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> &[CapabilityKind] {
        CAPABILITIES
    }

    fn as_tts(&self) -> Option<&dyn TextToSpeechCapability> {
        Some(self)
    }

    fn as_streaming_tts(&self) -> Option<&dyn StreamingTextToSpeechCapability> {
        Some(self)
    }

    fn as_stt(&self) -> Option<&dyn SpeechToTextCapability> {
        Some(self)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn voice_defaults_applied() {
        let p = ElevenLabsProvider::new(&LlmConfig {
            api_key: Some("xi-test".into()),
            ..Default::default()
        })
        .unwrap();

        let req = TtsRequest::new("hello");
        assert_eq!(p.voice_id(&req), DEFAULT_VOICE_ID);

        let req = TtsRequest {
            voice: Some("custom-voice".into()),
            ..TtsRequest::new("hello")
        };
        assert_eq!(p.voice_id(&req), "custom-voice");

        let body = p.tts_body(&req);
        assert_eq!(body["model_id"], DEFAULT_TTS_MODEL);
        assert_eq!(body["text"], "hello");
    }

    #[test]
    fn stt_parse_filters_spacing_entries() {
        let json = serde_json::json!({
            "text": "hello world",
            "language_code": "en",
            "words": [
                {"text": "hello", "start": 0.0, "end": 0.4, "type": "word"},
                {"text": " ", "start": 0.4, "end": 0.5, "type": "spacing"},
                {"text": "world", "start": 0.5, "end": 0.9, "type": "word"},
            ],
        });
        let resp = parse_stt_response(&json);
        assert_eq!(resp.text, "hello world");
        assert_eq!(resp.language.as_deref(), Some("en"));
        assert_eq!(resp.words.len(), 2);
        assert_eq!(resp.words[1].word, "world");
        assert!((resp.words[1].start - 0.5).abs() < f64::EPSILON);
    }
}
