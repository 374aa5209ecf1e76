//! Scripted in-process provider used by the end-to-end scenarios: stands in
//! for the network transport so the orchestration layer runs for real.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use chorus::registry;
use chorus::{
    CapabilityKind, ChatCapability, ChatRequest, ChatResponse, EventStream, LlmConfig, LlmError,
    Provider, ProviderFactory, Result, StreamEvent,
};
use chorus_providers::{RankedDocument, RerankCapability, RerankRequest};

/// One scripted model turn.
#[derive(Clone)]
pub enum FakeTurn {
    Response(ChatResponse),
    Stream(Vec<StreamEvent>),
    Error(String),
}

#[derive(Default)]
pub struct FakeScript {
    turns: Mutex<VecDeque<FakeTurn>>,
    pub requests: Mutex<Vec<ChatRequest>>,
}

impl FakeScript {
    pub fn new(turns: Vec<FakeTurn>) -> Arc<Self> {
        Arc::new(Self {
            turns: Mutex::new(turns.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn pop(&self) -> Result<FakeTurn> {
        self.turns
            .lock()
            .pop_front()
            .ok_or_else(|| LlmError::Generic("fake script exhausted".into()))
    }
}

pub struct FakeProvider {
    script: Arc<FakeScript>,
}

const CAPABILITIES: &[CapabilityKind] = &[
    CapabilityKind::Chat,
    CapabilityKind::Streaming,
    CapabilityKind::ToolCalling,
    CapabilityKind::Rerank,
];

#[async_trait::async_trait]
impl ChatCapability for FakeProvider {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        req.cancel.check()?;
        self.script.requests.lock().push(req.clone());
        match self.script.pop()? {
            FakeTurn::Response(resp) => Ok(resp),
            FakeTurn::Error(msg) => Err(LlmError::Provider {
                provider: "fake".into(),
                message: msg,
            }),
            FakeTurn::Stream(_) => Err(LlmError::Generic(
                "script mismatch: stream turn consumed by chat()".into(),
            )),
        }
    }

    async fn chat_stream(&self, req: &ChatRequest) -> Result<EventStream> {
        req.cancel.check()?;
        self.script.requests.lock().push(req.clone());
        let events = match self.script.pop()? {
            FakeTurn::Stream(events) => events,
            FakeTurn::Error(msg) => {
                return Err(LlmError::Provider {
                    provider: "fake".into(),
                    message: msg,
                })
            }
            FakeTurn::Response(_) => {
                return Err(LlmError::Generic(
                    "script mismatch: response turn consumed by chat_stream()".into(),
                ))
            }
        };
        let cancel = req.cancel.clone();
        Ok(Box::pin(async_stream::stream! {
            for event in events {
                // The cancellation seam: observed before every chunk.
                if cancel.is_cancelled() {
                    yield Err(cancel.as_error());
                    return;
                }
                tokio::task::yield_now().await;
                yield Ok(event);
            }
        }))
    }
}

#[async_trait::async_trait]
impl RerankCapability for FakeProvider {
    /// Scores documents by naive term overlap with the query.
    async fn rerank(&self, req: &RerankRequest) -> Result<Vec<RankedDocument>> {
        let query_terms: Vec<&str> = req.query.split_whitespace().collect();
        let mut ranked: Vec<RankedDocument> = req
            .documents
            .iter()
            .enumerate()
            .map(|(index, doc)| {
                let hits = query_terms
                    .iter()
                    .filter(|t| doc.to_lowercase().contains(&t.to_lowercase()))
                    .count();
                RankedDocument {
                    index,
                    score: hits as f64 / query_terms.len().max(1) as f64,
                }
            })
            .collect();
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        if let Some(n) = req.top_n {
            ranked.truncate(n);
        }
        Ok(ranked)
    }
}

impl Provider for FakeProvider {
    fn provider_id(&self) -> &str {
        "fake"
    }

    fn capabilities(&self) -> &[CapabilityKind] {
        CAPABILITIES
    }

    fn as_chat(&self) -> Option<&dyn ChatCapability> {
        Some(self)
    }

    fn as_rerank(&self) -> Option<&dyn RerankCapability> {
        Some(self)
    }
}

pub struct FakeFactory {
    script: Arc<FakeScript>,
}

impl FakeFactory {
    pub fn new(script: Arc<FakeScript>) -> Self {
        Self { script }
    }
}

impl ProviderFactory for FakeFactory {
    fn provider_id(&self) -> &'static str {
        "fake"
    }

    fn display_name(&self) -> &'static str {
        "Fake (test)"
    }

    fn capabilities(&self) -> &'static [CapabilityKind] {
        CAPABILITIES
    }

    fn defaults(&self) -> LlmConfig {
        LlmConfig::for_model("fake-1")
    }

    fn validate(&self, _config: &LlmConfig) -> Result<()> {
        Ok(())
    }

    fn create(&self, _config: &LlmConfig) -> Result<Arc<dyn Provider>> {
        Ok(Arc::new(FakeProvider {
            script: self.script.clone(),
        }))
    }
}

/// Install the fake under provider id `"fake"`, replacing any previous
/// script.
pub fn register_fake(script: Arc<FakeScript>) {
    registry::register_or_replace(Arc::new(FakeFactory::new(script)));
}
