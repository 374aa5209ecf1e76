//! The middleware chain: ordered interceptors around chat and chat-stream
//! calls, composed with explicit next-continuations.
//!
//! Middlewares wrap the provider in registration order: the first one
//! registered sees the call first and the response last. Each receives the
//! mutable call and a [`Next`] handle for the rest of the chain; it may
//! rewrite the call, short-circuit with a synthesized response, or observe
//! the result. Cancellation rides inside the call and is never detached.

use std::sync::Arc;
use std::time::Duration;

use chorus_domain::error::{LlmError, Result};
use chorus_domain::message::ModelMessage;
use chorus_domain::stream::{ChatResponse, EventStream};
use chorus_domain::tool::FunctionTool;
use chorus_providers::{ChatCapability, ChatRequest};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait + chain
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One interceptor in the chain. Default implementations pass through.
#[async_trait::async_trait]
pub trait Middleware: Send + Sync {
    async fn chat(&self, call: ChatRequest, next: Next<'_>) -> Result<ChatResponse> {
        next.chat(call).await
    }

    async fn chat_stream(&self, call: ChatRequest, next: Next<'_>) -> Result<EventStream> {
        next.chat_stream(call).await
    }
}

/// The continuation: the middlewares not yet run, then the provider.
///
/// `Copy` so retrying middlewares can invoke the remainder of the chain more
/// than once.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    terminal: &'a dyn ChatCapability,
}

impl<'a> Clone for Next<'a> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a> Copy for Next<'a> {}

impl<'a> Next<'a> {
    pub async fn chat(self, call: ChatRequest) -> Result<ChatResponse> {
        match self.chain.split_first() {
            Some((mw, rest)) => {
                mw.chat(
                    call,
                    Next {
                        chain: rest,
                        terminal: self.terminal,
                    },
                )
                .await
            }
            None => self.terminal.chat(&call).await,
        }
    }

    pub async fn chat_stream(self, call: ChatRequest) -> Result<EventStream> {
        match self.chain.split_first() {
            Some((mw, rest)) => {
                mw.chat_stream(
                    call,
                    Next {
                        chain: rest,
                        terminal: self.terminal,
                    },
                )
                .await
            }
            None => self.terminal.chat_stream(&call).await,
        }
    }
}

/// A chat capability with the middleware chain applied.
struct MiddlewareStack {
    middlewares: Vec<Arc<dyn Middleware>>,
    inner: Arc<dyn ChatCapability>,
}

#[async_trait::async_trait]
impl ChatCapability for MiddlewareStack {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        Next {
            chain: &self.middlewares,
            terminal: &*self.inner,
        }
        .chat(req.clone())
        .await
    }

    async fn chat_stream(&self, req: &ChatRequest) -> Result<EventStream> {
        Next {
            chain: &self.middlewares,
            terminal: &*self.inner,
        }
        .chat_stream(req.clone())
        .await
    }
}

/// Wrap a capability in the given middlewares (first = outermost). A chain of
/// zero returns the capability untouched.
pub fn apply_middleware(
    inner: Arc<dyn ChatCapability>,
    middlewares: Vec<Arc<dyn Middleware>>,
) -> Arc<dyn ChatCapability> {
    if middlewares.is_empty() {
        inner
    } else {
        Arc::new(MiddlewareStack { middlewares, inner })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Built-in: default settings
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Injects a system prompt and default tools into calls that carry none.
#[derive(Default)]
pub struct DefaultSettings {
    pub system_prompt: Option<String>,
    pub tools: Vec<FunctionTool>,
}

impl DefaultSettings {
    fn apply(&self, call: &mut ChatRequest) {
        if let Some(ref prompt) = self.system_prompt {
            let has_system = call
                .messages
                .iter()
                .any(|m| m.role == chorus_domain::message::Role::System);
            if !has_system {
                call.messages.insert(0, ModelMessage::system(prompt.clone()));
            }
        }
        if call.tools.is_empty() && !self.tools.is_empty() {
            call.tools = self.tools.clone();
        }
    }
}

#[async_trait::async_trait]
impl Middleware for DefaultSettings {
    async fn chat(&self, mut call: ChatRequest, next: Next<'_>) -> Result<ChatResponse> {
        self.apply(&mut call);
        next.chat(call).await
    }

    async fn chat_stream(&self, mut call: ChatRequest, next: Next<'_>) -> Result<EventStream> {
        self.apply(&mut call);
        next.chat_stream(call).await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Built-in: retry on rate limit
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Retries 429 responses with exponential backoff, honoring the server's
/// retry-after hint when present. The core never retries implicitly; this is
/// the opt-in policy. Cancellation is never retried.
pub struct RetryOnRateLimit {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryOnRateLimit {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryOnRateLimit {
    fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        retry_after.unwrap_or_else(|| self.base_delay * 2u32.saturating_pow(attempt))
    }
}

#[async_trait::async_trait]
impl Middleware for RetryOnRateLimit {
    async fn chat(&self, call: ChatRequest, next: Next<'_>) -> Result<ChatResponse> {
        let mut attempt = 0;
        loop {
            match next.chat(call.clone()).await {
                Err(LlmError::RateLimit { retry_after }) if attempt < self.max_retries => {
                    let delay = self.delay_for(attempt, retry_after);
                    attempt += 1;
                    tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "rate limited, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = call.cancel.cancelled() => return Err(call.cancel.as_error()),
                    }
                }
                other => return other,
            }
        }
    }

    async fn chat_stream(&self, call: ChatRequest, next: Next<'_>) -> Result<EventStream> {
        // Only the pre-stream handshake is retried; a stream that already
        // yielded events is never replayed.
        let mut attempt = 0;
        loop {
            match next.chat_stream(call.clone()).await {
                Err(LlmError::RateLimit { retry_after }) if attempt < self.max_retries => {
                    let delay = self.delay_for(attempt, retry_after);
                    attempt += 1;
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = call.cancel.cancelled() => return Err(call.cancel.as_error()),
                    }
                }
                other => return other,
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Built-in: request logging
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Logs calls and outcomes through `tracing`.
#[derive(Default)]
pub struct RequestLogging;

#[async_trait::async_trait]
impl Middleware for RequestLogging {
    async fn chat(&self, call: ChatRequest, next: Next<'_>) -> Result<ChatResponse> {
        let messages = call.messages.len();
        let tools = call.tools.len();
        tracing::debug!(messages, tools, "chat call");
        let result = next.chat(call).await;
        match &result {
            Ok(resp) => tracing::debug!(
                text_len = resp.text.as_deref().map(str::len).unwrap_or(0),
                tool_calls = resp.tool_calls.len(),
                "chat done"
            ),
            Err(e) => tracing::warn!(error = %e, "chat failed"),
        }
        result
    }

    async fn chat_stream(&self, call: ChatRequest, next: Next<'_>) -> Result<EventStream> {
        tracing::debug!(messages = call.messages.len(), "chat stream call");
        next.chat_stream(call).await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Terminal that records calls and replies from a script.
    struct Scripted {
        calls: AtomicU32,
        rate_limit_first: u32,
    }

    #[async_trait::async_trait]
    impl ChatCapability for Scripted {
        async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.rate_limit_first {
                return Err(LlmError::RateLimit { retry_after: Some(Duration::from_millis(1)) });
            }
            // Echo what the middleware chain produced.
            let system = req
                .messages
                .first()
                .filter(|m| m.role == chorus_domain::message::Role::System)
                .map(|m| m.joined_text())
                .unwrap_or_default();
            Ok(ChatResponse::from_text(format!(
                "system={system};tools={}",
                req.tools.len()
            )))
        }

        async fn chat_stream(&self, _req: &ChatRequest) -> Result<EventStream> {
            Err(LlmError::Generic("not scripted".into()))
        }
    }

    fn request() -> ChatRequest {
        ChatRequest::new(vec![ModelMessage::user("hi")])
    }

    #[tokio::test]
    async fn empty_chain_is_identity() {
        let inner: Arc<dyn ChatCapability> = Arc::new(Scripted {
            calls: AtomicU32::new(0),
            rate_limit_first: 0,
        });
        let wrapped = apply_middleware(inner.clone(), vec![]);
        let resp = wrapped.chat(&request()).await.unwrap();
        assert_eq!(resp.text_or_empty(), "system=;tools=0");
    }

    #[tokio::test]
    async fn default_settings_injects_when_absent() {
        let inner: Arc<dyn ChatCapability> = Arc::new(Scripted {
            calls: AtomicU32::new(0),
            rate_limit_first: 0,
        });
        let wrapped = apply_middleware(
            inner,
            vec![Arc::new(DefaultSettings {
                system_prompt: Some("be kind".into()),
                tools: vec![FunctionTool::new("t", "d", serde_json::json!({}))],
            })],
        );
        let resp = wrapped.chat(&request()).await.unwrap();
        assert_eq!(resp.text_or_empty(), "system=be kind;tools=1");
    }

    #[tokio::test]
    async fn default_settings_respects_existing() {
        let inner: Arc<dyn ChatCapability> = Arc::new(Scripted {
            calls: AtomicU32::new(0),
            rate_limit_first: 0,
        });
        let wrapped = apply_middleware(
            inner,
            vec![Arc::new(DefaultSettings {
                system_prompt: Some("default".into()),
                tools: vec![],
            })],
        );
        let req = ChatRequest::new(vec![
            ModelMessage::system("explicit"),
            ModelMessage::user("hi"),
        ]);
        let resp = wrapped.chat(&req).await.unwrap();
        assert_eq!(resp.text_or_empty(), "system=explicit;tools=0");
    }

    #[tokio::test]
    async fn retry_gives_up_after_max() {
        let inner: Arc<dyn ChatCapability> = Arc::new(Scripted {
            calls: AtomicU32::new(0),
            rate_limit_first: 10, // always rate limited
        });
        let wrapped = apply_middleware(
            inner,
            vec![Arc::new(RetryOnRateLimit {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
            })],
        );
        let err = wrapped.chat(&request()).await.unwrap_err();
        assert!(matches!(err, LlmError::RateLimit { .. }));
    }

    #[tokio::test]
    async fn retry_succeeds_after_transient_429() {
        let inner: Arc<dyn ChatCapability> = Arc::new(Scripted {
            calls: AtomicU32::new(0),
            rate_limit_first: 2,
        });
        let wrapped = apply_middleware(
            inner,
            vec![Arc::new(RetryOnRateLimit {
                max_retries: 3,
                base_delay: Duration::from_millis(1),
            })],
        );
        let resp = wrapped.chat(&request()).await.unwrap();
        assert_eq!(resp.text_or_empty(), "system=;tools=0");
    }

    #[tokio::test]
    async fn retry_never_retries_after_cancel() {
        let inner: Arc<dyn ChatCapability> = Arc::new(Scripted {
            calls: AtomicU32::new(0),
            rate_limit_first: 10,
        });
        let wrapped = apply_middleware(
            inner,
            vec![Arc::new(RetryOnRateLimit {
                max_retries: 5,
                base_delay: Duration::from_secs(60),
            })],
        );
        let req = request();
        req.cancel.cancel(Some("user"));
        // The first 429 leads into the backoff sleep, which observes the
        // already-cancelled token immediately.
        let err = wrapped.chat(&req).await.unwrap_err();
        assert!(matches!(err, LlmError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn middlewares_compose_in_registration_order() {
        struct Tag(&'static str);

        #[async_trait::async_trait]
        impl Middleware for Tag {
            async fn chat(&self, mut call: ChatRequest, next: Next<'_>) -> Result<ChatResponse> {
                call.messages.push(ModelMessage::user(self.0));
                let mut resp = next.chat(call).await?;
                resp.text = Some(format!("{}<{}", resp.text_or_empty(), self.0));
                Ok(resp)
            }
        }

        struct EchoLast;
        #[async_trait::async_trait]
        impl ChatCapability for EchoLast {
            async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
                let order: Vec<String> =
                    req.messages.iter().map(|m| m.joined_text()).collect();
                Ok(ChatResponse::from_text(order.join(",")))
            }
            async fn chat_stream(&self, _req: &ChatRequest) -> Result<EventStream> {
                Err(LlmError::Generic("unused".into()))
            }
        }

        let wrapped = apply_middleware(
            Arc::new(EchoLast),
            vec![Arc::new(Tag("outer")), Arc::new(Tag("inner"))],
        );
        let resp = wrapped
            .chat(&ChatRequest::new(vec![ModelMessage::user("start")]))
            .await
            .unwrap();
        // Request side: outer appends first. Response side: inner annotates
        // first, outer last.
        assert_eq!(resp.text_or_empty(), "start,outer,inner<inner<outer");
    }
}
