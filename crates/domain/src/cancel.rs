//! One-shot cancellation tokens.
//!
//! A [`CancellationToken`] is a clonable handle over shared state. The first
//! `cancel()` wins: it records the reason, fires every registered listener
//! exactly once, and wakes any task parked on [`CancellationToken::cancelled`].
//! Later cancels are no-ops. Tokens outlive the request they cancel.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::LlmError;

type Listener = Box<dyn FnOnce(Option<&str>) + Send>;

struct State {
    cancelled: bool,
    reason: Option<String>,
    listeners: Vec<Listener>,
}

struct Inner {
    state: Mutex<State>,
    notify: Notify,
}

/// A one-shot cancellation signal shared between a caller and in-flight work.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    cancelled: false,
                    reason: None,
                    listeners: Vec::new(),
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation. Idempotent: the first call's reason sticks and
    /// listeners fire exactly once; subsequent calls do nothing.
    pub fn cancel(&self, reason: Option<&str>) {
        let listeners = {
            let mut state = self.inner.state.lock();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            state.reason = reason.map(str::to_owned);
            std::mem::take(&mut state.listeners)
        };
        // Fire outside the lock so listeners may inspect the token.
        for listener in listeners {
            listener(reason);
        }
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.state.lock().cancelled
    }

    /// The reason passed to the winning `cancel()` call, if any.
    pub fn reason(&self) -> Option<String> {
        self.inner.state.lock().reason.clone()
    }

    /// Register a listener. If the token is already cancelled the listener
    /// fires immediately on the calling thread.
    pub fn on_cancel(&self, listener: impl FnOnce(Option<&str>) + Send + 'static) {
        let reason = {
            let mut state = self.inner.state.lock();
            if !state.cancelled {
                state.listeners.push(Box::new(listener));
                return;
            }
            state.reason.clone()
        };
        listener(reason.as_deref());
    }

    /// Wait until the token is cancelled. Returns immediately if it already
    /// is. Adapters `select!` this against in-flight HTTP futures so the
    /// underlying request is dropped (aborted) on cancel.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            // Re-check after arming the waiter to close the race with cancel().
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// The [`LlmError`] this token's cancellation maps to.
    pub fn as_error(&self) -> LlmError {
        LlmError::Cancelled {
            reason: self.reason(),
        }
    }

    /// Shorthand: `Err(Cancelled)` if the token has fired.
    pub fn check(&self) -> crate::error::Result<()> {
        if self.is_cancelled() {
            Err(self.as_error())
        } else {
            Ok(())
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("CancellationToken")
            .field("cancelled", &state.cancelled)
            .field("reason", &state.reason)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn token_lifecycle() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());
        token.cancel(Some("user"));
        assert!(token.is_cancelled());
        assert_eq!(token.reason().as_deref(), Some("user"));
        assert!(matches!(
            token.check(),
            Err(LlmError::Cancelled { reason: Some(r) }) if r == "user"
        ));
    }

    #[test]
    fn cancel_is_idempotent_first_reason_wins() {
        let token = CancellationToken::new();
        token.cancel(Some("r1"));
        token.cancel(Some("r2"));
        assert_eq!(token.reason().as_deref(), Some("r1"));
    }

    #[test]
    fn listeners_fire_exactly_once() {
        let token = CancellationToken::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        token.on_cancel(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        token.cancel(Some("r1"));
        token.cancel(Some("r2"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_added_after_cancel_fires_immediately() {
        let token = CancellationToken::new();
        token.cancel(None);
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        token.on_cancel(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_receives_reason() {
        let token = CancellationToken::new();
        let seen = Arc::new(Mutex::new(None::<String>));
        let s = seen.clone();
        token.on_cancel(move |reason| {
            *s.lock() = reason.map(str::to_owned);
        });
        token.cancel(Some("shutdown"));
        assert_eq!(seen.lock().as_deref(), Some("shutdown"));
    }

    #[test]
    fn clone_shares_state() {
        let token = CancellationToken::new();
        let clone = token.clone();
        token.cancel(Some("done"));
        assert!(clone.is_cancelled());
        assert_eq!(clone.reason().as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn cancelled_future_resolves() {
        let token = CancellationToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });
        tokio::task::yield_now().await;
        token.cancel(Some("stop"));
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn cancelled_future_immediate_when_already_cancelled() {
        let token = CancellationToken::new();
        token.cancel(None);
        // Must not hang.
        token.cancelled().await;
    }
}
