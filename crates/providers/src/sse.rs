//! Shared streaming infrastructure for all provider adapters.
//!
//! Every streaming endpoint speaks a line-framed protocol: SSE (`data:`
//! payloads, `[DONE]` sentinel) or NDJSON (one JSON object per line). The
//! pieces here are:
//! - [`LineBuffer`]: a single-consumer line framer over raw bytes
//! - [`data_line`]: SSE `data:` extraction applied atop the framer
//! - [`event_stream`]: build an [`EventStream`] from a response + a
//!   provider-specific parser closure
//!
//! The framer is byte-oriented so a chunk boundary in the middle of a UTF-8
//! codepoint stays buffered until its line completes; decoded lines never
//! contain mojibake.

use chorus_domain::cancel::CancellationToken;
use chorus_domain::error::Result;
use chorus_domain::stream::{EventStream, StreamAccumulator, StreamEvent};

use crate::util::from_reqwest;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LineBuffer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A line framer: `append` returns the lines completed by the new chunk
/// (split on LF, trailing CR stripped) and retains any partial tail.
///
/// Not SSE-semantic; `data:` / `event:` / `[DONE]` interpretation happens
/// in the adapter on top of this. Single-consumer: never share one buffer
/// across concurrent decoders.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; get back every line it completed, in order.
    pub fn append(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop(); // the LF
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// The buffered partial line, if any, consuming it.
    pub fn take_remainder(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        Some(rest)
    }

    /// Drop any buffered bytes.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SSE semantics
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Extract the payload of an SSE `data:` line. `event:` / `id:` / `retry:`
/// lines, comments, and blank separators return `None`.
pub fn data_line(line: &str) -> Option<&str> {
    let payload = line.strip_prefix("data:")?.trim();
    (!payload.is_empty()).then_some(payload)
}

/// How a streaming body is framed into parser payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
    /// SSE: only `data:` payloads reach the parser.
    Sse,
    /// NDJSON: every non-empty line reaches the parser.
    Ndjson,
}

impl Framing {
    fn extract<'a>(&self, line: &'a str) -> Option<&'a str> {
        match self {
            Framing::Sse => data_line(line),
            Framing::Ndjson => {
                let trimmed = line.trim();
                (!trimmed.is_empty()).then_some(trimmed)
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event stream driver
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Build an [`EventStream`] from a streaming response and a provider-specific
/// parser closure.
///
/// The closure receives each framed payload and returns zero or more events.
/// It is `FnMut` because adapters keep per-stream assembly state (open text
/// segments, partial tool calls).
///
/// The driver:
/// 1. checks cancellation before every chunk and aborts the in-flight read
///    when the token fires (a terminal `Err(Cancelled)` ends the stream)
/// 2. frames chunks into lines, flushing the tail when the body closes
/// 3. guarantees exactly one terminal event: stops after the parser's
///    `Finish`, and synthesizes a `Finish` from the accumulated events if
///    the body closes without one
pub(crate) fn event_stream<F>(
    response: reqwest::Response,
    framing: Framing,
    cancel: CancellationToken,
    mut parse_payload: F,
) -> EventStream
where
    F: FnMut(&str) -> Vec<Result<StreamEvent>> + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut response = response;
        let mut buffer = LineBuffer::new();
        let mut acc = StreamAccumulator::new();
        let mut finished = false;

        'read: loop {
            if cancel.is_cancelled() {
                yield Err(cancel.as_error());
                return;
            }

            let chunk = tokio::select! {
                c = response.chunk() => c,
                _ = cancel.cancelled() => {
                    yield Err(cancel.as_error());
                    return;
                }
            };

            match chunk {
                Ok(Some(bytes)) => {
                    for line in buffer.append(&bytes) {
                        let Some(payload) = framing.extract(&line) else {
                            continue;
                        };
                        for event in parse_payload(payload) {
                            match event {
                                Ok(ev) => {
                                    acc.apply(&ev);
                                    let terminal = ev.is_terminal();
                                    yield Ok(ev);
                                    if terminal {
                                        finished = true;
                                        break 'read;
                                    }
                                }
                                Err(e) => {
                                    yield Err(e);
                                    return;
                                }
                            }
                        }
                    }
                }
                Ok(None) => {
                    // Body closed; a protocol without a trailing newline may
                    // leave one last payload buffered.
                    if let Some(line) = buffer.take_remainder() {
                        if let Some(payload) = framing.extract(&line) {
                            for event in parse_payload(payload) {
                                match event {
                                    Ok(ev) => {
                                        acc.apply(&ev);
                                        let terminal = ev.is_terminal();
                                        yield Ok(ev);
                                        if terminal {
                                            finished = true;
                                            break;
                                        }
                                    }
                                    Err(e) => {
                                        yield Err(e);
                                        return;
                                    }
                                }
                            }
                        }
                    }
                    break;
                }
                Err(e) => {
                    yield Err(from_reqwest(e));
                    return;
                }
            }
        }

        if !finished {
            yield Ok(StreamEvent::Finish(acc.into_response()));
        }
    };

    Box::pin(stream)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
