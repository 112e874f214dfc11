//! Upstream response relay.
//!
//! Bytes go to the caller as they arrive. On the side, the assistant text is
//! collected so the finished exchange can be written to the ledger.

use std::sync::Arc;

use axum::body::Body;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use spine_core::ContextInterpreter;

/// Upper bound on bytes held for reply extraction.
const CAPTURE_LIMIT: usize = 4 * 1024 * 1024;

/// Extracts assistant text from an OpenAI-shaped chat completion, either a
/// single JSON document or a `text/event-stream` of `delta` chunks.
#[derive(Debug)]
pub struct ReplyCollector {
    streaming: bool,
    pending: Vec<u8>,
    reply: String,
    parsed: bool,
    overflowed: bool,
}

impl ReplyCollector {
    pub fn new(streaming: bool) -> Self {
        Self {
            streaming,
            pending: Vec::new(),
            reply: String::new(),
            parsed: false,
            overflowed: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        if self.overflowed {
            return;
        }
        if self.pending.len() + chunk.len() > CAPTURE_LIMIT || self.reply.len() > CAPTURE_LIMIT {
            tracing::debug!("reply capture limit reached; exchange will not be recorded");
            self.overflowed = true;
            self.pending.clear();
            return;
        }
        if !self.streaming {
            self.pending.extend_from_slice(chunk);
            return;
        }

        self.pending
            .extend(chunk.iter().copied().filter(|b| *b != b'\r'));
        while let Some(end) = self.pending.windows(2).position(|w| w == b"\n\n") {
            let event: Vec<u8> = self.pending.drain(..end + 2).collect();
            self.take_event(&event[..end]);
        }
    }

    fn take_event(&mut self, event: &[u8]) {
        let text = String::from_utf8_lossy(event);
        for line in text.lines() {
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim_start();
            if data == "[DONE]" {
                continue;
            }
            let Ok(value) = serde_json::from_str::<Value>(data) else {
                continue;
            };
            self.parsed = true;
            if let Some(piece) = value
                .pointer("/choices/0/delta/content")
                .and_then(Value::as_str)
            {
                self.reply.push_str(piece);
            }
        }
    }

    /// The assistant text, or `None` if the body never parsed.
    pub fn finish(mut self) -> Option<String> {
        if self.overflowed {
            return None;
        }
        if self.streaming {
            if !self.pending.is_empty() {
                let rest = std::mem::take(&mut self.pending);
                self.take_event(&rest);
            }
            return self.parsed.then_some(self.reply);
        }
        let value: Value = serde_json::from_slice(&self.pending).ok()?;
        value
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

/// Writes the exchange once the upstream reply has been fully relayed.
pub struct ExchangeRecorder {
    pub interpreter: Arc<ContextInterpreter>,
    pub identity: String,
    pub user_message: String,
}

impl ExchangeRecorder {
    async fn record(self, reply: String) {
        let Self {
            interpreter,
            identity,
            user_message,
        } = self;
        let outcome = tokio::task::spawn_blocking(move || {
            interpreter
                .record_exchange(&identity, &user_message, &reply)
                .map_err(|e| (identity, e))
        })
        .await;

        match outcome {
            Ok(Ok(entry)) => tracing::debug!(
                sequence = entry.sequence_number,
                rights = %entry.author_rights,
                "exchange recorded"
            ),
            Ok(Err((identity, e))) if e.is_security_relevant() => {
                tracing::warn!(identity = %identity, error = %e, "exchange not recorded")
            }
            Ok(Err((identity, e))) => {
                tracing::error!(identity = %identity, error = %e, "exchange not recorded")
            }
            Err(e) => tracing::error!(error = %e, "exchange recording task failed"),
        }
    }
}

/// Stream `upstream` to the caller unchanged. When `tee` is set and the
/// stream ends cleanly, the collected reply is recorded before the body
/// completes. A caller that disconnects drops the stream and nothing is
/// recorded.
pub fn relay_body<S>(upstream: S, tee: Option<(ExchangeRecorder, ReplyCollector)>) -> Body
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
{
    Body::from_stream(async_stream::stream! {
        let mut tee = tee;
        let mut complete = true;
        tokio::pin!(upstream);

        while let Some(chunk) = upstream.next().await {
            match chunk {
                Ok(chunk) => {
                    if let Some((_, collector)) = tee.as_mut() {
                        collector.push(&chunk);
                    }
                    yield Ok::<Bytes, std::io::Error>(chunk);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "upstream body ended early");
                    complete = false;
                    yield Err(std::io::Error::other(e));
                    break;
                }
            }
        }

        if complete {
            if let Some((recorder, collector)) = tee {
                match collector.finish() {
                    Some(reply) if !reply.is_empty() => recorder.record(reply).await,
                    _ => tracing::debug!("no assistant text in reply; nothing recorded"),
                }
            }
        }
    })
}
