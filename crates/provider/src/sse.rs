//! Pumps an upstream `text/event-stream` body into a [`ChunkStream`].
//!
//! One task per streaming request reads SSE frames in arrival order, maps
//! each `data:` payload through an [`EventMapper`], and pushes the result
//! onto a bounded channel. The task ends exactly once: on EOF, on the
//! `[DONE]` sentinel, on the first error, on cancellation, or when the
//! consumer drops its half. Returning drops the response body.

use eventsource_stream::Eventsource as _;
use futures_util::StreamExt as _;
use keygate_translate::ClaudeStreamTranslator;
use keygate_types::{ChunkSender, ChunkStream, GatewayError, Result, StreamEnd, channel};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

const DONE_SENTINEL: &str = "[DONE]";

/// Maps decoded upstream events into caller-facing chunk payloads.
pub trait EventMapper: Send + 'static {
    /// `Ok(None)` drops the event.
    ///
    /// # Errors
    ///
    /// An error ends the stream as [`StreamEnd::Failed`].
    fn map(&mut self, event: Value) -> Result<Option<Value>>;

    /// Whether upstream signalled a proper end. EOF before that is reported
    /// as [`StreamEnd::Truncated`].
    fn is_complete(&self) -> bool {
        true
    }
}

/// Forwards every event unchanged.
#[derive(Debug, Default)]
pub struct Passthrough;

impl EventMapper for Passthrough {
    fn map(&mut self, event: Value) -> Result<Option<Value>> {
        Ok(Some(event))
    }
}

/// Forwards Anthropic events unchanged but requires `message_stop` before
/// EOF, surfacing in-stream `error` events as failures.
#[derive(Debug, Default)]
pub struct AnthropicPassthrough {
    stopped: bool,
}

impl EventMapper for AnthropicPassthrough {
    fn map(&mut self, event: Value) -> Result<Option<Value>> {
        match event.get("type").and_then(Value::as_str) {
            Some("message_stop") => self.stopped = true,
            Some("error") => return Err(GatewayError::upstream(500, &event.to_string())),
            _ => {}
        }
        Ok(Some(event))
    }

    fn is_complete(&self) -> bool {
        self.stopped
    }
}

impl EventMapper for ClaudeStreamTranslator {
    fn map(&mut self, event: Value) -> Result<Option<Value>> {
        self.translate(&event)
    }

    fn is_complete(&self) -> bool {
        self.is_stopped()
    }
}

/// Spawns the pump task and returns the consumer half.
pub fn spawn<M: EventMapper>(
    ctx: CancellationToken,
    resp: reqwest::Response,
    mapper: M,
    capacity: usize,
) -> ChunkStream {
    let (tx, rx) = channel(capacity);
    tokio::spawn(pump(ctx, resp, mapper, tx));
    rx
}

async fn pump<M: EventMapper>(
    ctx: CancellationToken,
    resp: reqwest::Response,
    mut mapper: M,
    tx: ChunkSender,
) {
    let mut events = resp.bytes_stream().eventsource();
    let mut forwarded = 0usize;
    loop {
        let next = tokio::select! {
            biased;
            () = ctx.cancelled() => {
                tracing::debug!(forwarded, "stream cancelled by caller");
                tx.fail(GatewayError::Cancelled).await;
                return;
            }
            () = tx.closed() => {
                tracing::debug!(forwarded, "stream consumer went away");
                return;
            }
            next = events.next() => next,
        };

        let event = match next {
            None => {
                let end = if mapper.is_complete() {
                    StreamEnd::Completed
                } else {
                    tracing::warn!(forwarded, "upstream stream ended before its terminal event");
                    StreamEnd::Truncated
                };
                tx.finish(end).await;
                return;
            }
            Some(Err(e)) => {
                tx.fail(GatewayError::Network(format!("stream read failed: {e}"))).await;
                return;
            }
            Some(Ok(event)) => event,
        };

        let data = event.data.trim();
        if data.is_empty() {
            continue;
        }
        if data == DONE_SENTINEL {
            tx.finish(StreamEnd::Completed).await;
            return;
        }
        let value = match serde_json::from_str::<Value>(data) {
            Ok(v) => v,
            Err(e) => {
                tx.fail(GatewayError::Protocol(format!("invalid SSE payload: {e}"))).await;
                return;
            }
        };
        match mapper.map(value) {
            Ok(Some(chunk)) => {
                if !tx.send(chunk).await {
                    return;
                }
                forwarded += 1;
            }
            Ok(None) => {}
            Err(e) => {
                tx.fail(e).await;
                return;
            }
        }
    }
}
