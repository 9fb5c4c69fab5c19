//! Anthropic streaming events → `OpenAI` `chat.completion.chunk` frames.
//!
//! Handled events:
//! - `message_start`: records `id` and `model`, emits the role chunk
//! - `content_block_start`: a `tool_use` block opens a new `tool_calls` entry
//! - `content_block_delta`: `text_delta` becomes content, `input_json_delta`
//!   becomes tool-call arguments
//! - `message_delta`: emits the finish chunk with usage
//! - `error`: surfaces as [`GatewayError::Upstream`]
//!
//! `ping`, `content_block_stop`, `message_stop` and thinking deltas produce
//! nothing.

use crate::response::{completion_id, finish_reason};
use keygate_types::{GatewayError, Result};
use serde_json::{Value, json};
use std::collections::HashMap;

/// Per-stream translation state. Create one per upstream response.
#[derive(Debug, Default)]
pub struct ClaudeStreamTranslator {
    id: Option<String>,
    model: Option<String>,
    input_tokens: u64,
    /// Anthropic content-block index → `OpenAI` tool-call index.
    tool_slots: HashMap<u64, usize>,
    stopped: bool,
}

impl ClaudeStreamTranslator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` once `message_stop` has been seen.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Translates one decoded event. `Ok(None)` means the event has no
    /// `OpenAI` counterpart.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Upstream`] for an in-stream `error` event.
    pub fn translate(&mut self, event: &Value) -> Result<Option<Value>> {
        let kind = event.get("type").and_then(Value::as_str).unwrap_or("");
        let chunk = match kind {
            "message_start" => {
                let message = event.get("message").unwrap_or(&Value::Null);
                self.id = message.get("id").and_then(Value::as_str).map(str::to_string);
                self.model = message.get("model").and_then(Value::as_str).map(str::to_string);
                self.input_tokens = message
                    .pointer("/usage/input_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                Some(self.chunk(json!({"role": "assistant", "content": ""}), Value::Null))
            }
            "content_block_start" => self.block_start(event),
            "content_block_delta" => self.block_delta(event),
            "message_delta" => {
                let reason = finish_reason(event.pointer("/delta/stop_reason").and_then(Value::as_str));
                let output = event
                    .pointer("/usage/output_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                let mut chunk = self.chunk(json!({}), Value::String(reason.into()));
                chunk["usage"] = json!({
                    "prompt_tokens": self.input_tokens,
                    "completion_tokens": output,
                    "total_tokens": self.input_tokens + output,
                });
                Some(chunk)
            }
            "message_stop" => {
                self.stopped = true;
                None
            }
            "error" => {
                let status = match event.pointer("/error/type").and_then(Value::as_str) {
                    Some("overloaded_error") => 529,
                    Some("rate_limit_error") => 429,
                    Some("invalid_request_error") => 400,
                    _ => 500,
                };
                return Err(GatewayError::upstream(status, &event.to_string()));
            }
            _ => None,
        };
        Ok(chunk)
    }

    fn block_start(&mut self, event: &Value) -> Option<Value> {
        let block = event.get("content_block")?;
        if block.get("type").and_then(Value::as_str) != Some("tool_use") {
            return None;
        }
        let slot = self.tool_slots.len();
        self.tool_slots
            .insert(event.get("index").and_then(Value::as_u64).unwrap_or(0), slot);
        Some(self.chunk(
            json!({"tool_calls": [{
                "index": slot,
                "id": block.get("id").cloned().unwrap_or(Value::Null),
                "type": "function",
                "function": {"name": block.get("name").cloned().unwrap_or(Value::Null), "arguments": ""},
            }]}),
            Value::Null,
        ))
    }

    fn block_delta(&self, event: &Value) -> Option<Value> {
        let delta = event.get("delta")?;
        match delta.get("type").and_then(Value::as_str)? {
            "text_delta" => {
                let text = delta.get("text").and_then(Value::as_str).unwrap_or("");
                Some(self.chunk(json!({"content": text}), Value::Null))
            }
            "input_json_delta" => {
                let index = event.get("index").and_then(Value::as_u64).unwrap_or(0);
                let slot = *self.tool_slots.get(&index)?;
                let partial = delta.get("partial_json").and_then(Value::as_str).unwrap_or("");
                Some(self.chunk(
                    json!({"tool_calls": [{"index": slot, "function": {"arguments": partial}}]}),
                    Value::Null,
                ))
            }
            _ => None,
        }
    }

    fn chunk(&self, delta: Value, finish_reason: Value) -> Value {
        json!({
            "id": completion_id(self.id.as_deref()),
            "object": "chat.completion.chunk",
            "model": self.model.as_deref().unwrap_or("unknown"),
            "choices": [{"index": 0, "delta": delta, "finish_reason": finish_reason}],
        })
    }
}
