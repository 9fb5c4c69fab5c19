//! Anthropic Messages response → `OpenAI` chat completion.

use keygate_types::{GatewayError, ResponseTranslator, Result};
use serde_json::{Value, json};

/// Translator from a complete Anthropic response to the `OpenAI` format.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClaudeToOpenAI;

/// Maps an Anthropic `stop_reason` to an `OpenAI` `finish_reason`.
#[must_use]
pub fn finish_reason(stop_reason: Option<&str>) -> &'static str {
    match stop_reason {
        Some("max_tokens") => "length",
        Some("tool_use") => "tool_calls",
        Some("refusal") => "content_filter",
        _ => "stop",
    }
}

/// `chatcmpl-` prefixed id derived from an Anthropic message id.
#[must_use]
pub fn completion_id(message_id: Option<&str>) -> String {
    format!("chatcmpl-{}", message_id.unwrap_or("unknown"))
}

/// Usage block in `OpenAI` shape from an Anthropic `usage` object.
#[must_use]
pub fn usage(usage: Option<&Value>) -> Value {
    let count = |key: &str| {
        usage
            .and_then(|u| u.get(key))
            .and_then(Value::as_u64)
            .unwrap_or(0)
    };
    let prompt = count("input_tokens") + count("cache_read_input_tokens") + count("cache_creation_input_tokens");
    let completion = count("output_tokens");
    json!({
        "prompt_tokens": prompt,
        "completion_tokens": completion,
        "total_tokens": prompt + completion,
    })
}

impl ResponseTranslator for ClaudeToOpenAI {
    /// # Errors
    ///
    /// Returns [`GatewayError::Translation`] if the body is an Anthropic
    /// error object or has no `content` array.
    fn translate_response(&self, res: Value) -> Result<Value> {
        if res.get("type").and_then(Value::as_str) == Some("error") {
            let msg = res
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(GatewayError::Translation(format!("upstream error object: {msg}")));
        }
        let blocks = res
            .get("content")
            .and_then(Value::as_array)
            .ok_or_else(|| GatewayError::Translation("response has no 'content' array".into()))?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for block in blocks {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => text.push_str(block.get("text").and_then(Value::as_str).unwrap_or("")),
                Some("tool_use") => tool_calls.push(json!({
                    "id": block.get("id").cloned().unwrap_or(Value::Null),
                    "type": "function",
                    "function": {
                        "name": block.get("name").cloned().unwrap_or(Value::Null),
                        "arguments": block.get("input").map_or_else(|| "{}".to_string(), Value::to_string),
                    },
                })),
                // thinking, redacted_thinking
                _ => {}
            }
        }

        let mut message = json!({
            "role": "assistant",
            "content": if text.is_empty() && !tool_calls.is_empty() { Value::Null } else { Value::String(text) },
        });
        if !tool_calls.is_empty() {
            message["tool_calls"] = Value::Array(tool_calls);
        }

        Ok(json!({
            "id": completion_id(res.get("id").and_then(Value::as_str)),
            "object": "chat.completion",
            "model": res.get("model").and_then(Value::as_str).unwrap_or("unknown"),
            "choices": [{
                "index": 0,
                "message": message,
                "finish_reason": finish_reason(res.get("stop_reason").and_then(Value::as_str)),
            }],
            "usage": usage(res.get("usage")),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Value {
        json!({
            "id": "msg_abc123",
            "type": "message",
            "role": "assistant",
            "model": "claude-opus-4-5",
            "content": [
                {"type": "thinking", "thinking": "hmm"},
                {"type": "text", "text": "Hello "},
                {"type": "text", "text": "there!"}
            ],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 10, "output_tokens": 5}
        })
    }

    #[test]
    fn test_text_blocks_joined() {
        let out = ClaudeToOpenAI.translate_response(sample()).unwrap();
        assert_eq!(out["object"], "chat.completion");
        assert_eq!(out["id"], "chatcmpl-msg_abc123");
        assert_eq!(out["model"], "claude-opus-4-5");
        assert_eq!(out["choices"][0]["message"]["content"], "Hello there!");
        assert_eq!(out["choices"][0]["finish_reason"], "stop");
        assert!(out["choices"][0]["message"].get("tool_calls").is_none());
    }

    #[test]
    fn test_usage_mapping() {
        let mut r = sample();
        r["usage"]["cache_read_input_tokens"] = json!(4);
        let out = ClaudeToOpenAI.translate_response(r).unwrap();
        assert_eq!(out["usage"]["prompt_tokens"], 14);
        assert_eq!(out["usage"]["completion_tokens"], 5);
        assert_eq!(out["usage"]["total_tokens"], 19);
    }

    #[test]
    fn test_tool_use_becomes_tool_calls() {
        let out = ClaudeToOpenAI
            .translate_response(json!({
                "id": "msg_1",
                "model": "claude-sonnet-4-5",
                "content": [{
                    "type": "tool_use",
                    "id": "toolu_1",
                    "name": "get_weather",
                    "input": {"city": "Paris"}
                }],
                "stop_reason": "tool_use"
            }))
            .unwrap();
        let msg = &out["choices"][0]["message"];
        assert!(msg["content"].is_null());
        assert_eq!(msg["tool_calls"][0]["id"], "toolu_1");
        assert_eq!(msg["tool_calls"][0]["function"]["name"], "get_weather");
        let args: Value =
            serde_json::from_str(msg["tool_calls"][0]["function"]["arguments"].as_str().unwrap()).unwrap();
        assert_eq!(args, json!({"city": "Paris"}));
        assert_eq!(out["choices"][0]["finish_reason"], "tool_calls");
    }

    #[test]
    fn test_finish_reasons() {
        assert_eq!(finish_reason(Some("max_tokens")), "length");
        assert_eq!(finish_reason(Some("stop_sequence")), "stop");
        assert_eq!(finish_reason(Some("refusal")), "content_filter");
        assert_eq!(finish_reason(None), "stop");
    }

    #[test]
    fn test_error_object_rejected() {
        let err = ClaudeToOpenAI
            .translate_response(json!({"type": "error", "error": {"message": "overloaded"}}))
            .unwrap_err();
        assert!(err.to_string().contains("overloaded"));
        assert!(ClaudeToOpenAI.translate_response(json!({"id": "x"})).is_err());
    }
}
