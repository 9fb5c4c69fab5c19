//! Normalized request and response envelopes exchanged with executors.
//!
//! The payload stays a `serde_json::Value` so unknown fields survive
//! translation; the envelope lifts out what routing needs (`model`, `stream`,
//! the source wire format).

use crate::{Capability, GatewayError, ProtocolFormat, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A chat request as handed to the router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Logical model name used for route resolution.
    pub model: String,
    /// The request body in `source_format`.
    pub payload: Value,
    /// Wire format the caller spoke.
    pub source_format: ProtocolFormat,
    /// Whether the caller wants a streamed response.
    pub stream: bool,
}

impl Request {
    /// Builds a request from a raw body, reading `model` and `stream` from it.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Validation`] if the body is not an object or
    /// has no non-empty string `model`.
    pub fn from_payload(source_format: ProtocolFormat, payload: Value) -> Result<Self> {
        if !payload.is_object() {
            return Err(GatewayError::Validation(
                "request body must be a JSON object".into(),
            ));
        }
        let model = payload
            .get("model")
            .and_then(Value::as_str)
            .filter(|m| !m.is_empty())
            .ok_or_else(|| GatewayError::Validation("missing 'model' field".into()))?
            .to_string();
        let stream = payload
            .get("stream")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Ok(Self {
            model,
            payload,
            source_format,
            stream,
        })
    }

    /// Shorthand for an `OpenAI` chat-completions body.
    ///
    /// # Errors
    ///
    /// See [`Request::from_payload`].
    pub fn openai(payload: Value) -> Result<Self> {
        Self::from_payload(ProtocolFormat::OpenAI, payload)
    }

    /// Shorthand for an Anthropic Messages body.
    ///
    /// # Errors
    ///
    /// See [`Request::from_payload`].
    pub fn anthropic(payload: Value) -> Result<Self> {
        Self::from_payload(ProtocolFormat::Anthropic, payload)
    }

    /// `true` if the body declares at least one tool.
    #[must_use]
    pub fn has_tools(&self) -> bool {
        self.payload
            .get("tools")
            .and_then(Value::as_array)
            .is_some_and(|t| !t.is_empty())
    }

    /// Capabilities an executor must have to serve this request.
    #[must_use]
    pub fn required_capabilities(&self) -> Vec<Capability> {
        let mut caps = vec![Capability::input_for(self.source_format)];
        if self.stream {
            caps.push(Capability::Streaming);
        }
        if self.has_tools() {
            caps.push(Capability::Tools);
        }
        caps
    }

    /// The payload with `model` and `stream` reflecting the envelope.
    #[must_use]
    pub fn body(&self) -> Value {
        let mut body = self.payload.clone();
        if let Some(obj) = body.as_object_mut() {
            obj.insert("model".into(), Value::String(self.model.clone()));
            obj.insert("stream".into(), Value::Bool(self.stream));
        }
        body
    }
}

/// A complete (non-streaming) response, in the request's source format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub payload: Value,
    pub format: ProtocolFormat,
}

/// One item of a streamed response.
#[derive(Debug)]
pub enum StreamChunk {
    /// A decoded event payload, in the request's source format.
    Data(Value),
    /// A terminal error; no further chunks follow.
    Error(GatewayError),
}

impl StreamChunk {
    #[must_use]
    pub fn data(&self) -> Option<&Value> {
        match self {
            Self::Data(v) => Some(v),
            Self::Error(_) => None,
        }
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_payload_minimal() {
        let req = Request::openai(json!({
            "model": "claude-opus-4-5",
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap();
        assert_eq!(req.model, "claude-opus-4-5");
        assert!(!req.stream);
        assert_eq!(req.source_format, ProtocolFormat::OpenAI);
    }

    #[test]
    fn test_from_payload_missing_model() {
        let err = Request::openai(json!({"messages": []})).unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
        assert!(Request::openai(json!({"model": ""})).is_err());
        assert!(Request::openai(json!([1, 2])).is_err());
    }

    #[test]
    fn test_required_capabilities() {
        let plain = Request::openai(json!({"model": "m", "messages": []})).unwrap();
        assert_eq!(plain.required_capabilities(), vec![Capability::OpenaiInput]);

        let rich = Request::anthropic(json!({
            "model": "m",
            "stream": true,
            "tools": [{"name": "get_weather", "input_schema": {}}]
        }))
        .unwrap();
        let caps = rich.required_capabilities();
        assert!(caps.contains(&Capability::AnthropicInput));
        assert!(caps.contains(&Capability::Streaming));
        assert!(caps.contains(&Capability::Tools));
    }

    #[test]
    fn test_empty_tools_not_required() {
        let req = Request::openai(json!({"model": "m", "tools": []})).unwrap();
        assert!(!req.has_tools());
    }

    #[test]
    fn test_body_overlays_envelope() {
        let mut req = Request::openai(json!({"model": "m", "temperature": 0.5})).unwrap();
        req.model = "resolved".into();
        req.stream = true;
        let body = req.body();
        assert_eq!(body["model"], "resolved");
        assert_eq!(body["stream"], true);
        assert_eq!(body["temperature"], 0.5);
    }

    #[test]
    fn test_stream_chunk_accessors() {
        let c = StreamChunk::Data(json!({"x": 1}));
        assert_eq!(c.data().unwrap()["x"], 1);
        assert!(!c.is_error());
        assert!(StreamChunk::Error(GatewayError::Cancelled).is_error());
    }
}
