//! Provider identifiers, protocol formats, and executor capabilities.

use crate::GatewayError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies an upstream provider (e.g. `"claude"`, `"openai"`).
///
/// Provider ids appear in credential file paths, so they are restricted to
/// lowercase ASCII letters, digits, `-` and `_`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProviderId(String);

impl ProviderId {
    /// Parses and validates a provider id.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Validation`] if the id is empty, longer than
    /// 64 characters, or contains characters outside `[a-z0-9_-]`.
    pub fn new(id: impl Into<String>) -> Result<Self, GatewayError> {
        let id = id.into();
        let valid = !id.is_empty()
            && id.len() <= 64
            && id
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_');
        if valid {
            Ok(Self(id))
        } else {
            Err(GatewayError::Validation(format!("invalid provider id: {id:?}")))
        }
    }

    /// The built-in Anthropic Claude provider.
    #[must_use]
    pub fn claude() -> Self {
        Self("claude".into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for ProviderId {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ProviderId {
    type Error = GatewayError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<ProviderId> for String {
    fn from(id: ProviderId) -> Self {
        id.0
    }
}

/// The wire protocol format of a request or an upstream API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolFormat {
    #[serde(rename = "openai")]
    OpenAI,
    #[serde(rename = "anthropic")]
    Anthropic,
}

impl fmt::Display for ProtocolFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OpenAI => f.write_str("openai"),
            Self::Anthropic => f.write_str("anthropic"),
        }
    }
}

/// A feature an executor may or may not support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Server-sent-event streaming responses.
    Streaming,
    /// Tool definitions and tool calls.
    Tools,
    /// Accepts requests in `OpenAI` chat-completions format.
    OpenaiInput,
    /// Accepts requests in Anthropic Messages format.
    AnthropicInput,
}

impl Capability {
    /// The input capability matching a request's source format.
    #[must_use]
    pub fn input_for(format: ProtocolFormat) -> Self {
        match format {
            ProtocolFormat::OpenAI => Self::OpenaiInput,
            ProtocolFormat::Anthropic => Self::AnthropicInput,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Streaming => "streaming",
            Self::Tools => "tools",
            Self::OpenaiInput => "openai_input",
            Self::AnthropicInput => "anthropic_input",
        };
        f.write_str(s)
    }
}
