//! Unified error type for the keygate workspace.

use crate::ProviderId;
use regex::Regex;
use std::{fmt, sync::LazyLock};
use thiserror::Error;

/// Maximum number of bytes of an upstream body retained for diagnostics.
const MAX_BODY_BYTES: usize = 2048;

/// Coarse classification used by the router to decide between failover and
/// short-circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed request, JWT, or OAuth state. Never retried.
    Validation,
    /// Missing, expired, or unrefreshable credential.
    Credential,
    /// Upstream answered with a non-success status.
    Upstream,
    /// Transport failure or timeout.
    Network,
    /// A stored credential record could not be decrypted or parsed.
    CorruptState,
    /// The caller cancelled the request.
    Cancelled,
    /// Local storage, configuration, or serialization failure.
    Internal,
}

/// One failed candidate inside an [`GatewayError::Exhausted`] error.
#[derive(Debug)]
pub struct AttemptError {
    pub executor: String,
    pub error: GatewayError,
}

/// Enumerates all error kinds that can occur across keygate crates.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The request payload is malformed or cannot be served as given.
    #[error("validation error: {0}")]
    Validation(String),

    /// An OAuth callback carried an absent, expired, or already consumed state.
    #[error("invalid oauth state")]
    InvalidState,

    /// A bearer JWT failed structural or temporal validation.
    #[error("invalid jwt: {0}")]
    InvalidJwt(String),

    /// No stored credential exists for the given provider and identity.
    #[error("credential not found: {provider}/{identity}")]
    CredentialNotFound {
        provider: ProviderId,
        identity: String,
    },

    /// The stored credential has expired and cannot be renewed.
    #[error("credential expired: {provider}/{identity}")]
    CredentialExpired {
        provider: ProviderId,
        identity: String,
    },

    /// Refreshing or exchanging the credential failed.
    #[error("credential refresh failed for {provider}/{identity}: {reason}")]
    RefreshFailed {
        provider: ProviderId,
        identity: String,
        reason: String,
    },

    /// The stored record could not be decrypted or parsed.
    #[error("corrupt credential {provider}/{identity}: {reason}")]
    CorruptCredential {
        provider: ProviderId,
        identity: String,
        reason: String,
    },

    /// The upstream provider returned a non-success status.
    #[error("upstream error: status={status}, body={body}")]
    Upstream { status: u16, body: String },

    /// Transport failure, including timeouts.
    #[error("network error: {0}")]
    Network(String),

    /// The upstream answered 2xx but the body could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Request or response format translation failure.
    #[error("translation error: {0}")]
    Translation(String),

    /// No route matches the requested model.
    #[error("unsupported model: {0}")]
    UnsupportedModel(String),

    /// Persistent storage I/O error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Configuration loading or validation error.
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The caller cancelled the request.
    #[error("request cancelled")]
    Cancelled,

    /// A lower-level error annotated with provider and operation context.
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<GatewayError>,
    },

    /// Every candidate for a model failed.
    #[error("all candidates failed for {model}: {}", DisplayAttempts(.attempts))]
    Exhausted {
        model: String,
        attempts: Vec<AttemptError>,
    },
}

struct DisplayAttempts<'a>(&'a [AttemptError]);

impl fmt::Display for DisplayAttempts<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, a) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "[{}] {}", a.executor, a.error)?;
        }
        Ok(())
    }
}

// ── Feature-gated From impls ──────────────────────────────────────────────────

#[cfg(feature = "reqwest")]
impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Network(format!("timed out: {}", e.without_url()))
        } else if e.is_decode() {
            Self::Protocol(e.without_url().to_string())
        } else {
            Self::Network(e.without_url().to_string())
        }
    }
}

impl GatewayError {
    /// Builds an [`GatewayError::Upstream`] with a redacted, truncated body.
    #[must_use]
    pub fn upstream(status: u16, body: &str) -> Self {
        Self::Upstream {
            status,
            body: sanitize_body(body),
        }
    }

    /// Wraps the error with a human-readable context such as `"claude: refresh"`.
    #[must_use]
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Returns the innermost error, skipping [`GatewayError::Context`] layers.
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Classifies the error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self.root() {
            Self::Validation(_)
            | Self::InvalidState
            | Self::InvalidJwt(_)
            | Self::Translation(_)
            | Self::UnsupportedModel(_) => ErrorClass::Validation,
            Self::CredentialNotFound { .. }
            | Self::CredentialExpired { .. }
            | Self::RefreshFailed { .. } => ErrorClass::Credential,
            Self::Upstream { .. } => ErrorClass::Upstream,
            Self::Network(_) | Self::Protocol(_) => ErrorClass::Network,
            Self::CorruptCredential { .. } => ErrorClass::CorruptState,
            Self::Cancelled => ErrorClass::Cancelled,
            Self::Storage(_)
            | Self::Config(_)
            | Self::Serialization(_)
            | Self::Context { .. }
            | Self::Exhausted { .. } => ErrorClass::Internal,
        }
    }

    /// Returns `true` when retrying elsewhere cannot help: the request itself
    /// is malformed or the caller gave up.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        match self.root() {
            Self::Upstream { status, .. } => {
                (400..500).contains(status) && !matches!(status, 401 | 403 | 404 | 408 | 429)
            }
            other => matches!(other.class(), ErrorClass::Validation | ErrorClass::Cancelled),
        }
    }

    /// Returns `true` if the router should advance to the next candidate.
    #[must_use]
    pub fn is_failover_eligible(&self) -> bool {
        !self.is_permanent()
    }
}

static BEARER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)bearer\s+[A-Za-z0-9._~+/=-]+").expect("valid regex")
});

static TOKEN_FIELD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#""(access_token|refresh_token|id_token|rotating_token|api_key|token)"\s*:\s*"[^"]*""#,
    )
    .expect("valid regex")
});

/// Strips bearer tokens and token-bearing JSON fields, then truncates.
#[must_use]
pub fn sanitize_body(body: &str) -> String {
    let redacted = BEARER_RE.replace_all(body, "Bearer [redacted]");
    let redacted = TOKEN_FIELD_RE.replace_all(&redacted, r#""$1":"[redacted]""#);
    if redacted.len() <= MAX_BODY_BYTES {
        return redacted.into_owned();
    }
    let mut end = MAX_BODY_BYTES;
    while !redacted.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &redacted[..end])
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, GatewayError>;
