//! Claude executor: Anthropic Messages API.
//!
//! Auth: `x-api-key` for API keys, `Authorization: Bearer` plus the OAuth beta
//! flag for OAuth and exchanged tokens.
//! Format: `OpenAI` input is translated to Anthropic and the response back;
//! Anthropic input passes through untouched.

use crate::{http_util::ProviderHttp, sse};
use async_trait::async_trait;
use keygate_auth::{AccessToken, AuthManager};
use keygate_translate::{ClaudeStreamTranslator, ClaudeToOpenAI, OpenAIToClaude};
use keygate_types::{
    Capability, ChunkStream, CredentialKind, CredentialRef, DEFAULT_STREAM_BUFFER, Executor,
    ProtocolFormat, Request, RequestTranslator, Response, ResponseTranslator, Result,
};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Public Anthropic API base.
pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

const MESSAGES_PATH: &str = "/v1/messages";

/// Required Anthropic API version header value.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Beta flag required when authenticating with an OAuth bearer token.
const OAUTH_BETA: &str = "oauth-2025-04-20";

const USER_AGENT: &str = concat!("keygate/", env!("CARGO_PKG_VERSION"));

/// Everything this executor can serve.
pub const CAPABILITIES: &[Capability] = &[
    Capability::Streaming,
    Capability::Tools,
    Capability::OpenaiInput,
    Capability::AnthropicInput,
];

/// Executor for the Anthropic Messages API.
pub struct ClaudeExecutor {
    id: String,
    base_url: String,
    capabilities: Vec<Capability>,
    stream_buffer: usize,
    http: ProviderHttp,
    auth: Arc<AuthManager>,
}

impl ClaudeExecutor {
    pub fn new(id: impl Into<String>, http: ProviderHttp, auth: Arc<AuthManager>) -> Self {
        Self {
            id: id.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            capabilities: CAPABILITIES.to_vec(),
            stream_buffer: DEFAULT_STREAM_BUFFER,
            http,
            auth,
        }
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Vec<Capability>) -> Self {
        self.capabilities = capabilities;
        self
    }

    #[must_use]
    pub fn with_stream_buffer(mut self, stream_buffer: usize) -> Self {
        self.stream_buffer = stream_buffer;
        self
    }

    fn upstream_body(request: &Request) -> Result<Value> {
        match request.source_format {
            ProtocolFormat::Anthropic => Ok(request.body()),
            ProtocolFormat::OpenAI => OpenAIToClaude.translate_request(request.body()),
        }
    }

    async fn post(
        &self,
        ctx: &CancellationToken,
        credential: &CredentialRef,
        request: &Request,
    ) -> Result<reqwest::Response> {
        let body = Self::upstream_body(request)?;
        let AccessToken { token, kind } = self
            .auth
            .access_token(ctx, credential)
            .await
            .map_err(|e| e.context(format!("{}: credential", self.id)))?;

        let builder = self
            .http
            .client()
            .post(format!("{}{MESSAGES_PATH}", self.base_url))
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("user-agent", USER_AGENT);
        let builder = match kind {
            CredentialKind::ApiKey => builder.header("x-api-key", token),
            CredentialKind::OauthPair | CredentialKind::JwtCookie => builder
                .bearer_auth(token)
                .header("anthropic-beta", OAUTH_BETA),
        };

        tracing::debug!(executor = %self.id, model = %request.model, stream = request.stream, "sending messages request");
        self.http
            .send(ctx, builder.json(&body), request.stream)
            .await
            .map_err(|e| e.context(format!("{}: messages", self.id)))
    }
}

#[async_trait]
impl Executor for ClaudeExecutor {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    async fn execute(
        &self,
        ctx: &CancellationToken,
        credential: &CredentialRef,
        request: &Request,
    ) -> Result<Response> {
        let mut request = request.clone();
        request.stream = false;
        let resp = self.post(ctx, credential, &request).await?;
        let body = ProviderHttp::json(ctx, resp).await?;
        let payload = match request.source_format {
            ProtocolFormat::Anthropic => body,
            ProtocolFormat::OpenAI => ClaudeToOpenAI.translate_response(body)?,
        };
        Ok(Response {
            payload,
            format: request.source_format,
        })
    }

    async fn execute_stream(
        &self,
        ctx: &CancellationToken,
        credential: &CredentialRef,
        request: &Request,
    ) -> Result<ChunkStream> {
        let mut request = request.clone();
        request.stream = true;
        let resp = self.post(ctx, credential, &request).await?;
        let stream = match request.source_format {
            ProtocolFormat::Anthropic => sse::spawn(
                ctx.clone(),
                resp,
                sse::AnthropicPassthrough::default(),
                self.stream_buffer,
            ),
            ProtocolFormat::OpenAI => sse::spawn(
                ctx.clone(),
                resp,
                ClaudeStreamTranslator::new(),
                self.stream_buffer,
            ),
        };
        Ok(stream)
    }
}

impl std::fmt::Debug for ClaudeExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaudeExecutor")
            .field("id", &self.id)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}
