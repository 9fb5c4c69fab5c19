//! `OpenAI`-compatible chat-completions executor.
//!
//! Works against any base URL speaking `/chat/completions`. Bodies pass
//! through unchanged; the credential is always sent as a bearer token.

use crate::{http_util::ProviderHttp, sse};
use async_trait::async_trait;
use keygate_auth::AuthManager;
use keygate_types::{
    Capability, ChunkStream, CredentialRef, DEFAULT_STREAM_BUFFER, Executor, GatewayError,
    ProtocolFormat, Request, Response, Result,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub const CAPABILITIES: &[Capability] = &[
    Capability::Streaming,
    Capability::Tools,
    Capability::OpenaiInput,
];

pub struct OpenAiExecutor {
    id: String,
    base_url: String,
    capabilities: Vec<Capability>,
    stream_buffer: usize,
    http: ProviderHttp,
    auth: Arc<AuthManager>,
}

impl OpenAiExecutor {
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

    /// Anthropic input is never accepted, whatever is configured.
    #[must_use]
    pub fn with_capabilities(mut self, mut capabilities: Vec<Capability>) -> Self {
        capabilities.retain(|c| *c != Capability::AnthropicInput);
        self.capabilities = capabilities;
        self
    }

    #[must_use]
    pub fn with_stream_buffer(mut self, stream_buffer: usize) -> Self {
        self.stream_buffer = stream_buffer;
        self
    }

    async fn post(
        &self,
        ctx: &CancellationToken,
        credential: &CredentialRef,
        request: &Request,
    ) -> Result<reqwest::Response> {
        if request.source_format != ProtocolFormat::OpenAI {
            return Err(GatewayError::Validation(format!(
                "executor {} accepts only openai input, got {}",
                self.id, request.source_format
            )));
        }
        let token = self
            .auth
            .access_token(ctx, credential)
            .await
            .map_err(|e| e.context(format!("{}: credential", self.id)))?
            .token;
        let builder = self
            .http
            .client()
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(token)
            .json(&request.body());
        tracing::debug!(executor = %self.id, model = %request.model, stream = request.stream, "sending chat completion");
        self.http
            .send(ctx, builder, request.stream)
            .await
            .map_err(|e| e.context(format!("{}: chat completion", self.id)))
    }
}

#[async_trait]
impl Executor for OpenAiExecutor {
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
        Ok(Response {
            payload: ProviderHttp::json(ctx, resp).await?,
            format: ProtocolFormat::OpenAI,
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
        Ok(sse::spawn(ctx.clone(), resp, sse::Passthrough, self.stream_buffer))
    }
}

impl std::fmt::Debug for OpenAiExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiExecutor")
            .field("id", &self.id)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keygate_store::CredentialStore;
    use keygate_types::{Credential, ProviderId, StreamEnd};
    use serde_json::json;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_partial_json, header, method, path},
    };

    async fn executor(server: &MockServer) -> (OpenAiExecutor, CredentialRef) {
        let store = Arc::new(CredentialStore::in_memory());
        let credential = Credential::api_key(ProviderId::new("openai").unwrap(), "default", "sk-1");
        let reference = credential.reference();
        store.save(credential).await.unwrap();
        let ex = OpenAiExecutor::new(
            "openai",
            ProviderHttp::new(reqwest::Client::new()),
            Arc::new(AuthManager::new(store)),
        )
        .with_base_url(format!("{}/v1/", server.uri()));
        (ex, reference)
    }

    #[tokio::test]
    async fn test_passthrough_with_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-1"))
            .and(body_partial_json(json!({"model": "gpt-4o", "stream": false, "temperature": 0.1})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"object": "chat.completion"})))
            .expect(1)
            .mount(&server)
            .await;
        let (ex, cred) = executor(&server).await;
        let req = Request::openai(json!({"model": "gpt-4o", "temperature": 0.1, "messages": []})).unwrap();
        let resp = ex.execute(&CancellationToken::new(), &cred, &req).await.unwrap();
        assert_eq!(resp.payload["object"], "chat.completion");
    }

    #[tokio::test]
    async fn test_rejects_anthropic_input() {
        let server = MockServer::start().await;
        let (ex, cred) = executor(&server).await;
        let req = Request::anthropic(json!({"model": "gpt-4o", "messages": []})).unwrap();
        let err = ex.execute(&CancellationToken::new(), &cred, &req).await.unwrap_err();
        assert!(err.is_permanent());
        assert!(!ex.supports_all(&req.required_capabilities()));
    }

    #[tokio::test]
    async fn test_stream_passthrough() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string("data: {\"a\":1}\n\ndata: {\"a\":2}\n\ndata: [DONE]\n\n"),
            )
            .mount(&server)
            .await;
        let (ex, cred) = executor(&server).await;
        let req = Request::openai(json!({"model": "gpt-4o", "stream": true, "messages": []})).unwrap();
        let (chunks, end) = ex
            .execute_stream(&CancellationToken::new(), &cred, &req)
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(end, StreamEnd::Completed);
    }

    #[test]
    fn test_capabilities_never_include_anthropic() {
        let store = Arc::new(CredentialStore::in_memory());
        let ex = OpenAiExecutor::new("o", ProviderHttp::new(reqwest::Client::new()), Arc::new(AuthManager::new(store)))
            .with_capabilities(vec![Capability::AnthropicInput, Capability::OpenaiInput]);
        assert_eq!(ex.capabilities(), &[Capability::OpenaiInput]);
    }
}
