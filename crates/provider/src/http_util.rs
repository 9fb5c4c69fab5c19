//! Shared HTTP plumbing for executors: cancellable send, status check, and
//! JSON body decoding.

use keygate_types::{GatewayError, Result};
use reqwest::{Client, RequestBuilder, Response};
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default timeout for non-streaming upstream calls.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// HTTP client plus the request timeout applied to blocking calls.
#[derive(Debug, Clone)]
pub struct ProviderHttp {
    http: Client,
    request_timeout: Duration,
}

impl ProviderHttp {
    #[must_use]
    pub fn new(http: Client) -> Self {
        Self {
            http,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn client(&self) -> &Client {
        &self.http
    }

    /// Sends `builder` and returns the response once headers arrive.
    ///
    /// Blocking calls get the request timeout; streaming calls are bounded
    /// only by `ctx`.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::Cancelled`] if `ctx` fires first; the in-flight
    ///   request is dropped.
    /// - [`GatewayError::Upstream`] with the redacted body on non-2xx.
    /// - [`GatewayError::Network`] on transport failure or timeout.
    pub async fn send(
        &self,
        ctx: &CancellationToken,
        builder: RequestBuilder,
        streaming: bool,
    ) -> Result<Response> {
        let builder = if streaming {
            builder
        } else {
            builder.timeout(self.request_timeout)
        };
        let resp = tokio::select! {
            biased;
            () = ctx.cancelled() => return Err(GatewayError::Cancelled),
            r = builder.send() => r?,
        };
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let text = tokio::select! {
            biased;
            () = ctx.cancelled() => return Err(GatewayError::Cancelled),
            t = resp.text() => t.unwrap_or_default(),
        };
        Err(GatewayError::upstream(status.as_u16(), &text))
    }

    /// Reads a complete JSON body.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Cancelled`] if `ctx` fires first,
    /// [`GatewayError::Protocol`] if the body is not JSON.
    pub async fn json(ctx: &CancellationToken, resp: Response) -> Result<Value> {
        let bytes = tokio::select! {
            biased;
            () = ctx.cancelled() => return Err(GatewayError::Cancelled),
            b = resp.bytes() => b?,
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| GatewayError::Protocol(format!("upstream body is not JSON: {e}")))
    }
}
