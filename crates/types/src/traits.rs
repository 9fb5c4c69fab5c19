//! Async traits shared across all keygate crates.
//!
//! Every cross-crate abstraction is defined here so that higher layers depend
//! only on `keygate-types`, not on each other.

use crate::{Capability, ChunkStream, Credential, CredentialRef, ProviderId, Request, Response, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Durable storage underneath the credential store's cache.
///
/// Backends only move records; caching, expiry, and refresh coordination live
/// one layer up.
#[async_trait]
pub trait CredentialBackend: Send + Sync {
    /// Loads a record.
    ///
    /// # Errors
    ///
    /// [`GatewayError::CredentialNotFound`](crate::GatewayError::CredentialNotFound)
    /// if absent, [`GatewayError::CorruptCredential`](crate::GatewayError::CorruptCredential)
    /// if it cannot be decoded.
    async fn load(&self, provider: &ProviderId, identity: &str) -> Result<Credential>;

    /// Persists a record, replacing any previous one.
    async fn store(&self, credential: &Credential) -> Result<()>;

    /// Removes a record. Removing an absent record is not an error.
    async fn remove(&self, provider: &ProviderId, identity: &str) -> Result<()>;

    /// Lists identities stored for a provider, sorted.
    async fn identities(&self, provider: &ProviderId) -> Result<Vec<String>>;
}

/// Translates a request body from one wire format into another.
///
/// Implementations must be pure (no I/O).
pub trait RequestTranslator: Send + Sync {
    /// # Errors
    ///
    /// Returns [`GatewayError::Translation`](crate::GatewayError::Translation)
    /// if the request cannot be translated.
    fn translate_request(&self, req: Value) -> Result<Value>;
}

/// Translates a complete response body back into the caller's wire format.
///
/// Implementations must be pure (no I/O).
pub trait ResponseTranslator: Send + Sync {
    /// # Errors
    ///
    /// Returns [`GatewayError::Translation`](crate::GatewayError::Translation)
    /// if the response cannot be translated.
    fn translate_response(&self, res: Value) -> Result<Value>;
}

/// Issues requests against one upstream provider family.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Routing key, unique within a registry.
    fn id(&self) -> &str;

    /// Features this executor can serve.
    fn capabilities(&self) -> &[Capability];

    /// Returns `true` if every capability in `required` is supported.
    fn supports_all(&self, required: &[Capability]) -> bool {
        required.iter().all(|c| self.capabilities().contains(c))
    }

    /// Performs a blocking (non-streaming) call.
    async fn execute(
        &self,
        ctx: &CancellationToken,
        credential: &CredentialRef,
        request: &Request,
    ) -> Result<Response>;

    /// Starts a streaming call.
    ///
    /// Returns once the upstream accepted the stream; later failures arrive
    /// in-stream.
    async fn execute_stream(
        &self,
        ctx: &CancellationToken,
        credential: &CredentialRef,
        request: &Request,
    ) -> Result<ChunkStream>;
}
