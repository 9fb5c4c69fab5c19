//! Core types and traits for the keygate workspace.
//!
//! This crate defines the shared abstractions used across all layers of the
//! gateway: the error taxonomy, provider identifiers, stored credentials, the
//! normalized request/response envelopes, the chunk stream, and the async
//! traits each layer implements.

pub mod chat;
pub mod credential;
pub mod error;
pub mod provider;
pub mod stream;
pub mod traits;

pub use chat::{Request, Response, StreamChunk};
pub use credential::{
    Credential, CredentialKind, CredentialRef, CredentialStatus, DEFAULT_IDENTITY,
    EXPIRY_BUFFER_SECS, REFRESH_LEAD_SECS, Secret, expiry_from_now, unix_now,
};
pub use error::{AttemptError, ErrorClass, GatewayError, Result};
pub use provider::{Capability, ProtocolFormat, ProviderId};
pub use stream::{ChunkSender, ChunkStream, DEFAULT_STREAM_BUFFER, StreamEnd, channel};
pub use traits::{CredentialBackend, Executor, RequestTranslator, ResponseTranslator};
