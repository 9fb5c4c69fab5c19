//! Pure translation between the `OpenAI` chat-completions wire format and the
//! Anthropic Messages wire format.
//!
//! Nothing here performs I/O. Executors pick the translator matching the
//! caller's format and the upstream's.

pub mod request;
pub mod response;
pub mod stream;

pub use request::OpenAIToClaude;
pub use response::ClaudeToOpenAI;
pub use stream::ClaudeStreamTranslator;
