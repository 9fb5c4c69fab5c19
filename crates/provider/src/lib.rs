//! Upstream executors and the model router.
//!
//! Each executor implements [`keygate_types::Executor`] for one provider
//! family. The [`ExecutorRegistry`] binds executors to stored credentials and
//! the [`ModelRouter`] resolves a model name to an ordered candidate list,
//! dispatching with failover.

pub mod claude;
pub mod http_util;
pub mod openai;
pub mod registry;
pub mod router;
pub mod sse;

pub use claude::ClaudeExecutor;
pub use http_util::ProviderHttp;
pub use openai::OpenAiExecutor;
pub use registry::{ExecutorEntry, ExecutorRegistry};
pub use router::{
    Attempt, Candidate, Dispatch, DispatchTrace, ModelRoute, ModelRouter, Outcome, Pattern,
    SkipReason,
};
