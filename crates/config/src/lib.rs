//! Configuration loading for keygate.
//!
//! Uses figment to layer built-in defaults, an optional YAML file, and
//! `KEYGATE_*` environment variables.

pub mod schema;

pub use schema::{
    CandidateConfig, Config, ENV_PREFIX, EncryptionMode, ExchangeProfileConfig, ExecutorConfig,
    ExecutorFamily, HttpConfig, LogConfig, LogFormat, OAuthProfileConfig, RouteConfig,
    StoreConfig,
};
