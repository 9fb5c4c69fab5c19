//! Executor registry: executors keyed by routing id, each bound to the stored
//! credential it sends upstream.

use crate::{ClaudeExecutor, OpenAiExecutor, ProviderHttp};
use keygate_auth::AuthManager;
use keygate_config::{Config, ExecutorConfig, ExecutorFamily};
use keygate_types::{CredentialRef, Executor, GatewayError, Result};
use std::{collections::HashMap, sync::Arc, time::Duration};

/// An executor together with the credential it is bound to.
#[derive(Clone)]
pub struct ExecutorEntry {
    pub executor: Arc<dyn Executor>,
    pub credential: CredentialRef,
}

impl ExecutorEntry {
    #[must_use]
    pub fn id(&self) -> &str {
        self.executor.id()
    }
}

impl std::fmt::Debug for ExecutorEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorEntry")
            .field("id", &self.executor.id())
            .field("credential", &self.credential)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct ExecutorRegistry {
    entries: HashMap<String, ExecutorEntry>,
}

impl ExecutorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an executor.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] if the id is already registered.
    pub fn register(&mut self, executor: Arc<dyn Executor>, credential: CredentialRef) -> Result<()> {
        let id = executor.id().to_string();
        if self.entries.contains_key(&id) {
            return Err(GatewayError::Config(format!("duplicate executor id {id}")));
        }
        self.entries.insert(id, ExecutorEntry { executor, credential });
        Ok(())
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ExecutorEntry> {
        self.entries.get(id)
    }

    /// Registered ids, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Builds every enabled executor declared in `config`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] on duplicate executor ids.
    pub fn from_config(config: &Config, auth: &Arc<AuthManager>, http: &reqwest::Client) -> Result<Self> {
        let provider_http = ProviderHttp::new(http.clone())
            .with_request_timeout(Duration::from_secs(config.http.request_timeout_secs));
        let mut registry = Self::new();
        for ec in &config.executors {
            if !ec.enabled {
                tracing::debug!(executor = %ec.id, "executor disabled, skipping");
                continue;
            }
            let executor = build(ec, provider_http.clone(), Arc::clone(auth), config.http.stream_buffer);
            registry.register(executor, CredentialRef::new(ec.provider.clone(), ec.identity.clone()))?;
        }
        Ok(registry)
    }
}

fn build(ec: &ExecutorConfig, http: ProviderHttp, auth: Arc<AuthManager>, stream_buffer: usize) -> Arc<dyn Executor> {
    match ec.family {
        ExecutorFamily::Claude => {
            let mut ex = ClaudeExecutor::new(&ec.id, http, auth).with_stream_buffer(stream_buffer);
            if let Some(url) = &ec.base_url {
                ex = ex.with_base_url(url);
            }
            if let Some(caps) = &ec.capabilities {
                ex = ex.with_capabilities(caps.clone());
            }
            Arc::new(ex)
        }
        ExecutorFamily::Openai => {
            let mut ex = OpenAiExecutor::new(&ec.id, http, auth).with_stream_buffer(stream_buffer);
            if let Some(url) = &ec.base_url {
                ex = ex.with_base_url(url);
            }
            if let Some(caps) = &ec.capabilities {
                ex = ex.with_capabilities(caps.clone());
            }
            Arc::new(ex)
        }
    }
}
