//! In-memory credential backend backed by a `HashMap` behind a `Mutex`.

use async_trait::async_trait;
use keygate_types::{Credential, CredentialBackend, CredentialRef, GatewayError, ProviderId, Result};
use std::{
    collections::HashMap,
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
};

/// An in-memory [`CredentialBackend`] for testing and ephemeral use.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    data: Mutex<HashMap<CredentialRef, Credential>>,
    loads: AtomicUsize,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `load` calls served so far.
    #[must_use]
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialBackend for MemoryBackend {
    async fn load(&self, provider: &ProviderId, identity: &str) -> Result<Credential> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let key = CredentialRef::new(provider.clone(), identity);
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned()
            .ok_or_else(|| GatewayError::CredentialNotFound {
                provider: provider.clone(),
                identity: identity.to_string(),
            })
    }

    async fn store(&self, credential: &Credential) -> Result<()> {
        credential.validate()?;
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(credential.reference(), credential.clone());
        Ok(())
    }

    async fn remove(&self, provider: &ProviderId, identity: &str) -> Result<()> {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&CredentialRef::new(provider.clone(), identity));
        Ok(())
    }

    async fn identities(&self, provider: &ProviderId) -> Result<Vec<String>> {
        let mut out: Vec<String> = self
            .data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .filter(|k| &k.provider == provider)
            .map(|k| k.identity.clone())
            .collect();
        out.sort();
        Ok(out)
    }
}
