//! Credential storage for keygate.
//!
//! [`CredentialStore`] owns every stored credential. It fronts a
//! [`CredentialBackend`] (file or memory) with a TTL cache and coordinates
//! refreshes so concurrent callers share one upstream call per record.

pub mod crypto;
pub mod file;
pub mod memory;

pub use crypto::Sealer;
pub use file::FileBackend;
pub use memory::MemoryBackend;

use keygate_types::{Credential, CredentialBackend, CredentialRef, ProviderId, Result};
use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::{sync::RwLock, time::Instant};

/// How long a cached record is trusted before re-reading the backend.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

struct CacheEntry {
    credential: Credential,
    loaded_at: Instant,
}

/// Cached, refresh-coordinating access to stored credentials.
pub struct CredentialStore {
    backend: Arc<dyn CredentialBackend>,
    cache: RwLock<HashMap<CredentialRef, CacheEntry>>,
    flights: Mutex<HashMap<CredentialRef, Arc<tokio::sync::Mutex<()>>>>,
    ttl: Duration,
}

impl CredentialStore {
    pub fn new(backend: Arc<dyn CredentialBackend>) -> Self {
        Self::with_ttl(backend, DEFAULT_CACHE_TTL)
    }

    pub fn with_ttl(backend: Arc<dyn CredentialBackend>, ttl: Duration) -> Self {
        Self {
            backend,
            cache: RwLock::new(HashMap::new()),
            flights: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// An ephemeral store over a fresh [`MemoryBackend`].
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Persists `credential` and refreshes its cache entry.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Validation`](keygate_types::GatewayError::Validation)
    /// for an invalid record, or the backend's storage error.
    pub async fn save(&self, credential: Credential) -> Result<()> {
        credential.validate()?;
        self.backend.store(&credential).await?;
        self.cache.write().await.insert(
            credential.reference(),
            CacheEntry {
                credential,
                loaded_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Returns the record, from cache while it is younger than the TTL.
    ///
    /// # Errors
    ///
    /// `CredentialNotFound` if absent, `CorruptCredential` if unreadable.
    pub async fn get(&self, provider: &ProviderId, identity: &str) -> Result<Credential> {
        let key = CredentialRef::new(provider.clone(), identity);
        if let Some(entry) = self.cache.read().await.get(&key)
            && entry.loaded_at.elapsed() < self.ttl
        {
            tracing::debug!(%provider, identity, "credential cache hit");
            return Ok(entry.credential.clone());
        }
        self.reload(&key).await
    }

    async fn reload(&self, key: &CredentialRef) -> Result<Credential> {
        match self.backend.load(&key.provider, &key.identity).await {
            Ok(credential) => {
                self.cache.write().await.insert(
                    key.clone(),
                    CacheEntry {
                        credential: credential.clone(),
                        loaded_at: Instant::now(),
                    },
                );
                Ok(credential)
            }
            Err(e) => {
                self.cache.write().await.remove(key);
                Err(e)
            }
        }
    }

    /// Removes the record from disk and cache.
    ///
    /// # Errors
    ///
    /// Returns the backend's storage error.
    pub async fn delete(&self, provider: &ProviderId, identity: &str) -> Result<()> {
        let key = CredentialRef::new(provider.clone(), identity);
        self.cache.write().await.remove(&key);
        self.backend.remove(provider, identity).await
    }

    /// Lists stored identities for `provider`.
    ///
    /// # Errors
    ///
    /// Returns the backend's storage error.
    pub async fn list(&self, provider: &ProviderId) -> Result<Vec<String>> {
        self.backend.identities(provider).await
    }

    /// Drops every cached entry.
    pub async fn clear_cache(&self) {
        self.cache.write().await.clear();
    }

    fn flight(&self, key: &CredentialRef) -> Arc<tokio::sync::Mutex<()>> {
        self.flights
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_default()
            .clone()
    }

    /// Refreshes an expired record at most once across concurrent callers.
    ///
    /// Takes the per-record lock, re-reads the record from the backend, and
    /// calls `refresher` only if it is still expired. Callers that queued
    /// behind a successful refresh receive the already-refreshed record.
    ///
    /// # Errors
    ///
    /// Propagates the load error or the refresher's error; the stored record
    /// is left untouched on failure.
    pub async fn refresh_with<F, Fut>(
        &self,
        provider: &ProviderId,
        identity: &str,
        refresher: F,
    ) -> Result<Credential>
    where
        F: FnOnce(Credential) -> Fut + Send,
        Fut: Future<Output = Result<Credential>> + Send,
    {
        let key = CredentialRef::new(provider.clone(), identity);
        let lock = self.flight(&key);
        let _guard = lock.lock().await;

        let current = self.reload(&key).await?;
        if current.is_usable() {
            tracing::debug!(%provider, identity, "credential already refreshed");
            return Ok(current);
        }
        let refreshed = refresher(current).await?;
        self.save(refreshed.clone()).await?;
        tracing::info!(%provider, identity, "credential refreshed");
        Ok(refreshed)
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keygate_types::{GatewayError, unix_now};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn expired(token: &str) -> Credential {
        Credential::oauth_pair(
            ProviderId::claude(),
            "u@e.com",
            token,
            Some("rt".into()),
            unix_now() - 1,
            None,
        )
    }

    fn refreshed_from(mut c: Credential, token: &str) -> Credential {
        let fresh = Credential::oauth_pair(
            c.provider.clone(),
            c.identity.clone(),
            token,
            None,
            unix_now() + 3600,
            None,
        );
        c.apply_refresh(fresh).unwrap();
        c
    }

    #[tokio::test]
    async fn test_save_then_get_hits_cache() {
        let backend = Arc::new(MemoryBackend::new());
        let store = CredentialStore::new(backend.clone());
        store.save(expired("tok1")).await.unwrap();
        for _ in 0..3 {
            let c = store.get(&ProviderId::claude(), "u@e.com").await.unwrap();
            assert_eq!(c.access_token(), "tok1");
        }
        assert_eq!(backend.load_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_expires_after_ttl() {
        let backend = Arc::new(MemoryBackend::new());
        let store = CredentialStore::with_ttl(backend.clone(), Duration::from_secs(300));
        store.save(expired("tok1")).await.unwrap();
        tokio::time::advance(Duration::from_secs(301)).await;
        store.get(&ProviderId::claude(), "u@e.com").await.unwrap();
        assert_eq!(backend.load_count(), 1);
        store.get(&ProviderId::claude(), "u@e.com").await.unwrap();
        assert_eq!(backend.load_count(), 1);
    }

    #[tokio::test]
    async fn test_delete_removes_cache_and_backend() {
        let store = CredentialStore::in_memory();
        store.save(expired("tok1")).await.unwrap();
        store.delete(&ProviderId::claude(), "u@e.com").await.unwrap();
        let err = store.get(&ProviderId::claude(), "u@e.com").await.unwrap_err();
        assert!(matches!(err, GatewayError::CredentialNotFound { .. }));
        assert!(store.list(&ProviderId::claude()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_rejects_empty_token() {
        let store = CredentialStore::in_memory();
        assert!(store.save(expired("")).await.is_err());
    }

    #[tokio::test]
    async fn test_refresh_with_single_flight() {
        let store = Arc::new(CredentialStore::in_memory());
        store.save(expired("tok1")).await.unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                let c = store.get(&ProviderId::claude(), "u@e.com").await.unwrap();
                if !c.is_expired() {
                    return c;
                }
                store
                    .refresh_with(&ProviderId::claude(), "u@e.com", |current| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(refreshed_from(current, "tok2"))
                    })
                    .await
                    .unwrap()
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap().access_token(), "tok2");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_failure_leaves_record() {
        let store = CredentialStore::in_memory();
        store.save(expired("tok1")).await.unwrap();
        let err = store
            .refresh_with(&ProviderId::claude(), "u@e.com", |_| async {
                Err(GatewayError::Network("down".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Network(_)));
        let c = store.get(&ProviderId::claude(), "u@e.com").await.unwrap();
        assert_eq!(c.access_token(), "tok1");
        assert_eq!(c.refresh_token(), Some("rt"));
    }

    #[tokio::test]
    async fn test_refresh_keeps_refresh_token_and_sets_expiry() {
        let store = CredentialStore::in_memory();
        store.save(expired("tok1")).await.unwrap();
        let c = store
            .refresh_with(&ProviderId::claude(), "u@e.com", |current| async move {
                Ok(refreshed_from(current, "tok2"))
            })
            .await
            .unwrap();
        assert_eq!(c.refresh_token(), Some("rt"));
        assert!(c.expires_at().unwrap() > unix_now());
    }

    #[tokio::test]
    async fn test_corrupt_file_surfaces_through_store() {
        let dir = tempfile::tempdir().unwrap();
        let sealer = Sealer::from_hex(&Sealer::generate_key()).unwrap();
        let backend = Arc::new(FileBackend::open(dir.path(), Some(sealer)).await.unwrap());
        let store = CredentialStore::new(backend.clone());
        store.save(expired("tok1")).await.unwrap();

        let path = backend.path_for(&ProviderId::claude(), "u@e.com");
        let mut raw = std::fs::read(&path).unwrap();
        raw[0] ^= 0x01;
        std::fs::write(&path, raw).unwrap();

        store.clear_cache().await;
        let err = store.get(&ProviderId::claude(), "u@e.com").await.unwrap_err();
        assert!(matches!(err, GatewayError::CorruptCredential { .. }));
    }
}
