//! Exchange of rotating tokens for short-lived access tokens.
//!
//! Each exchanged token is cached under a digest of its rotating token.
//! Rotating tokens are single-use upstream, so exchanges sharing one are
//! serialized behind a per-key lock and re-check the cache once inside it.

use crate::{jwt::extract_rotating_token, oauth::CREDENTIAL_TIMEOUT};
use keygate_config::ExchangeProfileConfig;
use keygate_types::{GatewayError, Result, unix_now};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio_util::sync::CancellationToken;

struct CachedToken {
    access_token: String,
    expires_at: u64,
}

#[derive(Deserialize)]
struct ExchangeResponse {
    access_token: String,
    expires_in: u64,
}

type LockMap = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// A caller's hold on the per-key exchange lock. The map entry is removed
/// when the last holder drops its lease.
struct KeyLock<'a> {
    map: &'a LockMap,
    key: &'a str,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl<'a> KeyLock<'a> {
    fn acquire(map: &'a LockMap, key: &'a str) -> Self {
        let lock = map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_string())
            .or_default()
            .clone();
        Self { map, key, lock }
    }
}

impl Drop for KeyLock<'_> {
    fn drop(&mut self) {
        let mut map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one here: nobody else is waiting.
        if Arc::strong_count(&self.lock) == 2 {
            map.remove(self.key);
        }
    }
}

/// Exchanges bearer JWTs for access tokens against one identity provider.
pub struct JwtExchanger {
    http: reqwest::Client,
    exchange_url: String,
    rotating_claim: String,
    margin_secs: u64,
    timeout: Duration,
    cache: Mutex<HashMap<String, CachedToken>>,
    locks: LockMap,
}

impl JwtExchanger {
    pub fn new(http: reqwest::Client, profile: &ExchangeProfileConfig) -> Self {
        Self {
            http,
            exchange_url: profile.exchange_url.clone(),
            rotating_claim: profile.rotating_claim.clone(),
            margin_secs: profile.cache_margin_secs,
            timeout: CREDENTIAL_TIMEOUT,
            cache: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn rotating_claim(&self) -> &str {
        &self.rotating_claim
    }

    /// Returns an access token for `jwt`, exchanging only on a cache miss.
    ///
    /// # Errors
    ///
    /// [`GatewayError::InvalidJwt`] if the JWT fails validation,
    /// [`GatewayError::Cancelled`] if `ctx` fires first, otherwise the
    /// upstream or network error of the exchange call.
    pub async fn exchange_token(&self, ctx: &CancellationToken, jwt: &str) -> Result<String> {
        let rotating = extract_rotating_token(jwt, &self.rotating_claim)?;
        let key = hex::encode(Sha256::digest(rotating.as_bytes()));

        if let Some(token) = self.cached(&key) {
            tracing::debug!("exchanged token cache hit");
            return Ok(token);
        }

        let lease = KeyLock::acquire(&self.locks, &key);
        let _guard = tokio::select! {
            biased;
            () = ctx.cancelled() => return Err(GatewayError::Cancelled),
            guard = lease.lock.lock() => guard,
        };

        if let Some(token) = self.cached(&key) {
            tracing::debug!("exchanged token cache hit after wait");
            return Ok(token);
        }

        let fetched = tokio::select! {
            biased;
            () = ctx.cancelled() => return Err(GatewayError::Cancelled),
            r = self.fetch(&rotating) => r.map_err(|e| e.context("jwt exchange"))?,
        };
        let expires_at = unix_now() + fetched.expires_in;
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                key.clone(),
                CachedToken {
                    access_token: fetched.access_token.clone(),
                    expires_at,
                },
            );
        tracing::info!(expires_in = fetched.expires_in, "rotating token exchanged");
        Ok(fetched.access_token)
    }

    /// Drops every cached access token. In-flight exchanges keep their locks.
    pub fn clear(&self) {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Number of cached entries, including ones not yet lazily evicted.
    #[must_use]
    pub fn cached_len(&self) -> usize {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn cached(&self, key: &str) -> Option<String> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = cache.get(key)?;
        if entry.expires_at <= unix_now() + self.margin_secs {
            cache.remove(key);
            return None;
        }
        Some(entry.access_token.clone())
    }

    async fn fetch(&self, rotating: &str) -> Result<ExchangeResponse> {
        let resp = self
            .http
            .post(&self.exchange_url)
            .timeout(self.timeout)
            .json(&serde_json::json!({ "rotating_token": rotating }))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(GatewayError::upstream(status.as_u16(), &text));
        }
        let body: ExchangeResponse = resp.json().await.map_err(|e| {
            GatewayError::Protocol(format!("invalid exchange response: {}", e.without_url()))
        })?;
        if body.access_token.is_empty() {
            return Err(GatewayError::Protocol(
                "exchange response has empty access_token".into(),
            ));
        }
        Ok(body)
    }
}

impl std::fmt::Debug for JwtExchanger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtExchanger")
            .field("exchange_url", &self.exchange_url)
            .field("rotating_claim", &self.rotating_claim)
            .finish_non_exhaustive()
    }
}
