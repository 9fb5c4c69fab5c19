//! Resolves stored credentials into usable upstream tokens.
//!
//! Responsibilities:
//! - Load credentials from the [`CredentialStore`].
//! - Refresh expired OAuth pairs through the provider's [`OAuthClient`]
//!   (single-flight per record).
//! - Exchange JWT cookies through the provider's [`JwtExchanger`].
//! - Logout: best-effort revoke, then unconditional local deletion.

use crate::{exchange::JwtExchanger, oauth::OAuthClient, state::StateRegistry};
use keygate_config::Config;
use keygate_store::CredentialStore;
use keygate_types::{
    Credential, CredentialKind, CredentialRef, CredentialStatus, GatewayError, ProviderId, Result,
    Secret,
};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

/// A token ready to attach to an upstream request.
#[derive(Clone)]
pub struct AccessToken {
    pub token: String,
    /// Kind of the credential it came from; decides the auth header.
    pub kind: CredentialKind,
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

pub struct AuthManager {
    store: Arc<CredentialStore>,
    states: Arc<StateRegistry>,
    oauth: HashMap<ProviderId, Arc<OAuthClient>>,
    exchangers: HashMap<ProviderId, Arc<JwtExchanger>>,
}

impl AuthManager {
    pub fn new(store: Arc<CredentialStore>) -> Self {
        Self {
            store,
            states: Arc::new(StateRegistry::new()),
            oauth: HashMap::new(),
            exchangers: HashMap::new(),
        }
    }

    /// Builds OAuth clients and exchangers for every configured profile.
    pub fn from_config(config: &Config, store: Arc<CredentialStore>, http: &reqwest::Client) -> Self {
        let timeout = Duration::from_secs(config.http.credential_timeout_secs);
        let mut manager = Self::new(store);
        for (provider, profile) in &config.oauth {
            let client = OAuthClient::new(
                provider.clone(),
                profile.clone(),
                http.clone(),
                manager.states.clone(),
            )
            .with_timeout(timeout);
            manager = manager.with_oauth(client);
        }
        for (provider, profile) in &config.exchange {
            let exchanger = JwtExchanger::new(http.clone(), profile).with_timeout(timeout);
            manager = manager.with_exchanger(provider.clone(), exchanger);
        }
        manager
    }

    #[must_use]
    pub fn with_oauth(mut self, client: OAuthClient) -> Self {
        self.oauth.insert(client.provider().clone(), Arc::new(client));
        self
    }

    #[must_use]
    pub fn with_exchanger(mut self, provider: ProviderId, exchanger: JwtExchanger) -> Self {
        self.exchangers.insert(provider, Arc::new(exchanger));
        self
    }

    #[must_use]
    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    #[must_use]
    pub fn states(&self) -> &Arc<StateRegistry> {
        &self.states
    }

    /// The OAuth client configured for `provider`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] if no OAuth profile exists.
    pub fn oauth_client(&self, provider: &ProviderId) -> Result<Arc<OAuthClient>> {
        self.oauth
            .get(provider)
            .cloned()
            .ok_or_else(|| GatewayError::Config(format!("no oauth profile for {provider}")))
    }

    /// The exchanger configured for `provider`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] if no exchange profile exists.
    pub fn exchanger(&self, provider: &ProviderId) -> Result<Arc<JwtExchanger>> {
        self.exchangers
            .get(provider)
            .cloned()
            .ok_or_else(|| GatewayError::Config(format!("no exchange profile for {provider}")))
    }

    /// Returns a valid token for `credential`, refreshing or exchanging at
    /// most once.
    ///
    /// # Errors
    ///
    /// - `CredentialNotFound` / `CorruptCredential` from the store.
    /// - `CredentialExpired` for a revoked record, an expired JWT cookie, or
    ///   an expired OAuth pair without a refresh token.
    /// - `RefreshFailed` if the refresh or exchange call fails.
    /// - `Cancelled` if `ctx` fires first.
    pub async fn access_token(
        &self,
        ctx: &CancellationToken,
        credential: &CredentialRef,
    ) -> Result<AccessToken> {
        let CredentialRef { provider, identity } = credential;
        let stored = self.store.get(provider, identity).await?;
        if stored.status == CredentialStatus::Revoked {
            return Err(expired(credential));
        }
        let kind = stored.kind();
        let token = match &stored.secret {
            Secret::ApiKey { key } => key.clone(),
            Secret::OauthPair { access_token, .. } if !stored.is_expired() => access_token.clone(),
            Secret::OauthPair { .. } => {
                let refreshed = tokio::select! {
                    biased;
                    () = ctx.cancelled() => return Err(GatewayError::Cancelled),
                    r = self.refresh(credential, &stored) => r?,
                };
                refreshed.access_token().to_string()
            }
            Secret::JwtCookie { .. } if stored.is_expired() => return Err(expired(credential)),
            Secret::JwtCookie { token, .. } => {
                let exchanger = self.exchanger(provider)?;
                exchanger
                    .exchange_token(ctx, token)
                    .await
                    .map_err(|e| refresh_failed(credential, e))?
            }
        };
        Ok(AccessToken { token, kind })
    }

    async fn refresh(&self, credential: &CredentialRef, stored: &Credential) -> Result<Credential> {
        if stored.refresh_token().is_none() {
            return Err(expired(credential));
        }
        let client = self.oauth_client(&credential.provider)?;
        tracing::info!(provider = %credential.provider, identity = %credential.identity, "refreshing credential");
        self.store
            .refresh_with(&credential.provider, &credential.identity, |mut current| async move {
                let Some(refresh_token) = current.refresh_token().map(str::to_string) else {
                    return Err(expired(credential));
                };
                let grant = client
                    .refresh_token(&refresh_token)
                    .await
                    .map_err(|e| refresh_failed(credential, e))?;
                current.apply_refresh(
                    grant.into_credential(credential.provider.clone(), credential.identity.clone()),
                )?;
                Ok(current)
            })
            .await
    }

    /// Revokes (best effort) and deletes a stored credential.
    ///
    /// Local deletion happens even when the record is unreadable or the
    /// revoke call fails.
    ///
    /// # Errors
    ///
    /// Returns the store's error if the local deletion fails.
    pub async fn logout(&self, provider: &ProviderId, identity: &str) -> Result<()> {
        match self.store.get(provider, identity).await {
            Ok(credential) => {
                if let Secret::OauthPair {
                    access_token,
                    refresh_token,
                    ..
                } = &credential.secret
                    && let Some(client) = self.oauth.get(provider)
                {
                    client
                        .revoke_token(refresh_token.as_deref().unwrap_or(access_token))
                        .await;
                }
                if let Secret::JwtCookie { .. } = &credential.secret
                    && let Some(exchanger) = self.exchangers.get(provider)
                {
                    exchanger.clear();
                }
            }
            Err(e) => {
                tracing::warn!(%provider, identity, error = %e, "deleting credential without revocation");
            }
        }
        self.store.delete(provider, identity).await?;
        tracing::info!(%provider, identity, "logged out");
        Ok(())
    }

    /// Every readable credential stored for `provider`.
    ///
    /// # Errors
    ///
    /// Returns the store's error if listing fails.
    pub async fn credentials(&self, provider: &ProviderId) -> Result<Vec<Result<Credential>>> {
        let mut out = Vec::new();
        for identity in self.store.list(provider).await? {
            out.push(self.store.get(provider, &identity).await);
        }
        Ok(out)
    }

    /// Providers this manager can log in to or exchange for.
    #[must_use]
    pub fn providers(&self) -> Vec<ProviderId> {
        let mut out: Vec<ProviderId> = self
            .oauth
            .keys()
            .chain(self.exchangers.keys())
            .cloned()
            .collect();
        out.sort();
        out.dedup();
        out
    }
}

fn expired(credential: &CredentialRef) -> GatewayError {
    GatewayError::CredentialExpired {
        provider: credential.provider.clone(),
        identity: credential.identity.clone(),
    }
}

fn refresh_failed(credential: &CredentialRef, err: GatewayError) -> GatewayError {
    if matches!(
        err.root(),
        GatewayError::Cancelled | GatewayError::InvalidJwt(_)
    ) {
        return err;
    }
    GatewayError::RefreshFailed {
        provider: credential.provider.clone(),
        identity: credential.identity.clone(),
        reason: err.to_string(),
    }
}

impl std::fmt::Debug for AuthManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthManager")
            .field("providers", &self.providers())
            .finish_non_exhaustive()
    }
}
