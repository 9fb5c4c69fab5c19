//! Login flows that end with a credential in the store.

use crate::{
    AuthManager,
    callback::{CallbackServer, Redirect},
    jwt,
};
use keygate_types::{Credential, CredentialRef, DEFAULT_IDENTITY, GatewayError, ProviderId, Result};
use std::time::Duration;

/// Runs the interactive OAuth2 + PKCE login for `provider`.
///
/// The callback listener is bound before the browser opens. The stored
/// identity is `identity` if given, else the account e-mail the provider
/// reports, else `"default"`.
///
/// # Errors
///
/// Returns an error if no OAuth profile is configured, the callback port
/// cannot be bound, the redirect carries an error or an invalid state, or the
/// code exchange fails.
pub async fn login(
    auth: &AuthManager,
    provider: &ProviderId,
    identity: Option<&str>,
    timeout: Duration,
) -> Result<CredentialRef> {
    let client = auth.oauth_client(provider)?;
    let server = CallbackServer::bind(&client.profile().redirect_uri).await?;
    let request = client.generate_auth_url()?;
    open_browser(&request.url);

    let (code, state) = match server.wait(timeout).await? {
        Redirect::Authorized { code, state } => (code, state),
        Redirect::Denied { error, description } => {
            return Err(GatewayError::Validation(format!(
                "authorization denied: {error} {}",
                description.unwrap_or_default()
            )));
        }
    };

    let grant = client.complete(&code, &state).await?;
    let identity = identity
        .map(str::to_string)
        .or_else(|| grant.account.clone())
        .unwrap_or_else(|| DEFAULT_IDENTITY.to_string());
    let credential = grant.into_credential(provider.clone(), identity);
    let reference = credential.reference();
    auth.store().save(credential).await?;
    tracing::info!(%provider, identity = %reference.identity, "login successful");
    Ok(reference)
}

/// Stores a static API key.
///
/// # Errors
///
/// Returns [`GatewayError::Validation`] for an empty key, or the store's error.
pub async fn save_api_key(
    auth: &AuthManager,
    provider: &ProviderId,
    identity: &str,
    key: &str,
) -> Result<CredentialRef> {
    let credential = Credential::api_key(provider.clone(), identity, key.trim());
    let reference = credential.reference();
    auth.store().save(credential).await?;
    tracing::info!(%provider, identity, "api key stored");
    Ok(reference)
}

/// Validates and stores a bearer JWT cookie.
///
/// # Errors
///
/// Returns [`GatewayError::InvalidJwt`] if the token fails validation against
/// the provider's rotating-token claim, or the store's error.
pub async fn save_jwt_cookie(
    auth: &AuthManager,
    provider: &ProviderId,
    identity: &str,
    token: &str,
) -> Result<CredentialRef> {
    let claim = auth
        .exchanger(provider)
        .map(|e| e.rotating_claim().to_string())
        .unwrap_or_else(|_| jwt::DEFAULT_ROTATING_CLAIM.to_string());
    let claims = jwt::parse_token(token.trim(), &claim)?;
    let credential = Credential::jwt_cookie(provider.clone(), identity, token.trim(), claims.expires_at);
    let reference = credential.reference();
    auth.store().save(credential).await?;
    tracing::info!(%provider, identity, "jwt cookie stored");
    Ok(reference)
}

fn open_browser(url: &str) {
    eprintln!("Opening browser for authorization...");
    eprintln!("If the browser does not open, visit:\n  {url}");
    if let Err(e) = open::that(url) {
        tracing::warn!(error = %e, "failed to open browser");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jwt::tests::make_jwt;
    use keygate_store::CredentialStore;
    use keygate_types::{CredentialKind, unix_now};
    use serde_json::json;
    use std::sync::Arc;

    fn manager() -> AuthManager {
        AuthManager::new(Arc::new(CredentialStore::in_memory()))
    }

    #[tokio::test]
    async fn test_save_api_key() {
        let m = manager();
        let r = save_api_key(&m, &ProviderId::claude(), "default", " sk-1 \n")
            .await
            .unwrap();
        let c = m.store().get(&r.provider, &r.identity).await.unwrap();
        assert_eq!(c.access_token(), "sk-1");
    }

    #[tokio::test]
    async fn test_save_empty_api_key_rejected() {
        let err = save_api_key(&manager(), &ProviderId::claude(), "default", "  ")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
    }

    #[tokio::test]
    async fn test_save_jwt_cookie_records_expiry() {
        let m = manager();
        let exp = unix_now() + 3600;
        let token = make_jwt(&json!({"exp": exp, "rotating_token": "R"}));
        let r = save_jwt_cookie(&m, &ProviderId::new("web").unwrap(), "me", &token)
            .await
            .unwrap();
        let c = m.store().get(&r.provider, &r.identity).await.unwrap();
        assert_eq!(c.kind(), CredentialKind::JwtCookie);
        assert_eq!(c.expires_at(), Some(exp));
    }

    #[tokio::test]
    async fn test_save_invalid_jwt_rejected() {
        let err = save_jwt_cookie(&manager(), &ProviderId::new("web").unwrap(), "me", "a.b")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidJwt(_)));
    }

    #[tokio::test]
    async fn test_login_without_profile() {
        let err = login(&manager(), &ProviderId::claude(), None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }
}
