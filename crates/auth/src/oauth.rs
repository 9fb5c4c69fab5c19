//! OAuth 2.0 Authorization Code + PKCE (S256) client.
//!
//! One [`OAuthClient`] serves one provider profile: it builds authorization
//! URLs, exchanges codes, refreshes, and revokes tokens. Pending logins are
//! tracked in a shared [`StateRegistry`].

use crate::{
    pkce::PkceChallenge,
    state::{AuthState, StateRegistry},
};
use keygate_config::OAuthProfileConfig;
use keygate_types::{Credential, GatewayError, ProviderId, Result, expiry_from_now};
use serde::Deserialize;
use std::{sync::Arc, time::Duration};

/// Bound on every token-endpoint call.
pub const CREDENTIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Lifetime assumed when the token endpoint omits `expires_in`.
const DEFAULT_EXPIRES_IN: u64 = 3600;

/// An authorization URL together with the state registered for it.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub url: String,
    pub state: AuthState,
}

/// Tokens returned by a successful grant.
#[derive(Clone)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Absolute expiry with the refresh lead already subtracted.
    pub expires_at: u64,
    pub scope: Option<String>,
    /// Account e-mail reported by the provider, when it includes one.
    pub account: Option<String>,
}

impl TokenGrant {
    #[must_use]
    pub fn into_credential(self, provider: ProviderId, identity: impl Into<String>) -> Credential {
        Credential::oauth_pair(
            provider,
            identity,
            self.access_token,
            self.refresh_token,
            self.expires_at,
            self.scope,
        )
    }
}

impl std::fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGrant")
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .field("account", &self.account)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    account: Option<AccountInfo>,
}

#[derive(Deserialize)]
struct AccountInfo {
    #[serde(default)]
    email_address: Option<String>,
}

impl From<TokenResponse> for TokenGrant {
    fn from(r: TokenResponse) -> Self {
        Self {
            access_token: r.access_token,
            refresh_token: r.refresh_token.filter(|t| !t.is_empty()),
            expires_at: expiry_from_now(r.expires_in.unwrap_or(DEFAULT_EXPIRES_IN)),
            scope: r.scope,
            account: r.account.and_then(|a| a.email_address),
        }
    }
}

pub struct OAuthClient {
    provider: ProviderId,
    profile: OAuthProfileConfig,
    http: reqwest::Client,
    states: Arc<StateRegistry>,
    timeout: Duration,
}

impl OAuthClient {
    pub fn new(
        provider: ProviderId,
        profile: OAuthProfileConfig,
        http: reqwest::Client,
        states: Arc<StateRegistry>,
    ) -> Self {
        Self {
            provider,
            profile,
            http,
            states,
            timeout: CREDENTIAL_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn provider(&self) -> &ProviderId {
        &self.provider
    }

    #[must_use]
    pub fn profile(&self) -> &OAuthProfileConfig {
        &self.profile
    }

    /// Builds the authorization URL for a fresh PKCE pair and registers its state.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] if the query cannot be encoded.
    pub fn generate_auth_url(&self) -> Result<AuthorizationRequest> {
        let pkce = PkceChallenge::generate();
        let challenge = pkce.challenge.clone();
        let state = self.states.register(pkce);
        let scope = self.profile.scopes.join(" ");

        let mut params: Vec<(&str, &str)> = vec![
            ("client_id", self.profile.client_id.as_str()),
            ("redirect_uri", self.profile.redirect_uri.as_str()),
            ("response_type", "code"),
            ("scope", scope.as_str()),
            ("code_challenge", challenge.as_str()),
            ("code_challenge_method", "S256"),
            ("state", state.state_token.as_str()),
        ];
        for (k, v) in &self.profile.extra_auth_params {
            params.push((k.as_str(), v.as_str()));
        }
        let query = serde_urlencoded::to_string(&params)
            .map_err(|e| GatewayError::Config(format!("cannot encode auth url: {e}")))?;
        let sep = if self.profile.auth_url.contains('?') { '&' } else { '?' };
        Ok(AuthorizationRequest {
            url: format!("{}{sep}{query}", self.profile.auth_url),
            state,
        })
    }

    /// Performs the `authorization_code` grant.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Upstream`] on a non-2xx answer and
    /// [`GatewayError::Network`] on transport failure or timeout.
    pub async fn exchange_code(&self, code: &str, pkce: &PkceChallenge) -> Result<TokenGrant> {
        let form = [
            ("grant_type", "authorization_code"),
            ("client_id", self.profile.client_id.as_str()),
            ("code", code),
            ("redirect_uri", self.profile.redirect_uri.as_str()),
            ("code_verifier", pkce.verifier.as_str()),
        ];
        let grant = self
            .token_request(&form)
            .await
            .map_err(|e| e.context(format!("{}: code exchange", self.provider)))?;
        tracing::info!(provider = %self.provider, "authorization code exchanged");
        Ok(grant)
    }

    /// Consumes `state` and exchanges `code` with the PKCE pair stored under it.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidState`] for an unknown, expired, or
    /// reused state, otherwise the errors of [`OAuthClient::exchange_code`].
    pub async fn complete(&self, code: &str, state: &str) -> Result<TokenGrant> {
        let pkce = self.states.consume(state)?;
        self.exchange_code(code, &pkce).await
    }

    /// Performs the `refresh_token` grant.
    ///
    /// # Errors
    ///
    /// See [`OAuthClient::exchange_code`].
    pub async fn refresh_token(&self, refresh_token: &str) -> Result<TokenGrant> {
        let form = [
            ("grant_type", "refresh_token"),
            ("client_id", self.profile.client_id.as_str()),
            ("refresh_token", refresh_token),
        ];
        self.token_request(&form)
            .await
            .map_err(|e| e.context(format!("{}: refresh", self.provider)))
    }

    /// Best-effort revocation. Failures are logged and swallowed.
    pub async fn revoke_token(&self, token: &str) {
        let Some(url) = &self.profile.revoke_url else {
            return;
        };
        let form = [("token", token), ("client_id", self.profile.client_id.as_str())];
        let result = self
            .http
            .post(url)
            .timeout(self.timeout)
            .form(&form)
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!(provider = %self.provider, "token revoked");
            }
            Ok(resp) => {
                tracing::warn!(provider = %self.provider, status = resp.status().as_u16(), "token revocation rejected");
            }
            Err(e) => {
                tracing::warn!(provider = %self.provider, error = %GatewayError::from(e), "token revocation failed");
            }
        }
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<TokenGrant> {
        let resp = self
            .http
            .post(&self.profile.token_url)
            .timeout(self.timeout)
            .header("Accept", "application/json")
            .form(form)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(GatewayError::upstream(status.as_u16(), &text));
        }
        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| GatewayError::Protocol(format!("invalid token response: {}", e.without_url())))?;
        if body.access_token.is_empty() {
            return Err(GatewayError::Protocol("token response has empty access_token".into()));
        }
        Ok(body.into())
    }
}

impl std::fmt::Debug for OAuthClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthClient")
            .field("provider", &self.provider)
            .field("token_url", &self.profile.token_url)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keygate_types::{REFRESH_LEAD_SECS, unix_now};
    use serde_json::json;
    use std::collections::HashMap;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_string_contains, method, path},
    };

    fn profile(server: &str) -> OAuthProfileConfig {
        OAuthProfileConfig {
            client_id: "client-1".into(),
            auth_url: "https://auth.example.com/authorize".into(),
            token_url: format!("{server}/token"),
            revoke_url: Some(format!("{server}/revoke")),
            redirect_uri: "http://localhost:54545/callback".into(),
            scopes: vec!["user:profile".into(), "user:inference".into()],
            extra_auth_params: std::collections::BTreeMap::from([("code".into(), "true".into())]),
        }
    }

    fn client(server: &str) -> OAuthClient {
        OAuthClient::new(
            ProviderId::claude(),
            profile(server),
            reqwest::Client::new(),
            Arc::new(StateRegistry::new()),
        )
    }

    fn query_of(url: &str) -> HashMap<String, String> {
        serde_urlencoded::from_str(url.split_once('?').unwrap().1).unwrap()
    }

    #[test]
    fn test_auth_url_params() {
        let c = client("http://unused");
        let req = c.generate_auth_url().unwrap();
        assert!(req.url.starts_with("https://auth.example.com/authorize?"));
        let q = query_of(&req.url);
        assert_eq!(q["client_id"], "client-1");
        assert_eq!(q["redirect_uri"], "http://localhost:54545/callback");
        assert_eq!(q["response_type"], "code");
        assert_eq!(q["scope"], "user:profile user:inference");
        assert_eq!(q["code_challenge_method"], "S256");
        assert_eq!(q["state"], req.state.state_token);
        assert_eq!(q["code"], "true");
        assert_eq!(q["code_challenge"].len(), 43);
    }

    #[tokio::test]
    async fn test_complete_exchanges_with_stored_verifier() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=the-code"))
            .and(body_string_contains("code_verifier="))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "tok1",
                "refresh_token": "rt1",
                "expires_in": 3600,
                "account": {"email_address": "u@e.com"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let c = client(&server.uri());
        let req = c.generate_auth_url().unwrap();
        let grant = c.complete("the-code", &req.state.state_token).await.unwrap();
        assert_eq!(grant.access_token, "tok1");
        assert_eq!(grant.refresh_token.as_deref(), Some("rt1"));
        assert_eq!(grant.account.as_deref(), Some("u@e.com"));
        let expected = unix_now() + 3600 - REFRESH_LEAD_SECS;
        assert!(grant.expires_at.abs_diff(expected) <= 2);
    }

    #[tokio::test]
    async fn test_complete_rejects_reused_state() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "t"})))
            .expect(1)
            .mount(&server)
            .await;

        let c = client(&server.uri());
        let req = c.generate_auth_url().unwrap();
        c.complete("code", &req.state.state_token).await.unwrap();
        let err = c.complete("code", &req.state.state_token).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidState));
        let err = c.complete("code", "forged").await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidState));
    }

    #[tokio::test]
    async fn test_exchange_non_2xx_is_upstream() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_string(r#"{"error":"invalid_grant"}"#))
            .mount(&server)
            .await;

        let c = client(&server.uri());
        let err = c
            .exchange_code("bad", &PkceChallenge::generate())
            .await
            .unwrap_err();
        assert!(matches!(err.root(), GatewayError::Upstream { status: 400, .. }));
        assert!(err.to_string().contains("claude: code exchange"));
    }

    #[tokio::test]
    async fn test_refresh_grant() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=rt1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "tok2",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let grant = client(&server.uri()).refresh_token("rt1").await.unwrap();
        assert_eq!(grant.access_token, "tok2");
        assert!(grant.refresh_token.is_none());
    }

    #[tokio::test]
    async fn test_missing_access_token_is_protocol_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"expires_in": 1})))
            .mount(&server)
            .await;
        let err = client(&server.uri()).refresh_token("rt").await.unwrap_err();
        assert!(matches!(err.root(), GatewayError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_timeout_is_network_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"access_token": "t"}))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;
        let c = client(&server.uri()).with_timeout(Duration::from_millis(50));
        let err = c.refresh_token("rt").await.unwrap_err();
        assert!(matches!(err.root(), GatewayError::Network(_)));
    }

    #[tokio::test]
    async fn test_revoke_failure_is_swallowed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/revoke"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;
        client(&server.uri()).revoke_token("tok").await;
    }
}
