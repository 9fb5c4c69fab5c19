//! Stored credential representation and expiry logic.

use crate::{GatewayError, ProviderId};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// Grace period before `expires_at` during which a credential already counts
/// as expired.
pub const EXPIRY_BUFFER_SECS: u64 = 60;

/// Subtracted from a provider-declared `expires_in` so refresh precedes real
/// expiry.
pub const REFRESH_LEAD_SECS: u64 = 300;

/// Identity used when a login does not name one.
pub const DEFAULT_IDENTITY: &str = "default";

/// Seconds since the Unix epoch.
#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

/// Absolute expiry for a token that lives `expires_in` seconds, minus
/// [`REFRESH_LEAD_SECS`].
#[must_use]
pub fn expiry_from_now(expires_in: u64) -> u64 {
    unix_now() + expires_in.saturating_sub(REFRESH_LEAD_SECS)
}

/// Addresses one stored credential.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CredentialRef {
    pub provider: ProviderId,
    pub identity: String,
}

impl CredentialRef {
    pub fn new(provider: ProviderId, identity: impl Into<String>) -> Self {
        Self {
            provider,
            identity: identity.into(),
        }
    }
}

impl fmt::Display for CredentialRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.identity)
    }
}

/// Lifecycle status of a stored credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    Active,
    Expired,
    Revoked,
}

/// Discriminator of [`Secret`], useful for listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    OauthPair,
    JwtCookie,
    ApiKey,
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::OauthPair => "oauth_pair",
            Self::JwtCookie => "jwt_cookie",
            Self::ApiKey => "api_key",
        })
    }
}

/// The secret material of a credential, tagged by kind.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Secret {
    /// OAuth2 access token with an optional refresh token.
    OauthPair {
        access_token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        refresh_token: Option<String>,
        expires_at: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scope: Option<String>,
    },
    /// A bearer JWT carrying a rotating token, exchanged per use.
    JwtCookie { token: String, expires_at: u64 },
    /// A static API key. Never expires.
    ApiKey { key: String },
}

/// A credential owned by the credential store, one per `(provider, identity)`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub provider: ProviderId,
    pub identity: String,
    pub status: CredentialStatus,
    pub issued_at: u64,
    pub secret: Secret,
}

impl Credential {
    fn with_secret(provider: ProviderId, identity: impl Into<String>, secret: Secret) -> Self {
        Self {
            provider,
            identity: identity.into(),
            status: CredentialStatus::Active,
            issued_at: unix_now(),
            secret,
        }
    }

    /// Creates an OAuth credential.
    pub fn oauth_pair(
        provider: ProviderId,
        identity: impl Into<String>,
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        expires_at: u64,
        scope: Option<String>,
    ) -> Self {
        Self::with_secret(
            provider,
            identity,
            Secret::OauthPair {
                access_token: access_token.into(),
                refresh_token,
                expires_at,
                scope,
            },
        )
    }

    /// Creates a JWT-cookie credential.
    pub fn jwt_cookie(
        provider: ProviderId,
        identity: impl Into<String>,
        token: impl Into<String>,
        expires_at: u64,
    ) -> Self {
        Self::with_secret(
            provider,
            identity,
            Secret::JwtCookie {
                token: token.into(),
                expires_at,
            },
        )
    }

    /// Creates a static API-key credential.
    pub fn api_key(provider: ProviderId, identity: impl Into<String>, key: impl Into<String>) -> Self {
        Self::with_secret(provider, identity, Secret::ApiKey { key: key.into() })
    }

    #[must_use]
    pub fn reference(&self) -> CredentialRef {
        CredentialRef::new(self.provider.clone(), self.identity.clone())
    }

    #[must_use]
    pub fn kind(&self) -> CredentialKind {
        match &self.secret {
            Secret::OauthPair { .. } => CredentialKind::OauthPair,
            Secret::JwtCookie { .. } => CredentialKind::JwtCookie,
            Secret::ApiKey { .. } => CredentialKind::ApiKey,
        }
    }

    /// The token presented upstream (or exchanged, for JWT cookies).
    #[must_use]
    pub fn access_token(&self) -> &str {
        match &self.secret {
            Secret::OauthPair { access_token, .. } => access_token,
            Secret::JwtCookie { token, .. } => token,
            Secret::ApiKey { key } => key,
        }
    }

    #[must_use]
    pub fn refresh_token(&self) -> Option<&str> {
        match &self.secret {
            Secret::OauthPair { refresh_token, .. } => refresh_token.as_deref(),
            Secret::JwtCookie { .. } | Secret::ApiKey { .. } => None,
        }
    }

    #[must_use]
    pub fn expires_at(&self) -> Option<u64> {
        match &self.secret {
            Secret::OauthPair { expires_at, .. } | Secret::JwtCookie { expires_at, .. } => {
                Some(*expires_at)
            }
            Secret::ApiKey { .. } => None,
        }
    }

    /// Returns `true` if `now > expires_at - EXPIRY_BUFFER_SECS`.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(unix_now())
    }

    #[must_use]
    pub fn is_expired_at(&self, now: u64) -> bool {
        self.expires_at()
            .is_some_and(|exp| now > exp.saturating_sub(EXPIRY_BUFFER_SECS))
    }

    /// Active and not expired.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        self.status == CredentialStatus::Active && !self.is_expired()
    }

    /// Checks record invariants before persisting.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Validation`] if an active credential carries an
    /// empty token or the identity is empty.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.identity.is_empty() {
            return Err(GatewayError::Validation("credential identity is empty".into()));
        }
        if self.status == CredentialStatus::Active && self.access_token().is_empty() {
            return Err(GatewayError::Validation(format!(
                "active credential {} has an empty token",
                self.reference()
            )));
        }
        Ok(())
    }

    /// Replaces the OAuth tokens in place after a refresh.
    ///
    /// The previous refresh token is kept when the provider does not rotate it.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Validation`] for non-OAuth credentials.
    pub fn apply_refresh(&mut self, refreshed: Credential) -> Result<(), GatewayError> {
        let Secret::OauthPair {
            access_token,
            refresh_token,
            expires_at,
            scope,
        } = refreshed.secret
        else {
            return Err(GatewayError::Validation(
                "refresh produced a non-oauth credential".into(),
            ));
        };
        match &mut self.secret {
            Secret::OauthPair {
                access_token: old_access,
                refresh_token: old_refresh,
                expires_at: old_expires,
                scope: old_scope,
            } => {
                *old_access = access_token;
                if refresh_token.is_some() {
                    *old_refresh = refresh_token;
                }
                *old_expires = expires_at;
                if scope.is_some() {
                    *old_scope = scope;
                }
                self.issued_at = unix_now();
                self.status = CredentialStatus::Active;
                Ok(())
            }
            Secret::JwtCookie { .. } | Secret::ApiKey { .. } => Err(GatewayError::Validation(
                format!("credential {} is not refreshable", self.reference()),
            )),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("provider", &self.provider)
            .field("identity", &self.identity)
            .field("kind", &self.kind())
            .field("status", &self.status)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at())
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret([redacted])")
    }
}
