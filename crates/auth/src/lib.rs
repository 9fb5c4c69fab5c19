//! Credential acquisition and renewal.
//!
//! Covers the OAuth2 + PKCE authorization-code flow, JWT rotating-token
//! exchange, and the [`AuthManager`] that turns a stored credential into a
//! token an executor can send upstream.

pub mod callback;
pub mod exchange;
pub mod flow;
pub mod jwt;
pub mod manager;
pub mod oauth;
pub mod pkce;
pub mod state;

pub use exchange::JwtExchanger;
pub use jwt::{JwtClaims, extract_rotating_token, parse_token};
pub use manager::{AccessToken, AuthManager};
pub use oauth::{AuthorizationRequest, OAuthClient, TokenGrant};
pub use pkce::PkceChallenge;
pub use state::{AuthState, StateRegistry};
