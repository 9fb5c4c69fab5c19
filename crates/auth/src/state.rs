//! Single-use OAuth `state` tokens bound to their pending PKCE pair.

use crate::pkce::{PkceChallenge, random_state};
use keygate_types::{GatewayError, Result};
use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
    time::Duration,
};
use tokio::time::Instant;

/// How long a login may stay pending before its state is rejected.
pub const STATE_TTL: Duration = Duration::from_secs(600);

/// A registered anti-CSRF state token.
#[derive(Debug, Clone)]
pub struct AuthState {
    pub state_token: String,
    pub created_at: Instant,
    pub expires_at: Instant,
}

struct Pending {
    pkce: PkceChallenge,
    expires_at: Instant,
}

/// Pending logins keyed by state token.
pub struct StateRegistry {
    pending: Mutex<HashMap<String, Pending>>,
    ttl: Duration,
}

impl StateRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::with_ttl(STATE_TTL)
    }

    #[must_use]
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Generates a state token and remembers `pkce` under it.
    pub fn register(&self, pkce: PkceChallenge) -> AuthState {
        let created_at = Instant::now();
        let expires_at = created_at + self.ttl;
        let state_token = random_state();
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.retain(|_, p| p.expires_at > created_at);
        pending.insert(state_token.clone(), Pending { pkce, expires_at });
        AuthState {
            state_token,
            created_at,
            expires_at,
        }
    }

    /// Removes the state and returns its PKCE pair.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidState`] if the state is unknown, already
    /// consumed, or expired.
    pub fn consume(&self, state: &str) -> Result<PkceChallenge> {
        let entry = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(state)
            .ok_or(GatewayError::InvalidState)?;
        if Instant::now() >= entry.expires_at {
            return Err(GatewayError::InvalidState);
        }
        Ok(entry.pkce)
    }

    /// Number of pending logins, including expired ones not yet purged.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for StateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StateRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateRegistry")
            .field("pending", &self.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}
