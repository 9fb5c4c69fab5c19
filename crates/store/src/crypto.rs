//! AES-256-GCM sealing for credential files.
//!
//! Sealed layout: `nonce (12 bytes) ‖ ciphertext ‖ tag (16 bytes)`.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use keygate_types::{GatewayError, Result};
use rand::RngCore;
use std::fmt;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Encrypts and decrypts credential payloads with one 256-bit key.
pub struct Sealer {
    cipher: Aes256Gcm,
}

impl Sealer {
    #[must_use]
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(key.into()),
        }
    }

    /// Parses a 64-character hex key.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] if the key is not 32 hex-encoded bytes.
    pub fn from_hex(hex_key: &str) -> Result<Self> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| GatewayError::Config(format!("store key is not valid hex: {e}")))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| GatewayError::Config("store key must be 32 bytes (64 hex chars)".into()))?;
        Ok(Self::new(&key))
    }

    /// Reads the hex key from the named environment variable.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] if the variable is unset or malformed.
    pub fn from_env(var: &str) -> Result<Self> {
        let value = std::env::var(var).map_err(|_| {
            GatewayError::Config(format!(
                "store encryption is enabled but {var} is not set (generate one with `keygate keygen`)"
            ))
        })?;
        Self::from_hex(&value)
    }

    /// Generates a fresh hex-encoded 32-byte key.
    #[must_use]
    pub fn generate_key() -> String {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        hex::encode(key)
    }

    /// Encrypts `plaintext` under a fresh random nonce.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Storage`] if encryption fails.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| GatewayError::Storage(format!("AES-GCM encryption failed: {e}")))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypts a sealed payload. The error string is a reason suitable for
    /// [`GatewayError::CorruptCredential`].
    ///
    /// # Errors
    ///
    /// Returns a reason if the payload is truncated or fails authentication.
    pub fn open(&self, sealed: &[u8]) -> std::result::Result<Vec<u8>, String> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(format!("sealed payload too short ({} bytes)", sealed.len()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| "decryption failed (wrong key or tampered file)".to_string())
    }
}

impl fmt::Debug for Sealer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Sealer([redacted])")
    }
}
