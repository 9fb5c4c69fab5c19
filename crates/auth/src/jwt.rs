//! Structural and temporal validation of bearer JWTs carrying a rotating token.
//!
//! Signatures are not verified: the identity provider does that when the
//! rotating token is exchanged.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use keygate_types::{GatewayError, Result, unix_now};
use serde_json::{Map, Value};

/// Claim holding the rotating token unless configured otherwise.
pub const DEFAULT_ROTATING_CLAIM: &str = "rotating_token";

/// Claims of a validated bearer JWT.
#[derive(Debug, Clone, PartialEq)]
pub struct JwtClaims {
    pub subject: Option<String>,
    pub expires_at: u64,
    pub not_before: Option<u64>,
    pub rotating_token: String,
    /// Every other claim, untouched.
    pub extra: Map<String, Value>,
}

fn invalid(reason: impl Into<String>) -> GatewayError {
    GatewayError::InvalidJwt(reason.into())
}

fn decode_segment(segment: &str, name: &str) -> Result<Map<String, Value>> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment.trim_end_matches('='))
        .map_err(|e| invalid(format!("{name} is not base64url: {e}")))?;
    match serde_json::from_slice(&bytes) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(invalid(format!("{name} is not a JSON object"))),
        Err(e) => Err(invalid(format!("{name} is not JSON: {e}"))),
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn numeric_claim(claims: &Map<String, Value>, name: &str) -> Result<Option<u64>> {
    match claims.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .or_else(|| v.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .map(Some)
            .ok_or_else(|| invalid(format!("'{name}' is not a numeric date"))),
    }
}

/// Parses and validates `jwt` against the current time.
///
/// # Errors
///
/// Returns [`GatewayError::InvalidJwt`] if the token is not three base64url
/// JSON segments, is expired, is not yet valid, or lacks a non-empty
/// `rotating_claim`.
pub fn parse_token(jwt: &str, rotating_claim: &str) -> Result<JwtClaims> {
    parse_token_at(jwt, rotating_claim, unix_now())
}

/// [`parse_token`] with an explicit clock.
///
/// # Errors
///
/// See [`parse_token`].
pub fn parse_token_at(jwt: &str, rotating_claim: &str, now: u64) -> Result<JwtClaims> {
    let segments: Vec<&str> = jwt.trim().split('.').collect();
    let [header, payload, _signature] = segments.as_slice() else {
        return Err(invalid(format!(
            "expected 3 segments, found {}",
            segments.len()
        )));
    };
    decode_segment(header, "header")?;
    let mut claims = decode_segment(payload, "payload")?;

    let expires_at = numeric_claim(&claims, "exp")?.ok_or_else(|| invalid("missing 'exp'"))?;
    if expires_at <= now {
        return Err(invalid("token expired"));
    }
    let not_before = numeric_claim(&claims, "nbf")?;
    if not_before.is_some_and(|nbf| nbf > now) {
        return Err(invalid("token not yet valid"));
    }
    let rotating_token = match claims.remove(rotating_claim) {
        Some(Value::String(s)) if !s.is_empty() => s,
        _ => return Err(invalid(format!("missing '{rotating_claim}' claim"))),
    };
    let subject = match claims.remove("sub") {
        Some(Value::String(s)) => Some(s),
        _ => None,
    };
    claims.remove("exp");
    claims.remove("nbf");

    Ok(JwtClaims {
        subject,
        expires_at,
        not_before,
        rotating_token,
        extra: claims,
    })
}

/// Returns the rotating token of a valid JWT.
///
/// # Errors
///
/// See [`parse_token`].
pub fn extract_rotating_token(jwt: &str, rotating_claim: &str) -> Result<String> {
    parse_token(jwt, rotating_claim).map(|c| c.rotating_token)
}
