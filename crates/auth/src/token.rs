//! Unverified bearer-token decoding and liveness classification.
//!
//! The claims decoded here are never trusted for authorization. They only
//! drive client-side decisions such as pre-emptive refresh and routing.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::Value;

use crate::error::DecodeError;

/// Default window, in seconds, inside which a token counts as expiring soon.
pub const DEFAULT_EXPIRY_WINDOW_SECS: i64 = 300;

/// Claims decoded from the payload segment of an access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenClaims {
    /// The `sub` claim, when present
    pub subject: Option<String>,

    /// The role used for routing decisions (first role claim)
    pub subject_role: String,

    /// Every role listed in the token
    pub roles: Vec<String>,

    /// Expiry in epoch seconds
    pub expires_at: i64,
}

/// Liveness of a raw token at a given instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Live,
    ExpiringSoon,
    Expired,
    Malformed,
}

/// Stateless decoder for three-segment bearer tokens.
pub struct TokenCodec;

impl TokenCodec {
    /// Decode the claims of `token` without verifying its signature.
    pub fn decode(token: &str) -> Result<TokenClaims, DecodeError> {
        let segments: Vec<&str> = token.split('.').collect();
        if segments.len() != 3 {
            return Err(DecodeError::malformed(format!(
                "expected 3 segments, found {}",
                segments.len()
            )));
        }

        let payload = segments[1].trim_end_matches('=');
        if payload.is_empty() {
            return Err(DecodeError::malformed("empty payload segment"));
        }

        let bytes = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|e| DecodeError::malformed(format!("payload is not base64url: {}", e)))?;

        let value: Value = serde_json::from_slice(&bytes)
            .map_err(|e| DecodeError::malformed(format!("payload is not JSON: {}", e)))?;

        let object = value
            .as_object()
            .ok_or_else(|| DecodeError::malformed("payload is not a JSON object"))?;

        let expires_at = match object.get("exp") {
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f.floor() as i64))
                .ok_or_else(|| DecodeError::malformed("exp claim out of range"))?,
            _ => return Err(DecodeError::malformed("missing numeric exp claim")),
        };

        let roles = extract_roles(object);
        let subject_role = roles
            .first()
            .cloned()
            .ok_or_else(|| DecodeError::malformed("missing role claim"))?;

        let subject = object
            .get("sub")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(TokenClaims {
            subject,
            subject_role,
            roles,
            expires_at,
        })
    }

    /// `now >= exp`; the boundary second is already expired.
    pub fn is_expired(claims: &TokenClaims, now: i64) -> bool {
        now >= claims.expires_at
    }

    /// `now + window >= exp`
    pub fn is_expiring_soon(claims: &TokenClaims, now: i64, window: i64) -> bool {
        now.saturating_add(window) >= claims.expires_at
    }

    /// Classify a raw token in one step.
    pub fn liveness(token: &str, now: i64, window: i64) -> Liveness {
        match Self::decode(token) {
            Ok(claims) if Self::is_expired(&claims, now) => Liveness::Expired,
            Ok(claims) if Self::is_expiring_soon(&claims, now, window) => Liveness::ExpiringSoon,
            Ok(_) => Liveness::Live,
            Err(_) => Liveness::Malformed,
        }
    }
}

fn extract_roles(object: &serde_json::Map<String, Value>) -> Vec<String> {
    if let Some(Value::String(role)) = object.get("role") {
        if !role.is_empty() {
            let mut roles = vec![role.clone()];
            roles.extend(role_array(object, "roles").into_iter().filter(|r| r != role));
            return roles;
        }
    }

    let roles = role_array(object, "roles");
    if !roles.is_empty() {
        return roles;
    }
    role_array(object, "authorities")
}

fn role_array(object: &serde_json::Map<String, Value>, key: &str) -> Vec<String> {
    match object.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                // Spring-style `{ "authority": "ROLE_ADMIN" }` entries
                Value::Object(o) => o
                    .get("authority")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                _ => None,
            })
            .collect(),
        Some(Value::String(s)) if !s.is_empty() => vec![s.clone()],
        _ => Vec::new(),
    }
}
