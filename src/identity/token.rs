//! Stateless bearer tokens.
//!
//! Wire format: `base64url(payload-json) "." base64url(HMAC-SHA256(base64url-payload))`,
//! both segments unpadded. Validity depends only on the signature and the
//! embedded timestamps; nothing is stored server-side.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::security::constant_time_eq;

type HmacSha256 = Hmac<Sha256>;

/// Accepted clock skew between issuer and validator, in seconds.
pub const CLOCK_SKEW_SECS: i64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    #[serde(rename = "u")]
    pub username: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token is malformed")]
    Malformed,
    #[error("token signature mismatch")]
    BadSignature,
    #[error("token expired")]
    Expired,
    #[error("token issued in the future")]
    IssuedInFuture,
    #[error("token lifetime exceeds current policy")]
    LifetimeTooLong,
}

#[derive(Clone)]
pub struct TokenCodec {
    key: [u8; 32],
    ttl_secs: i64,
}

impl TokenCodec {
    pub fn new(key: [u8; 32], ttl_secs: i64) -> Self { Self { key, ttl_secs } }

    pub fn ttl_secs(&self) -> i64 { self.ttl_secs }

    fn sign(&self, payload_b64: &str) -> String {
        // HMAC accepts keys of any length, so new_from_slice cannot fail for a 32-byte key.
        let mut mac = match HmacSha256::new_from_slice(&self.key) {
            Ok(m) => m,
            Err(_) => return String::new(),
        };
        mac.update(payload_b64.as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }

    pub fn issue(&self, username: &str, now: i64) -> String {
        let claims = TokenClaims { username: username.to_string(), iat: now, exp: now + self.ttl_secs };
        let payload = serde_json::to_vec(&claims).unwrap_or_default();
        let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
        let sig = self.sign(&payload_b64);
        format!("{}.{}", payload_b64, sig)
    }

    pub fn validate(&self, token: &str, now: i64) -> Result<TokenClaims, TokenError> {
        let (payload_b64, sig_b64) = token.trim().split_once('.').ok_or(TokenError::Malformed)?;
        let expected = self.sign(payload_b64);
        if expected.is_empty() || !constant_time_eq(expected.as_bytes(), sig_b64.as_bytes()) {
            return Err(TokenError::BadSignature);
        }
        let payload = URL_SAFE_NO_PAD.decode(payload_b64).map_err(|_| TokenError::Malformed)?;
        let claims: TokenClaims = serde_json::from_slice(&payload).map_err(|_| TokenError::Malformed)?;
        if claims.username.trim().is_empty() { return Err(TokenError::Malformed); }

        if now > claims.exp { return Err(TokenError::Expired); }
        if claims.iat > now + CLOCK_SKEW_SECS { return Err(TokenError::IssuedInFuture); }
        let lifetime = claims.exp - claims.iat;
        if lifetime <= 0 || lifetime > self.ttl_secs + CLOCK_SKEW_SECS {
            return Err(TokenError::LifetimeTooLong);
        }
        Ok(claims)
    }
}
