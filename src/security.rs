use anyhow::{Result, anyhow};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use password_hash::{SaltString, PasswordHash};
use sha2::{Digest, Sha256};

/// Prefix of the pre-argon2 record format (`sha256:<hex digest>`).
const LEGACY_SHA256_PREFIX: &str = "sha256:";

/// Outcome of checking a password against a stored record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub ok: bool,
    /// Replacement hash under the current scheme, set when the stored record used a legacy format.
    pub upgraded: Option<String>,
}

impl Verification {
    fn rejected() -> Self { Self { ok: false, upgraded: None } }
}

pub fn hash_password(password: &str) -> Result<String> {
    let mut salt_bytes = [0u8; 16];
    getrandom::getrandom(&mut salt_bytes).map_err(|e| anyhow!(e.to_string()))?;
    let salt = SaltString::encode_b64(&salt_bytes).map_err(|e| anyhow!(e.to_string()))?;
    let argon2 = Argon2::default();
    let phc = argon2.hash_password(password.as_bytes(), &salt).map_err(|e| anyhow!(e.to_string()))?.to_string();
    Ok(phc)
}

pub fn is_current_scheme(stored: &str) -> bool {
    stored.starts_with("$argon2")
}

/// Check `password` against `stored`.
///
/// Argon2 PHC strings are the current scheme. Two legacy shapes are still
/// accepted so older credential files keep working: `sha256:<hex>` and bare
/// plaintext. A successful legacy match returns an argon2 replacement in
/// `upgraded` for the caller to persist.
pub fn verify_password(stored: &str, password: &str) -> Verification {
    let stored = stored.trim();
    if stored.is_empty() { return Verification::rejected(); }

    if is_current_scheme(stored) {
        let ok = match PasswordHash::new(stored) {
            Ok(parsed) => Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok(),
            Err(_) => false,
        };
        return Verification { ok, upgraded: None };
    }

    let legacy_ok = if let Some(hex_digest) = stored.strip_prefix(LEGACY_SHA256_PREFIX) {
        let digest = hex::encode(Sha256::digest(password.as_bytes()));
        constant_time_eq(digest.as_bytes(), hex_digest.to_ascii_lowercase().as_bytes())
    } else {
        constant_time_eq(stored.as_bytes(), password.as_bytes())
    };
    if !legacy_ok { return Verification::rejected(); }

    match hash_password(password) {
        Ok(h) => Verification { ok: true, upgraded: Some(h) },
        Err(e) => {
            tracing::warn!(target: "auth", "password verified but re-hash failed: {}", e);
            Verification { ok: true, upgraded: None }
        }
    }
}

/// Constant-time comparison to prevent timing attacks.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}
