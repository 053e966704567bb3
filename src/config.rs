//! Agent configuration resolved from environment-style variables.
//!
//! The master code is the only required value; everything else has a bounded
//! default. `from_lookup` takes any key -> value function so tests can feed a map
//! instead of mutating the process environment.

use std::path::PathBuf;
use std::time::Duration;

use sha2::{Digest, Sha256};
use thiserror::Error;

pub const DEFAULT_TOKEN_TTL_MINUTES: u64 = 10;
pub const DEFAULT_REGISTRATION_GRANT_MINUTES: u64 = 10;
pub const DEFAULT_HTTP_PORT: u16 = 5001;
pub const DEFAULT_PROOF_WINDOW_SECS: u64 = 10;
pub const DEFAULT_FPS: u32 = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing environment variable AUTH_MASTER_CODE. Please set AUTH_MASTER_CODE before starting the server.")]
    MissingMasterCode,
    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Clone)]
pub struct AgentConfig {
    pub master_code: String,
    /// SHA-256 of the token secret; the HMAC key for bearer tokens.
    pub token_key: [u8; 32],
    pub token_ttl: Duration,
    pub registration_grant_ttl: Duration,
    pub bind: String,
    pub http_port: u16,
    pub data_dir: PathBuf,
    pub proof_window: Duration,
    pub default_fps: u32,
    pub camera_device: Option<String>,
    pub key_device: Option<PathBuf>,
}

impl std::fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // master code and key stay out of logs
        f.debug_struct("AgentConfig")
            .field("token_ttl", &self.token_ttl)
            .field("registration_grant_ttl", &self.registration_grant_ttl)
            .field("bind", &self.bind)
            .field("http_port", &self.http_port)
            .field("data_dir", &self.data_dir)
            .field("proof_window", &self.proof_window)
            .field("default_fps", &self.default_fps)
            .field("camera_device", &self.camera_device)
            .field("key_device", &self.key_device)
            .finish()
    }
}

fn parse_bounded(raw: Option<String>, min: u64, max: u64) -> Option<u64> {
    let v = raw?.trim().parse::<u64>().ok()?;
    if v >= min && v <= max { Some(v) } else { None }
}

fn non_blank(raw: Option<String>) -> Option<String> {
    raw.filter(|s| !s.trim().is_empty())
}

pub fn derive_token_key(secret: &str) -> [u8; 32] {
    let digest = Sha256::digest(secret.as_bytes());
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest);
    key
}

impl AgentConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let master_code = non_blank(lookup("AUTH_MASTER_CODE")).ok_or(ConfigError::MissingMasterCode)?;

        // Stable default so tokens survive an agent restart.
        let secret = non_blank(lookup("AUTH_TOKEN_SECRET")).unwrap_or_else(|| format!("{}::auth_token_secret", master_code));

        let token_ttl = if let Some(m) = parse_bounded(lookup("AUTH_TOKEN_TTL_MINUTES"), 1, 24 * 60) {
            Duration::from_secs(m * 60)
        } else if let Some(h) = parse_bounded(lookup("AUTH_TOKEN_TTL_HOURS"), 1, 24 * 7) {
            Duration::from_secs(h * 3600)
        } else {
            Duration::from_secs(DEFAULT_TOKEN_TTL_MINUTES * 60)
        };

        let grant_min = parse_bounded(lookup("AUTH_REGISTRATION_GRANT_MINUTES"), 1, 24 * 60).unwrap_or(DEFAULT_REGISTRATION_GRANT_MINUTES);

        let http_port = match non_blank(lookup("SENTINEL_HTTP_PORT")) {
            Some(v) => v.trim().parse::<u16>().map_err(|_| ConfigError::Invalid { name: "SENTINEL_HTTP_PORT", value: v })?,
            None => DEFAULT_HTTP_PORT,
        };

        let proof_secs = parse_bounded(lookup("SENTINEL_PROOF_WINDOW_SECS"), 1, 120).unwrap_or(DEFAULT_PROOF_WINDOW_SECS);
        let default_fps = parse_bounded(lookup("SENTINEL_DEFAULT_FPS"), 1, 30).map(|v| v as u32).unwrap_or(DEFAULT_FPS);

        Ok(Self {
            master_code,
            token_key: derive_token_key(&secret),
            token_ttl,
            registration_grant_ttl: Duration::from_secs(grant_min * 60),
            bind: non_blank(lookup("SENTINEL_BIND")).unwrap_or_else(|| "0.0.0.0".to_string()),
            http_port,
            data_dir: PathBuf::from(non_blank(lookup("SENTINEL_DATA_DIR")).unwrap_or_else(|| "data".to_string())),
            proof_window: Duration::from_secs(proof_secs),
            default_fps,
            camera_device: non_blank(lookup("SENTINEL_CAMERA_DEVICE")),
            key_device: non_blank(lookup("SENTINEL_KEY_DEVICE")).map(PathBuf::from),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn cfg(pairs: &[(&str, &str)]) -> Result<AgentConfig, ConfigError> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        AgentConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn master_code_is_required() {
        assert_eq!(cfg(&[]).unwrap_err(), ConfigError::MissingMasterCode);
        assert_eq!(cfg(&[("AUTH_MASTER_CODE", "   ")]).unwrap_err(), ConfigError::MissingMasterCode);
    }

    #[test]
    fn defaults_apply() {
        let c = cfg(&[("AUTH_MASTER_CODE", "X9")]).unwrap();
        assert_eq!(c.token_ttl, Duration::from_secs(600));
        assert_eq!(c.registration_grant_ttl, Duration::from_secs(600));
        assert_eq!(c.http_port, DEFAULT_HTTP_PORT);
        assert_eq!(c.proof_window, Duration::from_secs(10));
        assert_eq!(c.token_key, derive_token_key("X9::auth_token_secret"));
    }

    #[test]
    fn minutes_take_precedence_and_bounds_hold() {
        let c = cfg(&[("AUTH_MASTER_CODE", "X9"), ("AUTH_TOKEN_TTL_MINUTES", "30"), ("AUTH_TOKEN_TTL_HOURS", "2")]).unwrap();
        assert_eq!(c.token_ttl, Duration::from_secs(30 * 60));

        let c = cfg(&[("AUTH_MASTER_CODE", "X9"), ("AUTH_TOKEN_TTL_MINUTES", "99999"), ("AUTH_TOKEN_TTL_HOURS", "2")]).unwrap();
        assert_eq!(c.token_ttl, Duration::from_secs(2 * 3600));

        let c = cfg(&[("AUTH_MASTER_CODE", "X9"), ("AUTH_TOKEN_TTL_HOURS", "1000"), ("AUTH_REGISTRATION_GRANT_MINUTES", "0")]).unwrap();
        assert_eq!(c.token_ttl, Duration::from_secs(600));
        assert_eq!(c.registration_grant_ttl, Duration::from_secs(600));
    }

    #[test]
    fn explicit_secret_changes_key() {
        let a = cfg(&[("AUTH_MASTER_CODE", "X9")]).unwrap();
        let b = cfg(&[("AUTH_MASTER_CODE", "X9"), ("AUTH_TOKEN_SECRET", "other")]).unwrap();
        assert_ne!(a.token_key, b.token_key);
    }

    #[test]
    fn bad_port_is_rejected() {
        let err = cfg(&[("AUTH_MASTER_CODE", "X9"), ("SENTINEL_HTTP_PORT", "http")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "SENTINEL_HTTP_PORT", .. }));
    }
}
