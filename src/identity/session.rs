//! Per-connection authentication state.
//!
//! Flow: master code -> setup grant -> registration -> login (or token) -> session.
//! Sessions and grants live in concurrent maps keyed by connection id, so
//! unrelated connections never contend on a shared lock. Credential-store
//! I/O and password hashing run on the blocking pool with no map entry held.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::connection::ConnectionId;
use crate::security;
use crate::tprintln;

use super::credentials::{CredentialError, CredentialStore};
use super::token::TokenCodec;
use super::validate::{is_valid_password, is_valid_username};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegisterResult {
    Success,
    NotAllowed,
    GrantExpired,
    UsernameTaken,
    InvalidUsername,
    InvalidPassword,
    Failed,
}

/// Auth state code reported to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthState {
    LoginRequired,
    RegistrationRequired,
    Authenticated,
}

impl AuthState {
    pub fn code(&self) -> &'static str {
        match self {
            AuthState::LoginRequired => "LOGIN_REQUIRED",
            AuthState::RegistrationRequired => "REGISTRATION_REQUIRED",
            AuthState::Authenticated => "AUTHENTICATED",
        }
    }
}

#[derive(Debug, Clone)]
struct AuthSession {
    username: String,
    exp: i64,
}

#[derive(Debug, Clone, Copy)]
struct SetupGrant {
    granted_at: i64,
    /// Set while a registration attempt is using the grant.
    claimed: bool,
}

pub struct AuthSessionManager {
    store: Arc<dyn CredentialStore>,
    clock: Arc<dyn Clock>,
    codec: TokenCodec,
    master_code: String,
    token_ttl_secs: i64,
    grant_ttl_secs: i64,
    sessions: DashMap<ConnectionId, AuthSession>,
    grants: DashMap<ConnectionId, SetupGrant>,
}

impl AuthSessionManager {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        clock: Arc<dyn Clock>,
        master_code: impl Into<String>,
        token_key: [u8; 32],
        token_ttl: Duration,
        grant_ttl: Duration,
    ) -> Self {
        let token_ttl_secs = token_ttl.as_secs() as i64;
        Self {
            store,
            clock,
            codec: TokenCodec::new(token_key, token_ttl_secs),
            master_code: master_code.into(),
            token_ttl_secs,
            grant_ttl_secs: grant_ttl.as_secs() as i64,
            sessions: DashMap::new(),
            grants: DashMap::new(),
        }
    }

    pub fn from_config(cfg: &crate::config::AgentConfig, store: Arc<dyn CredentialStore>, clock: Arc<dyn Clock>) -> Self {
        Self::new(store, clock, cfg.master_code.clone(), cfg.token_key, cfg.token_ttl, cfg.registration_grant_ttl)
    }

    fn grant_expired(&self, grant: &SetupGrant, now: i64) -> bool {
        now > grant.granted_at + self.grant_ttl_secs
    }

    /// Compare against the master code; on match create or refresh the connection's grant.
    pub fn validate_setup_code(&self, conn: &ConnectionId, code: &str) -> bool {
        if !security::constant_time_eq(code.as_bytes(), self.master_code.as_bytes()) {
            warn!(target: "auth", conn = %conn, "invalid master code submitted");
            return false;
        }
        let now = self.clock.now_unix();
        self.grants.insert(conn.clone(), SetupGrant { granted_at: now, claimed: false });
        info!(target: "auth", conn = %conn, "setup grant issued");
        true
    }

    pub fn is_registration_allowed(&self, conn: &ConnectionId) -> bool {
        let now = self.clock.now_unix();
        if self.grants.remove_if(conn, |_, g| self.grant_expired(g, now)).is_some() {
            debug!(target: "auth", conn = %conn, "setup grant expired");
            return false;
        }
        self.grants.contains_key(conn)
    }

    /// Claim the connection's grant for one registration attempt.
    fn claim_grant(&self, conn: &ConnectionId) -> Result<(), RegisterResult> {
        let now = self.clock.now_unix();
        if self.grants.remove_if(conn, |_, g| self.grant_expired(g, now)).is_some() {
            return Err(RegisterResult::GrantExpired);
        }
        let Some(mut grant) = self.grants.get_mut(conn) else { return Err(RegisterResult::NotAllowed); };
        if grant.claimed { return Err(RegisterResult::NotAllowed); }
        grant.claimed = true;
        Ok(())
    }

    fn release_grant(&self, conn: &ConnectionId) {
        if let Some(mut g) = self.grants.get_mut(conn) { g.claimed = false; }
    }

    pub async fn try_register(&self, conn: &ConnectionId, username: &str, password: &str) -> RegisterResult {
        if let Err(r) = self.claim_grant(conn) { return r; }
        let result = self.register_claimed(username, password).await;
        if result == RegisterResult::Success {
            // single use: the grant is consumed only by a successful registration
            self.grants.remove(conn);
            info!(target: "auth", conn = %conn, user = %username.trim(), "account registered");
        } else {
            self.release_grant(conn);
            debug!(target: "auth", conn = %conn, ?result, "registration rejected");
        }
        result
    }

    async fn register_claimed(&self, username: &str, password: &str) -> RegisterResult {
        if !is_valid_username(username) { return RegisterResult::InvalidUsername; }
        if !is_valid_password(password) { return RegisterResult::InvalidPassword; }
        let username = username.trim().to_string();
        if self.store.exists(&username) { return RegisterResult::UsernameTaken; }

        let store = self.store.clone();
        let password = password.to_string();
        let outcome = tokio::task::spawn_blocking(move || -> Result<(), CredentialError> {
            let hash = security::hash_password(&password).map_err(|e| CredentialError::Io(std::io::Error::other(e.to_string())))?;
            store.insert(&username, &hash)
        })
        .await;
        match outcome {
            Ok(Ok(())) => RegisterResult::Success,
            Ok(Err(CredentialError::UsernameTaken)) => RegisterResult::UsernameTaken,
            Ok(Err(e)) => {
                warn!(target: "auth", "registration failed: {}", e);
                RegisterResult::Failed
            }
            Err(e) => {
                warn!(target: "auth", "registration task failed: {}", e);
                RegisterResult::Failed
            }
        }
    }

    /// Password login. Legacy hash formats are re-hashed and persisted on success.
    /// The session carries the username as registered, whatever case was typed.
    pub async fn authenticate(&self, conn: &ConnectionId, username: &str, password: &str) -> bool {
        if !self.store.any_registered() { return false; }
        let Some(record) = self.store.get(username) else { return false; };

        let canonical = record.username.clone();
        let store = self.store.clone();
        let password = password.to_string();
        let verified = tokio::task::spawn_blocking(move || {
            let v = security::verify_password(&record.password_hash, &password);
            if v.ok {
                if let Some(upgraded) = v.upgraded.as_deref() {
                    match store.update_hash(&record.username, upgraded) {
                        Ok(true) => info!(target: "auth", user = %record.username, "password hash upgraded"),
                        Ok(false) => {}
                        Err(e) => warn!(target: "auth", user = %record.username, "hash upgrade not persisted: {}", e),
                    }
                }
            }
            v.ok
        })
        .await
        .unwrap_or(false);

        if !verified {
            warn!(target: "auth", conn = %conn, "login rejected");
            return false;
        }
        let exp = self.clock.now_unix() + self.token_ttl_secs;
        info!(target: "auth", conn = %conn, user = %canonical, "login succeeded");
        self.sessions.insert(conn.clone(), AuthSession { username: canonical, exp });
        true
    }

    /// Silent re-authentication of a reconnecting client carrying an issued token.
    pub fn authenticate_with_token(&self, conn: &ConnectionId, token: &str) -> bool {
        if token.trim().is_empty() { return false; }
        let claims = match self.codec.validate(token, self.clock.now_unix()) {
            Ok(c) => c,
            Err(e) => {
                debug!(target: "auth", conn = %conn, "token rejected: {}", e);
                return false;
            }
        };
        if !self.store.exists(&claims.username) { return false; }
        tprintln!("auth.token conn={} user={}", conn, claims.username);
        self.sessions.insert(conn.clone(), AuthSession { username: claims.username, exp: claims.exp });
        true
    }

    pub fn issue_token(&self, username: &str) -> String {
        if username.trim().is_empty() { return String::new(); }
        self.codec.issue(username, self.clock.now_unix())
    }

    pub fn is_authenticated(&self, conn: &ConnectionId) -> bool {
        let now = self.clock.now_unix();
        if self.sessions.remove_if(conn, |_, s| now > s.exp).is_some() {
            debug!(target: "auth", conn = %conn, "session expired");
            return false;
        }
        self.sessions.contains_key(conn)
    }

    pub fn username(&self, conn: &ConnectionId) -> Option<String> {
        if !self.is_authenticated(conn) { return None; }
        self.sessions.get(conn).map(|s| s.username.clone())
    }

    pub fn state(&self, conn: &ConnectionId) -> AuthState {
        if self.is_authenticated(conn) {
            AuthState::Authenticated
        } else if self.is_registration_allowed(conn) {
            AuthState::RegistrationRequired
        } else {
            AuthState::LoginRequired
        }
    }

    /// Drop both the session and any pending setup grant. Idempotent.
    pub fn logout(&self, conn: &ConnectionId) {
        let had_session = self.sessions.remove(conn).is_some();
        self.grants.remove(conn);
        if had_session { info!(target: "auth", conn = %conn, "session cleared"); }
    }

    pub fn session_count(&self) -> usize { self.sessions.len() }
}
