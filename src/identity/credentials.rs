//! Credential records: username -> password hash.
//!
//! `FileCredentialStore` keeps one `username,hash` record per line and rewrites
//! the whole file through a temp file + rename on every mutation. Lookups are
//! case-insensitive on the username.

use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    pub username: String,
    pub password_hash: String,
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("username already exists")]
    UsernameTaken,
    #[error("credential store write failed: {0}")]
    Io(#[from] std::io::Error),
}

pub trait CredentialStore: Send + Sync {
    fn any_registered(&self) -> bool;
    fn exists(&self, username: &str) -> bool;
    fn get(&self, username: &str) -> Option<CredentialRecord>;
    fn insert(&self, username: &str, password_hash: &str) -> Result<(), CredentialError>;
    /// Returns false when the user is unknown or the hash is unchanged.
    fn update_hash(&self, username: &str, password_hash: &str) -> Result<bool, CredentialError>;
}

fn same_user(a: &str, b: &str) -> bool {
    a.to_lowercase() == b.to_lowercase()
}

pub fn parse_records(text: &str) -> Vec<CredentialRecord> {
    text.lines()
        .filter_map(|line| {
            let (u, h) = line.split_once(',')?;
            let (u, h) = (u.trim(), h.trim());
            if u.is_empty() || h.is_empty() { return None; }
            Some(CredentialRecord { username: u.to_string(), password_hash: h.to_string() })
        })
        .collect()
}

pub struct FileCredentialStore {
    path: PathBuf,
    users: RwLock<Vec<CredentialRecord>>,
    /// Serialises file rewrites; the record lock is never held during I/O.
    write_gate: Mutex<()>,
}

impl FileCredentialStore {
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let users = match std::fs::read_to_string(&path) {
            Ok(text) => {
                let recs = parse_records(&text);
                info!(target: "credentials", "loaded {} users from {}", recs.len(), path.display());
                recs
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                error!(target: "credentials", "failed to load user data from {}: {}", path.display(), e);
                Vec::new()
            }
        };
        Self { path, users: RwLock::new(users), write_gate: Mutex::new(()) }
    }

    pub fn path(&self) -> &Path { &self.path }

    fn persist(&self) -> Result<(), CredentialError> {
        let _gate = self.write_gate.lock();
        let body: String = {
            let users = self.users.read();
            users.iter().map(|u| format!("{},{}\n", u.username, u.password_hash)).collect()
        };
        if let Some(dir) = self.path.parent() { std::fs::create_dir_all(dir).ok(); }
        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);
        {
            let mut f = std::fs::File::create(&tmp)?;
            f.write_all(body.as_bytes())?;
            f.flush()?;
            let _ = f.sync_all();
        }
        std::fs::rename(&tmp, &self.path)?;
        info!(target: "credentials", "saved {} users to {}", body.lines().count(), self.path.display());
        Ok(())
    }
}

impl CredentialStore for FileCredentialStore {
    fn any_registered(&self) -> bool { !self.users.read().is_empty() }

    fn exists(&self, username: &str) -> bool {
        self.users.read().iter().any(|u| same_user(&u.username, username))
    }

    fn get(&self, username: &str) -> Option<CredentialRecord> {
        self.users.read().iter().find(|u| same_user(&u.username, username)).cloned()
    }

    fn insert(&self, username: &str, password_hash: &str) -> Result<(), CredentialError> {
        {
            let mut users = self.users.write();
            if users.iter().any(|u| same_user(&u.username, username)) {
                return Err(CredentialError::UsernameTaken);
            }
            users.push(CredentialRecord { username: username.to_string(), password_hash: password_hash.to_string() });
        }
        if let Err(e) = self.persist() {
            // roll back so memory never claims a user the file does not hold
            self.users.write().retain(|u| !(same_user(&u.username, username) && u.password_hash == password_hash));
            return Err(e);
        }
        Ok(())
    }

    fn update_hash(&self, username: &str, password_hash: &str) -> Result<bool, CredentialError> {
        if username.trim().is_empty() || password_hash.trim().is_empty() { return Ok(false); }
        {
            let mut users = self.users.write();
            let Some(user) = users.iter_mut().find(|u| same_user(&u.username, username)) else { return Ok(false); };
            if user.password_hash == password_hash { return Ok(false); }
            user.password_hash = password_hash.to_string();
        }
        self.persist()?;
        Ok(true)
    }
}

/// Non-persistent store for tests and ephemeral agents.
#[derive(Default)]
pub struct MemoryCredentialStore {
    users: RwLock<Vec<CredentialRecord>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self { Self::default() }

    pub fn with_records(records: Vec<CredentialRecord>) -> Self { Self { users: RwLock::new(records) } }
}

impl CredentialStore for MemoryCredentialStore {
    fn any_registered(&self) -> bool { !self.users.read().is_empty() }
    fn exists(&self, username: &str) -> bool { self.users.read().iter().any(|u| same_user(&u.username, username)) }
    fn get(&self, username: &str) -> Option<CredentialRecord> {
        self.users.read().iter().find(|u| same_user(&u.username, username)).cloned()
    }
    fn insert(&self, username: &str, password_hash: &str) -> Result<(), CredentialError> {
        let mut users = self.users.write();
        if users.iter().any(|u| same_user(&u.username, username)) { return Err(CredentialError::UsernameTaken); }
        users.push(CredentialRecord { username: username.to_string(), password_hash: password_hash.to_string() });
        Ok(())
    }
    fn update_hash(&self, username: &str, password_hash: &str) -> Result<bool, CredentialError> {
        let mut users = self.users.write();
        let Some(user) = users.iter_mut().find(|u| same_user(&u.username, username)) else { return Ok(false); };
        if user.password_hash == password_hash { return Ok(false); }
        user.password_hash = password_hash.to_string();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_skips_junk_lines() {
        let recs = parse_records("alice,$argon2id$x\n\nbroken-line\n bob , pw,with,commas \n,nohash\n");
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[1].username, "bob");
        assert_eq!(recs[1].password_hash, "pw,with,commas");
    }

    #[test]
    fn file_store_persists_and_reloads() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("users.txt");
        let store = FileCredentialStore::open(&path);
        assert!(!store.any_registered());
        store.insert("Alice_01", "h1").unwrap();
        assert!(matches!(store.insert("alice_01", "h2"), Err(CredentialError::UsernameTaken)));
        assert!(store.update_hash("ALICE_01", "h3").unwrap());
        assert!(!store.update_hash("ALICE_01", "h3").unwrap());
        assert!(!store.update_hash("ghost", "h3").unwrap());
        assert!(!path.with_extension("txt.tmp").exists());

        let reopened = FileCredentialStore::open(&path);
        let rec = reopened.get("alice_01").unwrap();
        assert_eq!(rec.username, "Alice_01");
        assert_eq!(rec.password_hash, "h3");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "Alice_01,h3\n");
    }
}
