//! Centralized locations under the agent's data directory.

use std::path::{Path, PathBuf};

#[inline]
pub fn users_file(data_dir: &Path) -> PathBuf { data_dir.join("users.txt") }

#[inline]
pub fn proofs_dir(data_dir: &Path) -> PathBuf { data_dir.join("proofs") }

/// Where the operator CLI keeps the last issued token.
#[inline]
pub fn cli_token_file() -> PathBuf {
    let home = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE")).unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".sentinel_token")
}
