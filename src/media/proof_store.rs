//! Saved proof clips.
//!
//! Layout under the proofs root:
//!   <id>/frames.bin   MAGIC | bincode(Vec<Vec<u8>>) | crc32(MAGIC|payload), little-endian
//!   <id>/meta.json    ProofMeta
//! A clip is written into `.staging-<id>/` and renamed into place, so a visible
//! `<id>/` directory always holds both files.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use crc32fast::Hasher as Crc32;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

const MAGIC_FRAMES: u32 = 0x3146_5250; // 'PRF1'
const STAGING_PREFIX: &str = ".staging-";
const FRAMES_FILE: &str = "frames.bin";
const META_FILE: &str = "meta.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofMeta {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub frame_count: usize,
}

#[derive(Debug, Error)]
pub enum ProofStoreError {
    #[error("no frames to save")]
    Empty,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("frame archive encode: {0}")]
    Encode(String),
    #[error("proof archive corrupt: {0}")]
    Corrupt(String),
}

pub struct ProofStore {
    root: PathBuf,
    /// Most-recent-first.
    index: RwLock<Vec<ProofMeta>>,
}

fn sort_recent_first(metas: &mut [ProofMeta]) {
    metas.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
}

/// Ids are path components; anything else is treated as unknown.
fn is_safe_id(id: &str) -> bool {
    !id.is_empty() && !id.starts_with('.') && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn new_id(now: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", now.format("%Y%m%d-%H%M%S"), &suffix[..8])
}

fn encode_frames(frames: &[Vec<u8>]) -> Result<Vec<u8>, ProofStoreError> {
    let payload = bincode::serialize(frames).map_err(|e| ProofStoreError::Encode(e.to_string()))?;
    let mut out = Vec::with_capacity(payload.len() + 8);
    out.extend_from_slice(&MAGIC_FRAMES.to_le_bytes());
    out.extend_from_slice(&payload);
    let mut h = Crc32::new();
    h.update(&out);
    out.extend_from_slice(&h.finalize().to_le_bytes());
    Ok(out)
}

fn decode_frames(bytes: &[u8]) -> Result<Vec<Vec<u8>>, ProofStoreError> {
    if bytes.len() < 8 { return Err(ProofStoreError::Corrupt("archive too short".into())); }
    let (body, trailer) = bytes.split_at(bytes.len() - 4);
    let mut h = Crc32::new();
    h.update(body);
    let expected = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    if h.finalize() != expected { return Err(ProofStoreError::Corrupt("crc mismatch".into())); }
    let magic = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
    if magic != MAGIC_FRAMES { return Err(ProofStoreError::Corrupt("bad magic".into())); }
    bincode::deserialize(&body[4..]).map_err(|e| ProofStoreError::Corrupt(e.to_string()))
}

impl ProofStore {
    /// Open (creating if needed) the store rooted at `root`, dropping leftover staging
    /// directories and rebuilding the index from the clips on disk.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, ProofStoreError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        let mut metas = Vec::new();
        for entry in std::fs::read_dir(&root)?.flatten() {
            let path = entry.path();
            if !path.is_dir() { continue; }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(STAGING_PREFIX) {
                match std::fs::remove_dir_all(&path) {
                    Ok(()) => info!(target: "proofs", "removed unfinished clip {}", name),
                    Err(e) => warn!(target: "proofs", "cannot remove {}: {}", path.display(), e),
                }
                continue;
            }
            if !path.join(FRAMES_FILE).is_file() { continue; }
            let meta = std::fs::read(path.join(META_FILE)).ok().and_then(|b| serde_json::from_slice::<ProofMeta>(&b).ok());
            match meta {
                Some(m) if m.id == name => metas.push(m),
                _ => debug!(target: "proofs", "skipping unreadable clip {}", name),
            }
        }
        sort_recent_first(&mut metas);
        info!(target: "proofs", "indexed {} proof clips under {}", metas.len(), root.display());
        Ok(Self { root, index: RwLock::new(metas) })
    }

    pub fn root(&self) -> &Path { &self.root }

    pub fn list(&self) -> Vec<ProofMeta> { self.index.read().clone() }

    pub fn save(&self, frames: &[Vec<u8>], duration_seconds: f64) -> Result<ProofMeta, ProofStoreError> {
        if frames.is_empty() { return Err(ProofStoreError::Empty); }
        let created_at = Utc::now();
        let meta = ProofMeta { id: new_id(created_at), created_at, duration_seconds, frame_count: frames.len() };

        let staging = self.root.join(format!("{}{}", STAGING_PREFIX, meta.id));
        let result = (|| -> Result<(), ProofStoreError> {
            std::fs::create_dir_all(&staging)?;
            std::fs::write(staging.join(FRAMES_FILE), encode_frames(frames)?)?;
            let meta_json = serde_json::to_vec_pretty(&meta).map_err(|e| ProofStoreError::Encode(e.to_string()))?;
            std::fs::write(staging.join(META_FILE), meta_json)?;
            std::fs::rename(&staging, self.root.join(&meta.id))?;
            Ok(())
        })();
        if let Err(e) = result {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(e);
        }

        let mut idx = self.index.write();
        idx.push(meta.clone());
        sort_recent_first(&mut idx);
        info!(target: "proofs", id = %meta.id, frames = meta.frame_count, "proof clip saved");
        Ok(meta)
    }

    /// Frames of clip `id`; empty when unknown or unreadable.
    pub fn load_frames(&self, id: &str) -> Vec<Vec<u8>> {
        let id = id.trim();
        if !is_safe_id(id) || !self.index.read().iter().any(|m| m.id == id) { return Vec::new(); }
        let path = self.root.join(id).join(FRAMES_FILE);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) => {
                warn!(target: "proofs", "cannot read {}: {}", path.display(), e);
                return Vec::new();
            }
        };
        match decode_frames(&bytes) {
            Ok(frames) => frames,
            Err(e) => {
                warn!(target: "proofs", id, "{}", e);
                Vec::new()
            }
        }
    }
}
