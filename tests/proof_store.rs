//! Proof clip persistence: atomic saves, listing order, reload and corruption.

use std::fs;

use tempfile::tempdir;

use sentinel::media::{ProofStore, ProofStoreError};

fn frames(n: usize) -> Vec<Vec<u8>> {
    (0..n).map(|i| vec![0xFF, 0xD8, i as u8, 0xFF, 0xD9]).collect()
}

#[test]
fn save_list_and_load() {
    let dir = tempdir().unwrap();
    let store = ProofStore::open(dir.path()).unwrap();
    assert!(store.list().is_empty());

    let first = store.save(&frames(3), 0.3).unwrap();
    let second = store.save(&frames(5), 0.5).unwrap();
    assert_ne!(first.id, second.id);
    assert_eq!(second.frame_count, 5);

    let ids: Vec<String> = store.list().into_iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![second.id.clone(), first.id.clone()]);
    assert_eq!(store.load_frames(&first.id), frames(3));
}

#[test]
fn index_is_rebuilt_on_open() {
    let dir = tempdir().unwrap();
    let saved = {
        let store = ProofStore::open(dir.path()).unwrap();
        store.save(&frames(2), 0.2).unwrap()
    };
    let reopened = ProofStore::open(dir.path()).unwrap();
    assert_eq!(reopened.list(), vec![saved.clone()]);
    assert_eq!(reopened.load_frames(&saved.id).len(), 2);
}

#[test]
fn empty_clips_are_rejected() {
    let dir = tempdir().unwrap();
    let store = ProofStore::open(dir.path()).unwrap();
    assert!(matches!(store.save(&[], 0.0), Err(ProofStoreError::Empty)));
    assert!(store.list().is_empty());
}

#[test]
fn unknown_unsafe_or_corrupt_ids_load_nothing() {
    let dir = tempdir().unwrap();
    let store = ProofStore::open(dir.path()).unwrap();
    let meta = store.save(&frames(4), 0.4).unwrap();

    assert!(store.load_frames("20000101-000000-00000000").is_empty());
    assert!(store.load_frames("../outside").is_empty());
    assert!(store.load_frames("").is_empty());

    let archive = dir.path().join(&meta.id).join("frames.bin");
    let mut bytes = fs::read(&archive).unwrap();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0xFF;
    fs::write(&archive, bytes).unwrap();
    assert!(store.load_frames(&meta.id).is_empty());
}

#[test]
fn staging_leftovers_are_removed_on_open() {
    let dir = tempdir().unwrap();
    let staging = dir.path().join(".staging-20240101-000000-0badcafe");
    fs::create_dir_all(&staging).unwrap();
    fs::write(staging.join("frames.bin"), b"partial").unwrap();

    let store = ProofStore::open(dir.path()).unwrap();
    assert!(!staging.exists());
    assert!(store.list().is_empty());
}
