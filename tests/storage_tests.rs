//! Tests for the local image store.
//!
//! Validates store layout, staging and atomic commit, discard, listing and
//! digest validation.

use spinrun::{Error, ImageStore};
use std::fs;
use tempfile::TempDir;

const DIGEST: &str = "sha256:4f1c8b0e0d1a6a3b7a0e6f0c2f5d9c6e8b7a6f5e4d3c2b1a09f8e7d6c5b4a3e9";

// =============================================================================
// ImageStore Creation Tests
// =============================================================================

#[test]
fn test_store_creates_images_dir() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("deeply").join("nested");

    let store = ImageStore::with_root(&root).unwrap();

    assert!(root.join("images").is_dir(), "images dir should be created");
    assert_eq!(store.root(), root);
    assert_eq!(store.images_dir(), root.join("images"));
}

#[test]
fn test_default_root_is_dot_spin() {
    let root = ImageStore::default_root();
    assert!(root.ends_with(".spin"));
}

// =============================================================================
// Commit Tests
// =============================================================================

#[test]
fn test_commit_moves_staging_into_place() {
    let temp_dir = TempDir::new().unwrap();
    let store = ImageStore::with_root(temp_dir.path()).unwrap();

    let staging = store.staging_path(DIGEST).unwrap();
    assert!(staging.starts_with(store.images_dir()), "staging stays on the same filesystem");
    assert!(!store.has(DIGEST));

    fs::write(&staging, b"artifact").unwrap();
    assert!(!store.has(DIGEST), "staging file is not an artifact");

    let path = store.commit(&staging, DIGEST).unwrap();
    assert!(store.has(DIGEST));
    assert!(!staging.exists());
    assert_eq!(path, store.artifact_path(DIGEST).unwrap());
    assert_eq!(fs::read(path).unwrap(), b"artifact");
}

#[test]
fn test_staging_paths_are_unique() {
    let temp_dir = TempDir::new().unwrap();
    let store = ImageStore::with_root(temp_dir.path()).unwrap();

    assert_ne!(
        store.staging_path(DIGEST).unwrap(),
        store.staging_path(DIGEST).unwrap()
    );
}

#[test]
fn test_discard_removes_staging() {
    let temp_dir = TempDir::new().unwrap();
    let store = ImageStore::with_root(temp_dir.path()).unwrap();

    let staging = store.staging_path(DIGEST).unwrap();
    fs::write(&staging, b"partial").unwrap();
    store.discard(&staging);

    assert!(!staging.exists());
    assert!(!store.has(DIGEST));
    // Discarding a missing file is silent.
    store.discard(&staging);
}

// =============================================================================
// Housekeeping Tests
// =============================================================================

#[test]
fn test_list_ignores_staging_files() {
    let temp_dir = TempDir::new().unwrap();
    let store = ImageStore::with_root(temp_dir.path()).unwrap();

    let staging = store.staging_path(DIGEST).unwrap();
    fs::write(&staging, b"x").unwrap();
    assert!(store.list().unwrap().is_empty());

    store.commit(&staging, DIGEST).unwrap();
    fs::write(store.staging_path(DIGEST).unwrap(), b"y").unwrap();
    assert_eq!(store.list().unwrap(), vec![DIGEST.to_string()]);
}

#[test]
fn test_remove_is_idempotent() {
    let temp_dir = TempDir::new().unwrap();
    let store = ImageStore::with_root(temp_dir.path()).unwrap();

    let staging = store.staging_path(DIGEST).unwrap();
    fs::write(&staging, b"x").unwrap();
    store.commit(&staging, DIGEST).unwrap();

    store.remove(DIGEST).unwrap();
    assert!(!store.has(DIGEST));
    store.remove(DIGEST).unwrap();
}

// =============================================================================
// Digest Validation Tests
// =============================================================================

#[test]
fn test_invalid_digests_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let store = ImageStore::with_root(temp_dir.path()).unwrap();

    for bad in ["sha256:../../etc/passwd", "sha512:abcd", "", "sha256:xyz"] {
        assert!(
            matches!(store.artifact_path(bad), Err(Error::InvalidDigest(_))),
            "{} should be rejected",
            bad
        );
        assert!(!store.has(bad));
    }
}
