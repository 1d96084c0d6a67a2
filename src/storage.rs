//! # Local Image Store
//!
//! Holds packaged sandbox images keyed by manifest digest.
//!
//! ## Storage Model
//!
//! ```text
//! ~/.spin/
//! └── images/
//!     ├── 4f1c...e9   (packaged artifact, a zip)
//!     └── a07b...13
//! ```
//!
//! The file name is the hex part of the `sha256:` digest. Presence of a
//! regular file at [`ImageStore::artifact_path`] is equivalent to "this
//! digest is available locally".
//!
//! ## Atomic Commits
//!
//! Artifacts are never written in place. The conversion pipeline writes to a
//! staging path returned by [`ImageStore::staging_path`] and the store
//! renames it into place with [`ImageStore::commit`]. A failed conversion
//! leaves nothing at the canonical path; [`ImageStore::discard`] removes the
//! staging file.
//!
//! ## Digest Validation
//!
//! Digests must be `sha256:<64 hex>` or bare 64-character hex. Anything else
//! is rejected before a path is built, so a digest can never name a file
//! outside the images directory.

use crate::constants::{DEFAULT_ROOT_DIR, IMAGES_DIR, PARTIAL_SUFFIX};
use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Directory of packaged images.
#[derive(Debug, Clone)]
pub struct ImageStore {
    root: PathBuf,
    images: PathBuf,
}

impl ImageStore {
    /// Opens (creating if needed) a store rooted at `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let images = root.join(IMAGES_DIR);
        fs::create_dir_all(&images).map_err(|e| Error::StorageInitFailed {
            path: images.clone(),
            reason: e.to_string(),
        })?;

        info!("Image store initialized at: {}", root.display());

        Ok(Self { root, images })
    }

    /// Returns the default store root (`~/.spin`, or `./.spin` without a home).
    pub fn default_root() -> PathBuf {
        if let Some(home) = dirs::home_dir() {
            home.join(DEFAULT_ROOT_DIR)
        } else {
            PathBuf::from(DEFAULT_ROOT_DIR)
        }
    }

    /// Returns the store root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the images directory.
    pub fn images_dir(&self) -> &Path {
        &self.images
    }

    /// Returns the canonical artifact path for `digest`.
    pub fn artifact_path(&self, digest: &str) -> Result<PathBuf> {
        Ok(self.images.join(digest_hex(digest)?))
    }

    /// Returns true if a packaged artifact exists for `digest`.
    pub fn has(&self, digest: &str) -> bool {
        match self.artifact_path(digest) {
            Ok(path) => path.is_file(),
            Err(_) => false,
        }
    }

    /// Returns a fresh staging path for a conversion targeting `digest`.
    ///
    /// The staging file lives in the images directory so the final rename
    /// never crosses filesystems.
    pub fn staging_path(&self, digest: &str) -> Result<PathBuf> {
        let hex = digest_hex(digest)?;
        Ok(self.images.join(format!(
            "{}.{}{}",
            hex,
            uuid::Uuid::now_v7(),
            PARTIAL_SUFFIX
        )))
    }

    /// Moves a completed staging file to the canonical path of `digest`.
    pub fn commit(&self, staging: &Path, digest: &str) -> Result<PathBuf> {
        let target = self.artifact_path(digest)?;
        fs::rename(staging, &target).map_err(|e| {
            Error::StorageWriteFailed(format!(
                "commit {} -> {}: {}",
                staging.display(),
                target.display(),
                e
            ))
        })?;
        debug!("Committed artifact {}", target.display());
        Ok(target)
    }

    /// Removes a staging file left by a failed conversion.
    pub fn discard(&self, staging: &Path) {
        if staging.exists()
            && let Err(e) = fs::remove_file(staging)
        {
            warn!("Failed to remove staging file {}: {}", staging.display(), e);
        }
    }

    /// Lists the digests of all committed artifacts.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut digests = Vec::new();
        for entry in fs::read_dir(&self.images)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if is_hex_digest(name) {
                digests.push(format!("sha256:{}", name));
            }
        }
        digests.sort();
        Ok(digests)
    }

    /// Removes the artifact for `digest`, if present.
    pub fn remove(&self, digest: &str) -> Result<()> {
        let path = self.artifact_path(digest)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                info!("Removed image {}", digest);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Returns the hex part of a sha256 digest, validating its shape.
pub fn digest_hex(digest: &str) -> Result<&str> {
    let hex = match digest.split_once(':') {
        Some(("sha256", hex)) => hex,
        Some(_) => return Err(Error::InvalidDigest(digest.to_string())),
        None => digest,
    };
    if is_hex_digest(hex) {
        Ok(hex)
    } else {
        Err(Error::InvalidDigest(digest.to_string()))
    }
}

fn is_hex_digest(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}
