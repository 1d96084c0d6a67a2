//! Filesystem view of a container.
//!
//! WASI exposes host directories to a sandbox as preopened directories, so
//! every mount source is reduced to a directory here:
//!
//! | Source          | Exposed as                                   |
//! |-----------------|----------------------------------------------|
//! | Directory       | the directory itself                         |
//! | Zip archive     | extracted into a private scratch directory   |
//! | Tar archive     | extracted into a private scratch directory   |
//! | Anything else   | [`Error::UnsupportedMount`]                  |
//!
//! Scratch directories are registered on the container's release stack as
//! soon as they are created, before extraction starts.
//!
//! Image bundles carry the whole root filesystem, so a runtime extracts each
//! bundle once into a [`BundleCache`] directory shared by every container
//! booting it. Extracted files are read-only. The directory is removed when
//! the last container using it is released.

use crate::archive::{SourceKind, sniff};
use crate::constants::{BUNDLE_CACHE_PREFIX, BUNDLE_MOUNT_POINT};
use crate::error::{Error, Result};
use crate::runtime::release::ReleaseStack;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::UNIX_EPOCH;
use tracing::{debug, info, warn};

/// A mount resolved to a host directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedMount {
    pub guest: String,
    pub host: PathBuf,
}

/// Resolves every mount (and the optional image bundle) to a directory.
pub(crate) fn stage(
    mounts: &BTreeMap<String, PathBuf>,
    bundle: Option<&Path>,
    bundles: &Arc<BundleCache>,
    scratch_root: &Path,
    container: &str,
    release: &mut ReleaseStack,
) -> Result<Vec<StagedMount>> {
    let mut staged = Vec::with_capacity(mounts.len() + 1);

    for (guest, host) in mounts {
        let kind = sniff(host).map_err(|e| match e {
            Error::Io(io) => Error::InvalidOption(format!(
                "looking up mount source {} failed: {}",
                host.display(),
                io
            )),
            other => other,
        })?;

        let dir = match kind {
            SourceKind::Directory => host.clone(),
            SourceKind::Zip | SourceKind::Tar => {
                let dir = scratch_dir(scratch_root, container, release)?;
                extract(kind, host, &dir)?;
                dir
            }
        };

        debug!("Mount {} -> {} ({:?})", guest, dir.display(), kind);
        staged.push(StagedMount {
            guest: guest.clone(),
            host: dir,
        });
    }

    if let Some(bundle) = bundle {
        if sniff(bundle)? != SourceKind::Zip {
            return Err(Error::format(bundle, "image bundle is not a zip archive"));
        }
        let dir = bundles.acquire(bundle, scratch_root, release)?;
        staged.push(StagedMount {
            guest: BUNDLE_MOUNT_POINT.to_string(),
            host: dir,
        });
    }

    Ok(staged)
}

/// Reference-counted bundle extractions of one runtime.
#[derive(Debug)]
pub(crate) struct BundleCache {
    id: uuid::Uuid,
    users: Mutex<HashMap<PathBuf, usize>>,
}

impl BundleCache {
    pub(crate) fn new() -> Self {
        Self {
            id: uuid::Uuid::now_v7(),
            users: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the extracted directory for `bundle`, extracting it if no
    /// live container holds it. The reference is dropped by `release`.
    fn acquire(
        self: &Arc<Self>,
        bundle: &Path,
        scratch_root: &Path,
        release: &mut ReleaseStack,
    ) -> Result<PathBuf> {
        let dir = scratch_root.join(format!(
            "{}{}-{}",
            BUNDLE_CACHE_PREFIX,
            bundle_key(bundle)?,
            self.id.simple()
        ));

        // Held across extraction so concurrent creates extract once.
        let mut users = self.lock()?;
        if users.contains_key(&dir) {
            debug!("Reusing extracted bundle {}", dir.display());
        } else {
            info!("Extracting bundle {}", bundle.display());
            fs::create_dir_all(scratch_root)?;
            fs::create_dir(&dir)?;
            if let Err(e) = extract(SourceKind::Zip, bundle, &dir).and_then(|()| seal(&dir)) {
                let _ = fs::remove_dir_all(&dir);
                return Err(e);
            }
        }
        *users.entry(dir.clone()).or_insert(0) += 1;
        drop(users);

        let cache = Arc::clone(self);
        let owned = dir.clone();
        release.push(format!("bundle {}", dir.display()), move || {
            cache.release(&owned)
        });
        Ok(dir)
    }

    fn release(&self, dir: &Path) {
        let Ok(mut users) = self.lock() else {
            return;
        };
        let Some(count) = users.get_mut(dir) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            users.remove(dir);
            if let Err(e) = fs::remove_dir_all(dir) {
                warn!("Failed to remove bundle directory {}: {}", dir.display(), e);
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.users.lock().map(|u| u.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<PathBuf, usize>>> {
        self.users
            .lock()
            .map_err(|_| Error::Internal("bundle cache lock poisoned".to_string()))
    }
}

/// Identifies a bundle file by location, size and modification time.
fn bundle_key(bundle: &Path) -> Result<String> {
    let path = fs::canonicalize(bundle)?;
    let meta = fs::metadata(&path)?;
    let modified = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or(0);

    let mut hasher = Sha256::new();
    hasher.update(path.as_os_str().as_encoded_bytes());
    hasher.update(meta.len().to_le_bytes());
    hasher.update(modified.to_le_bytes());
    Ok(hex::encode(&hasher.finalize()[..8]))
}

/// Marks every extracted file read-only.
fn seal(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let kind = entry.file_type()?;
        if kind.is_dir() {
            seal(&entry.path())?;
        } else if kind.is_file() {
            let mut perms = entry.metadata()?.permissions();
            perms.set_readonly(true);
            fs::set_permissions(entry.path(), perms)?;
        }
    }
    Ok(())
}

fn scratch_dir(root: &Path, container: &str, release: &mut ReleaseStack) -> Result<PathBuf> {
    let dir = root.join(format!("spin-{}-{}", container, uuid::Uuid::now_v7()));
    fs::create_dir_all(&dir)?;

    let owned = dir.clone();
    release.push(format!("scratch {}", dir.display()), move || {
        if let Err(e) = fs::remove_dir_all(&owned) {
            warn!("Failed to remove scratch directory {}: {}", owned.display(), e);
        }
    });

    Ok(dir)
}

fn extract(kind: SourceKind, source: &Path, dir: &Path) -> Result<()> {
    let file = File::open(source)?;
    match kind {
        SourceKind::Zip => {
            let mut archive = zip::ZipArchive::new(file)
                .map_err(|e| Error::format(source, format!("opening zip failed: {}", e)))?;
            archive
                .extract(dir)
                .map_err(|e| Error::format(source, format!("extracting zip failed: {}", e)))
        }
        SourceKind::Tar => tar::Archive::new(file)
            .unpack(dir)
            .map_err(|e| Error::format(source, format!("extracting tar failed: {}", e))),
        SourceKind::Directory => Ok(()),
    }
}
