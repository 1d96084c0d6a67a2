//! Sandbox binary provider.
//!
//! The runtime binaries for each guest architecture and the squashfs
//! compression tool are external artifacts. [`AssetProvider`] is the seam
//! through which the runtime and the conversion pipeline load them;
//! [`BundledAssets`] serves them from a zip bundle via [`ArchiveReader`].

use crate::archive::ArchiveReader;
use crate::constants::{ASSET_RUNTIME_AMD64, ASSET_RUNTIME_RISCV64, ASSET_SQUASHFS_TOOL};
use crate::error::{Error, Result};
use crate::platform::Arch;
use std::path::Path;
use std::sync::Arc;

/// Source of the sandbox binaries.
pub trait AssetProvider: Send + Sync {
    /// Returns the general-purpose runtime module for `arch`.
    fn runtime(&self, arch: Arch) -> Result<Arc<[u8]>>;

    /// Returns the squashfs compression tool module.
    fn squashfs_tool(&self) -> Result<Arc<[u8]>>;
}

/// Assets served from a zip bundle.
///
/// Entries are named [`ASSET_RUNTIME_AMD64`], [`ASSET_RUNTIME_RISCV64`] and
/// [`ASSET_SQUASHFS_TOOL`]. A bundle may omit any of them; requesting a
/// missing one returns [`Error::AssetUnavailable`].
pub struct BundledAssets {
    reader: ArchiveReader,
}

impl BundledAssets {
    /// Wraps an in-memory zip bundle.
    pub fn from_bytes(bundle: Vec<u8>) -> Result<Self> {
        Ok(Self {
            reader: ArchiveReader::new(bundle)?,
        })
    }

    /// Loads a zip bundle from disk.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            reader: ArchiveReader::open(path)?,
        })
    }

    fn load(&self, name: &str) -> Result<Arc<[u8]>> {
        self.reader.entry(name).map_err(|e| match e {
            Error::ArchiveEntryNotFound { .. } => Error::AssetUnavailable(name.to_string()),
            other => other,
        })
    }
}

impl AssetProvider for BundledAssets {
    fn runtime(&self, arch: Arch) -> Result<Arc<[u8]>> {
        match arch {
            Arch::Amd64 => self.load(ASSET_RUNTIME_AMD64),
            Arch::Riscv64 => self.load(ASSET_RUNTIME_RISCV64),
        }
    }

    fn squashfs_tool(&self) -> Result<Arc<[u8]>> {
        self.load(ASSET_SQUASHFS_TOOL)
    }
}
