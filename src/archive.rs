//! # Archive Reader
//!
//! In-memory zip reader that extracts named entries on demand and caches the
//! extracted bytes, plus content sniffing for mount sources.
//!
//! ## Caching
//!
//! Each entry is decompressed at most once per reader. Repeated lookups
//! return the same shared buffer:
//!
//! ```rust,ignore
//! let reader = ArchiveReader::new(bundle_bytes)?;
//! let tool = reader.entry("squashfs-tools.wasm")?;
//! let again = reader.entry("squashfs-tools.wasm")?; // no decompression
//! assert!(Arc::ptr_eq(&tool, &again));
//! ```
//!
//! ## Sniffing
//!
//! [`sniff`] classifies a path by content, never by extension: directories,
//! zip archives (local file header or empty-archive end record) and tar
//! archives (`ustar` magic at offset 257).

use crate::constants::MAX_ARCHIVE_ENTRY_SIZE;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;
use zip::ZipArchive;

/// Zip archive held in memory with a per-entry extraction cache.
pub struct ArchiveReader {
    archive: Mutex<ZipArchive<Cursor<Vec<u8>>>>,
    cache: Mutex<HashMap<String, Arc<[u8]>>>,
}

impl ArchiveReader {
    /// Opens a zip archive from its bytes.
    pub fn new(data: Vec<u8>) -> Result<Self> {
        let archive = ZipArchive::new(Cursor::new(data))
            .map_err(|e| Error::format("<memory>", format!("not a zip archive: {}", e)))?;
        Ok(Self {
            archive: Mutex::new(archive),
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Opens a zip archive from a file, reading it fully into memory.
    pub fn open(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        Self::new(data).map_err(|e| match e {
            Error::InvalidFormat { reason, .. } => Error::format(path, reason),
            other => other,
        })
    }

    /// Returns the entry names in archive order.
    pub fn names(&self) -> Result<Vec<String>> {
        let archive = self.archive.lock().map_err(|_| poisoned())?;
        Ok(archive.file_names().map(str::to_string).collect())
    }

    /// Returns true if the archive has an entry named `name`.
    pub fn contains(&self, name: &str) -> Result<bool> {
        let archive = self.archive.lock().map_err(|_| poisoned())?;
        Ok(archive.file_names().any(|n| n == name))
    }

    /// Extracts an entry, decompressing it on first access.
    pub fn entry(&self, name: &str) -> Result<Arc<[u8]>> {
        if let Some(data) = self.cache.lock().map_err(|_| poisoned())?.get(name) {
            return Ok(Arc::clone(data));
        }

        let data: Arc<[u8]> = {
            let mut archive = self.archive.lock().map_err(|_| poisoned())?;
            let mut file = archive.by_name(name).map_err(|e| match e {
                zip::result::ZipError::FileNotFound => Error::ArchiveEntryNotFound {
                    entry: name.to_string(),
                },
                other => Error::from(other),
            })?;

            if file.size() > MAX_ARCHIVE_ENTRY_SIZE {
                return Err(Error::format(
                    name,
                    format!("entry exceeds {} bytes", MAX_ARCHIVE_ENTRY_SIZE),
                ));
            }

            let mut buf = Vec::with_capacity(file.size() as usize);
            file.read_to_end(&mut buf)?;
            buf.into()
        };

        debug!("Extracted archive entry {} ({} bytes)", name, data.len());

        let mut cache = self.cache.lock().map_err(|_| poisoned())?;
        Ok(Arc::clone(cache.entry(name.to_string()).or_insert(data)))
    }
}

fn poisoned() -> Error {
    Error::Internal("archive lock poisoned".to_string())
}

// =============================================================================
// Content Sniffing
// =============================================================================

/// Kind of a filesystem mount source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Directory,
    Zip,
    Tar,
}

/// Classifies a mount source by its content.
///
/// Returns [`Error::UnsupportedMount`] for anything that is not a directory,
/// a zip archive or a tar archive.
pub fn sniff(path: &Path) -> Result<SourceKind> {
    let meta = std::fs::metadata(path)?;
    if meta.is_dir() {
        return Ok(SourceKind::Directory);
    }

    let mut head = [0u8; 262];
    let mut file = File::open(path)?;
    let mut filled = 0;
    while filled < head.len() {
        let n = file.read(&mut head[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    sniff_bytes(&head[..filled]).ok_or_else(|| Error::UnsupportedMount(path.to_path_buf()))
}

/// Classifies the leading bytes of a file.
pub fn sniff_bytes(head: &[u8]) -> Option<SourceKind> {
    if head.len() >= 4
        && head[0] == b'P'
        && head[1] == b'K'
        && matches!((head[2], head[3]), (3, 4) | (5, 6) | (7, 8))
    {
        return Some(SourceKind::Zip);
    }
    if head.len() >= 262 && &head[257..262] == b"ustar" {
        return Some(SourceKind::Tar);
    }
    None
}
