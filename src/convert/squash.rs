//! Squashfs compression.
//!
//! The root filesystem tarball is compressed by a sandboxed compression
//! tool: a single-module [`Spin`] whose only mount is the work directory at
//! `/mnt`. The tool reads `/mnt/rootfs.tar` and writes `/mnt/rootfs.bin`;
//! the result is accepted only if its superblock names gzip compression.

use crate::assets::AssetProvider;
use crate::constants::{
    PROGRESS_SQUASHED, PROGRESS_TOOL_READY, ROOTFS_BIN, SQUASH_COMMAND, SQUASH_WORK_MOUNT,
    SQUASHFS_COMPRESSION_GZIP, SQUASHFS_COMPRESSION_OFFSET, SQUASHFS_MAGIC,
    SQUASHFS_SUPERBLOCK_SIZE,
};
use crate::error::{Error, Result};
use crate::progress::ProgressSink;
use crate::runtime::{ModuleCache, SharedBuffer, Spin};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Runs the compression tool over `work_dir`.
pub async fn squash(
    work_dir: &Path,
    assets: &dyn AssetProvider,
    modules: &Arc<ModuleCache>,
    progress: &ProgressSink,
    cancel: &CancellationToken,
) -> Result<()> {
    let tool = assets.squashfs_tool()?;

    let modules = Arc::clone(modules);
    let token = cancel.child_token();
    let spin = tokio::task::spawn_blocking(move || {
        Spin::builder()
            .module(tool)
            .module_cache(modules)
            .parent_token(token)
            .build()
    })
    .await
    .map_err(|e| Error::Internal(format!("compression tool task failed: {}", e)))??;
    progress.push(PROGRESS_TOOL_READY);

    let result = run_tool(&spin, work_dir).await;
    spin.close();
    result?;

    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    validate_header(&work_dir.join(ROOTFS_BIN))?;
    info!("Compressed root filesystem in {}", work_dir.display());
    progress.push(PROGRESS_SQUASHED);
    Ok(())
}

async fn run_tool(spin: &Spin, work_dir: &Path) -> Result<()> {
    let stderr = SharedBuffer::new();
    let container = spin
        .container()
        .mount(work_dir, SQUASH_WORK_MOUNT)
        .command(SQUASH_COMMAND.iter().copied())
        .stdout(std::io::sink())
        .stderr(stderr.clone())
        .create()
        .await?;
    debug!("Compression tool running as {}", container.name());

    let result = container.run().await;
    container.stop().await;

    if let Err(e) = &result {
        let output = stderr.to_string_lossy();
        if !output.is_empty() {
            warn!("Compression tool output: {}", output.trim_end());
        }
        debug!("Compression tool failed: {}", e);
    }
    result
}

/// Checks that `path` starts with a gzip-compressed squashfs superblock.
pub fn validate_header(path: &Path) -> Result<()> {
    let bad = |reason: String| Error::BadSquashfsHeader {
        path: path.to_path_buf(),
        reason,
    };

    let mut file = File::open(path).map_err(|e| bad(format!("opening image failed: {}", e)))?;
    let mut superblock = [0u8; SQUASHFS_SUPERBLOCK_SIZE];
    file.read_exact(&mut superblock)
        .map_err(|_| bad(format!("image shorter than {} bytes", SQUASHFS_SUPERBLOCK_SIZE)))?;

    let magic = u32::from_le_bytes([superblock[0], superblock[1], superblock[2], superblock[3]]);
    if magic != SQUASHFS_MAGIC {
        return Err(bad(format!("bad magic {:#010x}", magic)));
    }

    let at = SQUASHFS_COMPRESSION_OFFSET;
    let compression = u16::from_le_bytes([superblock[at], superblock[at + 1]]);
    if compression != SQUASHFS_COMPRESSION_GZIP {
        return Err(bad(format!("unexpected compression id {}", compression)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn superblock(magic: u32, compression: u16) -> Vec<u8> {
        let mut data = vec![0u8; SQUASHFS_SUPERBLOCK_SIZE];
        data[..4].copy_from_slice(&magic.to_le_bytes());
        data[SQUASHFS_COMPRESSION_OFFSET..SQUASHFS_COMPRESSION_OFFSET + 2]
            .copy_from_slice(&compression.to_le_bytes());
        data
    }

    #[test]
    fn test_valid_header() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(ROOTFS_BIN);
        std::fs::write(&path, superblock(SQUASHFS_MAGIC, 1)).unwrap();
        validate_header(&path).unwrap();
    }

    #[test]
    fn test_rejects_wrong_compression() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(ROOTFS_BIN);
        std::fs::write(&path, superblock(SQUASHFS_MAGIC, 4)).unwrap();
        assert!(matches!(
            validate_header(&path),
            Err(Error::BadSquashfsHeader { .. })
        ));
    }

    #[test]
    fn test_rejects_short_or_foreign_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let short = dir.path().join("short");
        std::fs::write(&short, b"hsqs").unwrap();
        assert!(validate_header(&short).is_err());

        let foreign = dir.path().join("foreign");
        std::fs::write(&foreign, superblock(0xdead_beef, 1)).unwrap();
        assert!(validate_header(&foreign).is_err());
    }
}
