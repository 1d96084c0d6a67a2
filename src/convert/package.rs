//! Artifact packaging.
//!
//! A packaged image is a zip with exactly four entries:
//!
//! | Entry                      | Compression |
//! |----------------------------|-------------|
//! | `rootfs.bin`               | stored      |
//! | `index.json`               | deflate     |
//! | `config/config.json`       | deflate     |
//! | `config/imageconfig.json`  | deflate     |
//!
//! The squashfs image is already compressed, so it is stored as-is.

use crate::constants::{ARTIFACT_ENTRIES, CONFIG_JSON, IMAGE_CONFIG_JSON, INDEX_JSON, ROOTFS_BIN};
use crate::error::{Error, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::debug;
use zip::CompressionMethod;
use zip::write::{FileOptions, ZipWriter};

/// Writes the artifact of `work_dir` to `output`.
///
/// `work_dir` must hold `rootfs.bin`, `index.json` and the two config files
/// under `config/`.
pub fn package(work_dir: &Path, output: &Path) -> Result<()> {
    let file = File::create(output).map_err(|e| {
        Error::StorageWriteFailed(format!("creating {} failed: {}", output.display(), e))
    })?;
    let mut zip = ZipWriter::new(BufWriter::new(file));

    for name in ARTIFACT_ENTRIES {
        let source = work_dir.join(name);
        let mut input = File::open(&source).map_err(|e| {
            Error::format(&source, format!("missing artifact entry: {}", e))
        })?;
        let size = input.metadata()?.len();

        let options = if name == ROOTFS_BIN {
            FileOptions::default()
                .compression_method(CompressionMethod::Stored)
                .large_file(size > u64::from(u32::MAX))
        } else {
            debug_assert!([INDEX_JSON, CONFIG_JSON, IMAGE_CONFIG_JSON].contains(&name));
            FileOptions::default().compression_method(CompressionMethod::Deflated)
        };

        zip.start_file(name, options)?;
        std::io::copy(&mut input, &mut zip)?;
        debug!("Packaged {} ({} bytes)", name, size);
    }

    let mut writer = zip.finish()?;
    writer.flush()?;
    Ok(())
}
