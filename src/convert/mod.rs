//! # Image Conversion Pipeline
//!
//! Turns an OCI image layout into a packaged sandbox image.
//!
//! ## Steps
//!
//! | # | Step                         | Module       | Progress |
//! |---|------------------------------|--------------|----------|
//! | 1 | select manifest              | [`layers`]   |          |
//! | 2 | load and persist config      | this module  |          |
//! | 3 | derive execution spec        | [`spec`]     | 55       |
//! | 4 | compose layers               | [`layers`]   | 65       |
//! | 5 | serialize rootfs tarball     | [`tarball`]  | 70       |
//! | 6 | compress in a sandbox        | [`squash`]   | 73, 90   |
//! | 7 | validate squashfs header     | [`squash`]   |          |
//! | 8 | package four-entry zip       | [`package`]  | 98       |
//!
//! The work directory holds the layout (`index.json`, `blobs/sha256/*`) on
//! entry. Intermediate files (`rootfs/`, `rootfs.tar`, `rootfs.bin`,
//! `config/`) are written next to it. Nothing is written to `output` until
//! the final step, so a failure never leaves a partial artifact there.
//!
//! ## Example
//!
//! ```rust,ignore
//! let options = ConvertOptions::new(assets, modules);
//! convert::convert(&work_dir, &store.staging_path(&digest)?, &options).await?;
//! ```

pub mod layers;
pub mod package;
pub mod spec;
pub mod squash;
pub mod tarball;

use crate::assets::AssetProvider;
use crate::constants::{
    CONFIG_DIR, CONFIG_JSON, IMAGE_CONFIG_JSON, INDEX_JSON, PROGRESS_LAYERS, PROGRESS_PACKAGED,
    PROGRESS_SPEC, PROGRESS_TARBALL, ROOTFS_DIR, ROOTFS_TAR,
};
use crate::error::{Error, Result};
use crate::oci::{self, ImageConfiguration, Index};
use crate::progress::ProgressSink;
use crate::runtime::ModuleCache;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Collaborators of a conversion.
#[derive(Clone)]
pub struct ConvertOptions {
    /// Source of the compression tool module.
    pub assets: Arc<dyn AssetProvider>,
    /// Compiled-module cache shared with the compression tool runtime.
    pub modules: Arc<ModuleCache>,
    pub progress: ProgressSink,
    pub cancel: CancellationToken,
}

impl ConvertOptions {
    pub fn new(assets: Arc<dyn AssetProvider>, modules: Arc<ModuleCache>) -> Self {
        Self {
            assets,
            modules,
            progress: ProgressSink::none(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressSink) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

impl std::fmt::Debug for ConvertOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConvertOptions")
            .field("progress", &self.progress)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Converts the OCI layout in `work_dir` into a packaged image at `output`.
pub async fn convert(work_dir: &Path, output: &Path, options: &ConvertOptions) -> Result<()> {
    info!("Converting image layout {}", work_dir.display());

    let dir = work_dir.to_path_buf();
    let progress = options.progress.clone();
    let cancel = options.cancel.clone();
    blocking(move || prepare(&dir, &progress, &cancel)).await?;

    if options.cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    squash::squash(
        work_dir,
        options.assets.as_ref(),
        &options.modules,
        &options.progress,
        &options.cancel,
    )
    .await?;

    let dir = work_dir.to_path_buf();
    let out = output.to_path_buf();
    blocking(move || {
        // The tarball is no longer needed once compressed.
        let _ = fs::remove_file(dir.join(ROOTFS_TAR));
        package::package(&dir, &out)
    })
    .await?;
    options.progress.push(PROGRESS_PACKAGED);

    info!("Packaged image at {}", output.display());
    Ok(())
}

/// Steps 1 through 5.
fn prepare(work_dir: &Path, progress: &ProgressSink, cancel: &CancellationToken) -> Result<()> {
    let index_path = work_dir.join(INDEX_JSON);
    let index: Index = oci::parse_json(&read_file(&index_path)?, &index_path)?;

    if index.manifests.is_empty() {
        return Err(Error::format(&index_path, "index lists no manifests"));
    }
    let (selected, manifest) = layers::resolve_manifest(work_dir, &index.manifests)?;
    debug!("Selected manifest {}", selected.digest);

    if !oci::is_config_type(&manifest.config.media_type) {
        return Err(Error::UnsupportedMediaType {
            media_type: manifest.config.media_type.clone(),
            digest: manifest.config.digest.clone(),
        });
    }
    let raw_config = oci::read_blob(work_dir, &manifest.config.digest)?;
    let config_path = oci::blob_path(work_dir, &manifest.config.digest)?;
    let image: ImageConfiguration = oci::parse_json(&raw_config, &config_path)?;

    let config_dir = work_dir.join(CONFIG_DIR);
    fs::create_dir_all(&config_dir)?;
    fs::write(work_dir.join(IMAGE_CONFIG_JSON), &raw_config)?;

    let exec = spec::derive(&image);
    fs::write(work_dir.join(CONFIG_JSON), serde_json::to_vec_pretty(&exec)?)?;
    progress.push(PROGRESS_SPEC);

    let rootfs = work_dir.join(ROOTFS_DIR);
    if rootfs.exists() {
        fs::remove_dir_all(&rootfs)?;
    }
    fs::create_dir_all(&rootfs)?;

    // Config and layers come from the same manifest.
    layers::apply_manifest(work_dir, &rootfs, &manifest, cancel)?;
    progress.push(PROGRESS_LAYERS);

    let entries = tarball::write(&rootfs, &work_dir.join(ROOTFS_TAR))?;
    debug!("Root filesystem tarball has {} entries", entries);
    if let Err(e) = fs::remove_dir_all(&rootfs) {
        warn!("Failed to remove {}: {}", rootfs.display(), e);
    }
    progress.push(PROGRESS_TARBALL);
    Ok(())
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| Error::format(path, format!("reading failed: {}", e)))
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Internal(format!("conversion task failed: {}", e)))?
}
