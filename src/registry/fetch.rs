//! Image blob fetchers.
//!
//! An [`ImageFetcher`] resolves references to manifest digests and
//! materializes OCI image layouts. The pull coordinator treats it as a black
//! box; [`OciFetcher`] is the registry-backed implementation.
//!
//! ## Layout Written
//!
//! ```text
//! <layout>/
//! ├── oci-layout
//! ├── index.json          (one descriptor: the top-level manifest or index)
//! └── blobs/sha256/
//!     ├── <top manifest or index>
//!     ├── <child manifests for supported architectures>
//!     ├── <configs>
//!     └── <layers>
//! ```
//!
//! Every blob is hashed as it is written and only moved to its
//! `blobs/sha256/<hex>` name once its digest and size match the descriptor.
//! A rejected or interrupted download leaves nothing behind.

use crate::constants::{
    ACCEPTED_MANIFEST_TYPES, BLOBS_SHA256_DIR, INDEX_JSON, MAX_LAYER_SIZE, MAX_LAYERS,
    MAX_MANIFEST_SIZE, MEDIA_TYPE_OCI_INDEX, OCI_LAYOUT_FILE, OCI_LAYOUT_VERSION, PARTIAL_SUFFIX,
    REGISTRY_OP_TIMEOUT,
};
use crate::error::{Error, Result};
use crate::oci::{self, Descriptor, Index, Manifest};
use crate::platform::Arch;
use crate::storage::digest_hex;
use async_trait::async_trait;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::OciDescriptor;
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Source of OCI image layouts.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// Resolves a fully qualified reference (`registry/repo:tag`) to the
    /// digest of its top-level manifest.
    async fn resolve(&self, reference: &str) -> Result<String>;

    /// Writes the OCI layout of `reference` into the existing directory
    /// `layout`.
    async fn fetch(&self, reference: &str, layout: &Path) -> Result<()>;
}

/// Fetcher backed by an OCI distribution registry.
pub struct OciFetcher {
    client: Client,
    auth: RegistryAuth,
}

impl OciFetcher {
    /// Creates a fetcher with anonymous access over HTTPS.
    pub fn new() -> Self {
        Self::with_protocol(ClientProtocol::Https)
    }

    /// Creates a fetcher with basic auth.
    pub fn with_auth(username: &str, password: &str) -> Self {
        let mut fetcher = Self::new();
        fetcher.auth = RegistryAuth::Basic(username.to_string(), password.to_string());
        fetcher
    }

    /// Creates a fetcher using `protocol`, e.g. plain HTTP for local mirrors.
    pub fn with_protocol(protocol: ClientProtocol) -> Self {
        Self {
            client: Client::new(ClientConfig {
                protocol,
                ..Default::default()
            }),
            auth: RegistryAuth::Anonymous,
        }
    }

    async fn pull_manifest(&self, reference: &Reference, layout: &Path) -> Result<(Vec<u8>, String)> {
        let (data, digest) = timed(
            reference,
            self.client
                .pull_manifest_raw(reference, &self.auth, ACCEPTED_MANIFEST_TYPES),
        )
        .await?;
        if data.len() as u64 > MAX_MANIFEST_SIZE {
            return Err(transfer(reference, format!("manifest exceeds {} bytes", MAX_MANIFEST_SIZE)));
        }

        let computed = format!("sha256:{}", hex::encode(Sha256::digest(&data)));
        if !digest.is_empty() && digest != computed {
            return Err(transfer(
                reference,
                format!("manifest digest mismatch: {} != {}", digest, computed),
            ));
        }
        write_blob(layout, &computed, &data).await?;
        Ok((data, computed))
    }

    async fn pull_blob(&self, reference: &Reference, desc: &Descriptor, layout: &Path) -> Result<()> {
        let path = oci::blob_path(layout, &desc.digest)?;
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(());
        }
        if desc.size > 0 && desc.size as u64 > MAX_LAYER_SIZE {
            return Err(transfer(
                reference,
                format!("blob {} of {} bytes exceeds {}", desc.digest, desc.size, MAX_LAYER_SIZE),
            ));
        }
        let descriptor = OciDescriptor {
            media_type: desc.media_type.clone(),
            digest: desc.digest.clone(),
            size: desc.size,
            urls: None,
            annotations: None,
        };

        debug!("Pulling blob {} ({} bytes)", desc.digest, desc.size);
        let mut writer = BlobWriter::create(layout, desc).await?;
        timed(
            reference,
            self.client.pull_blob(reference, &descriptor, &mut writer),
        )
        .await?;
        writer.finish().await.map_err(|e| transfer(reference, e))
    }

    async fn pull_image_manifest(
        &self,
        reference: &Reference,
        data: &[u8],
        layout: &Path,
    ) -> Result<()> {
        let manifest: Manifest = serde_json::from_slice(data)
            .map_err(|e| transfer(reference, format!("bad manifest: {}", e)))?;
        if manifest.layers.len() > MAX_LAYERS {
            return Err(transfer(
                reference,
                format!("too many layers: {} > {}", manifest.layers.len(), MAX_LAYERS),
            ));
        }
        self.pull_blob(reference, &manifest.config, layout).await?;
        for layer in &manifest.layers {
            self.pull_blob(reference, layer, layout).await?;
        }
        Ok(())
    }
}

impl Default for OciFetcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Just enough of a manifest to tell an index from an image manifest.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestShape {
    media_type: Option<String>,
    manifests: Option<serde_json::Value>,
}

#[async_trait]
impl ImageFetcher for OciFetcher {
    async fn resolve(&self, reference: &str) -> Result<String> {
        let parsed = parse_reference(reference)?;
        let digest = timed(
            &parsed,
            self.client.fetch_manifest_digest(&parsed, &self.auth),
        )
        .await?;
        debug!("Resolved {} to {}", reference, digest);
        Ok(digest)
    }

    async fn fetch(&self, reference: &str, layout: &Path) -> Result<()> {
        let parsed = parse_reference(reference)?;
        info!("Fetching {}", reference);
        tokio::fs::create_dir_all(layout.join(BLOBS_SHA256_DIR)).await?;

        let (data, digest) = self.pull_manifest(&parsed, layout).await?;
        let shape: ManifestShape = serde_json::from_slice(&data)
            .map_err(|e| transfer(&parsed, format!("bad manifest: {}", e)))?;
        let is_index = shape.manifests.is_some()
            || shape.media_type.as_deref().is_some_and(oci::is_index_type);

        let media_type = match (&shape.media_type, is_index) {
            (Some(t), _) => t.clone(),
            (None, true) => MEDIA_TYPE_OCI_INDEX.to_string(),
            (None, false) => crate::constants::MEDIA_TYPE_OCI_MANIFEST.to_string(),
        };

        if is_index {
            let index: Index = serde_json::from_slice(&data)
                .map_err(|e| transfer(&parsed, format!("bad index: {}", e)))?;
            let mut children: Vec<&Descriptor> = index
                .manifests
                .iter()
                .filter(|d| {
                    d.platform
                        .as_ref()
                        .and_then(|p| p.architecture.parse::<Arch>().ok())
                        .is_some()
                })
                .collect();
            if children.is_empty() {
                children.extend(index.manifests.first());
            }
            for child in children {
                if !oci::is_manifest_type(&child.media_type) {
                    debug!("Skipping {} child {}", child.media_type, child.digest);
                    continue;
                }
                let child_ref = Reference::with_digest(
                    parsed.registry().to_string(),
                    parsed.repository().to_string(),
                    child.digest.clone(),
                );
                let (child_data, _) = self.pull_manifest(&child_ref, layout).await?;
                self.pull_image_manifest(&child_ref, &child_data, layout).await?;
            }
        } else {
            self.pull_image_manifest(&parsed, &data, layout).await?;
        }

        let top = Index {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_OCI_INDEX.to_string()),
            manifests: vec![Descriptor {
                media_type,
                digest,
                size: data.len() as i64,
                platform: None,
                annotations: None,
            }],
        };
        tokio::fs::write(layout.join(INDEX_JSON), serde_json::to_vec(&top)?).await?;
        tokio::fs::write(
            layout.join(OCI_LAYOUT_FILE),
            format!(r#"{{"imageLayoutVersion":"{}"}}"#, OCI_LAYOUT_VERSION),
        )
        .await?;
        Ok(())
    }
}

fn parse_reference(reference: &str) -> Result<Reference> {
    reference
        .parse()
        .map_err(|e| Error::InvalidImageReference {
            reference: reference.to_string(),
            reason: format!("{}", e),
        })
}

fn transfer(reference: &Reference, reason: impl ToString) -> Error {
    Error::TransferFailed {
        reference: reference.whole(),
        reason: reason.to_string(),
    }
}

async fn timed<T, E: std::fmt::Display>(
    reference: &Reference,
    op: impl Future<Output = std::result::Result<T, E>>,
) -> Result<T> {
    tokio::time::timeout(REGISTRY_OP_TIMEOUT, op)
        .await
        .map_err(|_| transfer(reference, format!("timed out after {:?}", REGISTRY_OP_TIMEOUT)))?
        .map_err(|e| transfer(reference, e))
}

/// Destination of one blob download.
///
/// Bytes go to `<hex>.partial`, hashed on the way. [`BlobWriter::finish`]
/// checks size and digest and renames the file into place; dropping an
/// unfinished writer removes the partial file.
struct BlobWriter {
    file: tokio::fs::File,
    hasher: Sha256,
    written: u64,
    limit: u64,
    expected_size: Option<u64>,
    digest: String,
    partial: PathBuf,
    path: PathBuf,
    committed: bool,
}

impl BlobWriter {
    async fn create(layout: &Path, desc: &Descriptor) -> Result<Self> {
        let path = oci::blob_path(layout, &desc.digest)?;
        let mut name = path.as_os_str().to_owned();
        name.push(PARTIAL_SUFFIX);
        let partial = PathBuf::from(name);
        let file = tokio::fs::File::create(&partial).await?;
        let expected_size = (desc.size > 0).then_some(desc.size as u64);
        Ok(Self {
            file,
            hasher: Sha256::new(),
            written: 0,
            limit: expected_size.unwrap_or(MAX_LAYER_SIZE).min(MAX_LAYER_SIZE),
            expected_size,
            digest: desc.digest.clone(),
            partial,
            path,
            committed: false,
        })
    }

    async fn finish(mut self) -> io::Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await?;

        if let Some(expected) = self.expected_size
            && expected != self.written
        {
            return Err(invalid_data(format!(
                "blob {} is {} bytes, expected {}",
                self.digest, self.written, expected
            )));
        }
        let computed = format!(
            "sha256:{}",
            hex::encode(std::mem::take(&mut self.hasher).finalize())
        );
        if computed != self.digest {
            return Err(invalid_data(format!(
                "blob digest mismatch: {} != {}",
                self.digest, computed
            )));
        }

        tokio::fs::rename(&self.partial, &self.path).await?;
        self.committed = true;
        Ok(())
    }
}

impl AsyncWrite for BlobWriter {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if this.written + buf.len() as u64 > this.limit {
            return Poll::Ready(Err(invalid_data(format!(
                "blob {} exceeds {} bytes",
                this.digest, this.limit
            ))));
        }
        let n = ready!(Pin::new(&mut this.file).poll_write(cx, buf))?;
        this.hasher.update(&buf[..n]);
        this.written += n as u64;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_shutdown(cx)
    }
}

impl Drop for BlobWriter {
    fn drop(&mut self) {
        if !self.committed
            && let Err(e) = std::fs::remove_file(&self.partial)
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!("Failed to remove {}: {}", self.partial.display(), e);
        }
    }
}

fn invalid_data(reason: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, reason)
}

async fn write_blob(layout: &Path, digest: &str, data: &[u8]) -> Result<()> {
    let path = layout.join(BLOBS_SHA256_DIR).join(digest_hex(digest)?);
    tokio::fs::write(path, data).await?;
    Ok(())
}
