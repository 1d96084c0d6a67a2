//! OCI image-layout types.
//!
//! Only the fields the pull coordinator and the conversion pipeline read are
//! modelled; unknown fields are ignored on input. Raw blobs are always kept
//! alongside the parsed form so that persisted copies stay byte-identical.

use crate::constants::{
    BLOBS_SHA256_DIR, LAYER_MEDIA_TYPE_PREFIXES, MAX_MANIFEST_SIZE, MEDIA_TYPE_DOCKER_CONFIG,
    MEDIA_TYPE_DOCKER_MANIFEST, MEDIA_TYPE_DOCKER_MANIFEST_LIST, MEDIA_TYPE_OCI_CONFIG,
    MEDIA_TYPE_OCI_INDEX, MEDIA_TYPE_OCI_MANIFEST,
};
use crate::error::{Error, Result};
use crate::storage::digest_hex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Content descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    #[serde(default)]
    pub media_type: String,
    pub digest: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

/// Platform of a manifest referenced from an index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// Image index (manifest list), also the shape of a layout's `index.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Index {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
}

/// Image manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

/// Image configuration blob.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageConfiguration {
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ContainerConfig>,
}

/// Execution defaults carried by an image configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerConfig {
    #[serde(default)]
    pub env: Option<Vec<String>>,
    #[serde(default)]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default)]
    pub cmd: Option<Vec<String>>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
}

// =============================================================================
// Media Type Classification
// =============================================================================

/// Returns true for single-image manifest media types.
pub fn is_manifest_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_OCI_MANIFEST || media_type == MEDIA_TYPE_DOCKER_MANIFEST
}

/// Returns true for index / manifest-list media types.
pub fn is_index_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_OCI_INDEX || media_type == MEDIA_TYPE_DOCKER_MANIFEST_LIST
}

/// Returns true for image configuration media types.
pub fn is_config_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_OCI_CONFIG || media_type == MEDIA_TYPE_DOCKER_CONFIG
}

/// Returns true for filesystem layer media types.
pub fn is_layer_type(media_type: &str) -> bool {
    LAYER_MEDIA_TYPE_PREFIXES
        .iter()
        .any(|p| media_type.starts_with(p))
}

/// Returns true if a manifest describes a runnable container image.
///
/// Artifacts stored in registries (signatures, attestations, helm charts)
/// use other config or layer types and are skipped during composition.
pub fn is_container_manifest(manifest: &Manifest) -> bool {
    is_config_type(&manifest.config.media_type)
        && manifest.layers.iter().all(|l| is_layer_type(&l.media_type))
}

// =============================================================================
// Layout Access
// =============================================================================

/// Path of a blob inside an OCI layout directory.
pub fn blob_path(layout: &Path, digest: &str) -> Result<PathBuf> {
    Ok(layout.join(BLOBS_SHA256_DIR).join(digest_hex(digest)?))
}

/// Reads a small blob (manifest, index, config) with a size bound.
pub fn read_blob(layout: &Path, digest: &str) -> Result<Vec<u8>> {
    let path = blob_path(layout, digest)?;
    let file = std::fs::File::open(&path)
        .map_err(|e| Error::format(&path, format!("opening blob {} failed: {}", digest, e)))?;
    let mut data = Vec::new();
    file.take(MAX_MANIFEST_SIZE + 1).read_to_end(&mut data)?;
    if data.len() as u64 > MAX_MANIFEST_SIZE {
        return Err(Error::format(
            &path,
            format!("blob exceeds {} bytes", MAX_MANIFEST_SIZE),
        ));
    }
    Ok(data)
}

/// Parses JSON bytes, attributing failures to `path`.
pub fn parse_json<T: DeserializeOwned>(data: &[u8], path: &Path) -> Result<T> {
    serde_json::from_slice(data).map_err(|e| Error::format(path, e))
}

/// Reads and parses a JSON blob.
pub fn read_blob_json<T: DeserializeOwned>(layout: &Path, digest: &str) -> Result<T> {
    let data = read_blob(layout, digest)?;
    parse_json(&data, &blob_path(layout, digest)?)
}
