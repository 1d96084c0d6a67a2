//! Manifest selection and layer composition.
//!
//! ## Manifest Selection
//!
//! Descriptors are walked breadth-first. Each level is stably ordered by
//! [`child_rank`]: supported architectures in [`Arch::PREFERRED`] order,
//! then any other platform, then entries without platform information.
//! Nested indexes contribute their children to the next level. The first
//! container manifest reached is the one converted: it supplies both the
//! image configuration and the layers.
//!
//! ## Composition
//!
//! The selected manifest has its layers applied in array order; later
//! layers overwrite earlier ones.
//!
//! ## Whiteouts
//!
//! - `.wh.<name>` deletes `<name>` from lower layers
//! - `.wh..wh..opq` empties its directory of lower-layer content
//!
//! Neither marker is written to the root filesystem. Removals never pass
//! through a symlink planted by a lower layer: a path below a symlinked
//! directory is treated as absent.

use crate::constants::{
    GZIP_MAGIC, MAX_INDEX_DEPTH, MAX_LAYERS, MAX_ROOTFS_SIZE, WHITEOUT_OPAQUE, WHITEOUT_PREFIX,
    ZSTD_MAGIC,
};
use crate::error::{Error, Result};
use crate::oci::{
    self, Descriptor, Index, Manifest, is_container_manifest, is_index_type, is_manifest_type,
};
use crate::platform::Arch;
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, EntryType};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Sort key of a descriptor during manifest selection.
pub fn child_rank(desc: &Descriptor) -> usize {
    match &desc.platform {
        Some(p) => Arch::PREFERRED
            .iter()
            .position(|a| a.as_oci() == p.architecture)
            .unwrap_or(Arch::PREFERRED.len()),
        None => Arch::PREFERRED.len() + 1,
    }
}

/// Best-ranked descriptor of one list, earliest on ties.
pub fn select(manifests: &[Descriptor]) -> Option<&Descriptor> {
    manifests.iter().min_by_key(|d| child_rank(d))
}

/// Finds the container manifest to convert among `descs`.
pub fn resolve_manifest(layout: &Path, descs: &[Descriptor]) -> Result<(Descriptor, Manifest)> {
    let mut level: Vec<Descriptor> = descs.to_vec();
    level.sort_by_key(child_rank);

    for depth in 0..MAX_INDEX_DEPTH {
        let mut children = Vec::new();

        for desc in &level {
            if is_manifest_type(&desc.media_type) {
                let manifest: Manifest = oci::read_blob_json(layout, &desc.digest)?;
                if !is_container_manifest(&manifest) {
                    debug!("Skipping non-container manifest {}", desc.digest);
                    continue;
                }
                return Ok((desc.clone(), manifest));
            } else if is_index_type(&desc.media_type) {
                let index: Index = oci::read_blob_json(layout, &desc.digest)?;
                children.extend(index.manifests);
            } else {
                return Err(Error::UnsupportedMediaType {
                    media_type: desc.media_type.clone(),
                    digest: desc.digest.clone(),
                });
            }
        }

        if children.is_empty() {
            break;
        }
        children.sort_by_key(child_rank);
        debug!("Descending into {} index children (depth {})", children.len(), depth + 1);
        level = children;
    }

    Err(Error::format(layout, "target config not found"))
}

/// Applies the manifest selected from `descs` onto `rootfs`. Returns the
/// digest of the manifest applied.
pub fn compose(
    layout: &Path,
    rootfs: &Path,
    descs: &[Descriptor],
    cancel: &CancellationToken,
) -> Result<String> {
    let (selected, manifest) = resolve_manifest(layout, descs)?;
    apply_manifest(layout, rootfs, &manifest, cancel)?;
    Ok(selected.digest)
}

/// Applies every layer of `manifest` onto `rootfs`, bottom first.
pub fn apply_manifest(
    layout: &Path,
    rootfs: &Path,
    manifest: &Manifest,
    cancel: &CancellationToken,
) -> Result<()> {
    if manifest.layers.len() > MAX_LAYERS {
        return Err(Error::format(
            layout,
            format!("too many layers: {} > {}", manifest.layers.len(), MAX_LAYERS),
        ));
    }

    let mut total = 0u64;
    for layer in &manifest.layers {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        info!("Applying layer {}", layer.digest);
        let path = oci::blob_path(layout, &layer.digest)?;
        let file = File::open(&path).map_err(|e| Error::LayerApplyFailed {
            digest: layer.digest.clone(),
            reason: format!("opening {} failed: {}", path.display(), e),
        })?;
        total += apply_layer(file, rootfs, &layer.digest, &layer.media_type, total)?;
    }
    Ok(())
}

/// Applies one layer blob onto `rootfs`, returning the bytes unpacked.
///
/// Gzip and uncompressed tar layers are detected by content.
pub fn apply_layer(
    blob: impl Read,
    rootfs: &Path,
    digest: &str,
    media_type: &str,
    already_unpacked: u64,
) -> Result<u64> {
    let fail = |reason: String| Error::LayerApplyFailed {
        digest: digest.to_string(),
        reason,
    };

    let mut reader = BufReader::new(blob);
    let head = reader
        .fill_buf()
        .map_err(|e| fail(format!("reading layer failed: {}", e)))?;

    if head.starts_with(&ZSTD_MAGIC) || media_type.ends_with("+zstd") {
        return Err(Error::UnsupportedMediaType {
            media_type: media_type.to_string(),
            digest: digest.to_string(),
        });
    }

    let stream: Box<dyn Read> = if head.starts_with(&GZIP_MAGIC) {
        Box::new(GzDecoder::new(reader))
    } else {
        Box::new(reader)
    };

    let mut archive = Archive::new(stream);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_unpack_xattrs(false);
    archive.set_overwrite(true);

    let mut total = already_unpacked;
    let start = total;

    let entries = archive
        .entries()
        .map_err(|e| fail(format!("reading tar failed: {}", e)))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| fail(format!("reading entry failed: {}", e)))?;
        let path = entry
            .path()
            .map_err(|e| fail(format!("bad entry path: {}", e)))?
            .into_owned();

        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
        {
            return Err(fail(format!("path traversal in {}", path.display())));
        }
        let relative: std::path::PathBuf = path
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .collect();
        if relative.as_os_str().is_empty() {
            continue;
        }

        let file_name = relative
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        let parent_rel = relative.parent().unwrap_or(Path::new(""));
        let parent = rootfs.join(parent_rel);
        let parent_escapes = resolves_outside(rootfs, parent_rel);

        if file_name == WHITEOUT_OPAQUE {
            if parent_escapes {
                warn!("Ignoring opaque whiteout in {} outside rootfs", parent_rel.display());
            } else {
                clear_dir(&parent).map_err(|e| fail(format!("opaque whiteout failed: {}", e)))?;
            }
            continue;
        }
        if let Some(target) = file_name.strip_prefix(WHITEOUT_PREFIX) {
            if parent_escapes {
                warn!("Ignoring whiteout of {} in {} outside rootfs", target, parent_rel.display());
            } else {
                remove_path(&parent.join(target))
                    .map_err(|e| fail(format!("whiteout of {} failed: {}", target, e)))?;
            }
            continue;
        }

        total += entry.size();
        if total > MAX_ROOTFS_SIZE {
            return Err(fail(format!(
                "root filesystem exceeds {} bytes",
                MAX_ROOTFS_SIZE
            )));
        }

        // A different entry type at an existing path replaces it outright.
        let target = rootfs.join(&relative);
        // `unpack_in` rejects entries that resolve outside `rootfs`.
        if let Ok(meta) = fs::symlink_metadata(&target)
            && !parent_escapes
        {
            let incoming_dir = entry.header().entry_type() == EntryType::Directory;
            if meta.is_dir() != incoming_dir || meta.file_type().is_symlink() {
                remove_path(&target)
                    .map_err(|e| fail(format!("replacing {} failed: {}", relative.display(), e)))?;
            }
        }

        entry
            .unpack_in(rootfs)
            .map_err(|e| fail(format!("unpacking {} failed: {}", relative.display(), e)))?;
    }

    Ok(total - start)
}

/// Returns true if `relative`, below `rootfs`, resolves outside it through
/// a symlink planted by a lower layer.
fn resolves_outside(rootfs: &Path, relative: &Path) -> bool {
    let mut current = PathBuf::from(rootfs);
    let mut linked = false;
    for component in relative.components() {
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                linked = true;
                break;
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }
    if !linked {
        return false;
    }
    match (fs::canonicalize(rootfs), fs::canonicalize(rootfs.join(relative))) {
        (Ok(root), Ok(resolved)) => !resolved.starts_with(root),
        // Unresolvable: nothing below it to remove.
        _ => true,
    }
}

fn remove_path(path: &Path) -> std::io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn clear_dir(dir: &Path) -> std::io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let path = entry?.path();
        if let Err(e) = remove_path(&path) {
            warn!("Failed to clear {}: {}", path.display(), e);
            return Err(e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::Platform;

    fn desc(arch: Option<&str>, digest: &str) -> Descriptor {
        Descriptor {
            media_type: crate::constants::MEDIA_TYPE_OCI_MANIFEST.to_string(),
            digest: digest.to_string(),
            size: 0,
            platform: arch.map(|a| Platform {
                architecture: a.to_string(),
                os: "linux".to_string(),
                variant: None,
            }),
            annotations: None,
        }
    }

    fn layer(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_entry_type(EntryType::Regular);
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn symlink_layer(name: &str, target: &Path) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(0);
        header.set_mode(0o777);
        header.set_entry_type(EntryType::Symlink);
        builder
            .append_link(&mut header, name, target)
            .unwrap();
        builder.into_inner().unwrap()
    }

    fn dir_layer(name: &str) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(0);
        header.set_mode(0o755);
        header.set_entry_type(EntryType::Directory);
        builder.append_data(&mut header, name, std::io::empty()).unwrap();
        builder.into_inner().unwrap()
    }

    fn write_blob(layout: &Path, value: &serde_json::Value) -> String {
        use sha2::{Digest, Sha256};
        let data = serde_json::to_vec(value).unwrap();
        let hex = hex::encode(Sha256::digest(&data));
        let dir = layout.join(crate::constants::BLOBS_SHA256_DIR);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(&hex), &data).unwrap();
        format!("sha256:{}", hex)
    }

    fn container_manifest(layout: &Path) -> String {
        let config = write_blob(layout, &serde_json::json!({ "architecture": "amd64" }));
        write_blob(
            layout,
            &serde_json::json!({
                "schemaVersion": 2,
                "mediaType": crate::constants::MEDIA_TYPE_OCI_MANIFEST,
                "config": {
                    "mediaType": crate::constants::MEDIA_TYPE_OCI_CONFIG,
                    "digest": config,
                    "size": 0,
                },
                "layers": [],
            }),
        )
    }

    #[test]
    fn test_select_prefers_supported_arch() {
        let manifests = vec![
            desc(Some("arm64"), "a"),
            desc(Some("riscv64"), "r"),
            desc(Some("amd64"), "x"),
        ];
        assert_eq!(select(&manifests).unwrap().digest, "x");
    }

    #[test]
    fn test_select_falls_back_to_platform_then_first() {
        let manifests = vec![desc(None, "n"), desc(Some("arm64"), "a"), desc(Some("s390x"), "s")];
        assert_eq!(select(&manifests).unwrap().digest, "a");
        let manifests = vec![desc(None, "n1"), desc(None, "n2")];
        assert_eq!(select(&manifests).unwrap().digest, "n1");
        assert!(select(&[]).is_none());
    }

    #[test]
    fn test_nested_index_resolves_same_manifest_as_compose() {
        let layout = tempfile::TempDir::new().unwrap();
        let plain = container_manifest(layout.path());
        // Distinct bytes, distinct digest.
        let config = write_blob(layout.path(), &serde_json::json!({ "architecture": "arm64" }));
        let arm = write_blob(
            layout.path(),
            &serde_json::json!({
                "schemaVersion": 2,
                "config": {
                    "mediaType": crate::constants::MEDIA_TYPE_OCI_CONFIG,
                    "digest": config,
                    "size": 0,
                },
                "layers": [],
            }),
        );
        let nested = write_blob(
            layout.path(),
            &serde_json::json!({
                "schemaVersion": 2,
                "manifests": [
                    { "mediaType": crate::constants::MEDIA_TYPE_OCI_MANIFEST, "digest": plain, "size": 0 },
                    {
                        "mediaType": crate::constants::MEDIA_TYPE_OCI_MANIFEST,
                        "digest": arm,
                        "size": 0,
                        "platform": { "architecture": "arm64", "os": "linux" }
                    },
                ],
            }),
        );
        let top = vec![Descriptor {
            media_type: crate::constants::MEDIA_TYPE_OCI_INDEX.to_string(),
            digest: nested,
            size: 0,
            platform: None,
            annotations: None,
        }];

        let (selected, manifest) = resolve_manifest(layout.path(), &top).unwrap();
        assert_eq!(selected.digest, arm);
        assert_eq!(manifest.config.digest, config);

        let rootfs = layout.path().join("rootfs");
        fs::create_dir_all(&rootfs).unwrap();
        let applied = compose(layout.path(), &rootfs, &top, &CancellationToken::new()).unwrap();
        assert_eq!(applied, selected.digest);
    }

    #[test]
    fn test_child_rank_orders_platformless_last() {
        let mut children = vec![
            desc(None, "n"),
            desc(Some("arm64"), "a"),
            desc(Some("riscv64"), "r"),
            desc(Some("amd64"), "x"),
        ];
        children.sort_by_key(child_rank);
        let order: Vec<_> = children.iter().map(|d| d.digest.as_str()).collect();
        assert_eq!(order, vec!["x", "r", "a", "n"]);
    }

    #[test]
    fn test_whiteout_removes_lower_file() {
        let rootfs = tempfile::TempDir::new().unwrap();
        apply_layer(&layer(&[("etc/a", b"1"), ("etc/b", b"2")])[..], rootfs.path(), "l1", "", 0)
            .unwrap();
        apply_layer(&layer(&[("etc/.wh.a", b"")])[..], rootfs.path(), "l2", "", 0).unwrap();
        assert!(!rootfs.path().join("etc/a").exists());
        assert!(rootfs.path().join("etc/b").exists());
        assert!(!rootfs.path().join("etc/.wh.a").exists());
    }

    #[test]
    fn test_opaque_whiteout_clears_directory() {
        let rootfs = tempfile::TempDir::new().unwrap();
        apply_layer(&layer(&[("d/old", b"1")])[..], rootfs.path(), "l1", "", 0).unwrap();
        apply_layer(
            &layer(&[("d/.wh..wh..opq", b""), ("d/new", b"2")])[..],
            rootfs.path(),
            "l2",
            "",
            0,
        )
        .unwrap();
        assert!(!rootfs.path().join("d/old").exists());
        assert_eq!(fs::read(rootfs.path().join("d/new")).unwrap(), b"2");
    }

    #[test]
    fn test_whiteouts_do_not_follow_symlinks_out_of_rootfs() {
        let temp = tempfile::TempDir::new().unwrap();
        let rootfs = temp.path().join("rootfs");
        let outside = temp.path().join("outside");
        fs::create_dir_all(&rootfs).unwrap();
        fs::create_dir_all(&outside).unwrap();
        fs::write(outside.join("secret"), b"s").unwrap();
        fs::write(outside.join("other"), b"o").unwrap();

        apply_layer(&symlink_layer("d", &outside)[..], &rootfs, "l1", "", 0).unwrap();
        apply_layer(&layer(&[("d/.wh.secret", b"")])[..], &rootfs, "l2", "", 0).unwrap();
        apply_layer(&layer(&[("d/.wh..wh..opq", b"")])[..], &rootfs, "l3", "", 0).unwrap();
        // Rejected by the unpacker; the lower file must survive either way.
        let _ = apply_layer(&dir_layer("d/secret")[..], &rootfs, "l4", "", 0);

        assert_eq!(fs::read(outside.join("secret")).unwrap(), b"s");
        assert_eq!(fs::read(outside.join("other")).unwrap(), b"o");
    }

    #[test]
    fn test_whiteout_through_symlink_inside_rootfs() {
        let rootfs = tempfile::TempDir::new().unwrap();
        apply_layer(&layer(&[("usr/lib/a", b"1"), ("usr/lib/b", b"2")])[..], rootfs.path(), "l1", "", 0)
            .unwrap();
        apply_layer(&symlink_layer("lib", Path::new("usr/lib"))[..], rootfs.path(), "l2", "", 0)
            .unwrap();
        apply_layer(&layer(&[("lib/.wh.a", b"")])[..], rootfs.path(), "l3", "", 0).unwrap();

        assert!(!rootfs.path().join("usr/lib/a").exists());
        assert!(rootfs.path().join("usr/lib/b").exists());
    }

    #[test]
    fn test_zstd_layer_rejected() {
        let rootfs = tempfile::TempDir::new().unwrap();
        let blob = [0x28u8, 0xb5, 0x2f, 0xfd, 0, 0, 0, 0];
        assert!(matches!(
            apply_layer(&blob[..], rootfs.path(), "z", "", 0),
            Err(Error::UnsupportedMediaType { .. })
        ));
    }
}
