//! Tests for the image conversion pipeline.
//!
//! Validates layer composition order, the four-entry artifact layout, the
//! squashfs header check and the no-partial-artifact guarantee.

mod common;

use common::{
    FAKE_SQUASH_WAT, SyntheticImage, TestAssets, WRONG_COMPRESSION_WAT, gzip_layer,
};
use spinrun::convert::{self, ConvertOptions, layers};
use spinrun::oci::Index;
use spinrun::{Error, ModuleCache};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn two_layer_image() -> SyntheticImage {
    SyntheticImage::new(
        &[
            gzip_layer(&[("etc/motd", b"layer one"), ("etc/keep", b"kept")]),
            gzip_layer(&[("etc/motd", b"layer two wins")]),
        ],
        &["/bin/sh", "-c", "cat /etc/motd"],
    )
}

fn compose_into(layout: &Path, rootfs: &Path) -> String {
    let index: Index = serde_json::from_slice(&fs::read(layout.join("index.json")).unwrap()).unwrap();
    fs::create_dir_all(rootfs).unwrap();
    layers::compose(layout, rootfs, &index.manifests, &CancellationToken::new()).unwrap()
}

fn options(tool: &str) -> ConvertOptions {
    ConvertOptions::new(
        TestAssets::with_tool(tool),
        Arc::new(ModuleCache::new().unwrap()),
    )
}

// =============================================================================
// Layer Composition Tests
// =============================================================================

#[test]
fn test_later_layer_overwrites_earlier() {
    let temp = TempDir::new().unwrap();
    let image = two_layer_image();
    image.write_to(temp.path());

    let rootfs = temp.path().join("rootfs");
    let applied = compose_into(temp.path(), &rootfs);

    assert_eq!(applied, image.manifest_digest);
    assert_eq!(fs::read(rootfs.join("etc/motd")).unwrap(), b"layer two wins");
    assert_eq!(fs::read(rootfs.join("etc/keep")).unwrap(), b"kept");
}

#[test]
fn test_whiteout_removes_lower_file() {
    let temp = TempDir::new().unwrap();
    let image = SyntheticImage::new(
        &[
            gzip_layer(&[("etc/motd", b"old"), ("etc/other", b"x")]),
            gzip_layer(&[("etc/.wh.motd", b"")]),
        ],
        &["/bin/true"],
    );
    image.write_to(temp.path());

    let rootfs = temp.path().join("rootfs");
    compose_into(temp.path(), &rootfs);

    assert!(!rootfs.join("etc/motd").exists(), "whiteout should delete");
    assert!(!rootfs.join("etc/.wh.motd").exists(), "marker is not written");
    assert!(rootfs.join("etc/other").exists());
}

// =============================================================================
// Full Pipeline Tests
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_convert_packages_four_entries() {
    let temp = TempDir::new().unwrap();
    let work = temp.path().join("work");
    let image = two_layer_image();
    image.write_to(&work);
    let output = temp.path().join("artifact.zip");

    convert::convert(&work, &output, &options(FAKE_SQUASH_WAT))
        .await
        .unwrap();

    assert_eq!(
        common::zip_names(&output),
        vec![
            "config/config.json",
            "config/imageconfig.json",
            "index.json",
            "rootfs.bin"
        ]
    );

    let rootfs = common::zip_entry(&output, "rootfs.bin");
    assert_eq!(&rootfs[0..4], b"hsqs");
    assert_eq!(u16::from_le_bytes([rootfs[20], rootfs[21]]), 1);

    assert_eq!(common::zip_entry(&output, "config/imageconfig.json"), image.config);
    assert_eq!(common::zip_entry(&output, "index.json"), image.index);

    let spec: serde_json::Value =
        serde_json::from_slice(&common::zip_entry(&output, "config/config.json")).unwrap();
    assert_eq!(spec["process"]["args"], serde_json::json!(["/bin/sh", "-c", "cat /etc/motd"]));
    assert!(
        spec["process"]["env"]
            .as_array()
            .unwrap()
            .iter()
            .any(|e| e == "GREETING=hi")
    );

    let files = common::squashed_files(&output);
    assert!(files.contains(&("etc/motd".to_string(), b"layer two wins".to_vec())));
    assert!(files.contains(&("etc/keep".to_string(), b"kept".to_vec())));
}

/// Two images behind a nested index: `plain` without platform
/// information listed first, `arm` with an arm64 platform second.
fn nested_index_image(layout: &Path) -> (SyntheticImage, SyntheticImage) {
    let plain = SyntheticImage::new(&[gzip_layer(&[("from", b"plain")])], &["/plain"]);
    let arm = SyntheticImage::new(&[gzip_layer(&[("from", b"arm")])], &["/arm"]);
    let manifest_size = |image: &SyntheticImage| {
        image
            .blobs
            .iter()
            .find(|(d, _)| *d == image.manifest_digest)
            .map(|(_, data)| data.len())
            .unwrap()
    };

    let nested = serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.index.v1+json",
        "manifests": [
            {
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "digest": plain.manifest_digest,
                "size": manifest_size(&plain),
            },
            {
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "digest": arm.manifest_digest,
                "size": manifest_size(&arm),
                "platform": { "architecture": "arm64", "os": "linux" }
            }
        ]
    }))
    .unwrap();
    let top = serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "manifests": [{
            "mediaType": "application/vnd.oci.image.index.v1+json",
            "digest": common::sha256(&nested),
            "size": nested.len(),
        }]
    }))
    .unwrap();

    plain.write_to(layout);
    arm.write_to(layout);
    let blobs = layout.join("blobs/sha256");
    fs::write(blobs.join(common::sha256(&nested).trim_start_matches("sha256:")), &nested).unwrap();
    fs::write(layout.join("index.json"), &top).unwrap();
    (plain, arm)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_nested_index_config_matches_rootfs() {
    let temp = TempDir::new().unwrap();
    let work = temp.path().join("work");
    let (_plain, arm) = nested_index_image(&work);
    let output = temp.path().join("artifact.zip");

    convert::convert(&work, &output, &options(FAKE_SQUASH_WAT))
        .await
        .unwrap();

    assert_eq!(common::zip_entry(&output, "config/imageconfig.json"), arm.config);
    let spec: serde_json::Value =
        serde_json::from_slice(&common::zip_entry(&output, "config/config.json")).unwrap();
    assert_eq!(spec["process"]["args"], serde_json::json!(["/arm"]));
    assert_eq!(
        common::squashed_files(&output),
        vec![("from".to_string(), b"arm".to_vec())]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bad_squashfs_header_leaves_no_artifact() {
    let temp = TempDir::new().unwrap();
    let work = temp.path().join("work");
    SyntheticImage::hello().write_to(&work);
    let output = temp.path().join("artifact.zip");

    let result = convert::convert(&work, &output, &options(WRONG_COMPRESSION_WAT)).await;

    match result {
        Err(e @ Error::BadSquashfsHeader { .. }) => assert!(e.is_format_error()),
        other => panic!("unexpected: {:?}", other),
    }
    assert!(!output.exists(), "no artifact on failure");
}

#[tokio::test]
async fn test_missing_index_is_format_error() {
    let temp = TempDir::new().unwrap();
    let output = temp.path().join("artifact.zip");

    let result = convert::convert(temp.path(), &output, &options(FAKE_SQUASH_WAT)).await;

    match result {
        Err(e) => {
            assert!(e.is_format_error(), "unexpected: {:?}", e);
            assert!(e.to_string().contains("index.json"));
        }
        Ok(()) => panic!("conversion without an index should fail"),
    }
    assert!(!output.exists());
}

#[tokio::test]
async fn test_cancelled_conversion() {
    let temp = TempDir::new().unwrap();
    let work = temp.path().join("work");
    SyntheticImage::hello().write_to(&work);
    let output = temp.path().join("artifact.zip");

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = convert::convert(&work, &output, &options(FAKE_SQUASH_WAT).with_cancel(cancel)).await;

    assert!(matches!(result, Err(Error::Cancelled)), "got {:?}", result);
    assert!(!output.exists());
}
