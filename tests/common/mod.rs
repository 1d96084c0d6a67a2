//! Shared fixtures for integration tests.
//!
//! Sandboxed modules are WebAssembly text; wasmtime compiles WAT directly.

#![allow(dead_code)]

use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use spinrun::{AssetProvider, Arch, Error, ImageFetcher, Result};
use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

// =============================================================================
// Modules
// =============================================================================

/// Writes "hello\n" to stdout.
pub const HELLO_WAT: &str = r#"
(module
  (import "wasi_snapshot_preview1" "fd_write"
    (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 16) "hello\n")
  (func (export "_start")
    (i32.store (i32.const 0) (i32.const 16))
    (i32.store (i32.const 4) (i32.const 6))
    (drop (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 8)))))
"#;

/// Exits with status 7.
pub const EXIT_7_WAT: &str = r#"
(module
  (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
  (memory (export "memory") 1)
  (func (export "_start")
    (call $proc_exit (i32.const 7))))
"#;

/// Exits with status 0 through `proc_exit`.
pub const EXIT_0_WAT: &str = r#"
(module
  (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
  (memory (export "memory") 1)
  (func (export "_start")
    (call $proc_exit (i32.const 0))))
"#;

/// Exports no entry point.
pub const NO_START_WAT: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "main")))
"#;

/// Spins forever.
pub const BUSY_LOOP_WAT: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "_start")
    (loop $forever (br $forever))))
"#;

/// Traps unconditionally.
pub const TRAP_WAT: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "_start") unreachable))
"#;

/// Stand-in for the squashfs tool.
///
/// Writes a 96-byte superblock (magic "hsqs", gzip compression id) to
/// `rootfs.bin` in the first preopened directory, followed by a verbatim
/// copy of `rootfs.tar`. Tests read the tarball back from offset 96.
pub const FAKE_SQUASH_WAT: &str = r#"
(module
  (import "wasi_snapshot_preview1" "path_open"
    (func $path_open (param i32 i32 i32 i32 i32 i64 i64 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_read"
    (func $fd_read (param i32 i32 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_write"
    (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_close"
    (func $fd_close (param i32) (result i32)))
  (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
  (memory (export "memory") 1)
  (data (i32.const 100) "hsqs")
  (data (i32.const 120) "\01\00")
  (data (i32.const 200) "rootfs.bin")
  (data (i32.const 220) "rootfs.tar")
  (func (export "_start")
    (local $out i32)
    (local $in i32)
    ;; out = path_open(3, "rootfs.bin", CREAT|TRUNC, FD_WRITE)
    (if (call $path_open (i32.const 3) (i32.const 0) (i32.const 200) (i32.const 10)
          (i32.const 9) (i64.const 64) (i64.const 0) (i32.const 0) (i32.const 64))
      (then (call $proc_exit (i32.const 2))))
    (local.set $out (i32.load (i32.const 64)))
    ;; in = path_open(3, "rootfs.tar", 0, FD_READ)
    (if (call $path_open (i32.const 3) (i32.const 0) (i32.const 220) (i32.const 10)
          (i32.const 0) (i64.const 2) (i64.const 0) (i32.const 0) (i32.const 68))
      (then (call $proc_exit (i32.const 3))))
    (local.set $in (i32.load (i32.const 68)))
    ;; superblock
    (i32.store (i32.const 0) (i32.const 100))
    (i32.store (i32.const 4) (i32.const 96))
    (if (call $fd_write (local.get $out) (i32.const 0) (i32.const 1) (i32.const 16))
      (then (call $proc_exit (i32.const 4))))
    ;; copy the tarball after it
    (block $done
      (loop $copy
        (i32.store (i32.const 32) (i32.const 4096))
        (i32.store (i32.const 36) (i32.const 32768))
        (if (call $fd_read (local.get $in) (i32.const 32) (i32.const 1) (i32.const 40))
          (then (call $proc_exit (i32.const 5))))
        (br_if $done (i32.eqz (i32.load (i32.const 40))))
        (i32.store (i32.const 48) (i32.const 4096))
        (i32.store (i32.const 52) (i32.load (i32.const 40)))
        (if (call $fd_write (local.get $out) (i32.const 48) (i32.const 1) (i32.const 56))
          (then (call $proc_exit (i32.const 6))))
        (br $copy)))
    (drop (call $fd_close (local.get $in)))
    (drop (call $fd_close (local.get $out)))))
"#;

/// Writes a superblock naming xz compression (id 4).
pub const WRONG_COMPRESSION_WAT: &str = r#"
(module
  (import "wasi_snapshot_preview1" "path_open"
    (func $path_open (param i32 i32 i32 i32 i32 i64 i64 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_write"
    (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
  (memory (export "memory") 1)
  (data (i32.const 100) "hsqs")
  (data (i32.const 120) "\04\00")
  (data (i32.const 200) "rootfs.bin")
  (func (export "_start")
    (if (call $path_open (i32.const 3) (i32.const 0) (i32.const 200) (i32.const 10)
          (i32.const 9) (i64.const 64) (i64.const 0) (i32.const 0) (i32.const 64))
      (then (call $proc_exit (i32.const 2))))
    (i32.store (i32.const 0) (i32.const 100))
    (i32.store (i32.const 4) (i32.const 96))
    (drop (call $fd_write (i32.load (i32.const 64)) (i32.const 0) (i32.const 1) (i32.const 16)))))
"#;

// =============================================================================
// Assets
// =============================================================================

/// Assets with a fixed compression tool and an optional runtime module.
pub struct TestAssets {
    pub tool: Arc<[u8]>,
    pub runtime: Option<Arc<[u8]>>,
}

impl TestAssets {
    pub fn with_tool(wat: &str) -> Arc<Self> {
        Arc::new(Self {
            tool: wat.as_bytes().into(),
            runtime: None,
        })
    }

    pub fn with_runtime(tool: &str, runtime: &str) -> Arc<Self> {
        Arc::new(Self {
            tool: tool.as_bytes().into(),
            runtime: Some(runtime.as_bytes().into()),
        })
    }
}

impl AssetProvider for TestAssets {
    fn runtime(&self, arch: Arch) -> Result<Arc<[u8]>> {
        self.runtime
            .clone()
            .ok_or_else(|| Error::AssetUnavailable(format!("runtime-{}", arch)))
    }

    fn squashfs_tool(&self) -> Result<Arc<[u8]>> {
        Ok(Arc::clone(&self.tool))
    }
}

// =============================================================================
// Synthetic OCI Images
// =============================================================================

pub const LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// Digest string of `data`.
pub fn sha256(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Gzip-compressed tar holding `files` (path, content), with parent
/// directories created implicitly.
pub fn gzip_layer(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::fast()));
    for (path, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_entry_type(tar::EntryType::Regular);
        builder
            .append_data(&mut header, path, Cursor::new(*content))
            .unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

/// An OCI image layout held in memory.
#[derive(Clone)]
pub struct SyntheticImage {
    pub blobs: Vec<(String, Vec<u8>)>,
    pub index: Vec<u8>,
    pub manifest_digest: String,
    pub config: Vec<u8>,
}

impl SyntheticImage {
    /// Single-manifest image with the given layers, bottom first.
    pub fn new(layers: &[Vec<u8>], cmd: &[&str]) -> Self {
        let config = serde_json::to_vec(&serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "config": {
                "Env": ["PATH=/bin", "GREETING=hi"],
                "Cmd": cmd,
                "WorkingDir": "/"
            },
            "rootfs": { "type": "layers", "diff_ids": [] }
        }))
        .unwrap();

        let mut blobs = vec![(sha256(&config), config.clone())];
        let mut layer_descs = Vec::new();
        for layer in layers {
            let digest = sha256(layer);
            layer_descs.push(serde_json::json!({
                "mediaType": LAYER_GZIP,
                "digest": digest,
                "size": layer.len(),
            }));
            blobs.push((digest, layer.clone()));
        }

        let manifest = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": sha256(&config),
                "size": config.len(),
            },
            "layers": layer_descs,
        }))
        .unwrap();
        let manifest_digest = sha256(&manifest);
        blobs.push((manifest_digest.clone(), manifest.clone()));

        let index = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.index.v1+json",
            "manifests": [{
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "digest": manifest_digest,
                "size": manifest.len(),
                "platform": { "architecture": "amd64", "os": "linux" }
            }]
        }))
        .unwrap();

        Self {
            blobs,
            index,
            manifest_digest,
            config,
        }
    }

    /// One layer holding `/hello.txt` = "hi".
    pub fn hello() -> Self {
        Self::new(&[gzip_layer(&[("hello.txt", b"hi")])], &["/bin/cat", "/hello.txt"])
    }

    pub fn write_to(&self, layout: &Path) {
        let blobs = layout.join("blobs/sha256");
        std::fs::create_dir_all(&blobs).unwrap();
        for (digest, data) in &self.blobs {
            std::fs::write(blobs.join(digest.trim_start_matches("sha256:")), data).unwrap();
        }
        std::fs::write(layout.join("index.json"), &self.index).unwrap();
        std::fs::write(layout.join("oci-layout"), br#"{"imageLayoutVersion":"1.0.0"}"#).unwrap();
    }
}

// =============================================================================
// Mock Fetcher
// =============================================================================

/// Serves one synthetic image for every reference and counts calls.
pub struct MockFetcher {
    pub image: SyntheticImage,
    pub resolves: AtomicUsize,
    pub fetches: AtomicUsize,
    /// Number of upcoming fetches that fail.
    pub failures: AtomicUsize,
    /// Delay before each fetch completes.
    pub delay: Duration,
    /// References that do not resolve.
    pub unknown: Vec<String>,
}

impl MockFetcher {
    pub fn new(image: SyntheticImage) -> Arc<Self> {
        Arc::new(Self::build(image))
    }

    pub fn build(image: SyntheticImage) -> Self {
        Self {
            image,
            resolves: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
            delay: Duration::ZERO,
            unknown: Vec::new(),
        }
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn resolve_count(&self) -> usize {
        self.resolves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageFetcher for MockFetcher {
    async fn resolve(&self, reference: &str) -> Result<String> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        if self.unknown.iter().any(|u| reference.ends_with(u.as_str())) {
            return Err(Error::TransferFailed {
                reference: reference.to_string(),
                reason: "manifest unknown".to_string(),
            });
        }
        Ok(self.image.manifest_digest.clone())
    }

    async fn fetch(&self, reference: &str, layout: &Path) -> Result<()> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::TransferFailed {
                reference: reference.to_string(),
                reason: "connection reset".to_string(),
            });
        }
        self.image.write_to(layout);
        Ok(())
    }
}

// =============================================================================
// Artifacts
// =============================================================================

/// Entry names of a zip file, sorted.
pub fn zip_names(path: &Path) -> Vec<String> {
    let archive = zip::ZipArchive::new(std::fs::File::open(path).unwrap()).unwrap();
    let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
    names.sort();
    names
}

/// Reads one zip entry fully.
pub fn zip_entry(path: &Path, name: &str) -> Vec<u8> {
    use std::io::Read;
    let mut archive = zip::ZipArchive::new(std::fs::File::open(path).unwrap()).unwrap();
    let mut entry = archive.by_name(name).unwrap();
    let mut buf = Vec::new();
    entry.read_to_end(&mut buf).unwrap();
    buf
}

/// Files (relative path, content) of the tarball that the fake squash tool
/// copied behind the superblock.
pub fn squashed_files(artifact: &Path) -> Vec<(String, Vec<u8>)> {
    use std::io::Read;
    let rootfs = zip_entry(artifact, "rootfs.bin");
    let mut archive = tar::Archive::new(Cursor::new(rootfs[96..].to_vec()));
    let mut files = Vec::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        if entry.header().entry_type() != tar::EntryType::Regular {
            continue;
        }
        let path = entry.path().unwrap().to_string_lossy().into_owned();
        let mut data = Vec::new();
        entry.read_to_end(&mut data).unwrap();
        files.push((path, data));
    }
    files
}

/// Writes a zip holding `files` to `path`.
pub fn write_zip(path: &Path, files: &[(&str, &[u8])]) {
    let mut w = zip::ZipWriter::new(std::fs::File::create(path).unwrap());
    for (name, data) in files {
        w.start_file(*name, zip::write::FileOptions::default())
            .unwrap();
        w.write_all(data).unwrap();
    }
    w.finish().unwrap();
}

/// Installs a test log writer once per binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
