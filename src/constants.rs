//! # Runtime Constants
//!
//! Defines the limits, timeouts, path names, media types and magic numbers
//! used across the pull coordinator, the conversion pipeline and the sandbox
//! runtime. These constants are the **single source of truth**: nothing
//! else in the crate hardcodes these values.
//!
//! ## Compatibility
//!
//! Several values are part of persisted or cross-process contracts and must
//! not change without a migration path:
//!
//! - [`IMAGES_DIR`] and the artifact entry names define the on-disk image
//!   store layout. Changing them makes previously pulled images unreadable.
//! - [`SQUASHFS_MAGIC`] and [`SQUASHFS_COMPRESSION_GZIP`] describe the
//!   output of the external compression tool.
//! - [`BUNDLE_MOUNT_POINT`] and the runtime argument flags are read by the
//!   sandboxed runtime binary.
//!
//! ## Cross-References
//!
//! - [`crate::registry`]: TTL, concurrency, queue depth, progress milestones
//! - [`crate::convert`]: artifact layout, media types, squashfs header
//! - [`crate::runtime`]: mount points, argv flags, dial retry policy
//! - [`crate::network`]: default addressing and port probing

use std::time::Duration;

// =============================================================================
// Pull Coordinator
// =============================================================================

/// Lifetime of a resolved `image reference -> digest` cache entry.
///
/// After expiry, [`Registry::path`](crate::registry::Registry::path) reports
/// the image as missing even though its artifact may still be on disk, and
/// the next pull re-resolves the reference against the registry.
pub const DIGEST_CACHE_TTL: Duration = Duration::from_secs(120);

/// Maximum number of concurrent fetch + conversion workers per coordinator.
pub const MAX_CONCURRENT_PULLS: usize = 16;

/// Capacity of the coordinator's inbound request queue.
///
/// `pull()` waits for queue space, so this bounds memory rather than
/// dropping requests.
pub const PULL_QUEUE_DEPTH: usize = 64;

/// Capacity of the worker completion channel.
pub const PULL_COMPLETION_DEPTH: usize = MAX_CONCURRENT_PULLS;

/// Default registry mirrors, tried in order.
pub const DEFAULT_REGISTRIES: &[&str] = &["docker.io"];

/// Upper bound on a single network operation against a registry.
pub const REGISTRY_OP_TIMEOUT: Duration = Duration::from_secs(300);

/// Maximum image reference length in bytes.
pub const MAX_IMAGE_REF_LEN: usize = 512;

// =============================================================================
// Progress Milestones
// =============================================================================
//
// Percentages reported on a pull's progress sink. Consumers must not assume
// every value is delivered: intermediate updates are dropped when the sink
// is full.
// =============================================================================

/// Request accepted by the coordinator.
pub const PROGRESS_QUEUED: u8 = 0;
/// Digest cache miss.
pub const PROGRESS_NOT_CACHED: u8 = 1;
/// Waiting for a worker slot.
pub const PROGRESS_WAITING: u8 = 2;
/// Resolving the reference against the mirrors.
pub const PROGRESS_RESOLVING: u8 = 3;
/// Reference resolved to a digest.
pub const PROGRESS_RESOLVED: u8 = 10;
/// Image blobs fetched into the work directory.
pub const PROGRESS_FETCHED: u8 = 50;
/// Execution spec derived from the image configuration.
pub const PROGRESS_SPEC: u8 = 55;
/// Layers applied onto the root filesystem.
pub const PROGRESS_LAYERS: u8 = 65;
/// Root filesystem serialized to a tarball.
pub const PROGRESS_TARBALL: u8 = 70;
/// Compression tool compiled.
pub const PROGRESS_TOOL_READY: u8 = 73;
/// Squashfs image produced and validated.
pub const PROGRESS_SQUASHED: u8 = 90;
/// Artifact packaged.
pub const PROGRESS_PACKAGED: u8 = 98;
/// Digest inserted into the cache.
pub const PROGRESS_CACHED: u8 = 99;
/// Pull finished (successfully or not).
pub const PROGRESS_COMPLETE: u8 = 100;

// =============================================================================
// Image Store Layout
// =============================================================================

/// Default store root directory name under the user's home directory.
pub const DEFAULT_ROOT_DIR: &str = ".spin";

/// Subdirectory of the store root holding packaged artifacts.
pub const IMAGES_DIR: &str = "images";

/// Subdirectory of the store root holding serialized compiled modules.
pub const MODULES_DIR: &str = "modules";

/// Prefix of per-pull work directories under the system temp directory.
pub const PULL_WORK_PREFIX: &str = "spin-pull-";

/// Suffix for in-progress artifact writes (renamed on commit).
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Prefix of shared bundle extraction directories under a scratch root.
pub const BUNDLE_CACHE_PREFIX: &str = "spin-bundle-";

// =============================================================================
// Artifact Entries
// =============================================================================

/// Squashfs root filesystem entry.
pub const ROOTFS_BIN: &str = "rootfs.bin";

/// Intermediate root filesystem tarball (never packaged).
pub const ROOTFS_TAR: &str = "rootfs.tar";

/// Composed root filesystem directory inside the work directory.
pub const ROOTFS_DIR: &str = "rootfs";

/// OCI layout index entry.
pub const INDEX_JSON: &str = "index.json";

/// OCI layout marker file.
pub const OCI_LAYOUT_FILE: &str = "oci-layout";

/// Derived execution spec entry.
pub const CONFIG_JSON: &str = "config/config.json";

/// Raw image configuration entry.
pub const IMAGE_CONFIG_JSON: &str = "config/imageconfig.json";

/// Directory holding the two config entries.
pub const CONFIG_DIR: &str = "config";

/// Content-addressed blob directory inside an OCI layout.
pub const BLOBS_SHA256_DIR: &str = "blobs/sha256";

/// The exact set of entries a packaged artifact contains, in write order.
pub const ARTIFACT_ENTRIES: [&str; 4] = [ROOTFS_BIN, INDEX_JSON, CONFIG_JSON, IMAGE_CONFIG_JSON];

// =============================================================================
// Size Limits
// =============================================================================

/// Maximum manifest, index or configuration blob size (4 MiB).
pub const MAX_MANIFEST_SIZE: u64 = 4 * 1024 * 1024;

/// Maximum size of a single config or layer blob fetched from a registry
/// (512 MiB). Checked against the descriptor before the pull starts and
/// against the bytes received while it runs.
pub const MAX_LAYER_SIZE: u64 = 512 * 1024 * 1024;

/// Maximum number of layers applied from a single manifest.
pub const MAX_LAYERS: usize = 128;

/// Maximum manifest-list nesting depth followed during layer composition.
pub const MAX_INDEX_DEPTH: usize = 8;

/// Maximum total size of a composed root filesystem (8 GiB).
///
/// Enforced while applying layers, accumulating across all of them, so a
/// compression bomb fails the conversion instead of filling the disk.
pub const MAX_ROOTFS_SIZE: u64 = 8 * 1024 * 1024 * 1024;

/// Maximum size of an archive entry extracted into memory (512 MiB).
pub const MAX_ARCHIVE_ENTRY_SIZE: u64 = 512 * 1024 * 1024;

// =============================================================================
// Media Types
// =============================================================================

/// OCI image manifest.
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
/// OCI image index.
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
/// Docker schema 2 manifest.
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
/// Docker schema 2 manifest list.
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
/// OCI image configuration.
pub const MEDIA_TYPE_OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
/// Docker container image configuration.
pub const MEDIA_TYPE_DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";

/// Layer media type prefixes accepted as filesystem layers.
pub const LAYER_MEDIA_TYPE_PREFIXES: &[&str] = &[
    "application/vnd.oci.image.layer.",
    "application/vnd.docker.image.rootfs.",
];

/// Manifest media types requested from registries.
pub const ACCEPTED_MANIFEST_TYPES: &[&str] = &[
    MEDIA_TYPE_OCI_INDEX,
    MEDIA_TYPE_OCI_MANIFEST,
    MEDIA_TYPE_DOCKER_MANIFEST_LIST,
    MEDIA_TYPE_DOCKER_MANIFEST,
];

/// Default `PATH` of derived execution specs.
pub const DEFAULT_PATH_ENV: &str =
    "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// OCI runtime spec version written to derived execution specs.
pub const OCI_RUNTIME_SPEC_VERSION: &str = "1.1.0";

/// OCI layout version written to `oci-layout`.
pub const OCI_LAYOUT_VERSION: &str = "1.0.0";

// =============================================================================
// Layer Composition
// =============================================================================

/// Prefix marking a whiteout entry that deletes its sibling.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Entry name that clears its directory before the layer's own entries.
pub const WHITEOUT_OPAQUE: &str = ".wh..wh..opq";

/// Gzip stream magic.
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Zstandard frame magic.
pub const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

// =============================================================================
// Squashfs Contract
// =============================================================================

/// Squashfs superblock magic ("hsqs"), little-endian at offset 0.
pub const SQUASHFS_MAGIC: u32 = 0x7371_7368;

/// Squashfs compression id for gzip, little-endian u16 at offset 20.
pub const SQUASHFS_COMPRESSION_GZIP: u16 = 1;

/// Offset of the compression id in the superblock.
pub const SQUASHFS_COMPRESSION_OFFSET: usize = 20;

/// Size of the squashfs superblock.
pub const SQUASHFS_SUPERBLOCK_SIZE: usize = 96;

/// Mount point of the work directory inside the compression tool sandbox.
pub const SQUASH_WORK_MOUNT: &str = "/mnt";

/// Command run inside the compression tool sandbox.
///
/// Reads the intermediate tarball and writes the squashfs image next to it.
pub const SQUASH_COMMAND: &[&str] = &[
    "/bin/sh",
    "-c",
    "/bin/sqfstar -quiet -no-progress -Xcompression-level 1 -Xstrategy fixed -mem 512M /mnt/rootfs.bin < /mnt/rootfs.tar",
];

// =============================================================================
// Sandbox Runtime
// =============================================================================

/// Mount point of an image bundle inside a runtime-mode sandbox.
pub const BUNDLE_MOUNT_POINT: &str = "/ext/bundle";

/// Fixed sandbox root path written into derived execution specs.
pub const SANDBOX_ROOTFS_PATH: &str = "/run/rootfs";

/// Entry-point export invoked by `Container::run`.
pub const ENTRY_POINT: &str = "_start";

/// First argument of a runtime-mode sandbox.
pub const RUNTIME_ARG0: &str = "vm";

/// First argument of a single-module sandbox.
pub const MODULE_ARG0: &str = "module";

/// Runtime flag passed when the container has no stdin.
pub const FLAG_NO_STDIN: &str = "-no-stdin";

/// Runtime flag passed when the container is networked.
pub const FLAG_NET_SOCKET: &str = "-net=socket";

/// Guest file descriptor of the preopened network listener.
pub const NETWORK_LISTENER_FD: u32 = 3;

/// Interval between epoch ticks used for cooperative cancellation.
pub const EPOCH_TICK: Duration = Duration::from_millis(10);

/// Extension of serialized compiled modules in the on-disk module cache.
pub const COMPILED_MODULE_EXT: &str = "cwasm";

/// Zip entries holding the bundled sandbox binaries.
pub const ASSET_RUNTIME_AMD64: &str = "runtime-amd64.wasm";
/// See [`ASSET_RUNTIME_AMD64`].
pub const ASSET_RUNTIME_RISCV64: &str = "runtime-riscv64.wasm";
/// See [`ASSET_RUNTIME_AMD64`].
pub const ASSET_SQUASHFS_TOOL: &str = "squashfs-tools.wasm";

// =============================================================================
// Network Bring-up
// =============================================================================

/// Number of attempts to dial the sandbox's network listener.
pub const NETWORK_DIAL_ATTEMPTS: usize = 100;

/// Delay between dial attempts.
pub const NETWORK_DIAL_INTERVAL: Duration = Duration::from_millis(100);

/// Maximum random ports tried before giving up on a free listener port.
pub const PORT_BIND_ATTEMPTS: usize = 64;

/// Default port range searched for the sandbox listener.
pub const DEFAULT_PORT_RANGE: (u16, u16) = (20000, 60000);

/// Default guest subnet.
pub const DEFAULT_SUBNET: &str = "192.168.127.0/24";

/// Default guest address.
pub const DEFAULT_GUEST_IP: &str = "192.168.127.2";

/// Default guest link address.
pub const DEFAULT_GUEST_MAC: &str = "5a:94:ef:e4:0c:ee";

/// Link address of the virtual gateway.
pub const GATEWAY_MAC: &str = "5a:94:ef:e4:0c:dd";

/// Default upstream DNS resolver used by the gateway's DNS relay.
pub const DEFAULT_DNS_UPSTREAM: &str = "1.1.1.1:53";

/// Gateway port relayed to the upstream resolver.
pub const DNS_PORT: u16 = 53;

/// MTU advertised to the guest.
pub const NETWORK_MTU: u16 = 1500;

/// DHCP lease duration in seconds.
pub const DHCP_LEASE_SECS: u32 = 3600;

/// Maximum frame length accepted on the link.
pub const MAX_FRAME_LEN: usize = 65_535;

/// Receive window advertised by the gateway's TCP terminator.
pub const TCP_WINDOW: u16 = 65_535;

/// Maximum TCP payload per segment sent to the guest.
pub const TCP_MSS: usize = 1460;

/// Host bytes a TCP flow may queue for the guest before the host socket
/// stops being read.
pub const TCP_PENDING_LIMIT: usize = 2 * TCP_WINDOW as usize;

/// Idle timeout for UDP NAT flows.
pub const UDP_FLOW_IDLE: Duration = Duration::from_secs(60);

/// Channel depth between relay tasks and the frame switch.
pub const SWITCH_QUEUE_DEPTH: usize = 256;

// =============================================================================
// Container Names
// =============================================================================

/// Maximum container name length.
pub const MAX_CONTAINER_NAME_LEN: usize = 128;

/// Validates a container name.
///
/// Names are used as table keys and in log lines, so they are restricted to
/// ASCII alphanumerics plus `-`, `_` and `.`.
pub fn validate_container_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("container name cannot be empty".to_string());
    }
    if name.len() > MAX_CONTAINER_NAME_LEN {
        return Err(format!(
            "container name exceeds {} characters",
            MAX_CONTAINER_NAME_LEN
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(format!("container name '{}' contains invalid characters", name));
    }
    Ok(())
}
