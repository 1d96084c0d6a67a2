//! Error types for the sandboxed container runtime.

use std::path::PathBuf;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while pulling, converting or running images.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Resolution Errors
    // =========================================================================
    /// Failed to parse image reference.
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidImageReference { reference: String, reason: String },

    /// Image could not be resolved on any configured mirror.
    #[error("failed to resolve image '{reference}' on any registry: {reason}")]
    ImageNotResolved { reference: String, reason: String },

    /// Image is not in the digest cache (expired or never pulled).
    #[error("image '{0}' not found, pull it first")]
    ImageNotFound(String),

    // =========================================================================
    // Transfer Errors
    // =========================================================================
    /// Fetching image blobs failed.
    #[error("failed to fetch image '{reference}': {reason}")]
    TransferFailed { reference: String, reason: String },

    /// Pull coordinator is shut down.
    #[error("registry is closed")]
    RegistryClosed,

    // =========================================================================
    // Format Errors
    // =========================================================================
    /// Malformed index, manifest, config or archive.
    #[error("invalid format at {path}: {reason}")]
    InvalidFormat { path: PathBuf, reason: String },

    /// Descriptor with a media type the pipeline cannot handle.
    #[error("unsupported media type '{media_type}' for {digest}")]
    UnsupportedMediaType { media_type: String, digest: String },

    /// Layer decompression or application failed.
    #[error("failed to apply layer {digest}: {reason}")]
    LayerApplyFailed { digest: String, reason: String },

    /// Mount source is neither a directory, a zip nor a tar archive.
    #[error("unsupported file format for mount source {0}")]
    UnsupportedMount(PathBuf),

    /// Compression tool produced an incompatible image.
    #[error("bad squashfs image at {path}: {reason}")]
    BadSquashfsHeader { path: PathBuf, reason: String },

    /// Named entry missing from an archive.
    #[error("entry '{entry}' not found in archive")]
    ArchiveEntryNotFound { entry: String },

    // =========================================================================
    // Sandbox Errors
    // =========================================================================
    /// Module failed to compile.
    #[error("failed to compile module: {0}")]
    CompileFailed(String),

    /// Module failed to instantiate.
    #[error("failed to instantiate container '{container}': {reason}")]
    InstantiateFailed { container: String, reason: String },

    /// Module does not export an entry point.
    #[error("container '{0}' has no entry point")]
    NoEntryPoint(String),

    /// Sandbox exited cleanly with a nonzero status.
    #[error("container '{container}' exited with status {status}")]
    ExitStatus { container: String, status: i32 },

    /// Sandbox trapped.
    #[error("executing container '{container}' failed: {reason}")]
    ExecutionFailed { container: String, reason: String },

    /// Container name already taken in its runtime.
    #[error("container '{0}' already exists")]
    ContainerAlreadyExists(String),

    /// Invalid container or runtime option.
    #[error("invalid option: {0}")]
    InvalidOption(String),

    /// Operation in the wrong lifecycle state.
    #[error("container '{container}' is {state}, cannot {operation}")]
    InvalidState {
        container: String,
        state: String,
        operation: String,
    },

    /// Runtime has been closed.
    #[error("runtime is closed")]
    RuntimeClosed,

    /// Sandbox asset not provided.
    #[error("sandbox asset '{0}' not available")]
    AssetUnavailable(String),

    // =========================================================================
    // Network Errors
    // =========================================================================
    /// Invalid subnet, address, MAC or forward rule.
    #[error("invalid network configuration: {0}")]
    InvalidNetworkConfig(String),

    /// Could not connect to the sandbox's network listener.
    #[error("network unreachable for container '{container}': {reason}")]
    NetworkUnreachable { container: String, reason: String },

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Storage initialization failed.
    #[error("failed to initialize storage at {path}: {reason}")]
    StorageInitFailed { path: PathBuf, reason: String },

    /// Storage write failed.
    #[error("failed to write to storage: {0}")]
    StorageWriteFailed(String),

    /// Invalid digest string.
    #[error("invalid digest '{0}'")]
    InvalidDigest(String),

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    // =========================================================================
    // Cancellation Errors
    // =========================================================================
    /// Operation was cancelled by its caller or owner.
    #[error("operation cancelled")]
    Cancelled,

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true for format errors, which reproduce on retry.
    pub fn is_format_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidFormat { .. }
                | Error::UnsupportedMediaType { .. }
                | Error::LayerApplyFailed { .. }
                | Error::UnsupportedMount(_)
                | Error::BadSquashfsHeader { .. }
                | Error::ArchiveEntryNotFound { .. }
        )
    }

    pub(crate) fn format(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Error::InvalidFormat {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(e: zip::result::ZipError) -> Self {
        match e {
            zip::result::ZipError::Io(io) => Error::Io(io),
            zip::result::ZipError::FileNotFound => Error::ArchiveEntryNotFound {
                entry: "<unknown>".to_string(),
            },
            other => Error::Serialization(other.to_string()),
        }
    }
}
