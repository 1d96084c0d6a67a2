//! # Sandbox Runtime
//!
//! A [`Spin`] compiles exactly one WebAssembly module and spawns any number
//! of independent [`Container`]s from it. Containers share the compiled
//! module and the engine of the runtime's [`ModuleCache`]; they never share
//! state with each other.
//!
//! ## Modes
//!
//! | Built with                         | Mode          | Images | argv[0]   |
//! |------------------------------------|---------------|--------|-----------|
//! | [`SpinBuilder::runtime`]           | general       | yes    | `vm`      |
//! | [`SpinBuilder::module`] and kin    | single module | no     | `module`  |
//!
//! A general runtime boots an image bundle mounted at `/ext/bundle`. In
//! that mode the argument vector also carries `-no-stdin` when the
//! container has no stdin and `-net=socket` when it is networked.
//!
//! ## Lifecycle
//!
//! ```text
//!   build()            close()
//!  ─────────► Compiled ───────► Closing ───(containers stopped)──► Closed
//!
//!   create()          run()            stop()
//!  ─────────► Created ──────► Running ──────► Stopped
//!                 │                              ▲
//!                 └──────────── stop() ──────────┘
//! ```
//!
//! [`Spin::close`] only requests cancellation. It spawns each live
//! container's stop and returns without waiting, so it is safe to call from
//! code that is itself driving a container's `run()`.
//!
//! ## Example
//!
//! ```rust,ignore
//! let spin = Spin::builder()
//!     .runtime(Arch::Amd64)
//!     .assets(assets)
//!     .image_source(registry.clone())
//!     .build()?;
//!
//! let c = spin.container().image("library/alpine:latest").create().await?;
//! c.run().await?;
//! c.stop().await;
//! ```

pub mod cache;
pub mod container;
pub mod mounts;
pub mod names;
pub mod options;
pub mod release;
pub mod stdio;

pub use cache::ModuleCache;
pub use container::Container;
pub use options::{ContainerBuilder, ContainerConfig, ImageSelection};
pub use release::ReleaseStack;
pub use stdio::SharedBuffer;

use crate::archive::ArchiveReader;
use crate::assets::AssetProvider;
use crate::error::{Error, Result};
use crate::platform::Arch;
use container::ContainerCore;
use mounts::BundleCache;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use wasi_common::WasiCtx;
use wasmtime::{Linker, Module};

/// Resolves pulled images to packaged artifacts.
///
/// Implemented by [`Registry`](crate::registry::Registry). The runtime only
/// sees this trait, so it has no dependency on how images are pulled.
pub trait ImageSource: Send + Sync {
    /// Returns the artifact path of a pulled image.
    fn path(&self, image: &str) -> Result<PathBuf>;
}

/// Where the runtime's module comes from.
#[derive(Debug, Clone)]
pub enum ModuleSource {
    /// General-purpose runtime for an architecture, loaded from assets.
    Runtime(Arch),
    /// Module bytes (binary or text format).
    Bytes(Arc<[u8]>),
    /// Module file on disk.
    File(PathBuf),
    /// Named entry of a zip file.
    ZipEntry { zip: PathBuf, entry: String },
}

/// Whether a runtime accepts image bundles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Runtime,
    Module,
}

/// Per-store host state.
pub(crate) struct SandboxState {
    pub(crate) wasi: WasiCtx,
}

/// Builder for [`Spin`].
#[derive(Default)]
pub struct SpinBuilder {
    source: Option<ModuleSource>,
    cache: Option<Arc<ModuleCache>>,
    assets: Option<Arc<dyn AssetProvider>>,
    images: Option<Arc<dyn ImageSource>>,
    parent: Option<CancellationToken>,
}

impl SpinBuilder {
    /// Uses the general-purpose runtime for `arch` (the default is amd64).
    pub fn runtime(mut self, arch: Arch) -> Self {
        self.source = Some(ModuleSource::Runtime(arch));
        self
    }

    /// Uses a single-purpose module.
    pub fn module(mut self, source: impl Into<Arc<[u8]>>) -> Self {
        self.source = Some(ModuleSource::Bytes(source.into()));
        self
    }

    /// Uses a single-purpose module read from a file.
    pub fn module_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.source = Some(ModuleSource::File(path.into()));
        self
    }

    /// Uses a single-purpose module stored as an entry of a zip file.
    pub fn module_zip(mut self, zip: impl Into<PathBuf>, entry: impl Into<String>) -> Self {
        self.source = Some(ModuleSource::ZipEntry {
            zip: zip.into(),
            entry: entry.into(),
        });
        self
    }

    /// Shares a compiled-module cache with other runtimes.
    pub fn module_cache(mut self, cache: Arc<ModuleCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Provides the runtime binaries.
    pub fn assets(mut self, assets: Arc<dyn AssetProvider>) -> Self {
        self.assets = Some(assets);
        self
    }

    /// Enables `ContainerBuilder::image` lookups.
    pub fn image_source(mut self, images: Arc<dyn ImageSource>) -> Self {
        self.images = Some(images);
        self
    }

    /// Derives the runtime's lifetime from `parent`.
    pub fn parent_token(mut self, parent: CancellationToken) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Loads and compiles the module.
    pub fn build(self) -> Result<Spin> {
        let source = self.source.unwrap_or(ModuleSource::Runtime(Arch::default()));
        let mode = match source {
            ModuleSource::Runtime(_) => Mode::Runtime,
            _ => Mode::Module,
        };

        let bytes = load_source(&source, self.assets.as_deref())?;

        let cache = match self.cache {
            Some(cache) => cache,
            None => Arc::new(ModuleCache::new()?),
        };
        let module = cache.compile(&bytes)?;

        let mut linker: Linker<SandboxState> = Linker::new(cache.engine());
        wasi_common::sync::add_to_linker(&mut linker, |s: &mut SandboxState| &mut s.wasi)
            .map_err(|e| Error::Internal(format!("instantiating host module failed: {}", e)))?;

        let cancel = match self.parent {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };

        info!("Runtime ready ({:?} mode)", mode);

        Ok(Spin {
            inner: Arc::new(SpinInner {
                cache,
                module,
                linker,
                mode,
                images: self.images,
                cancel,
                containers: RwLock::new(HashMap::new()),
                bundles: Arc::new(BundleCache::new()),
                closed: AtomicBool::new(false),
            }),
        })
    }
}

fn load_source(source: &ModuleSource, assets: Option<&dyn AssetProvider>) -> Result<Arc<[u8]>> {
    match source {
        ModuleSource::Runtime(arch) => match assets {
            Some(assets) => assets.runtime(*arch),
            None => Err(Error::AssetUnavailable(format!("runtime-{}", arch))),
        },
        ModuleSource::Bytes(bytes) => Ok(Arc::clone(bytes)),
        ModuleSource::File(path) => read_module_file(path),
        ModuleSource::ZipEntry { zip, entry } => ArchiveReader::open(zip)?.entry(entry),
    }
}

fn read_module_file(path: &Path) -> Result<Arc<[u8]>> {
    std::fs::read(path)
        .map(Into::into)
        .map_err(|e| Error::InvalidOption(format!("reading module {} failed: {}", path.display(), e)))
}

/// Shared runtime state, referenced by every container it spawned.
pub(crate) struct SpinInner {
    pub(crate) cache: Arc<ModuleCache>,
    pub(crate) module: Module,
    pub(crate) linker: Linker<SandboxState>,
    pub(crate) mode: Mode,
    pub(crate) images: Option<Arc<dyn ImageSource>>,
    pub(crate) cancel: CancellationToken,
    pub(crate) containers: RwLock<HashMap<String, Arc<ContainerCore>>>,
    pub(crate) bundles: Arc<BundleCache>,
    closed: AtomicBool,
}

impl SpinInner {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn is_runtime(&self) -> bool {
        self.mode == Mode::Runtime
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.containers
            .read()
            .map(|t| t.contains_key(name))
            .unwrap_or(false)
    }

    pub(crate) fn remove(&self, name: &str) {
        if let Ok(mut table) = self.containers.write() {
            table.remove(name);
        }
    }
}

/// Sandbox runtime.
#[derive(Clone)]
pub struct Spin {
    inner: Arc<SpinInner>,
}

impl Spin {
    pub fn builder() -> SpinBuilder {
        SpinBuilder::default()
    }

    /// Starts configuring a new container.
    pub fn container(&self) -> ContainerBuilder {
        ContainerBuilder::new(Arc::clone(&self.inner))
    }

    pub fn mode(&self) -> Mode {
        self.inner.mode
    }

    /// The runtime's compiled-module cache.
    pub fn module_cache(&self) -> &Arc<ModuleCache> {
        &self.inner.cache
    }

    /// Number of live containers.
    pub fn len(&self) -> usize {
        self.inner.containers.read().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if a live container is named `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.inner.contains(name)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Cancels the runtime and requests every live container to stop.
    ///
    /// Does not wait for the containers. New containers cannot be created
    /// afterwards.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cancel.cancel();

        let live: Vec<Arc<ContainerCore>> = match self.inner.containers.read() {
            Ok(table) => table.values().cloned().collect(),
            Err(_) => Vec::new(),
        };
        debug!("Closing runtime with {} live containers", live.len());

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            for core in live {
                handle.spawn(async move { core.stop().await });
            }
        }
    }
}
