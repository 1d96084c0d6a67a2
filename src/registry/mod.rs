//! # Registry / Pull Coordinator
//!
//! Pulls images at most once per digest, converts them into packaged sandbox
//! images and remembers which digest each reference resolved to.
//!
//! ## Architecture
//!
//! ```text
//!  pull() ──┐                        ┌── worker ── fetch ── convert ──┐
//!  pull() ──┼─► request queue ─► actor ── worker ...                  │
//!  pull() ──┘        (64)          ▲   (semaphore, 16)                │
//!                                  └──────── completion channel ◄─────┘
//!  path() ── read lock ── DigestCache (TTL 120 s)
//! ```
//!
//! Concurrent pulls of one reference share a single worker. The actor's
//! reply policy is described in [`actor`]: success fans out to every
//! waiter, failure goes to the first waiter only and the next one retries.
//!
//! ## Reference Validation
//!
//! References are checked before they are queued:
//! - Length check against [`MAX_IMAGE_REF_LEN`]
//! - Character allowlist (alphanumeric plus `/:.-_@`)
//!
//! ## Example
//!
//! ```rust,ignore
//! let registry = Registry::new(
//!     RegistryConfig::default().with_assets(assets),
//!     Arc::new(OciFetcher::new()),
//! )?;
//! registry.pull("library/alpine:latest", None).await?;
//! let artifact = registry.path("library/alpine:latest")?;
//! registry.close().await;
//! ```

mod actor;
pub mod cache;
pub mod fetch;

pub use cache::DigestCache;
pub use fetch::{ImageFetcher, OciFetcher};

use crate::assets::AssetProvider;
use crate::constants::{
    DEFAULT_REGISTRIES, DIGEST_CACHE_TTL, MAX_CONCURRENT_PULLS, MAX_IMAGE_REF_LEN, MODULES_DIR,
    PROGRESS_COMPLETE, PROGRESS_QUEUED, PULL_QUEUE_DEPTH,
};
use crate::error::{Error, Result};
use crate::progress::ProgressSink;
use crate::runtime::{ImageSource, ModuleCache};
use crate::storage::ImageStore;
use actor::{Actor, PullContext, PullRequest};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Pull coordinator configuration.
#[derive(Clone)]
pub struct RegistryConfig {
    /// Store root; artifacts land in `<root>/images`.
    pub root: PathBuf,
    /// Registry mirrors, tried in order.
    pub mirrors: Vec<String>,
    pub ttl: Duration,
    pub max_concurrent_pulls: usize,
    pub queue_depth: usize,
    /// Provider of the compression tool. Conversions fail without one.
    pub assets: Option<Arc<dyn AssetProvider>>,
    /// Module cache for the compression tool. Defaults to a disk cache
    /// under `<root>/modules`.
    pub modules: Option<Arc<ModuleCache>>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            root: ImageStore::default_root(),
            mirrors: DEFAULT_REGISTRIES.iter().map(|s| s.to_string()).collect(),
            ttl: DIGEST_CACHE_TTL,
            max_concurrent_pulls: MAX_CONCURRENT_PULLS,
            queue_depth: PULL_QUEUE_DEPTH,
            assets: None,
            modules: None,
        }
    }
}

impl RegistryConfig {
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn with_mirrors<I, S>(mut self, mirrors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.mirrors = mirrors.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_max_concurrent_pulls(mut self, n: usize) -> Self {
        self.max_concurrent_pulls = n;
        self
    }

    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    pub fn with_assets(mut self, assets: Arc<dyn AssetProvider>) -> Self {
        self.assets = Some(assets);
        self
    }

    pub fn with_module_cache(mut self, modules: Arc<ModuleCache>) -> Self {
        self.modules = Some(modules);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.max_concurrent_pulls == 0 {
            return Err(Error::InvalidOption(
                "max_concurrent_pulls must be at least 1".to_string(),
            ));
        }
        if self.queue_depth == 0 {
            return Err(Error::InvalidOption("queue_depth must be at least 1".to_string()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for RegistryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryConfig")
            .field("root", &self.root)
            .field("mirrors", &self.mirrors)
            .field("ttl", &self.ttl)
            .field("max_concurrent_pulls", &self.max_concurrent_pulls)
            .field("queue_depth", &self.queue_depth)
            .field("assets", &self.assets.is_some())
            .finish_non_exhaustive()
    }
}

struct RegistryInner {
    requests: mpsc::Sender<PullRequest>,
    cache: DigestCache,
    store: ImageStore,
    token: CancellationToken,
    actor: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Handle to a pull coordinator. Clones share the same actor.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    /// Opens the store and starts the actor on the current tokio runtime.
    pub fn new(config: RegistryConfig, fetcher: Arc<dyn ImageFetcher>) -> Result<Self> {
        config.validate()?;
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::Internal("registry requires a tokio runtime".to_string()))?;

        let store = ImageStore::with_root(&config.root)?;
        let modules = match config.modules {
            Some(modules) => modules,
            None => Arc::new(ModuleCache::with_disk_cache(config.root.join(MODULES_DIR))?),
        };

        let cache = DigestCache::new(config.ttl);
        let token = CancellationToken::new();
        let (tx, rx) = mpsc::channel(config.queue_depth);
        let ctx = Arc::new(PullContext {
            fetcher,
            store: store.clone(),
            mirrors: config.mirrors,
            assets: config.assets,
            modules,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_pulls)),
        });

        let actor = Actor::new(rx, cache.clone(), ctx, token.clone());
        let join = handle.spawn(actor.run());

        info!("Registry started at {}", config.root.display());
        Ok(Self {
            inner: Arc::new(RegistryInner {
                requests: tx,
                cache,
                store,
                token,
                actor: Mutex::new(Some(join)),
            }),
        })
    }

    /// Resolves and materializes `image` locally.
    ///
    /// Returns once the image is in the digest cache. Dropping the returned
    /// future withdraws the request. The progress stream, if given, ends
    /// with [`PullProgress::Done`](crate::progress::PullProgress::Done)
    /// whatever the outcome.
    pub async fn pull(&self, image: &str, progress: Option<ProgressSink>) -> Result<()> {
        let progress = progress.unwrap_or_default();
        let result = self.request(image, &progress).await;
        match &result {
            Ok(()) => progress.push(PROGRESS_COMPLETE),
            Err(e) => progress.push_error(PROGRESS_COMPLETE, e),
        }
        progress.done();
        result
    }

    async fn request(&self, image: &str, progress: &ProgressSink) -> Result<()> {
        validate_reference(image)?;
        progress.push(PROGRESS_QUEUED);
        debug!(image = %image, "Queueing pull");

        let cancel = CancellationToken::new();
        let _guard = cancel.clone().drop_guard();
        let (reply, rx) = oneshot::channel();
        let request = PullRequest {
            image: image.to_string(),
            cancel,
            reply,
            progress: progress.clone(),
        };

        self.inner
            .requests
            .send(request)
            .await
            .map_err(|_| Error::RegistryClosed)?;
        rx.await.map_err(|_| Error::RegistryClosed)?
    }

    /// Returns the artifact path of a pulled image.
    ///
    /// Only images whose digest is live in the cache are reported; after
    /// the TTL this returns [`Error::ImageNotFound`] even if the artifact
    /// is still on disk.
    pub fn path(&self, image: &str) -> Result<PathBuf> {
        let digest = self
            .inner
            .cache
            .get(image)
            .ok_or_else(|| Error::ImageNotFound(image.to_string()))?;
        let path = self.inner.store.artifact_path(&digest)?;
        if !path.is_file() {
            return Err(Error::ImageNotFound(image.to_string()));
        }
        Ok(path)
    }

    /// Stops the actor and waits for in-flight pulls to unwind.
    pub async fn close(&self) {
        self.inner.token.cancel();
        let join = match self.inner.actor.lock() {
            Ok(mut actor) => actor.take(),
            Err(_) => None,
        };
        if let Some(join) = join {
            let _ = join.await;
            info!("Registry closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    pub fn store(&self) -> &ImageStore {
        &self.inner.store
    }

    pub fn cache(&self) -> &DigestCache {
        &self.inner.cache
    }
}

impl ImageSource for Registry {
    fn path(&self, image: &str) -> Result<PathBuf> {
        Registry::path(self, image)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("root", &self.inner.store.root())
            .field("cached", &self.inner.cache.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Validates an image reference before it is queued.
pub fn validate_reference(image: &str) -> Result<()> {
    if image.is_empty() {
        return Err(Error::InvalidImageReference {
            reference: image.to_string(),
            reason: "reference is empty".to_string(),
        });
    }
    if image.len() > MAX_IMAGE_REF_LEN {
        return Err(Error::InvalidImageReference {
            reference: image.chars().take(64).collect(),
            reason: format!("reference exceeds {} bytes", MAX_IMAGE_REF_LEN),
        });
    }
    if !image
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | ':' | '.' | '-' | '_' | '@'))
    {
        return Err(Error::InvalidImageReference {
            reference: image.to_string(),
            reason: "reference contains invalid characters".to_string(),
        });
    }
    Ok(())
}
