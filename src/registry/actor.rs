//! The pull actor and its workers.
//!
//! One actor task owns the pending-waiter table and is the only writer of
//! the [`DigestCache`]. Workers run the fetch and conversion for one image
//! and report back on the completion channel; they never touch the table.
//!
//! ## Outcomes
//!
//! | Worker result | Waiters replied to        | Remaining waiters                  |
//! |---------------|---------------------------|------------------------------------|
//! | success       | all, after caching digest | none                               |
//! | failure       | the first only            | next live waiter starts a new pull |

use super::cache::DigestCache;
use super::fetch::ImageFetcher;
use crate::assets::AssetProvider;
use crate::constants::{
    PROGRESS_CACHED, PROGRESS_FETCHED, PROGRESS_NOT_CACHED, PROGRESS_RESOLVED,
    PROGRESS_RESOLVING, PROGRESS_WAITING, PULL_COMPLETION_DEPTH, PULL_WORK_PREFIX,
};
use crate::convert::{self, ConvertOptions};
use crate::error::{Error, Result};
use crate::progress::ProgressSink;
use crate::runtime::ModuleCache;
use crate::storage::ImageStore;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One caller of `Registry::pull`.
pub(crate) struct PullRequest {
    pub(crate) image: String,
    /// Cancelled when the caller stops waiting.
    pub(crate) cancel: CancellationToken,
    pub(crate) reply: oneshot::Sender<Result<()>>,
    pub(crate) progress: ProgressSink,
}

/// What a worker needs, shared by all workers of one registry.
pub(crate) struct PullContext {
    pub(crate) fetcher: Arc<dyn ImageFetcher>,
    pub(crate) store: ImageStore,
    pub(crate) mirrors: Vec<String>,
    pub(crate) assets: Option<Arc<dyn AssetProvider>>,
    pub(crate) modules: Arc<ModuleCache>,
    pub(crate) semaphore: Arc<Semaphore>,
}

struct Completion {
    image: String,
    result: Result<String>,
}

pub(crate) struct Actor {
    requests: mpsc::Receiver<PullRequest>,
    cache: DigestCache,
    ctx: Arc<PullContext>,
    token: CancellationToken,
    pending: HashMap<String, VecDeque<PullRequest>>,
    completions_tx: mpsc::Sender<Completion>,
    completions: mpsc::Receiver<Completion>,
    workers: JoinSet<()>,
}

impl Actor {
    pub(crate) fn new(
        requests: mpsc::Receiver<PullRequest>,
        cache: DigestCache,
        ctx: Arc<PullContext>,
        token: CancellationToken,
    ) -> Self {
        let (completions_tx, completions) = mpsc::channel(PULL_COMPLETION_DEPTH);
        Self {
            requests,
            cache,
            ctx,
            token,
            pending: HashMap::new(),
            completions_tx,
            completions,
            workers: JoinSet::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        debug!("Pull actor started");
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                request = self.requests.recv() => match request {
                    Some(request) => self.on_request(request),
                    None => break,
                },
                Some(done) = self.completions.recv() => self.on_completion(done),
                // Reap finished worker shells so the set does not grow.
                Some(_) = self.workers.join_next(), if !self.workers.is_empty() => {}
            }
        }
        self.shutdown().await;
        debug!("Pull actor stopped");
    }

    fn on_request(&mut self, request: PullRequest) {
        if request.cancel.is_cancelled() {
            return;
        }
        if let Some(digest) = self.cache.get(&request.image) {
            debug!(image = %request.image, digest = %digest, "Digest cache hit");
            let _ = request.reply.send(Ok(()));
            return;
        }

        request.progress.push(PROGRESS_NOT_CACHED);
        let image = request.image.clone();
        let queue = self.pending.entry(image.clone()).or_default();
        queue.push_back(request);
        if queue.len() == 1 {
            self.spawn_worker(&image);
        } else {
            debug!(image = %image, waiters = queue.len(), "Joined in-flight pull");
        }
    }

    fn on_completion(&mut self, done: Completion) {
        let Completion { image, result } = done;
        let Some(mut queue) = self.pending.remove(&image) else {
            return;
        };

        match result {
            Ok(digest) => {
                self.cache.insert(&image, &digest);
                info!(image = %image, digest = %digest, waiters = queue.len(), "Pull complete");
                for waiter in queue {
                    waiter.progress.push(PROGRESS_CACHED);
                    let _ = waiter.reply.send(Ok(()));
                }
            }
            Err(e) => {
                warn!(image = %image, "Pull failed: {}", e);
                if let Some(first) = queue.pop_front() {
                    let _ = first.reply.send(Err(e));
                }
                queue.retain(|w| !w.cancel.is_cancelled());
                if !queue.is_empty() {
                    debug!(image = %image, waiters = queue.len(), "Retrying pull for next waiter");
                    self.pending.insert(image.clone(), queue);
                    self.spawn_worker(&image);
                }
            }
        }
    }

    /// Starts a pull on behalf of the first waiter for `image`.
    fn spawn_worker(&mut self, image: &str) {
        let Some(first) = self.pending.get(image).and_then(|q| q.front()) else {
            return;
        };
        let waiter = first.cancel.clone();
        let progress = first.progress.clone();
        let token = self.token.child_token();
        let ctx = Arc::clone(&self.ctx);
        let tx = self.completions_tx.clone();
        let image = image.to_string();

        self.workers.spawn(async move {
            let task = tokio::spawn(run_worker(ctx, image.clone(), progress, token, waiter));
            let result = match task.await {
                Ok(result) => result,
                Err(e) => Err(Error::Internal(format!("pull worker for {} failed: {}", image, e))),
            };
            let _ = tx.send(Completion { image, result }).await;
        });
    }

    async fn shutdown(&mut self) {
        self.requests.close();
        while let Ok(request) = self.requests.try_recv() {
            let _ = request.reply.send(Err(Error::RegistryClosed));
        }
        for (_, queue) in self.pending.drain() {
            for waiter in queue {
                let _ = waiter.reply.send(Err(Error::RegistryClosed));
            }
        }
        // Workers see the cancelled parent token; wait for them to unwind.
        self.completions.close();
        while self.workers.join_next().await.is_some() {}
    }
}

async fn run_worker(
    ctx: Arc<PullContext>,
    image: String,
    progress: ProgressSink,
    token: CancellationToken,
    waiter: CancellationToken,
) -> Result<String> {
    let pull = pull_image(&ctx, &image, &progress, &token);
    tokio::pin!(pull);
    tokio::select! {
        result = &mut pull => result,
        _ = waiter.cancelled() => {
            debug!(image = %image, "First waiter gone, cancelling pull");
            token.cancel();
            pull.await
        }
    }
}

/// Resolves, fetches and converts `image`, returning its manifest digest.
async fn pull_image(
    ctx: &PullContext,
    image: &str,
    progress: &ProgressSink,
    token: &CancellationToken,
) -> Result<String> {
    progress.push(PROGRESS_WAITING);
    let _permit = tokio::select! {
        permit = Arc::clone(&ctx.semaphore).acquire_owned() => {
            permit.map_err(|_| Error::RegistryClosed)?
        }
        _ = token.cancelled() => return Err(Error::Cancelled),
    };

    progress.push(PROGRESS_RESOLVING);
    let (reference, digest) = resolve(ctx, image, token).await?;
    progress.push(PROGRESS_RESOLVED);

    if ctx.store.has(&digest) {
        info!(image = %image, digest = %digest, "Artifact already in store");
        return Ok(digest);
    }

    let assets = ctx
        .assets
        .clone()
        .ok_or_else(|| Error::AssetUnavailable("no asset provider configured".to_string()))?;

    let work = WorkDir::create()?;
    info!(image = %image, digest = %digest, "Fetching into {}", work.path().display());
    cancellable(token, ctx.fetcher.fetch(&reference, work.path())).await?;
    progress.push(PROGRESS_FETCHED);

    let staging = ctx.store.staging_path(&digest)?;
    let options = ConvertOptions::new(assets, Arc::clone(&ctx.modules))
        .with_progress(progress.clone())
        .with_cancel(token.clone());
    if let Err(e) = convert::convert(work.path(), &staging, &options).await {
        ctx.store.discard(&staging);
        return Err(e);
    }
    ctx.store.commit(&staging, &digest)?;
    Ok(digest)
}

/// Tries each mirror in order; the first that resolves wins.
async fn resolve(
    ctx: &PullContext,
    image: &str,
    token: &CancellationToken,
) -> Result<(String, String)> {
    let mut failures = Vec::new();
    for mirror in &ctx.mirrors {
        let reference = qualify(mirror, image);
        match cancellable(token, ctx.fetcher.resolve(&reference)).await {
            Ok(digest) => {
                debug!(reference = %reference, digest = %digest, "Resolved");
                return Ok((reference, digest));
            }
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                debug!(reference = %reference, "Resolution failed: {}", e);
                failures.push(format!("{}: {}", mirror, e));
            }
        }
    }
    if failures.is_empty() {
        failures.push("no registries configured".to_string());
    }
    Err(Error::ImageNotResolved {
        reference: image.to_string(),
        reason: failures.join("; "),
    })
}

/// Prefixes `image` with a mirror host.
pub(crate) fn qualify(mirror: &str, image: &str) -> String {
    format!("{}/{}", mirror.trim_end_matches('/'), image)
}

async fn cancellable<T>(
    token: &CancellationToken,
    op: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        result = op => result,
        _ = token.cancelled() => Err(Error::Cancelled),
    }
}

/// Scratch directory of one pull, removed on drop.
struct WorkDir(PathBuf);

impl WorkDir {
    fn create() -> Result<Self> {
        let path =
            std::env::temp_dir().join(format!("{}{}", PULL_WORK_PREFIX, uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&path)?;
        Ok(Self(path))
    }

    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.0) {
            warn!("Failed to remove work directory {}: {}", self.0.display(), e);
        }
    }
}
