//! Compiled-module cache.
//!
//! A [`ModuleCache`] owns the wasmtime [`Engine`] every runtime built on it
//! shares, memoizes compiled modules by the SHA-256 of their source bytes,
//! and optionally persists serialized modules to disk so that a later
//! process skips compilation.
//!
//! The cache also drives cooperative cancellation: engines are configured
//! with epoch interruption and a background ticker bumps the epoch every
//! [`EPOCH_TICK`], at which point each running sandbox checks its
//! cancellation token.
//!
//! There is no process-wide instance. Whoever builds a [`Spin`] decides
//! whether it gets a private cache or shares one:
//!
//! ```rust,ignore
//! let cache = Arc::new(ModuleCache::with_disk_cache(root.join("modules"))?);
//! let a = Spin::builder().module(tool.clone()).module_cache(cache.clone()).build()?;
//! let b = Spin::builder().module(tool).module_cache(cache).build()?; // no recompile
//! ```
//!
//! [`Spin`]: crate::runtime::Spin

use crate::constants::{COMPILED_MODULE_EXT, EPOCH_TICK};
use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, info, warn};
use wasmtime::{Config, Engine, Module};

/// Shared engine plus compiled-module memo.
pub struct ModuleCache {
    engine: Engine,
    modules: Mutex<HashMap<String, Module>>,
    disk: Option<PathBuf>,
    ticker_stop: Arc<AtomicBool>,
    ticker: Option<JoinHandle<()>>,
}

impl ModuleCache {
    /// Creates an in-memory cache with a fresh engine.
    pub fn new() -> Result<Self> {
        Self::build(None)
    }

    /// Creates a cache that also persists compiled modules under `dir`.
    pub fn with_disk_cache(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| Error::StorageInitFailed {
            path: dir.clone(),
            reason: e.to_string(),
        })?;
        Self::build(Some(dir))
    }

    fn build(disk: Option<PathBuf>) -> Result<Self> {
        let mut config = Config::new();
        config.epoch_interruption(true);
        config.wasm_memory64(false);

        let engine = Engine::new(&config).map_err(|e| Error::CompileFailed(e.to_string()))?;

        let ticker_stop = Arc::new(AtomicBool::new(false));
        let ticker = {
            let engine = engine.clone();
            let stop = Arc::clone(&ticker_stop);
            std::thread::Builder::new()
                .name("spin-epoch".to_string())
                .spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        std::thread::sleep(EPOCH_TICK);
                        engine.increment_epoch();
                    }
                })?
        };

        Ok(Self {
            engine,
            modules: Mutex::new(HashMap::new()),
            disk,
            ticker_stop,
            ticker: Some(ticker),
        })
    }

    /// Returns the shared engine.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Returns the on-disk cache directory, if any.
    pub fn disk_dir(&self) -> Option<&Path> {
        self.disk.as_deref()
    }

    /// Number of modules held in memory.
    pub fn len(&self) -> usize {
        self.modules.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the compiled form of `source`, compiling at most once.
    ///
    /// Accepts binary modules and, through wasmtime's text support, WAT.
    pub fn compile(&self, source: &[u8]) -> Result<Module> {
        let key = hex::encode(Sha256::digest(source));

        if let Some(module) = self.lock()?.get(&key) {
            debug!("Module cache hit: {}", &key[..12]);
            return Ok(module.clone());
        }

        let module = match self.load_from_disk(&key) {
            Some(module) => module,
            None => {
                info!("Compiling module {} ({} bytes)", &key[..12], source.len());
                let module = Module::new(&self.engine, source)
                    .map_err(|e| Error::CompileFailed(format!("{:#}", e)))?;
                self.store_to_disk(&key, &module);
                module
            }
        };

        let mut modules = self.lock()?;
        Ok(modules.entry(key).or_insert(module).clone())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Module>>> {
        self.modules
            .lock()
            .map_err(|_| Error::Internal("module cache lock poisoned".to_string()))
    }

    fn disk_path(&self, key: &str) -> Option<PathBuf> {
        self.disk
            .as_ref()
            .map(|dir| dir.join(format!("{}.{}", key, COMPILED_MODULE_EXT)))
    }

    fn load_from_disk(&self, key: &str) -> Option<Module> {
        let path = self.disk_path(key)?;
        if !path.is_file() {
            return None;
        }
        // SAFETY: files under the cache directory are only ever written by
        // `store_to_disk` from `Module::serialize`. wasmtime rejects
        // artifacts produced by a different engine version or config.
        match unsafe { Module::deserialize_file(&self.engine, &path) } {
            Ok(module) => {
                debug!("Loaded compiled module from {}", path.display());
                Some(module)
            }
            Err(e) => {
                warn!("Ignoring stale compiled module {}: {}", path.display(), e);
                let _ = std::fs::remove_file(&path);
                None
            }
        }
    }

    fn store_to_disk(&self, key: &str, module: &Module) {
        let Some(path) = self.disk_path(key) else {
            return;
        };
        let bytes = match module.serialize() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to serialize module {}: {}", key, e);
                return;
            }
        };
        let tmp = path.with_extension(format!("{}.tmp", uuid::Uuid::now_v7()));
        let written = std::fs::write(&tmp, &bytes).and_then(|_| std::fs::rename(&tmp, &path));
        if let Err(e) = written {
            warn!("Failed to persist compiled module {}: {}", path.display(), e);
            let _ = std::fs::remove_file(&tmp);
        }
    }
}

impl Drop for ModuleCache {
    fn drop(&mut self) {
        self.ticker_stop.store(true, Ordering::Relaxed);
        if let Some(ticker) = self.ticker.take() {
            let _ = ticker.join();
        }
    }
}
