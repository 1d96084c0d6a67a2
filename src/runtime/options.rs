//! Container configuration.

use crate::error::{Error, Result};
use crate::network::NetworkConfig;
use crate::runtime::container::{self, Container};
use crate::runtime::stdio::{OutputSink, StdinSource};
use crate::runtime::SpinInner;
use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Where a runtime-mode container's image bundle comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSelection {
    /// Resolved through the runtime's [`ImageSource`](crate::runtime::ImageSource).
    Named(String),
    /// A packaged artifact on disk.
    File(PathBuf),
}

/// Everything a container is created from.
pub struct ContainerConfig {
    pub name: Option<String>,
    pub cmd: Vec<String>,
    /// Sandbox path -> host source.
    pub mounts: BTreeMap<String, PathBuf>,
    pub env: HashMap<String, String>,
    pub image: Option<ImageSelection>,
    pub network: Option<NetworkConfig>,
    pub stdin: Option<StdinSource>,
    /// `None` inherits the host's stdout.
    pub stdout: Option<OutputSink>,
    /// `None` inherits the host's stderr.
    pub stderr: Option<OutputSink>,
    /// Parent directory for archive-mount scratch directories.
    pub scratch_dir: PathBuf,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            name: None,
            cmd: Vec::new(),
            mounts: BTreeMap::new(),
            env: HashMap::new(),
            image: None,
            network: None,
            stdin: None,
            stdout: None,
            stderr: None,
            scratch_dir: std::env::temp_dir(),
        }
    }
}

impl std::fmt::Debug for ContainerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerConfig")
            .field("name", &self.name)
            .field("cmd", &self.cmd)
            .field("mounts", &self.mounts)
            .field("env", &self.env)
            .field("image", &self.image)
            .field("network", &self.network)
            .field("stdin", &self.stdin.is_some())
            .finish_non_exhaustive()
    }
}

/// Builder for a [`Container`], obtained from [`Spin::container`].
///
/// Option errors are collected and reported by [`ContainerBuilder::create`].
///
/// ```rust,ignore
/// let container = spin
///     .container()
///     .name("hello")
///     .mount("/srv/data", "/data")
///     .command(["/bin/cat", "/data/motd"])
///     .create()
///     .await?;
/// container.run().await?;
/// container.stop().await;
/// ```
///
/// [`Spin::container`]: crate::runtime::Spin::container
pub struct ContainerBuilder {
    parent: Arc<SpinInner>,
    config: ContainerConfig,
    error: Option<Error>,
}

impl ContainerBuilder {
    pub(crate) fn new(parent: Arc<SpinInner>) -> Self {
        Self {
            parent,
            config: ContainerConfig::default(),
            error: None,
        }
    }

    fn fail(mut self, error: Error) -> Self {
        if self.error.is_none() {
            self.error = Some(error);
        }
        self
    }

    /// Sets the container name. Unnamed containers get a generated one.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = Some(name.into());
        self
    }

    /// Sets the command passed to the sandbox.
    pub fn command<I, S>(mut self, cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.cmd = cmd.into_iter().map(Into::into).collect();
        self
    }

    /// Mounts a host directory, zip or tar archive at `sandbox_path`.
    ///
    /// Both paths must be absolute.
    pub fn mount(mut self, host: impl AsRef<Path>, sandbox_path: impl Into<String>) -> Self {
        let host = host.as_ref();
        let sandbox_path = sandbox_path.into();
        if !host.is_absolute() {
            return self.fail(Error::InvalidOption(
                "mount host directory must be absolute".to_string(),
            ));
        }
        if !sandbox_path.starts_with('/') {
            return self.fail(Error::InvalidOption(
                "mount directory must be absolute".to_string(),
            ));
        }
        self.config.mounts.insert(sandbox_path, host.to_path_buf());
        self
    }

    /// Sets an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.env.insert(key.into(), value.into());
        self
    }

    /// Runs a pulled image, resolved by name when the container is created.
    pub fn image(mut self, name: impl Into<String>) -> Self {
        self.config.image = Some(ImageSelection::Named(name.into()));
        self
    }

    /// Runs a packaged image file.
    pub fn image_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.image = Some(ImageSelection::File(path.into()));
        self
    }

    /// Connects the container to a virtual network.
    pub fn networking(mut self, network: NetworkConfig) -> Self {
        self.config.network = Some(network);
        self
    }

    pub fn stdin(mut self, reader: impl Read + Send + Sync + 'static) -> Self {
        self.config.stdin = Some(Box::new(reader));
        self
    }

    pub fn stdout(mut self, writer: impl Write + Send + Sync + 'static) -> Self {
        self.config.stdout = Some(Box::new(writer));
        self
    }

    pub fn stderr(mut self, writer: impl Write + Send + Sync + 'static) -> Self {
        self.config.stderr = Some(Box::new(writer));
        self
    }

    /// Sets where archive mounts are extracted.
    pub fn scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.scratch_dir = dir.into();
        self
    }

    /// Validates the configuration, instantiates the sandbox and registers
    /// the container with its runtime. The entry point is not invoked.
    pub async fn create(self) -> Result<Container> {
        if let Some(error) = self.error {
            return Err(error);
        }
        container::create(self.parent, self.config).await
    }
}
