//! Sandbox instances.
//!
//! Creating a container resolves its filesystem view, brings up its
//! network, then instantiates the runtime's module without calling the
//! entry point. `run()` calls `_start` on a blocking thread; `stop()`
//! cancels it, waits for it to return and releases everything the
//! container acquired, most recent first.
//!
//! ## Exit Mapping
//!
//! | Sandbox outcome                     | `run()` returns            |
//! |-------------------------------------|----------------------------|
//! | `_start` returns / `proc_exit(0)`   | `Ok(())`                   |
//! | `proc_exit(n)`, n != 0              | [`Error::ExitStatus`]      |
//! | trap after cancellation             | `Ok(())`                   |
//! | any other trap                      | [`Error::ExecutionFailed`] |
//! | no `_start` export                  | [`Error::NoEntryPoint`]    |

use crate::constants::{
    ENTRY_POINT, FLAG_NET_SOCKET, FLAG_NO_STDIN, MODULE_ARG0, NETWORK_DIAL_ATTEMPTS,
    NETWORK_DIAL_INTERVAL, NETWORK_LISTENER_FD, RUNTIME_ARG0, validate_container_name,
};
use crate::error::{Error, Result};
use crate::network::{self, VirtualNetwork};
use crate::runtime::mounts::{self, StagedMount};
use crate::runtime::options::{ContainerConfig, ImageSelection};
use crate::runtime::release::ReleaseStack;
use crate::runtime::{SandboxState, SpinInner, names};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wasi_common::I32Exit;
use wasi_common::pipe::{ReadPipe, WritePipe};
use wasi_common::sync::{Dir, WasiCtxBuilder, ambient_authority};
use wasmtime::{Instance, Store, UpdateDeadline};

/// An instantiated sandbox.
pub struct Container {
    core: Arc<ContainerCore>,
}

impl Container {
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Host port the sandbox's network listener is bound to.
    pub fn network_port(&self) -> Option<u16> {
        self.core.network_port
    }

    /// Invokes the sandbox entry point and waits for it to return.
    ///
    /// A container runs at most once.
    pub async fn run(&self) -> Result<()> {
        self.core.run().await
    }

    /// Cancels the sandbox, waits for `run()` to finish if it was started,
    /// then releases every resource in reverse acquisition order and
    /// removes the container from its runtime. Repeated calls are no-ops.
    pub async fn stop(&self) {
        self.core.stop().await
    }

    pub fn is_stopped(&self) -> bool {
        self.core.stopping.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("name", &self.core.name)
            .finish_non_exhaustive()
    }
}

struct Sandbox {
    store: Store<SandboxState>,
    instance: Instance,
}

enum State {
    Created(Box<Sandbox>),
    Running,
    Exited,
    Stopped,
}

impl State {
    fn label(&self) -> &'static str {
        match self {
            State::Created(_) => "created",
            State::Running => "running",
            State::Exited => "exited",
            State::Stopped => "stopped",
        }
    }
}

/// Container state shared with its runtime's table.
pub(crate) struct ContainerCore {
    name: String,
    parent: Weak<SpinInner>,
    cancel: CancellationToken,
    state: Mutex<State>,
    release: Mutex<ReleaseStack>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
    stopping: AtomicBool,
    network_port: Option<u16>,
}

impl ContainerCore {
    async fn run(self: &Arc<Self>) -> Result<()> {
        let sandbox = {
            let mut state = self.lock_state()?;
            match std::mem::replace(&mut *state, State::Running) {
                State::Created(sandbox) => sandbox,
                other => {
                    let label = other.label();
                    *state = other;
                    return Err(Error::InvalidState {
                        container: self.name.clone(),
                        state: label.to_string(),
                        operation: "run".to_string(),
                    });
                }
            }
        };

        info!("Running container {}", self.name);

        let core = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let _finished = FinishGuard(Arc::clone(&core));
            execute(*sandbox, &core.name, &core.cancel)
        })
        .await
        .map_err(|e| Error::Internal(format!("container task failed: {}", e)))?
    }

    pub(crate) async fn stop(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();

        let was_running = match self.state.lock() {
            Ok(mut state) => match std::mem::replace(&mut *state, State::Stopped) {
                State::Running => true,
                State::Created(sandbox) => {
                    drop(sandbox);
                    false
                }
                State::Exited | State::Stopped => false,
            },
            Err(_) => false,
        };

        if was_running {
            let mut done = self.done_rx.clone();
            let _ = done.wait_for(|finished| *finished).await;
        }

        let stack = match self.release.lock() {
            Ok(mut release) => std::mem::take(&mut *release),
            Err(_) => ReleaseStack::new(),
        };
        let released = tokio::task::spawn_blocking(move || drop(stack)).await;
        if let Err(e) = released {
            warn!("Releasing resources of {} failed: {}", self.name, e);
        }

        if let Some(parent) = self.parent.upgrade() {
            parent.remove(&self.name);
        }
        info!("Container {} stopped", self.name);
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| Error::Internal("container state lock poisoned".to_string()))
    }

    fn finish(&self) {
        if let Ok(mut state) = self.state.lock()
            && matches!(*state, State::Running)
        {
            *state = State::Exited;
        }
        self.done_tx.send_replace(true);
    }
}

/// Marks the run finished even if the sandbox thread panics.
struct FinishGuard(Arc<ContainerCore>);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.0.finish();
    }
}

fn execute(sandbox: Sandbox, name: &str, cancel: &CancellationToken) -> Result<()> {
    let Sandbox {
        mut store,
        instance,
    } = sandbox;

    let Some(start) = instance.get_func(&mut store, ENTRY_POINT) else {
        return Err(Error::NoEntryPoint(name.to_string()));
    };
    let start = start
        .typed::<(), ()>(&store)
        .map_err(|e| Error::ExecutionFailed {
            container: name.to_string(),
            reason: format!("{} has an unexpected signature: {}", ENTRY_POINT, e),
        })?;

    match start.call(&mut store, ()) {
        Ok(()) => Ok(()),
        Err(e) => {
            if let Some(exit) = e.downcast_ref::<I32Exit>() {
                if exit.0 == 0 {
                    Ok(())
                } else {
                    Err(Error::ExitStatus {
                        container: name.to_string(),
                        status: exit.0,
                    })
                }
            } else if cancel.is_cancelled() {
                debug!("Container {} interrupted by cancellation", name);
                Ok(())
            } else {
                Err(Error::ExecutionFailed {
                    container: name.to_string(),
                    reason: format!("{:#}", e),
                })
            }
        }
    }
}

// =============================================================================
// Creation
// =============================================================================

pub(crate) async fn create(parent: Arc<SpinInner>, mut config: ContainerConfig) -> Result<Container> {
    if parent.is_closed() || parent.cancel.is_cancelled() {
        return Err(Error::RuntimeClosed);
    }

    let name = assign_name(&parent, config.name.take())?;
    let bundle = resolve_bundle(&parent, config.image.take())?;

    let cancel = parent.cancel.child_token();
    let mut release = ReleaseStack::new();

    // Archive extraction is blocking filesystem work.
    let (staged, release_after_mounts) = {
        let mounts = std::mem::take(&mut config.mounts);
        let scratch = config.scratch_dir.clone();
        let owner = name.clone();
        let bundles = Arc::clone(&parent.bundles);
        tokio::task::spawn_blocking(move || {
            let mut release = ReleaseStack::new();
            let staged = mounts::stage(
                &mounts,
                bundle.as_deref(),
                &bundles,
                &scratch,
                &owner,
                &mut release,
            );
            (staged, release)
        })
        .await
        .map_err(|e| Error::Internal(format!("staging mounts failed: {}", e)))?
    };
    release.absorb(release_after_mounts);
    let staged = staged?;

    let (network, listener) = match config.network.take() {
        Some(net_config) => {
            let vn = VirtualNetwork::new(net_config)?;
            let (listener, port) = network::bind_listener(vn.config().port_range())?;
            (Some((vn, port)), Some(listener))
        }
        None => (None, None),
    };

    let args = argv(&parent, &config, network.is_some());
    let wasi = build_wasi(&name, &args, &mut config, &staged, listener)?;

    let mut store = Store::new(parent.cache.engine(), SandboxState { wasi });
    store.set_epoch_deadline(1);
    let token = cancel.clone();
    store.epoch_deadline_callback(move |_| {
        if token.is_cancelled() {
            Err(anyhow::anyhow!("container cancelled"))
        } else {
            Ok(UpdateDeadline::Continue(1))
        }
    });

    let instance = parent
        .linker
        .instantiate(&mut store, &parent.module)
        .map_err(|e| Error::InstantiateFailed {
            container: name.clone(),
            reason: format!("{:#}", e),
        })?;

    let network_port = match network {
        Some((vn, port)) => {
            let stream = dial(&name, port, &cancel).await?;
            let task_cancel = cancel.clone();
            let owner = name.clone();
            let task = tokio::spawn(async move {
                if let Err(e) = vn.accept_qemu(stream, task_cancel.clone()).await {
                    warn!("Network link of {} failed: {}", owner, e);
                    task_cancel.cancel();
                }
            });
            let link_cancel = cancel.clone();
            release.push(format!("network link of {}", name), move || {
                link_cancel.cancel();
                task.abort();
            });
            Some(port)
        }
        None => None,
    };

    let (done_tx, done_rx) = watch::channel(false);
    let core = Arc::new(ContainerCore {
        name: name.clone(),
        parent: Arc::downgrade(&parent),
        cancel,
        state: Mutex::new(State::Created(Box::new(Sandbox { store, instance }))),
        release: Mutex::new(release),
        done_tx,
        done_rx,
        stopping: AtomicBool::new(false),
        network_port,
    });

    {
        let mut table = parent
            .containers
            .write()
            .map_err(|_| Error::Internal("container table lock poisoned".to_string()))?;
        if table.contains_key(&name) {
            return Err(Error::ContainerAlreadyExists(name));
        }
        table.insert(name.clone(), Arc::clone(&core));
    }

    info!("Created container {}", name);
    Ok(Container { core })
}

fn assign_name(parent: &SpinInner, requested: Option<String>) -> Result<String> {
    let name = match requested {
        Some(name) => name,
        None => {
            let first = names::generate(0);
            if parent.contains(&first) {
                names::generate(1)
            } else {
                first
            }
        }
    };

    validate_container_name(&name).map_err(Error::InvalidOption)?;
    if parent.contains(&name) {
        return Err(Error::ContainerAlreadyExists(name));
    }
    Ok(name)
}

fn resolve_bundle(parent: &SpinInner, image: Option<ImageSelection>) -> Result<Option<PathBuf>> {
    let Some(image) = image else {
        return Ok(None);
    };
    if !parent.is_runtime() {
        return Err(Error::InvalidOption(
            "only runtimes can use bundles".to_string(),
        ));
    }
    match image {
        ImageSelection::File(path) => Ok(Some(path)),
        ImageSelection::Named(name) => {
            let images = parent
                .images
                .as_ref()
                .ok_or_else(|| Error::InvalidOption("no registry".to_string()))?;
            images
                .path(&name)
                .map(Some)
                .map_err(|_| Error::ImageNotFound(name))
        }
    }
}

fn argv(parent: &SpinInner, config: &ContainerConfig, networked: bool) -> Vec<String> {
    let mut args = Vec::with_capacity(config.cmd.len() + 3);
    if parent.is_runtime() {
        args.push(RUNTIME_ARG0.to_string());
        if config.stdin.is_none() {
            args.push(FLAG_NO_STDIN.to_string());
        }
        if networked {
            args.push(FLAG_NET_SOCKET.to_string());
        }
    } else {
        args.push(MODULE_ARG0.to_string());
    }
    args.extend(config.cmd.iter().cloned());
    args
}

fn build_wasi(
    name: &str,
    args: &[String],
    config: &mut ContainerConfig,
    staged: &[StagedMount],
    listener: Option<std::net::TcpListener>,
) -> Result<wasi_common::WasiCtx> {
    let wasi_err = |e: &dyn std::fmt::Display| Error::InstantiateFailed {
        container: name.to_string(),
        reason: e.to_string(),
    };

    let mut builder = WasiCtxBuilder::new();
    builder.args(args).map_err(|e| wasi_err(&e))?;

    let mut env: Vec<_> = config.env.iter().collect();
    env.sort();
    for (k, v) in env {
        builder.env(k, v).map_err(|e| wasi_err(&e))?;
    }

    match config.stdin.take() {
        Some(stdin) => {
            builder.stdin(Box::new(ReadPipe::new(stdin)));
        }
        None => {
            builder.stdin(Box::new(ReadPipe::new(std::io::empty())));
        }
    }
    match config.stdout.take() {
        Some(out) => {
            builder.stdout(Box::new(WritePipe::new(out)));
        }
        None => {
            builder.inherit_stdout();
        }
    }
    match config.stderr.take() {
        Some(err) => {
            builder.stderr(Box::new(WritePipe::new(err)));
        }
        None => {
            builder.inherit_stderr();
        }
    }

    // The listener must take its fixed descriptor before directories are
    // assigned the following ones.
    if let Some(listener) = listener {
        builder
            .preopened_socket(
                NETWORK_LISTENER_FD,
                cap_std::net::TcpListener::from_std(listener),
            )
            .map_err(|e| wasi_err(&e))?;
    }

    for mount in staged {
        let dir = Dir::open_ambient_dir(&mount.host, ambient_authority()).map_err(|e| {
            wasi_err(&format!("opening {} failed: {}", mount.host.display(), e))
        })?;
        builder
            .preopened_dir(dir, &mount.guest)
            .map_err(|e| wasi_err(&e))?;
    }

    Ok(builder.build())
}

async fn dial(name: &str, port: u16, cancel: &CancellationToken) -> Result<TcpStream> {
    let addr = format!("127.0.0.1:{}", port);
    for attempt in 0..NETWORK_DIAL_ATTEMPTS {
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(NETWORK_DIAL_INTERVAL) => {
                match TcpStream::connect(&addr).await {
                    Ok(stream) => {
                        debug!("Connected to {} network after {} attempts", name, attempt + 1);
                        return Ok(stream);
                    }
                    Err(e) => debug!("Dial {} failed: {}", addr, e),
                }
            }
        }
    }
    Err(Error::NetworkUnreachable {
        container: name.to_string(),
        reason: format!("failed to establish connection to {}", addr),
    })
}
