//! # spinrun
//!
//! **WebAssembly-Sandboxed Container Runtime**
//!
//! Runs OCI container images inside a WebAssembly sandbox. Images are pulled
//! once per digest, converted into a packaged squashfs bundle and booted by
//! a general-purpose runtime module that emulates the guest architecture.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                            spinrun                                  │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────────┐    │
//! │  │                 Registry (pull coordinator)                 │    │
//! │  │   pull(image) → actor → worker: resolve → fetch → convert   │    │
//! │  │   path(image) ← digest cache (TTL)                          │    │
//! │  └──────────────────────────────┬──────────────────────────────┘    │
//! │                                 │                                   │
//! │  ┌──────────────────────────────┼──────────────────────────────┐    │
//! │  │              Image Conversion Pipeline                      │    │
//! │  │  OCI layout → spec + layers → tar → squashfs → 4-entry zip  │    │
//! │  │              (compression runs in a Spin sandbox)           │    │
//! │  └──────────────────────────────┼──────────────────────────────┘    │
//! │                                 │                                   │
//! │  ┌──────────────────────────────┼──────────────────────────────┐    │
//! │  │                 Image Store <root>/images/<digest>          │    │
//! │  └─────────────────────────────────────────────────────────────┘    │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                        Sandbox Runtime                              │
//! │  ┌──────────────┐  ┌───────────────┐  ┌───────────────────────┐     │
//! │  │     Spin     │  │   Container   │  │    Virtual Network    │     │
//! │  │ one compiled │  │ mounts, stdio │  │ DHCP, NAT, TCP relay  │     │
//! │  │    module    │  │ release stack │  │ over a QEMU socket    │     │
//! │  └──────────────┘  └───────────────┘  └───────────────────────┘     │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Container Lifecycle
//!
//! ```text
//!   ┌────────────┐  create   ┌──────────┐   run    ┌─────────┐
//!   │ Configured │ ────────► │ Created  │ ───────► │ Running │
//!   └────────────┘           └────┬─────┘          └────┬────┘
//!                                 │ stop                │ stop
//!                                 ▼                     ▼
//!                            ┌──────────────────────────────┐
//!                            │           Stopped            │
//!                            └──────────────────────────────┘
//! ```
//!
//! # Key Properties
//!
//! - **Single fetch per image**: concurrent pulls of one reference share a
//!   worker; a cached digest is served without touching the network.
//! - **No partial artifacts**: conversions write to a staging path that is
//!   renamed into place only after packaging succeeds.
//! - **LIFO cleanup**: every resource a container acquires is released on
//!   `stop()`, most recent first, whether or not it ever ran.
//! - **Cooperative cancellation**: sandboxes observe their
//!   `CancellationToken` on every epoch tick; a cancelled sandbox is a
//!   clean stop, not an error.
//!
//! # Example
//!
//! ```rust,ignore
//! use spinrun::{Arch, BundledAssets, OciFetcher, Registry, RegistryConfig, Spin};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> spinrun::Result<()> {
//!     let assets = Arc::new(BundledAssets::open("assets.zip".as_ref())?);
//!     let registry = Registry::new(
//!         RegistryConfig::default().with_assets(assets.clone()),
//!         Arc::new(OciFetcher::new()),
//!     )?;
//!     registry.pull("library/alpine:latest", None).await?;
//!
//!     let spin = Spin::builder()
//!         .runtime(Arch::Amd64)
//!         .assets(assets)
//!         .image_source(Arc::new(registry.clone()))
//!         .build()?;
//!     let container = spin.container().image("library/alpine:latest").create().await?;
//!     container.run().await?;
//!     container.stop().await;
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod assets;
pub mod constants;
pub mod convert;
pub mod error;
pub mod network;
pub mod oci;
pub mod platform;
pub mod progress;
pub mod registry;
pub mod runtime;
pub mod storage;

// Re-exports
pub use archive::ArchiveReader;
pub use assets::{AssetProvider, BundledAssets};
pub use constants::*;
pub use error::{Error, Result};
pub use network::{NetworkConfig, VirtualNetwork};
pub use platform::Arch;
pub use progress::{ProgressSink, PullProgress};
pub use registry::{ImageFetcher, OciFetcher, Registry, RegistryConfig};
pub use runtime::{Container, ContainerBuilder, ImageSource, ModuleCache, Spin, SpinBuilder};
pub use storage::ImageStore;
