//! `webvm` provisions runtime packages and deploys applications inside a sandboxed virtual
//! machine that may be absent, still booting, or fully ready.
//!
//! # Overview
//!
//! The crate lets a host treat an optional, asynchronously-initializing virtual machine as a
//! reliable backend. It handles:
//! - Parsing tar-packaged runtime bundles
//! - Staging files into a scoped virtual filesystem
//! - Installing and removing runtime packages with dependency resolution
//! - Starting, stopping and proxying static applications
//! - Degrading to a pure in-process emulation when no virtual machine can be loaded
//!
//! # Architecture
//!
//! - **Archive**: a minimal POSIX tar reader
//! - **Bridge**: one capability surface over the registered virtual machine handle, a deferred-call
//!   shim that queues calls until the handle is ready, and a fallback emulation
//! - **Resilience**: retry, circuit breaker, timeout and admission control around bridge calls
//! - **Packages**: the manifest-driven runtime catalog and its install/remove workflow
//! - **Lifecycle**: the virtual machine state machine and the install/start/stop/proxy pipelines
//! - **Apps**: the composition root publishing one snapshot of everything above
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use webvm::{
//!     apps::AppServer,
//!     bridge::{bootstrap, EmulatedVm, VmBridge},
//!     config::WebVmConfig,
//!     persistence::MemoryPersistence,
//!     remote::HttpSource,
//! };
//! use webvmfs::MemoryFileStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = WebVmConfig::default();
//!     let files = Arc::new(MemoryFileStore::new());
//!     let bridge = Arc::new(VmBridge::new());
//!
//!     // No real virtual machine here, so the emulation takes over.
//!     bootstrap(&bridge, None, Arc::new(EmulatedVm::new(files.clone()))).await;
//!
//!     let server = AppServer::builder()
//!         .config(config)
//!         .bridge(bridge)
//!         .files(files)
//!         .persistence(Arc::new(MemoryPersistence::new()))
//!         .remote(Arc::new(HttpSource::new()))
//!         .build()
//!         .await?;
//!
//!     server.install_package("nginx", Default::default()).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`apps`] - Application orchestration and the composition root
//! - [`archive`] - Tar parsing
//! - [`bridge`] - Virtual machine handle, bridge, deferred-call shim and emulation
//! - [`config`] - Configuration types and defaults
//! - [`lifecycle`] - Virtual machine lifecycle and install pipeline
//! - [`packages`] - Runtime package catalog
//! - [`persistence`] - State persistence collaborators
//! - [`remote`] - Manifest and bundle fetching
//! - [`resilience`] - Error-handling wrapper
//! - [`utils`] - Common utilities and helpers

#![warn(missing_docs)]
#![allow(clippy::module_inception)]

mod error;
mod models;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod apps;
pub mod archive;
pub mod bridge;
pub mod config;
pub mod lifecycle;
pub mod packages;
pub mod persistence;
pub mod remote;
pub mod resilience;
pub mod utils;

pub use error::*;
pub use models::*;
