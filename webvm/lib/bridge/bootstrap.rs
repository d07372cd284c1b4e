use std::sync::Arc;

use async_trait::async_trait;

use crate::WebVmResult;

use super::{DeferredHandle, VmBridge, VmHandle};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// How a bridge ended up with its handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// The real virtual machine loaded.
    Loaded {
        /// Calls queued while loading and replayed afterwards.
        replayed: usize,
    },

    /// The fallback emulation was substituted.
    Emulated {
        /// Why the real virtual machine did not load.
        reason: String,

        /// Calls queued while loading and replayed afterwards.
        replayed: usize,
    },
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Loads the real virtual machine.
#[async_trait]
pub trait VmLoader: Send + Sync {
    /// Loads and boots the virtual machine, returning its handle.
    async fn load(&self) -> WebVmResult<Arc<dyn VmHandle>>;
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Installs a handle into `bridge`.
///
/// A [`DeferredHandle`] is registered first so calls made while `loader` runs are queued. When
/// the loader succeeds its handle is activated, otherwise `fallback` is. The queue is replayed
/// against whichever handle won and that handle then replaces the deferred one in the bridge.
pub async fn bootstrap(
    bridge: &VmBridge,
    loader: Option<Arc<dyn VmLoader>>,
    fallback: Arc<dyn VmHandle>,
) -> BootstrapOutcome {
    let deferred = Arc::new(DeferredHandle::new());
    bridge.register(deferred.clone());

    let (handle, reason) = match loader {
        Some(loader) => match loader.load().await {
            Ok(handle) => {
                tracing::info!("virtual machine loaded");
                (handle, None)
            }
            Err(e) => {
                tracing::warn!("virtual machine failed to load, using emulation: {e}");
                (fallback, Some(e.to_string()))
            }
        },
        None => {
            tracing::info!("no virtual machine loader configured, using emulation");
            (fallback, Some("no loader configured".to_string()))
        }
    };

    let replayed = match deferred.activate(handle.clone()).await {
        Ok(replayed) => replayed,
        Err(e) => {
            tracing::error!("failed to activate virtual machine handle: {e}");
            0
        }
    };
    bridge.register(handle);

    match reason {
        None => BootstrapOutcome::Loaded { replayed },
        Some(reason) => BootstrapOutcome::Emulated { reason, replayed },
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
