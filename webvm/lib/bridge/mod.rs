//! The virtual machine bridge.
//!
//! [`VmBridge`] presents `ensure_directory`, `remove_directory`, `write_file`, `exec` and `fetch`
//! over whatever [`VmHandle`] is registered. [`bootstrap`] registers a [`DeferredHandle`] while the
//! real machine loads and falls back to [`EmulatedVm`] if it cannot.

mod adapters;
mod bootstrap;
mod bridge;
mod deferred;
mod emulator;
mod handle;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use adapters::*;
pub use bootstrap::*;
pub use bridge::*;
pub use deferred::*;
pub use emulator::*;
pub use handle::*;
