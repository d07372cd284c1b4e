//! The virtual machine lifecycle.
//!
//! [`WebVmManager`] owns the machine status, performs the side effects of runtime installs and
//! removals, and starts, stops and proxies to the static file servers of deployed applications.

mod commands;
mod manager;
mod proxy;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use commands::*;
pub use manager::*;
pub use proxy::*;
