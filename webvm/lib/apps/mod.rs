//! Application orchestration and the composition root.
//!
//! [`AppServer`] wires the lifecycle manager and the package repository together, tracks
//! deployed static applications and publishes a single [`AppServerSnapshot`] of all of it.

mod builder;
mod deploy;
mod server;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use builder::*;
pub use deploy::*;
pub use server::*;
