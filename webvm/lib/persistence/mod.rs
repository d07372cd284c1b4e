//! Persistence collaborators for state that survives a restart.

mod json;
mod memory;
mod store;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use json::*;
pub use memory::*;
pub use store::*;
