//! Configuration types and defaults.

mod defaults;
mod webvm;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use defaults::*;
pub use webvm::*;
