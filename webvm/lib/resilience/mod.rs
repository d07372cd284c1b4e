//! The error-handling wrapper around virtual machine calls.

mod breaker;
mod handler;
mod retry;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use breaker::*;
pub use handler::*;
pub use retry::*;
