//! Tar parsing for runtime bundles.

mod reader;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use reader::*;
