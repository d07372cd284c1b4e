mod memstore;
mod nativestore;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use memstore::*;
pub use nativestore::*;
