//! Fetching runtime manifests and bundles.

mod http;
mod source;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use http::*;
pub use source::*;
