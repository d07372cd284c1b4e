//! The runtime package catalog and its install/remove workflow.
//!
//! The [`RuntimeRepository`] merges the remote [`RuntimeManifest`] into a persisted catalog and
//! drives every package through its status graph. The side effects of an install or removal are
//! delegated to a [`RuntimeInstaller`], normally the
//! [`WebVmManager`](crate::lifecycle::WebVmManager).

mod installer;
mod manifest;
mod repository;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use installer::*;
pub use manifest::*;
pub use repository::*;
