//! `webvmfs` is a scoped virtual filesystem store.
//!
//! Files are addressed by a `(scope, path)` pair where the scope is an opaque runtime or
//! application identifier. The store keeps raw byte buffers together with the time they were
//! stored, and is used both to record what a virtual machine would see on disk and as the
//! execution substrate when no virtual machine is available.

#![warn(missing_docs)]
#![allow(clippy::module_inception)]

mod error;
mod implementations;
mod path;
mod store;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use error::*;
pub use implementations::*;
pub use path::*;
pub use store::*;
