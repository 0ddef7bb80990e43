//! Data models for the skein core.
//!
//! Field names on the serialized forms are the cross-boundary contract with whatever
//! document store is wired in; everything else is internal.

mod identity;
mod profile;
mod record;
mod role;
mod upload;

pub use identity::*;
pub use profile::*;
pub use record::*;
pub use role::*;
pub use upload::*;
