//! In-memory implementations of the capability ports.
//!
//! Used by the demo binary and the test-suite. They model the behaviour the core
//! relies on (initial snapshot on listen, merge writes, resumable transfers with
//! progress) plus knobs for injecting permission and network failures.

mod blobs;
mod documents;
mod identity;

pub use blobs::*;
pub use documents::*;
pub use identity::*;
