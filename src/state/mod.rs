//! State module - The synchronized data tree
//!
//! Provides:
//! - `Value`, the dynamically typed tree node
//! - Diff and merge with tombstone deletion and whole-list replacement
//! - `StateStore`, the single authoritative tree of a server

mod diff;
mod store;
mod value;

pub use diff::*;
pub use store::*;
pub use value::*;
