//! Shared foundational types used across the memoir memoization runtime.
//!
//! This crate provides content hashing for cache keys and dependency
//! snapshots, interned identifiers for canonical callable names, and the
//! internal error type reserved for engine invariant violations.

#![warn(missing_docs)]

pub mod hash;
pub mod ident;
pub mod result;

pub use hash::{ContentHash, ContentHasher};
pub use ident::{Ident, Interner};
pub use result::{InternalError, MemoResult};
