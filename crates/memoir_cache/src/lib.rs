//! Persistent memoization cache.
//!
//! This crate stores memoized call results keyed by canonical callable name,
//! code hash and argument signature, together with the dependency snapshot
//! (global bindings, attributes, files and invoked code units) that decides
//! whether a stored result is still valid in a later run.

#![warn(missing_docs)]

pub mod cache;
pub mod error;
pub mod hasher;
pub mod key;
pub mod manifest;
pub mod payload;

pub use cache::{Cache, CachedResult, Lookup, MissReason};
pub use error::CacheError;
pub use hasher::FileHasher;
pub use key::{CacheKey, DependencySnapshot, DependencyState};
pub use manifest::{CacheManifest, EntryRecord};
