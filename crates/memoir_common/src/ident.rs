//! Run-local handles for canonical names.
//!
//! The code registry refers to callables and invocation-graph nodes by
//! [`Ident`] instead of by string. Idents never leave the process: the
//! manifest stores resolved names.

use lasso::ThreadedRodeo;
use serde::{Deserialize, Serialize};

/// Handle of an interned canonical name.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct Ident(u32);

impl Ident {
    /// Wraps a raw index. Only meaningful for the interner that issued it.
    pub fn from_raw(index: u32) -> Self {
        Self(index)
    }

    /// The raw index.
    pub fn as_raw(self) -> u32 {
        self.0
    }
}

// SAFETY: `into_usize` and `try_from_usize` are inverse on every `u32`, and
// indices beyond `u32::MAX` are refused.
unsafe impl lasso::Key for Ident {
    fn into_usize(self) -> usize {
        self.0 as usize
    }

    fn try_from_usize(int: usize) -> Option<Self> {
        u32::try_from(int).ok().map(Ident)
    }
}

/// Name table shared by one engine's registry.
pub struct Interner {
    rodeo: ThreadedRodeo<Ident>,
}

impl Interner {
    /// An empty table.
    pub fn new() -> Self {
        Self {
            rodeo: ThreadedRodeo::new(),
        }
    }

    /// Handle for `name`, interning it on first sight.
    pub fn get_or_intern(&self, name: &str) -> Ident {
        self.rodeo.get_or_intern(name)
    }

    /// Handle for `name` if it was interned before.
    pub fn get(&self, name: &str) -> Option<Ident> {
        self.rodeo.get(name)
    }

    /// The name behind `ident`, or `None` for a handle from another table.
    pub fn resolve(&self, ident: Ident) -> Option<&str> {
        self.rodeo.try_resolve(&ident)
    }

    /// Number of distinct names.
    pub fn len(&self) -> usize {
        self.rodeo.len()
    }

    /// Returns `true` if no name was interned.
    pub fn is_empty(&self) -> bool {
        self.rodeo.is_empty()
    }
}

impl Default for Interner {
    fn default() -> Self {
        Self::new()
    }
}
