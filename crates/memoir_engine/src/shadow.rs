//! Shadow metadata store.
//!
//! Host objects cannot carry extra fields, so per-object metadata lives in
//! a sparse side table keyed by raw identity. The table is a fixed-depth
//! radix tree with 65536-way fan-out: each level consumes 16 bits of the
//! identity, giving four levels on 64-bit targets and two on 32-bit ones.
//! Inner levels are allocated on the first write along their path; a read
//! along an unwritten path returns `None` without allocating.

use memoir_common::{InternalError, MemoResult};

use crate::value::ObjectId;

const SLOT_BITS: u32 = 16;
const FANOUT: usize = 1 << SLOT_BITS;

/// Number of levels between the root and a record.
pub const LEVELS: usize = (usize::BITS / SLOT_BITS) as usize;

enum Node<T> {
    Inner(Box<[Option<Box<Node<T>>>]>),
    Leaf(Box<[Option<T>]>),
}

impl<T> Node<T> {
    fn for_level(level: usize) -> Self {
        if level + 1 == LEVELS {
            Node::Leaf(std::iter::repeat_with(|| None).take(FANOUT).collect())
        } else {
            Node::Inner(std::iter::repeat_with(|| None).take(FANOUT).collect())
        }
    }
}

fn slot(id: ObjectId, level: usize) -> usize {
    let shift = SLOT_BITS as usize * (LEVELS - 1 - level);
    (id.as_usize() >> shift) & (FANOUT - 1)
}

fn inconsistent(id: ObjectId, level: usize) -> InternalError {
    InternalError::new(format!(
        "shadow table node at level {level} has the wrong shape on the path to {:#x}",
        id.as_usize()
    ))
}

/// Sparse map from object identity to a metadata record.
pub struct ShadowTable<T> {
    root: Option<Box<Node<T>>>,
    len: usize,
    leaves: usize,
}

impl<T> ShadowTable<T> {
    /// Creates an empty table. Nothing is allocated until the first write.
    pub fn new() -> Self {
        Self {
            root: None,
            len: 0,
            leaves: 0,
        }
    }

    /// Returns the record for `id`, if one was ever created.
    pub fn get(&self, id: ObjectId) -> MemoResult<Option<&T>> {
        let Some(mut node) = self.root.as_deref() else {
            return Ok(None);
        };
        for level in 0..LEVELS {
            let idx = slot(id, level);
            match node {
                Node::Inner(children) if level + 1 < LEVELS => match children[idx].as_deref() {
                    Some(child) => node = child,
                    None => return Ok(None),
                },
                Node::Leaf(records) if level + 1 == LEVELS => return Ok(records[idx].as_ref()),
                _ => return Err(inconsistent(id, level)),
            }
        }
        Err(inconsistent(id, LEVELS))
    }

    /// Returns a mutable reference to the record for `id`, if present.
    pub fn get_mut(&mut self, id: ObjectId) -> MemoResult<Option<&mut T>> {
        let Some(mut node) = self.root.as_deref_mut() else {
            return Ok(None);
        };
        for level in 0..LEVELS {
            let idx = slot(id, level);
            let current = node;
            match current {
                Node::Inner(children) if level + 1 < LEVELS => match children[idx].as_deref_mut() {
                    Some(child) => node = child,
                    None => return Ok(None),
                },
                Node::Leaf(records) if level + 1 == LEVELS => return Ok(records[idx].as_mut()),
                _ => return Err(inconsistent(id, level)),
            }
        }
        Err(inconsistent(id, LEVELS))
    }

    /// Returns the record for `id`, creating it (and any missing levels on
    /// its path) with `init` if absent.
    pub fn get_or_insert_with(
        &mut self,
        id: ObjectId,
        init: impl FnOnce() -> T,
    ) -> MemoResult<&mut T> {
        let mut node: &mut Node<T> = self
            .root
            .get_or_insert_with(|| Box::new(Node::for_level(0)));
        for level in 0..LEVELS {
            let idx = slot(id, level);
            let current = node;
            match current {
                Node::Inner(children) if level + 1 < LEVELS => {
                    let child = children[idx].get_or_insert_with(|| {
                        if level + 2 == LEVELS {
                            self.leaves += 1;
                        }
                        Box::new(Node::for_level(level + 1))
                    });
                    node = &mut **child;
                }
                Node::Leaf(records) if level + 1 == LEVELS => {
                    let record = &mut records[idx];
                    if record.is_none() {
                        self.len += 1;
                    }
                    return Ok(record.get_or_insert_with(init));
                }
                _ => return Err(inconsistent(id, level)),
            }
        }
        Err(inconsistent(id, LEVELS))
    }

    /// Number of records ever created.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if no record was ever created.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of allocated leaf blocks.
    pub fn leaf_blocks(&self) -> usize {
        self.leaves
    }
}

impl<T: Default> ShadowTable<T> {
    /// Returns the record for `id`, creating a default one if absent.
    pub fn get_or_create(&mut self, id: ObjectId) -> MemoResult<&mut T> {
        self.get_or_insert_with(id, T::default)
    }
}

impl<T> Default for ShadowTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
