//! Reachability tracking over the shadow metadata store.
//!
//! Two facts are tracked per mutable object:
//!
//! - the outermost global binding it is reachable from (its *global
//!   container*), held weakly so the record never keeps an object alive;
//! - the start time of the outermost open frame it was passed into as an
//!   argument.
//!
//! Records are keyed by address, and addresses are reused after objects
//! die. Each record therefore remembers the serial of the object that
//! created it. A record whose serial differs from the object being asked
//! about is stale and treated as absent. An argument stamp whose frame has
//! already exited is stale too.

use memoir_common::MemoResult;

use crate::frame::{CallTime, FrameStack};
use crate::shadow::ShadowTable;
use crate::value::{ObjRef, WeakObjRef};

/// Metadata kept for one touched object.
#[derive(Debug, Clone)]
pub struct ObjectMetadata {
    owner_serial: u64,
    /// Outermost global object this one is reachable from.
    pub global_container: Option<WeakObjRef>,
    /// Start time of the outermost open frame that received this object
    /// as an argument.
    pub arg_reachable_start_time: Option<CallTime>,
}

impl ObjectMetadata {
    fn for_object(obj: &ObjRef) -> Self {
        Self {
            owner_serial: obj.serial(),
            global_container: None,
            arg_reachable_start_time: None,
        }
    }

    fn container(&self) -> Option<ObjRef> {
        self.global_container.as_ref().and_then(WeakObjRef::upgrade)
    }

    fn stamp(&self, frames: &FrameStack) -> Option<CallTime> {
        self.arg_reachable_start_time
            .filter(|&t| frames.is_active(t))
    }
}

/// What a mutation of an object can affect.
#[derive(Debug, Default)]
pub struct MutationScope {
    /// The live global container, if any.
    pub global_container: Option<ObjRef>,
    /// Start time of the outermost open frame the object is an argument of.
    pub arg_reachable_since: Option<CallTime>,
}

impl MutationScope {
    /// Returns `true` if the object is visible only to the frame that
    /// mutates it.
    pub fn is_local(&self) -> bool {
        self.global_container.is_none() && self.arg_reachable_since.is_none()
    }
}

/// Propagates global-container and argument-reachability facts.
#[derive(Default)]
pub struct ReachabilityTracker {
    table: ShadowTable<ObjectMetadata>,
}

impl ReachabilityTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, obj: &ObjRef) -> MemoResult<Option<&ObjectMetadata>> {
        Ok(self
            .table
            .get(obj.id())?
            .filter(|r| r.owner_serial == obj.serial()))
    }

    fn record_mut(&mut self, obj: &ObjRef) -> MemoResult<&mut ObjectMetadata> {
        let record = self
            .table
            .get_or_insert_with(obj.id(), || ObjectMetadata::for_object(obj))?;
        if record.owner_serial != obj.serial() {
            tracing::trace!(id = obj.id().as_usize(), "reclaiming stale shadow record");
            *record = ObjectMetadata::for_object(obj);
        }
        Ok(record)
    }

    /// Records that `obj` is reachable from the global object `container`.
    ///
    /// An existing live container is kept: it is the outermost one.
    pub fn mark_global_container(&mut self, obj: &ObjRef, container: &ObjRef) -> MemoResult<()> {
        let record = self.record_mut(obj)?;
        if record.container().is_none() {
            record.global_container = Some(container.downgrade());
        }
        Ok(())
    }

    /// Records that `child` became reachable through `parent`.
    ///
    /// Copies `parent`'s global container to `child` if `child` has none,
    /// and lowers `child`'s argument stamp to `parent`'s. Nothing is
    /// allocated when `parent` carries no facts.
    pub fn extend_reachability(
        &mut self,
        parent: &ObjRef,
        child: &ObjRef,
        frames: &FrameStack,
    ) -> MemoResult<()> {
        if parent.ptr_eq(child) {
            return Ok(());
        }
        let (container, stamp) = match self.record(parent)? {
            Some(r) => (r.container(), r.stamp(frames)),
            None => return Ok(()),
        };
        if container.is_none() && stamp.is_none() {
            return Ok(());
        }
        let record = self.record_mut(child)?;
        if let Some(container) = container {
            if record.container().is_none() {
                record.global_container = Some(container.downgrade());
            }
        }
        if let Some(stamp) = stamp {
            let lowered = match record.stamp(frames) {
                Some(existing) => existing.min(stamp),
                None => stamp,
            };
            record.arg_reachable_start_time = Some(lowered);
        }
        Ok(())
    }

    /// Records that `obj` was passed as an argument into the frame that
    /// started at `start_time`. The outermost open frame wins.
    pub fn note_argument_reachable(
        &mut self,
        obj: &ObjRef,
        start_time: CallTime,
        frames: &FrameStack,
    ) -> MemoResult<()> {
        let record = self.record_mut(obj)?;
        let stamp = match record.stamp(frames) {
            Some(existing) => existing.min(start_time),
            None => start_time,
        };
        record.arg_reachable_start_time = Some(stamp);
        Ok(())
    }

    /// Reports what a mutation of `obj` about to happen can affect.
    pub fn note_about_to_mutate(
        &self,
        obj: &ObjRef,
        frames: &FrameStack,
    ) -> MemoResult<MutationScope> {
        Ok(match self.record(obj)? {
            Some(r) => MutationScope {
                global_container: r.container(),
                arg_reachable_since: r.stamp(frames),
            },
            None => MutationScope::default(),
        })
    }

    /// The live global container of `obj`.
    pub fn global_container(&self, obj: &ObjRef) -> MemoResult<Option<ObjRef>> {
        Ok(self.record(obj)?.and_then(ObjectMetadata::container))
    }

    /// The valid argument stamp of `obj`.
    pub fn arg_reachable_since(
        &self,
        obj: &ObjRef,
        frames: &FrameStack,
    ) -> MemoResult<Option<CallTime>> {
        Ok(self.record(obj)?.and_then(|r| r.stamp(frames)))
    }

    /// Number of shadow records ever created.
    pub fn tracked(&self) -> usize {
        self.table.len()
    }
}
