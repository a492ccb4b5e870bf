//! Call frame stack.
//!
//! Every frame entry draws a start time from a strictly increasing clock.
//! Since frames nest, the open frames always have increasing start times
//! from the bottom of the stack to the top, which turns "is this frame an
//! ancestor of that one" into an integer comparison.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use memoir_cache::{CacheKey, DependencySnapshot};
use memoir_common::{InternalError, MemoResult};

use crate::value::CodeId;

/// Position of a frame entry in the process-wide call order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct CallTime(u64);

impl CallTime {
    /// Returns the raw counter value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Source of [`CallTime`]s. Never repeats a value.
#[derive(Debug, Default)]
pub struct CallClock {
    next: u64,
}

impl CallClock {
    /// Creates a clock whose first tick is `t1`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next start time.
    pub fn tick(&mut self) -> CallTime {
        self.next += 1;
        CallTime(self.next)
    }
}

/// Why a frame stopped being cacheable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaintReason {
    /// The callable is on the ignore list or was never registered.
    IgnoredCode,
    /// An argument could not be encoded into a signature.
    UnencodableArguments,
    /// A global binding was written or deleted.
    GlobalWrite(String),
    /// A namespace attribute was written or deleted.
    NamespaceWrite(String),
    /// An object reachable from a global binding was mutated.
    GlobalMutation,
    /// An object passed in as an argument was mutated.
    ArgumentMutation,
    /// A file was written or truncated.
    FileWrite(PathBuf),
    /// An event referred to a file handle that was never opened.
    UnknownFile(u64),
    /// A file was read but its contents could not be hashed.
    UnhashableFile(PathBuf),
    /// A global or attribute read produced a value that cannot be hashed.
    UnsnapshotableRead(String),
    /// Caching is disabled for this run.
    CachingDisabled,
}

impl fmt::Display for TaintReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaintReason::IgnoredCode => f.write_str("ignored code"),
            TaintReason::UnencodableArguments => f.write_str("unencodable arguments"),
            TaintReason::GlobalWrite(name) => write!(f, "write to global {name}"),
            TaintReason::NamespaceWrite(name) => write!(f, "write to attribute {name}"),
            TaintReason::GlobalMutation => f.write_str("mutation of global-reachable object"),
            TaintReason::ArgumentMutation => f.write_str("mutation of argument"),
            TaintReason::FileWrite(path) => write!(f, "write to {}", path.display()),
            TaintReason::UnknownFile(handle) => write!(f, "unknown file handle {handle}"),
            TaintReason::UnhashableFile(path) => write!(f, "unhashable file {}", path.display()),
            TaintReason::UnsnapshotableRead(name) => write!(f, "unhashable read of {name}"),
            TaintReason::CachingDisabled => f.write_str("caching disabled"),
        }
    }
}

/// Why a frame exited without committing a result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiscardReason {
    /// The frame was tainted while it ran.
    Tainted(TaintReason),
    /// The frame exited by raising.
    Raised,
    /// The return value is of a kind that is never cached.
    NonCacheableReturn,
    /// The codec failed to encode the return value.
    EncodeFault(String),
    /// The persistent store rejected the write.
    StoreFault,
}

/// Terminal state of a frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FrameState {
    /// The frame is open and recording dependencies.
    Accumulating,
    /// The result was committed to the cache.
    CommittedCacheable,
    /// The frame ran to completion but nothing was committed.
    CommittedUncacheable(DiscardReason),
    /// The result was replayed and the body never ran.
    ReplayedFromCache,
}

/// One open invocation.
#[derive(Debug)]
pub struct CallFrame {
    /// Entry time. Unique across the process.
    pub start_time: CallTime,
    /// The callable being run.
    pub code: CodeId,
    /// Key the result will be committed under, if it can be cached at all.
    pub key: Option<CacheKey>,
    /// Dependencies read so far, with the hashes first observed.
    pub snapshot: DependencySnapshot,
    /// Callables invoked directly from this frame.
    pub invoked: BTreeSet<CodeId>,
    taint: Option<TaintReason>,
}

impl CallFrame {
    /// Opens a frame.
    pub fn new(start_time: CallTime, code: CodeId, key: Option<CacheKey>) -> Self {
        Self {
            start_time,
            code,
            key,
            snapshot: DependencySnapshot::default(),
            invoked: BTreeSet::new(),
            taint: None,
        }
    }

    /// Returns `true` until the first taint.
    pub fn is_cacheable(&self) -> bool {
        self.taint.is_none()
    }

    /// The first taint observed, if any.
    pub fn taint(&self) -> Option<&TaintReason> {
        self.taint.as_ref()
    }

    /// Marks the frame non-cacheable. The first reason is kept.
    ///
    /// Returns `true` if the frame was cacheable before the call.
    pub fn mark_tainted(&mut self, reason: TaintReason) -> bool {
        if self.taint.is_some() {
            return false;
        }
        self.taint = Some(reason);
        true
    }
}

/// The stack of open frames, outermost first.
#[derive(Debug, Default)]
pub struct FrameStack {
    frames: Vec<CallFrame>,
}

impl FrameStack {
    /// Creates an empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes a newly entered frame.
    ///
    /// Start times must increase from bottom to top.
    pub fn push(&mut self, frame: CallFrame) -> MemoResult<()> {
        if let Some(top) = self.frames.last() {
            if top.start_time >= frame.start_time {
                return Err(InternalError::new(format!(
                    "frame entered at {} inside frame entered at {}",
                    frame.start_time, top.start_time
                )));
            }
        }
        self.frames.push(frame);
        Ok(())
    }

    /// Pops the innermost frame.
    pub fn pop(&mut self) -> MemoResult<CallFrame> {
        self.frames
            .pop()
            .ok_or_else(|| InternalError::new("frame exit with an empty frame stack"))
    }

    /// The innermost open frame.
    pub fn current(&self) -> Option<&CallFrame> {
        self.frames.last()
    }

    /// The innermost open frame, mutably.
    pub fn current_mut(&mut self) -> Option<&mut CallFrame> {
        self.frames.last_mut()
    }

    /// Returns `true` if a frame that started at `time` is still open.
    pub fn is_active(&self, time: CallTime) -> bool {
        self.frames
            .binary_search_by(|f| f.start_time.cmp(&time))
            .is_ok()
    }

    /// Taints every open frame. Returns how many were newly tainted.
    pub fn taint_all(&mut self, reason: &TaintReason) -> usize {
        self.frames
            .iter_mut()
            .map(|f| f.mark_tainted(reason.clone()))
            .filter(|&newly| newly)
            .count()
    }

    /// Taints every open frame that started at or after `since`.
    ///
    /// These are the frame entered at `since` and everything nested in it.
    pub fn taint_since(&mut self, since: CallTime, reason: &TaintReason) -> usize {
        let first = self.frames.partition_point(|f| f.start_time < since);
        self.frames[first..]
            .iter_mut()
            .map(|f| f.mark_tainted(reason.clone()))
            .filter(|&newly| newly)
            .count()
    }

    /// Number of open frames.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Returns `true` if no frame is open.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Open frames, outermost first.
    pub fn iter(&self) -> impl Iterator<Item = &CallFrame> {
        self.frames.iter()
    }
}
