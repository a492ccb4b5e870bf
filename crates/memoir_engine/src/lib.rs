//! Dependency tracking and call boundary protocol for the memoir
//! memoization runtime.
//!
//! A host evaluation loop reports calls, returns, reads, writes, mutations
//! and file accesses to an [`Engine`]. The engine keys each call by its
//! callable's canonical name, code hash and argument signature, replays a
//! stored result when every dependency it recorded is unchanged, and
//! otherwise lets the call run and commits its result if nothing observed
//! during the call made it unsafe to cache.

#![warn(missing_docs)]

pub mod codec;
pub mod engine;
pub mod environment;
pub mod frame;
pub mod policy;
pub mod reachability;
pub mod registry;
pub mod shadow;
pub mod value;

pub use codec::{BincodeCodec, CodecError, StoredBody, StoredValue, ValueCodec};
pub use engine::{Engine, EngineStats, FrameEntry};
pub use environment::{Environment, SimpleEnvironment, StateView};
pub use frame::{CallClock, CallFrame, CallTime, DiscardReason, FrameStack, FrameState, TaintReason};
pub use policy::{CachePolicy, Cacheability};
pub use reachability::{MutationScope, ObjectMetadata, ReachabilityTracker};
pub use registry::{CodeInfo, CodeRegistry, CodeUnit};
pub use shadow::ShadowTable;
pub use value::{
    CodeId, FileMode, FileRef, HeapObject, ObjRef, ObjectBody, ObjectId, Value, ValueKind,
    WeakObjRef,
};
