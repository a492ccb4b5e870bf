//! The call boundary protocol.
//!
//! [`Engine`] receives the host's evaluation events in program order and
//! drives the other components: it opens and closes frames, keys calls,
//! replays valid cached results, records dependencies, propagates
//! reachability, taints frames on side effects and commits results.
//!
//! Nothing the host program does is reported back as an error. A method
//! returning `Err` has detected an inconsistency in the engine's own
//! bookkeeping; the host must stop memoizing rather than risk a wrong
//! cached result.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::Path;

use memoir_cache::{Cache, CacheKey, Lookup};
use memoir_common::{InternalError, MemoResult};
use memoir_config::{ConfigError, IgnoreConfig, MemoConfig};
use tracing::{debug, info, trace, warn};

use crate::codec::{BincodeCodec, ValueCodec};
use crate::environment::{dependency_hash, Environment, ReadHash, SimpleEnvironment, StateView};
use crate::frame::{
    CallClock, CallFrame, CallTime, DiscardReason, FrameStack, FrameState, TaintReason,
};
use crate::policy::CachePolicy;
use crate::reachability::ReachabilityTracker;
use crate::registry::{CodeInfo, CodeRegistry, CodeUnit};
use crate::value::{CodeId, FileRef, ObjRef, ObjectId, Value};

/// What the host does after [`Engine::enter_frame`].
#[derive(Debug)]
pub enum FrameEntry {
    /// Run the body, then report [`Engine::exit_frame`].
    Execute {
        /// Start time assigned to the new frame.
        start_time: CallTime,
    },
    /// Skip the body and return this value. The frame is already closed.
    Replay(Value),
}

impl FrameEntry {
    /// State of the new frame once entry returns.
    pub fn state(&self) -> FrameState {
        match self {
            FrameEntry::Execute { .. } => FrameState::Accumulating,
            FrameEntry::Replay(_) => FrameState::ReplayedFromCache,
        }
    }
}

/// Counters for one run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    /// Calls replayed from the cache.
    pub hits: u64,
    /// Keyed calls with no valid cached result.
    pub misses: u64,
    /// Results committed.
    pub commits: u64,
    /// Frames that exited without committing.
    pub discards: u64,
    /// Cache entries removed by eager invalidation.
    pub invalidations: u64,
    /// Cached payloads that failed to decode.
    pub decode_faults: u64,
    /// Failed writes to the persistent store.
    pub store_faults: u64,
}

impl fmt::Display for EngineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} hits, {} misses, {} commits, {} discards, {} invalidations",
            self.hits, self.misses, self.commits, self.discards, self.invalidations
        )
    }
}

/// A shared binding: a global name or a namespace attribute.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
enum Binding {
    Global(String),
    Attribute(String),
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Binding::Global(name) | Binding::Attribute(name) => f.write_str(name),
        }
    }
}

/// The bindings one object is directly bound under.
struct BoundNames {
    serial: u64,
    names: BTreeSet<Binding>,
}

/// Memoization engine for one program run.
pub struct Engine<E: Environment = SimpleEnvironment> {
    env: E,
    codec: Box<dyn ValueCodec>,
    policy: CachePolicy,
    ignore: IgnoreConfig,
    cache: Option<Cache>,
    registry: CodeRegistry,
    tracker: ReachabilityTracker,
    frames: FrameStack,
    clock: CallClock,
    by_object: HashMap<ObjectId, BoundNames>,
    bound: HashMap<Binding, ObjectId>,
    files: HashMap<u64, FileRef>,
    stats: EngineStats,
    finalized: bool,
}

impl<E: Environment> Engine<E> {
    /// Creates an engine using the default codec.
    pub fn new(config: &MemoConfig, env: E) -> Self {
        Self::with_codec(config, env, Box::new(BincodeCodec))
    }

    /// Creates an engine with a custom codec.
    ///
    /// The persistent cache is loaded here. A missing cache starts empty; a
    /// damaged one disables caching for this run and is left on disk.
    pub fn with_codec(config: &MemoConfig, env: E, codec: Box<dyn ValueCodec>) -> Self {
        let cache = if config.cache.enabled {
            match Cache::load_or_create(&config.cache.dir, &config.cache.runtime_version) {
                Ok(cache) => Some(cache),
                Err(e) => {
                    warn!(error = %e, "cache store unreadable; caching disabled for this run");
                    None
                }
            }
        } else {
            None
        };
        let mut registry = CodeRegistry::new();
        if let Some(cache) = &cache {
            registry.import_dependencies(cache.code_dependencies());
        }
        debug!(
            enabled = cache.is_some(),
            dir = %config.cache.dir.display(),
            "memoization engine started"
        );
        Self {
            env,
            codec,
            policy: CachePolicy::from_config(&config.policy),
            ignore: config.ignore.clone(),
            cache,
            registry,
            tracker: ReachabilityTracker::new(),
            frames: FrameStack::new(),
            clock: CallClock::new(),
            by_object: HashMap::new(),
            bound: HashMap::new(),
            files: HashMap::new(),
            stats: EngineStats::default(),
            finalized: false,
        }
    }

    /// Loads `memoir.toml` from `program_dir` (if present) and creates an
    /// engine. A relative cache directory is resolved against
    /// `program_dir`.
    pub fn open(program_dir: &Path, env: E) -> Result<Self, ConfigError> {
        let mut config = memoir_config::load_config_or_default(program_dir)?;
        if config.cache.dir.is_relative() {
            config.cache.dir = program_dir.join(&config.cache.dir);
        }
        Ok(Self::new(&config, env))
    }

    // --- Code registration ---

    /// Registers a callable unit the host just created.
    ///
    /// Cached results recorded against a different version of the unit's
    /// code are dropped.
    pub fn register_code(&mut self, unit: &CodeUnit) -> MemoResult<CodeId> {
        let id = self.registry.register(unit, &self.ignore);
        let info = self.registry.info(id)?;
        if info.ignored {
            return Ok(id);
        }
        let hash = info.code_hash;
        let name = self.registry.name(id)?.to_string();
        if let Some(cache) = self.cache.as_mut() {
            let removed = cache.invalidate_stale_code(&name, hash);
            if removed > 0 {
                debug!(callable = %name, removed, "code changed; entries dropped");
                self.stats.invalidations += removed as u64;
            }
        }
        Ok(id)
    }

    /// Records a class namespace created by the host.
    ///
    /// Redefining a class already created in this run is a write to every
    /// attribute of its namespace.
    pub fn class_created(&mut self, module: &str, name: &str, methods: &[String]) -> String {
        let namespace = format!("{module}.{name}");
        if self.registry.is_class(&namespace) {
            self.frames
                .taint_all(&TaintReason::NamespaceWrite(namespace.clone()));
            if let Some(cache) = self.cache.as_mut() {
                self.stats.invalidations += cache.invalidate_namespace(&namespace) as u64;
            }
        }
        self.registry.record_class(&namespace, methods);
        trace!(namespace = %namespace, methods = methods.len(), "class created");
        namespace
    }

    // --- Frame boundaries ---

    /// Opens a frame for a call of `code` with `args`.
    ///
    /// If a valid result is cached for the call, the frame is closed again
    /// immediately and the result is returned for replay.
    #[tracing::instrument(level = "trace", skip_all, fields(code = code.as_raw()))]
    pub fn enter_frame(&mut self, code: CodeId, args: &[Value]) -> MemoResult<FrameEntry> {
        let start_time = self.clock.tick();
        let info = self.registry.info(code)?.clone();
        let name = self.registry.name(code)?.to_string();

        if let Some(parent) = self.frames.current_mut() {
            parent.invoked.insert(code);
            parent.snapshot.record_code(&name, info.code_hash);
            let caller = parent.code;
            self.registry.record_invocation(caller, code)?;
        }

        let (key, taint) = self.call_key(&name, &info, args);
        let mut frame = CallFrame::new(start_time, code, key.clone());
        if let Some(reason) = taint {
            trace!(callable = %name, %reason, "frame not cacheable on entry");
            frame.mark_tainted(reason);
        }
        self.frames.push(frame)?;
        for arg in args {
            if let Value::Object(obj) = arg {
                self.tracker
                    .note_argument_reachable(obj, start_time, &self.frames)?;
            }
        }

        let (Some(key), Some(cache)) = (key, self.cache.as_ref()) else {
            return Ok(FrameEntry::Execute { start_time });
        };
        let view = StateView {
            env: &self.env,
            codec: self.codec.as_ref(),
            policy: &self.policy,
            registry: &self.registry,
        };
        match cache.lookup(&key, &view) {
            Lookup::Hit(hit) => match self.codec.decode(&hit.payload) {
                Ok(value) => {
                    self.frames.pop()?;
                    if let Some(parent) = self.frames.current_mut() {
                        parent.snapshot.merge(&hit.snapshot);
                    }
                    self.stats.hits += 1;
                    debug!(callable = %name, "replayed from cache");
                    Ok(FrameEntry::Replay(value))
                }
                Err(e) => {
                    self.stats.decode_faults += 1;
                    self.stats.misses += 1;
                    warn!(callable = %name, error = %e, "cached result unreadable; executing");
                    Ok(FrameEntry::Execute { start_time })
                }
            },
            Lookup::Miss(reason) => {
                self.stats.misses += 1;
                trace!(callable = %name, ?reason, "cache miss");
                Ok(FrameEntry::Execute { start_time })
            }
        }
    }

    fn call_key(
        &self,
        name: &str,
        info: &CodeInfo,
        args: &[Value],
    ) -> (Option<CacheKey>, Option<TaintReason>) {
        if info.ignored {
            return (None, Some(TaintReason::IgnoredCode));
        }
        if self.cache.is_none() || self.finalized {
            return (None, Some(TaintReason::CachingDisabled));
        }
        if !args.iter().all(|a| self.policy.is_cacheable(a)) {
            return (None, Some(TaintReason::UnencodableArguments));
        }
        match self.codec.signature(args) {
            Ok(signature) => (
                Some(CacheKey::new(name, info.code_hash, signature)),
                None,
            ),
            Err(e) => {
                trace!(callable = %name, error = %e, "arguments not encodable");
                (None, Some(TaintReason::UnencodableArguments))
            }
        }
    }

    /// Closes the innermost frame.
    ///
    /// `returned` is the return value, or `None` if the frame raised.
    /// The frame's dependencies are folded into its caller whether or not
    /// the result was committed.
    #[tracing::instrument(level = "trace", skip_all)]
    pub fn exit_frame(&mut self, returned: Option<&Value>) -> MemoResult<FrameState> {
        let mut frame = self.frames.pop()?;
        let name = self.registry.name(frame.code)?.to_string();
        for callee in self.registry.transitive_callees(&name) {
            if let Some(hash) = self.registry.code_hash_by_name(&callee) {
                frame.snapshot.record_code(&callee, hash);
            }
        }

        let state = match self.commit_frame(&frame, returned) {
            Ok(()) => {
                self.stats.commits += 1;
                debug!(callable = %name, "result committed");
                FrameState::CommittedCacheable
            }
            Err(reason) => {
                self.stats.discards += 1;
                debug!(callable = %name, ?reason, "result discarded");
                FrameState::CommittedUncacheable(reason)
            }
        };

        if let Some(parent) = self.frames.current_mut() {
            parent.snapshot.merge(&frame.snapshot);
        }
        Ok(state)
    }

    fn commit_frame(
        &mut self,
        frame: &CallFrame,
        returned: Option<&Value>,
    ) -> Result<(), DiscardReason> {
        if let Some(reason) = frame.taint() {
            return Err(DiscardReason::Tainted(reason.clone()));
        }
        let Some(value) = returned else {
            return Err(DiscardReason::Raised);
        };
        let (Some(key), Some(cache)) = (&frame.key, self.cache.as_mut()) else {
            return Err(DiscardReason::Tainted(TaintReason::CachingDisabled));
        };
        if !self.policy.is_cacheable(value) {
            return Err(DiscardReason::NonCacheableReturn);
        }
        let payload = self
            .codec
            .encode(value)
            .map_err(|e| DiscardReason::EncodeFault(e.to_string()))?;
        if let Err(e) = cache.commit(key.clone(), &payload, frame.snapshot.clone()) {
            warn!(error = %e, "cache store failed; caching disabled for this run");
            self.cache = None;
            self.stats.store_faults += 1;
            return Err(DiscardReason::StoreFault);
        }
        Ok(())
    }

    // --- Shared bindings ---

    /// Reports that a global name was bound to `value`.
    ///
    /// Open frames are tainted. Cached results that recorded a different
    /// value for the name are dropped at once; results that recorded the
    /// same value stay valid.
    pub fn bind_global(&mut self, name: &str, value: &Value) -> MemoResult<()> {
        self.shared_write(Binding::Global(name.to_string()), Some(value))
    }

    /// Reports that a global name was deleted.
    pub fn unbind_global(&mut self, name: &str) -> MemoResult<()> {
        self.shared_write(Binding::Global(name.to_string()), None)
    }

    /// Reports that an attribute of a module, type or class was set.
    pub fn bind_attribute(&mut self, namespace: &str, attr: &str, value: &Value) -> MemoResult<()> {
        self.shared_write(Binding::Attribute(format!("{namespace}.{attr}")), Some(value))
    }

    /// Reports that an attribute of a module, type or class was deleted.
    pub fn unbind_attribute(&mut self, namespace: &str, attr: &str) -> MemoResult<()> {
        self.shared_write(Binding::Attribute(format!("{namespace}.{attr}")), None)
    }

    fn shared_write(&mut self, binding: Binding, value: Option<&Value>) -> MemoResult<()> {
        let reason = match &binding {
            Binding::Global(name) => TaintReason::GlobalWrite(name.clone()),
            Binding::Attribute(name) => TaintReason::NamespaceWrite(name.clone()),
        };
        let tainted = self.frames.taint_all(&reason);
        let current = value.and_then(|v| {
            match dependency_hash(self.codec.as_ref(), &self.policy, &self.registry, v) {
                ReadHash::Hash(hash) => Some(hash),
                ReadHash::Skip | ReadHash::Unhashable => None,
            }
        });
        let removed = match (self.cache.as_mut(), &binding) {
            (Some(cache), Binding::Global(name)) => cache.invalidate_global_changed(name, current),
            (Some(cache), Binding::Attribute(name)) => {
                cache.invalidate_attribute_changed(name, current)
            }
            (None, _) => 0,
        };
        self.stats.invalidations += removed as u64;
        trace!(%binding, tainted, removed, "shared binding written");

        self.untrack_binding(&binding);
        if let Some(Value::Object(obj)) = value {
            self.track_binding(binding, obj)?;
        }
        Ok(())
    }

    fn track_binding(&mut self, binding: Binding, obj: &ObjRef) -> MemoResult<()> {
        self.tracker.mark_global_container(obj, obj)?;
        let entry = self.by_object.entry(obj.id()).or_insert_with(|| BoundNames {
            serial: obj.serial(),
            names: BTreeSet::new(),
        });
        if entry.serial != obj.serial() {
            entry.serial = obj.serial();
            entry.names.clear();
        }
        entry.names.insert(binding.clone());
        self.bound.insert(binding, obj.id());
        Ok(())
    }

    fn untrack_binding(&mut self, binding: &Binding) {
        let Some(id) = self.bound.remove(binding) else {
            return;
        };
        if let Some(entry) = self.by_object.get_mut(&id) {
            entry.names.remove(binding);
            if entry.names.is_empty() {
                self.by_object.remove(&id);
            }
        }
    }

    fn bindings_of(&self, obj: &ObjRef) -> BTreeSet<Binding> {
        self.by_object
            .get(&obj.id())
            .filter(|b| b.serial == obj.serial())
            .map(|b| b.names.clone())
            .unwrap_or_default()
    }

    // --- Reads ---

    /// Reports a read of a global name that produced `value`.
    pub fn read_global(&mut self, name: &str, value: &Value) -> MemoResult<()> {
        self.shared_read(Binding::Global(name.to_string()), value)
    }

    /// Reports an attribute read `base.attr` that produced `value`.
    ///
    /// Reads through a module or type are dependencies on the qualified
    /// attribute. Reads through an object make the result reachable from
    /// that object.
    pub fn read_attribute(&mut self, base: &Value, attr: &str, value: &Value) -> MemoResult<()> {
        if let Some(namespace) = base.namespace() {
            let binding = Binding::Attribute(format!("{namespace}.{attr}"));
            return self.shared_read(binding, value);
        }
        match (base, value) {
            (Value::Object(parent), Value::Object(child)) => {
                self.tracker
                    .extend_reachability(parent, child, &self.frames)
            }
            _ => Ok(()),
        }
    }

    /// Reports that `value` was read out of `container` by index or key.
    pub fn read_item(&mut self, container: &ObjRef, value: &Value) -> MemoResult<()> {
        match value {
            Value::Object(child) => self
                .tracker
                .extend_reachability(container, child, &self.frames),
            _ => Ok(()),
        }
    }

    /// Reports that `value` is about to be stored into `container`.
    ///
    /// This is a mutation of `container`, after which `value` is reachable
    /// from it.
    pub fn store_member(&mut self, container: &ObjRef, value: &Value) -> MemoResult<()> {
        self.about_to_mutate(container)?;
        self.read_item(container, value)
    }

    fn shared_read(&mut self, binding: Binding, value: &Value) -> MemoResult<()> {
        if let Value::Object(obj) = value {
            if self.bound.get(&binding) != Some(&obj.id()) {
                self.untrack_binding(&binding);
                self.track_binding(binding.clone(), obj)?;
            }
        }
        let Some(frame) = self.frames.current() else {
            return Ok(());
        };
        let seen = match &binding {
            Binding::Global(name) => frame.snapshot.globals.contains_key(name),
            Binding::Attribute(name) => frame.snapshot.attributes.contains_key(name),
        };
        if seen {
            return Ok(());
        }
        match dependency_hash(self.codec.as_ref(), &self.policy, &self.registry, value) {
            ReadHash::Skip => {}
            ReadHash::Hash(hash) => {
                let frame = self
                    .frames
                    .current_mut()
                    .ok_or_else(|| InternalError::new("frame vanished during a read"))?;
                match &binding {
                    Binding::Global(name) => frame.snapshot.record_global(name, hash),
                    Binding::Attribute(name) => frame.snapshot.record_attribute(name, hash),
                }
            }
            ReadHash::Unhashable => {
                let tainted = self
                    .frames
                    .taint_all(&TaintReason::UnsnapshotableRead(binding.to_string()));
                trace!(%binding, tainted, "read of unhashable shared value");
            }
        }
        Ok(())
    }

    // --- Mutation ---

    /// Reports that an attribute or item of `obj` is about to be modified
    /// or deleted.
    ///
    /// Mutating an object reachable from a global binding taints every
    /// open frame and drops cached results that recorded the binding.
    /// Mutating an argument taints the outermost frame it was passed into
    /// and every frame nested in it. Mutating a local object has no
    /// effect.
    #[tracing::instrument(level = "trace", skip_all)]
    pub fn about_to_mutate(&mut self, obj: &ObjRef) -> MemoResult<()> {
        let scope = self.tracker.note_about_to_mutate(obj, &self.frames)?;
        let mut bindings = self.bindings_of(obj);
        if let Some(container) = &scope.global_container {
            bindings.extend(self.bindings_of(container));
        }
        if scope.is_local() && bindings.is_empty() {
            return Ok(());
        }

        if scope.global_container.is_some() || !bindings.is_empty() {
            let tainted = self.frames.taint_all(&TaintReason::GlobalMutation);
            let mut removed = 0;
            if let Some(cache) = self.cache.as_mut() {
                for binding in &bindings {
                    removed += match binding {
                        Binding::Global(name) => cache.invalidate_global(name),
                        Binding::Attribute(name) => cache.invalidate_attribute(name),
                    };
                }
            }
            self.stats.invalidations += removed as u64;
            debug!(object = ?obj, tainted, removed, "global-reachable object mutated");
        }
        if let Some(since) = scope.arg_reachable_since {
            let tainted = self
                .frames
                .taint_since(since, &TaintReason::ArgumentMutation);
            trace!(object = ?obj, %since, tainted, "argument mutated");
        }
        Ok(())
    }

    /// Reports a call of the natively implemented method `method` on
    /// `receiver`. Known mutators count as mutations of the receiver.
    pub fn about_to_call_native_method(&mut self, method: &str, receiver: &Value) -> MemoResult<()> {
        match receiver {
            Value::Object(obj) if self.policy.is_native_mutator(method) => self.about_to_mutate(obj),
            _ => Ok(()),
        }
    }

    // --- Files ---

    /// Reports that a file handle was opened. Opening for writing counts
    /// as a write.
    pub fn file_opened(&mut self, file: &FileRef) {
        self.files.insert(file.handle, file.clone());
        if file.mode.writes() {
            self.file_written(file.handle);
        }
    }

    /// Reports a read through a file handle.
    ///
    /// The file's current content hash becomes a dependency of the
    /// innermost frame.
    pub fn file_read(&mut self, handle: u64) {
        let Some(file) = self.files.get(&handle) else {
            self.frames.taint_all(&TaintReason::UnknownFile(handle));
            return;
        };
        let Some(frame) = self.frames.current_mut() else {
            return;
        };
        match self.env.file_hash(&file.path) {
            Some(hash) => frame.snapshot.record_file(&file.path, hash),
            None => {
                let reason = TaintReason::UnhashableFile(file.path.clone());
                self.frames.taint_all(&reason);
            }
        }
    }

    /// Reports that a file handle is about to be written to.
    pub fn file_about_to_write(&mut self, handle: u64) {
        self.file_written(handle);
    }

    /// Reports that a file handle's file was truncated.
    pub fn file_truncated(&mut self, handle: u64) {
        self.file_written(handle);
    }

    /// Reports that a file handle was closed.
    pub fn file_closed(&mut self, handle: u64) {
        if self.files.remove(&handle).is_none() {
            trace!(handle, "close of unknown file handle");
        }
    }

    fn file_written(&mut self, handle: u64) {
        let Some(file) = self.files.get(&handle) else {
            self.frames.taint_all(&TaintReason::UnknownFile(handle));
            return;
        };
        let path = file.path.clone();
        let tainted = self.frames.taint_all(&TaintReason::FileWrite(path.clone()));
        let removed = self
            .cache
            .as_mut()
            .map_or(0, |cache| cache.invalidate_file(&path));
        self.stats.invalidations += removed as u64;
        debug!(path = %path.display(), tainted, removed, "file written");
    }

    // --- Teardown ---

    /// Flushes the cache and stops memoizing.
    ///
    /// Frames still open are discarded. Calling this more than once has no
    /// further effect. Also runs on drop.
    pub fn finalize(&mut self) -> EngineStats {
        if self.finalized {
            return self.stats;
        }
        self.finalized = true;
        if !self.frames.is_empty() {
            warn!(open = self.frames.depth(), "finalized with open frames");
        }
        let deps = self.registry.export_dependencies();
        if let Some(cache) = self.cache.as_mut() {
            cache.set_code_dependencies(deps);
            if let Err(e) = cache.save() {
                warn!(error = %e, "failed to flush cache manifest");
                self.stats.store_faults += 1;
            }
        }
        info!(
            hits = self.stats.hits,
            misses = self.stats.misses,
            commits = self.stats.commits,
            discards = self.stats.discards,
            invalidations = self.stats.invalidations,
            "memoization finished"
        );
        self.stats
    }

    // --- Accessors ---

    /// Counters so far.
    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    /// The persistent cache, unless caching is disabled.
    pub fn cache(&self) -> Option<&Cache> {
        self.cache.as_ref()
    }

    /// Returns `true` while results can still be committed.
    pub fn is_caching_enabled(&self) -> bool {
        self.cache.is_some() && !self.finalized
    }

    /// The code registry.
    pub fn registry(&self) -> &CodeRegistry {
        &self.registry
    }

    /// The reachability tracker.
    pub fn tracker(&self) -> &ReachabilityTracker {
        &self.tracker
    }

    /// The open frames.
    pub fn frames(&self) -> &FrameStack {
        &self.frames
    }

    /// The host environment.
    pub fn env(&self) -> &E {
        &self.env
    }

    /// The host environment, mutably.
    pub fn env_mut(&mut self) -> &mut E {
        &mut self.env
    }
}

impl<E: Environment> Drop for Engine<E> {
    fn drop(&mut self) {
        self.finalize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{FileMode, ObjectBody};
    use std::path::PathBuf;

    fn engine_in(dir: &Path) -> Engine {
        let mut config = MemoConfig::default();
        config.cache.dir = dir.join("cache");
        Engine::new(&config, SimpleEnvironment::new())
    }

    fn unit(qualname: &str, code: &[u8]) -> CodeUnit {
        CodeUnit {
            module: "app".to_string(),
            qualname: qualname.to_string(),
            filename: PathBuf::from("app.src"),
            code: code.to_vec(),
            is_generator: false,
        }
    }

    fn execute(engine: &mut Engine, code: CodeId, args: &[Value]) -> CallTime {
        match engine.enter_frame(code, args).unwrap() {
            FrameEntry::Execute { start_time } => start_time,
            FrameEntry::Replay(v) => panic!("unexpected replay of {v:?}"),
        }
    }

    fn discarded(state: FrameState) -> DiscardReason {
        match state {
            FrameState::CommittedUncacheable(reason) => reason,
            other => panic!("expected a discard, got {other:?}"),
        }
    }

    #[test]
    fn plain_call_commits() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_in(dir.path());
        let f = engine.register_code(&unit("square", b"f")).unwrap();
        execute(&mut engine, f, &[Value::Int(4)]);
        let state = engine.exit_frame(Some(&Value::Int(16))).unwrap();
        assert_eq!(state, FrameState::CommittedCacheable);
        assert_eq!(engine.cache().unwrap().len(), 1);
        assert_eq!(engine.stats().commits, 1);
        assert_eq!(engine.stats().misses, 1);
    }

    #[test]
    fn second_call_in_same_run_replays() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_in(dir.path());
        let f = engine.register_code(&unit("square", b"f")).unwrap();
        execute(&mut engine, f, &[Value::Int(4)]);
        engine.exit_frame(Some(&Value::Int(16))).unwrap();

        let entry = engine.enter_frame(f, &[Value::Int(4)]).unwrap();
        assert_eq!(entry.state(), FrameState::ReplayedFromCache);
        match entry {
            FrameEntry::Replay(Value::Int(16)) => {}
            other => panic!("expected replay, got {other:?}"),
        }
        assert!(engine.frames().is_empty());
        assert_eq!(engine.stats().hits, 1);
    }

    #[test]
    fn raised_frames_are_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_in(dir.path());
        let f = engine.register_code(&unit("parse", b"f")).unwrap();
        execute(&mut engine, f, &[Value::str("x")]);
        assert_eq!(discarded(engine.exit_frame(None).unwrap()), DiscardReason::Raised);
        assert!(engine.cache().unwrap().is_empty());
    }

    #[test]
    fn ignored_code_is_never_keyed() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_in(dir.path());
        let mut gen = unit("chunks", b"g");
        gen.is_generator = true;
        let g = engine.register_code(&gen).unwrap();
        execute(&mut engine, g, &[]);
        assert_eq!(
            discarded(engine.exit_frame(Some(&Value::None)).unwrap()),
            DiscardReason::Tainted(TaintReason::IgnoredCode)
        );
        assert_eq!(engine.stats().misses, 0);
    }

    #[test]
    fn non_cacheable_returns_are_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_in(dir.path());
        let f = engine.register_code(&unit("opener", b"f")).unwrap();
        let handle = Value::File(FileRef {
            handle: 9,
            path: dir.path().join("out.txt"),
            mode: FileMode::Read,
        });
        for returned in [handle, Value::Callable(f), Value::Module("os".into())] {
            execute(&mut engine, f, &[Value::Int(1)]);
            assert_eq!(
                discarded(engine.exit_frame(Some(&returned)).unwrap()),
                DiscardReason::NonCacheableReturn
            );
        }
        assert!(engine.cache().unwrap().is_empty());
    }

    #[test]
    fn unencodable_arguments_disable_caching_for_the_call() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_in(dir.path());
        let f = engine.register_code(&unit("apply", b"f")).unwrap();
        execute(&mut engine, f, &[Value::Callable(f)]);
        assert_eq!(
            discarded(engine.exit_frame(Some(&Value::Int(0))).unwrap()),
            DiscardReason::Tainted(TaintReason::UnencodableArguments)
        );
    }

    #[test]
    fn exit_without_frame_is_an_invariant_violation() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_in(dir.path());
        assert!(engine.exit_frame(Some(&Value::None)).is_err());
    }

    #[test]
    fn local_mutation_keeps_frame_cacheable() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_in(dir.path());
        let f = engine.register_code(&unit("build", b"f")).unwrap();
        execute(&mut engine, f, &[Value::Int(3)]);
        let local = ObjRef::list(vec![]);
        engine
            .about_to_call_native_method("append", &Value::Object(local.clone()))
            .unwrap();
        if let ObjectBody::List(items) = &mut *local.body_mut() {
            items.push(Value::Int(3));
        }
        let state = engine.exit_frame(Some(&Value::Object(local))).unwrap();
        assert_eq!(state, FrameState::CommittedCacheable);
    }

    #[test]
    fn global_mutation_taints_every_open_frame() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_in(dir.path());
        let outer = engine.register_code(&unit("outer", b"o")).unwrap();
        let inner = engine.register_code(&unit("inner", b"i")).unwrap();
        let g = ObjRef::list(vec![]);
        engine.env_mut().set_global("G", Value::Object(g.clone()));
        engine.bind_global("G", &Value::Object(g.clone())).unwrap();

        execute(&mut engine, outer, &[]);
        execute(&mut engine, inner, &[]);
        engine.about_to_mutate(&g).unwrap();
        for _ in 0..2 {
            assert_eq!(
                discarded(engine.exit_frame(Some(&Value::None)).unwrap()),
                DiscardReason::Tainted(TaintReason::GlobalMutation)
            );
        }
    }

    #[test]
    fn argument_mutation_spares_callers_that_did_not_pass_it() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_in(dir.path());
        let outer = engine.register_code(&unit("outer", b"o")).unwrap();
        let inner = engine.register_code(&unit("inner", b"i")).unwrap();

        execute(&mut engine, outer, &[Value::Int(1)]);
        let scratch = ObjRef::list(vec![]);
        execute(&mut engine, inner, &[Value::Object(scratch.clone())]);
        engine.about_to_mutate(&scratch).unwrap();
        assert_eq!(
            discarded(engine.exit_frame(Some(&Value::None)).unwrap()),
            DiscardReason::Tainted(TaintReason::ArgumentMutation)
        );
        assert_eq!(
            engine.exit_frame(Some(&Value::Int(1))).unwrap(),
            FrameState::CommittedCacheable
        );
    }

    #[test]
    fn member_of_global_inherits_container() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_in(dir.path());
        let f = engine.register_code(&unit("touch", b"f")).unwrap();
        let row = ObjRef::list(vec![Value::Int(0)]);
        let table = ObjRef::list(vec![Value::Object(row.clone())]);
        engine.bind_global("TABLE", &Value::Object(table.clone())).unwrap();

        execute(&mut engine, f, &[]);
        engine.read_global("TABLE", &Value::Object(table.clone())).unwrap();
        engine.read_item(&table, &Value::Object(row.clone())).unwrap();
        engine.about_to_mutate(&row).unwrap();
        assert_eq!(
            discarded(engine.exit_frame(Some(&Value::None)).unwrap()),
            DiscardReason::Tainted(TaintReason::GlobalMutation)
        );
    }

    #[test]
    fn global_write_inside_a_call_taints_it() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_in(dir.path());
        let f = engine.register_code(&unit("setup", b"f")).unwrap();
        execute(&mut engine, f, &[]);
        engine.bind_global("READY", &Value::Bool(true)).unwrap();
        assert_eq!(
            discarded(engine.exit_frame(Some(&Value::None)).unwrap()),
            DiscardReason::Tainted(TaintReason::GlobalWrite("READY".to_string()))
        );
    }

    #[test]
    fn unhashable_global_read_taints() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_in(dir.path());
        let f = engine.register_code(&unit("query", b"f")).unwrap();
        let cursor = Value::Object(ObjRef::foreign("sqlite3.Cursor", None));
        execute(&mut engine, f, &[]);
        engine.read_global("CURSOR", &cursor).unwrap();
        assert!(matches!(
            discarded(engine.exit_frame(Some(&Value::None)).unwrap()),
            DiscardReason::Tainted(TaintReason::UnsnapshotableRead(_))
        ));
    }

    #[test]
    fn callable_reads_record_identity() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_in(dir.path());
        let f = engine.register_code(&unit("main", b"f")).unwrap();
        execute(&mut engine, f, &[]);
        engine.read_global("helper", &Value::Callable(f)).unwrap();
        engine.read_global("Shape", &Value::Type("main.Square".into())).unwrap();
        engine.exit_frame(Some(&Value::None)).unwrap();
        let (_, entry) = engine.cache().unwrap().entries()[0];
        assert!(entry.snapshot.globals.contains_key("helper"));
        assert!(entry.snapshot.globals.contains_key("Shape"));
    }

    #[test]
    fn corrupt_manifest_disables_caching() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("cache");
        std::fs::create_dir_all(&cache_dir).unwrap();
        std::fs::write(cache_dir.join("manifest.json"), "{not json").unwrap();

        let mut engine = engine_in(dir.path());
        assert!(engine.cache().is_none());
        let f = engine.register_code(&unit("main", b"f")).unwrap();
        execute(&mut engine, f, &[]);
        assert_eq!(
            discarded(engine.exit_frame(Some(&Value::Int(1))).unwrap()),
            DiscardReason::Tainted(TaintReason::CachingDisabled)
        );
        engine.finalize();
        let content = std::fs::read_to_string(cache_dir.join("manifest.json")).unwrap();
        assert_eq!(content, "{not json");
    }

    #[test]
    fn unknown_file_handle_taints() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_in(dir.path());
        let f = engine.register_code(&unit("load", b"f")).unwrap();
        execute(&mut engine, f, &[]);
        engine.file_read(77);
        assert_eq!(
            discarded(engine.exit_frame(Some(&Value::None)).unwrap()),
            DiscardReason::Tainted(TaintReason::UnknownFile(77))
        );
    }

    #[test]
    fn opening_for_write_taints() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_in(dir.path());
        let f = engine.register_code(&unit("save", b"f")).unwrap();
        let path = dir.path().join("out.txt");
        execute(&mut engine, f, &[]);
        engine.file_opened(&FileRef {
            handle: 1,
            path: path.clone(),
            mode: FileMode::Write,
        });
        engine.file_closed(1);
        assert_eq!(
            discarded(engine.exit_frame(Some(&Value::None)).unwrap()),
            DiscardReason::Tainted(TaintReason::FileWrite(path))
        );
    }

    #[test]
    fn store_fault_disables_caching() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("cache");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let mut engine = engine_in(dir.path());
        let f = engine.register_code(&unit("square", b"f")).unwrap();

        execute(&mut engine, f, &[Value::Int(2)]);
        assert_eq!(
            discarded(engine.exit_frame(Some(&Value::Int(4))).unwrap()),
            DiscardReason::StoreFault
        );
        assert!(!engine.is_caching_enabled());
        assert_eq!(engine.stats().store_faults, 1);

        execute(&mut engine, f, &[Value::Int(2)]);
        assert_eq!(
            discarded(engine.exit_frame(Some(&Value::Int(4))).unwrap()),
            DiscardReason::Tainted(TaintReason::CachingDisabled)
        );
    }

    #[test]
    fn disabled_cache_never_commits() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = MemoConfig::default();
        config.cache.dir = dir.path().join("cache");
        config.cache.enabled = false;
        let mut engine = Engine::new(&config, SimpleEnvironment::new());
        let f = engine.register_code(&unit("square", b"f")).unwrap();
        execute(&mut engine, f, &[Value::Int(2)]);
        assert_eq!(
            discarded(engine.exit_frame(Some(&Value::Int(4))).unwrap()),
            DiscardReason::Tainted(TaintReason::CachingDisabled)
        );
        assert!(engine.cache().is_none());
    }

    #[test]
    fn finalize_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_in(dir.path());
        let f = engine.register_code(&unit("square", b"f")).unwrap();
        execute(&mut engine, f, &[Value::Int(2)]);
        engine.exit_frame(Some(&Value::Int(4))).unwrap();
        let first = engine.finalize();
        assert_eq!(engine.finalize(), first);
        assert!(!engine.is_caching_enabled());
        assert!(dir.path().join("cache").join("manifest.json").exists());
    }

    #[test]
    fn class_redefinition_invalidates_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_in(dir.path());
        let f = engine.register_code(&unit("area", b"f")).unwrap();
        let ns = engine.class_created("app", "Shape", &["area".to_string()]);
        assert_eq!(ns, "app.Shape");
        engine.env_mut().set_attribute("app.Shape", "SIDES", Value::Int(4));

        execute(&mut engine, f, &[]);
        engine
            .read_attribute(&Value::Type(ns.clone()), "SIDES", &Value::Int(4))
            .unwrap();
        engine.exit_frame(Some(&Value::Int(4))).unwrap();
        assert_eq!(engine.cache().unwrap().len(), 1);

        engine.class_created("app", "Shape", &[]);
        assert!(engine.cache().unwrap().is_empty());
    }
}
