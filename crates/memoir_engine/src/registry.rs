//! Code dependency registry.
//!
//! Every callable unit the host creates is registered once. Registration
//! derives a canonical name that is stable across runs, hashes the unit's
//! code, and decides whether the unit is ever memoized. The registry also
//! keeps the invocation graph between canonical names. The graph outlives
//! one run: it is exported into the cache manifest on finalize and
//! imported on startup, so a result recorded for `f` depends on the code
//! of everything `f` was ever seen to call.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::path::PathBuf;

use memoir_common::{ContentHash, Ident, Interner, InternalError, MemoResult};
use memoir_config::IgnoreConfig;

use crate::value::CodeId;

/// Qualified name the host gives to module bodies.
pub const MODULE_BODY: &str = "<module>";

/// A callable unit as the host describes it.
#[derive(Debug, Clone)]
pub struct CodeUnit {
    /// Defining module.
    pub module: String,
    /// Qualified name inside the module.
    pub qualname: String,
    /// Source file the unit was compiled from.
    pub filename: PathBuf,
    /// Compiled code. Formatting-only source edits leave it unchanged.
    pub code: Vec<u8>,
    /// Whether calling the unit produces a generator.
    pub is_generator: bool,
}

/// What the registry knows about one registered unit.
#[derive(Debug, Clone)]
pub struct CodeInfo {
    /// Interned canonical name.
    pub canonical_name: Ident,
    /// Content hash of the unit's code.
    pub code_hash: ContentHash,
    /// Never memoized.
    pub ignored: bool,
    /// Source file.
    pub filename: PathBuf,
}

/// Registry of callable units and the calls between them.
#[derive(Default)]
pub struct CodeRegistry {
    names: Interner,
    units: Vec<CodeInfo>,
    by_name: HashMap<Ident, CodeId>,
    invokes: HashMap<Ident, BTreeSet<Ident>>,
    classes: HashMap<String, Vec<String>>,
}

impl CodeRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Derives the canonical name of a unit.
    ///
    /// Anonymous units (qualified names such as `<lambda>`) share names
    /// within a module, so their code hash disambiguates them.
    pub fn canonical_name(unit: &CodeUnit, code_hash: ContentHash) -> String {
        if unit.qualname.starts_with('<') && unit.qualname != MODULE_BODY {
            let hex = code_hash.to_string();
            format!("{}.{}#{}", unit.module, unit.qualname, &hex[..8])
        } else {
            format!("{}.{}", unit.module, unit.qualname)
        }
    }

    /// Registers a unit and returns its handle.
    ///
    /// A unit registered under a name already in use replaces the earlier
    /// one for name lookups; handles to the earlier one stay valid.
    pub fn register(&mut self, unit: &CodeUnit, ignore: &IgnoreConfig) -> CodeId {
        let code_hash = ContentHash::from_bytes(&unit.code);
        let name = Self::canonical_name(unit, code_hash);
        let ignored = unit.qualname == MODULE_BODY
            || unit.is_generator
            || ignore.excludes(&unit.filename.to_string_lossy(), &name);
        let canonical_name = self.names.get_or_intern(&name);
        let id = CodeId::from_raw(self.units.len() as u32);
        self.units.push(CodeInfo {
            canonical_name,
            code_hash,
            ignored,
            filename: unit.filename.clone(),
        });
        self.by_name.insert(canonical_name, id);
        tracing::trace!(name = %name, hash = %code_hash, ignored, "registered code unit");
        id
    }

    /// Looks up a registered unit.
    pub fn info(&self, id: CodeId) -> MemoResult<&CodeInfo> {
        self.units
            .get(id.as_raw() as usize)
            .ok_or_else(|| InternalError::new(format!("unregistered code unit {}", id.as_raw())))
    }

    /// Canonical name of a registered unit.
    pub fn name(&self, id: CodeId) -> MemoResult<&str> {
        let info = self.info(id)?;
        self.names.resolve(info.canonical_name).ok_or_else(|| {
            InternalError::new(format!("code unit {} has no interned name", id.as_raw()))
        })
    }

    /// Current code hash of the unit registered under `name`, if any.
    pub fn code_hash_by_name(&self, name: &str) -> Option<ContentHash> {
        let ident = self.names.get(name)?;
        let id = self.by_name.get(&ident)?;
        self.units.get(id.as_raw() as usize).map(|u| u.code_hash)
    }

    /// Records that `caller` invoked `callee`.
    ///
    /// Returns `true` if the edge is new.
    pub fn record_invocation(&mut self, caller: CodeId, callee: CodeId) -> MemoResult<bool> {
        let from = self.info(caller)?.canonical_name;
        let to = self.info(callee)?.canonical_name;
        Ok(self.invokes.entry(from).or_default().insert(to))
    }

    /// Every name reachable from `name` in the invocation graph, excluding
    /// `name` itself unless it is recursive.
    pub fn transitive_callees(&self, name: &str) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        let Some(start) = self.names.get(name) else {
            return out;
        };
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([start]);
        while let Some(current) = queue.pop_front() {
            for &callee in self.invokes.get(&current).into_iter().flatten() {
                if seen.insert(callee) {
                    out.extend(self.names.resolve(callee).map(str::to_string));
                    queue.push_back(callee);
                }
            }
        }
        out
    }

    /// The invocation graph by name, for persisting.
    pub fn export_dependencies(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.invokes
            .iter()
            .filter_map(|(caller, callees)| {
                let caller = self.names.resolve(*caller)?.to_string();
                let callees = callees
                    .iter()
                    .filter_map(|c| self.names.resolve(*c))
                    .map(str::to_string)
                    .collect();
                Some((caller, callees))
            })
            .collect()
    }

    /// Merges a persisted invocation graph into this one.
    pub fn import_dependencies(&mut self, deps: &BTreeMap<String, BTreeSet<String>>) {
        for (caller, callees) in deps {
            let from = self.names.get_or_intern(caller);
            let set = self.invokes.entry(from).or_default();
            for callee in callees {
                set.insert(self.names.get_or_intern(callee));
            }
        }
    }

    /// Records a class namespace and its method names.
    pub fn record_class(&mut self, namespace: &str, methods: &[String]) {
        self.classes
            .insert(namespace.to_string(), methods.to_vec());
    }

    /// Returns `true` if `namespace` was created as a class.
    pub fn is_class(&self, namespace: &str) -> bool {
        self.classes.contains_key(namespace)
    }

    /// Methods recorded for a class namespace.
    pub fn class_methods(&self, namespace: &str) -> Option<&[String]> {
        self.classes.get(namespace).map(Vec::as_slice)
    }

    /// Number of registered units.
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Returns `true` if nothing was registered.
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}
