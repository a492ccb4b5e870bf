//! The host state a cached result is validated against.
//!
//! A stored result is only replayed while every global, attribute, file and
//! callable it read still hashes the same as when it was recorded. The
//! engine asks the host for current values through [`Environment`] and
//! hashes them itself, so validation uses exactly the rules that recorded
//! the snapshot.

use std::collections::HashMap;
use std::path::Path;

use memoir_cache::{DependencyState, FileHasher};
use memoir_common::{ContentHash, ContentHasher};

use crate::codec::ValueCodec;
use crate::policy::{CachePolicy, Cacheability};
use crate::registry::CodeRegistry;
use crate::value::Value;

/// Read access to the host's shared state.
pub trait Environment {
    /// The value currently bound to a global name.
    fn global(&self, name: &str) -> Option<Value>;

    /// The value of an attribute of a module, type or class namespace.
    fn attribute(&self, namespace: &str, attr: &str) -> Option<Value>;

    /// Current content hash of a file. `None` if it cannot be read.
    fn file_hash(&self, path: &Path) -> Option<ContentHash> {
        FileHasher::hash_file(path).ok()
    }
}

/// An [`Environment`] backed by plain maps, for hosts that mirror their
/// bindings into the engine.
#[derive(Debug, Default, Clone)]
pub struct SimpleEnvironment {
    globals: HashMap<String, Value>,
    attributes: HashMap<String, HashMap<String, Value>>,
}

impl SimpleEnvironment {
    /// Creates an environment with no bindings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a global name.
    pub fn set_global(&mut self, name: impl Into<String>, value: Value) {
        self.globals.insert(name.into(), value);
    }

    /// Removes a global binding.
    pub fn remove_global(&mut self, name: &str) -> Option<Value> {
        self.globals.remove(name)
    }

    /// Sets a namespace attribute.
    pub fn set_attribute(&mut self, namespace: &str, attr: &str, value: Value) {
        self.attributes
            .entry(namespace.to_string())
            .or_default()
            .insert(attr.to_string(), value);
    }

    /// Removes a namespace attribute.
    pub fn remove_attribute(&mut self, namespace: &str, attr: &str) -> Option<Value> {
        self.attributes.get_mut(namespace)?.remove(attr)
    }
}

impl Environment for SimpleEnvironment {
    fn global(&self, name: &str) -> Option<Value> {
        self.globals.get(name).cloned()
    }

    fn attribute(&self, namespace: &str, attr: &str) -> Option<Value> {
        self.attributes.get(namespace)?.get(attr).cloned()
    }
}

/// How a value read as a dependency enters a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadHash {
    /// Not a dependency. Only file handles.
    Skip,
    /// A dependency with this hash.
    Hash(ContentHash),
    /// A dependency whose value cannot be hashed.
    Unhashable,
}

/// Hash under which a read of `value` is recorded.
///
/// Callables, modules and types hash by identity: a callable by canonical
/// name and code hash, a module or type by qualified name. Rebinding a
/// name to another unit changes the hash; rebinding it to the same unit
/// does not.
pub(crate) fn dependency_hash(
    codec: &dyn ValueCodec,
    policy: &CachePolicy,
    registry: &CodeRegistry,
    value: &Value,
) -> ReadHash {
    match policy.classify(value) {
        Cacheability::Never => identity_hash(registry, value),
        Cacheability::DeniedForeign => ReadHash::Unhashable,
        Cacheability::ByValue | Cacheability::Structured => {
            if !policy.is_cacheable(value) {
                return ReadHash::Unhashable;
            }
            match codec.fingerprint(value) {
                Ok(hash) => ReadHash::Hash(hash),
                Err(_) => ReadHash::Unhashable,
            }
        }
    }
}

fn identity_hash(registry: &CodeRegistry, value: &Value) -> ReadHash {
    let mut hasher = ContentHasher::new();
    match value {
        Value::Callable(id) => {
            let (Ok(info), Ok(name)) = (registry.info(*id), registry.name(*id)) else {
                return ReadHash::Unhashable;
            };
            hasher.update(b"callable");
            hasher.update(name.as_bytes());
            hasher.update(info.code_hash.as_bytes());
        }
        Value::Module(name) => {
            hasher.update(b"module");
            hasher.update(name.as_bytes());
        }
        Value::Type(name) => {
            hasher.update(b"type");
            hasher.update(name.as_bytes());
        }
        _ => return ReadHash::Skip,
    }
    ReadHash::Hash(hasher.finish())
}

/// Splits `namespace.attr` at its last dot.
pub(crate) fn split_qualified(qualified: &str) -> Option<(&str, &str)> {
    qualified.rsplit_once('.')
}

/// [`DependencyState`] over a host [`Environment`].
pub struct StateView<'a> {
    /// Host state.
    pub env: &'a dyn Environment,
    /// Codec used for hashing.
    pub codec: &'a dyn ValueCodec,
    /// Policy deciding what is hashable.
    pub policy: &'a CachePolicy,
    /// Source of current code hashes.
    pub registry: &'a CodeRegistry,
}

impl StateView<'_> {
    fn hash_of(&self, value: Option<Value>) -> Option<ContentHash> {
        match dependency_hash(self.codec, self.policy, self.registry, &value?) {
            ReadHash::Hash(hash) => Some(hash),
            ReadHash::Skip | ReadHash::Unhashable => None,
        }
    }
}

impl DependencyState for StateView<'_> {
    fn global_hash(&self, name: &str) -> Option<ContentHash> {
        self.hash_of(self.env.global(name))
    }

    fn attribute_hash(&self, qualified: &str) -> Option<ContentHash> {
        let (namespace, attr) = split_qualified(qualified)?;
        self.hash_of(self.env.attribute(namespace, attr))
    }

    fn file_hash(&self, path: &Path) -> Option<ContentHash> {
        self.env.file_hash(path)
    }

    fn code_hash(&self, callable: &str) -> Option<ContentHash> {
        self.registry.code_hash_by_name(callable)
    }
}
