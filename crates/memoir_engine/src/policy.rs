//! Cacheability classification over value kinds.
//!
//! Every decision about whether a value may be persisted goes through
//! [`CachePolicy::classify`]; nothing else inspects kinds to decide.

use std::collections::HashSet;

use memoir_config::PolicyConfig;

use crate::value::{ObjectBody, Value};

/// Classification of a single value, ignoring what it contains.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Cacheability {
    /// Immutable primitive, always eligible and compared by value.
    ByValue,
    /// Container or instance; eligible if everything it holds is.
    Structured,
    /// Callables, modules, types and I/O handles.
    Never,
    /// Opaque extension object that is deny-listed or not allow-listed.
    DeniedForeign,
}

/// The cacheability policy in force for one engine.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    deny_types: HashSet<String>,
    allow_types: HashSet<String>,
    native_mutators: HashSet<String>,
}

impl CachePolicy {
    /// Builds the policy from the `[policy]` table.
    pub fn from_config(config: &PolicyConfig) -> Self {
        Self {
            deny_types: config.deny_types.iter().cloned().collect(),
            allow_types: config.allow_types.iter().cloned().collect(),
            native_mutators: config.native_mutators.iter().cloned().collect(),
        }
    }

    /// Classifies one value without looking inside it.
    pub fn classify(&self, value: &Value) -> Cacheability {
        match value {
            Value::None
            | Value::Bool(_)
            | Value::Int(_)
            | Value::Float(_)
            | Value::Complex { .. }
            | Value::Bytes(_)
            | Value::Str(_) => Cacheability::ByValue,
            Value::Callable(_) | Value::Module(_) | Value::Type(_) | Value::File(_) => {
                Cacheability::Never
            }
            Value::Object(obj) => {
                if self.deny_types.contains(obj.type_name()) {
                    return Cacheability::DeniedForeign;
                }
                match &*obj.body() {
                    ObjectBody::Foreign { .. } if !self.allow_types.contains(obj.type_name()) => {
                        Cacheability::DeniedForeign
                    }
                    _ => Cacheability::Structured,
                }
            }
        }
    }

    /// Returns `true` if `value` and everything reachable from it may be
    /// persisted.
    ///
    /// Objects already on the current path are not revisited; the codec
    /// rejects cycles separately.
    pub fn is_cacheable(&self, value: &Value) -> bool {
        let mut path = HashSet::new();
        self.check(value, &mut path)
    }

    fn check(&self, value: &Value, path: &mut HashSet<u64>) -> bool {
        match self.classify(value) {
            Cacheability::ByValue => true,
            Cacheability::Never | Cacheability::DeniedForeign => false,
            Cacheability::Structured => {
                let Value::Object(obj) = value else {
                    return true;
                };
                if !path.insert(obj.serial()) {
                    return true;
                }
                let ok = match &*obj.body() {
                    ObjectBody::List(items) | ObjectBody::Tuple(items) | ObjectBody::Set(items) => {
                        items.iter().all(|v| self.check(v, path))
                    }
                    ObjectBody::Dict(pairs) => pairs
                        .iter()
                        .all(|(k, v)| self.check(k, path) && self.check(v, path)),
                    ObjectBody::Instance { attrs, .. } => attrs.values().all(|v| self.check(v, path)),
                    ObjectBody::Foreign { .. } => true,
                };
                path.remove(&obj.serial());
                ok
            }
        }
    }

    /// Returns `true` if calling the native method `name` mutates its receiver.
    pub fn is_native_mutator(&self, name: &str) -> bool {
        self.native_mutators.contains(name)
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::from_config(&PolicyConfig::default())
    }
}
