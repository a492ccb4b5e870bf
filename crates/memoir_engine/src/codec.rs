//! Value codec: encoding for persisted results and content hashing.
//!
//! The engine treats the codec as pluggable. Its contract: every cacheable
//! kind round-trips, unsupported kinds fail explicitly instead of producing
//! bytes, and equal values produce equal bytes so that hashes of encodings
//! can serve as argument signatures and dependency hashes.

use std::collections::{BTreeMap, HashSet};

use memoir_common::{ContentHash, ContentHasher};
use serde::{Deserialize, Serialize};

use crate::value::{ObjRef, ObjectBody, Value, ValueKind};

/// Errors raised while encoding or decoding values.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The value's kind can never be persisted.
    #[error("values of kind {0:?} cannot be encoded")]
    Unsupported(ValueKind),

    /// The value contains a reference cycle.
    #[error("reference cycle through a {type_name} object")]
    Cycle {
        /// Type of the object closing the cycle.
        type_name: String,
    },

    /// An extension object with no exportable state.
    #[error("{type_name} object has no exportable state")]
    OpaqueState {
        /// The extension type.
        type_name: String,
    },

    /// The encoder failed.
    #[error("encode failed: {0}")]
    Encode(String),

    /// The bytes could not be decoded.
    #[error("decode failed: {0}")]
    Decode(String),
}

/// Pluggable serializer for host values.
pub trait ValueCodec {
    /// Encodes a value. Equal values must produce equal bytes.
    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError>;

    /// Decodes bytes produced by [`ValueCodec::encode`] into fresh objects.
    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError>;

    /// Content hash of a value's encoding.
    fn fingerprint(&self, value: &Value) -> Result<ContentHash, CodecError> {
        Ok(ContentHash::from_bytes(&self.encode(value)?))
    }

    /// Canonical signature of an argument list.
    fn signature(&self, args: &[Value]) -> Result<ContentHash, CodecError> {
        let mut hasher = ContentHasher::new();
        for arg in args {
            hasher.update(&self.encode(arg)?);
        }
        Ok(hasher.finish())
    }
}

/// Owned, serializable mirror of a cacheable [`Value`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoredValue {
    /// Absence marker.
    None,
    /// Boolean.
    Bool(bool),
    /// Integer.
    Int(i64),
    /// Float.
    Float(f64),
    /// Complex number.
    Complex(f64, f64),
    /// Byte text.
    Bytes(Vec<u8>),
    /// Unicode text.
    Str(String),
    /// Heap object with its exact type name.
    Object {
        /// Exact type name.
        type_name: String,
        /// Contents.
        body: StoredBody,
    },
}

/// Contents of a stored heap object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoredBody {
    /// List items.
    List(Vec<StoredValue>),
    /// Tuple items.
    Tuple(Vec<StoredValue>),
    /// Dict pairs in insertion order.
    Dict(Vec<(StoredValue, StoredValue)>),
    /// Set items in canonical order.
    Set(Vec<StoredValue>),
    /// Instance attributes.
    Instance {
        /// Class name.
        class: String,
        /// Attributes.
        attrs: BTreeMap<String, StoredValue>,
    },
    /// Exported extension state.
    Foreign(Vec<u8>),
}

impl StoredValue {
    /// Converts a live value, failing on anything that cannot be persisted.
    pub fn from_value(value: &Value) -> Result<Self, CodecError> {
        let mut path = HashSet::new();
        Self::convert(value, &mut path)
    }

    fn convert(value: &Value, path: &mut HashSet<u64>) -> Result<Self, CodecError> {
        Ok(match value {
            Value::None => StoredValue::None,
            Value::Bool(b) => StoredValue::Bool(*b),
            Value::Int(i) => StoredValue::Int(*i),
            Value::Float(f) => StoredValue::Float(*f),
            Value::Complex { re, im } => StoredValue::Complex(*re, *im),
            Value::Bytes(b) => StoredValue::Bytes(b.clone()),
            Value::Str(s) => StoredValue::Str(s.clone()),
            Value::Object(obj) => Self::convert_object(obj, path)?,
            other => return Err(CodecError::Unsupported(other.kind())),
        })
    }

    fn convert_object(obj: &ObjRef, path: &mut HashSet<u64>) -> Result<Self, CodecError> {
        if !path.insert(obj.serial()) {
            return Err(CodecError::Cycle {
                type_name: obj.type_name().to_string(),
            });
        }
        let convert_all = |items: &[Value], path: &mut HashSet<u64>| {
            items
                .iter()
                .map(|v| Self::convert(v, path))
                .collect::<Result<Vec<_>, _>>()
        };
        let body = match &*obj.body() {
            ObjectBody::List(items) => StoredBody::List(convert_all(items, path)?),
            ObjectBody::Tuple(items) => StoredBody::Tuple(convert_all(items, path)?),
            ObjectBody::Set(items) => StoredBody::Set(canonical_set(convert_all(items, path)?)?),
            ObjectBody::Dict(pairs) => {
                let mut out = Vec::with_capacity(pairs.len());
                for (k, v) in pairs {
                    out.push((Self::convert(k, path)?, Self::convert(v, path)?));
                }
                StoredBody::Dict(out)
            }
            ObjectBody::Instance { class, attrs } => {
                let mut out = BTreeMap::new();
                for (name, v) in attrs {
                    out.insert(name.clone(), Self::convert(v, path)?);
                }
                StoredBody::Instance {
                    class: class.clone(),
                    attrs: out,
                }
            }
            ObjectBody::Foreign { state } => match state {
                Some(bytes) => StoredBody::Foreign(bytes.clone()),
                None => {
                    return Err(CodecError::OpaqueState {
                        type_name: obj.type_name().to_string(),
                    })
                }
            },
        };
        path.remove(&obj.serial());
        Ok(StoredValue::Object {
            type_name: obj.type_name().to_string(),
            body,
        })
    }

    /// Rebuilds a live value. Every object is freshly allocated.
    pub fn into_value(self) -> Value {
        match self {
            StoredValue::None => Value::None,
            StoredValue::Bool(b) => Value::Bool(b),
            StoredValue::Int(i) => Value::Int(i),
            StoredValue::Float(f) => Value::Float(f),
            StoredValue::Complex(re, im) => Value::Complex { re, im },
            StoredValue::Bytes(b) => Value::Bytes(b),
            StoredValue::Str(s) => Value::Str(s),
            StoredValue::Object { type_name, body } => {
                let into_all = |items: Vec<StoredValue>| {
                    items.into_iter().map(StoredValue::into_value).collect()
                };
                let body = match body {
                    StoredBody::List(items) => ObjectBody::List(into_all(items)),
                    StoredBody::Tuple(items) => ObjectBody::Tuple(into_all(items)),
                    StoredBody::Set(items) => ObjectBody::Set(into_all(items)),
                    StoredBody::Dict(pairs) => ObjectBody::Dict(
                        pairs
                            .into_iter()
                            .map(|(k, v)| (k.into_value(), v.into_value()))
                            .collect(),
                    ),
                    StoredBody::Instance { class, attrs } => ObjectBody::Instance {
                        class,
                        attrs: attrs
                            .into_iter()
                            .map(|(k, v)| (k, v.into_value()))
                            .collect(),
                    },
                    StoredBody::Foreign(bytes) => ObjectBody::Foreign { state: Some(bytes) },
                };
                Value::Object(ObjRef::new(type_name, body))
            }
        }
    }
}

/// Orders set members by their encoding so equal sets encode equally.
fn canonical_set(items: Vec<StoredValue>) -> Result<Vec<StoredValue>, CodecError> {
    let mut keyed = items
        .into_iter()
        .map(|item| encode_stored(&item).map(|bytes| (bytes, item)))
        .collect::<Result<Vec<_>, _>>()?;
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    keyed.dedup_by(|a, b| a.0 == b.0);
    Ok(keyed.into_iter().map(|(_, item)| item).collect())
}

fn encode_stored(stored: &StoredValue) -> Result<Vec<u8>, CodecError> {
    bincode::serde::encode_to_vec(stored, bincode::config::standard())
        .map_err(|e| CodecError::Encode(e.to_string()))
}

/// The default codec: [`StoredValue`] trees in bincode.
#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeCodec;

impl ValueCodec for BincodeCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        encode_stored(&StoredValue::from_value(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        let (stored, read): (StoredValue, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| CodecError::Decode(e.to_string()))?;
        if read != bytes.len() {
            return Err(CodecError::Decode(format!(
                "{} trailing bytes",
                bytes.len() - read
            )));
        }
        Ok(stored.into_value())
    }
}
