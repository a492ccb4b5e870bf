//! Host value model.
//!
//! The engine never owns the host's objects; it sees them through shared
//! handles. Primitive values are compared by value. Mutable objects live
//! behind an [`ObjRef`] whose allocation address is the identity that keys
//! the shadow metadata store.

use std::cell::{Ref, RefCell, RefMut};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Raw identity of a live object: its allocation address.
///
/// Identities are only unique among objects alive at the same time; a dead
/// object's address can be handed out again.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ObjectId(usize);

impl ObjectId {
    /// Creates an identity from a raw address-sized integer.
    pub fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    /// Returns the raw integer.
    pub fn as_usize(self) -> usize {
        self.0
    }
}

/// Handle to a registered callable unit.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct CodeId(u32);

impl CodeId {
    /// Creates a `CodeId` from a raw registry index.
    pub fn from_raw(index: u32) -> Self {
        Self(index)
    }

    /// Returns the raw registry index.
    pub fn as_raw(self) -> u32 {
        self.0
    }
}

/// How a host file handle was opened.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FileMode {
    /// Read only.
    Read,
    /// Write, truncating.
    Write,
    /// Write at end.
    Append,
    /// Read and write.
    ReadWrite,
}

impl FileMode {
    /// Returns `true` if opening in this mode may modify the file.
    pub fn writes(self) -> bool {
        !matches!(self, FileMode::Read)
    }
}

/// An open host file handle.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct FileRef {
    /// Host-assigned handle number.
    pub handle: u64,
    /// Path the handle was opened on.
    pub path: PathBuf,
    /// Open mode.
    pub mode: FileMode,
}

/// Contents of a mutable heap object.
#[derive(Debug)]
pub enum ObjectBody {
    /// Growable sequence.
    List(Vec<Value>),
    /// Fixed sequence. Its slots cannot be rebound, but its members may be
    /// mutable.
    Tuple(Vec<Value>),
    /// Insertion-ordered mapping.
    Dict(Vec<(Value, Value)>),
    /// Unordered collection.
    Set(Vec<Value>),
    /// Instance of a user-defined class.
    Instance {
        /// Class name.
        class: String,
        /// Instance attributes.
        attrs: BTreeMap<String, Value>,
    },
    /// Natively-implemented extension object. `state` is its exported
    /// byte state, or `None` if it cannot be exported.
    Foreign {
        /// Exported state.
        state: Option<Vec<u8>>,
    },
}

/// A mutable heap object.
pub struct HeapObject {
    serial: u64,
    type_name: String,
    body: RefCell<ObjectBody>,
}

/// Shared, owning handle to a [`HeapObject`].
#[derive(Clone)]
pub struct ObjRef(Rc<HeapObject>);

/// Non-owning handle to a [`HeapObject`].
#[derive(Clone)]
pub struct WeakObjRef(Weak<HeapObject>);

impl ObjRef {
    /// Allocates a new object with an exact type name.
    pub fn new(type_name: impl Into<String>, body: ObjectBody) -> Self {
        Self(Rc::new(HeapObject {
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            type_name: type_name.into(),
            body: RefCell::new(body),
        }))
    }

    /// Allocates a `list`.
    pub fn list(items: Vec<Value>) -> Self {
        Self::new("list", ObjectBody::List(items))
    }

    /// Allocates a `tuple`.
    pub fn tuple(items: Vec<Value>) -> Self {
        Self::new("tuple", ObjectBody::Tuple(items))
    }

    /// Allocates a `dict`.
    pub fn dict(pairs: Vec<(Value, Value)>) -> Self {
        Self::new("dict", ObjectBody::Dict(pairs))
    }

    /// Allocates a `set`.
    pub fn set(items: Vec<Value>) -> Self {
        Self::new("set", ObjectBody::Set(items))
    }

    /// Allocates an instance of `class`.
    pub fn instance(class: impl Into<String>, attrs: BTreeMap<String, Value>) -> Self {
        let class = class.into();
        Self::new(class.clone(), ObjectBody::Instance { class, attrs })
    }

    /// Allocates an opaque extension object.
    pub fn foreign(type_name: impl Into<String>, state: Option<Vec<u8>>) -> Self {
        Self::new(type_name, ObjectBody::Foreign { state })
    }

    /// Identity of this object.
    pub fn id(&self) -> ObjectId {
        ObjectId(Rc::as_ptr(&self.0) as *const () as usize)
    }

    /// Process-unique allocation serial. Never reused, unlike [`ObjRef::id`].
    pub fn serial(&self) -> u64 {
        self.0.serial
    }

    /// Exact type name.
    pub fn type_name(&self) -> &str {
        &self.0.type_name
    }

    /// Borrows the contents.
    pub fn body(&self) -> Ref<'_, ObjectBody> {
        self.0.body.borrow()
    }

    /// Mutably borrows the contents.
    ///
    /// The host must report the mutation to the engine before calling this.
    pub fn body_mut(&self) -> RefMut<'_, ObjectBody> {
        self.0.body.borrow_mut()
    }

    /// Creates a non-owning handle.
    pub fn downgrade(&self) -> WeakObjRef {
        WeakObjRef(Rc::downgrade(&self.0))
    }

    /// Returns `true` if both handles point at the same object.
    pub fn ptr_eq(&self, other: &ObjRef) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} #{}>", self.0.type_name, self.0.serial)
    }
}

impl WeakObjRef {
    /// Returns the object if it is still alive.
    pub fn upgrade(&self) -> Option<ObjRef> {
        self.0.upgrade().map(ObjRef)
    }

    /// Returns `true` if at least one owning handle still exists.
    pub fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }
}

impl fmt::Debug for WeakObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(obj) => write!(f, "Weak({obj:?})"),
            None => f.write_str("Weak(<dead>)"),
        }
    }
}

/// The closed set of value kinds the engine distinguishes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ValueKind {
    /// Absence marker.
    None,
    /// Boolean.
    Bool,
    /// Integer.
    Int,
    /// Float.
    Float,
    /// Complex number.
    Complex,
    /// Byte text.
    Bytes,
    /// Unicode text.
    Str,
    /// List object.
    List,
    /// Tuple object.
    Tuple,
    /// Dict object.
    Dict,
    /// Set object.
    Set,
    /// Class instance.
    Instance,
    /// Opaque extension object.
    Foreign,
    /// Callable unit.
    Callable,
    /// Module or namespace.
    Module,
    /// Type or class object.
    Type,
    /// Open I/O handle.
    File,
}

/// A host value.
#[derive(Clone, Debug)]
pub enum Value {
    /// Absence marker.
    None,
    /// Boolean.
    Bool(bool),
    /// Integer.
    Int(i64),
    /// Float.
    Float(f64),
    /// Complex number.
    Complex {
        /// Real part.
        re: f64,
        /// Imaginary part.
        im: f64,
    },
    /// Byte text.
    Bytes(Vec<u8>),
    /// Unicode text.
    Str(String),
    /// Mutable heap object.
    Object(ObjRef),
    /// A callable unit.
    Callable(CodeId),
    /// A module, by name.
    Module(String),
    /// A type or class object, by qualified name.
    Type(String),
    /// An open file handle.
    File(FileRef),
}

impl Value {
    /// Convenience constructor for unicode text.
    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    /// Returns the kind of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::None => ValueKind::None,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::Complex { .. } => ValueKind::Complex,
            Value::Bytes(_) => ValueKind::Bytes,
            Value::Str(_) => ValueKind::Str,
            Value::Object(obj) => match &*obj.body() {
                ObjectBody::List(_) => ValueKind::List,
                ObjectBody::Tuple(_) => ValueKind::Tuple,
                ObjectBody::Dict(_) => ValueKind::Dict,
                ObjectBody::Set(_) => ValueKind::Set,
                ObjectBody::Instance { .. } => ValueKind::Instance,
                ObjectBody::Foreign { .. } => ValueKind::Foreign,
            },
            Value::Callable(_) => ValueKind::Callable,
            Value::Module(_) => ValueKind::Module,
            Value::Type(_) => ValueKind::Type,
            Value::File(_) => ValueKind::File,
        }
    }

    /// Returns the heap object, if this value is one.
    pub fn as_object(&self) -> Option<&ObjRef> {
        match self {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }

    /// Returns the namespace name if attribute reads through this value
    /// are reads of shared state.
    pub fn namespace(&self) -> Option<&str> {
        match self {
            Value::Module(name) | Value::Type(name) => Some(name.as_str()),
            _ => None,
        }
    }
}

impl From<ObjRef> for Value {
    fn from(obj: ObjRef) -> Self {
        Value::Object(obj)
    }
}
