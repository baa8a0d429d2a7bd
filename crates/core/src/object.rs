//! Heap object representation
//!
//! Every language object lives on the collector-owned heap and is reached
//! through a typed `GcRef<T>` handle. Handles are plain copies of a raw
//! pointer: the heap's all-objects chain is the single owner, and dropping a
//! handle never frees anything.
//!
//! # Safety
//!
//! `GcRef` dereferences are only sound while the heap still owns the object.
//! The collector guarantees this for every object reachable from the VM
//! roots; code that holds a handle across an allocation must keep the object
//! reachable (on the VM stack or the protection stack) or the next
//! collection may free it.

use crate::blob::Blob;
use crate::table::Table;
use crate::value::Value;
use std::fmt;
use std::fs::File;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

/// A copyable typed handle to a heap object.
///
/// Equality is identity: two handles are equal iff they point at the same
/// object.
pub struct GcRef<T> {
    ptr: NonNull<T>,
}

impl<T> GcRef<T> {
    /// Wrap a raw heap pointer. Only the heap allocator calls this.
    pub(crate) fn new(ptr: NonNull<T>) -> GcRef<T> {
        GcRef { ptr }
    }

    pub fn as_ptr(&self) -> *mut T {
        self.ptr.as_ptr()
    }

    /// Stable identity of the referenced object (its heap address).
    pub fn id(&self) -> usize {
        self.ptr.as_ptr() as usize
    }
}

impl<T> Clone for GcRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for GcRef<T> {}

impl<T> PartialEq for GcRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> Eq for GcRef<T> {}

impl<T> Deref for GcRef<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> DerefMut for GcRef<T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { self.ptr.as_mut() }
    }
}

impl<T> fmt::Debug for GcRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GcRef({:p})", self.ptr.as_ptr())
    }
}

/// Bookkeeping shared by every heap object: the mark bit and the sibling
/// link of the all-objects chain the collector sweeps.
#[derive(Debug)]
pub struct ObjHeader {
    pub marked: bool,
    pub sibling: Option<Obj>,
}

impl ObjHeader {
    pub fn new() -> ObjHeader {
        ObjHeader {
            marked: false,
            sibling: None,
        }
    }
}

impl Default for ObjHeader {
    fn default() -> Self {
        ObjHeader::new()
    }
}

/// A type-tagged handle to any heap object.
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum Obj {
    String(GcRef<ObjString>),
    Bytes(GcRef<ObjBytes>),
    List(GcRef<ObjList>),
    Dict(GcRef<ObjDict>),
    Range(GcRef<ObjRange>),
    File(GcRef<ObjFile>),
    Function(GcRef<ObjFunction>),
    Closure(GcRef<ObjClosure>),
    Upvalue(GcRef<ObjUpvalue>),
    BoundMethod(GcRef<ObjBoundMethod>),
    Class(GcRef<ObjClass>),
    Instance(GcRef<ObjInstance>),
    Native(GcRef<ObjNative>),
    Module(GcRef<ObjModule>),
    Switch(GcRef<ObjSwitch>),
    Pointer(GcRef<ObjPointer>),
}

impl Obj {
    pub fn header(&self) -> &ObjHeader {
        unsafe {
            match self {
                Obj::String(r) => &(*r.as_ptr()).header,
                Obj::Bytes(r) => &(*r.as_ptr()).header,
                Obj::List(r) => &(*r.as_ptr()).header,
                Obj::Dict(r) => &(*r.as_ptr()).header,
                Obj::Range(r) => &(*r.as_ptr()).header,
                Obj::File(r) => &(*r.as_ptr()).header,
                Obj::Function(r) => &(*r.as_ptr()).header,
                Obj::Closure(r) => &(*r.as_ptr()).header,
                Obj::Upvalue(r) => &(*r.as_ptr()).header,
                Obj::BoundMethod(r) => &(*r.as_ptr()).header,
                Obj::Class(r) => &(*r.as_ptr()).header,
                Obj::Instance(r) => &(*r.as_ptr()).header,
                Obj::Native(r) => &(*r.as_ptr()).header,
                Obj::Module(r) => &(*r.as_ptr()).header,
                Obj::Switch(r) => &(*r.as_ptr()).header,
                Obj::Pointer(r) => &(*r.as_ptr()).header,
            }
        }
    }

    /// Mutable access to the header through a shared handle.
    ///
    /// Sound because the heap is the only owner and the VM is single
    /// threaded; nothing else holds a Rust borrow of the object.
    #[allow(clippy::mut_from_ref)]
    pub fn header_mut(&self) -> &mut ObjHeader {
        unsafe {
            match self {
                Obj::String(r) => &mut (*r.as_ptr()).header,
                Obj::Bytes(r) => &mut (*r.as_ptr()).header,
                Obj::List(r) => &mut (*r.as_ptr()).header,
                Obj::Dict(r) => &mut (*r.as_ptr()).header,
                Obj::Range(r) => &mut (*r.as_ptr()).header,
                Obj::File(r) => &mut (*r.as_ptr()).header,
                Obj::Function(r) => &mut (*r.as_ptr()).header,
                Obj::Closure(r) => &mut (*r.as_ptr()).header,
                Obj::Upvalue(r) => &mut (*r.as_ptr()).header,
                Obj::BoundMethod(r) => &mut (*r.as_ptr()).header,
                Obj::Class(r) => &mut (*r.as_ptr()).header,
                Obj::Instance(r) => &mut (*r.as_ptr()).header,
                Obj::Native(r) => &mut (*r.as_ptr()).header,
                Obj::Module(r) => &mut (*r.as_ptr()).header,
                Obj::Switch(r) => &mut (*r.as_ptr()).header,
                Obj::Pointer(r) => &mut (*r.as_ptr()).header,
            }
        }
    }

    /// The type name used in runtime diagnostics and by `typeof`.
    pub fn type_name(&self) -> &'static str {
        match self {
            Obj::String(_) => "string",
            Obj::Bytes(_) => "bytes",
            Obj::List(_) => "list",
            Obj::Dict(_) => "dictionary",
            Obj::Range(_) => "range",
            Obj::File(_) => "file",
            Obj::Function(_) => "function",
            Obj::Closure(_) => "function",
            Obj::Upvalue(_) => "upvalue",
            Obj::BoundMethod(_) => "function",
            Obj::Class(_) => "class",
            Obj::Instance(_) => "instance",
            Obj::Native(_) => "function",
            Obj::Module(_) => "module",
            Obj::Switch(_) => "switch",
            Obj::Pointer(_) => "pointer",
        }
    }

    /// Identity of the underlying allocation.
    pub fn id(&self) -> usize {
        match self {
            Obj::String(r) => r.id(),
            Obj::Bytes(r) => r.id(),
            Obj::List(r) => r.id(),
            Obj::Dict(r) => r.id(),
            Obj::Range(r) => r.id(),
            Obj::File(r) => r.id(),
            Obj::Function(r) => r.id(),
            Obj::Closure(r) => r.id(),
            Obj::Upvalue(r) => r.id(),
            Obj::BoundMethod(r) => r.id(),
            Obj::Class(r) => r.id(),
            Obj::Instance(r) => r.id(),
            Obj::Native(r) => r.id(),
            Obj::Module(r) => r.id(),
            Obj::Switch(r) => r.id(),
            Obj::Pointer(r) => r.id(),
        }
    }
}

/// Interned, immutable string.
///
/// The heap holds at most one ObjString per (bytes, hash) pair; equality of
/// string values is therefore handle identity.
#[derive(Debug)]
pub struct ObjString {
    pub header: ObjHeader,
    pub chars: String,
    /// Precomputed FNV-1a hash of the bytes.
    pub hash: u32,
    /// Codepoint length; equals byte length when `is_ascii` is set.
    pub cp_len: usize,
    pub is_ascii: bool,
}

impl ObjString {
    /// FNV-1a over the raw bytes.
    pub fn hash_bytes(bytes: &[u8]) -> u32 {
        let mut hash: u32 = 2166136261;
        for b in bytes {
            hash ^= *b as u32;
            hash = hash.wrapping_mul(16777619);
        }
        hash
    }

    pub fn byte_len(&self) -> usize {
        self.chars.len()
    }

    /// User-visible length: codepoints, not bytes.
    pub fn length(&self) -> usize {
        self.cp_len
    }
}

/// Mutable byte buffer.
#[derive(Debug)]
pub struct ObjBytes {
    pub header: ObjHeader,
    pub bytes: Vec<u8>,
}

/// Dynamic value array. Growth is geometric (doubling, minimum 4), which
/// `Vec` already provides.
#[derive(Debug)]
pub struct ObjList {
    pub header: ObjHeader,
    pub items: Vec<Value>,
}

/// Insertion-ordered dictionary.
///
/// `keys` is the insertion-order history; `table` maps key to value.
/// Deletion compacts the key array so iteration order stays duplicate-free.
#[derive(Debug)]
pub struct ObjDict {
    pub header: ObjHeader,
    pub keys: Vec<Value>,
    pub table: Table,
}

/// Numeric range `lower..upper`. Iteration direction follows the sign of
/// `upper - lower`; `span` is the absolute distance.
#[derive(Debug)]
pub struct ObjRange {
    pub header: ObjHeader,
    pub lower: i64,
    pub upper: i64,
    pub span: i64,
}

/// Which standard stream a mode-less file wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdStream {
    In,
    Out,
    Err,
}

/// An open (or closed) file. A zero-length mode marks a standard stream;
/// such files are never closed by the collector.
#[derive(Debug)]
pub struct ObjFile {
    pub header: ObjHeader,
    pub path: String,
    pub mode: String,
    pub handle: Option<File>,
    pub std_stream: Option<StdStream>,
    pub is_open: bool,
}

impl ObjFile {
    pub fn is_std(&self) -> bool {
        self.mode.is_empty()
    }
}

/// What kind of callable a compiled function is. The VM treats module
/// functions and initializers specially on return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    /// Top-level code of the entry script.
    Script,
    /// Top-level code of an imported module.
    Module,
    Function,
    Method,
    Initializer,
}

/// A compiled function: immutable once compilation of its body ends.
#[derive(Debug)]
pub struct ObjFunction {
    pub header: ObjHeader,
    pub name: String,
    pub arity: usize,
    pub upvalue_count: usize,
    pub is_variadic: bool,
    pub kind: FunctionKind,
    pub module: GcRef<ObjModule>,
    pub blob: Blob,
}

/// A function plus its captured upvalues.
#[derive(Debug)]
pub struct ObjClosure {
    pub header: ObjHeader,
    pub function: GcRef<ObjFunction>,
    pub upvalues: Vec<GcRef<ObjUpvalue>>,
}

/// Where an upvalue's storage currently lives: a live VM stack slot while
/// open, owned storage once closed.
#[derive(Debug, Clone, Copy)]
pub enum UpvalueState {
    Open(usize),
    Closed(Value),
}

#[derive(Debug)]
pub struct ObjUpvalue {
    pub header: ObjHeader,
    pub state: UpvalueState,
}

/// A closure bound to a receiver; the receiver replaces slot 0 on dispatch.
#[derive(Debug)]
pub struct ObjBoundMethod {
    pub header: ObjHeader,
    pub receiver: Value,
    pub method: GcRef<ObjClosure>,
}

/// A class: methods, per-instance property defaults, and statics.
/// `initializer` is Empty until a method named like the class is defined.
#[derive(Debug)]
pub struct ObjClass {
    pub header: ObjHeader,
    pub name: GcRef<ObjString>,
    pub initializer: Value,
    pub methods: Table,
    pub properties: Table,
    pub statics: Table,
    pub superclass: Option<GcRef<ObjClass>>,
}

impl ObjClass {
    /// True when `name` appears in this class's inheritance chain.
    pub fn chain_has_name(&self, name: &str) -> bool {
        if self.name.chars == name {
            return true;
        }
        let mut parent = self.superclass;
        while let Some(klass) = parent {
            if klass.name.chars == name {
                return true;
            }
            parent = klass.superclass;
        }
        false
    }
}

/// An instance. Properties start as a copy of the class defaults; later
/// mutation never touches the class.
#[derive(Debug)]
pub struct ObjInstance {
    pub header: ObjHeader,
    pub class: GcRef<ObjClass>,
    pub properties: Table,
}

/// How a native callable dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeKind {
    Function,
    Method,
    StaticMethod,
    Private,
    Initializer,
}

/// A native callable. The function pointer is stored untyped because this
/// crate cannot name the VM type; the runtime owns the only transmute back.
#[derive(Debug)]
pub struct ObjNative {
    pub header: ObjHeader,
    pub name: String,
    pub kind: NativeKind,
    pub function: usize,
}

/// A compilation unit. Exactly one Module exists per resolved source path;
/// the modules table enforces the uniqueness.
#[derive(Debug)]
pub struct ObjModule {
    pub header: ObjHeader,
    pub name: String,
    pub file: String,
    pub values: Table,
    /// Optional native hooks, stored untyped like `ObjNative::function`.
    pub preloader: Option<usize>,
    pub unloader: Option<usize>,
    pub imported: bool,
}

/// A compile-time jump table for `using`/`when`. Case values map to code
/// offsets relative to the instruction after the switch operand.
#[derive(Debug)]
pub struct ObjSwitch {
    pub header: ObjHeader,
    pub table: Table,
    pub default_jump: Option<u32>,
    pub exit_jump: u32,
}

/// An opaque native pointer with an optional finalizer, invoked exactly
/// once when the collector frees the object.
#[derive(Debug)]
pub struct ObjPointer {
    pub header: ObjHeader,
    pub pointer: *mut std::ffi::c_void,
    pub name: String,
    pub free_fn: Option<fn(*mut std::ffi::c_void)>,
    pub finalized: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_hash_is_fnv1a() {
        // Known FNV-1a vectors
        assert_eq!(ObjString::hash_bytes(b""), 2166136261);
        assert_eq!(ObjString::hash_bytes(b"a"), 0xe40c292c);
        assert_eq!(ObjString::hash_bytes(b"foobar"), 0xbf9cf968);
    }

    #[test]
    fn test_value_is_small() {
        // Value must stay a small fixed-size record: tag + payload word(s).
        assert!(std::mem::size_of::<Value>() <= 24);
    }
}
