//! Ember Core: the shared foundation of the Ember language
//!
//! Key design principles:
//! - Value: What the language talks about (Nil, Bool, Number, Obj, etc.)
//! - Obj: a typed handle into the collector-owned heap
//! - The heap is the single owner of every object; values and tables hold
//!   non-owning handles that the collector makes strong during marking

pub mod blob;
pub mod gc;
pub mod object;
pub mod opcode;
pub mod table;
pub mod value;

pub use blob::Blob;
pub use gc::Heap;
pub use object::{
    FunctionKind, GcRef, NativeKind, Obj, ObjBoundMethod, ObjBytes, ObjClass, ObjClosure, ObjDict,
    ObjFile, ObjFunction, ObjInstance, ObjList, ObjModule, ObjNative, ObjPointer, ObjRange,
    ObjString, ObjSwitch, ObjUpvalue, StdStream, UpvalueState,
};
pub use opcode::Op;
pub use table::Table;
pub use value::Value;
