//! Ember Runtime: the bytecode virtual machine
//!
//! Key design principles:
//! - Value: what the language talks about (Nil, Bool, Number, Obj, ...)
//! - The VM owns every heap object through the collector; frames and
//!   tables hold copyable handles
//! - Collections run at instruction boundaries, where the roots are
//!   exactly the value stack, the call frames, the open upvalues, and
//!   the VM tables

pub mod builtins;
pub mod exceptions;
pub mod methods;
pub mod modules;
pub mod vm;

pub use exceptions::{Handler, Raised};
pub use modules::{NativeClassDef, NativeFieldDef, NativeFnDef, NativeModuleDef};
pub use vm::{InterpretResult, NativeFn, Output, Vm, VmOptions};
