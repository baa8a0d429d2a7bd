//! Per-builtin-type method tables
//!
//! Six tables, one per builtin receiver type. Every entry is a Native of
//! kind Method: `args[0]` is the receiver, user arguments follow. Each
//! table carries the `@iter`/`@itern` pair, so every builtin container
//! satisfies the iterator protocol that `for ... in` compiles against.

pub mod bytes_ops;
pub mod dict_ops;
pub mod file_ops;
pub mod list_ops;
pub mod range_ops;
pub mod string_ops;

use crate::exceptions::Raised;
use crate::vm::{NativeFn, Vm};
use ember_core::object::{NativeKind, Obj};
use ember_core::value::Value;

pub fn install(vm: &mut Vm) {
    string_ops::install(vm);
    list_ops::install(vm);
    dict_ops::install(vm);
    bytes_ops::install(vm);
    range_ops::install(vm);
    file_ops::install(vm);
}

/// Which builtin table a method registers into.
#[derive(Clone, Copy)]
pub(crate) enum MethodTable {
    String,
    List,
    Dict,
    Bytes,
    Range,
    File,
}

pub(crate) fn define(vm: &mut Vm, table: MethodTable, name: &str, function: NativeFn) {
    let native = vm
        .heap
        .alloc_native(name.to_string(), NativeKind::Method, function as usize);
    let key = Value::Obj(Obj::String(vm.heap.intern(name)));
    let value = Value::Obj(Obj::Native(native));
    match table {
        MethodTable::String => vm.string_methods.set(key, value),
        MethodTable::List => vm.list_methods.set(key, value),
        MethodTable::Dict => vm.dict_methods.set(key, value),
        MethodTable::Bytes => vm.bytes_methods.set(key, value),
        MethodTable::Range => vm.range_methods.set(key, value),
        MethodTable::File => vm.file_methods.set(key, value),
    };
}

/// Arity check for method natives; `args` includes the receiver.
pub(crate) fn check_arity(
    vm: &mut Vm,
    args: &[Value],
    name: &str,
    expected: usize,
) -> Result<(), Raised> {
    let got = args.len().saturating_sub(1);
    if got != expected {
        return Err(vm.raise(&format!(
            "{}() expects {} arguments, got {}",
            name, expected, got
        )));
    }
    Ok(())
}

/// Arity check allowing a range of argument counts.
pub(crate) fn check_arity_between(
    vm: &mut Vm,
    args: &[Value],
    name: &str,
    min: usize,
    max: usize,
) -> Result<(), Raised> {
    let got = args.len().saturating_sub(1);
    if got < min || got > max {
        return Err(vm.raise(&format!(
            "{}() expects {} to {} arguments, got {}",
            name, min, max, got
        )));
    }
    Ok(())
}

pub(crate) fn want_number(vm: &mut Vm, value: &Value, what: &str) -> Result<f64, Raised> {
    match value.as_number() {
        Some(n) => Ok(n),
        None => Err(vm.raise(&format!("{} must be a number, not '{}'", what, value.type_name()))),
    }
}

pub(crate) fn want_int(vm: &mut Vm, value: &Value, what: &str) -> Result<i64, Raised> {
    let n = want_number(vm, value, what)?;
    if n.fract() != 0.0 {
        return Err(vm.raise(&format!("{} must be an integer", what)));
    }
    Ok(n as i64)
}

pub(crate) fn want_string(
    vm: &mut Vm,
    value: &Value,
    what: &str,
) -> Result<ember_core::object::GcRef<ember_core::object::ObjString>, Raised> {
    match value.as_string() {
        Some(s) => Ok(s),
        None => Err(vm.raise(&format!("{} must be a string, not '{}'", what, value.type_name()))),
    }
}

/// Shared `@itern` behavior for index-keyed containers: nil starts at 0,
/// a key advances by one, and the end yields nil.
pub(crate) fn index_iter_next(
    vm: &mut Vm,
    previous: &Value,
    length: usize,
) -> Result<Value, Raised> {
    match previous {
        Value::Nil => {
            if length == 0 {
                Ok(Value::Nil)
            } else {
                Ok(Value::Number(0.0))
            }
        }
        Value::Number(n) => {
            let next = *n as i64 + 1;
            if next >= 0 && (next as usize) < length {
                Ok(Value::Number(next as f64))
            } else {
                Ok(Value::Nil)
            }
        }
        other => Err(vm.raise(&format!(
            "invalid iteration key of type '{}'",
            other.type_name()
        ))),
    }
}
