//! Bytes methods

use super::{MethodTable, check_arity, check_arity_between, define, index_iter_next, want_int};
use crate::exceptions::Raised;
use crate::vm::Vm;
use ember_core::object::{GcRef, Obj, ObjBytes};
use ember_core::value::Value;

pub fn install(vm: &mut Vm) {
    let t = MethodTable::Bytes;
    define(vm, t, "length", length);
    define(vm, t, "append", append);
    define(vm, t, "clone", clone);
    define(vm, t, "extend", extend);
    define(vm, t, "pop", pop);
    define(vm, t, "first", first);
    define(vm, t, "last", last);
    define(vm, t, "get", get);
    define(vm, t, "reverse", reverse);
    define(vm, t, "split", split);
    define(vm, t, "to_list", to_list);
    define(vm, t, "to_string", to_string);
    define(vm, t, "@iter", iter_value);
    define(vm, t, "@itern", iter_next);
}

fn receiver(vm: &mut Vm, args: &[Value]) -> Result<GcRef<ObjBytes>, Raised> {
    match args.first() {
        Some(Value::Obj(Obj::Bytes(b))) => Ok(*b),
        _ => Err(vm.raise("bytes method called on a non-bytes receiver")),
    }
}

fn byte_from(vm: &mut Vm, value: &Value) -> Result<u8, Raised> {
    let n = want_int(vm, value, "byte value")?;
    if !(0..=255).contains(&n) {
        return Err(vm.raise("bytes elements must be integers from 0 to 255"));
    }
    Ok(n as u8)
}

fn length(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "length", 0)?;
    let bytes = receiver(vm, args)?;
    Ok(Value::Number(bytes.bytes.len() as f64))
}

fn append(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "append", 1)?;
    let mut bytes = receiver(vm, args)?;
    let byte = byte_from(vm, &args[1])?;
    bytes.bytes.push(byte);
    Ok(Value::Nil)
}

fn clone(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "clone", 0)?;
    let bytes = receiver(vm, args)?;
    let copy = vm.heap.alloc_bytes(bytes.bytes.clone());
    Ok(Value::Obj(Obj::Bytes(copy)))
}

fn extend(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "extend", 1)?;
    let mut bytes = receiver(vm, args)?;
    let Value::Obj(Obj::Bytes(other)) = args[1] else {
        return Err(vm.raise(&format!(
            "extend() expects bytes, got '{}'",
            args[1].type_name()
        )));
    };
    let tail = other.bytes.clone();
    bytes.bytes.extend(tail);
    Ok(Value::Nil)
}

fn pop(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "pop", 0)?;
    let mut bytes = receiver(vm, args)?;
    Ok(bytes
        .bytes
        .pop()
        .map(|b| Value::Number(b as f64))
        .unwrap_or(Value::Nil))
}

fn first(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "first", 0)?;
    let bytes = receiver(vm, args)?;
    Ok(bytes
        .bytes
        .first()
        .map(|b| Value::Number(*b as f64))
        .unwrap_or(Value::Nil))
}

fn last(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "last", 0)?;
    let bytes = receiver(vm, args)?;
    Ok(bytes
        .bytes
        .last()
        .map(|b| Value::Number(*b as f64))
        .unwrap_or(Value::Nil))
}

fn get(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity_between(vm, args, "get", 1, 2)?;
    let bytes = receiver(vm, args)?;
    let index = want_int(vm, &args[1], "get index")?;
    let length = bytes.bytes.len() as i64;
    let index = if index < 0 { index + length } else { index };
    if index < 0 || index >= length {
        return Ok(args.get(2).copied().unwrap_or(Value::Nil));
    }
    Ok(Value::Number(bytes.bytes[index as usize] as f64))
}

fn reverse(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "reverse", 0)?;
    let mut bytes = receiver(vm, args)?;
    bytes.bytes.reverse();
    Ok(Value::Nil)
}

fn split(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "split", 1)?;
    let bytes = receiver(vm, args)?;
    let Value::Obj(Obj::Bytes(separator)) = args[1] else {
        return Err(vm.raise(&format!(
            "split() expects bytes, got '{}'",
            args[1].type_name()
        )));
    };
    let parts: Vec<Vec<u8>> = if separator.bytes.is_empty() {
        bytes.bytes.iter().map(|b| vec![*b]).collect()
    } else {
        let data = &bytes.bytes;
        let sep = &separator.bytes;
        let mut parts = Vec::new();
        let mut start = 0;
        let mut i = 0;
        while i + sep.len() <= data.len() {
            if &data[i..i + sep.len()] == sep.as_slice() {
                parts.push(data[start..i].to_vec());
                i += sep.len();
                start = i;
            } else {
                i += 1;
            }
        }
        parts.push(data[start..].to_vec());
        parts
    };
    let mut items = Vec::with_capacity(parts.len());
    for part in parts {
        let chunk = vm.heap.alloc_bytes(part);
        let value = Value::Obj(Obj::Bytes(chunk));
        vm.heap.protect(value);
        items.push(value);
    }
    let list = vm.heap.alloc_list(items);
    Ok(Value::Obj(Obj::List(list)))
}

fn to_list(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "to_list", 0)?;
    let bytes = receiver(vm, args)?;
    let items: Vec<Value> = bytes.bytes.iter().map(|b| Value::Number(*b as f64)).collect();
    let list = vm.heap.alloc_list(items);
    Ok(Value::Obj(Obj::List(list)))
}

fn to_string(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "to_string", 0)?;
    let bytes = receiver(vm, args)?;
    let text = String::from_utf8_lossy(&bytes.bytes).into_owned();
    Ok(Value::Obj(Obj::String(vm.heap.intern_owned(text))))
}

fn iter_next(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "@itern", 1)?;
    let bytes = receiver(vm, args)?;
    index_iter_next(vm, &args[1], bytes.bytes.len())
}

fn iter_value(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "@iter", 1)?;
    let bytes = receiver(vm, args)?;
    let index = want_int(vm, &args[1], "iteration key")?;
    if index < 0 || index as usize >= bytes.bytes.len() {
        return Err(vm.raise("bytes iteration key out of range"));
    }
    Ok(Value::Number(bytes.bytes[index as usize] as f64))
}
