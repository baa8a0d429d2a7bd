//! Dictionary methods
//!
//! The key array is the insertion-ordered history; removal compacts it so
//! iteration order stays duplicate-free and matches insertion order
//! modulo deletions.

use super::{MethodTable, check_arity, check_arity_between, define};
use crate::exceptions::Raised;
use crate::vm::{Vm, is_hashable_key};
use ember_core::object::{GcRef, Obj, ObjDict};
use ember_core::value::Value;

pub fn install(vm: &mut Vm) {
    let t = MethodTable::Dict;
    define(vm, t, "length", length);
    define(vm, t, "add", add);
    define(vm, t, "set", set);
    define(vm, t, "get", get);
    define(vm, t, "clear", clear);
    define(vm, t, "clone", clone);
    define(vm, t, "compact", compact);
    define(vm, t, "contains", contains);
    define(vm, t, "extend", extend);
    define(vm, t, "keys", keys);
    define(vm, t, "values", values);
    define(vm, t, "remove", remove);
    define(vm, t, "is_empty", is_empty);
    define(vm, t, "find_key", find_key);
    define(vm, t, "to_list", to_list);
    define(vm, t, "@iter", iter_value);
    define(vm, t, "@itern", iter_next);
}

fn receiver(vm: &mut Vm, args: &[Value]) -> Result<GcRef<ObjDict>, Raised> {
    match args.first() {
        Some(Value::Obj(Obj::Dict(d))) => Ok(*d),
        _ => Err(vm.raise("dictionary method called on a non-dictionary receiver")),
    }
}

fn check_key(vm: &mut Vm, key: &Value) -> Result<(), Raised> {
    if !is_hashable_key(key) {
        return Err(vm.raise(&format!(
            "'{}' cannot be used as a dictionary key",
            key.type_name()
        )));
    }
    Ok(())
}

fn length(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "length", 0)?;
    let dict = receiver(vm, args)?;
    Ok(Value::Number(dict.keys.len() as f64))
}

fn add(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "add", 2)?;
    let mut dict = receiver(vm, args)?;
    let key = args[1];
    check_key(vm, &key)?;
    if dict.table.contains(&key) {
        return Err(vm.raise(&format!(
            "dictionary already has the key {}",
            key.render()
        )));
    }
    dict.table.set(key, args[2]);
    dict.keys.push(key);
    Ok(Value::Nil)
}

fn set(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "set", 2)?;
    let mut dict = receiver(vm, args)?;
    let key = args[1];
    check_key(vm, &key)?;
    if dict.table.set(key, args[2]) {
        dict.keys.push(key);
    }
    Ok(Value::Nil)
}

fn get(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity_between(vm, args, "get", 1, 2)?;
    let dict = receiver(vm, args)?;
    let key = args[1];
    check_key(vm, &key)?;
    match dict.table.get(&key) {
        Some(value) => Ok(value),
        None => Ok(args.get(2).copied().unwrap_or(Value::Nil)),
    }
}

fn clear(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "clear", 0)?;
    let mut dict = receiver(vm, args)?;
    dict.keys.clear();
    dict.table = ember_core::Table::new();
    Ok(Value::Nil)
}

fn clone(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "clone", 0)?;
    let dict = receiver(vm, args)?;
    let mut copy = vm.heap.alloc_dict();
    for key in &dict.keys {
        let value = dict.table.get(key).unwrap_or(Value::Nil);
        copy.table.set(*key, value);
        copy.keys.push(*key);
    }
    Ok(Value::Obj(Obj::Dict(copy)))
}

fn compact(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "compact", 0)?;
    let dict = receiver(vm, args)?;
    let mut copy = vm.heap.alloc_dict();
    for key in &dict.keys {
        let value = dict.table.get(key).unwrap_or(Value::Nil);
        if !value.is_nil() {
            copy.table.set(*key, value);
            copy.keys.push(*key);
        }
    }
    Ok(Value::Obj(Obj::Dict(copy)))
}

fn contains(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "contains", 1)?;
    let dict = receiver(vm, args)?;
    let key = args[1];
    check_key(vm, &key)?;
    Ok(Value::Bool(dict.table.contains(&key)))
}

fn extend(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "extend", 1)?;
    let mut dict = receiver(vm, args)?;
    let Value::Obj(Obj::Dict(other)) = args[1] else {
        return Err(vm.raise(&format!(
            "extend() expects a dictionary, got '{}'",
            args[1].type_name()
        )));
    };
    let pairs: Vec<(Value, Value)> = other
        .keys
        .iter()
        .map(|k| (*k, other.table.get(k).unwrap_or(Value::Nil)))
        .collect();
    for (key, value) in pairs {
        if dict.table.set(key, value) {
            dict.keys.push(key);
        }
    }
    Ok(Value::Nil)
}

fn keys(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "keys", 0)?;
    let dict = receiver(vm, args)?;
    let items = dict.keys.clone();
    let list = vm.heap.alloc_list(items);
    Ok(Value::Obj(Obj::List(list)))
}

fn values(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "values", 0)?;
    let dict = receiver(vm, args)?;
    let items: Vec<Value> = dict
        .keys
        .iter()
        .map(|k| dict.table.get(k).unwrap_or(Value::Nil))
        .collect();
    let list = vm.heap.alloc_list(items);
    Ok(Value::Obj(Obj::List(list)))
}

fn remove(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "remove", 1)?;
    let mut dict = receiver(vm, args)?;
    let key = args[1];
    check_key(vm, &key)?;
    let Some(value) = dict.table.get(&key) else {
        return Ok(Value::Nil);
    };
    dict.table.delete(&key);
    if let Some(position) = dict.keys.iter().position(|k| k.strict_eq(&key)) {
        dict.keys.remove(position);
    }
    Ok(value)
}

fn is_empty(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "is_empty", 0)?;
    let dict = receiver(vm, args)?;
    Ok(Value::Bool(dict.keys.is_empty()))
}

fn find_key(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "find_key", 1)?;
    let dict = receiver(vm, args)?;
    let needle = args[1];
    for key in &dict.keys {
        if let Some(value) = dict.table.get(key)
            && value.strict_eq(&needle)
        {
            return Ok(*key);
        }
    }
    Ok(Value::Nil)
}

fn to_list(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "to_list", 0)?;
    let dict = receiver(vm, args)?;
    let pairs: Vec<(Value, Value)> = dict
        .keys
        .iter()
        .map(|k| (*k, dict.table.get(k).unwrap_or(Value::Nil)))
        .collect();
    let mut items = Vec::with_capacity(pairs.len());
    for (key, value) in pairs {
        let pair = vm.heap.alloc_list(vec![key, value]);
        let pair_value = Value::Obj(Obj::List(pair));
        vm.heap.protect(pair_value);
        items.push(pair_value);
    }
    let list = vm.heap.alloc_list(items);
    Ok(Value::Obj(Obj::List(list)))
}

fn iter_next(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "@itern", 1)?;
    let dict = receiver(vm, args)?;
    match &args[1] {
        Value::Nil => Ok(dict.keys.first().copied().unwrap_or(Value::Nil)),
        previous => {
            match dict.keys.iter().position(|k| k.strict_eq(previous)) {
                Some(position) => {
                    Ok(dict.keys.get(position + 1).copied().unwrap_or(Value::Nil))
                }
                None => Ok(Value::Nil),
            }
        }
    }
}

fn iter_value(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "@iter", 1)?;
    let dict = receiver(vm, args)?;
    Ok(dict.table.get(&args[1]).unwrap_or(Value::Nil))
}
