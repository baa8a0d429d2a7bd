//! List methods

use super::{MethodTable, check_arity, check_arity_between, define, index_iter_next, want_int, want_string};
use crate::exceptions::Raised;
use crate::vm::Vm;
use ember_core::object::{GcRef, Obj, ObjList};
use ember_core::value::Value;

pub fn install(vm: &mut Vm) {
    let t = MethodTable::List;
    define(vm, t, "length", length);
    define(vm, t, "append", append);
    define(vm, t, "clear", clear);
    define(vm, t, "clone", clone);
    define(vm, t, "count", count);
    define(vm, t, "extend", extend);
    define(vm, t, "index_of", index_of);
    define(vm, t, "insert", insert);
    define(vm, t, "pop", pop);
    define(vm, t, "shift", shift);
    define(vm, t, "remove", remove);
    define(vm, t, "remove_at", remove_at);
    define(vm, t, "reverse", reverse);
    define(vm, t, "sort", sort);
    define(vm, t, "contains", contains);
    define(vm, t, "first", first);
    define(vm, t, "last", last);
    define(vm, t, "take", take);
    define(vm, t, "get", get);
    define(vm, t, "compact", compact);
    define(vm, t, "unique", unique);
    define(vm, t, "to_dict", to_dict);
    define(vm, t, "join", join);
    define(vm, t, "@iter", iter_value);
    define(vm, t, "@itern", iter_next);
}

fn receiver(vm: &mut Vm, args: &[Value]) -> Result<GcRef<ObjList>, Raised> {
    match args.first() {
        Some(Value::Obj(Obj::List(l))) => Ok(*l),
        _ => Err(vm.raise("list method called on a non-list receiver")),
    }
}

fn length(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "length", 0)?;
    let list = receiver(vm, args)?;
    Ok(Value::Number(list.items.len() as f64))
}

fn append(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "append", 1)?;
    let mut list = receiver(vm, args)?;
    list.items.push(args[1]);
    Ok(Value::Nil)
}

fn clear(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "clear", 0)?;
    let mut list = receiver(vm, args)?;
    list.items.clear();
    Ok(Value::Nil)
}

fn clone(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "clone", 0)?;
    let list = receiver(vm, args)?;
    let items = list.items.clone();
    let copy = vm.heap.alloc_list(items);
    Ok(Value::Obj(Obj::List(copy)))
}

fn count(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "count", 1)?;
    let list = receiver(vm, args)?;
    let needle = args[1];
    let found = list.items.iter().filter(|v| v.strict_eq(&needle)).count();
    Ok(Value::Number(found as f64))
}

fn extend(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "extend", 1)?;
    let mut list = receiver(vm, args)?;
    let Value::Obj(Obj::List(other)) = args[1] else {
        return Err(vm.raise(&format!(
            "extend() expects a list, got '{}'",
            args[1].type_name()
        )));
    };
    let items = other.items.clone();
    list.items.extend(items);
    Ok(Value::Nil)
}

fn index_of(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "index_of", 1)?;
    let list = receiver(vm, args)?;
    let needle = args[1];
    match list.items.iter().position(|v| v.strict_eq(&needle)) {
        Some(index) => Ok(Value::Number(index as f64)),
        None => Ok(Value::Number(-1.0)),
    }
}

fn insert(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "insert", 2)?;
    let mut list = receiver(vm, args)?;
    let value = args[1];
    let index = want_int(vm, &args[2], "insert index")?;
    let length = list.items.len() as i64;
    let index = index.clamp(0, length) as usize;
    list.items.insert(index, value);
    Ok(Value::Nil)
}

fn pop(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "pop", 0)?;
    let mut list = receiver(vm, args)?;
    Ok(list.items.pop().unwrap_or(Value::Nil))
}

fn shift(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "shift", 0)?;
    let mut list = receiver(vm, args)?;
    if list.items.is_empty() {
        Ok(Value::Nil)
    } else {
        Ok(list.items.remove(0))
    }
}

fn remove(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "remove", 1)?;
    let mut list = receiver(vm, args)?;
    let needle = args[1];
    match list.items.iter().position(|v| v.strict_eq(&needle)) {
        Some(index) => {
            list.items.remove(index);
            Ok(Value::Bool(true))
        }
        None => Ok(Value::Bool(false)),
    }
}

fn remove_at(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "remove_at", 1)?;
    let mut list = receiver(vm, args)?;
    let index = want_int(vm, &args[1], "remove_at index")?;
    let length = list.items.len() as i64;
    let index = if index < 0 { index + length } else { index };
    if index < 0 || index >= length {
        return Err(vm.raise("remove_at index out of range"));
    }
    Ok(list.items.remove(index as usize))
}

fn reverse(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "reverse", 0)?;
    let mut list = receiver(vm, args)?;
    list.items.reverse();
    Ok(Value::Nil)
}

fn sort(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "sort", 0)?;
    let mut list = receiver(vm, args)?;
    list.items.sort_by(|a, b| a.total_cmp(b));
    Ok(args[0])
}

fn contains(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "contains", 1)?;
    let list = receiver(vm, args)?;
    let needle = args[1];
    Ok(Value::Bool(
        list.items.iter().any(|v| v.strict_eq(&needle)),
    ))
}

fn first(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "first", 0)?;
    let list = receiver(vm, args)?;
    Ok(list.items.first().copied().unwrap_or(Value::Nil))
}

fn last(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "last", 0)?;
    let list = receiver(vm, args)?;
    Ok(list.items.last().copied().unwrap_or(Value::Nil))
}

fn take(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "take", 1)?;
    let list = receiver(vm, args)?;
    let count = want_int(vm, &args[1], "take count")?.max(0) as usize;
    let items: Vec<Value> = list.items.iter().take(count).copied().collect();
    let taken = vm.heap.alloc_list(items);
    Ok(Value::Obj(Obj::List(taken)))
}

fn get(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity_between(vm, args, "get", 1, 2)?;
    let list = receiver(vm, args)?;
    let index = want_int(vm, &args[1], "get index")?;
    let length = list.items.len() as i64;
    let index = if index < 0 { index + length } else { index };
    if index < 0 || index >= length {
        return Ok(args.get(2).copied().unwrap_or(Value::Nil));
    }
    Ok(list.items[index as usize])
}

fn compact(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "compact", 0)?;
    let list = receiver(vm, args)?;
    let items: Vec<Value> = list.items.iter().filter(|v| !v.is_nil()).copied().collect();
    let compacted = vm.heap.alloc_list(items);
    Ok(Value::Obj(Obj::List(compacted)))
}

fn unique(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "unique", 0)?;
    let list = receiver(vm, args)?;
    let mut items: Vec<Value> = Vec::new();
    for value in &list.items {
        if !items.iter().any(|v| v.strict_eq(value)) {
            items.push(*value);
        }
    }
    let deduped = vm.heap.alloc_list(items);
    Ok(Value::Obj(Obj::List(deduped)))
}

fn to_dict(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "to_dict", 0)?;
    let list = receiver(vm, args)?;
    let mut dict = vm.heap.alloc_dict();
    for (index, value) in list.items.iter().enumerate() {
        let key = Value::Number(index as f64);
        if dict.table.set(key, *value) {
            dict.keys.push(key);
        }
    }
    Ok(Value::Obj(Obj::Dict(dict)))
}

fn join(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "join", 1)?;
    let list = receiver(vm, args)?;
    let separator = want_string(vm, &args[1], "join() separator")?;
    let rendered: Vec<String> = list.items.iter().map(|v| v.render()).collect();
    let joined = rendered.join(&separator.chars);
    Ok(Value::Obj(Obj::String(vm.heap.intern_owned(joined))))
}

fn iter_next(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "@itern", 1)?;
    let list = receiver(vm, args)?;
    index_iter_next(vm, &args[1], list.items.len())
}

fn iter_value(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "@iter", 1)?;
    let list = receiver(vm, args)?;
    let index = want_int(vm, &args[1], "iteration key")?;
    if index < 0 || index as usize >= list.items.len() {
        return Err(vm.raise("list iteration key out of range"));
    }
    Ok(list.items[index as usize])
}
