//! String methods
//!
//! Strings are immutable and interned, so every transforming method
//! returns a new (possibly shared) string. Indices are codepoint-based;
//! the precomputed is-ascii flag keeps the common case on the byte path.

use super::{MethodTable, check_arity, check_arity_between, define, index_iter_next, want_int, want_string};
use crate::exceptions::Raised;
use crate::vm::Vm;
use ember_core::object::{GcRef, Obj, ObjString};
use ember_core::value::Value;

pub fn install(vm: &mut Vm) {
    let t = MethodTable::String;
    define(vm, t, "length", length);
    define(vm, t, "upper", upper);
    define(vm, t, "lower", lower);
    define(vm, t, "is_alpha", is_alpha);
    define(vm, t, "is_digit", is_digit);
    define(vm, t, "is_alnum", is_alnum);
    define(vm, t, "is_space", is_space);
    define(vm, t, "index_of", index_of);
    define(vm, t, "starts_with", starts_with);
    define(vm, t, "ends_with", ends_with);
    define(vm, t, "count", count);
    define(vm, t, "contains", contains);
    define(vm, t, "trim", trim);
    define(vm, t, "ltrim", ltrim);
    define(vm, t, "rtrim", rtrim);
    define(vm, t, "split", split);
    define(vm, t, "replace", replace);
    define(vm, t, "to_number", to_number);
    define(vm, t, "to_list", to_list);
    define(vm, t, "to_bytes", to_bytes);
    define(vm, t, "lpad", lpad);
    define(vm, t, "rpad", rpad);
    define(vm, t, "@iter", iter_value);
    define(vm, t, "@itern", iter_next);
}

fn receiver(vm: &mut Vm, args: &[Value]) -> Result<GcRef<ObjString>, Raised> {
    match args.first() {
        Some(Value::Obj(Obj::String(s))) => Ok(*s),
        _ => Err(vm.raise("string method called on a non-string receiver")),
    }
}

fn length(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "length", 0)?;
    let s = receiver(vm, args)?;
    Ok(Value::Number(s.length() as f64))
}

fn upper(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "upper", 0)?;
    let s = receiver(vm, args)?;
    let result = s.chars.to_uppercase();
    Ok(Value::Obj(Obj::String(vm.heap.intern_owned(result))))
}

fn lower(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "lower", 0)?;
    let s = receiver(vm, args)?;
    let result = s.chars.to_lowercase();
    Ok(Value::Obj(Obj::String(vm.heap.intern_owned(result))))
}

fn class_test(
    vm: &mut Vm,
    args: &[Value],
    name: &str,
    test: fn(char) -> bool,
) -> Result<Value, Raised> {
    check_arity(vm, args, name, 0)?;
    let s = receiver(vm, args)?;
    let ok = !s.chars.is_empty() && s.chars.chars().all(test);
    Ok(Value::Bool(ok))
}

fn is_alpha(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    class_test(vm, args, "is_alpha", char::is_alphabetic)
}

fn is_digit(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    class_test(vm, args, "is_digit", |c| c.is_ascii_digit())
}

fn is_alnum(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    class_test(vm, args, "is_alnum", char::is_alphanumeric)
}

fn is_space(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    class_test(vm, args, "is_space", char::is_whitespace)
}

fn index_of(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "index_of", 1)?;
    let s = receiver(vm, args)?;
    let needle = want_string(vm, &args[1], "index_of() argument")?;
    match s.chars.find(&needle.chars) {
        Some(byte_index) => {
            let index = s.chars[..byte_index].chars().count();
            Ok(Value::Number(index as f64))
        }
        None => Ok(Value::Number(-1.0)),
    }
}

fn starts_with(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "starts_with", 1)?;
    let s = receiver(vm, args)?;
    let prefix = want_string(vm, &args[1], "starts_with() argument")?;
    Ok(Value::Bool(s.chars.starts_with(&prefix.chars)))
}

fn ends_with(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "ends_with", 1)?;
    let s = receiver(vm, args)?;
    let suffix = want_string(vm, &args[1], "ends_with() argument")?;
    Ok(Value::Bool(s.chars.ends_with(&suffix.chars)))
}

fn count(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "count", 1)?;
    let s = receiver(vm, args)?;
    let needle = want_string(vm, &args[1], "count() argument")?;
    if needle.chars.is_empty() {
        return Ok(Value::Number(0.0));
    }
    Ok(Value::Number(s.chars.matches(&needle.chars).count() as f64))
}

fn contains(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "contains", 1)?;
    let s = receiver(vm, args)?;
    let needle = want_string(vm, &args[1], "contains() argument")?;
    Ok(Value::Bool(s.chars.contains(&needle.chars)))
}

fn trim(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "trim", 0)?;
    let s = receiver(vm, args)?;
    let trimmed = s.chars.trim().to_string();
    Ok(Value::Obj(Obj::String(vm.heap.intern_owned(trimmed))))
}

fn ltrim(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "ltrim", 0)?;
    let s = receiver(vm, args)?;
    let trimmed = s.chars.trim_start().to_string();
    Ok(Value::Obj(Obj::String(vm.heap.intern_owned(trimmed))))
}

fn rtrim(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "rtrim", 0)?;
    let s = receiver(vm, args)?;
    let trimmed = s.chars.trim_end().to_string();
    Ok(Value::Obj(Obj::String(vm.heap.intern_owned(trimmed))))
}

fn split(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "split", 1)?;
    let s = receiver(vm, args)?;
    let separator = want_string(vm, &args[1], "split() argument")?;
    let parts: Vec<String> = if separator.chars.is_empty() {
        s.chars.chars().map(|c| c.to_string()).collect()
    } else {
        s.chars
            .split(&separator.chars)
            .map(|p| p.to_string())
            .collect()
    };
    let mut items = Vec::with_capacity(parts.len());
    for part in parts {
        let interned = vm.heap.intern_owned(part);
        let value = Value::Obj(Obj::String(interned));
        vm.heap.protect(value);
        items.push(value);
    }
    let list = vm.heap.alloc_list(items);
    Ok(Value::Obj(Obj::List(list)))
}

fn replace(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "replace", 2)?;
    let s = receiver(vm, args)?;
    let from = want_string(vm, &args[1], "replace() pattern")?;
    let to = want_string(vm, &args[2], "replace() replacement")?;
    if from.chars.is_empty() {
        return Ok(Value::Obj(Obj::String(s)));
    }
    let replaced = s.chars.replace(&from.chars, &to.chars);
    Ok(Value::Obj(Obj::String(vm.heap.intern_owned(replaced))))
}

fn to_number(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "to_number", 0)?;
    let s = receiver(vm, args)?;
    let parsed = emberc::parse_number(s.chars.trim()).unwrap_or(0.0);
    Ok(Value::Number(parsed))
}

fn to_list(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "to_list", 0)?;
    let s = receiver(vm, args)?;
    let pieces: Vec<String> = s.chars.chars().map(|c| c.to_string()).collect();
    let mut items = Vec::with_capacity(pieces.len());
    for piece in pieces {
        let value = Value::Obj(Obj::String(vm.heap.intern_owned(piece)));
        vm.heap.protect(value);
        items.push(value);
    }
    let list = vm.heap.alloc_list(items);
    Ok(Value::Obj(Obj::List(list)))
}

fn to_bytes(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "to_bytes", 0)?;
    let s = receiver(vm, args)?;
    let bytes = vm.heap.alloc_bytes(s.chars.as_bytes().to_vec());
    Ok(Value::Obj(Obj::Bytes(bytes)))
}

fn pad(
    vm: &mut Vm,
    args: &[Value],
    name: &str,
    left: bool,
) -> Result<Value, Raised> {
    check_arity_between(vm, args, name, 1, 2)?;
    let s = receiver(vm, args)?;
    let width = want_int(vm, &args[1], "pad width")?;
    let fill = if args.len() > 2 {
        let fill = want_string(vm, &args[2], "pad fill")?;
        match fill.chars.chars().next() {
            Some(c) => c,
            None => ' ',
        }
    } else {
        ' '
    };
    let current = s.length() as i64;
    if width <= current {
        return Ok(Value::Obj(Obj::String(s)));
    }
    let padding: String = std::iter::repeat(fill).take((width - current) as usize).collect();
    let result = if left {
        format!("{}{}", padding, s.chars)
    } else {
        format!("{}{}", s.chars, padding)
    };
    Ok(Value::Obj(Obj::String(vm.heap.intern_owned(result))))
}

fn lpad(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    pad(vm, args, "lpad", true)
}

fn rpad(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    pad(vm, args, "rpad", false)
}

fn iter_next(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "@itern", 1)?;
    let s = receiver(vm, args)?;
    index_iter_next(vm, &args[1], s.length())
}

fn iter_value(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "@iter", 1)?;
    let s = receiver(vm, args)?;
    let index = want_int(vm, &args[1], "iteration key")?;
    if index < 0 || index as usize >= s.length() {
        return Err(vm.raise("string iteration key out of range"));
    }
    let piece = if s.is_ascii {
        s.chars[index as usize..index as usize + 1].to_string()
    } else {
        s.chars
            .chars()
            .nth(index as usize)
            .map(|c| c.to_string())
            .unwrap_or_default()
    };
    Ok(Value::Obj(Obj::String(vm.heap.intern_owned(piece))))
}
