//! Built-in global functions
//!
//! Type predicates, conversions, introspection, and basic I/O. Installed
//! into the VM globals table at bootstrap; module-scope names shadow
//! them, the VM falls back here on a module-table miss.

use crate::exceptions::Raised;
use crate::vm::{Vm, coerce_number};
use ember_core::object::{GcRef, Obj, ObjString, StdStream};
use ember_core::value::Value;

pub fn install(vm: &mut Vm) {
    vm.define_native("abs", abs);
    vm.define_native("bin", bin);
    vm.define_native("chr", chr);
    vm.define_native("file", file);
    vm.define_native("hex", hex);
    vm.define_native("id", id);
    vm.define_native("int", to_int);
    vm.define_native("is_bool", is_bool);
    vm.define_native("is_bytes", is_bytes);
    vm.define_native("is_callable", is_callable);
    vm.define_native("is_class", is_class);
    vm.define_native("is_dict", is_dict);
    vm.define_native("is_file", is_file);
    vm.define_native("is_function", is_function);
    vm.define_native("is_instance", is_instance);
    vm.define_native("is_int", is_int);
    vm.define_native("is_iterable", is_iterable);
    vm.define_native("is_list", is_list);
    vm.define_native("is_number", is_number);
    vm.define_native("is_object", is_object);
    vm.define_native("is_string", is_string);
    vm.define_native("max", max);
    vm.define_native("min", min);
    vm.define_native("oct", oct);
    vm.define_native("ord", ord);
    vm.define_native("print", print);
    vm.define_native("sum", sum);
    vm.define_native("to_bool", to_bool);
    vm.define_native("to_bytes", to_bytes);
    vm.define_native("to_dict", to_dict);
    vm.define_native("to_int", to_int);
    vm.define_native("to_list", to_list);
    vm.define_native("to_number", to_number);
    vm.define_native("to_string", to_string);
    vm.define_native("typeof", type_of);
}

fn check_arity(vm: &mut Vm, args: &[Value], name: &str, expected: usize) -> Result<(), Raised> {
    if args.len() != expected {
        return Err(vm.raise(&format!(
            "{}() expects {} arguments, got {}",
            name,
            expected,
            args.len()
        )));
    }
    Ok(())
}

fn number_arg(vm: &mut Vm, args: &[Value], name: &str) -> Result<f64, Raised> {
    check_arity(vm, args, name, 1)?;
    match coerce_number(&args[0]) {
        Some(n) => Ok(n),
        None => Err(vm.raise(&format!(
            "{}() expects a number, got '{}'",
            name,
            args[0].type_name()
        ))),
    }
}

// ---- numeric ------------------------------------------------------------

fn abs(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    let n = number_arg(vm, args, "abs")?;
    Ok(Value::Number(n.abs()))
}

fn radix_format(n: f64, prefix: &str, radix: u32) -> String {
    let value = n as i64;
    let magnitude = value.unsigned_abs();
    let digits = match radix {
        2 => format!("{:b}", magnitude),
        8 => format!("{:o}", magnitude),
        _ => format!("{:x}", magnitude),
    };
    if value < 0 {
        format!("-{}{}", prefix, digits)
    } else {
        format!("{}{}", prefix, digits)
    }
}

fn bin(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    let n = number_arg(vm, args, "bin")?;
    let text = radix_format(n, "0b", 2);
    Ok(Value::Obj(Obj::String(vm.heap.intern_owned(text))))
}

fn oct(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    let n = number_arg(vm, args, "oct")?;
    let text = radix_format(n, "0c", 8);
    Ok(Value::Obj(Obj::String(vm.heap.intern_owned(text))))
}

fn hex(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    let n = number_arg(vm, args, "hex")?;
    let text = radix_format(n, "0x", 16);
    Ok(Value::Obj(Obj::String(vm.heap.intern_owned(text))))
}

fn chr(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    let n = number_arg(vm, args, "chr")?;
    match char::from_u32(n as u32) {
        Some(c) => {
            let text = c.to_string();
            Ok(Value::Obj(Obj::String(vm.heap.intern_owned(text))))
        }
        None => Err(vm.raise(&format!("chr() argument {} is not a valid codepoint", n))),
    }
}

fn ord(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "ord", 1)?;
    let Some(s) = args[0].as_string() else {
        return Err(vm.raise(&format!(
            "ord() expects a string, got '{}'",
            args[0].type_name()
        )));
    };
    let mut chars = s.chars.chars();
    let (Some(c), None) = (chars.next(), chars.next()) else {
        return Err(vm.raise("ord() expects a single-character string"));
    };
    Ok(Value::Number(c as u32 as f64))
}

// ---- reductions ---------------------------------------------------------

fn numeric_values(vm: &mut Vm, args: &[Value], name: &str) -> Result<Vec<f64>, Raised> {
    let values: Vec<Value> = match args {
        [Value::Obj(Obj::List(list))] => list.items.clone(),
        _ => args.to_vec(),
    };
    if values.len() < 2 && !matches!(args, [Value::Obj(Obj::List(_))]) {
        return Err(vm.raise(&format!(
            "{}() expects a list or at least 2 numbers",
            name
        )));
    }
    let mut numbers = Vec::with_capacity(values.len());
    for value in &values {
        match coerce_number(value) {
            Some(n) => numbers.push(n),
            None => {
                return Err(vm.raise(&format!(
                    "{}() expects numbers, got '{}'",
                    name,
                    value.type_name()
                )))
            }
        }
    }
    Ok(numbers)
}

fn max(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    let numbers = numeric_values(vm, args, "max")?;
    match numbers.into_iter().reduce(f64::max) {
        Some(n) => Ok(Value::Number(n)),
        None => Ok(Value::Nil),
    }
}

fn min(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    let numbers = numeric_values(vm, args, "min")?;
    match numbers.into_iter().reduce(f64::min) {
        Some(n) => Ok(Value::Number(n)),
        None => Ok(Value::Nil),
    }
}

fn sum(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    let numbers = numeric_values(vm, args, "sum")?;
    Ok(Value::Number(numbers.into_iter().sum()))
}

// ---- predicates ---------------------------------------------------------

fn is_bool(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "is_bool", 1)?;
    Ok(Value::Bool(matches!(args[0], Value::Bool(_))))
}

fn is_bytes(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "is_bytes", 1)?;
    Ok(Value::Bool(matches!(args[0], Value::Obj(Obj::Bytes(_)))))
}

fn is_callable(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "is_callable", 1)?;
    Ok(Value::Bool(matches!(
        args[0],
        Value::Obj(Obj::Closure(_))
            | Value::Obj(Obj::BoundMethod(_))
            | Value::Obj(Obj::Native(_))
            | Value::Obj(Obj::Class(_))
    )))
}

fn is_class(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "is_class", 1)?;
    Ok(Value::Bool(matches!(args[0], Value::Obj(Obj::Class(_)))))
}

fn is_dict(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "is_dict", 1)?;
    Ok(Value::Bool(matches!(args[0], Value::Obj(Obj::Dict(_)))))
}

fn is_file(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "is_file", 1)?;
    Ok(Value::Bool(matches!(args[0], Value::Obj(Obj::File(_)))))
}

fn is_function(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "is_function", 1)?;
    Ok(Value::Bool(matches!(
        args[0],
        Value::Obj(Obj::Closure(_))
            | Value::Obj(Obj::BoundMethod(_))
            | Value::Obj(Obj::Native(_))
    )))
}

fn is_instance(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "is_instance", 1)?;
    Ok(Value::Bool(matches!(args[0], Value::Obj(Obj::Instance(_)))))
}

fn is_int(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "is_int", 1)?;
    let result = matches!(args[0], Value::Number(n) if n.fract() == 0.0 && n.is_finite());
    Ok(Value::Bool(result))
}

fn is_iterable(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "is_iterable", 1)?;
    Ok(Value::Bool(matches!(
        args[0],
        Value::Obj(Obj::List(_))
            | Value::Obj(Obj::Dict(_))
            | Value::Obj(Obj::String(_))
            | Value::Obj(Obj::Bytes(_))
            | Value::Obj(Obj::Range(_))
            | Value::Obj(Obj::Instance(_))
    )))
}

fn is_list(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "is_list", 1)?;
    Ok(Value::Bool(matches!(args[0], Value::Obj(Obj::List(_)))))
}

fn is_number(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "is_number", 1)?;
    Ok(Value::Bool(matches!(args[0], Value::Number(_))))
}

fn is_object(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "is_object", 1)?;
    Ok(Value::Bool(matches!(args[0], Value::Obj(Obj::Instance(_)))))
}

fn is_string(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "is_string", 1)?;
    Ok(Value::Bool(matches!(args[0], Value::Obj(Obj::String(_)))))
}

// ---- conversions --------------------------------------------------------

fn parse_string_number(vm: &mut Vm, s: GcRef<ObjString>, name: &str) -> Result<f64, Raised> {
    match emberc::parse_number(s.chars.trim()) {
        Some(n) => Ok(n),
        None => Err(vm.raise(&format!(
            "{}() could not parse '{}' as a number",
            name, s.chars
        ))),
    }
}

fn to_int(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "int", 1)?;
    match args[0] {
        Value::Number(n) => Ok(Value::Number(n.trunc())),
        Value::Bool(b) => Ok(Value::Number(if b { 1.0 } else { 0.0 })),
        Value::Obj(Obj::String(s)) => {
            let n = parse_string_number(vm, s, "int")?;
            Ok(Value::Number(n.trunc()))
        }
        other => Err(vm.raise(&format!(
            "int() cannot convert '{}' to an integer",
            other.type_name()
        ))),
    }
}

fn to_number(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "to_number", 1)?;
    match args[0] {
        Value::Number(n) => Ok(Value::Number(n)),
        Value::Bool(b) => Ok(Value::Number(if b { 1.0 } else { 0.0 })),
        Value::Obj(Obj::String(s)) => {
            let n = parse_string_number(vm, s, "to_number")?;
            Ok(Value::Number(n))
        }
        other => Err(vm.raise(&format!(
            "to_number() cannot convert '{}' to a number",
            other.type_name()
        ))),
    }
}

fn to_string(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "to_string", 1)?;
    let text = args[0].render();
    Ok(Value::Obj(Obj::String(vm.heap.intern_owned(text))))
}

fn to_bool(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "to_bool", 1)?;
    Ok(Value::Bool(!args[0].is_false()))
}

fn to_list(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "to_list", 1)?;
    match args[0] {
        Value::Obj(Obj::List(list)) => {
            let items = list.items.clone();
            let copy = vm.heap.alloc_list(items);
            Ok(Value::Obj(Obj::List(copy)))
        }
        Value::Obj(Obj::String(s)) => {
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
        Value::Obj(Obj::Bytes(bytes)) => {
            let items: Vec<Value> =
                bytes.bytes.iter().map(|b| Value::Number(*b as f64)).collect();
            let list = vm.heap.alloc_list(items);
            Ok(Value::Obj(Obj::List(list)))
        }
        Value::Obj(Obj::Dict(dict)) => {
            let items = dict.keys.clone();
            let list = vm.heap.alloc_list(items);
            Ok(Value::Obj(Obj::List(list)))
        }
        Value::Obj(Obj::Range(range)) => {
            let mut items = Vec::with_capacity(range.span as usize);
            if range.upper >= range.lower {
                for n in range.lower..range.upper {
                    items.push(Value::Number(n as f64));
                }
            } else {
                let mut n = range.lower;
                while n > range.upper {
                    items.push(Value::Number(n as f64));
                    n -= 1;
                }
            }
            let list = vm.heap.alloc_list(items);
            Ok(Value::Obj(Obj::List(list)))
        }
        other => Err(vm.raise(&format!(
            "to_list() cannot convert '{}' to a list",
            other.type_name()
        ))),
    }
}

fn to_dict(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "to_dict", 1)?;
    match args[0] {
        Value::Obj(Obj::Dict(dict)) => {
            let mut copy = vm.heap.alloc_dict();
            for key in &dict.keys {
                let value = dict.table.get(key).unwrap_or(Value::Nil);
                copy.table.set(*key, value);
                copy.keys.push(*key);
            }
            Ok(Value::Obj(Obj::Dict(copy)))
        }
        Value::Obj(Obj::Instance(instance)) => {
            let mut dict = vm.heap.alloc_dict();
            let entries: Vec<(Value, Value)> = instance.properties.iter().collect();
            for (key, value) in entries {
                if dict.table.set(key, value) {
                    dict.keys.push(key);
                }
            }
            Ok(Value::Obj(Obj::Dict(dict)))
        }
        other => Err(vm.raise(&format!(
            "to_dict() cannot convert '{}' to a dictionary",
            other.type_name()
        ))),
    }
}

fn to_bytes(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "to_bytes", 1)?;
    match args[0] {
        Value::Obj(Obj::Bytes(bytes)) => {
            let copy = vm.heap.alloc_bytes(bytes.bytes.clone());
            Ok(Value::Obj(Obj::Bytes(copy)))
        }
        Value::Obj(Obj::String(s)) => {
            let bytes = vm.heap.alloc_bytes(s.chars.as_bytes().to_vec());
            Ok(Value::Obj(Obj::Bytes(bytes)))
        }
        Value::Obj(Obj::List(list)) => {
            let mut bytes = Vec::with_capacity(list.items.len());
            for item in &list.items {
                match item.as_number() {
                    Some(n) if (0.0..=255.0).contains(&n) && n.fract() == 0.0 => {
                        bytes.push(n as u8)
                    }
                    _ => {
                        return Err(
                            vm.raise("to_bytes() list items must be integers from 0 to 255")
                        )
                    }
                }
            }
            let bytes = vm.heap.alloc_bytes(bytes);
            Ok(Value::Obj(Obj::Bytes(bytes)))
        }
        other => Err(vm.raise(&format!(
            "to_bytes() cannot convert '{}' to bytes",
            other.type_name()
        ))),
    }
}

// ---- introspection and I/O ----------------------------------------------

fn type_of(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "typeof", 1)?;
    let name = args[0].type_name();
    Ok(Value::Obj(Obj::String(vm.heap.intern(name))))
}

fn id(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "id", 1)?;
    match args[0] {
        Value::Obj(obj) => Ok(Value::Number(obj.id() as f64)),
        _ => Ok(Value::Nil),
    }
}

fn print(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    let rendered: Vec<String> = args.iter().map(|v| v.render()).collect();
    let line = rendered.join(" ");
    vm.write_out(&line);
    Ok(Value::Nil)
}

fn file(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    if args.is_empty() || args.len() > 2 {
        return Err(vm.raise(&format!(
            "file() expects 1 to 2 arguments, got {}",
            args.len()
        )));
    }
    let Some(path) = args[0].as_string() else {
        return Err(vm.raise(&format!(
            "file() path must be a string, got '{}'",
            args[0].type_name()
        )));
    };
    let mode = match args.get(1) {
        Some(value) => {
            let Some(mode) = value.as_string() else {
                return Err(vm.raise(&format!(
                    "file() mode must be a string, got '{}'",
                    value.type_name()
                )));
            };
            mode.chars.clone()
        }
        None => "r".to_string(),
    };
    let file = vm
        .heap
        .alloc_file(path.chars.clone(), mode, None, None);
    Ok(Value::Obj(Obj::File(file)))
}

/// Standard stream file objects: mode-less files the collector never
/// closes. Used by native modules that expose stdin/stdout/stderr.
pub fn std_stream_file(vm: &mut Vm, stream: StdStream) -> Value {
    let path = match stream {
        StdStream::In => "<stdin>",
        StdStream::Out => "<stdout>",
        StdStream::Err => "<stderr>",
    };
    let file = vm
        .heap
        .alloc_file(path.to_string(), String::new(), None, Some(stream));
    Value::Obj(Obj::File(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::InterpretResult;

    fn run(source: &str) -> String {
        let mut vm = Vm::new_captured();
        let result = vm.interpret(source, "builtins_test.em");
        assert_eq!(result, InterpretResult::Ok, "source failed: {}", source);
        vm.take_output()
    }

    #[test]
    fn test_conversions() {
        assert_eq!(run("echo int(\"42\")\n"), "42\n");
        assert_eq!(run("echo int(3.9)\n"), "3\n");
        assert_eq!(run("echo to_string(7)\n"), "7\n");
        assert_eq!(run("echo to_number(\"0x10\")\n"), "16\n");
        assert_eq!(run("echo to_bool(0)\n"), "true\n");
        assert_eq!(run("echo to_bool(-1)\n"), "false\n");
    }

    #[test]
    fn test_radix_formatting() {
        assert_eq!(run("echo bin(5)\n"), "0b101\n");
        assert_eq!(run("echo oct(15)\n"), "0c17\n");
        assert_eq!(run("echo hex(255)\n"), "0xff\n");
        assert_eq!(run("echo hex(-255)\n"), "-0xff\n");
    }

    #[test]
    fn test_chr_ord_roundtrip() {
        assert_eq!(run("echo chr(65)\n"), "A\n");
        assert_eq!(run("echo ord(\"A\")\n"), "65\n");
        assert_eq!(run("echo chr(ord(\"é\"))\n"), "é\n");
    }

    #[test]
    fn test_predicates() {
        assert_eq!(run("echo is_int(3)\n"), "true\n");
        assert_eq!(run("echo is_int(3.5)\n"), "false\n");
        assert_eq!(run("echo is_string(\"s\")\n"), "true\n");
        assert_eq!(run("echo is_list([])\n"), "true\n");
        assert_eq!(run("echo is_callable(to_string)\n"), "true\n");
        assert_eq!(run("echo is_callable(1)\n"), "false\n");
    }

    #[test]
    fn test_reductions() {
        assert_eq!(run("echo max(1, 9, 4)\n"), "9\n");
        assert_eq!(run("echo min([3, 1, 2])\n"), "1\n");
        assert_eq!(run("echo sum([1, 2, 3, 4])\n"), "10\n");
    }

    #[test]
    fn test_typeof() {
        assert_eq!(run("echo typeof(1)\n"), "number\n");
        assert_eq!(run("echo typeof(\"s\")\n"), "string\n");
        assert_eq!(run("echo typeof([])\n"), "list\n");
        assert_eq!(run("echo typeof(nil)\n"), "nil\n");
    }
}
