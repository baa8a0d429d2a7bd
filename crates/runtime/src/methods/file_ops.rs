//! File methods
//!
//! File objects are created by the `file()` builtin and open lazily on
//! the first read or write. A zero-length mode marks a standard stream;
//! those refuse `close` and report tty status through `libc::isatty`.

use super::{MethodTable, check_arity, define, want_string};
use crate::exceptions::Raised;
use crate::vm::Vm;
use ember_core::object::{GcRef, Obj, ObjFile, StdStream};
use ember_core::value::Value;
use std::fs::OpenOptions;
use std::io::{Read, Write};

pub fn install(vm: &mut Vm) {
    let t = MethodTable::File;
    define(vm, t, "exists", exists);
    define(vm, t, "open", open);
    define(vm, t, "close", close);
    define(vm, t, "read", read);
    define(vm, t, "write", write);
    define(vm, t, "name", name);
    define(vm, t, "mode", mode);
    define(vm, t, "is_open", is_open);
    define(vm, t, "is_closed", is_closed);
    define(vm, t, "is_tty", is_tty);
}

fn receiver(vm: &mut Vm, args: &[Value]) -> Result<GcRef<ObjFile>, Raised> {
    match args.first() {
        Some(Value::Obj(Obj::File(f))) => Ok(*f),
        _ => Err(vm.raise("file method called on a non-file receiver")),
    }
}

fn open_handle(vm: &mut Vm, file: &mut ObjFile) -> Result<(), Raised> {
    if file.handle.is_some() || file.is_std() {
        return Ok(());
    }
    let mut options = OpenOptions::new();
    match file.mode.as_str() {
        "r" => options.read(true),
        "w" => options.write(true).create(true).truncate(true),
        "a" => options.append(true).create(true),
        "r+" => options.read(true).write(true),
        "w+" => options.read(true).write(true).create(true).truncate(true),
        other => {
            return Err(vm.raise(&format!("invalid file mode '{}'", other)));
        }
    };
    match options.open(&file.path) {
        Ok(handle) => {
            file.handle = Some(handle);
            file.is_open = true;
            Ok(())
        }
        Err(err) => Err(vm.raise(&format!("could not open '{}': {}", file.path, err))),
    }
}

fn exists(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "exists", 0)?;
    let file = receiver(vm, args)?;
    Ok(Value::Bool(std::path::Path::new(&file.path).exists()))
}

fn open(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "open", 0)?;
    let mut file = receiver(vm, args)?;
    if file.is_std() {
        return Ok(Value::Nil);
    }
    open_handle(vm, &mut file)?;
    Ok(Value::Nil)
}

fn close(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "close", 0)?;
    let mut file = receiver(vm, args)?;
    if file.is_std() {
        return Err(vm.raise("cannot close a standard stream"));
    }
    file.handle = None;
    file.is_open = false;
    Ok(Value::Nil)
}

fn read(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "read", 0)?;
    let mut file = receiver(vm, args)?;
    if file.is_std() {
        let mut text = String::new();
        if matches!(file.std_stream, Some(StdStream::In)) {
            if let Err(err) = std::io::stdin().read_to_string(&mut text) {
                return Err(vm.raise(&format!("could not read standard input: {}", err)));
            }
            let interned = vm.heap.intern_owned(text);
            return Ok(Value::Obj(Obj::String(interned)));
        }
        return Err(vm.raise("stream is not readable"));
    }
    open_handle(vm, &mut file)?;
    let Some(handle) = file.handle.as_mut() else {
        return Err(vm.raise("file is not open"));
    };
    let mut text = String::new();
    if let Err(err) = handle.read_to_string(&mut text) {
        return Err(vm.raise(&format!("could not read '{}': {}", file.path, err)));
    }
    let interned = vm.heap.intern_owned(text);
    Ok(Value::Obj(Obj::String(interned)))
}

fn write(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "write", 1)?;
    let mut file = receiver(vm, args)?;
    let text = want_string(vm, &args[1], "write() argument")?;
    if file.is_std() {
        match file.std_stream {
            Some(StdStream::Out) => vm.write_out(&text.chars),
            Some(StdStream::Err) => eprint!("{}", text.chars),
            _ => return Err(vm.raise("stream is not writable")),
        }
        return Ok(Value::Number(text.chars.len() as f64));
    }
    open_handle(vm, &mut file)?;
    let Some(handle) = file.handle.as_mut() else {
        return Err(vm.raise("file is not open"));
    };
    match handle.write_all(text.chars.as_bytes()) {
        Ok(()) => Ok(Value::Number(text.chars.len() as f64)),
        Err(err) => Err(vm.raise(&format!("could not write '{}': {}", file.path, err))),
    }
}

fn name(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "name", 0)?;
    let file = receiver(vm, args)?;
    let path = file.path.clone();
    Ok(Value::Obj(Obj::String(vm.heap.intern_owned(path))))
}

fn mode(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "mode", 0)?;
    let file = receiver(vm, args)?;
    let mode = file.mode.clone();
    Ok(Value::Obj(Obj::String(vm.heap.intern_owned(mode))))
}

fn is_open(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "is_open", 0)?;
    let file = receiver(vm, args)?;
    Ok(Value::Bool(file.is_open))
}

fn is_closed(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "is_closed", 0)?;
    let file = receiver(vm, args)?;
    Ok(Value::Bool(!file.is_open))
}

fn is_tty(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "is_tty", 0)?;
    let file = receiver(vm, args)?;
    let tty = match file.std_stream {
        Some(StdStream::In) => unsafe { libc::isatty(0) == 1 },
        Some(StdStream::Out) => unsafe { libc::isatty(1) == 1 },
        Some(StdStream::Err) => unsafe { libc::isatty(2) == 1 },
        None => false,
    };
    Ok(Value::Bool(tty))
}
