//! Range methods
//!
//! Ranges iterate from `lower` toward `upper`, excluding the upper
//! bound; the direction follows the sign of `upper - lower`.

use super::{MethodTable, check_arity, define, want_int};
use crate::exceptions::Raised;
use crate::vm::Vm;
use ember_core::object::{GcRef, Obj, ObjRange};
use ember_core::value::Value;

pub fn install(vm: &mut Vm) {
    let t = MethodTable::Range;
    define(vm, t, "lower", lower);
    define(vm, t, "upper", upper);
    define(vm, t, "span", span);
    define(vm, t, "@iter", iter_value);
    define(vm, t, "@itern", iter_next);
}

fn receiver(vm: &mut Vm, args: &[Value]) -> Result<GcRef<ObjRange>, Raised> {
    match args.first() {
        Some(Value::Obj(Obj::Range(r))) => Ok(*r),
        _ => Err(vm.raise("range method called on a non-range receiver")),
    }
}

fn lower(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "lower", 0)?;
    let range = receiver(vm, args)?;
    Ok(Value::Number(range.lower as f64))
}

fn upper(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "upper", 0)?;
    let range = receiver(vm, args)?;
    Ok(Value::Number(range.upper as f64))
}

fn span(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "span", 0)?;
    let range = receiver(vm, args)?;
    Ok(Value::Number(range.span as f64))
}

fn iter_next(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "@itern", 1)?;
    let range = receiver(vm, args)?;
    match &args[1] {
        Value::Nil => {
            if range.lower == range.upper {
                Ok(Value::Nil)
            } else {
                Ok(Value::Number(range.lower as f64))
            }
        }
        previous => {
            let current = want_int(vm, previous, "iteration key")?;
            let next = if range.upper >= range.lower {
                current + 1
            } else {
                current - 1
            };
            if next == range.upper {
                Ok(Value::Nil)
            } else {
                Ok(Value::Number(next as f64))
            }
        }
    }
}

fn iter_value(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    check_arity(vm, args, "@iter", 1)?;
    receiver(vm, args)?;
    Ok(args[1])
}
