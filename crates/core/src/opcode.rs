//! The bytecode instruction set
//!
//! One-byte opcodes followed by zero to six bytes of operands; 16-bit
//! operands are big-endian. `OP_CLOSURE` is the only variable-length
//! instruction: its constant operand is followed by one (is-local, 16-bit
//! index) record per captured upvalue.

use crate::blob::Blob;
use crate::object::Obj;
use crate::value::Value;
use std::fmt::Write;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    // Constants and stack shuffling
    Constant,
    Nil,
    True,
    False,
    Empty,
    Pop,
    PopN,
    Dup,
    One,

    // Arithmetic and logic
    Add,
    Subtract,
    Multiply,
    Divide,
    FloorDivide,
    Remainder,
    Pow,
    Negate,
    Not,
    BitNot,
    BitAnd,
    BitOr,
    BitXor,
    LShift,
    RShift,
    Equal,
    Greater,
    Less,
    Range,
    Stringify,
    Choice,

    // Module-scope globals
    DefineGlobal,
    GetGlobal,
    SetGlobal,

    // Locals
    GetLocal,
    SetLocal,

    // Upvalues
    GetUpvalue,
    SetUpvalue,
    CloseUpvalue,

    // Properties
    GetProperty,
    GetSelfProperty,
    SetProperty,

    // Control flow
    Jump,
    JumpIfFalse,
    Loop,
    /// Placeholder emitted for `break`; rewritten to a forward Jump when
    /// the enclosing loop's extent is known.
    BreakPlaceholder,

    // Closures and calls
    Closure,
    Call,
    Invoke,
    InvokeSelf,
    Return,

    // Classes
    Class,
    Method,
    ClassProperty,
    Inherit,
    GetSuper,
    SuperInvoke,
    SuperInvokeSelf,

    // Containers
    List,
    Dict,
    GetIndex,
    GetRangedIndex,
    SetIndex,

    // Imports
    CallImport,
    NativeModule,
    SelectImport,
    SelectNativeImport,
    ImportAll,
    ImportAllNative,
    EjectImport,
    EjectNativeImport,

    // Exceptions
    Try,
    PopTry,
    PublishTry,

    // Statements
    Echo,
    Assert,
    Die,
    Switch,
}

impl Op {
    /// Decode an instruction byte. Returns None for bytes past the opcode
    /// space (possible only on corrupted code).
    pub fn from_byte(byte: u8) -> Option<Op> {
        if byte <= Op::Switch as u8 {
            // Safety: Op is a fieldless repr(u8) enum with contiguous
            // discriminants from 0 through Op::Switch.
            Some(unsafe { std::mem::transmute::<u8, Op>(byte) })
        } else {
            None
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Op::Constant => "CONSTANT",
            Op::Nil => "NIL",
            Op::True => "TRUE",
            Op::False => "FALSE",
            Op::Empty => "EMPTY",
            Op::Pop => "POP",
            Op::PopN => "POP_N",
            Op::Dup => "DUP",
            Op::One => "ONE",
            Op::Add => "ADD",
            Op::Subtract => "SUBTRACT",
            Op::Multiply => "MULTIPLY",
            Op::Divide => "DIVIDE",
            Op::FloorDivide => "FLOOR_DIVIDE",
            Op::Remainder => "REMAINDER",
            Op::Pow => "POW",
            Op::Negate => "NEGATE",
            Op::Not => "NOT",
            Op::BitNot => "BIT_NOT",
            Op::BitAnd => "BIT_AND",
            Op::BitOr => "BIT_OR",
            Op::BitXor => "BIT_XOR",
            Op::LShift => "LSHIFT",
            Op::RShift => "RSHIFT",
            Op::Equal => "EQUAL",
            Op::Greater => "GREATER",
            Op::Less => "LESS",
            Op::Range => "RANGE",
            Op::Stringify => "STRINGIFY",
            Op::Choice => "CHOICE",
            Op::DefineGlobal => "DEFINE_GLOBAL",
            Op::GetGlobal => "GET_GLOBAL",
            Op::SetGlobal => "SET_GLOBAL",
            Op::GetLocal => "GET_LOCAL",
            Op::SetLocal => "SET_LOCAL",
            Op::GetUpvalue => "GET_UPVALUE",
            Op::SetUpvalue => "SET_UPVALUE",
            Op::CloseUpvalue => "CLOSE_UPVALUE",
            Op::GetProperty => "GET_PROPERTY",
            Op::GetSelfProperty => "GET_SELF_PROPERTY",
            Op::SetProperty => "SET_PROPERTY",
            Op::Jump => "JUMP",
            Op::JumpIfFalse => "JUMP_IF_FALSE",
            Op::Loop => "LOOP",
            Op::BreakPlaceholder => "BREAK_PL",
            Op::Closure => "CLOSURE",
            Op::Call => "CALL",
            Op::Invoke => "INVOKE",
            Op::InvokeSelf => "INVOKE_SELF",
            Op::Return => "RETURN",
            Op::Class => "CLASS",
            Op::Method => "METHOD",
            Op::ClassProperty => "CLASS_PROPERTY",
            Op::Inherit => "INHERIT",
            Op::GetSuper => "GET_SUPER",
            Op::SuperInvoke => "SUPER_INVOKE",
            Op::SuperInvokeSelf => "SUPER_INVOKE_SELF",
            Op::List => "LIST",
            Op::Dict => "DICT",
            Op::GetIndex => "GET_INDEX",
            Op::GetRangedIndex => "GET_RANGED_INDEX",
            Op::SetIndex => "SET_INDEX",
            Op::CallImport => "CALL_IMPORT",
            Op::NativeModule => "NATIVE_MODULE",
            Op::SelectImport => "SELECT_IMPORT",
            Op::SelectNativeImport => "SELECT_NATIVE_IMPORT",
            Op::ImportAll => "IMPORT_ALL",
            Op::ImportAllNative => "IMPORT_ALL_NATIVE",
            Op::EjectImport => "EJECT_IMPORT",
            Op::EjectNativeImport => "EJECT_NATIVE_IMPORT",
            Op::Try => "TRY",
            Op::PopTry => "POP_TRY",
            Op::PublishTry => "PUBLISH_TRY",
            Op::Echo => "ECHO",
            Op::Assert => "ASSERT",
            Op::Die => "DIE",
            Op::Switch => "SWITCH",
        }
    }

    /// Operand byte count for fixed-width instructions. `Op::Closure` is
    /// variable; use [`instruction_len`] for it.
    pub fn operand_len(self) -> usize {
        match self {
            Op::Nil
            | Op::True
            | Op::False
            | Op::Empty
            | Op::Pop
            | Op::Dup
            | Op::One
            | Op::Add
            | Op::Subtract
            | Op::Multiply
            | Op::Divide
            | Op::FloorDivide
            | Op::Remainder
            | Op::Pow
            | Op::Negate
            | Op::Not
            | Op::BitNot
            | Op::BitAnd
            | Op::BitOr
            | Op::BitXor
            | Op::LShift
            | Op::RShift
            | Op::Equal
            | Op::Greater
            | Op::Less
            | Op::Range
            | Op::Stringify
            | Op::CloseUpvalue
            | Op::Inherit
            | Op::Return
            | Op::GetRangedIndex
            | Op::SetIndex
            | Op::ImportAll
            | Op::ImportAllNative
            | Op::PopTry
            | Op::PublishTry
            | Op::Echo
            | Op::Assert
            | Op::Die => 0,
            // GetIndex carries a keep-operands flag for compound index
            // assignment; Call carries the argument count.
            Op::GetIndex | Op::Call => 1,
            Op::Constant
            | Op::PopN
            | Op::Choice
            | Op::DefineGlobal
            | Op::GetGlobal
            | Op::SetGlobal
            | Op::GetLocal
            | Op::SetLocal
            | Op::GetUpvalue
            | Op::SetUpvalue
            | Op::GetProperty
            | Op::GetSelfProperty
            | Op::SetProperty
            | Op::Jump
            | Op::JumpIfFalse
            | Op::Loop
            | Op::BreakPlaceholder
            | Op::Class
            | Op::GetSuper
            | Op::List
            | Op::Dict
            | Op::CallImport
            | Op::NativeModule
            | Op::SelectImport
            | Op::SelectNativeImport
            | Op::EjectImport
            | Op::EjectNativeImport
            | Op::Switch => 2,
            Op::Invoke
            | Op::InvokeSelf
            | Op::Method
            | Op::ClassProperty
            | Op::SuperInvoke
            | Op::SuperInvokeSelf => 3,
            Op::Try => 6,
            Op::Closure => 2,
        }
    }
}

/// Total byte length (opcode plus operands) of the instruction at `offset`.
///
/// This consults the constant pool for `OP_CLOSURE`, whose length depends
/// on the captured function's upvalue count.
pub fn instruction_len(blob: &Blob, offset: usize) -> usize {
    let Some(op) = Op::from_byte(blob.code[offset]) else {
        return 1;
    };
    if op == Op::Closure {
        let constant = blob.read_u16(offset + 1) as usize;
        let upvalues = match blob.constants.get(constant) {
            Some(Value::Obj(Obj::Function(f))) => f.upvalue_count,
            _ => 0,
        };
        3 + 3 * upvalues
    } else {
        1 + op.operand_len()
    }
}

/// Render one instruction; returns the rendered text and the next offset.
pub fn disassemble_instruction(blob: &Blob, offset: usize) -> (String, usize) {
    let mut text = String::new();
    let _ = write!(text, "{:04} ", offset);
    if offset > 0 && blob.line_at(offset) == blob.line_at(offset - 1) {
        text.push_str("   | ");
    } else {
        let _ = write!(text, "{:4} ", blob.line_at(offset));
    }

    let Some(op) = Op::from_byte(blob.code[offset]) else {
        let _ = write!(text, "BAD_OPCODE {}", blob.code[offset]);
        return (text, offset + 1);
    };

    match op {
        Op::Constant
        | Op::DefineGlobal
        | Op::GetGlobal
        | Op::SetGlobal
        | Op::GetProperty
        | Op::GetSelfProperty
        | Op::SetProperty
        | Op::Class
        | Op::GetSuper
        | Op::CallImport
        | Op::NativeModule
        | Op::SelectImport
        | Op::SelectNativeImport
        | Op::ImportAllNative
        | Op::EjectImport
        | Op::EjectNativeImport
        | Op::Switch => {
            let constant = blob.read_u16(offset + 1) as usize;
            let _ = write!(text, "{:<18} {:4}", op.name(), constant);
            if let Some(value) = blob.constants.get(constant) {
                let _ = write!(text, " '{}'", value);
            }
        }
        Op::PopN
        | Op::GetLocal
        | Op::SetLocal
        | Op::GetUpvalue
        | Op::SetUpvalue
        | Op::List
        | Op::Dict => {
            let slot = blob.read_u16(offset + 1);
            let _ = write!(text, "{:<18} {:4}", op.name(), slot);
        }
        Op::Jump | Op::JumpIfFalse | Op::BreakPlaceholder | Op::Choice => {
            let jump = blob.read_u16(offset + 1) as usize;
            let _ = write!(text, "{:<18} {:4} -> {}", op.name(), offset, offset + 3 + jump);
        }
        Op::Loop => {
            let jump = blob.read_u16(offset + 1) as usize;
            let _ = write!(text, "{:<18} {:4} -> {}", op.name(), offset, offset + 3 - jump);
        }
        Op::Call | Op::GetIndex => {
            let _ = write!(text, "{:<18} {:4}", op.name(), blob.code[offset + 1]);
        }
        Op::Invoke | Op::InvokeSelf | Op::SuperInvoke | Op::SuperInvokeSelf => {
            let constant = blob.read_u16(offset + 1) as usize;
            let argc = blob.code[offset + 3];
            let _ = write!(text, "{:<18} {:4} args", op.name(), argc);
            if let Some(value) = blob.constants.get(constant) {
                let _ = write!(text, " '{}'", value);
            }
        }
        Op::Method | Op::ClassProperty => {
            let constant = blob.read_u16(offset + 1) as usize;
            let is_static = blob.code[offset + 3] != 0;
            let _ = write!(text, "{:<18} {:4}", op.name(), constant);
            if let Some(value) = blob.constants.get(constant) {
                let _ = write!(text, " '{}'", value);
            }
            if is_static {
                text.push_str(" static");
            }
        }
        Op::Try => {
            let handler = blob.read_u16(offset + 1);
            let catch_addr = blob.read_u16(offset + 3);
            let finally_addr = blob.read_u16(offset + 5);
            let _ = write!(
                text,
                "{:<18} {:4} catch {} finally {}",
                op.name(),
                handler,
                catch_addr,
                finally_addr
            );
        }
        Op::Closure => {
            let constant = blob.read_u16(offset + 1) as usize;
            let _ = write!(text, "{:<18} {:4}", op.name(), constant);
            if let Some(value) = blob.constants.get(constant) {
                let _ = write!(text, " '{}'", value);
            }
            if let Some(Value::Obj(Obj::Function(f))) = blob.constants.get(constant) {
                let mut at = offset + 3;
                for _ in 0..f.upvalue_count {
                    let is_local = blob.code[at] != 0;
                    let index = blob.read_u16(at + 1);
                    let _ = write!(
                        text,
                        "\n{:04}    |   {} {}",
                        at,
                        if is_local { "local" } else { "upvalue" },
                        index
                    );
                    at += 3;
                }
            }
        }
        _ => {
            text.push_str(op.name());
        }
    }

    (text, offset + instruction_len(blob, offset))
}

/// Render a whole blob, one instruction per line.
pub fn disassemble(blob: &Blob, name: &str) -> String {
    let mut out = format!("== {} ==\n", name);
    let mut offset = 0;
    while offset < blob.code.len() {
        let (line, next) = disassemble_instruction(blob, offset);
        out.push_str(&line);
        out.push('\n');
        offset = next;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_byte_roundtrip() {
        assert_eq!(Op::from_byte(Op::Constant as u8), Some(Op::Constant));
        assert_eq!(Op::from_byte(Op::Switch as u8), Some(Op::Switch));
        assert_eq!(Op::from_byte(Op::Switch as u8 + 1), None);
        assert_eq!(Op::from_byte(0xff), None);
    }

    #[test]
    fn test_instruction_len_fixed() {
        let mut blob = Blob::new();
        blob.write(Op::Add as u8, 1);
        blob.write(Op::Call as u8, 1);
        blob.write(2, 1);
        blob.write(Op::Jump as u8, 1);
        blob.write_u16(0, 1);
        assert_eq!(instruction_len(&blob, 0), 1);
        assert_eq!(instruction_len(&blob, 1), 2);
        assert_eq!(instruction_len(&blob, 3), 3);
    }

    #[test]
    fn test_walk_lands_on_code_length() {
        let mut blob = Blob::new();
        blob.write(Op::Constant as u8, 1);
        blob.write_u16(0, 1);
        blob.write(Op::Echo as u8, 1);
        blob.write(Op::Nil as u8, 2);
        blob.write(Op::Return as u8, 2);
        let mut offset = 0;
        while offset < blob.code.len() {
            offset += instruction_len(&blob, offset);
        }
        assert_eq!(offset, blob.code.len());
    }
}
