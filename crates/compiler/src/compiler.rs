//! Single-pass compiler
//!
//! A precedence-climbing parser that emits bytecode directly into the
//! current function's Blob; there is no AST. Statements and expressions
//! are compiled as they are parsed, forward jumps are patched when their
//! targets resolve, and `break` placeholders are rewritten once the
//! enclosing loop's extent is known.
//!
//! Errors are collected with panic-mode recovery: on the first error in a
//! statement the compiler records it, skips to the next statement
//! boundary, and keeps going so a run surfaces every diagnostic at once.

use crate::imports::resolve_import;
use crate::scanner::Scanner;
use crate::token::{Token, TokenKind};
use ember_core::object::{FunctionKind, GcRef, Obj, ObjFunction, ObjModule};
use ember_core::opcode::{self, Op};
use ember_core::value::Value;
use ember_core::Heap;

const LOCALS_MAX: usize = 256;
const UPVALUES_MAX: usize = 256;
const CONSTANTS_MAX: usize = u16::MAX as usize;
const HANDLERS_MAX: usize = 16;
const ARGS_MAX: usize = 255;

/// Operand of a patched-out instruction that never resolves.
const JUMP_NONE: u16 = u16::MAX;

/// Compile a whole source file into its top-level function. The heap's
/// pause guard covers the entire compile, imports included, so in-progress
/// functions cannot be collected out from under the compiler.
pub fn compile(
    heap: &mut Heap,
    source: &str,
    module: GcRef<ObjModule>,
) -> Result<GcRef<ObjFunction>, String> {
    heap.pause();
    let mut compiling = vec![module.file.clone()];
    let result = compile_unit(heap, source, module, &mut compiling, FunctionKind::Script);
    heap.resume();
    result
}

fn compile_unit(
    heap: &mut Heap,
    source: &str,
    module: GcRef<ObjModule>,
    compiling: &mut Vec<String>,
    kind: FunctionKind,
) -> Result<GcRef<ObjFunction>, String> {
    let compiler = Compiler::new(heap, source, module, compiling);
    compiler.run(kind)
}

// ---- compiler state ----------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment,
    Conditional,
    NilCoalesce,
    Or,
    And,
    Equality,
    Comparison,
    BitOr,
    BitXor,
    BitAnd,
    Shift,
    Range,
    Term,
    Factor,
    Unary,
    Power,
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Conditional,
            Precedence::Conditional => Precedence::NilCoalesce,
            Precedence::NilCoalesce => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::BitOr,
            Precedence::BitOr => Precedence::BitXor,
            Precedence::BitXor => Precedence::BitAnd,
            Precedence::BitAnd => Precedence::Shift,
            Precedence::Shift => Precedence::Range,
            Precedence::Range => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Power,
            Precedence::Power => Precedence::Call,
            Precedence::Call => Precedence::Primary,
            Precedence::Primary => Precedence::Primary,
        }
    }
}

/// Which assignment-like operator followed an assignable target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AssignOp {
    Set,
    Add,
    Subtract,
    Multiply,
    Divide,
    FloorDivide,
    Remainder,
    Pow,
    BitAnd,
    BitOr,
    BitXor,
    LShift,
    RShift,
}

impl AssignOp {
    fn binary_op(self) -> Op {
        match self {
            AssignOp::Set => unreachable!("plain assignment has no binary op"),
            AssignOp::Add => Op::Add,
            AssignOp::Subtract => Op::Subtract,
            AssignOp::Multiply => Op::Multiply,
            AssignOp::Divide => Op::Divide,
            AssignOp::FloorDivide => Op::FloorDivide,
            AssignOp::Remainder => Op::Remainder,
            AssignOp::Pow => Op::Pow,
            AssignOp::BitAnd => Op::BitAnd,
            AssignOp::BitOr => Op::BitOr,
            AssignOp::BitXor => Op::BitXor,
            AssignOp::LShift => Op::LShift,
            AssignOp::RShift => Op::RShift,
        }
    }
}

struct Local {
    name: String,
    /// -1 while declared but not yet initialized.
    depth: i32,
    captured: bool,
}

#[derive(Clone, Copy)]
struct UpvalueRef {
    index: u16,
    is_local: bool,
}

struct LoopCtx {
    /// Where `continue` jumps back to. None while the target is still
    /// ahead of the emission point (do-while), in which case forward
    /// jumps are recorded in `continue_patches` instead.
    continue_target: Option<usize>,
    continue_patches: Vec<usize>,
    /// First byte of loop-owned code; `break` placeholders are only
    /// rewritten inside [region_start, loop end).
    region_start: usize,
    scope_depth: i32,
    /// Live handler count when the loop began; break/continue emit a
    /// PopTry for every handler opened past this mark, so jumping out of
    /// a try body never strands its handler on the frame.
    handler_depth: usize,
}

/// Per-function compiler frame.
struct FuncCompiler {
    function: GcRef<ObjFunction>,
    kind: FunctionKind,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueRef>,
    scope_depth: i32,
    loops: Vec<LoopCtx>,
    handler_depth: usize,
    /// Offset of the most recently emitted opcode, used to recognize a
    /// bare `self` receiver.
    last_op_offset: Option<usize>,
}

struct ClassCtx {
    name: String,
    has_superclass: bool,
    current_method: Option<String>,
}

struct ParserState {
    current: Token,
    previous: Token,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<String>,
}

pub struct Compiler<'a> {
    heap: &'a mut Heap,
    module: GcRef<ObjModule>,
    scanner: Scanner,
    parser: ParserState,
    compilers: Vec<FuncCompiler>,
    classes: Vec<ClassCtx>,
    /// Paths currently being compiled, outermost first; a repeat means a
    /// circular import.
    compiling: &'a mut Vec<String>,
}

impl<'a> Compiler<'a> {
    fn new(
        heap: &'a mut Heap,
        source: &str,
        module: GcRef<ObjModule>,
        compiling: &'a mut Vec<String>,
    ) -> Compiler<'a> {
        Compiler {
            heap,
            module,
            scanner: Scanner::new(source),
            parser: ParserState {
                current: Token::eof(1),
                previous: Token::eof(1),
                had_error: false,
                panic_mode: false,
                errors: Vec::new(),
            },
            compilers: Vec::new(),
            classes: Vec::new(),
            compiling,
        }
    }

    fn run(mut self, kind: FunctionKind) -> Result<GcRef<ObjFunction>, String> {
        let name = match kind {
            FunctionKind::Module => "<module>",
            _ => "<script>",
        };
        self.push_compiler(kind, name);
        self.advance();
        loop {
            self.skip_newlines();
            if self.check(TokenKind::Eof) {
                break;
            }
            self.declaration();
        }
        let (function, _) = self.pop_compiler();
        if self.parser.had_error {
            Err(self.parser.errors.join("\n"))
        } else {
            Ok(function)
        }
    }

    // ---- token plumbing -------------------------------------------------

    fn advance(&mut self) {
        self.parser.previous = std::mem::replace(&mut self.parser.current, Token::eof(0));
        loop {
            let token = self.scanner.scan_token();
            if token.kind == TokenKind::Error {
                let message = token.lexeme.clone();
                self.parser.current = token;
                self.error_at_current(&message);
                if self.check(TokenKind::Eof) {
                    break;
                }
            } else {
                self.parser.current = token;
                break;
            }
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.parser.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.check(kind) {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn skip_newlines(&mut self) {
        while self.check(TokenKind::NewLine) {
            self.advance();
        }
    }

    /// Statements end at a newline, a `;`, or before `}`/EOF.
    fn end_statement(&mut self) {
        if self.check(TokenKind::Eof) || self.check(TokenKind::RBrace) {
            return;
        }
        if self.match_token(TokenKind::NewLine) || self.match_token(TokenKind::Semicolon) {
            while self.match_token(TokenKind::NewLine) || self.match_token(TokenKind::Semicolon) {}
            return;
        }
        self.error_at_current("expected newline or ';' after statement");
    }

    // ---- error reporting ------------------------------------------------

    fn error(&mut self, message: &str) {
        let token = self.parser.previous.clone();
        self.error_at(&token, message);
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.parser.current.clone();
        self.error_at(&token, message);
    }

    fn error_at(&mut self, token: &Token, message: &str) {
        if self.parser.panic_mode {
            return;
        }
        self.parser.panic_mode = true;
        self.parser.had_error = true;
        let location = if token.kind == TokenKind::Eof {
            "at end of file".to_string()
        } else {
            format!("at {}", token.describe())
        };
        self.parser.errors.push(format!(
            "{}:{}: error {}: {}",
            self.module.file, token.line, location, message
        ));
    }

    fn synchronize(&mut self) {
        self.parser.panic_mode = false;
        while !self.check(TokenKind::Eof) {
            if matches!(
                self.parser.previous.kind,
                TokenKind::NewLine | TokenKind::Semicolon
            ) {
                return;
            }
            match self.parser.current.kind {
                TokenKind::Class
                | TokenKind::Def
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::Iter
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Do
                | TokenKind::Echo
                | TokenKind::Return
                | TokenKind::Import
                | TokenKind::Try
                | TokenKind::Using
                | TokenKind::Assert
                | TokenKind::Die
                | TokenKind::Break
                | TokenKind::Continue => return,
                _ => self.advance(),
            }
        }
    }

    // ---- emission helpers -----------------------------------------------

    fn current(&mut self) -> &mut FuncCompiler {
        self.compilers.last_mut().expect("compiler stack is empty")
    }

    fn code_len(&mut self) -> usize {
        self.current().function.blob.code.len()
    }

    fn emit_op(&mut self, op: Op) {
        let line = self.parser.previous.line;
        let fc = self.current();
        fc.last_op_offset = Some(fc.function.blob.code.len());
        fc.function.blob.write(op as u8, line);
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.parser.previous.line;
        self.current().function.blob.write(byte, line);
    }

    fn emit_u16(&mut self, value: u16) {
        let line = self.parser.previous.line;
        self.current().function.blob.write_u16(value, line);
    }

    fn emit_op_u16(&mut self, op: Op, value: u16) {
        self.emit_op(op);
        self.emit_u16(value);
    }

    /// Emit a forward jump; returns the operand offset for patching.
    fn emit_jump(&mut self, op: Op) -> usize {
        self.emit_op(op);
        let operand = self.code_len();
        self.emit_u16(JUMP_NONE);
        operand
    }

    fn patch_jump(&mut self, operand: usize) {
        let target = self.code_len();
        let distance = target - operand - 2;
        if distance > u16::MAX as usize {
            self.error("too much code to jump over");
            return;
        }
        self.current().function.blob.patch_u16(operand, distance as u16);
    }

    fn emit_loop(&mut self, target: usize) {
        self.emit_op(Op::Loop);
        let distance = self.code_len() - target + 2;
        if distance > u16::MAX as usize {
            self.error("loop body too large");
        }
        self.emit_u16(distance as u16);
    }

    fn make_constant(&mut self, value: Value) -> u16 {
        let index = self.current().function.blob.add_constant(value);
        if index > CONSTANTS_MAX {
            self.error("too many constants in one function");
            return 0;
        }
        index as u16
    }

    fn string_constant(&mut self, text: &str) -> u16 {
        let interned = self.heap.intern(text);
        self.make_constant(Value::Obj(Obj::String(interned)))
    }

    fn emit_return(&mut self) {
        if self.current().kind == FunctionKind::Initializer {
            self.emit_op_u16(Op::GetLocal, 0);
        } else {
            self.emit_op(Op::Nil);
        }
        self.emit_op(Op::Return);
    }

    // ---- function frames ------------------------------------------------

    fn push_compiler(&mut self, kind: FunctionKind, name: &str) {
        let function = self.heap.alloc_function(name.to_string(), kind, self.module);
        let slot_zero = match kind {
            FunctionKind::Method | FunctionKind::Initializer => "self",
            _ => "",
        };
        self.compilers.push(FuncCompiler {
            function,
            kind,
            locals: vec![Local {
                name: slot_zero.to_string(),
                depth: 0,
                captured: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
            loops: Vec::new(),
            handler_depth: 0,
            last_op_offset: None,
        });
    }

    fn pop_compiler(&mut self) -> (GcRef<ObjFunction>, Vec<UpvalueRef>) {
        self.emit_return();
        let fc = self.compilers.pop().expect("compiler stack is empty");
        let mut function = fc.function;
        function.upvalue_count = fc.upvalues.len();
        (function, fc.upvalues)
    }

    fn begin_scope(&mut self) {
        self.current().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let fc = self.current();
        fc.scope_depth -= 1;
        let depth = fc.scope_depth;
        while let Some(local) = self.current().locals.last() {
            if local.depth <= depth {
                break;
            }
            let captured = local.captured;
            self.current().locals.pop();
            if captured {
                self.emit_op(Op::CloseUpvalue);
            } else {
                self.emit_op(Op::Pop);
            }
        }
    }

    /// Emit pops for every local deeper than `depth` without forgetting
    /// them; used by break/continue, which jump out of scopes that the
    /// rest of the block still compiles against.
    fn discard_locals(&mut self, depth: i32) {
        let fc = self.current();
        let mut captured_flags = Vec::new();
        for i in (0..fc.locals.len()).rev() {
            if fc.locals[i].depth <= depth {
                break;
            }
            captured_flags.push(fc.locals[i].captured);
        }
        for captured in captured_flags {
            if captured {
                self.emit_op(Op::CloseUpvalue);
            } else {
                self.emit_op(Op::Pop);
            }
        }
    }

    // ---- variables ------------------------------------------------------

    fn declare_local(&mut self, name: &str) {
        let fc = self.current();
        if fc.locals.len() >= LOCALS_MAX {
            self.error("too many local variables in function");
            return;
        }
        let depth = fc.scope_depth;
        for local in fc.locals.iter().rev() {
            if local.depth != -1 && local.depth < depth {
                break;
            }
            if local.name == name {
                self.error("a variable with this name already exists in this scope");
                return;
            }
        }
        self.current().locals.push(Local {
            name: name.to_string(),
            depth: -1,
            captured: false,
        });
    }

    fn mark_initialized(&mut self) {
        let fc = self.current();
        if fc.scope_depth == 0 {
            return;
        }
        let depth = fc.scope_depth;
        if let Some(local) = fc.locals.last_mut() {
            local.depth = depth;
        }
    }

    /// Declare the variable named by the previous token. Returns the name
    /// constant for module-scope definitions, or None for locals.
    fn declare_variable(&mut self) -> Option<u16> {
        let name = self.parser.previous.lexeme.clone();
        if self.current().scope_depth > 0 {
            self.declare_local(&name);
            None
        } else {
            Some(self.string_constant(&name))
        }
    }

    fn define_variable(&mut self, constant: Option<u16>) {
        match constant {
            Some(index) => self.emit_op_u16(Op::DefineGlobal, index),
            None => self.mark_initialized(),
        }
    }

    fn resolve_local_at(&mut self, ci: usize, name: &str) -> Option<u16> {
        for i in (0..self.compilers[ci].locals.len()).rev() {
            if self.compilers[ci].locals[i].name == name {
                if self.compilers[ci].locals[i].depth == -1 {
                    self.error("cannot read a local variable in its own initializer");
                }
                return Some(i as u16);
            }
        }
        None
    }

    fn add_upvalue(&mut self, ci: usize, index: u16, is_local: bool) -> u16 {
        for (i, up) in self.compilers[ci].upvalues.iter().enumerate() {
            if up.index == index && up.is_local == is_local {
                return i as u16;
            }
        }
        if self.compilers[ci].upvalues.len() >= UPVALUES_MAX {
            self.error("too many captured variables in function");
            return 0;
        }
        self.compilers[ci].upvalues.push(UpvalueRef { index, is_local });
        (self.compilers[ci].upvalues.len() - 1) as u16
    }

    fn resolve_upvalue_at(&mut self, ci: usize, name: &str) -> Option<u16> {
        if ci == 0 {
            return None;
        }
        if let Some(local) = self.resolve_local_at(ci - 1, name) {
            self.compilers[ci - 1].locals[local as usize].captured = true;
            return Some(self.add_upvalue(ci, local, true));
        }
        if let Some(upvalue) = self.resolve_upvalue_at(ci - 1, name) {
            return Some(self.add_upvalue(ci, upvalue, false));
        }
        None
    }

    fn match_assign_op(&mut self) -> Option<AssignOp> {
        let op = match self.parser.current.kind {
            TokenKind::Equal => AssignOp::Set,
            TokenKind::PlusEq => AssignOp::Add,
            TokenKind::MinusEq => AssignOp::Subtract,
            TokenKind::StarEq => AssignOp::Multiply,
            TokenKind::SlashEq => AssignOp::Divide,
            TokenKind::SlashSlashEq => AssignOp::FloorDivide,
            TokenKind::PercentEq => AssignOp::Remainder,
            TokenKind::StarStarEq => AssignOp::Pow,
            TokenKind::AmpEq => AssignOp::BitAnd,
            TokenKind::BarEq => AssignOp::BitOr,
            TokenKind::CaretEq => AssignOp::BitXor,
            TokenKind::LShiftEq => AssignOp::LShift,
            TokenKind::RShiftEq => AssignOp::RShift,
            _ => return None,
        };
        self.advance();
        Some(op)
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let top = self.compilers.len() - 1;
        let (get_op, set_op, arg) = if let Some(slot) = self.resolve_local_at(top, name) {
            (Op::GetLocal, Op::SetLocal, slot)
        } else if let Some(slot) = self.resolve_upvalue_at(top, name) {
            (Op::GetUpvalue, Op::SetUpvalue, slot)
        } else {
            let index = self.string_constant(name);
            (Op::GetGlobal, Op::SetGlobal, index)
        };

        if can_assign && let Some(assign) = self.match_assign_op() {
            if assign == AssignOp::Set {
                self.expression();
            } else {
                self.emit_op_u16(get_op, arg);
                self.expression();
                self.emit_op(assign.binary_op());
            }
            self.emit_op_u16(set_op, arg);
            return;
        }
        if can_assign && self.match_token(TokenKind::PlusPlus) {
            self.emit_op_u16(get_op, arg);
            self.emit_op(Op::One);
            self.emit_op(Op::Add);
            self.emit_op_u16(set_op, arg);
            return;
        }
        if can_assign && self.match_token(TokenKind::MinusMinus) {
            self.emit_op_u16(get_op, arg);
            self.emit_op(Op::One);
            self.emit_op(Op::Subtract);
            self.emit_op_u16(set_op, arg);
            return;
        }
        self.emit_op_u16(get_op, arg);
    }

    /// True when the last emitted instruction loads `self` (slot 0 of a
    /// method frame). Used to pick the private-access opcodes.
    fn receiver_is_self(&mut self) -> bool {
        let fc = self.current();
        if !matches!(
            fc.kind,
            FunctionKind::Method | FunctionKind::Initializer
        ) {
            return false;
        }
        let Some(offset) = fc.last_op_offset else {
            return false;
        };
        let blob = &fc.function.blob;
        blob.code[offset] == Op::GetLocal as u8 && blob.read_u16(offset + 1) == 0
    }

    // ---- expressions ----------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let kind = self.parser.previous.kind;
        let can_assign = precedence <= Precedence::Assignment;
        if !self.parse_prefix(kind, can_assign) {
            self.error("expected an expression");
            return;
        }
        while precedence <= Self::precedence_of(self.parser.current.kind) {
            self.advance();
            let kind = self.parser.previous.kind;
            self.parse_infix(kind, can_assign);
        }
        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("invalid assignment target");
        }
    }

    fn precedence_of(kind: TokenKind) -> Precedence {
        match kind {
            TokenKind::LParen | TokenKind::LBracket | TokenKind::Dot => Precedence::Call,
            TokenKind::StarStar => Precedence::Power,
            TokenKind::Star | TokenKind::Slash | TokenKind::SlashSlash | TokenKind::Percent => {
                Precedence::Factor
            }
            TokenKind::Plus | TokenKind::Minus => Precedence::Term,
            TokenKind::DotDot => Precedence::Range,
            TokenKind::LShift | TokenKind::RShift => Precedence::Shift,
            TokenKind::Amp => Precedence::BitAnd,
            TokenKind::Caret => Precedence::BitXor,
            TokenKind::Bar => Precedence::BitOr,
            TokenKind::Greater
            | TokenKind::GreaterEq
            | TokenKind::Less
            | TokenKind::LessEq => Precedence::Comparison,
            TokenKind::EqualEq | TokenKind::BangEq => Precedence::Equality,
            TokenKind::And => Precedence::And,
            TokenKind::Or => Precedence::Or,
            TokenKind::QuestionQuestion => Precedence::NilCoalesce,
            TokenKind::Question => Precedence::Conditional,
            _ => Precedence::None,
        }
    }

    /// Dispatch the prefix rule for `kind`; false when there is none.
    fn parse_prefix(&mut self, kind: TokenKind, can_assign: bool) -> bool {
        match kind {
            TokenKind::LParen => self.grouping(),
            TokenKind::LBrace => self.dict_literal(),
            TokenKind::LBracket => self.list_literal(),
            TokenKind::Minus | TokenKind::Bang | TokenKind::Tilde => self.unary(),
            TokenKind::Number => self.number(),
            TokenKind::String => self.string_literal(),
            TokenKind::Interpolation => self.interpolation(),
            TokenKind::Identifier => {
                let name = self.parser.previous.lexeme.clone();
                self.named_variable(&name, can_assign);
            }
            TokenKind::True => self.emit_op(Op::True),
            TokenKind::False => self.emit_op(Op::False),
            TokenKind::Nil => self.emit_op(Op::Nil),
            TokenKind::SelfKw => self.self_expression(),
            TokenKind::Parent => self.parent_expression(),
            _ => return false,
        }
        true
    }

    fn parse_infix(&mut self, kind: TokenKind, can_assign: bool) {
        match kind {
            TokenKind::LParen => self.call(),
            TokenKind::LBracket => self.index(can_assign),
            TokenKind::Dot => self.dot(can_assign),
            TokenKind::And => self.and_operator(),
            TokenKind::Or => self.or_operator(),
            TokenKind::QuestionQuestion => self.nil_coalesce(),
            TokenKind::Question => self.conditional(),
            _ => self.binary(kind),
        }
    }

    fn grouping(&mut self) {
        self.skip_newlines();
        self.expression();
        self.skip_newlines();
        self.consume(TokenKind::RParen, "expected ')' after expression");
    }

    fn unary(&mut self) {
        let operator = self.parser.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Minus => self.emit_op(Op::Negate),
            TokenKind::Bang => self.emit_op(Op::Not),
            TokenKind::Tilde => self.emit_op(Op::BitNot),
            _ => unreachable!("not a unary operator"),
        }
    }

    fn binary(&mut self, operator: TokenKind) {
        let precedence = Self::precedence_of(operator);
        // `**` is right-associative; everything else binds left.
        let rhs_precedence = if operator == TokenKind::StarStar {
            precedence
        } else {
            precedence.next()
        };
        self.parse_precedence(rhs_precedence);
        match operator {
            TokenKind::Plus => self.emit_op(Op::Add),
            TokenKind::Minus => self.emit_op(Op::Subtract),
            TokenKind::Star => self.emit_op(Op::Multiply),
            TokenKind::Slash => self.emit_op(Op::Divide),
            TokenKind::SlashSlash => self.emit_op(Op::FloorDivide),
            TokenKind::Percent => self.emit_op(Op::Remainder),
            TokenKind::StarStar => self.emit_op(Op::Pow),
            TokenKind::DotDot => self.emit_op(Op::Range),
            TokenKind::Amp => self.emit_op(Op::BitAnd),
            TokenKind::Bar => self.emit_op(Op::BitOr),
            TokenKind::Caret => self.emit_op(Op::BitXor),
            TokenKind::LShift => self.emit_op(Op::LShift),
            TokenKind::RShift => self.emit_op(Op::RShift),
            TokenKind::EqualEq => self.emit_op(Op::Equal),
            TokenKind::BangEq => {
                self.emit_op(Op::Equal);
                self.emit_op(Op::Not);
            }
            TokenKind::Greater => self.emit_op(Op::Greater),
            TokenKind::GreaterEq => {
                self.emit_op(Op::Less);
                self.emit_op(Op::Not);
            }
            TokenKind::Less => self.emit_op(Op::Less),
            TokenKind::LessEq => {
                self.emit_op(Op::Greater);
                self.emit_op(Op::Not);
            }
            _ => self.error("expected an expression"),
        }
    }

    fn and_operator(&mut self) {
        let short_circuit = self.emit_jump(Op::JumpIfFalse);
        self.emit_op(Op::Pop);
        self.parse_precedence(Precedence::And.next());
        self.patch_jump(short_circuit);
    }

    fn or_operator(&mut self) {
        let rhs = self.emit_jump(Op::JumpIfFalse);
        let done = self.emit_jump(Op::Jump);
        self.patch_jump(rhs);
        self.emit_op(Op::Pop);
        self.parse_precedence(Precedence::Or.next());
        self.patch_jump(done);
    }

    fn nil_coalesce(&mut self) {
        // Choice jumps over the fallback when the left side is neither nil
        // nor empty, otherwise pops it and evaluates the fallback.
        let keep = self.emit_jump(Op::Choice);
        self.parse_precedence(Precedence::NilCoalesce.next());
        self.patch_jump(keep);
    }

    fn conditional(&mut self) {
        let otherwise = self.emit_jump(Op::JumpIfFalse);
        self.emit_op(Op::Pop);
        self.expression();
        self.skip_newlines();
        self.consume(TokenKind::Colon, "expected ':' after ternary then-branch");
        let done = self.emit_jump(Op::Jump);
        self.patch_jump(otherwise);
        self.emit_op(Op::Pop);
        self.parse_precedence(Precedence::Conditional);
        self.patch_jump(done);
    }

    fn number(&mut self) {
        let lexeme = self.parser.previous.lexeme.clone();
        let value = parse_number(&lexeme);
        match value {
            Some(n) => {
                let index = self.make_constant(Value::Number(n));
                self.emit_op_u16(Op::Constant, index);
            }
            None => self.error("invalid numeric literal"),
        }
    }

    fn string_literal(&mut self) {
        let raw = self.parser.previous.lexeme.clone();
        match decode_escapes(&raw) {
            Ok(text) => {
                let index = self.string_constant(&text);
                self.emit_op_u16(Op::Constant, index);
            }
            Err(message) => self.error(&message),
        }
    }

    /// Compile an interpolated string. The scanner delivers alternating
    /// raw segments and embedded expressions; each expression is
    /// stringified and the pieces are joined with Add.
    fn interpolation(&mut self) {
        let mut pieces = 0usize;
        loop {
            let raw = self.parser.previous.lexeme.clone();
            match decode_escapes(&raw) {
                Ok(text) => {
                    if !text.is_empty() {
                        let index = self.string_constant(&text);
                        self.emit_op_u16(Op::Constant, index);
                        pieces += 1;
                        if pieces > 1 {
                            self.emit_op(Op::Add);
                        }
                    }
                }
                Err(message) => self.error(&message),
            }
            if self.parser.previous.kind == TokenKind::String {
                break;
            }
            // Embedded expression, then the scanner resumes the string.
            self.expression();
            self.emit_op(Op::Stringify);
            pieces += 1;
            if pieces > 1 {
                self.emit_op(Op::Add);
            }
            if !(self.check(TokenKind::Interpolation) || self.check(TokenKind::String)) {
                self.error_at_current("unterminated string interpolation");
                return;
            }
            self.advance();
        }
        if pieces == 0 {
            // Interpolation of nothing: still a string.
            let index = self.string_constant("");
            self.emit_op_u16(Op::Constant, index);
        }
    }

    fn list_literal(&mut self) {
        let mut count = 0usize;
        self.skip_newlines();
        if !self.check(TokenKind::RBracket) {
            loop {
                self.skip_newlines();
                self.expression();
                count += 1;
                self.skip_newlines();
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
                self.skip_newlines();
                if self.check(TokenKind::RBracket) {
                    break;
                }
            }
        }
        self.skip_newlines();
        self.consume(TokenKind::RBracket, "expected ']' after list items");
        if count > u16::MAX as usize {
            self.error("too many items in list literal");
            return;
        }
        self.emit_op_u16(Op::List, count as u16);
    }

    fn dict_literal(&mut self) {
        let mut count = 0usize;
        self.skip_newlines();
        if !self.check(TokenKind::RBrace) {
            loop {
                self.skip_newlines();
                // Bare identifiers are string keys; anything else is an
                // expression (string, number, ...).
                if self.check(TokenKind::Identifier) {
                    self.advance();
                    let name = self.parser.previous.lexeme.clone();
                    let index = self.string_constant(&name);
                    self.emit_op_u16(Op::Constant, index);
                } else {
                    self.expression();
                }
                self.skip_newlines();
                self.consume(TokenKind::Colon, "expected ':' after dictionary key");
                self.skip_newlines();
                self.expression();
                count += 1;
                self.skip_newlines();
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
                self.skip_newlines();
                if self.check(TokenKind::RBrace) {
                    break;
                }
            }
        }
        self.skip_newlines();
        self.consume(TokenKind::RBrace, "expected '}' after dictionary entries");
        if count > u16::MAX as usize {
            self.error("too many entries in dictionary literal");
            return;
        }
        self.emit_op_u16(Op::Dict, count as u16);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count = 0usize;
        self.skip_newlines();
        if !self.check(TokenKind::RParen) {
            loop {
                self.skip_newlines();
                self.expression();
                count += 1;
                if count > ARGS_MAX {
                    self.error("too many arguments in call");
                }
                self.skip_newlines();
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.skip_newlines();
        self.consume(TokenKind::RParen, "expected ')' after arguments");
        count.min(ARGS_MAX) as u8
    }

    fn call(&mut self) {
        let argc = self.argument_list();
        self.emit_op(Op::Call);
        self.emit_byte(argc);
    }

    fn index(&mut self, can_assign: bool) {
        self.skip_newlines();
        self.expression();
        self.skip_newlines();
        if self.match_token(TokenKind::Comma) {
            self.skip_newlines();
            self.expression();
            self.skip_newlines();
            self.consume(TokenKind::RBracket, "expected ']' after ranged index");
            self.emit_op(Op::GetRangedIndex);
            return;
        }
        self.consume(TokenKind::RBracket, "expected ']' after index");

        if can_assign && let Some(assign) = self.match_assign_op() {
            if assign == AssignOp::Set {
                self.expression();
            } else {
                // Keep receiver and index for the following SetIndex.
                self.emit_op(Op::GetIndex);
                self.emit_byte(1);
                self.expression();
                self.emit_op(assign.binary_op());
            }
            self.emit_op(Op::SetIndex);
            return;
        }
        if can_assign && self.match_token(TokenKind::PlusPlus) {
            self.emit_op(Op::GetIndex);
            self.emit_byte(1);
            self.emit_op(Op::One);
            self.emit_op(Op::Add);
            self.emit_op(Op::SetIndex);
            return;
        }
        if can_assign && self.match_token(TokenKind::MinusMinus) {
            self.emit_op(Op::GetIndex);
            self.emit_byte(1);
            self.emit_op(Op::One);
            self.emit_op(Op::Subtract);
            self.emit_op(Op::SetIndex);
            return;
        }
        self.emit_op(Op::GetIndex);
        self.emit_byte(0);
    }

    fn dot(&mut self, can_assign: bool) {
        let on_self = self.receiver_is_self();
        self.consume(TokenKind::Identifier, "expected property name after '.'");
        let name = self.parser.previous.lexeme.clone();
        let index = self.string_constant(&name);

        if can_assign && let Some(assign) = self.match_assign_op() {
            if assign == AssignOp::Set {
                self.expression();
            } else {
                self.emit_op(Op::Dup);
                if on_self {
                    self.emit_op_u16(Op::GetSelfProperty, index);
                } else {
                    self.emit_op_u16(Op::GetProperty, index);
                }
                self.expression();
                self.emit_op(assign.binary_op());
            }
            self.emit_op_u16(Op::SetProperty, index);
            return;
        }
        if can_assign
            && (self.check(TokenKind::PlusPlus) || self.check(TokenKind::MinusMinus))
        {
            let decrement = self.parser.current.kind == TokenKind::MinusMinus;
            self.advance();
            self.emit_op(Op::Dup);
            if on_self {
                self.emit_op_u16(Op::GetSelfProperty, index);
            } else {
                self.emit_op_u16(Op::GetProperty, index);
            }
            self.emit_op(Op::One);
            self.emit_op(if decrement { Op::Subtract } else { Op::Add });
            self.emit_op_u16(Op::SetProperty, index);
            return;
        }
        if self.match_token(TokenKind::LParen) {
            let argc = self.argument_list();
            if on_self {
                self.emit_op_u16(Op::InvokeSelf, index);
            } else {
                self.emit_op_u16(Op::Invoke, index);
            }
            self.emit_byte(argc);
            return;
        }
        if on_self {
            self.emit_op_u16(Op::GetSelfProperty, index);
        } else {
            self.emit_op_u16(Op::GetProperty, index);
        }
    }

    fn self_expression(&mut self) {
        if self.classes.is_empty() {
            self.error("cannot use 'self' outside of a class");
            return;
        }
        self.named_variable("self", false);
    }

    fn parent_expression(&mut self) {
        let Some(class) = self.classes.last() else {
            self.error("cannot use 'parent' outside of a class");
            return;
        };
        if !class.has_superclass {
            self.error("cannot use 'parent' in a class with no superclass");
            return;
        }
        let current_method = class.current_method.clone();

        if self.match_token(TokenKind::Dot) {
            self.consume(TokenKind::Identifier, "expected method name after 'parent.'");
            let name = self.parser.previous.lexeme.clone();
            let index = self.string_constant(&name);
            self.named_variable("self", false);
            if self.match_token(TokenKind::LParen) {
                let argc = self.argument_list();
                self.named_variable("parent", false);
                if name.starts_with('_') {
                    self.emit_op_u16(Op::SuperInvokeSelf, index);
                } else {
                    self.emit_op_u16(Op::SuperInvoke, index);
                }
                self.emit_byte(argc);
            } else {
                self.named_variable("parent", false);
                self.emit_op_u16(Op::GetSuper, index);
            }
            return;
        }

        // `parent(...)` invokes the superclass method of the same name.
        let Some(method) = current_method else {
            self.error("'parent(...)' is only valid inside a method");
            return;
        };
        self.consume(TokenKind::LParen, "expected '(' or '.' after 'parent'");
        let index = self.string_constant(&method);
        self.named_variable("self", false);
        let argc = self.argument_list();
        self.named_variable("parent", false);
        if method.starts_with('_') {
            self.emit_op_u16(Op::SuperInvokeSelf, index);
        } else {
            self.emit_op_u16(Op::SuperInvoke, index);
        }
        self.emit_byte(argc);
    }

    // ---- statements -----------------------------------------------------

    fn declaration(&mut self) {
        self.skip_newlines();
        if self.check(TokenKind::Eof) || self.check(TokenKind::RBrace) {
            return;
        }
        if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else if self.match_token(TokenKind::Def) {
            self.function_declaration();
        } else if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else {
            self.statement();
        }
        if self.parser.panic_mode {
            self.synchronize();
        }
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::Echo) {
            self.expression();
            self.emit_op(Op::Echo);
            self.end_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::Do) {
            self.do_while_statement();
        } else if self.match_token(TokenKind::Iter) {
            self.iter_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_in_statement();
        } else if self.match_token(TokenKind::Using) {
            self.using_statement();
        } else if self.match_token(TokenKind::Try) {
            self.try_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::Break) {
            self.break_statement();
        } else if self.match_token(TokenKind::Continue) {
            self.continue_statement();
        } else if self.match_token(TokenKind::Import) {
            self.import_statement();
        } else if self.match_token(TokenKind::Assert) {
            self.assert_statement();
        } else if self.match_token(TokenKind::Die) {
            self.expression();
            self.emit_op(Op::Die);
            self.end_statement();
        } else if self.match_token(TokenKind::LBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression();
            self.emit_op(Op::Pop);
            self.end_statement();
        }
    }

    fn block(&mut self) {
        loop {
            self.skip_newlines();
            if self.check(TokenKind::RBrace) || self.check(TokenKind::Eof) {
                break;
            }
            self.declaration();
        }
        self.consume(TokenKind::RBrace, "expected '}' after block");
    }

    fn statement_block(&mut self) {
        self.skip_newlines();
        self.consume(TokenKind::LBrace, "expected '{'");
        self.begin_scope();
        self.block();
        self.end_scope();
    }

    fn body_or_block(&mut self) {
        self.skip_newlines();
        if self.check(TokenKind::LBrace) {
            self.statement_block();
        } else {
            self.statement();
        }
    }

    fn var_declaration(&mut self) {
        loop {
            self.consume(TokenKind::Identifier, "expected variable name");
            let constant = self.declare_variable();
            if self.match_token(TokenKind::Equal) {
                self.expression();
            } else {
                self.emit_op(Op::Nil);
            }
            self.define_variable(constant);
            if !self.match_token(TokenKind::Comma) {
                break;
            }
        }
        self.end_statement();
    }

    fn function_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "expected function name");
        let name = self.parser.previous.lexeme.clone();
        let constant = self.declare_variable();
        // Functions may refer to themselves; the name is live before the
        // body compiles.
        self.mark_initialized();
        self.function_body(FunctionKind::Function, &name);
        self.define_variable(constant);
    }

    fn function_body(&mut self, kind: FunctionKind, name: &str) {
        self.push_compiler(kind, name);
        self.begin_scope();
        self.consume(TokenKind::LParen, "expected '(' after function name");
        if !self.check(TokenKind::RParen) {
            loop {
                self.skip_newlines();
                if self.match_token(TokenKind::TripleDot) {
                    self.current().function.is_variadic = true;
                    self.declare_local("__args__");
                    self.mark_initialized();
                    self.current().function.arity += 1;
                    break;
                }
                self.consume(TokenKind::Identifier, "expected parameter name");
                let param = self.parser.previous.lexeme.clone();
                self.declare_local(&param);
                self.mark_initialized();
                self.current().function.arity += 1;
                if self.current().function.arity > ARGS_MAX {
                    self.error("too many parameters");
                }
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.skip_newlines();
        self.consume(TokenKind::RParen, "expected ')' after parameters");
        self.skip_newlines();
        self.consume(TokenKind::LBrace, "expected '{' before function body");
        self.block();
        let (function, upvalues) = self.pop_compiler();
        let index = self.make_constant(Value::Obj(Obj::Function(function)));
        self.emit_op_u16(Op::Closure, index);
        for upvalue in upvalues {
            self.emit_byte(if upvalue.is_local { 1 } else { 0 });
            self.emit_u16(upvalue.index);
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "expected class name");
        let name = self.parser.previous.lexeme.clone();
        let name_constant = self.string_constant(&name);
        let variable = self.declare_variable();
        self.emit_op_u16(Op::Class, name_constant);
        self.define_variable(variable);

        self.classes.push(ClassCtx {
            name: name.clone(),
            has_superclass: false,
            current_method: None,
        });

        let mut has_superclass = false;
        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "expected superclass name");
            let super_name = self.parser.previous.lexeme.clone();
            if super_name == name {
                self.error("a class cannot inherit from itself");
            }
            self.named_variable(&super_name, false);
            self.begin_scope();
            self.declare_local("parent");
            self.mark_initialized();
            self.named_variable(&name, false);
            self.emit_op(Op::Inherit);
            has_superclass = true;
            self.classes.last_mut().expect("class context").has_superclass = true;
        }

        self.named_variable(&name, false);
        self.skip_newlines();
        self.consume(TokenKind::LBrace, "expected '{' before class body");
        loop {
            self.skip_newlines();
            if self.check(TokenKind::RBrace) || self.check(TokenKind::Eof) {
                break;
            }
            let is_static = self.match_token(TokenKind::Static);
            if self.match_token(TokenKind::Var) {
                self.class_field(is_static);
            } else {
                self.class_method(&name, is_static);
            }
        }
        self.consume(TokenKind::RBrace, "expected '}' after class body");
        self.emit_op(Op::Pop);
        if has_superclass {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn class_field(&mut self, is_static: bool) {
        self.consume(TokenKind::Identifier, "expected field name");
        let name = self.parser.previous.lexeme.clone();
        let index = self.string_constant(&name);
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(Op::Nil);
        }
        self.emit_op_u16(Op::ClassProperty, index);
        self.emit_byte(if is_static { 1 } else { 0 });
        self.end_statement();
    }

    fn class_method(&mut self, class_name: &str, is_static: bool) {
        self.consume(TokenKind::Identifier, "expected method name");
        let name = self.parser.previous.lexeme.clone();
        let index = self.string_constant(&name);
        let kind = if name == class_name {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        if let Some(class) = self.classes.last_mut() {
            class.current_method = Some(name.clone());
        }
        self.function_body(kind, &name);
        if let Some(class) = self.classes.last_mut() {
            class.current_method = None;
        }
        self.emit_op_u16(Op::Method, index);
        self.emit_byte(if is_static { 1 } else { 0 });
        self.skip_newlines();
    }

    fn if_statement(&mut self) {
        self.expression();
        let otherwise = self.emit_jump(Op::JumpIfFalse);
        self.emit_op(Op::Pop);
        self.statement_block();
        let done = self.emit_jump(Op::Jump);
        self.patch_jump(otherwise);
        self.emit_op(Op::Pop);
        self.skip_newlines();
        if self.match_token(TokenKind::Else) {
            if self.match_token(TokenKind::If) {
                self.if_statement();
            } else {
                self.statement_block();
            }
        }
        self.patch_jump(done);
    }

    fn begin_loop(&mut self, continue_target: Option<usize>, region_start: usize) {
        let depth = self.current().scope_depth;
        let handler_depth = self.current().handler_depth;
        self.current().loops.push(LoopCtx {
            continue_target,
            continue_patches: Vec::new(),
            region_start,
            scope_depth: depth,
            handler_depth,
        });
    }

    /// Rewrite every break placeholder inside the finished loop's byte
    /// range into a forward jump to the loop exit. The walk is
    /// instruction-aligned, so operand bytes are never misread, and nested
    /// function bodies live in their own blobs and are never visited.
    fn end_loop(&mut self) {
        let ctx = self.current().loops.pop().expect("loop context");
        let exit = self.code_len();
        let fc = self.current();
        let blob = &mut fc.function.blob;
        let mut offset = ctx.region_start;
        while offset < exit {
            let length = opcode::instruction_len(blob, offset);
            if blob.code[offset] == Op::BreakPlaceholder as u8 {
                blob.code[offset] = Op::Jump as u8;
                let distance = (exit - offset - 3) as u16;
                blob.patch_u16(offset + 1, distance);
            }
            offset += length;
        }
    }

    fn while_statement(&mut self) {
        let loop_start = self.code_len();
        self.expression();
        let exit = self.emit_jump(Op::JumpIfFalse);
        self.emit_op(Op::Pop);
        let region_start = self.code_len();
        self.begin_loop(Some(loop_start), region_start);
        self.body_or_block();
        self.emit_loop(loop_start);
        self.patch_jump(exit);
        self.emit_op(Op::Pop);
        self.end_loop();
    }

    fn do_while_statement(&mut self) {
        let body_start = self.code_len();
        // The condition sits after the body, so `continue` jumps forward;
        // its patches resolve once the condition's address is known.
        self.begin_loop(None, body_start);
        self.statement_block();
        self.skip_newlines();
        self.consume(TokenKind::While, "expected 'while' after do body");
        // Pending continues land here, on the condition.
        let pending = std::mem::take(
            &mut self
                .current()
                .loops
                .last_mut()
                .expect("loop context")
                .continue_patches,
        );
        for operand in pending {
            self.patch_jump(operand);
        }
        self.expression();
        let exit = self.emit_jump(Op::JumpIfFalse);
        self.emit_op(Op::Pop);
        self.emit_loop(body_start);
        self.patch_jump(exit);
        self.emit_op(Op::Pop);
        self.end_loop();
        self.end_statement();
    }

    fn iter_statement(&mut self) {
        self.begin_scope();
        // init; cond; post { body }
        if !self.match_token(TokenKind::Semicolon) {
            if self.match_token(TokenKind::Var) {
                // Inline variable declaration without a statement
                // terminator; the `;` below is the separator.
                loop {
                    self.consume(TokenKind::Identifier, "expected variable name");
                    let constant = self.declare_variable();
                    if self.match_token(TokenKind::Equal) {
                        self.expression();
                    } else {
                        self.emit_op(Op::Nil);
                    }
                    self.define_variable(constant);
                    if !self.match_token(TokenKind::Comma) {
                        break;
                    }
                }
            } else {
                self.expression();
                self.emit_op(Op::Pop);
            }
            self.consume(TokenKind::Semicolon, "expected ';' after iter initializer");
        }

        let condition_start = self.code_len();
        let mut exit = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "expected ';' after iter condition");
            exit = Some(self.emit_jump(Op::JumpIfFalse));
            self.emit_op(Op::Pop);
        }

        let mut continue_target = condition_start;
        let region_start;
        if self.check(TokenKind::LBrace) {
            region_start = self.code_len();
        } else {
            // Jump over the post-expression into the body; the post runs
            // at the end of each round.
            let to_body = self.emit_jump(Op::Jump);
            let post_start = self.code_len();
            self.expression();
            self.emit_op(Op::Pop);
            self.emit_loop(condition_start);
            self.patch_jump(to_body);
            continue_target = post_start;
            region_start = post_start;
        }

        self.begin_loop(Some(continue_target), region_start);
        self.statement_block();
        self.emit_loop(continue_target);
        if let Some(exit) = exit {
            self.patch_jump(exit);
            self.emit_op(Op::Pop);
        }
        self.end_loop();
        self.end_scope();
    }

    /// `for x in expr` / `for k, v in expr` desugars onto the iterator
    /// protocol: `@itern` advances the key, `@iter` reads the value.
    fn for_in_statement(&mut self) {
        self.begin_scope();

        self.consume(TokenKind::Identifier, "expected loop variable name");
        let first = self.parser.previous.lexeme.clone();
        let mut value_name = first.clone();
        let mut key_name: Option<String> = None;
        if self.match_token(TokenKind::Comma) {
            self.consume(TokenKind::Identifier, "expected value variable name");
            key_name = Some(first);
            value_name = self.parser.previous.lexeme.clone();
        }
        self.consume(TokenKind::In, "expected 'in' after loop variables");

        // Hidden iterable local.
        self.expression();
        self.declare_local("@it");
        self.mark_initialized();
        let iterable_slot = (self.current().locals.len() - 1) as u16;

        // Key local: user-visible in the two-variable form.
        self.emit_op(Op::Nil);
        let key_local = key_name.unwrap_or_else(|| "@key".to_string());
        self.declare_local(&key_local);
        self.mark_initialized();
        let key_slot = (self.current().locals.len() - 1) as u16;

        // Value local.
        self.emit_op(Op::Nil);
        self.declare_local(&value_name);
        self.mark_initialized();
        let value_slot = (self.current().locals.len() - 1) as u16;

        let itern_constant = self.string_constant("@itern");
        let iter_constant = self.string_constant("@iter");

        let loop_start = self.code_len();
        // key = iterable.@itern(key)
        self.emit_op_u16(Op::GetLocal, iterable_slot);
        self.emit_op_u16(Op::GetLocal, key_slot);
        self.emit_op_u16(Op::Invoke, itern_constant);
        self.emit_byte(1);
        self.emit_op_u16(Op::SetLocal, key_slot);
        // while key != nil
        self.emit_op(Op::Nil);
        self.emit_op(Op::Equal);
        self.emit_op(Op::Not);
        let exit = self.emit_jump(Op::JumpIfFalse);
        self.emit_op(Op::Pop);
        // value = iterable.@iter(key)
        self.emit_op_u16(Op::GetLocal, iterable_slot);
        self.emit_op_u16(Op::GetLocal, key_slot);
        self.emit_op_u16(Op::Invoke, iter_constant);
        self.emit_byte(1);
        self.emit_op_u16(Op::SetLocal, value_slot);
        self.emit_op(Op::Pop);

        let region_start = self.code_len();
        self.begin_loop(Some(loop_start), region_start);
        self.statement_block();
        self.emit_loop(loop_start);
        self.patch_jump(exit);
        self.emit_op(Op::Pop);
        self.end_loop();
        self.end_scope();
    }

    fn using_statement(&mut self) {
        self.expression();
        let switch = self.heap.alloc_switch();
        let switch_constant = self.make_constant(Value::Obj(Obj::Switch(switch)));
        self.emit_op_u16(Op::Switch, switch_constant);
        let dispatch_end = self.code_len();

        self.skip_newlines();
        self.consume(TokenKind::LBrace, "expected '{' after using expression");
        let mut exits: Vec<usize> = Vec::new();
        let mut saw_default = false;
        let mut switch = switch;
        loop {
            self.skip_newlines();
            if self.check(TokenKind::RBrace) || self.check(TokenKind::Eof) {
                break;
            }
            if self.match_token(TokenKind::When) {
                if saw_default {
                    self.error("'when' cannot follow 'default'");
                }
                let target = (self.code_len() - dispatch_end) as u32;
                loop {
                    match self.case_value() {
                        Some(value) => {
                            switch.table.set(value, Value::Number(target as f64));
                        }
                        None => {
                            self.error_at_current(
                                "'when' values must be constant literals",
                            );
                            self.advance();
                        }
                    }
                    if !self.match_token(TokenKind::Comma) {
                        break;
                    }
                }
                self.statement_block();
                exits.push(self.emit_jump(Op::Jump));
            } else if self.match_token(TokenKind::Default) {
                saw_default = true;
                switch.default_jump = Some((self.code_len() - dispatch_end) as u32);
                self.statement_block();
                exits.push(self.emit_jump(Op::Jump));
            } else {
                self.error_at_current("expected 'when' or 'default' in using block");
                self.advance();
            }
        }
        self.consume(TokenKind::RBrace, "expected '}' after using block");
        for exit in exits {
            self.patch_jump(exit);
        }
        switch.exit_jump = (self.code_len() - dispatch_end) as u32;
    }

    /// A literal `when` value: bool, string, or number. Anything else is
    /// rejected at compile time.
    fn case_value(&mut self) -> Option<Value> {
        if self.match_token(TokenKind::True) {
            return Some(Value::Bool(true));
        }
        if self.match_token(TokenKind::False) {
            return Some(Value::Bool(false));
        }
        if self.match_token(TokenKind::Nil) {
            return Some(Value::Nil);
        }
        if self.match_token(TokenKind::Number) {
            let lexeme = self.parser.previous.lexeme.clone();
            return parse_number(&lexeme).map(Value::Number);
        }
        if self.match_token(TokenKind::Minus) && self.match_token(TokenKind::Number) {
            let lexeme = self.parser.previous.lexeme.clone();
            return parse_number(&lexeme).map(|n| Value::Number(-n));
        }
        if self.match_token(TokenKind::String) {
            let raw = self.parser.previous.lexeme.clone();
            let text = match decode_escapes(&raw) {
                Ok(text) => text,
                Err(message) => {
                    self.error(&message);
                    return Some(Value::Nil);
                }
            };
            let interned = self.heap.intern(&text);
            return Some(Value::Obj(Obj::String(interned)));
        }
        None
    }

    fn try_statement(&mut self) {
        self.current().handler_depth += 1;
        if self.current().handler_depth > HANDLERS_MAX {
            self.error("too many nested exception handlers");
        }

        self.emit_op(Op::Try);
        let type_operand = self.code_len();
        self.emit_u16(JUMP_NONE);
        let catch_operand = self.code_len();
        self.emit_u16(JUMP_NONE);
        let finally_operand = self.code_len();
        self.emit_u16(JUMP_NONE);

        self.statement_block();
        self.emit_op(Op::PopTry);
        // The handler is live only inside the try body: on the normal path
        // the PopTry above removes it, and on the exception path
        // propagation consumes it before entering the catch or finally, so
        // jumps out of those bodies must not pop it again.
        self.current().handler_depth -= 1;
        let after_body = self.emit_jump(Op::Jump);

        let mut has_catch = false;
        let mut has_finally = false;

        self.skip_newlines();
        if self.match_token(TokenKind::Catch) {
            has_catch = true;
            self.consume(TokenKind::Identifier, "expected exception class name");
            let class_name = self.parser.previous.lexeme.clone();
            let type_constant = self.string_constant(&class_name);
            let catch_addr = self.code_len();
            {
                let fc = self.current();
                fc.function.blob.patch_u16(type_operand, type_constant);
                fc.function.blob.patch_u16(catch_operand, catch_addr as u16);
            }
            // The VM pushes the exception instance right where the next
            // local slot sits.
            self.begin_scope();
            if self.match_token(TokenKind::As) {
                self.consume(TokenKind::Identifier, "expected exception variable name");
                let name = self.parser.previous.lexeme.clone();
                self.declare_local(&name);
                self.mark_initialized();
            } else {
                self.emit_op(Op::Pop);
            }
            self.skip_newlines();
            self.consume(TokenKind::LBrace, "expected '{' after catch clause");
            self.block();
            self.end_scope();
        }

        self.patch_jump(after_body);
        self.skip_newlines();
        if self.match_token(TokenKind::Finally) {
            has_finally = true;
            // Normal completion reaches the finally body with a nil
            // exception slot and a false re-propagation sentinel.
            self.emit_op(Op::Nil);
            self.emit_op(Op::False);
            let finally_addr = self.code_len();
            self.current()
                .function
                .blob
                .patch_u16(finally_operand, finally_addr as u16);
            self.statement_block();
            self.emit_op(Op::PublishTry);
        }

        if !has_catch && !has_finally {
            self.error("try must declare at least one of catch or finally");
        }
    }

    fn return_statement(&mut self) {
        if matches!(
            self.current().kind,
            FunctionKind::Script | FunctionKind::Module
        ) {
            self.error("cannot return from top-level code");
        }
        if self.check(TokenKind::NewLine)
            || self.check(TokenKind::Semicolon)
            || self.check(TokenKind::RBrace)
            || self.check(TokenKind::Eof)
        {
            self.emit_return();
            self.end_statement();
            return;
        }
        if self.current().kind == FunctionKind::Initializer {
            self.error("cannot return a value from an initializer");
        }
        self.expression();
        self.emit_op(Op::Return);
        self.end_statement();
    }

    /// Unwind a `break`/`continue` jump's runtime state: pop every try
    /// handler opened inside the loop, then discard the loop-inner locals.
    fn discard_loop_state(&mut self) {
        let ctx = self.current().loops.last().expect("loop context");
        let depth = ctx.scope_depth;
        let handler_floor = ctx.handler_depth;
        let live_handlers = self.current().handler_depth;
        for _ in handler_floor..live_handlers {
            self.emit_op(Op::PopTry);
        }
        self.discard_locals(depth);
    }

    fn break_statement(&mut self) {
        if self.current().loops.is_empty() {
            self.error("cannot use 'break' outside of a loop");
            self.end_statement();
            return;
        }
        self.discard_loop_state();
        self.emit_op(Op::BreakPlaceholder);
        self.emit_u16(JUMP_NONE);
        self.end_statement();
    }

    fn continue_statement(&mut self) {
        if self.current().loops.is_empty() {
            self.error("cannot use 'continue' outside of a loop");
            self.end_statement();
            return;
        }
        let target = self.current().loops.last().expect("loop context").continue_target;
        self.discard_loop_state();
        match target {
            Some(target) => self.emit_loop(target),
            None => {
                let operand = self.emit_jump(Op::Jump);
                self.current()
                    .loops
                    .last_mut()
                    .expect("loop context")
                    .continue_patches
                    .push(operand);
            }
        }
        self.end_statement();
    }

    fn assert_statement(&mut self) {
        self.expression();
        if self.match_token(TokenKind::Comma) {
            self.expression();
        } else {
            self.emit_op(Op::Nil);
        }
        self.emit_op(Op::Assert);
        self.end_statement();
    }

    // ---- imports --------------------------------------------------------

    fn import_statement(&mut self) {
        // Leading dots select a relative import: `.` for the importing
        // file's directory, each further `..` ascends one level.
        let mut relative = 0usize;
        loop {
            if self.match_token(TokenKind::Dot) {
                relative += 1;
            } else if self.match_token(TokenKind::DotDot) {
                relative += 2;
            } else {
                break;
            }
        }

        let mut parts: Vec<String> = Vec::new();
        self.consume(TokenKind::Identifier, "expected module name");
        parts.push(self.parser.previous.lexeme.clone());
        while self.match_token(TokenKind::Dot) {
            self.consume(TokenKind::Identifier, "expected module path segment");
            parts.push(self.parser.previous.lexeme.clone());
        }

        let mut alias: Option<String> = None;
        if self.match_token(TokenKind::As) {
            self.consume(TokenKind::Identifier, "expected alias name");
            alias = Some(self.parser.previous.lexeme.clone());
        }

        // Selection list: `{ a, b }` or `{ * }`.
        let mut selections: Vec<String> = Vec::new();
        let mut select_all = false;
        if self.match_token(TokenKind::LBrace) {
            self.skip_newlines();
            if self.match_token(TokenKind::Star) {
                select_all = true;
            } else {
                loop {
                    self.skip_newlines();
                    self.consume(TokenKind::Identifier, "expected imported name");
                    selections.push(self.parser.previous.lexeme.clone());
                    self.skip_newlines();
                    if !self.match_token(TokenKind::Comma) {
                        break;
                    }
                }
            }
            self.skip_newlines();
            self.consume(TokenKind::RBrace, "expected '}' after import selection");
        }

        let is_native = parts[0].starts_with('_');
        if is_native {
            let registry_name = parts.join(".");
            let name_constant = self.string_constant(&registry_name);
            self.emit_op_u16(Op::NativeModule, name_constant);
            if let Some(alias) = &alias {
                self.emit_op_u16(Op::EjectNativeImport, name_constant);
                self.emit_op(Op::Dup);
                let alias_constant = self.string_constant(alias);
                self.emit_op_u16(Op::DefineGlobal, alias_constant);
            }
            if select_all {
                self.emit_op(Op::ImportAllNative);
                let bound = alias.as_deref().unwrap_or(&registry_name);
                let bound_constant = self.string_constant(bound);
                self.emit_op_u16(Op::EjectNativeImport, bound_constant);
            } else if !selections.is_empty() {
                for name in &selections {
                    let constant = self.string_constant(name);
                    self.emit_op_u16(Op::SelectNativeImport, constant);
                }
                let bound = alias.as_deref().unwrap_or(&registry_name);
                let bound_constant = self.string_constant(bound);
                self.emit_op_u16(Op::EjectNativeImport, bound_constant);
            }
            self.emit_op(Op::Pop);
            self.end_statement();
            return;
        }

        let bind_name = alias.clone().unwrap_or_else(|| {
            parts.last().expect("at least one segment").clone()
        });

        let importer = self.module.file.clone();
        let resolved = match resolve_import(&importer, &parts, relative) {
            Ok(path) => path,
            Err(message) => {
                self.error(&message);
                self.end_statement();
                return;
            }
        };

        if self.compiling.iter().any(|p| p == &resolved) {
            self.error(&format!("circular import of '{}'", parts.join(".")));
            self.end_statement();
            return;
        }

        let source = match std::fs::read_to_string(&resolved) {
            Ok(source) => source,
            Err(err) => {
                self.error(&format!("could not read module '{}': {}", resolved, err));
                self.end_statement();
                return;
            }
        };

        let imported_module = self.heap.alloc_module(bind_name.clone(), resolved.clone());
        self.compiling.push(resolved);
        let compiled = compile_unit(
            self.heap,
            &source,
            imported_module,
            self.compiling,
            FunctionKind::Module,
        );
        self.compiling.pop();

        let function = match compiled {
            Ok(function) => function,
            Err(message) => {
                self.error(&format!(
                    "failed to compile module '{}':\n{}",
                    parts.join("."),
                    message
                ));
                self.end_statement();
                return;
            }
        };

        let constant = self.make_constant(Value::Obj(Obj::Function(function)));
        self.emit_op_u16(Op::CallImport, constant);

        let bound_constant = self.string_constant(&bind_name);
        if select_all {
            self.emit_op(Op::ImportAll);
            self.emit_op_u16(Op::EjectImport, bound_constant);
        } else if !selections.is_empty() {
            for name in &selections {
                let name_constant = self.string_constant(name);
                self.emit_op_u16(Op::SelectImport, name_constant);
            }
            self.emit_op_u16(Op::EjectImport, bound_constant);
        }
        self.emit_op(Op::Pop);
        self.end_statement();
    }
}

// ---- literal helpers ---------------------------------------------------

/// Parse a numeric literal: decimal with optional fraction/exponent, or
/// `0b`/`0c`/`0x` radix forms.
pub fn parse_number(lexeme: &str) -> Option<f64> {
    let bytes = lexeme.as_bytes();
    if bytes.len() > 2 && bytes[0] == b'0' {
        let radix = match bytes[1] {
            b'b' | b'B' => Some(2),
            b'c' | b'C' => Some(8),
            b'x' | b'X' => Some(16),
            _ => None,
        };
        if let Some(radix) = radix {
            return i64::from_str_radix(&lexeme[2..], radix)
                .ok()
                .map(|n| n as f64);
        }
    }
    lexeme.parse::<f64>().ok()
}

/// Decode the escape sequences of a raw string segment.
pub fn decode_escapes(raw: &str) -> Result<String, String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let Some(escape) = chars.next() else {
            return Err("incomplete escape sequence".to_string());
        };
        match escape {
            '0' => out.push('\0'),
            '\'' => out.push('\''),
            '"' => out.push('"'),
            'a' => out.push('\x07'),
            'b' => out.push('\x08'),
            'f' => out.push('\x0c'),
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            't' => out.push('\t'),
            'v' => out.push('\x0b'),
            '\\' => out.push('\\'),
            '$' => out.push('$'),
            'x' => out.push(hex_escape(&mut chars, 2)?),
            'u' => out.push(hex_escape(&mut chars, 4)?),
            'U' => out.push(hex_escape(&mut chars, 8)?),
            other => return Err(format!("invalid escape sequence '\\{}'", other)),
        }
    }
    Ok(out)
}

fn hex_escape(chars: &mut std::str::Chars<'_>, digits: usize) -> Result<char, String> {
    let mut value: u32 = 0;
    for _ in 0..digits {
        let Some(c) = chars.next() else {
            return Err("incomplete hexadecimal escape".to_string());
        };
        let digit = c
            .to_digit(16)
            .ok_or_else(|| format!("invalid hexadecimal digit '{}' in escape", c))?;
        value = value * 16 + digit;
    }
    char::from_u32(value).ok_or_else(|| format!("invalid codepoint U+{:X} in escape", value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_number_radixes() {
        assert_eq!(parse_number("42"), Some(42.0));
        assert_eq!(parse_number("0b101"), Some(5.0));
        assert_eq!(parse_number("0c17"), Some(15.0));
        assert_eq!(parse_number("0xff"), Some(255.0));
        assert_eq!(parse_number("1.5e3"), Some(1500.0));
        assert_eq!(parse_number("0x"), None);
    }

    #[test]
    fn test_decode_simple_escapes() {
        assert_eq!(decode_escapes(r"a\nb\tc").unwrap(), "a\nb\tc");
        assert_eq!(decode_escapes(r"\\").unwrap(), "\\");
        assert_eq!(decode_escapes(r"\$").unwrap(), "$");
        assert_eq!(decode_escapes(r"\0").unwrap(), "\0");
        assert_eq!(decode_escapes(r"\a\b\f\v").unwrap(), "\x07\x08\x0c\x0b");
    }

    #[test]
    fn test_decode_hex_escapes() {
        assert_eq!(decode_escapes(r"\x41").unwrap(), "A");
        assert_eq!(decode_escapes(r"é").unwrap(), "é");
        assert_eq!(decode_escapes(r"\U0001F600").unwrap(), "😀");
    }

    #[test]
    fn test_decode_invalid_escape() {
        assert!(decode_escapes(r"\q").is_err());
        assert!(decode_escapes(r"\x4").is_err());
        assert!(decode_escapes(r"\uD800").is_err());
    }

    fn compile_source(source: &str) -> Result<GcRef<ObjFunction>, String> {
        let mut heap = Heap::new();
        let module = heap.alloc_module("".to_string(), "<test>".to_string());
        compile(&mut heap, source, module)
    }

    #[test]
    fn test_compile_expression_statement() {
        assert!(compile_source("1 + 2 * 3\n").is_ok());
    }

    #[test]
    fn test_compile_echo_and_var() {
        assert!(compile_source("var a = 1\necho a + 2\n").is_ok());
    }

    #[test]
    fn test_compile_function_and_call() {
        let source = "def add(a, b) { return a + b }\necho add(1, 2)\n";
        assert!(compile_source(source).is_ok());
    }

    #[test]
    fn test_compile_class_with_inheritance() {
        let source = "class A { f() { return 1 } }\nclass B < A { f() { return parent.f() + 1 } }\necho B().f()\n";
        assert!(compile_source(source).is_ok());
    }

    #[test]
    fn test_compile_try_catch_finally() {
        let source =
            "try { die Exception(\"x\") } catch Exception as e { echo e.message } finally { echo \"f\" }\n";
        assert!(compile_source(source).is_ok());
    }

    #[test]
    fn test_try_requires_catch_or_finally() {
        assert!(compile_source("try { echo 1 }\n").is_err());
    }

    #[test]
    fn test_self_inheritance_is_an_error() {
        assert!(compile_source("class A < A {}\n").is_err());
    }

    #[test]
    fn test_uninitialized_local_read_is_an_error() {
        assert!(compile_source("def f() { var a = a }\n").is_err());
    }

    #[test]
    fn test_duplicate_local_is_an_error() {
        assert!(compile_source("def f() { var a = 1\nvar a = 2 }\n").is_err());
    }

    #[test]
    fn test_break_outside_loop_is_an_error() {
        assert!(compile_source("break\n").is_err());
    }

    #[test]
    fn test_when_requires_constant_values() {
        assert!(compile_source("using 1 { when 1 + 1 { echo 1 } }\n").is_err());
        assert!(compile_source("using 1 { when 2 { echo 1 } default { echo 2 } }\n").is_ok());
    }

    #[test]
    fn test_multiple_errors_are_collected() {
        let err = compile_source("var 1 = 2\nbreak\n").unwrap_err();
        assert!(err.lines().count() >= 2, "expected several errors:\n{}", err);
    }

    #[test]
    fn test_break_rewrite_stays_in_loop_region() {
        // A loop whose body closes over a nested function that contains
        // its own loop and break; the outer rewrite must not descend.
        let source = "while true { def inner() { while true { break } }\nbreak }\n";
        let function = compile_source(source).unwrap();
        // Walking the outer blob must land exactly on the code length.
        let blob = &function.blob;
        let mut offset = 0;
        let mut leftover_placeholders = 0;
        while offset < blob.code.len() {
            if blob.code[offset] == Op::BreakPlaceholder as u8 {
                leftover_placeholders += 1;
            }
            offset += ember_core::opcode::instruction_len(blob, offset);
        }
        assert_eq!(offset, blob.code.len());
        assert_eq!(leftover_placeholders, 0);
    }
}
