//! The bytecode virtual machine
//!
//! A fetch-decode-execute loop over a fixed-size value stack and a
//! fixed-size call-frame stack. Each frame owns its instruction pointer,
//! a closure, a base slot into the value stack, and its exception-handler
//! stack.
//!
//! Collections run at instruction boundaries: the loop checks the heap's
//! threshold before each fetch, at which point every live value is
//! reachable from the VM roots. Allocation inside an instruction never
//! collects, so transient objects built mid-instruction are safe without
//! extra bookkeeping; natives keep longer-lived transients reachable
//! through the heap's protection stack, which the VM rebalances after
//! every native call.

use crate::exceptions::{Handler, Raised};
use crate::modules::NativeModuleDef;
use ember_core::object::{
    FunctionKind, GcRef, NativeKind, Obj, ObjClass, ObjClosure, ObjFunction, ObjModule,
    ObjNative, ObjString, ObjSwitch, ObjUpvalue, UpvalueState,
};
use ember_core::opcode::{self, Op};
use ember_core::table::Table;
use ember_core::value::{format_number, Value};
use ember_core::Heap;
use std::collections::HashMap;
use std::io::Write;

pub const STACK_MAX: usize = 1024;
pub const FRAMES_MAX: usize = 512;
pub const HANDLERS_MAX: usize = 16;

/// Sentinel operand meaning "no address" in Try instructions.
pub const ADDR_NONE: u16 = u16::MAX;

/// Native callable signature. `args[0]` is the receiver for method-kind
/// natives; plain functions see only their arguments. Returning
/// `Err(Raised)` means the native has already raised through the VM.
pub type NativeFn = fn(&mut Vm, &[Value]) -> Result<Value, Raised>;

/// Module preload/unload hook.
pub type ModuleHookFn = fn(&mut Vm);

/// Getter for a native module field.
pub type FieldGetFn = fn(&mut Vm) -> Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretResult {
    Ok,
    CompileError,
    RuntimeError,
    /// Unrecoverable fault: out-of-memory or an internal invariant
    /// violation. Maps to exit code 12.
    Fatal,
}

enum Flow {
    Continue,
    Halt,
}

pub struct CallFrame {
    pub closure: GcRef<ObjClosure>,
    pub ip: usize,
    pub base: usize,
    pub handlers: Vec<Handler>,
}

/// Where `echo`/`print` go. A buffer in tests, stdout otherwise.
pub enum Output {
    Standard { flush_lines: bool },
    Buffer(Vec<u8>),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VmOptions {
    pub trace: bool,
    pub dump: bool,
    pub buffered: bool,
    /// Initial collection threshold in bytes.
    pub min_heap: Option<usize>,
}

pub struct Vm {
    pub heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    pub globals: Table,
    /// Source path (or native module name) to Module; the import cache
    /// and the single source of truth for module identity.
    pub modules: Table,
    /// Open upvalues sorted by stack slot, descending.
    open_upvalues: Vec<GcRef<ObjUpvalue>>,
    pub string_methods: Table,
    pub list_methods: Table,
    pub dict_methods: Table,
    pub bytes_methods: Table,
    pub file_methods: Table,
    pub range_methods: Table,
    pub(crate) exception_class: Option<GcRef<ObjClass>>,
    native_modules: HashMap<String, NativeModuleDef>,
    pub(crate) pending_exception: Option<Value>,
    pub out: Output,
    trace: bool,
    dump: bool,
}

impl Vm {
    pub fn new() -> Vm {
        Vm::with_options(VmOptions::default())
    }

    pub fn with_options(options: VmOptions) -> Vm {
        let heap = match options.min_heap {
            Some(bytes) => Heap::with_threshold(bytes),
            None => Heap::new(),
        };
        let mut vm = Vm {
            heap,
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: Table::new(),
            modules: Table::new(),
            open_upvalues: Vec::new(),
            string_methods: Table::new(),
            list_methods: Table::new(),
            dict_methods: Table::new(),
            bytes_methods: Table::new(),
            file_methods: Table::new(),
            range_methods: Table::new(),
            exception_class: None,
            native_modules: HashMap::new(),
            pending_exception: None,
            out: if options.buffered {
                Output::Standard { flush_lines: true }
            } else {
                Output::Standard { flush_lines: false }
            },
            trace: options.trace,
            dump: options.dump,
        };
        vm.bootstrap();
        vm
    }

    /// A VM whose output is captured in memory; used by tests.
    pub fn new_captured() -> Vm {
        let mut vm = Vm::new();
        vm.out = Output::Buffer(Vec::new());
        vm
    }

    fn bootstrap(&mut self) {
        // Nothing is rooted yet; keep the collector out of the way while
        // the builtin tables and the Exception class are assembled.
        self.heap.pause();
        crate::builtins::install(self);
        crate::methods::install(self);
        crate::exceptions::install_exception_class(self);
        self.heap.resume();
    }

    // ---- output ---------------------------------------------------------

    pub fn write_out(&mut self, text: &str) {
        match &mut self.out {
            Output::Standard { flush_lines } => {
                print!("{}", text);
                if *flush_lines {
                    let _ = std::io::stdout().flush();
                }
            }
            Output::Buffer(buffer) => buffer.extend_from_slice(text.as_bytes()),
        }
    }

    pub fn write_line(&mut self, text: &str) {
        self.write_out(text);
        self.write_out("\n");
    }

    pub fn take_output(&mut self) -> String {
        match &mut self.out {
            Output::Buffer(buffer) => String::from_utf8_lossy(&std::mem::take(buffer)).into_owned(),
            Output::Standard { .. } => String::new(),
        }
    }

    pub fn flush_output(&mut self) {
        if let Output::Standard { .. } = self.out {
            let _ = std::io::stdout().flush();
        }
    }

    // ---- natives registration ------------------------------------------

    pub fn define_native(&mut self, name: &str, function: NativeFn) {
        let native = self
            .heap
            .alloc_native(name.to_string(), NativeKind::Function, function as usize);
        let key = Value::Obj(Obj::String(self.heap.intern(name)));
        self.globals.set(key, Value::Obj(Obj::Native(native)));
    }

    pub fn register_native_module(&mut self, def: NativeModuleDef) {
        self.native_modules.insert(def.name.clone(), def);
    }

    /// Invoke every registered unloader; called once at shutdown.
    pub fn shutdown(&mut self) {
        let hooks: Vec<ModuleHookFn> = self
            .native_modules
            .values()
            .filter_map(|def| def.unloader)
            .collect();
        for hook in hooks {
            hook(self);
        }
        self.flush_output();
    }

    // ---- stack ----------------------------------------------------------

    pub fn push(&mut self, value: Value) -> Result<(), Raised> {
        if self.stack.len() >= STACK_MAX {
            return Err(self.raise("stack overflow"));
        }
        self.stack.push(value);
        Ok(())
    }

    pub fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack underflow")
    }

    pub fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }

    pub(crate) fn stack_truncate(&mut self, len: usize) {
        self.stack.truncate(len);
    }

    pub(crate) fn stack_push_raw(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub(crate) fn frames(&self) -> &[CallFrame] {
        &self.frames
    }

    pub(crate) fn frames_mut(&mut self) -> &mut Vec<CallFrame> {
        &mut self.frames
    }

    // ---- frame helpers --------------------------------------------------

    fn frame_ip(&self) -> usize {
        self.frames.last().expect("call frame").ip
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("call frame");
        let byte = frame.closure.function.blob.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let frame = self.frames.last_mut().expect("call frame");
        let value = frame.closure.function.blob.read_u16(frame.ip);
        frame.ip += 2;
        value
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_u16() as usize;
        let frame = self.frames.last().expect("call frame");
        frame.closure.function.blob.constants[index]
    }

    fn read_string(&mut self) -> GcRef<ObjString> {
        match self.read_constant() {
            Value::Obj(Obj::String(s)) => s,
            other => panic!("expected string constant, found {}", other.type_name()),
        }
    }

    fn current_module(&self) -> GcRef<ObjModule> {
        self.frames.last().expect("call frame").closure.function.module
    }

    fn current_line(&self) -> u32 {
        let frame = self.frames.last().expect("call frame");
        frame
            .closure
            .function
            .blob
            .line_at(frame.ip.saturating_sub(1))
    }

    // ---- interpretation -------------------------------------------------

    pub fn interpret(&mut self, source: &str, path: &str) -> InterpretResult {
        let file = std::path::Path::new(path)
            .canonicalize()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| path.to_string());

        let module = self.heap.alloc_module(String::new(), file.clone());
        let key = Value::Obj(Obj::String(self.heap.intern(&file)));
        self.modules.set(key, Value::Obj(Obj::Module(module)));

        let function = match emberc::compile(&mut self.heap, source, module) {
            Ok(function) => function,
            Err(message) => {
                eprintln!("{}", message);
                return InterpretResult::CompileError;
            }
        };

        if self.dump {
            dump_function(function);
        }

        let closure = self.heap.alloc_closure(function);
        if self.push(Value::Obj(Obj::Closure(closure))).is_err() {
            return InterpretResult::RuntimeError;
        }
        if self.call_closure(closure, 0).is_err() && !self.propagate() {
            return InterpretResult::RuntimeError;
        }
        let result = self.run();
        self.flush_output();
        result
    }

    fn run(&mut self) -> InterpretResult {
        loop {
            if self.heap.should_collect() {
                self.collect_garbage();
            }
            if self.trace {
                self.trace_instruction();
            }
            let byte = self.read_byte();
            let Some(op) = Op::from_byte(byte) else {
                return self.fatal(&format!(
                    "unknown opcode {} at {}",
                    byte,
                    self.frame_ip()
                ));
            };
            match self.execute(op) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Halt) => return InterpretResult::Ok,
                Err(Raised) => {
                    if !self.propagate() {
                        return InterpretResult::RuntimeError;
                    }
                }
            }
        }
    }

    /// An unrecoverable internal fault: flush whatever the program has
    /// printed, then surface the diagnostic on stderr.
    fn fatal(&mut self, message: &str) -> InterpretResult {
        self.flush_output();
        eprintln!("fatal: {}", message);
        InterpretResult::Fatal
    }

    fn trace_instruction(&self) {
        let mut line = String::from("          ");
        for value in &self.stack {
            line.push_str(&format!("[ {} ]", value));
        }
        let frame = self.frames.last().expect("call frame");
        let (text, _) =
            opcode::disassemble_instruction(&frame.closure.function.blob, frame.ip);
        println!("{}\n{}", line, text);
    }

    fn execute(&mut self, op: Op) -> Result<Flow, Raised> {
        match op {
            Op::Constant => {
                let value = self.read_constant();
                self.push(value)?;
            }
            Op::Nil => self.push(Value::Nil)?,
            Op::True => self.push(Value::Bool(true))?,
            Op::False => self.push(Value::Bool(false))?,
            Op::Empty => self.push(Value::Empty)?,
            Op::One => self.push(Value::Number(1.0))?,
            Op::Pop => {
                self.pop();
            }
            Op::PopN => {
                let count = self.read_u16() as usize;
                let len = self.stack.len().saturating_sub(count);
                self.stack.truncate(len);
            }
            Op::Dup => {
                let top = self.peek(0);
                self.push(top)?;
            }

            Op::Add => self.op_add()?,
            Op::Subtract => self.numeric_binary(op)?,
            Op::Multiply => self.op_multiply()?,
            Op::Divide => self.numeric_binary(op)?,
            Op::FloorDivide => self.numeric_binary(op)?,
            Op::Remainder => self.numeric_binary(op)?,
            Op::Pow => self.numeric_binary(op)?,
            Op::BitAnd | Op::BitOr | Op::BitXor | Op::LShift | Op::RShift => {
                self.bitwise_binary(op)?
            }
            Op::Negate => {
                let value = self.pop();
                match coerce_number(&value) {
                    Some(n) => self.push(Value::Number(-n))?,
                    None => {
                        return Err(self.raise(&format!(
                            "unsupported operand type for unary -: '{}'",
                            value.type_name()
                        )))
                    }
                }
            }
            Op::Not => {
                let value = self.pop();
                self.push(Value::Bool(value.is_false()))?;
            }
            Op::BitNot => {
                let value = self.pop();
                match coerce_number(&value) {
                    Some(n) => self.push(Value::Number(!(n as i64) as f64))?,
                    None => {
                        return Err(self.raise(&format!(
                            "unsupported operand type for ~: '{}'",
                            value.type_name()
                        )))
                    }
                }
            }
            Op::Equal => {
                let b = self.pop();
                let a = self.pop();
                self.push(Value::Bool(a.strict_eq(&b)))?;
            }
            Op::Greater => self.comparison(op)?,
            Op::Less => self.comparison(op)?,
            Op::Range => {
                let b = self.pop();
                let a = self.pop();
                match (coerce_number(&a), coerce_number(&b)) {
                    (Some(lower), Some(upper)) => {
                        let range = self.heap.alloc_range(lower as i64, upper as i64);
                        self.push(Value::Obj(Obj::Range(range)))?;
                    }
                    _ => {
                        return Err(self.raise(&format!(
                            "range endpoints must be numbers, got '{}' and '{}'",
                            a.type_name(),
                            b.type_name()
                        )))
                    }
                }
            }
            Op::Stringify => {
                if self.peek(0).as_string().is_none() {
                    let value = self.pop();
                    let text = value.render();
                    let interned = self.heap.intern_owned(text);
                    self.push(Value::Obj(Obj::String(interned)))?;
                }
            }
            Op::Choice => {
                let distance = self.read_u16() as usize;
                let top = self.peek(0);
                if matches!(top, Value::Nil | Value::Empty) {
                    self.pop();
                } else {
                    self.frames.last_mut().expect("call frame").ip += distance;
                }
            }

            Op::DefineGlobal => {
                let name = self.read_string();
                let value = self.pop();
                let mut module = self.current_module();
                module.values.set(Value::Obj(Obj::String(name)), value);
            }
            Op::GetGlobal => {
                let name = self.read_string();
                let key = Value::Obj(Obj::String(name));
                let module = self.current_module();
                let value = module
                    .values
                    .get(&key)
                    .or_else(|| self.globals.get(&key));
                match value {
                    Some(value) => self.push(value)?,
                    None => {
                        return Err(
                            self.raise(&format!("'{}' is not defined", name.chars))
                        )
                    }
                }
            }
            Op::SetGlobal => {
                let name = self.read_string();
                let key = Value::Obj(Obj::String(name));
                let value = self.peek(0);
                let mut module = self.current_module();
                if module.values.contains(&key) {
                    module.values.set(key, value);
                } else {
                    return Err(self.raise(&format!("'{}' is not defined", name.chars)));
                }
            }

            Op::GetLocal => {
                let slot = self.read_u16() as usize;
                let base = self.frames.last().expect("call frame").base;
                let value = self.stack[base + slot];
                self.push(value)?;
            }
            Op::SetLocal => {
                let slot = self.read_u16() as usize;
                let base = self.frames.last().expect("call frame").base;
                let value = self.peek(0);
                self.stack[base + slot] = value;
            }

            Op::GetUpvalue => {
                let slot = self.read_u16() as usize;
                let upvalue = self.frames.last().expect("call frame").closure.upvalues[slot];
                let value = match upvalue.state {
                    UpvalueState::Open(index) => self.stack[index],
                    UpvalueState::Closed(value) => value,
                };
                self.push(value)?;
            }
            Op::SetUpvalue => {
                let slot = self.read_u16() as usize;
                let mut upvalue = self.frames.last().expect("call frame").closure.upvalues[slot];
                let value = self.peek(0);
                match upvalue.state {
                    UpvalueState::Open(index) => self.stack[index] = value,
                    UpvalueState::Closed(_) => upvalue.state = UpvalueState::Closed(value),
                }
            }
            Op::CloseUpvalue => {
                let top = self.stack.len() - 1;
                self.close_upvalues(top);
                self.pop();
            }

            Op::GetProperty => self.get_property(false)?,
            Op::GetSelfProperty => self.get_property(true)?,
            Op::SetProperty => self.set_property()?,

            Op::Jump => {
                let distance = self.read_u16() as usize;
                self.frames.last_mut().expect("call frame").ip += distance;
            }
            Op::JumpIfFalse => {
                let distance = self.read_u16() as usize;
                if self.peek(0).is_false() {
                    self.frames.last_mut().expect("call frame").ip += distance;
                }
            }
            Op::Loop => {
                let distance = self.read_u16() as usize;
                self.frames.last_mut().expect("call frame").ip -= distance;
            }
            Op::BreakPlaceholder => {
                return Err(self.raise("internal error: unpatched break placeholder"));
            }

            Op::Closure => {
                let function = match self.read_constant() {
                    Value::Obj(Obj::Function(function)) => function,
                    other => {
                        return Err(self.raise(&format!(
                            "internal error: closure over non-function '{}'",
                            other.type_name()
                        )))
                    }
                };
                let closure = self.heap.alloc_closure(function);
                self.push(Value::Obj(Obj::Closure(closure)))?;
                let mut closure = closure;
                for _ in 0..function.upvalue_count {
                    let is_local = self.read_byte() != 0;
                    let index = self.read_u16() as usize;
                    if is_local {
                        let base = self.frames.last().expect("call frame").base;
                        let captured = self.capture_upvalue(base + index);
                        closure.upvalues.push(captured);
                    } else {
                        let enclosing =
                            self.frames.last().expect("call frame").closure.upvalues[index];
                        closure.upvalues.push(enclosing);
                    }
                }
            }
            Op::Call => {
                let argc = self.read_byte() as usize;
                let callee = self.peek(argc);
                self.call_value(callee, argc)?;
            }
            Op::Invoke => {
                let name = self.read_string();
                let argc = self.read_byte() as usize;
                self.invoke(name, argc, false)?;
            }
            Op::InvokeSelf => {
                let name = self.read_string();
                let argc = self.read_byte() as usize;
                self.invoke(name, argc, true)?;
            }
            Op::Return => return self.op_return(),

            Op::Class => {
                let name = self.read_string();
                let class = self.heap.alloc_class(name);
                self.push(Value::Obj(Obj::Class(class)))?;
            }
            Op::Method => {
                let name = self.read_string();
                let is_static = self.read_byte() != 0;
                let method = self.peek(0);
                let Value::Obj(Obj::Class(mut class)) = self.peek(1) else {
                    return Err(self.raise("internal error: method outside class body"));
                };
                let key = Value::Obj(Obj::String(name));
                if is_static {
                    class.statics.set(key, method);
                } else {
                    class.methods.set(key, method);
                    if name.chars == class.name.chars {
                        class.initializer = method;
                    }
                }
                self.pop();
            }
            Op::ClassProperty => {
                let name = self.read_string();
                let is_static = self.read_byte() != 0;
                let value = self.peek(0);
                let Value::Obj(Obj::Class(mut class)) = self.peek(1) else {
                    return Err(self.raise("internal error: field outside class body"));
                };
                let key = Value::Obj(Obj::String(name));
                if is_static {
                    class.statics.set(key, value);
                } else {
                    class.properties.set(key, value);
                }
                self.pop();
            }
            Op::Inherit => {
                let Value::Obj(Obj::Class(mut subclass)) = self.peek(0) else {
                    return Err(self.raise("internal error: inherit without subclass"));
                };
                let Value::Obj(Obj::Class(superclass)) = self.peek(1) else {
                    return Err(self.raise("a class can only inherit from another class"));
                };
                superclass.methods.copy_to(&mut subclass.methods);
                superclass.properties.copy_to(&mut subclass.properties);
                subclass.initializer = superclass.initializer;
                subclass.superclass = Some(superclass);
                self.pop();
            }
            Op::GetSuper => {
                let name = self.read_string();
                let Value::Obj(Obj::Class(superclass)) = self.pop() else {
                    return Err(self.raise("internal error: missing superclass"));
                };
                let receiver = self.peek(0);
                let key = Value::Obj(Obj::String(name));
                match superclass.methods.get(&key) {
                    Some(Value::Obj(Obj::Closure(method))) => {
                        let bound = self.heap.alloc_bound_method(receiver, method);
                        self.pop();
                        self.push(Value::Obj(Obj::BoundMethod(bound)))?;
                    }
                    Some(value) => {
                        self.pop();
                        self.push(value)?;
                    }
                    None => {
                        return Err(self.raise(&format!(
                            "class '{}' has no method '{}'",
                            superclass.name.chars, name.chars
                        )))
                    }
                }
            }
            Op::SuperInvoke | Op::SuperInvokeSelf => {
                let name = self.read_string();
                let argc = self.read_byte() as usize;
                let Value::Obj(Obj::Class(superclass)) = self.pop() else {
                    return Err(self.raise("internal error: missing superclass"));
                };
                self.invoke_from_class(superclass, name, argc)?;
            }

            Op::List => {
                let count = self.read_u16() as usize;
                let start = self.stack.len() - count;
                let items = self.stack.split_off(start);
                let list = self.heap.alloc_list(items);
                self.push(Value::Obj(Obj::List(list)))?;
            }
            Op::Dict => {
                let pairs = self.read_u16() as usize;
                let start = self.stack.len() - pairs * 2;
                let flat = self.stack.split_off(start);
                let mut dict = self.heap.alloc_dict();
                for pair in flat.chunks(2) {
                    let key = pair[0];
                    let value = pair[1];
                    if !is_hashable_key(&key) {
                        return Err(self.raise(&format!(
                            "'{}' cannot be used as a dictionary key",
                            key.type_name()
                        )));
                    }
                    if dict.table.set(key, value) {
                        dict.keys.push(key);
                    }
                }
                self.push(Value::Obj(Obj::Dict(dict)))?;
            }
            Op::GetIndex => {
                let keep = self.read_byte() != 0;
                self.get_index(keep)?;
            }
            Op::GetRangedIndex => self.get_ranged_index()?,
            Op::SetIndex => self.set_index()?,

            Op::CallImport => self.op_call_import()?,
            Op::NativeModule => self.op_native_module()?,
            Op::SelectImport | Op::SelectNativeImport => {
                let name = self.read_string();
                let Value::Obj(Obj::Module(module)) = self.peek(0) else {
                    return Err(self.raise("internal error: import selection without module"));
                };
                if name.chars.starts_with('_') {
                    return Err(self.raise(&format!(
                        "cannot import private member '{}' from module '{}'",
                        name.chars, module.name
                    )));
                }
                let key = Value::Obj(Obj::String(name));
                let Some(value) = module.values.get(&key) else {
                    return Err(self.raise(&format!(
                        "module '{}' has no member '{}'",
                        module.name, name.chars
                    )));
                };
                let mut current = self.current_module();
                current.values.set(key, value);
            }
            Op::ImportAll | Op::ImportAllNative => {
                let Value::Obj(Obj::Module(module)) = self.peek(0) else {
                    return Err(self.raise("internal error: import-all without module"));
                };
                let mut current = self.current_module();
                let entries: Vec<(Value, Value)> = module.values.iter().collect();
                for (key, value) in entries {
                    if let Value::Obj(Obj::String(name)) = key
                        && !name.chars.starts_with('_')
                    {
                        current.values.set(key, value);
                    }
                }
            }
            Op::EjectImport | Op::EjectNativeImport => {
                let name = self.read_string();
                let key = Value::Obj(Obj::String(name));
                let mut current = self.current_module();
                current.values.delete(&key);
            }

            Op::Try => self.op_try()?,
            Op::PopTry => {
                self.frames
                    .last_mut()
                    .expect("call frame")
                    .handlers
                    .pop();
            }
            Op::PublishTry => {
                let flag = self.pop();
                let exception = self.pop();
                if !flag.is_false() {
                    self.pending_exception = Some(exception);
                    return Err(Raised);
                }
            }

            Op::Echo => {
                let value = self.pop();
                let text = value.render();
                self.write_line(&text);
            }
            Op::Assert => {
                let message = self.pop();
                let condition = self.pop();
                if condition.is_false() {
                    let text = if message.is_nil() {
                        "assertion failed".to_string()
                    } else {
                        format!("assertion failed: {}", message.render())
                    };
                    return Err(self.raise(&text));
                }
            }
            Op::Die => {
                let value = self.pop();
                let is_exception = matches!(
                    value,
                    Value::Obj(Obj::Instance(instance))
                        if instance.class.chain_has_name("Exception")
                );
                if !is_exception {
                    return Err(self.raise("die expects an instance of Exception"));
                }
                return Err(self.throw_value(value));
            }
            Op::Switch => {
                let Value::Obj(Obj::Switch(switch)) = self.read_constant() else {
                    return Err(self.raise("internal error: switch without jump table"));
                };
                let value = self.pop();
                self.dispatch_switch(switch, value);
            }
        }
        Ok(Flow::Continue)
    }

    fn dispatch_switch(&mut self, switch: GcRef<ObjSwitch>, value: Value) {
        let target = if is_hashable_key(&value) {
            switch.table.get(&value)
        } else {
            None
        };
        let offset = match target {
            Some(Value::Number(relative)) => relative as usize,
            _ => match switch.default_jump {
                Some(relative) => relative as usize,
                None => switch.exit_jump as usize,
            },
        };
        self.frames.last_mut().expect("call frame").ip += offset;
    }

    // ---- exceptions (dispatch side) -------------------------------------

    fn op_try(&mut self) -> Result<(), Raised> {
        let type_index = self.read_u16();
        let catch_addr = self.read_u16();
        let finally_addr = self.read_u16();

        let class = if type_index != ADDR_NONE {
            let frame = self.frames.last().expect("call frame");
            let constant = frame.closure.function.blob.constants[type_index as usize];
            let Value::Obj(Obj::String(name)) = constant else {
                return Err(self.raise("internal error: non-string handler class"));
            };
            let key = Value::Obj(Obj::String(name));
            let module = self.current_module();
            let value = module.values.get(&key).or_else(|| self.globals.get(&key));
            let Some(Value::Obj(Obj::Class(class))) = value else {
                return Err(self.raise(&format!(
                    "'{}' is not a class that can be caught",
                    name.chars
                )));
            };
            if !class.chain_has_name("Exception") {
                return Err(self.raise(&format!(
                    "'{}' does not inherit from Exception",
                    name.chars
                )));
            }
            Some(class)
        } else {
            None
        };

        let stack_top = self.stack.len();
        if self.frames.last().expect("call frame").handlers.len() >= HANDLERS_MAX {
            return Err(self.raise("too many nested exception handlers"));
        }
        self.frames
            .last_mut()
            .expect("call frame")
            .handlers
            .push(Handler {
                class,
                catch_addr,
                finally_addr,
                stack_top,
            });
        Ok(())
    }

    // ---- calls ----------------------------------------------------------

    pub(crate) fn call_value(&mut self, callee: Value, argc: usize) -> Result<(), Raised> {
        match callee {
            Value::Obj(Obj::Closure(closure)) => self.call_closure(closure, argc),
            Value::Obj(Obj::BoundMethod(bound)) => {
                let slot = self.stack.len() - argc - 1;
                self.stack[slot] = bound.receiver;
                self.call_closure(bound.method, argc)
            }
            Value::Obj(Obj::Class(class)) => self.instantiate(class, argc),
            Value::Obj(Obj::Native(native)) => self.call_native(native, argc),
            other => Err(self.raise(&format!("'{}' is not callable", other.type_name()))),
        }
    }

    pub(crate) fn call_closure(
        &mut self,
        closure: GcRef<ObjClosure>,
        argc: usize,
    ) -> Result<(), Raised> {
        let function = closure.function;
        let arity = function.arity;
        let mut argc = argc;

        if function.is_variadic {
            let required = arity.saturating_sub(1);
            if argc < required {
                return Err(self.raise(&format!(
                    "{}() expects at least {} arguments, got {}",
                    display_name(&function),
                    required,
                    argc
                )));
            }
            let surplus_start = self.stack.len() - (argc - required);
            let surplus = self.stack.split_off(surplus_start);
            let list = self.heap.alloc_list(surplus);
            self.push(Value::Obj(Obj::List(list)))?;
            argc = arity;
        } else if argc < arity {
            // Missing trailing arguments become nil, if the stack allows.
            while argc < arity {
                if self.stack.len() >= STACK_MAX {
                    return Err(self.raise(&format!(
                        "{}() expects {} arguments, got {}",
                        display_name(&function),
                        arity,
                        argc
                    )));
                }
                self.stack.push(Value::Nil);
                argc += 1;
            }
        } else if argc > arity {
            return Err(self.raise(&format!(
                "{}() expects {} arguments, got {}",
                display_name(&function),
                arity,
                argc
            )));
        }

        if self.frames.len() >= FRAMES_MAX {
            return Err(self.raise("stack overflow"));
        }
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            base: self.stack.len() - argc - 1,
            handlers: Vec::new(),
        });
        Ok(())
    }

    fn call_native(&mut self, native: GcRef<ObjNative>, argc: usize) -> Result<(), Raised> {
        let slot = self.stack.len() - argc - 1;
        let args: Vec<Value> = match native.kind {
            NativeKind::Function | NativeKind::StaticMethod => {
                self.stack[slot + 1..].to_vec()
            }
            NativeKind::Method | NativeKind::Private | NativeKind::Initializer => {
                self.stack[slot..].to_vec()
            }
        };
        // Safety: the pointer was produced from a NativeFn at registration
        // time; this is the only place it is called.
        let function: NativeFn = unsafe { std::mem::transmute(native.function) };
        let depth = self.heap.protected_depth();
        let result = function(self, &args);
        self.heap.release_protected(depth);
        let value = result?;
        self.stack.truncate(slot);
        self.push(value)
    }

    fn instantiate(&mut self, class: GcRef<ObjClass>, argc: usize) -> Result<(), Raised> {
        let instance = self.heap.alloc_instance(class);
        let slot = self.stack.len() - argc - 1;
        self.stack[slot] = Value::Obj(Obj::Instance(instance));
        match class.initializer {
            Value::Empty => {
                if argc != 0 {
                    return Err(self.raise(&format!(
                        "{}() expects 0 arguments, got {}",
                        class.name.chars, argc
                    )));
                }
                Ok(())
            }
            Value::Obj(Obj::Closure(init)) => self.call_closure(init, argc),
            Value::Obj(Obj::Native(init)) => self.call_native(init, argc),
            _ => Err(self.raise("internal error: malformed initializer")),
        }
    }

    fn invoke(
        &mut self,
        name: GcRef<ObjString>,
        argc: usize,
        allow_private: bool,
    ) -> Result<(), Raised> {
        let receiver = self.peek(argc);
        let key = Value::Obj(Obj::String(name));
        match receiver {
            Value::Obj(Obj::Instance(instance)) => {
                if name.chars.starts_with('_') && !allow_private {
                    return Err(self.raise(&format!(
                        "cannot call private method '{}' from outside '{}'",
                        name.chars, instance.class.name.chars
                    )));
                }
                if let Some(field) = instance.properties.get(&key) {
                    let slot = self.stack.len() - argc - 1;
                    self.stack[slot] = field;
                    return self.call_value(field, argc);
                }
                self.invoke_from_class(instance.class, name, argc)
            }
            Value::Obj(Obj::Module(module)) => {
                let Some(value) = module.values.get(&key) else {
                    return Err(self.raise(&format!(
                        "module '{}' has no member '{}'",
                        module.name, name.chars
                    )));
                };
                let slot = self.stack.len() - argc - 1;
                self.stack[slot] = value;
                self.call_value(value, argc)
            }
            Value::Obj(Obj::Class(class)) => {
                if let Some(value) = class.statics.get(&key) {
                    if let Value::Obj(Obj::Native(native)) = value {
                        return self.call_native(native, argc);
                    }
                    // Static methods run with the class itself in slot 0.
                    return match value {
                        Value::Obj(Obj::Closure(closure)) => self.call_closure(closure, argc),
                        other => self.call_value(other, argc),
                    };
                }
                if class.methods.contains(&key) {
                    return Err(self.raise(&format!(
                        "cannot call instance method '{}' on class '{}' directly",
                        name.chars, class.name.chars
                    )));
                }
                Err(self.raise(&format!(
                    "class '{}' has no static member '{}'",
                    class.name.chars, name.chars
                )))
            }
            Value::Obj(Obj::Dict(dict)) => {
                if let Some(entry) = dict.table.get(&key) {
                    let slot = self.stack.len() - argc - 1;
                    self.stack[slot] = entry;
                    return self.call_value(entry, argc);
                }
                self.invoke_builtin_method(receiver, name, argc)
            }
            Value::Obj(Obj::String(_))
            | Value::Obj(Obj::List(_))
            | Value::Obj(Obj::Bytes(_))
            | Value::Obj(Obj::Range(_))
            | Value::Obj(Obj::File(_)) => self.invoke_builtin_method(receiver, name, argc),
            other => Err(self.raise(&format!(
                "cannot call method '{}' on value of type '{}'",
                name.chars,
                other.type_name()
            ))),
        }
    }

    fn invoke_builtin_method(
        &mut self,
        receiver: Value,
        name: GcRef<ObjString>,
        argc: usize,
    ) -> Result<(), Raised> {
        let key = Value::Obj(Obj::String(name));
        match self.builtin_method(&receiver, &key) {
            Some(Value::Obj(Obj::Native(native))) => self.call_native(native, argc),
            Some(other) => self.call_value(other, argc),
            None => Err(self.raise(&format!(
                "'{}' has no method '{}'",
                receiver.type_name(),
                name.chars
            ))),
        }
    }

    /// Look up a method in the builtin table for a receiver's type.
    fn builtin_method(&self, receiver: &Value, key: &Value) -> Option<Value> {
        let table = match receiver {
            Value::Obj(Obj::String(_)) => &self.string_methods,
            Value::Obj(Obj::List(_)) => &self.list_methods,
            Value::Obj(Obj::Dict(_)) => &self.dict_methods,
            Value::Obj(Obj::Bytes(_)) => &self.bytes_methods,
            Value::Obj(Obj::Range(_)) => &self.range_methods,
            Value::Obj(Obj::File(_)) => &self.file_methods,
            _ => return None,
        };
        table.get(key)
    }

    pub(crate) fn invoke_from_class(
        &mut self,
        class: GcRef<ObjClass>,
        name: GcRef<ObjString>,
        argc: usize,
    ) -> Result<(), Raised> {
        let key = Value::Obj(Obj::String(name));
        if let Some(method) = class.methods.get(&key) {
            return match method {
                Value::Obj(Obj::Closure(closure)) => self.call_closure(closure, argc),
                Value::Obj(Obj::Native(native)) => self.call_native(native, argc),
                other => self.call_value(other, argc),
            };
        }
        // Chained super-initializer: `parent(...)` inside an initializer
        // resolves to the superclass's own initializer.
        let invoking = self.frames.last().expect("call frame").closure.function;
        if invoking.kind == FunctionKind::Initializer
            && invoking.name == name.chars
            && !class.initializer.is_empty_sentinel()
        {
            return match class.initializer {
                Value::Obj(Obj::Closure(closure)) => self.call_closure(closure, argc),
                Value::Obj(Obj::Native(native)) => self.call_native(native, argc),
                _ => Err(self.raise("internal error: malformed initializer")),
            };
        }
        Err(self.raise(&format!(
            "class '{}' has no method '{}'",
            class.name.chars, name.chars
        )))
    }

    fn op_return(&mut self) -> Result<Flow, Raised> {
        let result = self.pop();
        let frame = self.frames.pop().expect("call frame");
        self.close_upvalues(frame.base);

        if self.frames.is_empty() {
            self.stack.truncate(frame.base);
            return Ok(Flow::Halt);
        }

        match frame.closure.function.kind {
            FunctionKind::Module => {
                let mut module = frame.closure.function.module;
                module.imported = true;
                self.stack.truncate(frame.base);
                // Bind the module's name in the importer.
                let name = self.heap.intern(&module.name);
                let mut importer = self.current_module();
                importer
                    .values
                    .set(Value::Obj(Obj::String(name)), Value::Obj(Obj::Module(module)));
                self.push(Value::Obj(Obj::Module(module)))?;
            }
            _ => {
                self.stack.truncate(frame.base);
                self.push(result)?;
            }
        }
        Ok(Flow::Continue)
    }

    // ---- imports --------------------------------------------------------

    fn op_call_import(&mut self) -> Result<(), Raised> {
        let Value::Obj(Obj::Function(function)) = self.read_constant() else {
            return Err(self.raise("internal error: import of non-function"));
        };
        let module = function.module;
        let path_key = Value::Obj(Obj::String(self.heap.intern(&module.file)));

        if let Some(cached @ Value::Obj(Obj::Module(_))) = self.modules.get(&path_key) {
            // Re-import: reuse the executed module, bind under this
            // import's name, and skip the top-level code entirely.
            let name = self.heap.intern(&module.name);
            let mut importer = self.current_module();
            importer.values.set(Value::Obj(Obj::String(name)), cached);
            self.push(cached)?;
            return Ok(());
        }

        self.modules.set(path_key, Value::Obj(Obj::Module(module)));
        let closure = self.heap.alloc_closure(function);
        self.push(Value::Obj(Obj::Closure(closure)))?;
        self.call_closure(closure, 0)
    }

    fn op_native_module(&mut self) -> Result<(), Raised> {
        let name = self.read_string();
        let key = Value::Obj(Obj::String(name));
        if let Some(cached @ Value::Obj(Obj::Module(_))) = self.modules.get(&key) {
            let mut importer = self.current_module();
            importer.values.set(key, cached);
            self.push(cached)?;
            return Ok(());
        }
        let Some(def) = self.native_modules.remove(&name.chars) else {
            return Err(self.raise(&format!("native module '{}' is not registered", name.chars)));
        };
        let module = crate::modules::materialize(self, &def);
        self.native_modules.insert(def.name.clone(), def);
        let value = Value::Obj(Obj::Module(module));
        self.modules.set(key, value);
        let mut importer = self.current_module();
        importer.values.set(key, value);
        self.push(value)
    }

    // ---- upvalues -------------------------------------------------------

    fn capture_upvalue(&mut self, slot: usize) -> GcRef<ObjUpvalue> {
        let mut insert_at = self.open_upvalues.len();
        for (i, upvalue) in self.open_upvalues.iter().enumerate() {
            if let UpvalueState::Open(existing) = upvalue.state {
                if existing == slot {
                    return *upvalue;
                }
                if existing < slot {
                    insert_at = i;
                    break;
                }
            }
        }
        let created = self.heap.alloc_upvalue(UpvalueState::Open(slot));
        self.open_upvalues.insert(insert_at, created);
        created
    }

    /// Close every open upvalue whose slot is at or above `from`.
    pub(crate) fn close_upvalues(&mut self, from: usize) {
        while let Some(first) = self.open_upvalues.first().copied() {
            let mut upvalue = first;
            let UpvalueState::Open(slot) = upvalue.state else {
                self.open_upvalues.remove(0);
                continue;
            };
            if slot < from {
                break;
            }
            upvalue.state = UpvalueState::Closed(self.stack[slot]);
            self.open_upvalues.remove(0);
        }
    }

    // ---- operators ------------------------------------------------------

    fn op_add(&mut self) -> Result<(), Raised> {
        let b = self.peek(0);
        let a = self.peek(1);

        if a.as_string().is_some() || b.as_string().is_some() {
            let mut text = concat_fragment(&a);
            text.push_str(&concat_fragment(&b));
            let interned = self.heap.intern_owned(text);
            self.pop();
            self.pop();
            return self.push(Value::Obj(Obj::String(interned)));
        }
        if let (Value::Obj(Obj::List(x)), Value::Obj(Obj::List(y))) = (a, b) {
            let mut items = x.items.clone();
            items.extend_from_slice(&y.items);
            let list = self.heap.alloc_list(items);
            self.pop();
            self.pop();
            return self.push(Value::Obj(Obj::List(list)));
        }
        if let (Value::Obj(Obj::Bytes(x)), Value::Obj(Obj::Bytes(y))) = (a, b) {
            let mut bytes = x.bytes.clone();
            bytes.extend_from_slice(&y.bytes);
            let joined = self.heap.alloc_bytes(bytes);
            self.pop();
            self.pop();
            return self.push(Value::Obj(Obj::Bytes(joined)));
        }
        if let (Some(x), Some(y)) = (coerce_number(&a), coerce_number(&b)) {
            self.pop();
            self.pop();
            return self.push(Value::Number(x + y));
        }
        Err(self.raise(&format!(
            "unsupported operand types for +: '{}' and '{}'",
            a.type_name(),
            b.type_name()
        )))
    }

    fn op_multiply(&mut self) -> Result<(), Raised> {
        let b = self.peek(0);
        let a = self.peek(1);

        let replicate = match (&a, &b) {
            (Value::Obj(Obj::String(s)), other) | (other, Value::Obj(Obj::String(s))) => {
                coerce_number(other).map(|count| (Some(*s), None, count))
            }
            (Value::Obj(Obj::List(l)), other) | (other, Value::Obj(Obj::List(l))) => {
                coerce_number(other).map(|count| (None, Some(*l), count))
            }
            _ => None,
        };

        if let Some((string, list, count)) = replicate {
            if count < 0.0 {
                return Err(self.raise("cannot replicate by a negative count"));
            }
            let count = count as usize;
            self.pop();
            self.pop();
            if let Some(string) = string {
                let text = string.chars.repeat(count);
                let interned = self.heap.intern_owned(text);
                return self.push(Value::Obj(Obj::String(interned)));
            }
            if let Some(list) = list {
                let mut items = Vec::with_capacity(list.items.len() * count);
                for _ in 0..count {
                    items.extend_from_slice(&list.items);
                }
                let replicated = self.heap.alloc_list(items);
                return self.push(Value::Obj(Obj::List(replicated)));
            }
        }

        if let (Some(x), Some(y)) = (coerce_number(&a), coerce_number(&b)) {
            self.pop();
            self.pop();
            return self.push(Value::Number(x * y));
        }
        Err(self.raise(&format!(
            "unsupported operand types for *: '{}' and '{}'",
            a.type_name(),
            b.type_name()
        )))
    }

    fn numeric_binary(&mut self, op: Op) -> Result<(), Raised> {
        let b = self.peek(0);
        let a = self.peek(1);
        let (Some(x), Some(y)) = (coerce_number(&a), coerce_number(&b)) else {
            return Err(self.raise(&format!(
                "unsupported operand types for {}: '{}' and '{}'",
                operator_symbol(op),
                a.type_name(),
                b.type_name()
            )));
        };
        let result = match op {
            Op::Subtract => x - y,
            Op::Divide => x / y,
            Op::FloorDivide => {
                if y == 0.0 {
                    return Err(self.raise("integer division by zero"));
                }
                (x / y).floor()
            }
            Op::Remainder => {
                if y == 0.0 {
                    return Err(self.raise("modulo by zero"));
                }
                // Floored modulo: the sign follows the divisor.
                let r = x % y;
                if r != 0.0 && (r < 0.0) != (y < 0.0) {
                    r + y
                } else {
                    r
                }
            }
            Op::Pow => x.powf(y),
            _ => unreachable!("not a numeric binary operator"),
        };
        self.pop();
        self.pop();
        self.push(Value::Number(result))
    }

    fn bitwise_binary(&mut self, op: Op) -> Result<(), Raised> {
        let b = self.peek(0);
        let a = self.peek(1);
        let (Some(x), Some(y)) = (coerce_number(&a), coerce_number(&b)) else {
            return Err(self.raise(&format!(
                "unsupported operand types for {}: '{}' and '{}'",
                operator_symbol(op),
                a.type_name(),
                b.type_name()
            )));
        };
        let x = x as i64;
        let y = y as i64;
        let result = match op {
            Op::BitAnd => x & y,
            Op::BitOr => x | y,
            Op::BitXor => x ^ y,
            Op::LShift => x.wrapping_shl((y & 63) as u32),
            Op::RShift => x.wrapping_shr((y & 63) as u32),
            _ => unreachable!("not a bitwise operator"),
        };
        self.pop();
        self.pop();
        self.push(Value::Number(result as f64))
    }

    fn comparison(&mut self, op: Op) -> Result<(), Raised> {
        let b = self.peek(0);
        let a = self.peek(1);
        let result = match (&a, &b) {
            (Value::Number(x), Value::Number(y)) => match op {
                Op::Greater => x > y,
                _ => x < y,
            },
            (Value::Bool(_), _) | (_, Value::Bool(_))
                if coerce_number(&a).is_some() && coerce_number(&b).is_some() =>
            {
                let x = coerce_number(&a).expect("numeric");
                let y = coerce_number(&b).expect("numeric");
                match op {
                    Op::Greater => x > y,
                    _ => x < y,
                }
            }
            (Value::Obj(Obj::String(x)), Value::Obj(Obj::String(y))) => match op {
                Op::Greater => x.chars > y.chars,
                _ => x.chars < y.chars,
            },
            _ => {
                return Err(self.raise(&format!(
                    "unsupported operand types for {}: '{}' and '{}'",
                    operator_symbol(op),
                    a.type_name(),
                    b.type_name()
                )))
            }
        };
        self.pop();
        self.pop();
        self.push(Value::Bool(result))
    }

    // ---- indexing -------------------------------------------------------

    fn get_index(&mut self, keep_operands: bool) -> Result<(), Raised> {
        let index = self.peek(0);
        let receiver = self.peek(1);
        let value = self.index_value(receiver, index)?;
        if !keep_operands {
            self.pop();
            self.pop();
        }
        self.push(value)
    }

    fn index_value(&mut self, receiver: Value, index: Value) -> Result<Value, Raised> {
        match receiver {
            Value::Obj(Obj::List(list)) => {
                let i = self.normalize_index(index, list.items.len(), "list")?;
                Ok(list.items[i])
            }
            Value::Obj(Obj::String(string)) => {
                let length = string.length();
                let i = self.normalize_index(index, length, "string")?;
                let piece = if string.is_ascii {
                    string.chars[i..i + 1].to_string()
                } else {
                    string
                        .chars
                        .chars()
                        .nth(i)
                        .map(|c| c.to_string())
                        .unwrap_or_default()
                };
                let interned = self.heap.intern_owned(piece);
                Ok(Value::Obj(Obj::String(interned)))
            }
            Value::Obj(Obj::Bytes(bytes)) => {
                let i = self.normalize_index(index, bytes.bytes.len(), "bytes")?;
                Ok(Value::Number(bytes.bytes[i] as f64))
            }
            Value::Obj(Obj::Dict(dict)) => {
                if !is_hashable_key(&index) {
                    return Err(self.raise(&format!(
                        "'{}' cannot be used as a dictionary key",
                        index.type_name()
                    )));
                }
                match dict.table.get(&index) {
                    Some(value) => Ok(value),
                    None => Err(self.raise(&format!(
                        "dictionary has no key {}",
                        index.render()
                    ))),
                }
            }
            Value::Obj(Obj::Module(module)) => match module.values.get(&index) {
                Some(value) => Ok(value),
                None => Err(self.raise(&format!(
                    "module '{}' has no member {}",
                    module.name,
                    index.render()
                ))),
            },
            other => Err(self.raise(&format!(
                "type '{}' is not indexable",
                other.type_name()
            ))),
        }
    }

    fn normalize_index(
        &mut self,
        index: Value,
        length: usize,
        what: &str,
    ) -> Result<usize, Raised> {
        let Some(raw) = index.as_number() else {
            return Err(self.raise(&format!(
                "{} indices must be numbers, not '{}'",
                what,
                index.type_name()
            )));
        };
        let mut i = raw as i64;
        if i < 0 {
            i += length as i64;
        }
        if i < 0 || i as usize >= length {
            return Err(self.raise(&format!(
                "{} index {} out of range",
                what,
                format_number(raw)
            )));
        }
        Ok(i as usize)
    }

    fn get_ranged_index(&mut self) -> Result<(), Raised> {
        let upper = self.pop();
        let lower = self.pop();
        let receiver = self.pop();

        let length = match receiver {
            Value::Obj(Obj::List(list)) => list.items.len(),
            Value::Obj(Obj::String(string)) => string.length(),
            Value::Obj(Obj::Bytes(bytes)) => bytes.bytes.len(),
            other => {
                return Err(self.raise(&format!(
                    "type '{}' does not support ranged indexing",
                    other.type_name()
                )))
            }
        };
        let (start, end) = self.slice_bounds(lower, upper, length)?;

        match receiver {
            Value::Obj(Obj::List(list)) => {
                let items = list.items[start..end].to_vec();
                let sliced = self.heap.alloc_list(items);
                self.push(Value::Obj(Obj::List(sliced)))
            }
            Value::Obj(Obj::String(string)) => {
                let piece: String = if string.is_ascii {
                    string.chars[start..end].to_string()
                } else {
                    string.chars.chars().skip(start).take(end - start).collect()
                };
                let interned = self.heap.intern_owned(piece);
                self.push(Value::Obj(Obj::String(interned)))
            }
            Value::Obj(Obj::Bytes(bytes)) => {
                let sliced = self.heap.alloc_bytes(bytes.bytes[start..end].to_vec());
                self.push(Value::Obj(Obj::Bytes(sliced)))
            }
            _ => unreachable!("receiver already checked"),
        }
    }

    /// Slice endpoints: nil defaults to the full extent, negatives count
    /// from the end, out-of-range saturates, inverted endpoints produce
    /// the empty slice.
    fn slice_bounds(
        &mut self,
        lower: Value,
        upper: Value,
        length: usize,
    ) -> Result<(usize, usize), Raised> {
        let resolve = |value: Value, default: i64| -> Result<i64, String> {
            match value {
                Value::Nil => Ok(default),
                Value::Number(n) => {
                    let mut i = n as i64;
                    if i < 0 {
                        i += length as i64;
                    }
                    Ok(i)
                }
                other => Err(format!(
                    "slice endpoints must be numbers or nil, not '{}'",
                    other.type_name()
                )),
            }
        };
        let start = match resolve(lower, 0) {
            Ok(i) => i,
            Err(message) => return Err(self.raise(&message)),
        };
        let end = match resolve(upper, length as i64) {
            Ok(i) => i,
            Err(message) => return Err(self.raise(&message)),
        };
        let start = start.clamp(0, length as i64) as usize;
        let end = end.clamp(0, length as i64) as usize;
        if start >= end {
            Ok((0, 0))
        } else {
            Ok((start, end))
        }
    }

    fn set_index(&mut self) -> Result<(), Raised> {
        let value = self.peek(0);
        let index = self.peek(1);
        let receiver = self.peek(2);

        match receiver {
            Value::Obj(Obj::List(mut list)) => {
                let i = self.normalize_index(index, list.items.len(), "list")?;
                list.items[i] = value;
            }
            Value::Obj(Obj::Bytes(mut bytes)) => {
                let i = self.normalize_index(index, bytes.bytes.len(), "bytes")?;
                let Some(byte) = value.as_number() else {
                    return Err(self.raise("bytes elements must be numbers"));
                };
                if !(0.0..=255.0).contains(&byte) || byte.fract() != 0.0 {
                    return Err(self.raise("bytes elements must be integers from 0 to 255"));
                }
                bytes.bytes[i] = byte as u8;
            }
            Value::Obj(Obj::Dict(mut dict)) => {
                if !is_hashable_key(&index) {
                    return Err(self.raise(&format!(
                        "'{}' cannot be used as a dictionary key",
                        index.type_name()
                    )));
                }
                if dict.table.set(index, value) {
                    dict.keys.push(index);
                }
            }
            Value::Obj(Obj::Module(mut module)) => {
                module.values.set(index, value);
            }
            other => {
                return Err(self.raise(&format!(
                    "cannot assign by index into type '{}'",
                    other.type_name()
                )))
            }
        }
        self.pop();
        self.pop();
        self.pop();
        self.push(value)
    }

    // ---- properties -----------------------------------------------------

    fn get_property(&mut self, allow_private: bool) -> Result<(), Raised> {
        let name = self.read_string();
        let receiver = self.peek(0);
        let key = Value::Obj(Obj::String(name));

        match receiver {
            Value::Obj(Obj::Instance(instance)) => {
                if name.chars.starts_with('_') && !allow_private {
                    return Err(self.raise(&format!(
                        "cannot access private property '{}' from outside '{}'",
                        name.chars, instance.class.name.chars
                    )));
                }
                if let Some(value) = instance.properties.get(&key) {
                    self.pop();
                    return self.push(value);
                }
                match instance.class.methods.get(&key) {
                    Some(Value::Obj(Obj::Closure(method))) => {
                        let bound = self.heap.alloc_bound_method(receiver, method);
                        self.pop();
                        self.push(Value::Obj(Obj::BoundMethod(bound)))
                    }
                    Some(other) => {
                        self.pop();
                        self.push(other)
                    }
                    None => Err(self.raise(&format!(
                        "instance of '{}' has no property '{}'",
                        instance.class.name.chars, name.chars
                    ))),
                }
            }
            Value::Obj(Obj::Module(module)) => match module.values.get(&key) {
                Some(value) => {
                    self.pop();
                    self.push(value)
                }
                None => Err(self.raise(&format!(
                    "module '{}' has no member '{}'",
                    module.name, name.chars
                ))),
            },
            Value::Obj(Obj::Class(class)) => {
                let found = class.statics.get(&key).or_else(|| class.methods.get(&key));
                match found {
                    Some(value) => {
                        self.pop();
                        self.push(value)
                    }
                    None => Err(self.raise(&format!(
                        "class '{}' has no property '{}'",
                        class.name.chars, name.chars
                    ))),
                }
            }
            Value::Obj(Obj::Dict(dict)) => {
                if let Some(value) = dict.table.get(&key) {
                    self.pop();
                    return self.push(value);
                }
                match self.dict_methods.get(&key) {
                    Some(value) => {
                        self.pop();
                        self.push(value)
                    }
                    None => Err(self.raise(&format!(
                        "dictionary has no key or method '{}'",
                        name.chars
                    ))),
                }
            }
            Value::Obj(Obj::String(_))
            | Value::Obj(Obj::List(_))
            | Value::Obj(Obj::Bytes(_))
            | Value::Obj(Obj::Range(_))
            | Value::Obj(Obj::File(_)) => match self.builtin_method(&receiver, &key) {
                Some(value) => {
                    self.pop();
                    self.push(value)
                }
                None => Err(self.raise(&format!(
                    "'{}' has no method '{}'",
                    receiver.type_name(),
                    name.chars
                ))),
            },
            other => Err(self.raise(&format!(
                "type '{}' has no properties",
                other.type_name()
            ))),
        }
    }

    fn set_property(&mut self) -> Result<(), Raised> {
        let name = self.read_string();
        let value = self.peek(0);
        let receiver = self.peek(1);
        let key = Value::Obj(Obj::String(name));

        match receiver {
            Value::Obj(Obj::Instance(mut instance)) => {
                instance.properties.set(key, value);
            }
            Value::Obj(Obj::Module(mut module)) => {
                module.values.set(key, value);
            }
            Value::Obj(Obj::Class(mut class)) => {
                class.statics.set(key, value);
            }
            Value::Obj(Obj::Dict(mut dict)) => {
                if dict.table.set(key, value) {
                    dict.keys.push(key);
                }
            }
            other => {
                return Err(self.raise(&format!(
                    "cannot set a property on type '{}'",
                    other.type_name()
                )))
            }
        }
        self.pop();
        self.pop();
        self.push(value)
    }

    // ---- garbage collection ---------------------------------------------

    pub fn collect_garbage(&mut self) {
        for i in 0..self.stack.len() {
            let value = self.stack[i];
            self.heap.mark_value(value);
        }
        for i in 0..self.frames.len() {
            let closure = self.frames[i].closure;
            self.heap.mark_obj(Obj::Closure(closure));
            for h in 0..self.frames[i].handlers.len() {
                if let Some(class) = self.frames[i].handlers[h].class {
                    self.heap.mark_obj(Obj::Class(class));
                }
            }
        }
        for i in 0..self.open_upvalues.len() {
            let upvalue = self.open_upvalues[i];
            self.heap.mark_obj(Obj::Upvalue(upvalue));
        }
        self.heap.mark_table(&self.globals);
        self.heap.mark_table(&self.modules);
        self.heap.mark_table(&self.string_methods);
        self.heap.mark_table(&self.list_methods);
        self.heap.mark_table(&self.dict_methods);
        self.heap.mark_table(&self.bytes_methods);
        self.heap.mark_table(&self.file_methods);
        self.heap.mark_table(&self.range_methods);
        if let Some(class) = self.exception_class {
            self.heap.mark_obj(Obj::Class(class));
        }
        if let Some(pending) = self.pending_exception {
            self.heap.mark_value(pending);
        }
        self.heap.finish_collection();
    }
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new()
    }
}

/// Numeric coercion for arithmetic: numbers pass through, bools become
/// 0/1, everything else refuses.
pub fn coerce_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => Some(*n),
        Value::Bool(true) => Some(1.0),
        Value::Bool(false) => Some(0.0),
        _ => None,
    }
}

/// How a value stringifies when concatenated with a string: nil vanishes,
/// numbers use the canonical format.
fn concat_fragment(value: &Value) -> String {
    match value {
        Value::Nil | Value::Empty => String::new(),
        other => other.render(),
    }
}

pub fn is_hashable_key(value: &Value) -> bool {
    !matches!(
        value,
        Value::Obj(Obj::List(_)) | Value::Obj(Obj::Dict(_)) | Value::Obj(Obj::File(_))
    )
}

fn display_name(function: &ObjFunction) -> &str {
    if function.name.is_empty() {
        "<anonymous>"
    } else {
        &function.name
    }
}

fn operator_symbol(op: Op) -> &'static str {
    match op {
        Op::Add => "+",
        Op::Subtract => "-",
        Op::Multiply => "*",
        Op::Divide => "/",
        Op::FloorDivide => "//",
        Op::Remainder => "%",
        Op::Pow => "**",
        Op::BitAnd => "&",
        Op::BitOr => "|",
        Op::BitXor => "^",
        Op::LShift => "<<",
        Op::RShift => ">>",
        Op::Greater => ">",
        Op::Less => "<",
        _ => "?",
    }
}

/// Disassemble a function and, recursively, every function in its
/// constant pool. Drives the `-d` flag.
pub fn dump_function(function: GcRef<ObjFunction>) {
    let name = if function.name.is_empty() {
        "<script>".to_string()
    } else {
        function.name.clone()
    };
    print!("{}", opcode::disassemble(&function.blob, &name));
    for constant in &function.blob.constants {
        if let Value::Obj(Obj::Function(nested)) = constant {
            dump_function(*nested);
        }
    }
}
