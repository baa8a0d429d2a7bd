//! Exception machinery
//!
//! Runtime faults are Ember values: instances of the `Exception` class
//! (or a subclass) carrying `message` and `stacktrace` properties. The VM
//! queues a pending exception and the dispatch loop drives propagation:
//! walking outward frame by frame, inspecting each frame's handler stack
//! from innermost to outermost, and transferring control to the first
//! catch whose class name appears in the exception's class chain.
//! Finally-only handlers always match; they receive the exception plus a
//! re-propagation sentinel that `OP_PUBLISH_TRY` consults afterwards.

use crate::vm::{ADDR_NONE, Vm};
use ember_core::object::{GcRef, NativeKind, Obj, ObjClass};
use ember_core::value::Value;

/// Marker: an exception has been raised through the VM. Whatever raised
/// it has already queued the exception value; callers unwind with `?`.
pub struct Raised;

/// One `try` record on a frame's handler stack.
pub struct Handler {
    /// None for finally-only handlers.
    pub class: Option<GcRef<ObjClass>>,
    pub catch_addr: u16,
    pub finally_addr: u16,
    /// Value-stack height at `OP_TRY`; restored before entering the
    /// catch or finally body.
    pub stack_top: usize,
}

impl Vm {
    /// Raise a runtime exception with the given message.
    pub(crate) fn raise(&mut self, message: &str) -> Raised {
        let exception = self.make_exception(message);
        self.pending_exception = Some(exception);
        Raised
    }

    /// Throw an exception value produced by user code (`die`).
    pub(crate) fn throw_value(&mut self, value: Value) -> Raised {
        if let Value::Obj(Obj::Instance(mut instance)) = value {
            let trace = self.capture_stack_trace();
            let trace_value = Value::Obj(Obj::String(self.heap.intern_owned(trace)));
            let key = Value::Obj(Obj::String(self.heap.intern("stacktrace")));
            instance.properties.set(key, trace_value);
        }
        self.pending_exception = Some(value);
        Raised
    }

    /// Build an Exception instance with message and captured trace.
    pub(crate) fn make_exception(&mut self, message: &str) -> Value {
        let class = self.exception_class.expect("Exception class is installed");
        let instance = self.heap.alloc_instance(class);
        let value = Value::Obj(Obj::Instance(instance));
        let message_value = Value::Obj(Obj::String(self.heap.intern(message)));
        let trace = self.capture_stack_trace();
        let trace_value = Value::Obj(Obj::String(self.heap.intern_owned(trace)));
        let mut instance = instance;
        let message_key = Value::Obj(Obj::String(self.heap.intern("message")));
        let trace_key = Value::Obj(Obj::String(self.heap.intern("stacktrace")));
        instance.properties.set(message_key, message_value);
        instance.properties.set(trace_key, trace_value);
        value
    }

    /// Stack trace of the live frames, innermost first: module path and
    /// line for each frame.
    pub(crate) fn capture_stack_trace(&self) -> String {
        let mut lines = Vec::new();
        for frame in self.frames() {
            let function = frame.closure.function;
            let line = function.blob.line_at(frame.ip.saturating_sub(1));
            let name = if function.name.is_empty() {
                "<script>"
            } else {
                &function.name
            };
            lines.push(format!(
                "    at {} ({}:{})",
                name, function.module.file, line
            ));
        }
        lines.reverse();
        lines.join("\n")
    }

    /// Walk the handler stacks outward looking for a handler. Returns
    /// true when control was transferred (execution continues) and false
    /// when the exception escaped, after printing the diagnostic.
    pub(crate) fn propagate(&mut self) -> bool {
        let exception = self
            .pending_exception
            .take()
            .expect("propagate without a pending exception");

        while !self.frames().is_empty() {
            let fi = self.frames().len() - 1;
            while let Some(handler) = self.frames_mut()[fi].handlers.pop() {
                let caught = match handler.class {
                    Some(class) => exception_matches(&exception, class),
                    None => false,
                };
                if caught && handler.catch_addr != ADDR_NONE {
                    self.stack_truncate(handler.stack_top);
                    self.stack_push_raw(exception);
                    self.frames_mut()[fi].ip = handler.catch_addr as usize;
                    return true;
                }
                if handler.finally_addr != ADDR_NONE {
                    // Run the finally body, then re-propagate: the body
                    // sees the exception and a true sentinel.
                    self.stack_truncate(handler.stack_top);
                    self.stack_push_raw(exception);
                    self.stack_push_raw(Value::Bool(true));
                    self.frames_mut()[fi].ip = handler.finally_addr as usize;
                    return true;
                }
            }
            let frame = self.frames_mut().pop().expect("call frame");
            self.close_upvalues(frame.base);
            self.stack_truncate(frame.base);
        }

        self.report_unhandled(&exception);
        false
    }

    fn report_unhandled(&mut self, exception: &Value) {
        self.flush_output();
        if let Value::Obj(Obj::Instance(instance)) = exception {
            let message_key = Value::Obj(Obj::String(self.heap.intern("message")));
            let trace_key = Value::Obj(Obj::String(self.heap.intern("stacktrace")));
            let message = instance
                .properties
                .get(&message_key)
                .map(|v| v.render())
                .unwrap_or_default();
            eprintln!("Unhandled {}: {}", instance.class.name.chars, message);
            if let Some(trace) = instance.properties.get(&trace_key) {
                let text = trace.render();
                if !text.is_empty() {
                    eprintln!("{}", text);
                }
            }
        } else {
            eprintln!("Unhandled exception: {}", exception.render());
        }
    }
}

fn exception_matches(exception: &Value, class: GcRef<ObjClass>) -> bool {
    match exception {
        Value::Obj(Obj::Instance(instance)) => {
            instance.class.chain_has_name(&class.name.chars)
        }
        _ => false,
    }
}

/// Create the `Exception` base class and register it as a global. Its
/// initializer is a native that stores the optional message.
pub fn install_exception_class(vm: &mut Vm) {
    let name = vm.heap.intern("Exception");
    let name_key = Value::Obj(Obj::String(name));
    let mut class = vm.heap.alloc_class(name);

    let message_key = Value::Obj(Obj::String(vm.heap.intern("message")));
    let trace_key = Value::Obj(Obj::String(vm.heap.intern("stacktrace")));
    class.properties.set(message_key, Value::Nil);
    class.properties.set(trace_key, Value::Nil);

    let init = vm.heap.alloc_native(
        "Exception".to_string(),
        NativeKind::Initializer,
        exception_init as usize,
    );
    class.initializer = Value::Obj(Obj::Native(init));
    class.methods.set(name_key, Value::Obj(Obj::Native(init)));

    vm.globals.set(name_key, Value::Obj(Obj::Class(class)));
    vm.exception_class = Some(class);
}

fn exception_init(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
    let receiver = args[0];
    if args.len() > 2 {
        return Err(vm.raise(&format!(
            "Exception() expects at most 1 argument, got {}",
            args.len() - 1
        )));
    }
    if let Value::Obj(Obj::Instance(mut instance)) = receiver {
        let message = args.get(1).copied().unwrap_or(Value::Nil);
        let message = match message {
            Value::Nil | Value::Obj(Obj::String(_)) => message,
            other => {
                let rendered = other.render();
                Value::Obj(Obj::String(vm.heap.intern_owned(rendered)))
            }
        };
        let message_key = Value::Obj(Obj::String(vm.heap.intern("message")));
        let trace_key = Value::Obj(Obj::String(vm.heap.intern("stacktrace")));
        instance.properties.set(message_key, message);
        let empty = Value::Obj(Obj::String(vm.heap.intern("")));
        instance.properties.set(trace_key, empty);
    }
    Ok(receiver)
}
