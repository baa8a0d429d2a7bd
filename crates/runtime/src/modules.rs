//! Native module registration
//!
//! External collaborators contribute modules through a registration
//! record: a name, optional field descriptors (computed by a getter at
//! import time), function descriptors, class descriptors, and optional
//! preload/unload hooks. Registration is by name; a leading-underscore
//! import segment (`import _sys`) selects a registered record, which is
//! materialized into a Module object on first import and cached in the
//! VM modules table afterwards.

use crate::vm::{FieldGetFn, ModuleHookFn, NativeFn, Vm};
use ember_core::object::{GcRef, NativeKind, Obj, ObjModule};
use ember_core::value::Value;

pub struct NativeFieldDef {
    pub name: String,
    pub is_static: bool,
    pub getter: FieldGetFn,
}

pub struct NativeFnDef {
    pub name: String,
    pub is_static: bool,
    pub function: NativeFn,
}

pub struct NativeClassDef {
    pub name: String,
    pub fields: Vec<NativeFieldDef>,
    pub functions: Vec<NativeFnDef>,
}

pub struct NativeModuleDef {
    pub name: String,
    pub fields: Vec<NativeFieldDef>,
    pub functions: Vec<NativeFnDef>,
    pub classes: Vec<NativeClassDef>,
    pub preloader: Option<ModuleHookFn>,
    pub unloader: Option<ModuleHookFn>,
}

impl NativeModuleDef {
    pub fn new(name: &str) -> NativeModuleDef {
        NativeModuleDef {
            name: name.to_string(),
            fields: Vec::new(),
            functions: Vec::new(),
            classes: Vec::new(),
            preloader: None,
            unloader: None,
        }
    }

    pub fn with_field(mut self, name: &str, is_static: bool, getter: FieldGetFn) -> Self {
        self.fields.push(NativeFieldDef {
            name: name.to_string(),
            is_static,
            getter,
        });
        self
    }

    pub fn with_function(mut self, name: &str, is_static: bool, function: NativeFn) -> Self {
        self.functions.push(NativeFnDef {
            name: name.to_string(),
            is_static,
            function,
        });
        self
    }

    pub fn with_class(mut self, class: NativeClassDef) -> Self {
        self.classes.push(class);
        self
    }

    pub fn with_preloader(mut self, hook: ModuleHookFn) -> Self {
        self.preloader = Some(hook);
        self
    }

    pub fn with_unloader(mut self, hook: ModuleHookFn) -> Self {
        self.unloader = Some(hook);
        self
    }
}

impl NativeClassDef {
    pub fn new(name: &str) -> NativeClassDef {
        NativeClassDef {
            name: name.to_string(),
            fields: Vec::new(),
            functions: Vec::new(),
        }
    }

    pub fn with_field(mut self, name: &str, is_static: bool, getter: FieldGetFn) -> Self {
        self.fields.push(NativeFieldDef {
            name: name.to_string(),
            is_static,
            getter,
        });
        self
    }

    pub fn with_function(mut self, name: &str, is_static: bool, function: NativeFn) -> Self {
        self.functions.push(NativeFnDef {
            name: name.to_string(),
            is_static,
            function,
        });
        self
    }
}

/// Build a Module object from a registration record. Runs the preloader
/// first so getters can rely on whatever it prepares.
pub fn materialize(vm: &mut Vm, def: &NativeModuleDef) -> GcRef<ObjModule> {
    if let Some(preloader) = def.preloader {
        preloader(vm);
    }

    let mut module = vm
        .heap
        .alloc_module(def.name.clone(), format!("<native:{}>", def.name));

    for field in &def.fields {
        let value = (field.getter)(vm);
        let key = Value::Obj(Obj::String(vm.heap.intern(&field.name)));
        module.values.set(key, value);
    }

    for function in &def.functions {
        let native = vm.heap.alloc_native(
            function.name.clone(),
            NativeKind::Function,
            function.function as usize,
        );
        let key = Value::Obj(Obj::String(vm.heap.intern(&function.name)));
        module.values.set(key, Value::Obj(Obj::Native(native)));
    }

    for class_def in &def.classes {
        let name = vm.heap.intern(&class_def.name);
        let mut class = vm.heap.alloc_class(name);
        for field in &class_def.fields {
            let value = (field.getter)(vm);
            let key = Value::Obj(Obj::String(vm.heap.intern(&field.name)));
            if field.is_static {
                class.statics.set(key, value);
            } else {
                class.properties.set(key, value);
            }
        }
        for function in &class_def.functions {
            let kind = if function.name == class_def.name {
                NativeKind::Initializer
            } else if function.is_static {
                NativeKind::StaticMethod
            } else if function.name.starts_with('_') {
                NativeKind::Private
            } else {
                NativeKind::Method
            };
            let native = vm.heap.alloc_native(
                function.name.clone(),
                kind,
                function.function as usize,
            );
            let key = Value::Obj(Obj::String(vm.heap.intern(&function.name)));
            if kind == NativeKind::Initializer {
                class.initializer = Value::Obj(Obj::Native(native));
                class.methods.set(key, Value::Obj(Obj::Native(native)));
            } else if function.is_static {
                class.statics.set(key, Value::Obj(Obj::Native(native)));
            } else {
                class.methods.set(key, Value::Obj(Obj::Native(native)));
            }
        }
        let key = Value::Obj(Obj::String(name));
        module.values.set(key, Value::Obj(Obj::Class(class)));
    }

    module.preloader = def.preloader.map(|hook| hook as usize);
    module.unloader = def.unloader.map(|hook| hook as usize);
    module.imported = true;
    module
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exceptions::Raised;

    fn answer_getter(_vm: &mut Vm) -> Value {
        Value::Number(42.0)
    }

    fn double_native(vm: &mut Vm, args: &[Value]) -> Result<Value, Raised> {
        match args.first().and_then(|v| v.as_number()) {
            Some(n) => Ok(Value::Number(n * 2.0)),
            None => Err(vm.raise("double expects a number")),
        }
    }

    #[test]
    fn test_materialize_builds_values_table() {
        let mut vm = Vm::new_captured();
        let def = NativeModuleDef::new("_demo")
            .with_field("answer", false, answer_getter)
            .with_function("double", false, double_native);
        let module = materialize(&mut vm, &def);

        let answer_key = Value::Obj(Obj::String(vm.heap.intern("answer")));
        assert_eq!(module.values.get(&answer_key), Some(Value::Number(42.0)));
        let double_key = Value::Obj(Obj::String(vm.heap.intern("double")));
        assert!(matches!(
            module.values.get(&double_key),
            Some(Value::Obj(Obj::Native(_)))
        ));
        assert!(module.imported);
    }

    #[test]
    fn test_registered_module_import_runs_natives() {
        let mut vm = Vm::new_captured();
        let def = NativeModuleDef::new("_demo")
            .with_field("answer", false, answer_getter)
            .with_function("double", false, double_native);
        vm.register_native_module(def);

        let result = vm.interpret(
            "import _demo\necho _demo.answer\necho _demo.double(21)\n",
            "native_import_test.em",
        );
        assert_eq!(result, crate::vm::InterpretResult::Ok);
        assert_eq!(vm.take_output(), "42\n42\n");
    }
}
