//! core_lib.rs — resolving the bootstrapped `core.lm` classes and binding
//! every declared signature to its native primitive (spec.md §4.4).
//!
//! The two-step split mirrors the teacher's own `wren_core.wren` +
//! `wrenInitializeCore`: the language declares the *shape* of every
//! built-in method, this module binds its *behavior*.

use lumen_core::class_obj::Method;
use lumen_core::heap::{Heap, ObjData};
use lumen_core::{Error, ObjRef, Result};
use lumen_compiler::Signature;

use crate::primitives;
use crate::Vm;

pub(crate) const CORE_SOURCE: &str = include_str!("core.lm");

/// Handles to every built-in class, resolved once `core.lm` has finished
/// declaring them (spec.md §3's built-in type list).
#[derive(Clone, Copy)]
pub struct CoreClasses {
    pub object_class: ObjRef,
    pub class_class: ObjRef,
    pub bool_class: ObjRef,
    pub num_class: ObjRef,
    pub null_class: ObjRef,
    pub string_class: ObjRef,
    pub list_class: ObjRef,
    pub map_class: ObjRef,
    pub range_class: ObjRef,
    pub fn_class: ObjRef,
    pub thread_class: ObjRef,
    pub system_class: ObjRef,
}

impl CoreClasses {
    /// Every field pointing at the same dummy ref, used only while
    /// `core.lm`'s own bootstrap thread is running: its bodies are all
    /// empty stubs (`{}`, i.e. `PushNull; Return`), so no `Call`/`Super`
    /// op ever dereferences `self.classes` as the wrong type during that
    /// run.
    pub(crate) fn placeholder(r: ObjRef) -> Self {
        Self {
            object_class: r,
            class_class: r,
            bool_class: r,
            num_class: r,
            null_class: r,
            string_class: r,
            list_class: r,
            map_class: r,
            range_class: r,
            fn_class: r,
            thread_class: r,
            system_class: r,
        }
    }
}

fn find_class(heap: &Heap, core_module: ObjRef, name: &str) -> Result<ObjRef> {
    let ObjData::Module(module) = heap.get(core_module).expect("core module") else {
        panic!("core_module ref is not a Module");
    };
    let idx = module
        .find_var(name)
        .ok_or_else(|| Error::Runtime(format!("core.lm never declared `{name}`")))?;
    match module.get(idx) {
        lumen_core::Value::Obj(r) => Ok(r),
        _ => Err(Error::Runtime(format!("core.lm's `{name}` is not a class"))),
    }
}

pub(crate) fn resolve_core_classes(heap: &Heap, core_module: ObjRef) -> Result<CoreClasses> {
    Ok(CoreClasses {
        object_class: find_class(heap, core_module, "Object")?,
        class_class: find_class(heap, core_module, "Class")?,
        bool_class: find_class(heap, core_module, "Bool")?,
        num_class: find_class(heap, core_module, "Num")?,
        null_class: find_class(heap, core_module, "Null")?,
        string_class: find_class(heap, core_module, "String")?,
        list_class: find_class(heap, core_module, "List")?,
        map_class: find_class(heap, core_module, "Map")?,
        range_class: find_class(heap, core_module, "Range")?,
        fn_class: find_class(heap, core_module, "Fn")?,
        thread_class: find_class(heap, core_module, "Thread")?,
        system_class: find_class(heap, core_module, "System")?,
    })
}

/// Push `f` onto `vm.primitives` and bind `sig` on `class`'s own method
/// table (the instance side).
fn bind(vm: &mut Vm, class: ObjRef, sig: Signature, f: primitives::PrimFn) {
    let id = vm.methods.intern(&sig.render());
    let idx = vm.primitives.len() as u32;
    vm.primitives.push(f);
    let Some(ObjData::Class(c)) = vm.heap.get_mut(class) else {
        panic!("bind: not a class");
    };
    c.methods.set(id, Method::Primitive(idx));
}

/// Bind `sig` on `class`'s *metaclass* (the `static` side).
fn bind_static(vm: &mut Vm, class: ObjRef, sig: Signature, f: primitives::PrimFn) {
    let Some(ObjData::Class(c)) = vm.heap.get(class) else {
        panic!("bind_static: not a class");
    };
    let meta = c.metaclass.expect("every core class has a metaclass");
    bind(vm, meta, sig, f);
}

pub(crate) fn bind_primitives(vm: &mut Vm) {
    use primitives as p;

    let c = vm.classes;

    bind(vm, c.object_class, Signature::method("==", 1), p::object_eq);
    bind(vm, c.object_class, Signature::method("!=", 1), p::object_ne);
    bind(vm, c.object_class, Signature::getter("toString"), p::object_to_string);

    bind(vm, c.class_class, Signature::getter("name"), p::class_name);
    bind(vm, c.class_class, Signature::getter("toString"), p::class_to_string);

    bind(vm, c.bool_class, Signature::getter("toString"), p::bool_to_string);
    bind(vm, c.bool_class, Signature::getter("!"), p::bool_not);

    bind(vm, c.num_class, Signature::method("+", 1), p::num_add);
    bind(vm, c.num_class, Signature::method("-", 1), p::num_sub);
    bind(vm, c.num_class, Signature::method("*", 1), p::num_mul);
    bind(vm, c.num_class, Signature::method("/", 1), p::num_div);
    bind(vm, c.num_class, Signature::method("%", 1), p::num_mod);
    bind(vm, c.num_class, Signature::method("<", 1), p::num_lt);
    bind(vm, c.num_class, Signature::method("<=", 1), p::num_le);
    bind(vm, c.num_class, Signature::method(">", 1), p::num_gt);
    bind(vm, c.num_class, Signature::method(">=", 1), p::num_ge);
    bind(vm, c.num_class, Signature::method("==", 1), p::num_eq);
    bind(vm, c.num_class, Signature::method("!=", 1), p::num_ne);
    bind(vm, c.num_class, Signature::getter("-"), p::num_neg);
    bind(vm, c.num_class, Signature::method("..", 1), p::num_range_inclusive);
    bind(vm, c.num_class, Signature::method("...", 1), p::num_range_exclusive);
    bind(vm, c.num_class, Signature::getter("toString"), p::num_to_string);

    bind(vm, c.null_class, Signature::getter("toString"), p::null_to_string);

    bind(vm, c.string_class, Signature::method("+", 1), p::string_add);
    bind(vm, c.string_class, Signature::method("==", 1), p::string_eq);
    bind(vm, c.string_class, Signature::method("!=", 1), p::string_ne);
    bind(vm, c.string_class, Signature::subscript(1), p::string_index);
    bind(vm, c.string_class, Signature::getter("count"), p::string_count);
    bind(vm, c.string_class, Signature::getter("toString"), p::string_to_string);
    bind(vm, c.string_class, Signature::method("iterate", 1), p::string_iterate);
    bind(vm, c.string_class, Signature::method("iteratorValue", 1), p::string_iterator_value);

    bind(vm, c.list_class, Signature::method("add", 1), p::list_add);
    bind(vm, c.list_class, Signature::subscript(1), p::list_index);
    bind(vm, c.list_class, Signature::subscript_setter(1), p::list_index_set);
    bind(vm, c.list_class, Signature::getter("count"), p::list_count);
    bind(vm, c.list_class, Signature::getter("toString"), p::list_to_string);
    bind(vm, c.list_class, Signature::method("iterate", 1), p::list_iterate);
    bind(vm, c.list_class, Signature::method("iteratorValue", 1), p::list_iterator_value);

    bind(vm, c.map_class, Signature::subscript(1), p::map_index);
    bind(vm, c.map_class, Signature::subscript_setter(1), p::map_index_set);
    bind(vm, c.map_class, Signature::method("containsKey", 1), p::map_contains_key);
    bind(vm, c.map_class, Signature::method("remove", 1), p::map_remove);
    bind(vm, c.map_class, Signature::getter("count"), p::map_count);
    bind(vm, c.map_class, Signature::getter("toString"), p::map_to_string);
    bind(vm, c.map_class, Signature::method("iterate", 1), p::map_iterate);
    bind(vm, c.map_class, Signature::method("iteratorValue", 1), p::map_iterator_value);

    bind(vm, c.range_class, Signature::getter("from"), p::range_from);
    bind(vm, c.range_class, Signature::getter("to"), p::range_to);
    bind(vm, c.range_class, Signature::getter("toString"), p::range_to_string);
    bind(vm, c.range_class, Signature::method("iterate", 1), p::range_iterate);
    bind(vm, c.range_class, Signature::method("iteratorValue", 1), p::range_iterator_value);

    bind(vm, c.fn_class, Signature::getter("toString"), p::fn_to_string);
    // `Fn.call(...)` overloads aren't primitives: the interpreter's
    // `perform_call` already special-cases `Method::FnCall` to invoke the
    // receiver closure directly (spec.md §4.2's "calling a Fn" note).
    {
        let Some(ObjData::Class(fc)) = vm.heap.get_mut(c.fn_class) else { panic!("Fn is not a class") };
        for argc in 0..=16u8 {
            let id = vm.methods.intern(&Signature::method("call", argc).render());
            fc.methods.set(id, Method::FnCall);
        }
    }

    bind_static(vm, c.thread_class, Signature::method("new", 1), p::thread_new);
    bind_static(vm, c.thread_class, Signature::method("yield", 0), p::thread_yield0);
    bind_static(vm, c.thread_class, Signature::method("yield", 1), p::thread_yield1);
    bind_static(vm, c.thread_class, Signature::method("abort", 1), p::thread_abort);
    bind(vm, c.thread_class, Signature::method("call", 0), p::thread_call0);
    bind(vm, c.thread_class, Signature::method("call", 1), p::thread_call1);

    bind_static(vm, c.system_class, Signature::method("importModule", 1), p::system_import_module);
    bind_static(vm, c.system_class, Signature::method("getModuleVariable", 2), p::system_get_module_variable);
    bind_static(vm, c.system_class, Signature::method("writeString_", 1), p::system_write_string);
    bind_static(vm, c.system_class, Signature::getter("clock"), p::system_clock);
}
