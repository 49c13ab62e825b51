//! class_obj.rs — `Class` and its method table (spec.md §3).
//!
//! A method table is indexed by the globally interned method-name symbol
//! (see `symbol::SymbolTable`) and padded with [`Method::None`] so that
//! every method id is valid in every class, exactly as spec.md requires.

use crate::heap::ObjRef;
use crate::op::MethodId;
use crate::value::Value;

/// One method-table slot. The VM must never call through a `None` slot
/// (spec.md §9's dynamic-dispatch note).
#[derive(Clone)]
pub enum Method {
    /// Empty slot: neither this class nor any ancestor defines it.
    None,
    /// A native function: `(vm_state, args) -> bool`. Represented here as
    /// an index into the VM's primitive table rather than a function
    /// pointer, so `Class`/`Method` stay `Send`-agnostic free of any VM
    /// dependency (`lumen-core` does not depend on `lumen-vm`).
    Primitive(u32),
    /// A user-defined method: the closure to invoke.
    Script(ObjRef),
    /// Marker used for `Fn.call(...)` overloads: invoke the receiver
    /// closure itself with the given arity, enforcing `argc >= fn.arity`.
    FnCall,
}

impl Method {
    pub fn is_none(&self) -> bool {
        matches!(self, Method::None)
    }
}

/// Method table: dense `Vec` indexed directly by `MethodId`, padded with
/// `Method::None`.
#[derive(Clone, Default)]
pub struct MethodTable {
    slots: Vec<Method>,
}

impl MethodTable {
    pub fn get(&self, id: MethodId) -> &Method {
        self.slots.get(id as usize).unwrap_or(&Method::None)
    }

    pub fn set(&mut self, id: MethodId, method: Method) {
        let idx = id as usize;
        if idx >= self.slots.len() {
            self.slots.resize_with(idx + 1, || Method::None);
        }
        self.slots[idx] = method;
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (MethodId, &Method)> {
        self.slots
            .iter()
            .enumerate()
            .map(|(i, m)| (i as MethodId, m))
    }
}

/// `Class` (spec.md §3): name, optional superclass, own+inherited field
/// count, method table, and a pointer to its metaclass. `class_of_class` is
/// its own metaclass, anchoring the `Class`/`Metaclass` cycle.
pub struct Class {
    pub name: ObjRef,
    pub superclass: Option<ObjRef>,
    pub field_count: u16,
    pub methods: MethodTable,
    pub metaclass: Option<ObjRef>,
    /// Static ("class-level") fields live as synthesized module variables
    /// (`"Cls " + name + " " + field`) rather than in the class object
    /// itself — spec.md §4.2's variable-resolution step 5. Kept here only
    /// as a debug aid listing which names were synthesized.
    pub static_field_names: Vec<String>,
}

impl Class {
    pub fn new(name: ObjRef, superclass: Option<ObjRef>, field_count: u16) -> Self {
        Self {
            name,
            superclass,
            field_count,
            methods: MethodTable::default(),
            metaclass: None,
            static_field_names: Vec::new(),
        }
    }
}

/// A module-level value, used when a synthesized static field is read
/// before assignment (mirrors the module variable's `Value::Null`
/// default).
pub const DEFAULT_STATIC_FIELD: Value = Value::Null;
