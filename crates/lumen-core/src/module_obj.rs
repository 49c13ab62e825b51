//! module_obj.rs — `ObjModule` (spec.md §3, §4.2).
//!
//! Module variables live in two parallel arrays (name, value) and are
//! addressed by index directly from `LOAD_MODULE_VAR`/`STORE_MODULE_VAR`
//! operands — once assigned, an index is stable for the module's lifetime.

use crate::heap::ObjRef;
use crate::value::Value;
use std::collections::HashMap;

pub struct ModuleVar {
    pub name: String,
    pub value: Value,
}

pub struct Module {
    /// `None` for the core module (spec.md §4.4).
    pub name: Option<String>,
    pub vars: Vec<ModuleVar>,
    name_to_index: HashMap<String, u16>,
}

impl Module {
    pub fn new(name: Option<String>) -> Self {
        Self { name, vars: Vec::new(), name_to_index: HashMap::new() }
    }

    pub fn find_var(&self, name: &str) -> Option<u16> {
        self.name_to_index.get(name).copied()
    }

    /// Declare a new module variable, or return the existing index if
    /// already declared (callers enforce the "reject redefinition unless
    /// pending" rule themselves — see `lumen_compiler`'s module scope).
    pub fn declare(&mut self, name: &str, value: Value) -> u16 {
        if let Some(&idx) = self.name_to_index.get(name) {
            return idx;
        }
        let idx = self.vars.len() as u16;
        self.vars.push(ModuleVar { name: name.to_string(), value });
        self.name_to_index.insert(name.to_string(), idx);
        idx
    }

    pub fn get(&self, idx: u16) -> Value {
        self.vars.get(idx as usize).map(|v| v.value).unwrap_or(Value::Null)
    }

    pub fn set(&mut self, idx: u16, value: Value) {
        if let Some(v) = self.vars.get_mut(idx as usize) {
            v.value = value;
        }
    }

    pub fn references_object(&self, _r: ObjRef) -> bool {
        false
    }
}
