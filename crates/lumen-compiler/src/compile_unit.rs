//! compile_unit.rs — per-function compile-time state (spec.md §4.2, §3's
//! `ClassBookKeep`).

use lumen_core::func_obj::UpvalueDesc;
use lumen_core::ObjFn;

pub const MAX_LOCALS: usize = 128;
pub const MAX_UPVALUES: usize = 128;
pub const MAX_FIELDS: usize = 128;

/// `-1` is module scope; `0` is a function/method's top-level block.
pub type ScopeDepth = i32;
pub const MODULE_SCOPE: ScopeDepth = -1;

pub struct Local {
    pub name: String,
    pub depth: ScopeDepth,
    pub is_captured: bool,
}

/// Loop bookkeeping (spec.md §4.2 `break`/`continue`). `body_start` anchors
/// the scan-for-`End`-sentinels patch performed at loop exit.
pub struct LoopCtx {
    pub cond_start: usize,
    pub body_start: usize,
    pub scope_depth: ScopeDepth,
    pub enclosing: Option<Box<LoopCtx>>,
}

/// Compile-time state tracked while a `class` body is being compiled
/// (spec.md §3's `ClassBookKeep`).
#[derive(Default)]
pub struct ClassBookKeep {
    pub name: String,
    pub fields: Vec<String>,
    pub in_static: bool,
    pub instance_methods: Vec<u16>,
    pub static_methods: Vec<u16>,
    pub current_signature: Option<crate::signature::Signature>,
}

impl ClassBookKeep {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    pub fn field_index(&mut self, name: &str) -> Result<u16, String> {
        if let Some(i) = self.fields.iter().position(|f| f == name) {
            return Ok(i as u16);
        }
        if self.fields.len() >= MAX_FIELDS {
            return Err(format!("too many fields in class {}", self.name));
        }
        self.fields.push(name.to_string());
        Ok((self.fields.len() - 1) as u16)
    }
}

/// Per-function compile unit (spec.md §4.2). `function` accumulates bytecode
/// directly — there is no intermediate AST, matching the single-pass design.
pub struct CompileUnit {
    pub function: ObjFn,
    pub locals: Vec<Local>,
    pub upvalues: Vec<UpvalueDesc>,
    pub upvalue_names: Vec<String>,
    pub scope_depth: ScopeDepth,
    pub loop_ctx: Option<Box<LoopCtx>>,
    /// High-watermark of concurrently-live stack slots, fed by the emitter's
    /// per-opcode slot-effect simulation.
    pub max_slots: u16,
    pub current_slots: i32,
}

impl CompileUnit {
    pub fn new(function: ObjFn, is_method: bool) -> Self {
        // Slot 0 is always the receiver/`this` (spec.md §4.2's reserved
        // first local), present whether or not the function is a method.
        let locals = vec![Local {
            name: if is_method { "this".to_string() } else { String::new() },
            depth: 0,
            is_captured: false,
        }];
        Self {
            function,
            locals,
            upvalues: Vec::new(),
            upvalue_names: Vec::new(),
            scope_depth: 0,
            loop_ctx: None,
            max_slots: 1,
            current_slots: 1,
        }
    }

    pub fn new_module_unit(function: ObjFn) -> Self {
        let mut u = Self::new(function, false);
        u.scope_depth = MODULE_SCOPE;
        u
    }

    pub fn resolve_local(&self, name: &str) -> Option<u16> {
        self.locals.iter().rposition(|l| l.name == name).map(|i| i as u16)
    }

    pub fn add_local(&mut self, name: impl Into<String>) -> Result<u16, String> {
        if self.locals.len() >= MAX_LOCALS {
            return Err("too many local variables in one function".to_string());
        }
        let name = name.into();
        self.locals.push(Local { name, depth: self.scope_depth, is_captured: false });
        Ok((self.locals.len() - 1) as u16)
    }

    /// Find-or-add an upvalue descriptor, deduplicating by its resolved
    /// edge (spec.md §4.2 "Upvalue capture").
    pub fn add_upvalue(&mut self, is_enclosing_local: bool, index: u16) -> Result<u16, String> {
        for (i, existing) in self.upvalues.iter().enumerate() {
            if existing.is_enclosing_local == is_enclosing_local && existing.index == index {
                return Ok(i as u16);
            }
        }
        if self.upvalues.len() >= MAX_UPVALUES {
            return Err("too many upvalues in one function".to_string());
        }
        self.upvalues.push(UpvalueDesc { is_enclosing_local, index });
        self.upvalue_names.push(String::new());
        Ok((self.upvalues.len() - 1) as u16)
    }

    pub fn note_stack_effect(&mut self, delta: i32) {
        self.current_slots += delta;
        if self.current_slots > self.max_slots as i32 {
            self.max_slots = self.current_slots as u16;
        }
    }
}
