//! func_obj.rs — `ObjFn`, `ObjClosure`, `ObjUpvalue` (spec.md §3, §4.2, §4.3).

use crate::heap::ObjRef;
use crate::op::Op;
use crate::value::Value;

/// `ObjFn`: the immutable, compiled function body. Instruction stream,
/// constant pool, and the metadata the VM needs to size a call frame.
pub struct ObjFn {
    pub code: Vec<Op>,
    /// Parallel debug line-number vector (one entry per `code` index),
    /// present unless the chunk was compiled `stripped`.
    pub lines: Vec<u32>,
    pub constants: Vec<Value>,
    /// High-watermark of stack slots this function's body ever uses,
    /// computed by the compiler's per-opcode slot-effect simulation
    /// (spec.md §4.2 "Emission"). The VM uses it to ensure stack capacity
    /// before pushing a frame for this function.
    pub max_stack_slots_used: u16,
    pub arity: u8,
    pub upvalue_count: u16,
    pub module: ObjRef,
    /// Debug name (method signature or `<fn>` for anonymous/toplevel).
    pub debug_name: String,
}

impl ObjFn {
    pub fn new(module: ObjRef, debug_name: impl Into<String>) -> Self {
        Self {
            code: Vec::new(),
            lines: Vec::new(),
            constants: Vec::new(),
            max_stack_slots_used: 0,
            arity: 0,
            upvalue_count: 0,
            module,
            debug_name: debug_name.into(),
        }
    }

    pub fn push_op(&mut self, op: Op, line: u32) -> usize {
        let pc = self.code.len();
        self.code.push(op);
        self.lines.push(line);
        pc
    }

    pub fn add_constant(&mut self, v: Value) -> u16 {
        // No de-dup: constants are emitted once per literal site, matching
        // the teacher's `ConstPool` before its string interning layer —
        // interning here would require `Value: Eq`, which `Num(f64)` isn't.
        let idx = self.constants.len();
        self.constants.push(v);
        idx as u16
    }
}

/// One declared upvalue descriptor, recorded on the *capturing* function so
/// `CREATE_CLOSURE` knows how to wire it at runtime (spec.md §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpvalueDesc {
    pub is_enclosing_local: bool,
    pub index: u16,
}

/// `ObjClosure`: an `ObjFn` plus one resolved upvalue handle per declared
/// upvalue.
pub struct Closure {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

impl Closure {
    pub fn new(function: ObjRef, upvalues: Vec<ObjRef>) -> Self {
        Self { function, upvalues }
    }
}

/// The open/closed duality as a sum type (spec.md §9: "implementations
/// should avoid representing it as a mutable pointer-plus-inline-value
/// pair... in favor of a variant whose transition is a move").
#[derive(Debug, Clone, Copy)]
pub enum UpvalueState {
    /// Still live on some thread's stack, at absolute slot index `slot`.
    Open { thread: ObjRef, slot: usize },
    /// The owning stack slot left scope; the value has been moved inline.
    Closed(Value),
}

/// `ObjUpvalue`. `close` is a one-way transition, enforced by consuming
/// `self` having already matched `Open`.
pub struct Upvalue {
    pub state: UpvalueState,
}

impl Upvalue {
    pub fn new_open(thread: ObjRef, slot: usize) -> Self {
        Self { state: UpvalueState::Open { thread, slot } }
    }

    pub fn slot(&self) -> Option<usize> {
        match self.state {
            UpvalueState::Open { slot, .. } => Some(slot),
            UpvalueState::Closed(_) => None,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, UpvalueState::Open { .. })
    }

    pub fn close(&mut self, value: Value) {
        debug_assert!(self.is_open(), "upvalue closed twice");
        self.state = UpvalueState::Closed(value);
    }
}
