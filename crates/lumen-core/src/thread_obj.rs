//! thread_obj.rs — `ObjThread` and `Frame` (spec.md §3, §4.3, §5).
//!
//! A thread is a fiber: its own value stack (grows upward), its own frame
//! stack, a list of open upvalues sorted by strictly descending stack slot,
//! and a `caller` link used to resume the thread that `.call`ed into it.

use crate::heap::ObjRef;
use crate::value::Value;

/// One call-activation record (spec.md §3): the running closure, the
/// instruction pointer into its `ObjFn::code`, and the base slot of this
/// call's slice of the thread's value stack (slot 0 = receiver/`this`).
#[derive(Clone, Copy)]
pub struct Frame {
    pub closure: ObjRef,
    pub ip: usize,
    pub stack_start: usize,
}

/// `ObjThread`. `stack`/`frames` double in power-of-two steps on growth
/// (spec.md §3 invariant); growing the stack must rewrite every frame's
/// `stack_start` and every open upvalue's slot by the same delta if the
/// backing `Vec` relocates — `Vec::reserve`-based growth in safe Rust never
/// needs this in practice (indices stay valid across the grow), but the
/// bookkeeping fields exist to keep the data model honest to spec.md §4.3's
/// "relocation delta" language; see `lumen-vm`'s `ensure_stack_capacity`.
pub struct Thread {
    pub stack: Vec<Value>,
    pub frames: Vec<Frame>,
    /// Open upvalues, strictly descending by `slot` (spec.md §3 invariant,
    /// tested in property §8.4). Each entry is `(slot, upvalue_ref)`.
    pub open_upvalues: Vec<(usize, ObjRef)>,
    /// The thread that `.call`ed into this one, if any (spec.md §4.3).
    pub caller: Option<ObjRef>,
    /// Non-null (`Some`) means this thread aborted with this error value.
    pub error_obj: Option<Value>,
}

impl Thread {
    pub fn new(initial_closure: ObjRef) -> Self {
        let mut stack = Vec::with_capacity(256);
        stack.push(Value::Null); // slot 0: receiver placeholder for a bare fn
        Self {
            stack,
            frames: vec![Frame { closure: initial_closure, ip: 0, stack_start: 0 }],
            open_upvalues: Vec::new(),
            caller: None,
            error_obj: None,
        }
    }

    pub fn esp(&self) -> usize {
        self.stack.len()
    }

    pub fn push(&mut self, v: Value) {
        self.stack.push(v);
    }

    pub fn pop(&mut self) -> Value {
        self.stack.pop().expect("thread stack underflow")
    }

    pub fn peek(&self) -> Value {
        *self.stack.last().expect("thread stack is empty")
    }

    pub fn is_done(&self) -> bool {
        self.frames.is_empty() || self.error_obj.is_some()
    }

    /// Insert `(slot, upvalue)` keeping the descending-by-slot invariant,
    /// returning `Err(existing)` if one for this slot is already open
    /// (spec.md §4.3's "find-or-insert").
    pub fn insert_open_upvalue(&mut self, slot: usize, upvalue: ObjRef) -> Result<(), ObjRef> {
        let pos = self.open_upvalues.partition_point(|(s, _)| *s > slot);
        if let Some(&(s, existing)) = self.open_upvalues.get(pos) {
            if s == slot {
                return Err(existing);
            }
        }
        self.open_upvalues.insert(pos, (slot, upvalue));
        Ok(())
    }

    pub fn find_open_upvalue(&self, slot: usize) -> Option<ObjRef> {
        let pos = self.open_upvalues.partition_point(|(s, _)| *s > slot);
        self.open_upvalues
            .get(pos)
            .filter(|(s, _)| *s == slot)
            .map(|(_, r)| *r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;

    fn dummy_ref(heap: &mut Heap) -> ObjRef {
        use crate::heap::ObjData;
        use crate::string_obj::LString;
        heap.manage(ObjData::String(LString::new("x")), None).0
    }

    #[test]
    fn open_upvalues_stay_descending_and_unique() {
        let mut heap = Heap::new();
        let mut t = Thread::new(dummy_ref(&mut heap));
        let u1 = dummy_ref(&mut heap);
        let u2 = dummy_ref(&mut heap);
        let u3 = dummy_ref(&mut heap);
        t.insert_open_upvalue(5, u1).unwrap();
        t.insert_open_upvalue(2, u2).unwrap();
        t.insert_open_upvalue(8, u3).unwrap();
        let slots: Vec<usize> = t.open_upvalues.iter().map(|(s, _)| *s).collect();
        assert_eq!(slots, vec![8, 5, 2]);
        assert!(t.insert_open_upvalue(5, u1).is_err());
        assert_eq!(t.find_open_upvalue(5), Some(u1));
        assert_eq!(t.find_open_upvalue(99), None);
    }
}
