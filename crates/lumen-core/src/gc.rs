//! gc.rs — tri-color mark-sweep collector (spec.md §4.1).
//!
//! Roots are passed in by the caller (`lumen-vm` knows about `allModules`,
//! the temp-root stack, the current thread; `lumen-compiler` knows about
//! the active `CompileUnit` chain) — `lumen-core` only owns the mechanism,
//! not the policy of what counts as a root. This keeps the GC crate free of
//! a dependency on either of its clients.

use crate::heap::{Heap, ObjData, ObjRef};
use crate::value::Value;

/// Outcome of one collection cycle, surfaced for the `tracing::debug!`
/// ambient log line.
#[derive(Debug, Clone, Copy)]
pub struct GcStats {
    pub freed: usize,
    pub survivors: usize,
    pub allocated_bytes: usize,
    pub next_gc: usize,
}

/// Run one full mark-sweep cycle rooted on `roots`.
///
/// Implements spec.md §4.1's five steps: reset the byte counter, gray every
/// root, drain the gray work list (blackening each object and re-accruing
/// its footprint into `allocated_bytes`), sweep unmarked objects, and
/// recompute `next_gc`.
pub fn collect(heap: &mut Heap, roots: &[ObjRef]) -> GcStats {
    heap.allocated_bytes = 0;

    let mut worklist: Vec<ObjRef> = Vec::new();
    for &r in roots {
        if heap.mark(r) {
            worklist.push(r);
        }
    }

    while let Some(r) = worklist.pop() {
        if let Some(size) = blacken(heap, r, &mut worklist) {
            heap.allocated_bytes += size;
        }
    }

    let freed = heap.sweep();
    heap.next_gc = (heap.allocated_bytes * heap.heap_growth_factor).max(heap.min_heap_size);

    tracing::debug!(
        target: "lumen_core::gc",
        freed,
        survivors = heap.live_count(),
        allocated_bytes = heap.allocated_bytes,
        next_gc = heap.next_gc,
        "collection finished"
    );

    GcStats {
        freed,
        survivors: heap.live_count(),
        allocated_bytes: heap.allocated_bytes,
        next_gc: heap.next_gc,
    }
}

fn gray(heap: &mut Heap, r: ObjRef, worklist: &mut Vec<ObjRef>) {
    if heap.mark(r) {
        worklist.push(r);
    }
}

fn gray_value(heap: &mut Heap, v: Value, worklist: &mut Vec<ObjRef>) {
    if let Value::Obj(r) = v {
        gray(heap, r, worklist);
    }
}

/// Blacken one object: gray every object it references, and return its own
/// byte footprint (to be folded into `allocated_bytes`), or `None` if the
/// handle is already dead (shouldn't happen mid-mark, but handles are
/// fallible by construction).
fn blacken(heap: &mut Heap, r: ObjRef, worklist: &mut Vec<ObjRef>) -> Option<usize> {
    let class = heap.class_of(r);
    if let Some(c) = class {
        gray(heap, c, worklist);
    }

    // Clone out just the referenced handles/values so we don't hold a
    // borrow of `heap` while recursively marking through it.
    enum Edges {
        Class { metaclass: Option<ObjRef>, superclass: Option<ObjRef>, name: ObjRef, methods: Vec<ObjRef> },
        Closure { function: ObjRef, upvalues: Vec<ObjRef> },
        Thread { frames: Vec<ObjRef>, stack: Vec<Value>, open_upvalues: Vec<ObjRef>, caller: Option<ObjRef>, error_obj: Option<Value> },
        Fn { constants: Vec<Value> },
        Instance { fields: Vec<Value> },
        List { elements: Vec<Value> },
        Map { entries: Vec<(Value, Value)> },
        Module { vars: Vec<Value> },
        Upvalue { closed: Option<Value> },
        Leaf,
    }

    let data = heap.get(r)?;
    let size = data.approx_size();
    let edges = match data {
        ObjData::Class(c) => Edges::Class {
            metaclass: c.metaclass,
            superclass: c.superclass,
            name: c.name,
            methods: c
                .methods
                .iter()
                .filter_map(|(_, m)| match m {
                    crate::class_obj::Method::Script(closure) => Some(*closure),
                    _ => None,
                })
                .collect(),
        },
        ObjData::Closure(c) => Edges::Closure { function: c.function, upvalues: c.upvalues.clone() },
        ObjData::Thread(t) => Edges::Thread {
            frames: t.frames.iter().map(|f| f.closure).collect(),
            stack: t.stack.clone(),
            open_upvalues: t.open_upvalues.iter().map(|(_, u)| *u).collect(),
            caller: t.caller,
            error_obj: t.error_obj,
        },
        ObjData::Fn(f) => Edges::Fn { constants: f.constants.clone() },
        ObjData::Instance(i) => Edges::Instance { fields: i.fields.clone() },
        ObjData::List(l) => Edges::List { elements: l.elements.clone() },
        ObjData::Map(m) => Edges::Map { entries: m.entries().map(|(k, v)| (*k, *v)).collect() },
        ObjData::Module(m) => Edges::Module { vars: m.vars.iter().map(|v| v.value).collect() },
        ObjData::Upvalue(u) => Edges::Upvalue {
            closed: match u.state {
                crate::func_obj::UpvalueState::Closed(v) => Some(v),
                crate::func_obj::UpvalueState::Open { .. } => None,
            },
        },
        ObjData::Range(_) | ObjData::String(_) | ObjData::Free => Edges::Leaf,
    };

    match edges {
        Edges::Class { metaclass, superclass, name, methods } => {
            if let Some(m) = metaclass {
                gray(heap, m, worklist);
            }
            if let Some(s) = superclass {
                gray(heap, s, worklist);
            }
            gray(heap, name, worklist);
            for m in methods {
                gray(heap, m, worklist);
            }
        }
        Edges::Closure { function, upvalues } => {
            gray(heap, function, worklist);
            for u in upvalues {
                gray(heap, u, worklist);
            }
        }
        Edges::Thread { frames, stack, open_upvalues, caller, error_obj } => {
            for f in frames {
                gray(heap, f, worklist);
            }
            for v in stack {
                gray_value(heap, v, worklist);
            }
            for u in open_upvalues {
                gray(heap, u, worklist);
            }
            if let Some(c) = caller {
                gray(heap, c, worklist);
            }
            if let Some(e) = error_obj {
                gray_value(heap, e, worklist);
            }
        }
        Edges::Fn { constants } => {
            for c in constants {
                gray_value(heap, c, worklist);
            }
        }
        Edges::Instance { fields } => {
            for v in fields {
                gray_value(heap, v, worklist);
            }
        }
        Edges::List { elements } => {
            for v in elements {
                gray_value(heap, v, worklist);
            }
        }
        Edges::Map { entries } => {
            for (k, v) in entries {
                gray_value(heap, k, worklist);
                gray_value(heap, v, worklist);
            }
        }
        Edges::Module { vars } => {
            for v in vars {
                gray_value(heap, v, worklist);
            }
        }
        Edges::Upvalue { closed } => {
            if let Some(v) = closed {
                gray_value(heap, v, worklist);
            }
        }
        Edges::Leaf => {}
    }

    Some(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::ObjData;
    use crate::string_obj::LString;

    #[test]
    fn unreachable_objects_are_freed() {
        let mut heap = Heap::new();
        let (root, _) = heap.manage(ObjData::String(LString::new("root")), None);
        let (_garbage, _) = heap.manage(ObjData::String(LString::new("garbage")), None);
        assert_eq!(heap.live_count(), 2);
        let stats = collect(&mut heap, &[root]);
        assert_eq!(stats.freed, 1);
        assert_eq!(heap.live_count(), 1);
        assert!(heap.get(root).is_some());
    }

    #[test]
    fn reachable_via_list_survives() {
        let mut heap = Heap::new();
        let (elem, _) = heap.manage(ObjData::String(LString::new("elem")), None);
        let mut list = crate::collection_obj::List::new();
        list.elements.push(Value::Obj(elem));
        let (list_ref, _) = heap.manage(ObjData::List(list), None);
        let stats = collect(&mut heap, &[list_ref]);
        assert_eq!(stats.freed, 0);
        assert!(heap.get(elem).is_some());
    }
}
