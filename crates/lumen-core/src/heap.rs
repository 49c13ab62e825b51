//! heap.rs — the single allocation entry point and the object arena.
//!
//! Rather than the teacher's C ancestor (an intrusive linked list of raw
//! pointers), objects live in one generational arena: `ObjRef` is a
//! `(index, generation)` handle, never a raw pointer, so the workspace's
//! `unsafe_code = "forbid"` lint holds throughout. This is the "handles —
//! integer indices into a heap vector" alternative spec.md §9 explicitly
//! sanctions for a language with an ownership discipline like Rust's.
//!
//! `Heap::manage` is the sole place that tracks `allocated_bytes` and
//! compares it against `next_gc`, mirroring the C `manage(oldPtr, oldSize,
//! newSize)` entry point from spec.md §4.1.

use crate::class_obj::Class;
use crate::collection_obj::{List, Map, Range};
use crate::func_obj::{Closure, ObjFn, Upvalue};
use crate::instance_obj::Instance;
use crate::module_obj::Module;
use crate::string_obj::LString;
use crate::thread_obj::Thread;

/// A handle into the heap arena. Stable for the object's lifetime; becomes
/// dangling (and is rejected by [`Heap::get`]) once the object is swept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef {
    index: u32,
    generation: u32,
}

impl ObjRef {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Raw slot index. Exposed for the disassembler's debug output only.
    pub fn slot(&self) -> u32 {
        self.index
    }
}

/// The type tag every `Obj` header carries (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjKind {
    Class,
    List,
    Map,
    Module,
    Range,
    String,
    Upvalue,
    Fn,
    Closure,
    Instance,
    Thread,
}

/// The per-kind payload. One heap slot holds exactly one of these; the
/// discriminant *is* the spec's `ObjKind` tag.
pub enum ObjData {
    Class(Class),
    List(List),
    Map(Map),
    Module(Module),
    Range(Range),
    String(LString),
    Upvalue(Upvalue),
    Fn(ObjFn),
    Closure(Closure),
    Instance(Instance),
    Thread(Thread),
    /// Tombstone left behind by a sweep; the slot is on the free list and
    /// awaiting reuse with a bumped generation.
    Free,
}

impl ObjData {
    pub fn kind(&self) -> Option<ObjKind> {
        Some(match self {
            ObjData::Class(_) => ObjKind::Class,
            ObjData::List(_) => ObjKind::List,
            ObjData::Map(_) => ObjKind::Map,
            ObjData::Module(_) => ObjKind::Module,
            ObjData::Range(_) => ObjKind::Range,
            ObjData::String(_) => ObjKind::String,
            ObjData::Upvalue(_) => ObjKind::Upvalue,
            ObjData::Fn(_) => ObjKind::Fn,
            ObjData::Closure(_) => ObjKind::Closure,
            ObjData::Instance(_) => ObjKind::Instance,
            ObjData::Thread(_) => ObjKind::Thread,
            ObjData::Free => return None,
        })
    }

    /// Approximate byte footprint, fed into `allocated_bytes` accounting.
    pub fn approx_size(&self) -> usize {
        use std::mem::size_of_val;
        match self {
            ObjData::Class(c) => size_of_val(c) + c.methods.len() * 24,
            ObjData::List(l) => size_of_val(l) + l.elements.capacity() * 24,
            ObjData::Map(m) => size_of_val(m) + m.len() * 48,
            ObjData::Module(m) => size_of_val(m) + m.vars.len() * 40,
            ObjData::Range(r) => size_of_val(r),
            ObjData::String(s) => size_of_val(s) + s.bytes.len(),
            ObjData::Upvalue(u) => size_of_val(u),
            ObjData::Fn(f) => size_of_val(f) + f.code.len() + f.constants.len() * 24,
            ObjData::Closure(c) => size_of_val(c) + c.upvalues.len() * 8,
            ObjData::Instance(i) => size_of_val(i) + i.fields.len() * 24,
            ObjData::Thread(t) => size_of_val(t) + t.stack.capacity() * 24 + t.frames.capacity() * 32,
            ObjData::Free => 0,
        }
    }
}

struct Slot {
    data: ObjData,
    class: Option<ObjRef>,
    marked: bool,
    generation: u32,
}

/// The object arena plus the memory-manager bookkeeping from spec.md §4.1.
pub struct Heap {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
    /// Recomputed as "bytes reachable" at the end of every collection, per
    /// spec.md step 1 ("reset to 0, recomputed during marking").
    pub allocated_bytes: usize,
    /// Threshold that triggers the next collection.
    pub next_gc: usize,
    pub heap_growth_factor: usize,
    pub min_heap_size: usize,
    /// Gate used by the compiler to disable GC before the core module and
    /// the parser it depends on are fully bootstrapped (spec.md §4.1).
    pub gc_enabled: bool,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            allocated_bytes: 0,
            next_gc: 1024 * 1024,
            heap_growth_factor: 2,
            min_heap_size: 1024 * 1024,
            gc_enabled: true,
        }
    }

    /// The single allocation entry point. Returns the new object's handle
    /// and whether the caller should now run a collection. The returned
    /// handle is not yet reachable from any root: the caller must pin it
    /// (push it onto `Vm`'s temporary-root stack) before doing anything
    /// that might allocate again, and unpin it once it's stored somewhere
    /// reachable. See `Vm::manage_rooted`/`Vm::unpin` in `lumen-vm`.
    pub fn manage(&mut self, data: ObjData, class: Option<ObjRef>) -> (ObjRef, bool) {
        let size = data.approx_size();
        self.allocated_bytes += size;
        let reference = if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            slot.data = data;
            slot.class = class;
            slot.marked = false;
            slot.generation = slot.generation.wrapping_add(1);
            ObjRef::new(index, slot.generation)
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot { data, class, marked: false, generation: 0 });
            ObjRef::new(index, 0)
        };
        let should_collect = self.gc_enabled && self.allocated_bytes > self.next_gc;
        (reference, should_collect)
    }

    pub fn get(&self, r: ObjRef) -> Option<&ObjData> {
        self.slots
            .get(r.index as usize)
            .filter(|s| s.generation == r.generation)
            .map(|s| &s.data)
    }

    pub fn get_mut(&mut self, r: ObjRef) -> Option<&mut ObjData> {
        self.slots
            .get_mut(r.index as usize)
            .filter(|s| s.generation == r.generation)
            .map(|s| &mut s.data)
    }

    pub fn class_of(&self, r: ObjRef) -> Option<ObjRef> {
        self.slots
            .get(r.index as usize)
            .filter(|s| s.generation == r.generation)
            .and_then(|s| s.class)
    }

    pub fn set_class(&mut self, r: ObjRef, class: ObjRef) {
        if let Some(s) = self.slots.get_mut(r.index as usize) {
            if s.generation == r.generation {
                s.class = Some(class);
            }
        }
    }

    pub(crate) fn mark(&mut self, r: ObjRef) -> bool {
        if let Some(s) = self.slots.get_mut(r.index as usize) {
            if s.generation == r.generation && !s.marked {
                s.marked = true;
                return true;
            }
        }
        false
    }

    pub(crate) fn is_marked(&self, r: ObjRef) -> bool {
        self.slots
            .get(r.index as usize)
            .map(|s| s.marked)
            .unwrap_or(false)
    }

    /// Sweep every unmarked slot, clear the mark bit on survivors. Returns
    /// the number of objects freed.
    pub(crate) fn sweep(&mut self) -> usize {
        let mut freed = 0;
        for index in 0..self.slots.len() {
            let slot = &mut self.slots[index];
            if matches!(slot.data, ObjData::Free) {
                continue;
            }
            if slot.marked {
                slot.marked = false;
            } else {
                slot.data = ObjData::Free;
                slot.class = None;
                self.free_list.push(index as u32);
                freed += 1;
            }
        }
        freed
    }

    pub fn live_count(&self) -> usize {
        self.slots.len() - self.free_list.len()
    }

    pub(crate) fn iter_refs(&self) -> impl Iterator<Item = ObjRef> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            if matches!(s.data, ObjData::Free) {
                None
            } else {
                Some(ObjRef::new(i as u32, s.generation))
            }
        })
    }
}
