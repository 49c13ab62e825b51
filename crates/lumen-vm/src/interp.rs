//! interp.rs — the threaded dispatch loop: `step`, method lookup, call/
//! return, class creation and the super-placeholder patch (spec.md §4.3).
//!
//! One `step()` executes exactly one `Op`. `run_thread` drives `step()`
//! until the thread it was asked to run has either unwound completely or
//! handed control to an error; fiber switches (`Thread.call`/`.yield`) move
//! `Vm::cur_thread` out from under a single `run_thread` call without ever
//! recursing into a second one — recursion only happens for `import`
//! (`System.importModule`), which genuinely needs a nested, independent run
//! to finish before the importing primitive can return.

use lumen_core::class_obj::Method;
use lumen_core::collection_obj::List as ListObj;
use lumen_core::collection_obj::Map as MapObj;
use lumen_core::heap::{ObjData, ObjRef};
use lumen_core::instance_obj::Instance;
use lumen_core::op::{MethodId, Op};
use lumen_core::string_obj::LString;
use lumen_core::{Class, Closure, Error, Result, Thread, Value};

use crate::Vm;

/// What a native primitive left behind for the interpreter to act on
/// (spec.md §4.4, §5's fiber-switch note).
pub enum PrimOutcome {
    /// The primitive wrote its result into `stack[args_base]`; the
    /// interpreter truncates the call's argument window down to just that
    /// slot.
    Ok,
    /// The primitive wants to raise a runtime error with this value.
    Error(Value),
    /// The primitive already reassigned `vm.cur_thread` itself (a fiber
    /// switch); the interpreter must not touch the stack and should simply
    /// keep looping, now reading from the new current thread.
    Switch,
    /// The root fiber `.yield`ed with no caller to resume: treat this
    /// value as that thread's final result and stop it.
    Halt(Value),
}

impl Vm {
    pub(crate) fn thread(&self, r: ObjRef) -> &Thread {
        match self.heap.get(r) {
            Some(ObjData::Thread(t)) => t,
            _ => panic!("dangling thread reference"),
        }
    }

    pub(crate) fn thread_mut(&mut self, r: ObjRef) -> &mut Thread {
        match self.heap.get_mut(r) {
            Some(ObjData::Thread(t)) => t,
            _ => panic!("dangling thread reference"),
        }
    }

    fn class(&self, r: ObjRef) -> &Class {
        match self.heap.get(r) {
            Some(ObjData::Class(c)) => c,
            _ => panic!("expected a class object"),
        }
    }

    fn closure(&self, r: ObjRef) -> &Closure {
        match self.heap.get(r) {
            Some(ObjData::Closure(c)) => c,
            _ => panic!("expected a closure object"),
        }
    }

    pub(crate) fn maybe_collect(&mut self, should: bool) {
        if !should {
            return;
        }
        let roots = self.gc_roots();
        let stats = lumen_core::gc::collect(&mut self.heap, &roots);
        tracing::trace!(freed = stats.freed, survivors = stats.survivors, "gc pass");
    }

    fn gc_roots(&self) -> Vec<ObjRef> {
        let mut roots = vec![self.core_module, self.cur_thread];
        roots.extend(self.modules.values().copied());
        roots.extend(self.temp_roots.iter().copied());
        roots
    }

    /// Push `r` onto the temporary-root stack (spec.md §4.1's "pinning"):
    /// call this immediately after any `heap.manage` whose result isn't
    /// stored in a reachable slot yet. Pair with `unpin()` once it is.
    pub(crate) fn pin(&mut self, r: ObjRef) {
        self.temp_roots.push(r);
    }

    /// Pop the most recently pinned temporary root. Callers must unpin in
    /// the reverse order they pinned (the temp-root stack is a LIFO).
    pub(crate) fn unpin(&mut self) {
        self.temp_roots.pop();
    }

    /// Allocate and pin the result in one step, so a collection this very
    /// allocation triggers can't sweep the handle before the caller has a
    /// chance to root it some other way. The caller must `unpin()` once the
    /// handle is stored somewhere GC-reachable.
    pub(crate) fn manage_rooted(&mut self, data: ObjData, class: Option<ObjRef>) -> ObjRef {
        let (r, should_gc) = self.heap.manage(data, class);
        self.pin(r);
        self.maybe_collect(should_gc);
        r
    }

    /// Drive `thread_ref` to completion: run `step()` until control returns
    /// to that same thread with an empty frame stack (normal completion) or
    /// with an `error_obj` set (an unrecovered runtime error). Saves and
    /// restores the previous `cur_thread`, so `System.importModule` can
    /// call this recursively without disturbing the importing thread.
    pub fn run_thread(&mut self, thread_ref: ObjRef) -> Result<Value> {
        let previous = self.cur_thread;
        self.cur_thread = thread_ref;
        let outcome = loop {
            let done = self.cur_thread == thread_ref
                && (self.thread(thread_ref).frames.is_empty() || self.thread(thread_ref).error_obj.is_some());
            if done {
                break Ok(());
            }
            if let Err(e) = self.step() {
                break Err(e);
            }
        };
        let result = match outcome {
            Ok(()) => {
                if let Some(err) = self.thread(thread_ref).error_obj {
                    Err(Error::Runtime(self.display_value(err)))
                } else {
                    Ok(self.thread_mut(thread_ref).stack.pop().unwrap_or(Value::Null))
                }
            }
            Err(e) => Err(e),
        };
        self.cur_thread = previous;
        result
    }

    /// Execute exactly one instruction on `self.cur_thread`.
    fn step(&mut self) -> Result<()> {
        let thread_ref = self.cur_thread;
        let (closure_ref, func_ref, ip, stack_start) = {
            let frame = *self.thread(thread_ref).frames.last().expect("step on an empty thread");
            let func_ref = self.closure(frame.closure).function;
            (frame.closure, func_ref, frame.ip, frame.stack_start)
        };
        let op = self.func(func_ref).code[ip].clone();
        // Default: advance past this instruction. Jump-family ops override
        // this before `step` returns; `Call`/`Super`/`Return` push or pop a
        // frame, so by the time they run this write lands on the *caller*.
        self.set_ip(thread_ref, ip + 1);

        match op {
            Op::LoadLocal(slot) => {
                let v = self.thread(thread_ref).stack[stack_start + slot as usize];
                self.thread_mut(thread_ref).push(v);
            }
            Op::StoreLocal(slot) => {
                let v = self.thread(thread_ref).peek();
                self.thread_mut(thread_ref).stack[stack_start + slot as usize] = v;
            }
            Op::LoadThisField(idx) => {
                let recv = self.thread(thread_ref).stack[stack_start];
                let v = self.instance_field(recv, idx);
                self.thread_mut(thread_ref).push(v);
            }
            Op::StoreThisField(idx) => {
                let recv = self.thread(thread_ref).stack[stack_start];
                let v = self.thread(thread_ref).peek();
                self.set_instance_field(recv, idx, v);
            }
            Op::LoadField(idx) => {
                let recv = self.thread_mut(thread_ref).pop();
                let v = self.instance_field(recv, idx);
                self.thread_mut(thread_ref).push(v);
            }
            Op::StoreField(idx) => {
                let v = self.thread_mut(thread_ref).pop();
                let recv = self.thread_mut(thread_ref).pop();
                self.set_instance_field(recv, idx, v);
                self.thread_mut(thread_ref).push(v);
            }
            Op::LoadUpvalue(idx) => {
                let uref = self.closure(closure_ref).upvalues[idx as usize];
                let v = self.read_upvalue(uref);
                self.thread_mut(thread_ref).push(v);
            }
            Op::StoreUpvalue(idx) => {
                let uref = self.closure(closure_ref).upvalues[idx as usize];
                let v = self.thread(thread_ref).peek();
                self.write_upvalue(uref, v);
            }
            Op::LoadModuleVar(idx) => {
                let module_ref = self.func(func_ref).module;
                let v = match self.heap.get(module_ref) {
                    Some(ObjData::Module(m)) => m.get(idx),
                    _ => Value::Null,
                };
                self.thread_mut(thread_ref).push(v);
            }
            Op::StoreModuleVar(idx) => {
                let module_ref = self.func(func_ref).module;
                let v = self.thread(thread_ref).peek();
                if let Some(ObjData::Module(m)) = self.heap.get_mut(module_ref) {
                    m.set(idx, v);
                }
            }
            Op::LoadConstant(idx) => {
                let v = self.func(func_ref).constants[idx as usize];
                self.thread_mut(thread_ref).push(v);
            }
            Op::PushNull => self.thread_mut(thread_ref).push(Value::Null),
            Op::PushTrue => self.thread_mut(thread_ref).push(Value::Bool(true)),
            Op::PushFalse => self.thread_mut(thread_ref).push(Value::Bool(false)),
            Op::Pop => {
                self.thread_mut(thread_ref).pop();
            }
            Op::Call(id, argc) => {
                let args_base = self.thread(thread_ref).stack.len() - argc as usize - 1;
                let receiver = self.thread(thread_ref).stack[args_base];
                let start_class = self.class_of_value(receiver);
                self.perform_call(start_class, id, argc, args_base)?;
            }
            Op::Super(id, argc, const_ix) => {
                let args_base = self.thread(thread_ref).stack.len() - argc as usize - 1;
                let super_const = self.func(func_ref).constants[const_ix as usize];
                let start_class = super_const.as_obj().expect("super constant never patched");
                self.perform_call(start_class, id, argc, args_base)?;
            }
            Op::Jump(offset) | Op::Loop(offset) => {
                self.set_ip(thread_ref, (ip as i64 + 1 + offset as i64) as usize);
            }
            Op::JumpIfFalse(offset) => {
                let v = self.thread_mut(thread_ref).pop();
                if !v.is_truthy() {
                    self.set_ip(thread_ref, (ip as i64 + 1 + offset as i64) as usize);
                }
            }
            Op::And(offset) => {
                let v = self.thread(thread_ref).peek();
                if !v.is_truthy() {
                    self.set_ip(thread_ref, (ip as i64 + 1 + offset as i64) as usize);
                } else {
                    self.thread_mut(thread_ref).pop();
                }
            }
            Op::Or(offset) => {
                let v = self.thread(thread_ref).peek();
                if v.is_truthy() {
                    self.set_ip(thread_ref, (ip as i64 + 1 + offset as i64) as usize);
                } else {
                    self.thread_mut(thread_ref).pop();
                }
            }
            Op::CloseUpvalue => {
                let slot = self.thread(thread_ref).stack.len() - 1;
                self.close_upvalues_from(thread_ref, slot);
                self.thread_mut(thread_ref).pop();
            }
            Op::Return => {
                let v = self.thread_mut(thread_ref).pop();
                let frame = self.thread_mut(thread_ref).frames.pop().expect("return with no frame");
                self.close_upvalues_from(thread_ref, frame.stack_start);
                self.thread_mut(thread_ref).stack.truncate(frame.stack_start);
                self.thread_mut(thread_ref).push(v);
            }
            Op::CreateClosure(func_ix, upvalue_descs) => {
                let target_func = match self.func(func_ref).constants[func_ix as usize] {
                    Value::Obj(r) => r,
                    _ => panic!("CreateClosure operand is not a function constant"),
                };
                let mut resolved = Vec::with_capacity(upvalue_descs.len());
                for (is_local, idx) in upvalue_descs {
                    if is_local {
                        let abs_slot = stack_start + idx as usize;
                        resolved.push(self.find_or_open_upvalue(thread_ref, abs_slot));
                    } else {
                        resolved.push(self.closure(closure_ref).upvalues[idx as usize]);
                    }
                }
                let new_closure = self.manage_rooted(ObjData::Closure(Closure::new(target_func, resolved)), None);
                self.thread_mut(thread_ref).push(Value::Obj(new_closure));
                self.unpin();
            }
            Op::CreateClass(own_fields) => {
                self.create_class(thread_ref, own_fields)?;
            }
            Op::InstanceMethod(id) => {
                self.bind_method(thread_ref, id, false);
            }
            Op::StaticMethod(id) => {
                self.bind_method(thread_ref, id, true);
            }
            Op::Construct => {
                let class_val = self.thread(thread_ref).stack[stack_start];
                let class_ref = class_val.as_obj().expect("CONSTRUCT receiver must be a class");
                let field_count = self.class(class_ref).field_count;
                let inst_ref = self.manage_rooted(ObjData::Instance(Instance::new(field_count)), Some(class_ref));
                self.thread_mut(thread_ref).stack[stack_start] = Value::Obj(inst_ref);
                self.unpin();
            }
            Op::End => {
                // Sentinel only; the compiler always overwrites every `End`
                // before emission finishes. Reaching one is a compiler bug.
                return self.raise_runtime_error("internal error: unpatched break".to_string());
            }
            Op::BuildList(n) => {
                let mut elems = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    elems.push(self.thread_mut(thread_ref).pop());
                }
                elems.reverse();
                let list_ref = self.manage_rooted(ObjData::List(ListObj { elements: elems }), Some(self.classes.list_class));
                self.thread_mut(thread_ref).push(Value::Obj(list_ref));
                self.unpin();
            }
            Op::BuildMap(n) => {
                let mut pairs = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    let value = self.thread_mut(thread_ref).pop();
                    let key = self.thread_mut(thread_ref).pop();
                    pairs.push((key, value));
                }
                pairs.reverse();
                let mut map = MapObj::new();
                for (k, v) in pairs {
                    map.insert(&self.heap, k, v);
                }
                let map_ref = self.manage_rooted(ObjData::Map(map), Some(self.classes.map_class));
                self.thread_mut(thread_ref).push(Value::Obj(map_ref));
                self.unpin();
            }
        }
        Ok(())
    }

    fn func(&self, r: ObjRef) -> &lumen_core::ObjFn {
        match self.heap.get(r) {
            Some(ObjData::Fn(f)) => f,
            _ => panic!("expected a function object"),
        }
    }

    fn set_ip(&mut self, thread_ref: ObjRef, ip: usize) {
        self.thread_mut(thread_ref).frames.last_mut().expect("set_ip on an empty thread").ip = ip;
    }

    fn instance_field(&self, receiver: Value, idx: u16) -> Value {
        match receiver {
            Value::Obj(r) => match self.heap.get(r) {
                Some(ObjData::Instance(i)) => i.fields.get(idx as usize).copied().unwrap_or(Value::Null),
                _ => Value::Null,
            },
            _ => Value::Null,
        }
    }

    fn set_instance_field(&mut self, receiver: Value, idx: u16, v: Value) {
        if let Value::Obj(r) = receiver {
            if let Some(ObjData::Instance(i)) = self.heap.get_mut(r) {
                if let Some(slot) = i.fields.get_mut(idx as usize) {
                    *slot = v;
                }
            }
        }
    }

    fn read_upvalue(&self, uref: ObjRef) -> Value {
        match self.heap.get(uref) {
            Some(ObjData::Upvalue(u)) => match u.state {
                lumen_core::UpvalueState::Closed(v) => v,
                lumen_core::UpvalueState::Open { thread, slot } => self.thread(thread).stack[slot],
            },
            _ => Value::Null,
        }
    }

    fn write_upvalue(&mut self, uref: ObjRef, v: Value) {
        let target = match self.heap.get(uref) {
            Some(ObjData::Upvalue(u)) => match u.state {
                lumen_core::UpvalueState::Closed(_) => None,
                lumen_core::UpvalueState::Open { thread, slot } => Some((thread, slot)),
            },
            _ => None,
        };
        match target {
            Some((thread, slot)) => self.thread_mut(thread).stack[slot] = v,
            None => {
                if let Some(ObjData::Upvalue(u)) = self.heap.get_mut(uref) {
                    u.state = lumen_core::UpvalueState::Closed(v);
                }
            }
        }
    }

    fn find_or_open_upvalue(&mut self, thread_ref: ObjRef, abs_slot: usize) -> ObjRef {
        if let Some(existing) = self.thread(thread_ref).find_open_upvalue(abs_slot) {
            return existing;
        }
        let uref = self.manage_rooted(ObjData::Upvalue(lumen_core::Upvalue::new_open(thread_ref, abs_slot)), None);
        self.thread_mut(thread_ref)
            .insert_open_upvalue(abs_slot, uref)
            .expect("just confirmed no upvalue was open for this slot");
        self.unpin();
        uref
    }

    /// Close every open upvalue whose slot is at or above `floor` (a frame
    /// unwinding past `floor`, or a single local leaving scope at exactly
    /// `floor`). `open_upvalues` is sorted strictly descending by slot, so
    /// everything at or above `floor` is a prefix.
    fn close_upvalues_from(&mut self, thread_ref: ObjRef, floor: usize) {
        loop {
            let head = self.thread(thread_ref).open_upvalues.first().copied();
            let (slot, uref) = match head {
                Some((s, u)) if s >= floor => (s, u),
                _ => break,
            };
            let value = self.thread(thread_ref).stack[slot];
            if let Some(ObjData::Upvalue(u)) = self.heap.get_mut(uref) {
                u.close(value);
            }
            self.thread_mut(thread_ref).open_upvalues.remove(0);
        }
    }

    /// `class_of` unifies two cases with no special-casing: for an ordinary
    /// heap object it's the class `Heap::manage` was told to stamp (the
    /// instance's own class); for a `Class` value itself it's that class's
    /// *metaclass*, stamped the same way at `CreateClass` time — so static
    /// dispatch and instance dispatch both reduce to "walk the chain
    /// starting at `class_of(receiver)`".
    pub(crate) fn class_of_value(&self, v: Value) -> ObjRef {
        match v {
            Value::Null | Value::Undefined => self.classes.null_class,
            Value::Bool(_) => self.classes.bool_class,
            Value::Num(_) => self.classes.num_class,
            Value::Obj(r) => self.heap.class_of(r).unwrap_or(self.classes.object_class),
        }
    }

    fn lookup_method(&self, start_class: ObjRef, id: MethodId) -> Method {
        let mut cur = Some(start_class);
        while let Some(c) = cur {
            match self.heap.get(c) {
                Some(ObjData::Class(class)) => {
                    let m = class.methods.get(id);
                    if !m.is_none() {
                        return m.clone();
                    }
                    cur = class.superclass;
                }
                _ => return Method::None,
            }
        }
        Method::None
    }

    fn perform_call(&mut self, start_class: ObjRef, id: MethodId, argc: u8, args_base: usize) -> Result<()> {
        let method = self.lookup_method(start_class, id);
        match method {
            Method::None => {
                let name = self.methods.name_of(id).unwrap_or("?").to_string();
                let class_name = self.class_display_name(start_class);
                self.raise_runtime_error(format!("{class_name} does not implement '{name}'"))
            }
            Method::Primitive(idx) => {
                let f = self.primitives[idx as usize];
                match f(self, args_base) {
                    PrimOutcome::Ok => {
                        let thread_ref = self.cur_thread;
                        self.thread_mut(thread_ref).stack.truncate(args_base + 1);
                        Ok(())
                    }
                    PrimOutcome::Error(e) => {
                        let thread_ref = self.cur_thread;
                        self.thread_mut(thread_ref).stack.truncate(args_base);
                        self.raise_runtime_value(e)
                    }
                    PrimOutcome::Switch => Ok(()),
                    PrimOutcome::Halt(v) => {
                        let thread_ref = self.cur_thread;
                        let t = self.thread_mut(thread_ref);
                        t.frames.clear();
                        t.stack.clear();
                        t.push(v);
                        Ok(())
                    }
                }
            }
            Method::Script(closure_ref) => self.push_call_frame(closure_ref, args_base),
            Method::FnCall => {
                let thread_ref = self.cur_thread;
                let receiver = self.thread(thread_ref).stack[args_base];
                let closure_ref = receiver
                    .as_obj()
                    .filter(|r| matches!(self.heap.get(*r), Some(ObjData::Closure(_))));
                match closure_ref {
                    Some(cref) => {
                        let func_ref = self.closure(cref).function;
                        let arity = self.func(func_ref).arity;
                        if arity != argc {
                            return self.raise_runtime_error(format!("expected {arity} argument(s), got {argc}"));
                        }
                        self.push_call_frame(cref, args_base)
                    }
                    None => self.raise_runtime_error("receiver is not callable".to_string()),
                }
            }
        }
    }

    /// Push a new frame over the call's already-on-stack `[receiver,
    /// args...]` window. No padding is pushed: every local beyond the
    /// parameters gets its own stack slot exactly when the callee's body
    /// first pushes its initializer, the same one-slot-per-push local
    /// model `lumen-compiler`'s `CompileUnit::add_local` assumes. Reserving
    /// `max_stack_slots_used` up front is purely a capacity hint so this
    /// call's pushes don't repeatedly reallocate the backing `Vec`.
    fn push_call_frame(&mut self, closure_ref: ObjRef, args_base: usize) -> Result<()> {
        let func_ref = self.closure(closure_ref).function;
        let reserve = self.func(func_ref).max_stack_slots_used as usize;
        let thread_ref = self.cur_thread;
        let thread = self.thread_mut(thread_ref);
        thread.stack.reserve(reserve);
        thread.frames.push(lumen_core::Frame { closure: closure_ref, ip: 0, stack_start: args_base });
        Ok(())
    }

    pub(crate) fn raise_runtime_error(&mut self, msg: String) -> Result<()> {
        let sref = self.manage_rooted(ObjData::String(LString::new(msg.clone())), Some(self.classes.string_class));
        let thread_ref = self.cur_thread;
        self.thread_mut(thread_ref).error_obj = Some(Value::Obj(sref));
        self.unpin();
        Err(Error::Runtime(msg))
    }

    pub(crate) fn raise_runtime_value(&mut self, v: Value) -> Result<()> {
        let msg = self.display_value(v);
        let thread_ref = self.cur_thread;
        self.thread_mut(thread_ref).error_obj = Some(v);
        Err(Error::Runtime(msg))
    }

    /// Render a value the way `toString` ultimately would, for error
    /// messages and `System.writeString_` of non-string values that slip
    /// through (primitives call this too rather than duplicate it).
    pub(crate) fn display_value(&self, v: Value) -> String {
        match v {
            Value::Obj(r) => match self.heap.get(r) {
                Some(ObjData::String(s)) => s.as_str().to_string(),
                _ => v.to_string(),
            },
            other => other.to_string(),
        }
    }

    pub(crate) fn class_display_name(&self, class_ref: ObjRef) -> String {
        match self.heap.get(class_ref) {
            Some(ObjData::Class(c)) => match self.heap.get(c.name) {
                Some(ObjData::String(s)) => s.as_str().to_string(),
                _ => "<class>".to_string(),
            },
            _ => "<unknown>".to_string(),
        }
    }

    fn create_class(&mut self, thread_ref: ObjRef, own_fields: u8) -> Result<()> {
        let superclass_val = self.thread_mut(thread_ref).pop();
        let name_val = self.thread_mut(thread_ref).pop();
        let name_ref = name_val.as_obj().expect("class name must be a string constant");
        let superclass_ref = superclass_val
            .as_obj()
            .filter(|r| matches!(self.heap.get(*r), Some(ObjData::Class(_))));

        let total_fields = match superclass_ref {
            Some(s) => self.class(s).field_count + own_fields as u16,
            None => own_fields as u16,
        };
        let class_ref = self.manage_rooted(ObjData::Class(Class::new(name_ref, superclass_ref, total_fields)), None);

        if let Some(s) = superclass_ref {
            let inherited = self.class(s).methods.clone();
            if let Some(ObjData::Class(c)) = self.heap.get_mut(class_ref) {
                c.methods = inherited;
            }
        }

        let super_meta = superclass_ref.and_then(|s| self.class(s).metaclass);
        let mut meta = Class::new(name_ref, super_meta, 0);
        if let Some(sm) = super_meta {
            meta.methods = self.class(sm).methods.clone();
        }
        let meta_class_of = self.core_ready.then_some(self.classes.class_class);
        let meta_ref = self.manage_rooted(ObjData::Class(meta), meta_class_of);

        if let Some(ObjData::Class(c)) = self.heap.get_mut(class_ref) {
            c.metaclass = Some(meta_ref);
        }
        self.heap.set_class(class_ref, meta_ref);
        self.unpin(); // meta_ref: now reachable through class_ref's metaclass field

        self.thread_mut(thread_ref).push(Value::Obj(class_ref));
        self.unpin(); // class_ref: now reachable from the stack
        Ok(())
    }

    fn bind_method(&mut self, thread_ref: ObjRef, id: MethodId, is_static: bool) {
        let closure_val = self.thread_mut(thread_ref).pop();
        let class_val = self.thread_mut(thread_ref).pop();
        let closure_ref = closure_val.as_obj().expect("method body must be a closure");
        let class_ref = class_val.as_obj().expect("method target must be a class");

        if let Some(superclass) = self.class(class_ref).superclass {
            let func_ref = self.closure(closure_ref).function;
            let field_offset = self.class(superclass).field_count;
            self.patch_super_placeholders(func_ref, superclass, field_offset);
        }

        let target = if is_static {
            self.class(class_ref).metaclass.expect("every class has a metaclass")
        } else {
            class_ref
        };
        if let Some(ObjData::Class(c)) = self.heap.get_mut(target) {
            c.methods.set(id, Method::Script(closure_ref));
        }
    }

    /// Walk `fn_ref`'s own code for two bind-time-only fixups that can't be
    /// resolved at compile time, since the compiler never sees the
    /// superclass (single-pass, no forward knowledge of `class C < B`'s `B`
    /// until `CreateClass` actually runs):
    ///
    /// 1. `Super` placeholders — the compiler leaves the constant
    ///    `Value::Null` until the enclosing class's superclass is known.
    /// 2. Field slot operands (spec.md's inheritance patching,
    ///    `examples/original_source/vm/vm.c`'s
    ///    `fn->instructStream.datas[ip++] += class->superClass->fieldNum`) —
    ///    every `LoadThisField`/`StoreThisField`/`LoadField`/`StoreField`
    ///    operand was numbered by the compiler starting at 0 for *this*
    ///    class's own fields (spec.md §3's `ClassBookKeep`), so it has to be
    ///    shifted up by `field_offset` (the superclass's total field count)
    ///    to land after the inherited fields in the flat per-instance array.
    ///
    /// Both recurse into any nested function literals the method builds
    /// closures over, since `super`/`this.field` inside a nested closure
    /// still means the enclosing method's defining class and its fields.
    fn patch_super_placeholders(&mut self, fn_ref: ObjRef, superclass: ObjRef, field_offset: u16) {
        let nested: Vec<ObjRef> = {
            let f = match self.heap.get_mut(fn_ref) {
                Some(ObjData::Fn(f)) => f,
                _ => return,
            };
            for i in 0..f.code.len() {
                if let Op::Super(_, _, const_ix) = &f.code[i] {
                    let const_ix = *const_ix;
                    if matches!(f.constants[const_ix as usize], Value::Null) {
                        f.constants[const_ix as usize] = Value::Obj(superclass);
                    }
                }
                match &mut f.code[i] {
                    Op::LoadThisField(slot)
                    | Op::StoreThisField(slot)
                    | Op::LoadField(slot)
                    | Op::StoreField(slot) => {
                        *slot += field_offset;
                    }
                    _ => {}
                }
            }
            f.code
                .iter()
                .filter_map(|op| match op {
                    Op::CreateClosure(const_ix, _) => match f.constants.get(*const_ix as usize) {
                        Some(Value::Obj(r)) => Some(*r),
                        _ => None,
                    },
                    _ => None,
                })
                .collect()
        };
        for n in nested {
            self.patch_super_placeholders(n, superclass, field_offset);
        }
    }
}
