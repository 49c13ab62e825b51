//! primitives.rs — the native bodies every signature declared in `core.lm`
//! is rebound to (spec.md §4.4, §6).
//!
//! Every primitive has the shape `fn(&mut Vm, args_base: usize) ->
//! PrimOutcome`: `args_base` indexes straight into the current thread's
//! stack, receiver first, then its arguments. See `interp::PrimOutcome`
//! for what each outcome variant tells the interpreter to do next.

use lumen_core::collection_obj::{hash_value, values_equal, List as ListObj, Map as MapObj, Range as RangeObj};
use lumen_core::heap::ObjData;
use lumen_core::string_obj::LString;
use lumen_core::Value;

use crate::interp::PrimOutcome;
use crate::Vm;

pub type PrimFn = fn(&mut Vm, usize) -> PrimOutcome;

fn arg(vm: &Vm, args_base: usize, n: usize) -> Value {
    let thread_ref = vm.cur_thread;
    vm.thread(thread_ref).stack[args_base + n]
}

fn recv(vm: &Vm, args_base: usize) -> Value {
    arg(vm, args_base, 0)
}

fn ok(vm: &mut Vm, args_base: usize, v: Value) -> PrimOutcome {
    let thread_ref = vm.cur_thread;
    vm.thread_mut(thread_ref).stack[args_base] = v;
    PrimOutcome::Ok
}

fn ok_bool(vm: &mut Vm, args_base: usize, b: bool) -> PrimOutcome {
    ok(vm, args_base, Value::Bool(b))
}

fn ok_num(vm: &mut Vm, args_base: usize, n: f64) -> PrimOutcome {
    ok(vm, args_base, Value::Num(n))
}

fn ok_string(vm: &mut Vm, args_base: usize, s: String) -> PrimOutcome {
    let v = alloc_string(vm, s);
    ok(vm, args_base, v)
}

fn err(vm: &mut Vm, msg: impl Into<String>) -> PrimOutcome {
    PrimOutcome::Error(alloc_string(vm, msg.into()))
}

fn alloc_string(vm: &mut Vm, s: String) -> Value {
    let r = vm.manage_rooted(ObjData::String(LString::new(s)), Some(vm.classes.string_class));
    vm.unpin();
    Value::Obj(r)
}

fn as_string<'a>(vm: &'a Vm, v: Value) -> Option<&'a str> {
    match v {
        Value::Obj(r) => match vm.heap.get(r) {
            Some(ObjData::String(s)) => Some(s.as_str()),
            _ => None,
        },
        _ => None,
    }
}

fn as_num_arg(vm: &mut Vm, v: Value, what: &str) -> Result<f64, PrimOutcome> {
    v.as_num().ok_or_else(|| err(vm, format!("{what} must be a number")))
}

// ---------------------------------------------------------------- Object

pub(crate) fn object_eq(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    let (a, b) = (arg(vm, args_base, 0), arg(vm, args_base, 1));
    let eq = values_equal(&vm.heap, &a, &b);
    ok_bool(vm, args_base, eq)
}

pub(crate) fn object_ne(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    let (a, b) = (arg(vm, args_base, 0), arg(vm, args_base, 1));
    let eq = values_equal(&vm.heap, &a, &b);
    ok_bool(vm, args_base, !eq)
}

pub(crate) fn object_to_string(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    let v = recv(vm, args_base);
    let class = vm.class_of_value(v);
    let name = vm.class_display_name(class);
    ok_string(vm, args_base, format!("instance of {name}"))
}

// ----------------------------------------------------------------- Class

pub(crate) fn class_name(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    let r = recv(vm, args_base).as_obj().expect("Class receiver");
    let Some(ObjData::Class(c)) = vm.heap.get(r) else { return err(vm, "not a class") };
    let name = c.name;
    ok(vm, args_base, Value::Obj(name))
}

pub(crate) fn class_to_string(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    let r = recv(vm, args_base).as_obj().expect("Class receiver");
    let name = vm.class_display_name(r);
    ok_string(vm, args_base, name)
}

// ------------------------------------------------------------------ Bool

pub(crate) fn bool_to_string(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    let b = matches!(recv(vm, args_base), Value::Bool(true));
    ok_string(vm, args_base, b.to_string())
}

pub(crate) fn bool_not(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    let b = matches!(recv(vm, args_base), Value::Bool(true));
    ok_bool(vm, args_base, !b)
}

// ------------------------------------------------------------------- Num

macro_rules! num_binop {
    ($name:ident, $op:tt) => {
        pub(crate) fn $name(vm: &mut Vm, args_base: usize) -> PrimOutcome {
            let a = recv(vm, args_base).as_num().expect("Num receiver");
            let b = match as_num_arg(vm, arg(vm, args_base, 1), "right-hand side") {
                Ok(n) => n,
                Err(e) => return e,
            };
            ok_num(vm, args_base, a $op b)
        }
    };
}

num_binop!(num_add, +);
num_binop!(num_sub, -);
num_binop!(num_mul, *);
num_binop!(num_div, /);

pub(crate) fn num_mod(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    let a = recv(vm, args_base).as_num().expect("Num receiver");
    let b = match as_num_arg(vm, arg(vm, args_base, 1), "right-hand side") {
        Ok(n) => n,
        Err(e) => return e,
    };
    ok_num(vm, args_base, a % b)
}

macro_rules! num_cmp {
    ($name:ident, $op:tt) => {
        pub(crate) fn $name(vm: &mut Vm, args_base: usize) -> PrimOutcome {
            let a = recv(vm, args_base).as_num().expect("Num receiver");
            let b = match as_num_arg(vm, arg(vm, args_base, 1), "right-hand side") {
                Ok(n) => n,
                Err(e) => return e,
            };
            ok_bool(vm, args_base, a $op b)
        }
    };
}

num_cmp!(num_lt, <);
num_cmp!(num_le, <=);
num_cmp!(num_gt, >);
num_cmp!(num_ge, >=);

pub(crate) fn num_eq(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    let a = recv(vm, args_base).as_num().expect("Num receiver");
    let eq = arg(vm, args_base, 1).as_num() == Some(a);
    ok_bool(vm, args_base, eq)
}

pub(crate) fn num_ne(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    let a = recv(vm, args_base).as_num().expect("Num receiver");
    let eq = arg(vm, args_base, 1).as_num() == Some(a);
    ok_bool(vm, args_base, !eq)
}

pub(crate) fn num_neg(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    let a = recv(vm, args_base).as_num().expect("Num receiver");
    ok_num(vm, args_base, -a)
}

pub(crate) fn num_range_inclusive(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    num_range(vm, args_base, true)
}

pub(crate) fn num_range_exclusive(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    num_range(vm, args_base, false)
}

fn num_range(vm: &mut Vm, args_base: usize, inclusive: bool) -> PrimOutcome {
    let from = recv(vm, args_base).as_num().expect("Num receiver");
    let to = match as_num_arg(vm, arg(vm, args_base, 1), "range endpoint") {
        Ok(n) => n,
        Err(e) => return e,
    };
    let r = vm.manage_rooted(ObjData::Range(RangeObj { from, to, inclusive }), Some(vm.classes.range_class));
    let outcome = ok(vm, args_base, Value::Obj(r));
    vm.unpin();
    outcome
}

pub(crate) fn num_to_string(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    let v = recv(vm, args_base);
    ok_string(vm, args_base, v.to_string())
}

// ------------------------------------------------------------------ Null

pub(crate) fn null_to_string(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    ok_string(vm, args_base, "null".to_string())
}

// ---------------------------------------------------------------- String

pub(crate) fn string_add(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    let a = as_string(vm, recv(vm, args_base)).expect("String receiver").to_string();
    let other = arg(vm, args_base, 1);
    let Some(b) = as_string(vm, other) else { return err(vm, "right-hand side of `+` must be a String") };
    ok_string(vm, args_base, a + b)
}

pub(crate) fn string_eq(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    let (a, b) = (recv(vm, args_base), arg(vm, args_base, 1));
    ok_bool(vm, args_base, values_equal(&vm.heap, &a, &b))
}

pub(crate) fn string_ne(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    let (a, b) = (recv(vm, args_base), arg(vm, args_base, 1));
    ok_bool(vm, args_base, !values_equal(&vm.heap, &a, &b))
}

pub(crate) fn string_index(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    let s = as_string(vm, recv(vm, args_base)).expect("String receiver").to_string();
    let idx = match as_num_arg(vm, arg(vm, args_base, 1), "string index") {
        Ok(n) => n,
        Err(e) => return e,
    };
    let chars: Vec<char> = s.chars().collect();
    let len = chars.len() as i64;
    let mut i = idx as i64;
    if i < 0 {
        i += len;
    }
    if i < 0 || i >= len {
        return err(vm, "string index out of bounds");
    }
    ok_string(vm, args_base, chars[i as usize].to_string())
}

pub(crate) fn string_count(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    let n = {
        let s = as_string(vm, recv(vm, args_base)).expect("String receiver");
        s.chars().count()
    };
    ok_num(vm, args_base, n as f64)
}

pub(crate) fn string_to_string(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    let v = recv(vm, args_base);
    ok(vm, args_base, v)
}

pub(crate) fn string_iterate(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    let len = as_string(vm, recv(vm, args_base)).expect("String receiver").chars().count() as f64;
    let cur = arg(vm, args_base, 1);
    let next = match cur {
        Value::Null => {
            if len > 0.0 {
                0.0
            } else {
                return ok(vm, args_base, Value::Bool(false));
            }
        }
        Value::Num(n) => n + 1.0,
        _ => return err(vm, "iterator must be null or a number"),
    };
    if next >= len {
        ok(vm, args_base, Value::Bool(false))
    } else {
        ok_num(vm, args_base, next)
    }
}

pub(crate) fn string_iterator_value(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    let s = as_string(vm, recv(vm, args_base)).expect("String receiver").to_string();
    let idx = arg(vm, args_base, 1).as_num().unwrap_or(0.0) as usize;
    match s.chars().nth(idx) {
        Some(c) => ok_string(vm, args_base, c.to_string()),
        None => err(vm, "iterator value out of bounds"),
    }
}

// ------------------------------------------------------------------ List

fn with_list<R>(vm: &mut Vm, recv: Value, f: impl FnOnce(&mut ListObj) -> R) -> Option<R> {
    let r = recv.as_obj()?;
    match vm.heap.get_mut(r) {
        Some(ObjData::List(l)) => Some(f(l)),
        _ => None,
    }
}

pub(crate) fn list_add(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    let r = recv(vm, args_base);
    let value = arg(vm, args_base, 1);
    with_list(vm, r, |l| l.elements.push(value)).expect("List receiver");
    ok(vm, args_base, value)
}

pub(crate) fn list_index(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    let r = recv(vm, args_base);
    let idx = match as_num_arg(vm, arg(vm, args_base, 1), "list index") {
        Ok(n) => n,
        Err(e) => return e,
    };
    let len = with_list(vm, r, |l| l.elements.len()).expect("List receiver") as i64;
    let mut i = idx as i64;
    if i < 0 {
        i += len;
    }
    if i < 0 || i >= len {
        return err(vm, "list index out of bounds");
    }
    let v = with_list(vm, r, |l| l.elements[i as usize]).unwrap();
    ok(vm, args_base, v)
}

pub(crate) fn list_index_set(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    let r = recv(vm, args_base);
    let idx = match as_num_arg(vm, arg(vm, args_base, 1), "list index") {
        Ok(n) => n,
        Err(e) => return e,
    };
    let value = arg(vm, args_base, 2);
    let len = with_list(vm, r, |l| l.elements.len()).expect("List receiver") as i64;
    let mut i = idx as i64;
    if i < 0 {
        i += len;
    }
    if i < 0 || i >= len {
        return err(vm, "list index out of bounds");
    }
    with_list(vm, r, |l| l.elements[i as usize] = value);
    ok(vm, args_base, value)
}

pub(crate) fn list_count(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    let r = recv(vm, args_base);
    let n = with_list(vm, r, |l| l.elements.len()).expect("List receiver");
    ok_num(vm, args_base, n as f64)
}

pub(crate) fn list_to_string(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    let r = recv(vm, args_base);
    let elems = with_list(vm, r, |l| l.elements.clone()).expect("List receiver");
    let parts: Vec<String> = elems.iter().map(|v| vm.display_value(*v)).collect();
    ok_string(vm, args_base, format!("[{}]", parts.join(", ")))
}

pub(crate) fn list_iterate(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    let r = recv(vm, args_base);
    let len = with_list(vm, r, |l| l.elements.len()).expect("List receiver") as f64;
    let cur = arg(vm, args_base, 1);
    let next = match cur {
        Value::Null => {
            if len > 0.0 {
                0.0
            } else {
                return ok(vm, args_base, Value::Bool(false));
            }
        }
        Value::Num(n) => n + 1.0,
        _ => return err(vm, "iterator must be null or a number"),
    };
    if next >= len {
        ok(vm, args_base, Value::Bool(false))
    } else {
        ok_num(vm, args_base, next)
    }
}

pub(crate) fn list_iterator_value(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    let r = recv(vm, args_base);
    let idx = arg(vm, args_base, 1).as_num().unwrap_or(0.0) as usize;
    let v = with_list(vm, r, |l| l.elements.get(idx).copied()).flatten();
    match v {
        Some(v) => ok(vm, args_base, v),
        None => err(vm, "iterator value out of bounds"),
    }
}

// ------------------------------------------------------------------- Map

/// `Map::insert`/`remove` need `&mut Map` *and* `&Heap` at once, but the
/// map lives inside that same heap — swap it out to an owned local with
/// `mem::take` (valid since `Map: Default`), operate against the
/// now-unaliased heap, then put it back.
fn with_map_mut<R>(vm: &mut Vm, recv: Value, f: impl FnOnce(&mut MapObj, &lumen_core::heap::Heap) -> R) -> Option<R> {
    let r = recv.as_obj()?;
    let mut map = match vm.heap.get_mut(r) {
        Some(ObjData::Map(m)) => std::mem::take(m),
        _ => return None,
    };
    let result = f(&mut map, &vm.heap);
    if let Some(ObjData::Map(slot)) = vm.heap.get_mut(r) {
        *slot = map;
    }
    Some(result)
}

fn with_map<R>(vm: &Vm, recv: Value, f: impl FnOnce(&MapObj, &lumen_core::heap::Heap) -> R) -> Option<R> {
    let r = recv.as_obj()?;
    match vm.heap.get(r) {
        Some(ObjData::Map(m)) => Some(f(m, &vm.heap)),
        _ => None,
    }
}

pub(crate) fn map_index(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    let r = recv(vm, args_base);
    let key = arg(vm, args_base, 1);
    let v = with_map(vm, r, |m, heap| m.get(heap, &key)).expect("Map receiver");
    ok(vm, args_base, v.unwrap_or(Value::Null))
}

pub(crate) fn map_index_set(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    let r = recv(vm, args_base);
    let key = arg(vm, args_base, 1);
    let value = arg(vm, args_base, 2);
    with_map_mut(vm, r, |m, heap| m.insert(heap, key, value)).expect("Map receiver");
    ok(vm, args_base, value)
}

pub(crate) fn map_contains_key(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    let r = recv(vm, args_base);
    let key = arg(vm, args_base, 1);
    let has = with_map(vm, r, |m, heap| m.contains_key(heap, &key)).expect("Map receiver");
    ok_bool(vm, args_base, has)
}

pub(crate) fn map_remove(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    let r = recv(vm, args_base);
    let key = arg(vm, args_base, 1);
    let removed = with_map_mut(vm, r, |m, heap| m.remove(heap, &key)).expect("Map receiver");
    ok(vm, args_base, removed.unwrap_or(Value::Null))
}

pub(crate) fn map_count(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    let r = recv(vm, args_base);
    let n = with_map(vm, r, |m, _| m.len()).expect("Map receiver");
    ok_num(vm, args_base, n as f64)
}

pub(crate) fn map_to_string(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    let r = recv(vm, args_base);
    let pairs: Vec<(Value, Value)> =
        with_map(vm, r, |m, _| m.entries().map(|(k, v)| (*k, *v)).collect()).expect("Map receiver");
    let parts: Vec<String> =
        pairs.iter().map(|(k, v)| format!("{}: {}", vm.display_value(*k), vm.display_value(*v))).collect();
    ok_string(vm, args_base, format!("{{{}}}", parts.join(", ")))
}

/// The `for`-loop's opaque iterator state is an ordinal position into
/// `entries()` (`Map` exposes no stable raw slot index) — `entries()`'s
/// order is only deterministic while the map isn't mutated mid-loop, which
/// matches what every language in this family promises anyway.
pub(crate) fn map_iterate(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    let r = recv(vm, args_base);
    let len = with_map(vm, r, |m, _| m.len()).expect("Map receiver") as f64;
    let cur = arg(vm, args_base, 1);
    let next = match cur {
        Value::Null => {
            if len > 0.0 {
                0.0
            } else {
                return ok(vm, args_base, Value::Bool(false));
            }
        }
        Value::Num(n) => n + 1.0,
        _ => return err(vm, "iterator must be null or a number"),
    };
    if next >= len {
        ok(vm, args_base, Value::Bool(false))
    } else {
        ok_num(vm, args_base, next)
    }
}

/// Yields the key at the iterator's position, matching `for (key in map)`.
pub(crate) fn map_iterator_value(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    let r = recv(vm, args_base);
    let idx = arg(vm, args_base, 1).as_num().unwrap_or(0.0) as usize;
    let key = with_map(vm, r, |m, _| m.entries().nth(idx).map(|(k, _)| *k)).flatten();
    match key {
        Some(k) => ok(vm, args_base, k),
        None => err(vm, "iterator value out of bounds"),
    }
}

// ----------------------------------------------------------------- Range

pub(crate) fn range_from(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    let r = recv(vm, args_base).as_obj().expect("Range receiver");
    let Some(ObjData::Range(range)) = vm.heap.get(r) else { return err(vm, "not a range") };
    let from = range.from;
    ok_num(vm, args_base, from)
}

pub(crate) fn range_to(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    let r = recv(vm, args_base).as_obj().expect("Range receiver");
    let Some(ObjData::Range(range)) = vm.heap.get(r) else { return err(vm, "not a range") };
    let to = range.to;
    ok_num(vm, args_base, to)
}

pub(crate) fn range_to_string(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    let r = recv(vm, args_base).as_obj().expect("Range receiver");
    let Some(ObjData::Range(range)) = vm.heap.get(r) else { return err(vm, "not a range") };
    let (from, to, op) = (range.from, range.to, if range.inclusive { ".." } else { "..." });
    ok_string(vm, args_base, format!("{from}{op}{to}"))
}

pub(crate) fn range_iterate(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    let r = recv(vm, args_base).as_obj().expect("Range receiver");
    let Some(ObjData::Range(range)) = vm.heap.get(r) else { return err(vm, "not a range") };
    let range = *range;
    let cur = arg(vm, args_base, 1).as_num();
    match range.next_after(cur) {
        Some(n) => ok_num(vm, args_base, n),
        None => ok_bool(vm, args_base, false),
    }
}

pub(crate) fn range_iterator_value(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    // The iterator state *is* the value for a range.
    let it = arg(vm, args_base, 1);
    ok(vm, args_base, it)
}

// -------------------------------------------------------------------- Fn

pub(crate) fn fn_to_string(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    let r = recv(vm, args_base).as_obj().expect("Fn receiver");
    let name = match vm.heap.get(r) {
        Some(ObjData::Closure(c)) => match vm.heap.get(c.function) {
            Some(ObjData::Fn(f)) => f.debug_name.clone(),
            _ => "fn".to_string(),
        },
        _ => "fn".to_string(),
    };
    ok_string(vm, args_base, format!("<fn {name}>"))
}

// ---------------------------------------------------------------- Thread

pub(crate) fn thread_new(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    let body = arg(vm, args_base, 1);
    let Some(closure_ref) = body.as_obj().filter(|r| matches!(vm.heap.get(*r), Some(ObjData::Closure(_)))) else {
        return err(vm, "Thread.new(body) expects a Fn");
    };
    let thread_ref = vm.manage_rooted(ObjData::Thread(lumen_core::Thread::new(closure_ref)), Some(vm.classes.thread_class));
    let outcome = ok(vm, args_base, Value::Obj(thread_ref));
    vm.unpin();
    outcome
}

/// `target.call()` / `target.call(arg)`: switch `cur_thread` to `target`,
/// remembering where on the caller's stack to deposit the eventual
/// `.yield`ed (or returned) value.
fn thread_call(vm: &mut Vm, args_base: usize, has_arg: bool) -> PrimOutcome {
    let target = recv(vm, args_base);
    let Some(target_ref) = target.as_obj().filter(|r| matches!(vm.heap.get(*r), Some(ObjData::Thread(_)))) else {
        return err(vm, "call receiver must be a Thread");
    };
    if vm.thread(target_ref).error_obj.is_some() {
        return err(vm, "cannot call an aborted thread");
    }
    if vm.thread(target_ref).frames.is_empty() {
        return err(vm, "cannot call a finished thread");
    }
    let caller = vm.cur_thread;
    vm.thread_mut(target_ref).caller = Some(caller);
    if has_arg {
        let value = arg(vm, args_base, 1);
        vm.thread_mut(target_ref).push(value);
    }
    vm.resume_slots.insert(caller, args_base);
    vm.cur_thread = target_ref;
    PrimOutcome::Switch
}

pub(crate) fn thread_call0(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    thread_call(vm, args_base, false)
}

pub(crate) fn thread_call1(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    thread_call(vm, args_base, true)
}

/// `Thread.yield()` / `Thread.yield(value)`: hand control back to whoever
/// last `.call`ed the running thread, depositing `value` where that
/// caller's `resume_slots` entry says its call window started. With no
/// caller (the root fiber), this is the run's final result.
fn thread_yield(vm: &mut Vm, _args_base: usize, value: Value) -> PrimOutcome {
    let me = vm.cur_thread;
    match vm.thread_mut(me).caller.take() {
        Some(caller) => {
            if let Some(caller_base) = vm.resume_slots.remove(&caller) {
                vm.thread_mut(caller).stack.truncate(caller_base);
                vm.thread_mut(caller).push(value);
            }
            vm.cur_thread = caller;
            PrimOutcome::Switch
        }
        None => PrimOutcome::Halt(value),
    }
}

pub(crate) fn thread_yield0(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    thread_yield(vm, args_base, Value::Null)
}

pub(crate) fn thread_yield1(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    let value = arg(vm, args_base, 1);
    thread_yield(vm, args_base, value)
}

/// `Thread.abort(msg)`: raise a runtime error on the currently running
/// thread (spec.md §5's "abort the fiber, the error propagates like any
/// other runtime error" simplification — see `interp::raise_runtime_value`).
pub(crate) fn thread_abort(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    let msg = arg(vm, args_base, 1);
    PrimOutcome::Error(msg)
}

// --------------------------------------------------------------- System

pub(crate) fn system_import_module(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    let path = recv_err_checked(vm, args_base, "System.importModule(path)");
    let path = match path {
        Ok(p) => p,
        Err(e) => return e,
    };
    if let Some(&existing) = vm.modules.get(&path) {
        return ok(vm, args_base, Value::Obj(existing));
    }
    let Some(source) = vm.load_module_source(&path) else {
        return err(vm, format!("could not find module `{path}`"));
    };
    match vm.run_source(Some(path.clone()), &source) {
        Ok(_) => {
            let module_ref = *vm.modules.get(&path).expect("run_source registers the module");
            ok(vm, args_base, Value::Obj(module_ref))
        }
        Err(e) => err(vm, e.to_string()),
    }
}

fn recv_err_checked(vm: &mut Vm, args_base: usize, what: &str) -> Result<String, PrimOutcome> {
    let v = arg(vm, args_base, 1);
    match as_string(vm, v) {
        Some(s) => Ok(s.to_string()),
        None => Err(err(vm, format!("{what} expects a String"))),
    }
}

pub(crate) fn system_get_module_variable(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    let module_name = match as_string(vm, arg(vm, args_base, 1)) {
        Some(s) => s.to_string(),
        None => return err(vm, "module name must be a String"),
    };
    let var_name = match as_string(vm, arg(vm, args_base, 2)) {
        Some(s) => s.to_string(),
        None => return err(vm, "variable name must be a String"),
    };
    let Some(&module_ref) = vm.modules.get(&module_name) else {
        return err(vm, format!("module `{module_name}` is not loaded"));
    };
    let Some(ObjData::Module(m)) = vm.heap.get(module_ref) else { return err(vm, "corrupt module") };
    match m.find_var(&var_name) {
        Some(idx) => {
            let v = m.get(idx);
            ok(vm, args_base, v)
        }
        None => err(vm, format!("module `{module_name}` has no variable `{var_name}`")),
    }
}

pub(crate) fn system_write_string(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    let v = arg(vm, args_base, 1);
    let text = vm.display_value(v);
    use std::io::Write;
    print!("{text}");
    let _ = std::io::stdout().flush();
    ok(vm, args_base, v)
}

pub(crate) fn system_clock(vm: &mut Vm, args_base: usize) -> PrimOutcome {
    let secs = vm.clock_seconds();
    ok_num(vm, args_base, secs)
}
