//! lumen-vm — the threaded bytecode interpreter, method dispatch, and core
//! bindings (spec.md §4.3, §4.4, §5).
//!
//! [`Vm`] owns the heap, the interned method-name table, and the currently
//! running thread/fiber. It is deliberately *not* `Send`/`Sync`: spec.md §5
//! describes a cooperative, single-OS-thread concurrency model, and rather
//! than rely on a doc comment to say so, the `PhantomData<*const ()>` field
//! below makes the type system refuse to let a `Vm` cross a thread boundary
//! — no `unsafe impl` required either way.

#![deny(rust_2018_idioms, unused_must_use)]

mod core_lib;
mod interp;
mod primitives;

pub use core_lib::CoreClasses;
pub use interp::PrimOutcome;
pub use primitives::PrimFn;

use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::PathBuf;

use lumen_core::heap::{Heap, ObjData};
use lumen_core::symbol::SymbolTable;
use lumen_core::{Closure, Error, ObjFn, ObjRef, Result, Thread, Value};
use lumen_compiler::Diagnostics;

/// spec.md §7: "all errors print a single line". `lumen-cli` supplies the
/// file path; this renders the rest as `<line> "<message>"`, so the two
/// concatenate into the required `<file>:<line> "<message>"`.
fn first_diagnostic(diags: &Diagnostics) -> String {
    match diags.first() {
        Some(d) => format!("{} \"{}\"", d.line, d.message),
        None => "unknown compile error".to_string(),
    }
}

/// The interpreter: one heap, one method-name table, and whichever fiber
/// (`Thread`) is currently running. `modules` mirrors spec.md §4.4's
/// module registry, keyed by the name `System.importModule` was given.
pub struct Vm {
    pub(crate) heap: Heap,
    pub(crate) methods: SymbolTable,
    pub(crate) classes: CoreClasses,
    pub(crate) modules: HashMap<String, ObjRef>,
    pub(crate) core_module: ObjRef,
    pub(crate) cur_thread: ObjRef,
    pub(crate) primitives: Vec<PrimFn>,
    /// Flipped once `CoreClasses` is fully populated; `CREATE_CLASS`
    /// consults it to decide whether a brand-new metaclass's own
    /// `class_of` should be stamped to `Class` yet (it can't be, while
    /// `Class` itself is still mid-bootstrap).
    pub(crate) core_ready: bool,
    /// Directories searched for `import`ed modules, entry-script directory
    /// first (spec.md §6).
    pub(crate) search_paths: Vec<PathBuf>,
    /// `Thread.call`'s side-table for resuming a caller fiber: when thread
    /// `k` calls into another thread, its own `[receiver, arg?]` window is
    /// left uncollapsed on its stack (a fiber switch doesn't unwind through
    /// `Op::Return`'s normal bookkeeping), so `Thread.yield` needs to know
    /// where on `k`'s stack to later deposit the resumed value. Keyed by
    /// the calling thread.
    pub(crate) resume_slots: HashMap<ObjRef, usize>,
    /// Temporary-root stack (spec.md §4.1, §4.3): a freshly `heap.manage`d
    /// handle is not yet reachable from any other root, so it's pushed here
    /// before any further allocation that might collect, and popped once
    /// it's stored somewhere reachable. See `Vm::manage_rooted`/`Vm::unpin`.
    pub(crate) temp_roots: Vec<ObjRef>,
    _not_send: PhantomData<*const ()>,
}

impl Vm {
    /// Build a fresh interpreter: allocate the heap, compile and run the
    /// embedded `core.lm` bootstrap script (spec.md §4.4), then rebind
    /// every signature it declares to a native primitive.
    pub fn new() -> Result<Self> {
        let mut heap = Heap::new();
        let mut methods = SymbolTable::new();

        let (core_module, core_fn) =
            lumen_compiler::compile_module(&mut heap, &mut methods, None, core_lib::CORE_SOURCE)
                .map_err(|diags| Error::Compile(first_diagnostic(&diags)))?;
        let (func_ref, _) = heap.manage(ObjData::Fn(core_fn), None);
        let (closure_ref, _) = heap.manage(ObjData::Closure(Closure::new(func_ref, Vec::new())), None);
        let (bootstrap_thread, _) = heap.manage(ObjData::Thread(Thread::new(closure_ref)), None);

        let mut vm = Vm {
            heap,
            methods,
            classes: CoreClasses::placeholder(core_module),
            modules: HashMap::new(),
            core_module,
            cur_thread: bootstrap_thread,
            primitives: Vec::new(),
            core_ready: false,
            search_paths: Vec::new(),
            resume_slots: HashMap::new(),
            temp_roots: Vec::new(),
            _not_send: PhantomData,
        };

        // Running core.lm's top level only declares classes and stub
        // method bodies (every body is `{}`, i.e. `PushNull; Return`) —
        // no `Call` ever executes, so `vm.classes` being placeholders
        // throughout this run is safe; nothing consults them yet.
        vm.run_thread(bootstrap_thread)?;
        vm.classes = core_lib::resolve_core_classes(&vm.heap, core_module)?;
        vm.core_ready = true;
        core_lib::bind_primitives(&mut vm);

        vm.heap.set_class(bootstrap_thread, vm.classes.thread_class);
        vm.modules.insert(String::new(), core_module);
        Ok(vm)
    }

    /// Directories to search for `import`ed modules, tried in order.
    pub fn add_search_path(&mut self, dir: PathBuf) {
        self.search_paths.push(dir);
    }

    /// Compile `source` as module `module_name` and run its top-level body
    /// to completion on a fresh thread, returning the final expression
    /// value (spec.md §4.3's module-init convention: a trailing implicit
    /// `return null`, or whatever the last statement's `Return` left
    /// behind).
    pub fn run_source(&mut self, module_name: Option<String>, source: &str) -> Result<Value> {
        let (module_ref, func) =
            lumen_compiler::compile_module(&mut self.heap, &mut self.methods, module_name.clone(), source)
                .map_err(|diags| Error::Compile(first_diagnostic(&diags)))?;
        self.seed_system_var(module_ref);
        let thread_ref = self.spawn_thread_for(func, module_ref)?;
        if let Some(name) = module_name {
            self.modules.insert(name, module_ref);
        }
        self.run_thread(thread_ref)
    }

    /// Entry point `lumen-cli` drives: read `path`, compile it as the
    /// unnamed main module, and run it, with the file's parent directory
    /// as the first `import` search path.
    pub fn run_file(&mut self, path: &std::path::Path, source: &str) -> Result<Value> {
        if let Some(dir) = path.parent() {
            self.add_search_path(dir.to_path_buf());
        }
        self.run_source(None, source)
    }

    fn spawn_thread_for(&mut self, func: ObjFn, module: ObjRef) -> Result<ObjRef> {
        let func_ref = self.manage_rooted(ObjData::Fn(func), None);
        let closure_ref = self.manage_rooted(ObjData::Closure(Closure::new(func_ref, Vec::new())), None);
        self.unpin(); // func_ref: now reachable through closure_ref's function field
        let thread_ref = self.manage_rooted(ObjData::Thread(Thread::new(closure_ref)), Some(self.classes.thread_class));
        self.unpin(); // closure_ref: now reachable through thread_ref's frame
        self.unpin(); // thread_ref: caller stores it (run_source/resolve_core_classes etc.)
        let _ = module;
        Ok(thread_ref)
    }

    /// Every module gets `System` pre-populated as a module variable
    /// pointing at the one `System` class (spec.md §4.4) — this is what
    /// lets ordinary user code resolve `System.importModule(...)` /
    /// `System.writeString_(...)` as a plain module variable lookup, the
    /// same forward-reference machinery a class uses to see another class
    /// declared later in the same module. `declare` alone isn't enough:
    /// if `System` was already forward-referenced (and so already has an
    /// index, still holding `Undefined`), it returns early without
    /// touching the value, so the index is always re-`set` explicitly.
    fn seed_system_var(&mut self, module_ref: ObjRef) {
        let system = Value::Obj(self.classes.system_class);
        if let Some(ObjData::Module(m)) = self.heap.get_mut(module_ref) {
            let idx = m.declare("System", system);
            m.set(idx, system);
        }
    }

    /// `System.importModule(path)`'s file lookup: try `path.lm` under each
    /// registered search directory, entry-script directory first.
    pub(crate) fn load_module_source(&self, name: &str) -> Option<String> {
        for dir in &self.search_paths {
            let candidate = dir.join(format!("{name}.lm"));
            if let Ok(s) = std::fs::read_to_string(&candidate) {
                return Some(s);
            }
        }
        None
    }

    /// `System.clock`'s wall-clock reading (spec.md §6).
    pub(crate) fn clock_seconds(&self) -> f64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs_f64()).unwrap_or(0.0)
    }
}
