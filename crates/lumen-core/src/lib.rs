//! lumen-core — value & object model, symbol tables, memory manager and GC.
//!
//! This crate holds everything the compiler and the VM share but that
//! neither owns outright: the tagged [`Value`] type, the heap arena that
//! every `Obj*` lives in, the opcode set, and the tri-color mark-sweep
//! collector that reclaims unreachable objects.
//!
//! ## Modules
//! - `value`     : the tagged `Value` union (`undefined | null | bool | num | obj`).
//! - `heap`      : the single allocation entry point and the object arena.
//! - `gc`        : tri-color mark-sweep collector, rooted on a `Roots` impl.
//! - `op`        : the opcode set, stack-delta table, big-endian operand codec.
//! - `string_obj`, `class_obj`, `func_obj`, `collection_obj`, `instance_obj`,
//!   `module_obj`, `thread_obj` : the `Obj*` payload types from the data model.
//! - `symbol`    : interned name tables (method names, module variables).
//! - `disasm`    : human-readable disassembler for `ObjFn` instruction streams.

#![deny(rust_2018_idioms, unused_must_use)]

pub mod class_obj;
pub mod collection_obj;
pub mod disasm;
pub mod func_obj;
pub mod gc;
pub mod heap;
pub mod instance_obj;
pub mod module_obj;
pub mod op;
pub mod string_obj;
pub mod symbol;
pub mod thread_obj;
pub mod value;

pub use class_obj::{Class, Method, MethodTable};
pub use func_obj::{Closure, ObjFn, Upvalue, UpvalueState};
pub use heap::{Heap, ObjRef};
pub use module_obj::Module;
pub use op::Op;
pub use symbol::{Symbol, SymbolTable};
pub use thread_obj::{Frame, Thread};
pub use value::Value;

use thiserror::Error;

/// The five conceptual error kinds from the language specification.
///
/// `Io`/`Mem`/`Lex`/`Compile` are fatal at the point of detection; `Runtime`
/// is carried inside a thread's `error_obj` slot instead (see
/// `lumen_core::thread_obj::Thread`) and only becomes an `Error::Runtime`
/// once it escapes every caller thread.
#[derive(Debug, Error)]
pub enum Error {
    /// Failure to read the entry script or an imported module from disk.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    /// The memory manager could not satisfy an allocation.
    #[error("mem: {0}")]
    Mem(String),
    /// A lexical error: malformed token, unterminated string, etc.
    #[error("lex: {0}")]
    Lex(String),
    /// A compile-time error: undefined variable, redefinition, bad signature.
    #[error("compile: {0}")]
    Compile(String),
    /// An unrecovered runtime error (no caller thread left to re-raise on).
    #[error("runtime: {0}")]
    Runtime(String),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
