//! lumen-compiler — single-pass compiler from source text straight to
//! `lumen_core::ObjFn` bytecode (spec.md §4).
//!
//! There is no intermediate AST: the Pratt expression parser and the
//! statement/class/import compiler in [`compiler`] emit opcodes as they
//! recognize each construct, exactly the way the language's own original
//! implementation works and the way the teacher's single-pass MVP pipeline
//! is shaped. The compiler is handed a live `&mut Heap` and `&mut
//! SymbolTable` because string literals, nested-function objects, and
//! interned method names all need to land in the shared heap/table the
//! moment they're recognized — there's no separate "compiler-local" pool to
//! merge in afterwards.

#![deny(rust_2018_idioms, unused_must_use)]

pub mod compile_unit;
pub mod compiler;
pub mod diagnostics;
pub mod lexer;
pub mod precedence;
pub mod signature;
pub mod token;

pub use compiler::Compiler;
pub use diagnostics::{Diagnostic, Diagnostics};
pub use lexer::Lexer;
pub use signature::{Signature, SignatureKind};
pub use token::{Token, TokenKind};

use lumen_core::heap::{Heap, ObjData};
use lumen_core::symbol::SymbolTable;
use lumen_core::{Module, ObjFn, ObjRef};

/// Compile `source` as a brand-new module named `module_name` (or an
/// anonymous/main module when `None`), allocating the module object itself
/// and handing it to [`Compiler::compile_module`].
///
/// This is the entry point `lumen-vm` calls for the main script and for
/// every `System.importModule` resolution.
pub fn compile_module(
    heap: &mut Heap,
    methods: &mut SymbolTable,
    module_name: Option<String>,
    source: &str,
) -> Result<(ObjRef, ObjFn), Diagnostics> {
    let (module, _) = heap.manage(ObjData::Module(Module::new(module_name)), None);
    let func = Compiler::new(heap, methods, module).compile_module(source)?;
    Ok((module, func))
}
