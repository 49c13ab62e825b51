//! diagnostics.rs — structured compile errors (spec.md §7's `compile` kind).
//!
//! Grounded on the teacher's `vitte-compiler::Diagnostics`/`Diag` pair, kept
//! to a `Vec` of line-qualified messages rather than a full span/label
//! system — this language's compiler reports one error per stray construct,
//! not a rustc-style multi-label diagnostic.

use std::fmt;

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub line: u32,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

#[derive(Debug, Default)]
pub struct Diagnostics {
    errors: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn error(&mut self, line: u32, message: impl Into<String>) {
        self.errors.push(Diagnostic { line, message: message.into() });
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.errors.iter()
    }

    pub fn first(&self) -> Option<&Diagnostic> {
        self.errors.first()
    }
}
