//! signature.rs — method-signature structure and canonical-form rendering
//! (spec.md §4.2, §6).

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureKind {
    Getter,
    Setter,
    Method,
    Constructor,
    Subscript,
    SubscriptSetter,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub kind: SignatureKind,
    pub name: String,
    pub arity: u8,
}

impl Signature {
    pub fn getter(name: impl Into<String>) -> Self {
        Self { kind: SignatureKind::Getter, name: name.into(), arity: 0 }
    }

    pub fn setter(name: impl Into<String>) -> Self {
        Self { kind: SignatureKind::Setter, name: name.into(), arity: 1 }
    }

    pub fn method(name: impl Into<String>, arity: u8) -> Self {
        Self { kind: SignatureKind::Method, name: name.into(), arity }
    }

    pub fn constructor(name: impl Into<String>, arity: u8) -> Self {
        Self { kind: SignatureKind::Constructor, name: name.into(), arity }
    }

    pub fn subscript(arity: u8) -> Self {
        Self { kind: SignatureKind::Subscript, name: String::new(), arity }
    }

    pub fn subscript_setter(arity: u8) -> Self {
        // `arity` here is the subscript's index-argument count; the setter
        // value is the trailing implicit `=(_)` argument, per spec.md §6.
        Self { kind: SignatureKind::SubscriptSetter, name: String::new(), arity }
    }

    /// Render to the exact canonical string forms from spec.md §6. This is
    /// what gets interned into the global method-name symbol table.
    pub fn render(&self) -> String {
        let params = |n: u8| (0..n).map(|_| "_").collect::<Vec<_>>().join(",");
        match self.kind {
            SignatureKind::Getter => self.name.clone(),
            SignatureKind::Setter => format!("{}=(_)", self.name),
            SignatureKind::Method | SignatureKind::Constructor => {
                format!("{}({})", self.name, params(self.arity))
            }
            SignatureKind::Subscript => format!("[{}]", params(self.arity)),
            SignatureKind::SubscriptSetter => format!("[{}]=(_)", params(self.arity)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_every_canonical_shape() {
        assert_eq!(Signature::getter("name").render(), "name");
        assert_eq!(Signature::setter("name").render(), "name=(_)");
        assert_eq!(Signature::method("greet", 0).render(), "greet()");
        assert_eq!(Signature::method("greet", 2).render(), "greet(_,_)");
        assert_eq!(Signature::constructor("new", 2).render(), "new(_,_)");
        assert_eq!(Signature::subscript(2).render(), "[_,_]");
        assert_eq!(Signature::subscript_setter(2).render(), "[_,_]=(_)");
    }
}
