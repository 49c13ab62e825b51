//! compiler.rs — the Pratt expression parser fused with statement/class/
//! import compilation (spec.md §4.2). Single-pass: there is no intermediate
//! AST, every parse step emits directly into the active `CompileUnit`'s
//! `ObjFn`.

use std::collections::HashMap;

use lumen_core::heap::{Heap, ObjData, ObjRef};
use lumen_core::op::Op;
use lumen_core::string_obj::LString;
use lumen_core::symbol::SymbolTable;
use lumen_core::value::Value;
use lumen_core::{Module, ObjFn};

use crate::compile_unit::{ClassBookKeep, CompileUnit, LoopCtx, ScopeDepth, MODULE_SCOPE};
use crate::diagnostics::Diagnostics;
use crate::lexer::Lexer;
use crate::precedence::{lbp, Precedence};
use crate::signature::Signature;
use crate::token::{Token, TokenKind};

enum ClassBinding {
    Module(u16),
    Local(u16),
}

/// The compiler. Owns the token stream and borrows the heap/method-name
/// table it needs to intern string constants and class/method names as it
/// goes — string literals and class names become real `ObjString`s the
/// moment they're compiled, exactly like the teacher's single-pass
/// `Codegen`.
pub struct Compiler<'a> {
    heap: &'a mut Heap,
    methods: &'a mut SymbolTable,
    module: ObjRef,
    tokens: Vec<Token>,
    pos: usize,
    diags: Diagnostics,
    units: Vec<CompileUnit>,
    /// Forward-declared module variables awaiting a real definition
    /// (spec.md's Redesign Flag: an explicit set, not a line-number
    /// sentinel stashed in the variable's value slot).
    pending_vars: HashMap<String, (u16, u32)>,
    current_class: Option<ClassBookKeep>,
    current_class_binding: Option<ClassBinding>,
    /// Compile-unit stack depth of the method currently compiling, so
    /// nested closures inside a method don't accidentally treat their own
    /// locals as instance fields.
    method_unit_depth: Option<usize>,
    /// Set to the constructor's bare name while compiling a constructor's
    /// instance body, so a bare `super(...)`/`super.new(...)` inside it
    /// resolves to the superclass's own `"init " + signature` instance
    /// entry (see `compile_constructor`) rather than its public static one.
    current_ctor_name: Option<String>,
}

impl<'a> Compiler<'a> {
    pub fn new(heap: &'a mut Heap, methods: &'a mut SymbolTable, module: ObjRef) -> Self {
        Self {
            heap,
            methods,
            module,
            tokens: Vec::new(),
            pos: 0,
            diags: Diagnostics::default(),
            units: Vec::new(),
            pending_vars: HashMap::new(),
            current_class: None,
            current_class_binding: None,
            method_unit_depth: None,
            current_ctor_name: None,
        }
    }

    /// Compile `source` as this module's top-level body, returning the
    /// finished `ObjFn` or the diagnostics collected along the way.
    pub fn compile_module(mut self, source: &str) -> Result<ObjFn, Diagnostics> {
        let tokens = match Lexer::new(source).lex_all() {
            Ok(t) => t,
            Err(e) => {
                self.diags.error(0, e.to_string());
                return Err(self.diags);
            }
        };
        self.tokens = tokens;

        let top = ObjFn::new(self.module, "<script>");
        self.units.push(CompileUnit::new_module_unit(top));

        while !self.check(&TokenKind::Eof) {
            if let Err(e) = self.statement() {
                let line = self.peek().line;
                self.diags.error(line, e);
                self.synchronize();
            }
        }

        let line = self.peek().line;
        self.emit_op(Op::PushNull, line, 1);
        self.emit_op(Op::Return, line, -1);

        for (name, (_, line)) in self.pending_vars.drain().collect::<Vec<_>>() {
            self.diags.error(line, format!("undefined variable '{name}'"));
        }

        if !self.diags.is_empty() {
            return Err(self.diags);
        }

        let mut unit = self.units.pop().expect("module compile unit");
        unit.function.max_stack_slots_used = unit.max_slots;
        Ok(unit.function)
    }

    // ---- token stream -----------------------------------------------

    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.tokens[self.pos].kind
    }

    fn advance(&mut self) -> Token {
        let tok = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn match_tok(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<(), String> {
        if self.check(&kind) {
            self.advance();
            Ok(())
        } else {
            Err(format!(
                "line {}: expected {:?}, found {:?}",
                self.peek().line,
                kind,
                self.peek().kind
            ))
        }
    }

    fn expect_ident(&mut self) -> Result<String, String> {
        match self.peek().kind.clone() {
            TokenKind::Ident(name) => {
                self.advance();
                Ok(name)
            }
            other => Err(format!("line {}: expected identifier, found {other:?}", self.peek().line)),
        }
    }

    /// Resynchronize after a parse error: skip to the next token that could
    /// plausibly start a new statement.
    fn synchronize(&mut self) {
        loop {
            match self.peek_kind() {
                TokenKind::Eof
                | TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::If
                | TokenKind::While
                | TokenKind::For
                | TokenKind::Return
                | TokenKind::Import => return,
                TokenKind::Semicolon => {
                    self.advance();
                    return;
                }
                _ => {
                    self.advance();
                }
            }
        }
    }

    // ---- compile unit / emission --------------------------------------

    fn cur(&mut self) -> &mut CompileUnit {
        self.units.last_mut().expect("no active compile unit")
    }

    fn emit_op(&mut self, op: Op, line: u32, delta: i32) -> usize {
        let pc = self.cur().function.push_op(op, line);
        self.cur().note_stack_effect(delta);
        pc
    }

    fn emit_jump(&mut self, make: impl Fn(i16) -> Op, delta: i32, line: u32) -> usize {
        let pc = self.cur().function.code.len();
        self.cur().function.push_op(make(0), line);
        self.cur().note_stack_effect(delta);
        pc
    }

    fn patch_jump(&mut self, pc: usize) {
        let target = self.cur().function.code.len() as i64;
        let offset = (target - pc as i64 - 1) as i16;
        match &mut self.cur().function.code[pc] {
            Op::Jump(o) | Op::JumpIfFalse(o) | Op::And(o) | Op::Or(o) => *o = offset,
            other => panic!("patch_jump on non-jump op {other:?}"),
        }
    }

    fn emit_loop(&mut self, cond_start: usize, line: u32) {
        let pc = self.cur().function.code.len() as i64;
        let offset = -(pc + 1 - cond_start as i64);
        self.emit_op(Op::Loop(offset as i16), line, 0);
    }

    fn patch_breaks(&mut self, body_start: usize, _line: u32) {
        let end = self.cur().function.code.len();
        for i in body_start..end {
            if matches!(self.cur().function.code[i], Op::End) {
                let offset = (end as i64 - i as i64 - 1) as i16;
                self.cur().function.code[i] = Op::Jump(offset);
            }
        }
    }

    fn begin_scope(&mut self) {
        self.cur().scope_depth += 1;
    }

    fn end_scope(&mut self, line: u32) {
        let depth = self.cur().scope_depth;
        loop {
            let should_pop = matches!(self.cur().locals.last(), Some(l) if l.depth >= depth);
            if !should_pop {
                break;
            }
            let captured = self.cur().locals.last().unwrap().is_captured;
            self.cur().locals.pop();
            if captured {
                self.emit_op(Op::CloseUpvalue, line, -1);
            } else {
                self.emit_op(Op::Pop, line, -1);
            }
        }
        self.cur().scope_depth -= 1;
    }

    fn discard_locals_since(&mut self, depth: ScopeDepth, line: u32) {
        for local in self.cur().locals.iter().rev() {
            if local.depth <= depth {
                break;
            }
            if local.is_captured {
                self.emit_op(Op::CloseUpvalue, line, -1);
            } else {
                self.emit_op(Op::Pop, line, -1);
            }
        }
    }

    fn push_loop(&mut self, cond_start: usize, body_start: usize) {
        let scope_depth = self.cur().scope_depth;
        let enclosing = self.cur().loop_ctx.take();
        self.cur().loop_ctx = Some(Box::new(LoopCtx { cond_start, body_start, scope_depth, enclosing }));
    }

    fn pop_loop(&mut self) {
        let enclosing = self.cur().loop_ctx.take().and_then(|b| b.enclosing);
        self.cur().loop_ctx = enclosing;
    }

    // ---- heap / module helpers -----------------------------------------

    fn intern_string_constant(&mut self, s: &str) -> u16 {
        let (r, _) = self.heap.manage(ObjData::String(LString::new(s)), None);
        self.cur().function.add_constant(Value::Obj(r))
    }

    fn module_find_var(&self, name: &str) -> Option<u16> {
        match self.heap.get(self.module) {
            Some(ObjData::Module(m)) => m.find_var(name),
            _ => None,
        }
    }

    fn module_declare(&mut self, name: &str, value: Value) -> u16 {
        match self.heap.get_mut(self.module) {
            Some(ObjData::Module(m)) => m.declare(name, value),
            _ => unreachable!("compiler's module ref must be an ObjData::Module"),
        }
    }

    fn resolve_or_forward_declare_module_var(&mut self, name: &str, line: u32) -> u16 {
        if let Some(idx) = self.module_find_var(name) {
            return idx;
        }
        let idx = self.module_declare(name, Value::Undefined);
        self.pending_vars.entry(name.to_string()).or_insert((idx, line));
        idx
    }

    fn declare_module_var(&mut self, name: &str, line: u32) -> Result<u16, String> {
        if let Some((idx, _)) = self.pending_vars.remove(name) {
            return Ok(idx);
        }
        if self.module_find_var(name).is_some() {
            return Err(format!("line {line}: module variable '{name}' is already defined"));
        }
        Ok(self.module_declare(name, Value::Null))
    }

    // ---- functions -------------------------------------------------------

    fn begin_function(&mut self, debug_name: String, is_method: bool) {
        let f = ObjFn::new(self.module, debug_name);
        self.units.push(CompileUnit::new(f, is_method));
    }

    /// Pop the innermost compile unit, heap-allocate its finished `ObjFn`,
    /// and emit `CreateClosure` in the (now current) enclosing unit.
    fn finish_function(&mut self, line: u32) {
        let unit = self.units.pop().expect("finish_function: no unit");
        let CompileUnit { mut function, upvalues, max_slots, .. } = unit;
        function.max_stack_slots_used = max_slots;
        function.upvalue_count = upvalues.len() as u16;
        let (fn_ref, _) = self.heap.manage(ObjData::Fn(function), None);
        let const_idx = self.cur().function.add_constant(Value::Obj(fn_ref));
        let pairs: Vec<(bool, u16)> = upvalues.iter().map(|u| (u.is_enclosing_local, u.index)).collect();
        self.emit_op(Op::CreateClosure(const_idx, pairs), line, 1);
    }

    fn compile_statements_until_rbrace(&mut self) -> Result<(), String> {
        while !self.check(&TokenKind::RBrace) && !self.check(&TokenKind::Eof) {
            if let Err(e) = self.statement() {
                let line = self.peek().line;
                self.diags.error(line, e);
                self.synchronize();
            }
        }
        self.expect(TokenKind::RBrace)
    }

    fn resolve_upvalue(&mut self, unit_index: usize, name: &str) -> Result<Option<u16>, String> {
        if unit_index == 0 {
            return Ok(None);
        }
        let enclosing_index = unit_index - 1;
        if let Some(slot) = self.units[enclosing_index].resolve_local(name) {
            self.units[enclosing_index].locals[slot as usize].is_captured = true;
            return Ok(Some(self.units[unit_index].add_upvalue(true, slot)?));
        }
        if let Some(outer) = self.resolve_upvalue(enclosing_index, name)? {
            return Ok(Some(self.units[unit_index].add_upvalue(false, outer)?));
        }
        Ok(None)
    }

    fn try_field(&mut self, name: &str) -> Option<u16> {
        let in_method = self.method_unit_depth == Some(self.units.len());
        if !in_method {
            return None;
        }
        let cb = self.current_class.as_mut()?;
        if cb.in_static {
            return None;
        }
        cb.field_index(name).ok()
    }

    // ---- statements -------------------------------------------------------

    fn statement(&mut self) -> Result<(), String> {
        let line = self.peek().line;
        match self.peek_kind().clone() {
            TokenKind::Semicolon => {
                self.advance();
                Ok(())
            }
            TokenKind::LBrace => {
                self.advance();
                self.begin_scope();
                self.compile_statements_until_rbrace()?;
                self.end_scope(line);
                Ok(())
            }
            TokenKind::Var => self.var_declaration(),
            TokenKind::If => self.if_statement(line),
            TokenKind::While => self.while_statement(line),
            TokenKind::For => self.for_statement(line),
            TokenKind::Return => self.return_statement(line),
            TokenKind::Break => {
                self.advance();
                self.break_statement(line)?;
                self.match_tok(&TokenKind::Semicolon);
                Ok(())
            }
            TokenKind::Continue => {
                self.advance();
                self.continue_statement(line)?;
                self.match_tok(&TokenKind::Semicolon);
                Ok(())
            }
            TokenKind::Class => self.class_declaration(line),
            TokenKind::Import => self.import_statement(line),
            TokenKind::Fun => self.fun_declaration(line),
            _ => self.expression_statement(line),
        }
    }

    fn var_declaration(&mut self) -> Result<(), String> {
        let line = self.peek().line;
        self.expect(TokenKind::Var)?;
        let name = self.expect_ident()?;
        if self.match_tok(&TokenKind::Eq) {
            self.expression(Precedence::Lowest)?;
        } else {
            self.emit_op(Op::PushNull, line, 1);
        }
        self.match_tok(&TokenKind::Semicolon);
        if self.cur().scope_depth == MODULE_SCOPE {
            let idx = self.declare_module_var(&name, line)?;
            self.emit_op(Op::StoreModuleVar(idx), line, 0);
            self.emit_op(Op::Pop, line, -1);
        } else {
            let depth = self.cur().scope_depth;
            if self.cur().locals.iter().any(|l| l.depth == depth && l.name == name) {
                return Err(format!("line {line}: variable '{name}' already declared in this scope"));
            }
            self.cur().add_local(name)?;
        }
        Ok(())
    }

    fn expression_statement(&mut self, line: u32) -> Result<(), String> {
        self.expression(Precedence::Lowest)?;
        self.emit_op(Op::Pop, line, -1);
        self.match_tok(&TokenKind::Semicolon);
        Ok(())
    }

    fn if_statement(&mut self, line: u32) -> Result<(), String> {
        self.expect(TokenKind::If)?;
        self.expect(TokenKind::LParen)?;
        self.expression(Precedence::Lowest)?;
        self.expect(TokenKind::RParen)?;
        let else_jump = self.emit_jump(Op::JumpIfFalse, -1, line);
        self.statement()?;
        if self.match_tok(&TokenKind::Else) {
            let end_jump = self.emit_jump(Op::Jump, 0, line);
            self.patch_jump(else_jump);
            self.statement()?;
            self.patch_jump(end_jump);
        } else {
            self.patch_jump(else_jump);
        }
        Ok(())
    }

    fn while_statement(&mut self, line: u32) -> Result<(), String> {
        self.expect(TokenKind::While)?;
        let cond_start = self.cur().function.code.len();
        self.expect(TokenKind::LParen)?;
        self.expression(Precedence::Lowest)?;
        self.expect(TokenKind::RParen)?;
        let exit_jump = self.emit_jump(Op::JumpIfFalse, -1, line);
        let body_start = self.cur().function.code.len();
        self.push_loop(cond_start, body_start);
        self.statement()?;
        self.emit_loop(cond_start, line);
        self.patch_jump(exit_jump);
        self.patch_breaks(body_start, line);
        self.pop_loop();
        Ok(())
    }

    /// `for v in E { body }` lowering (spec.md §4.2): hidden `seq `/`iter `
    /// locals, `seq.iterate(iter)` drives the loop condition, and
    /// `seq.iteratorValue(iter)` (the standard Wren-family convention for
    /// this exact lowering) produces the visible loop variable each pass.
    fn for_statement(&mut self, line: u32) -> Result<(), String> {
        self.expect(TokenKind::For)?;
        let var_name = self.expect_ident()?;
        self.expect(TokenKind::In)?;
        self.begin_scope();
        self.expression(Precedence::Lowest)?;
        let seq_slot = self.cur().add_local(" seq ")?;
        self.emit_op(Op::PushNull, line, 1);
        let iter_slot = self.cur().add_local(" iter ")?;

        let cond_start = self.cur().function.code.len();
        self.emit_op(Op::LoadLocal(seq_slot), line, 1);
        self.emit_op(Op::LoadLocal(iter_slot), line, 1);
        let iterate_id = self.methods.intern(&Signature::method("iterate", 1).render());
        self.emit_op(Op::Call(iterate_id, 1), line, -1);
        self.emit_op(Op::StoreLocal(iter_slot), line, 0);
        let exit_jump = self.emit_jump(Op::JumpIfFalse, -1, line);

        let body_start = self.cur().function.code.len();
        self.begin_scope();
        self.emit_op(Op::LoadLocal(seq_slot), line, 1);
        self.emit_op(Op::LoadLocal(iter_slot), line, 1);
        let iterval_id = self.methods.intern(&Signature::method("iteratorValue", 1).render());
        self.emit_op(Op::Call(iterval_id, 1), line, -1);
        self.cur().add_local(var_name)?;
        self.push_loop(cond_start, body_start);
        self.statement()?;
        self.end_scope(line);
        self.emit_loop(cond_start, line);
        self.patch_jump(exit_jump);
        self.patch_breaks(body_start, line);
        self.pop_loop();
        self.end_scope(line);
        Ok(())
    }

    fn return_statement(&mut self, line: u32) -> Result<(), String> {
        self.expect(TokenKind::Return)?;
        if self.check(&TokenKind::Semicolon) || self.check(&TokenKind::RBrace) || self.check(&TokenKind::Eof) {
            self.emit_op(Op::PushNull, line, 1);
        } else {
            self.expression(Precedence::Lowest)?;
        }
        self.match_tok(&TokenKind::Semicolon);
        self.emit_op(Op::Return, line, -1);
        Ok(())
    }

    fn break_statement(&mut self, line: u32) -> Result<(), String> {
        let loop_ctx = self.cur().loop_ctx.as_ref().ok_or_else(|| format!("line {line}: 'break' outside a loop"))?;
        let scope_depth = loop_ctx.scope_depth;
        self.discard_locals_since(scope_depth, line);
        self.emit_op(Op::End, line, 0);
        Ok(())
    }

    fn continue_statement(&mut self, line: u32) -> Result<(), String> {
        let loop_ctx =
            self.cur().loop_ctx.as_ref().ok_or_else(|| format!("line {line}: 'continue' outside a loop"))?;
        let (scope_depth, cond_start) = (loop_ctx.scope_depth, loop_ctx.cond_start);
        self.discard_locals_since(scope_depth, line);
        self.emit_loop(cond_start, line);
        Ok(())
    }

    fn import_statement(&mut self, line: u32) -> Result<(), String> {
        self.expect(TokenKind::Import)?;
        let module_name = self.expect_ident()?;

        let sys_idx = self.resolve_or_forward_declare_module_var("System", line);
        self.emit_op(Op::LoadModuleVar(sys_idx), line, 1);
        let name_cix = self.intern_string_constant(&module_name);
        self.emit_op(Op::LoadConstant(name_cix), line, 1);
        let import_id = self.methods.intern(&Signature::method("importModule", 1).render());
        self.emit_op(Op::Call(import_id, 1), line, -1);

        if self.match_tok(&TokenKind::For) {
            loop {
                let var_name = self.expect_ident()?;
                let sys_idx = self.resolve_or_forward_declare_module_var("System", line);
                self.emit_op(Op::LoadModuleVar(sys_idx), line, 1);
                let m_cix = self.intern_string_constant(&module_name);
                self.emit_op(Op::LoadConstant(m_cix), line, 1);
                let v_cix = self.intern_string_constant(&var_name);
                self.emit_op(Op::LoadConstant(v_cix), line, 1);
                let getvar_id = self.methods.intern(&Signature::method("getModuleVariable", 2).render());
                self.emit_op(Op::Call(getvar_id, 2), line, -2);
                if self.cur().scope_depth == MODULE_SCOPE {
                    let idx = self.declare_module_var(&var_name, line)?;
                    self.emit_op(Op::StoreModuleVar(idx), line, 0);
                    self.emit_op(Op::Pop, line, -1);
                } else {
                    self.cur().add_local(var_name)?;
                }
                if !self.match_tok(&TokenKind::Comma) {
                    break;
                }
            }
        } else {
            self.emit_op(Op::Pop, line, -1);
        }
        self.match_tok(&TokenKind::Semicolon);
        Ok(())
    }

    fn fun_declaration(&mut self, line: u32) -> Result<(), String> {
        self.expect(TokenKind::Fun)?;
        let name = self.expect_ident()?;
        self.begin_function(format!("Fn {name}"), false);
        self.expect(TokenKind::LParen)?;
        let mut params = Vec::new();
        if !self.check(&TokenKind::RParen) {
            loop {
                params.push(self.expect_ident()?);
                if !self.match_tok(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen)?;
        for p in &params {
            self.cur().add_local(p.clone())?;
        }
        self.cur().function.arity = params.len() as u8;
        self.expect(TokenKind::LBrace)?;
        self.compile_statements_until_rbrace()?;
        self.emit_op(Op::PushNull, line, 1);
        self.emit_op(Op::Return, line, -1);
        self.finish_function(line);

        let binding_name = format!("Fn {name}");
        if self.cur().scope_depth == MODULE_SCOPE {
            let idx = self.declare_module_var(&binding_name, line)?;
            self.emit_op(Op::StoreModuleVar(idx), line, 0);
            self.emit_op(Op::Pop, line, -1);
        } else {
            self.cur().add_local(binding_name)?;
        }
        Ok(())
    }

    /// Emit the sequence that loads the class reference being built, for
    /// use immediately before each member closure (spec.md §4.2's
    /// `INSTANCE_METHOD`/`STATIC_METHOD` stack protocol).
    fn load_current_class_ref(&mut self, line: u32) -> Result<(), String> {
        match self.current_class_binding {
            Some(ClassBinding::Module(idx)) => self.emit_op(Op::LoadModuleVar(idx), line, 1),
            Some(ClassBinding::Local(slot)) => self.emit_op(Op::LoadLocal(slot), line, 1),
            None => return Err("internal error: no class being compiled".to_string()),
        };
        Ok(())
    }

    fn class_declaration(&mut self, line: u32) -> Result<(), String> {
        self.expect(TokenKind::Class)?;
        let name = self.expect_ident()?;
        let name_cix = self.intern_string_constant(&name);
        self.emit_op(Op::LoadConstant(name_cix), line, 1);

        if self.match_tok(&TokenKind::Lt) {
            self.expression(Precedence::Call)?;
        } else {
            self.identifier_expr("Object".to_string(), line, false)?;
        }

        let field_count_pc = self.cur().function.code.len();
        self.emit_op(Op::CreateClass(0), line, -1);

        if self.cur().scope_depth == MODULE_SCOPE {
            let idx = self.declare_module_var(&name, line)?;
            self.emit_op(Op::StoreModuleVar(idx), line, 0);
            self.current_class_binding = Some(ClassBinding::Module(idx));
        } else {
            let slot = self.cur().add_local(name.clone())?;
            self.current_class_binding = Some(ClassBinding::Local(slot));
        }

        self.current_class = Some(ClassBookKeep::new(name));
        self.expect(TokenKind::LBrace)?;
        while !self.check(&TokenKind::RBrace) && !self.check(&TokenKind::Eof) {
            if let Err(e) = self.class_member(line) {
                let l = self.peek().line;
                self.diags.error(l, e);
                self.synchronize();
            }
        }
        self.expect(TokenKind::RBrace)?;

        let field_count = self.current_class.take().map(|c| c.fields.len()).unwrap_or(0) as u8;
        if let Op::CreateClass(n) = &mut self.cur().function.code[field_count_pc] {
            *n = field_count;
        }
        self.current_class_binding = None;
        self.emit_op(Op::Pop, line, -1);
        Ok(())
    }

    fn class_member(&mut self, _class_line: u32) -> Result<(), String> {
        let line = self.peek().line;
        let is_static = self.match_tok(&TokenKind::Static);
        if let Some(cb) = &mut self.current_class {
            cb.in_static = is_static;
        }

        if self.match_tok(&TokenKind::LBracket) {
            let mut arity = 0u8;
            let mut params = Vec::new();
            if !self.check(&TokenKind::RBracket) {
                loop {
                    params.push(self.expect_ident()?);
                    arity += 1;
                    if !self.match_tok(&TokenKind::Comma) {
                        break;
                    }
                }
            }
            self.expect(TokenKind::RBracket)?;
            if self.match_tok(&TokenKind::Eq) {
                self.expect(TokenKind::LParen)?;
                let value_param = self.expect_ident()?;
                self.expect(TokenKind::RParen)?;
                params.push(value_param);
                return self.compile_member(Signature::subscript_setter(arity), params, line, false);
            }
            return self.compile_member(Signature::subscript(arity), params, line, false);
        }

        let name = match self.peek().kind.clone() {
            TokenKind::Ident(n) => {
                self.advance();
                n
            }
            TokenKind::Construct => {
                self.advance();
                "new".to_string()
            }
            other => operator_method_name(&other)
                .map(|n| {
                    self.advance();
                    n.to_string()
                })
                .ok_or_else(|| format!("line {line}: expected a method name, found {other:?}"))?,
        };

        if self.match_tok(&TokenKind::Eq) {
            self.expect(TokenKind::LParen)?;
            let param = self.expect_ident()?;
            self.expect(TokenKind::RParen)?;
            return self.compile_member(Signature::setter(name), vec![param], line, false);
        }

        if self.match_tok(&TokenKind::LParen) {
            let mut params = Vec::new();
            if !self.check(&TokenKind::RParen) {
                loop {
                    params.push(self.expect_ident()?);
                    if !self.match_tok(&TokenKind::Comma) {
                        break;
                    }
                }
            }
            self.expect(TokenKind::RParen)?;
            let in_static = self.current_class.as_ref().map(|c| c.in_static).unwrap_or(false);
            if name == "new" && !in_static {
                return self.compile_constructor(name, params, line);
            }
            let sig = Signature::method(name, params.len() as u8);
            return self.compile_member(sig, params, line, false);
        }

        self.compile_member(Signature::getter(name), Vec::new(), line, false)
    }

    /// Compile one class member: load the class ref, build the member
    /// closure, bind it with `INSTANCE_METHOD`/`STATIC_METHOD`.
    fn compile_member(
        &mut self,
        sig: Signature,
        params: Vec<String>,
        line: u32,
        is_constructor: bool,
    ) -> Result<(), String> {
        debug_assert!(!is_constructor, "constructors go through compile_constructor");
        self.load_current_class_ref(line)?;
        let debug_name = sig.render();
        self.begin_function(debug_name, true);
        self.method_unit_depth = Some(self.units.len());
        for p in &params {
            self.cur().add_local(p.clone())?;
        }
        self.cur().function.arity = params.len() as u8;
        self.expect(TokenKind::LBrace)?;
        self.compile_statements_until_rbrace()?;
        self.emit_op(Op::PushNull, line, 1);
        self.emit_op(Op::Return, line, -1);
        self.method_unit_depth = None;
        self.finish_function(line);

        let id = self.methods.intern(&sig.render());
        let is_static_member = self.current_class.as_ref().map(|c| c.in_static).unwrap_or(false);
        if is_static_member {
            self.emit_op(Op::StaticMethod(id), line, -2);
            if let Some(cb) = &mut self.current_class {
                cb.static_methods.push(id);
            }
        } else {
            self.emit_op(Op::InstanceMethod(id), line, -2);
            if let Some(cb) = &mut self.current_class {
                cb.instance_methods.push(id);
            }
        }
        Ok(())
    }

    /// Constructors compile to *two* closures, mirroring how a subclass's
    /// `super(...)` must reach the superclass's field-initialization body
    /// without re-allocating the instance `CONSTRUCT` already built:
    ///
    /// - an instance-side body, bound under the internal signature
    ///   `"init " + "new(...)"`, that runs the user's constructor block
    ///   directly against an *already-existing* `this` (slot 0) — this is
    ///   what a subclass's `super()`/`super.new(...)` dispatches to;
    /// - a tiny static wrapper bound under the public `new(...)` signature
    ///   that does `CONSTRUCT`, forwards its params into the instance body,
    ///   and returns the freshly built instance.
    fn compile_constructor(&mut self, name: String, params: Vec<String>, line: u32) -> Result<(), String> {
        let argc = params.len() as u8;
        let ctor_sig = Signature::constructor(name.clone(), argc);
        let init_name = format!("init {}", ctor_sig.render());

        // 1. instance body: runs with `this` already constructed.
        self.load_current_class_ref(line)?;
        self.begin_function(init_name.clone(), true);
        self.method_unit_depth = Some(self.units.len());
        let prev_ctor = self.current_ctor_name.replace(name.clone());
        for p in &params {
            self.cur().add_local(p.clone())?;
        }
        self.cur().function.arity = argc;
        self.expect(TokenKind::LBrace)?;
        self.compile_statements_until_rbrace()?;
        self.emit_op(Op::LoadLocal(0), line, 1);
        self.emit_op(Op::Return, line, -1);
        self.current_ctor_name = prev_ctor;
        self.method_unit_depth = None;
        self.finish_function(line);

        let init_id = self.methods.intern(&init_name);
        self.emit_op(Op::InstanceMethod(init_id), line, -2);
        if let Some(cb) = &mut self.current_class {
            cb.instance_methods.push(init_id);
        }

        // 2. static wrapper: CONSTRUCT, forward args, delegate, return self.
        self.load_current_class_ref(line)?;
        self.begin_function(ctor_sig.render(), true);
        for p in &params {
            self.cur().add_local(p.clone())?;
        }
        self.cur().function.arity = argc;
        self.emit_op(Op::Construct, line, 0);
        for slot in 0..=argc {
            self.emit_op(Op::LoadLocal(slot as u16), line, 1);
        }
        self.emit_op(Op::Call(init_id, argc), line, -(argc as i32));
        self.emit_op(Op::Pop, line, -1);
        self.emit_op(Op::LoadLocal(0), line, 1);
        self.emit_op(Op::Return, line, -1);
        self.finish_function(line);

        let ctor_id = self.methods.intern(&ctor_sig.render());
        self.emit_op(Op::StaticMethod(ctor_id), line, -2);
        if let Some(cb) = &mut self.current_class {
            cb.static_methods.push(ctor_id);
        }
        Ok(())
    }

    // ---- expressions -------------------------------------------------------

    fn expression(&mut self, rbp: Precedence) -> Result<(), String> {
        let can_assign = rbp < Precedence::Assign;
        self.parse_nud(can_assign)?;
        while lbp(self.peek_kind()) > rbp {
            self.parse_led(can_assign)?;
        }
        Ok(())
    }

    fn parse_nud(&mut self, can_assign: bool) -> Result<(), String> {
        let tok = self.advance();
        let line = tok.line;
        match tok.kind {
            TokenKind::Number(n) => {
                let cix = self.cur().function.add_constant(Value::Num(n));
                self.emit_op(Op::LoadConstant(cix), line, 1);
            }
            TokenKind::String(s) => {
                let cix = self.intern_string_constant(&s);
                self.emit_op(Op::LoadConstant(cix), line, 1);
            }
            TokenKind::True => {
                self.emit_op(Op::PushTrue, line, 1);
            }
            TokenKind::False => {
                self.emit_op(Op::PushFalse, line, 1);
            }
            TokenKind::Null => {
                self.emit_op(Op::PushNull, line, 1);
            }
            TokenKind::This => {
                self.emit_op(Op::LoadLocal(0), line, 1);
            }
            TokenKind::Super => self.super_nud(line)?,
            TokenKind::Ident(name) => self.identifier_expr(name, line, can_assign)?,
            TokenKind::LParen => {
                self.expression(Precedence::Lowest)?;
                self.expect(TokenKind::RParen)?;
            }
            TokenKind::LBracket => self.list_literal(line)?,
            TokenKind::LBrace => self.map_literal(line)?,
            TokenKind::Minus => {
                self.expression(Precedence::Unary)?;
                self.emit_unary_call("-", line);
            }
            TokenKind::Bang => {
                self.expression(Precedence::Unary)?;
                self.emit_unary_call("!", line);
            }
            TokenKind::Tilde => {
                self.expression(Precedence::Unary)?;
                self.emit_unary_call("~", line);
            }
            TokenKind::Fun => self.fn_literal_expr(line)?,
            other => return Err(format!("line {line}: unexpected token {other:?} in expression")),
        }
        Ok(())
    }

    fn parse_led(&mut self, can_assign: bool) -> Result<(), String> {
        let tok = self.advance();
        let line = tok.line;
        match tok.kind {
            TokenKind::Dot => self.dot_led(can_assign, line)?,
            TokenKind::LBracket => self.subscript_led(can_assign, line)?,
            TokenKind::LParen => self.paren_call_led(line)?,
            TokenKind::Question => self.conditional_led(line)?,
            TokenKind::AndAnd => self.and_led(line)?,
            TokenKind::OrOr => self.or_led(line)?,
            op @ (TokenKind::Plus
            | TokenKind::Minus
            | TokenKind::Star
            | TokenKind::Slash
            | TokenKind::Percent
            | TokenKind::Lt
            | TokenKind::LtEq
            | TokenKind::Gt
            | TokenKind::GtEq
            | TokenKind::EqEq
            | TokenKind::BangEq
            | TokenKind::Pipe
            | TokenKind::Amp
            | TokenKind::Caret
            | TokenKind::ShiftLeft
            | TokenKind::ShiftRight
            | TokenKind::DotDot
            | TokenKind::DotDotDot
            | TokenKind::Is) => self.binary_led(op, line)?,
            other => return Err(format!("line {line}: unexpected infix token {other:?}")),
        }
        Ok(())
    }

    fn emit_unary_call(&mut self, name: &str, line: u32) {
        let id = self.methods.intern(&Signature::getter(name).render());
        self.emit_op(Op::Call(id, 0), line, 0);
    }

    fn binary_led(&mut self, op_kind: TokenKind, line: u32) -> Result<(), String> {
        let prec = lbp(&op_kind);
        self.expression(prec)?;
        let name = operator_method_name(&op_kind).expect("binary_led only called for operator tokens");
        let id = self.methods.intern(&Signature::method(name, 1).render());
        self.emit_op(Op::Call(id, 1), line, -1);
        Ok(())
    }

    fn and_led(&mut self, line: u32) -> Result<(), String> {
        let jump = self.emit_jump(Op::And, 0, line);
        self.expression(Precedence::LogicAnd)?;
        self.patch_jump(jump);
        Ok(())
    }

    fn or_led(&mut self, line: u32) -> Result<(), String> {
        let jump = self.emit_jump(Op::Or, 0, line);
        self.expression(Precedence::LogicOr)?;
        self.patch_jump(jump);
        Ok(())
    }

    fn conditional_led(&mut self, line: u32) -> Result<(), String> {
        let else_jump = self.emit_jump(Op::JumpIfFalse, -1, line);
        self.expression(Precedence::Assign)?;
        let end_jump = self.emit_jump(Op::Jump, 0, line);
        self.patch_jump(else_jump);
        self.expect(TokenKind::Colon)?;
        self.expression(Precedence::Condition)?;
        self.patch_jump(end_jump);
        Ok(())
    }

    fn dot_led(&mut self, can_assign: bool, line: u32) -> Result<(), String> {
        let name = self.expect_ident()?;
        if self.check(&TokenKind::LParen) || self.check(&TokenKind::LBrace) {
            let argc = self.parse_optional_call_args_with_block(line)?;
            let id = self.methods.intern(&Signature::method(name, argc).render());
            self.emit_op(Op::Call(id, argc), line, -(argc as i32));
        } else if can_assign && self.match_tok(&TokenKind::Eq) {
            self.expression(Precedence::Assign)?;
            let id = self.methods.intern(&Signature::setter(name).render());
            self.emit_op(Op::Call(id, 1), line, -1);
        } else {
            let id = self.methods.intern(&Signature::getter(name).render());
            self.emit_op(Op::Call(id, 0), line, 0);
        }
        Ok(())
    }

    fn subscript_led(&mut self, can_assign: bool, line: u32) -> Result<(), String> {
        let mut arity = 0u8;
        if !self.check(&TokenKind::RBracket) {
            loop {
                self.expression(Precedence::Condition)?;
                arity += 1;
                if !self.match_tok(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RBracket)?;
        if can_assign && self.match_tok(&TokenKind::Eq) {
            self.expression(Precedence::Assign)?;
            let id = self.methods.intern(&Signature::subscript_setter(arity).render());
            self.emit_op(Op::Call(id, arity + 1), line, -((arity as i32) + 1));
        } else {
            let id = self.methods.intern(&Signature::subscript(arity).render());
            self.emit_op(Op::Call(id, arity), line, -(arity as i32));
        }
        Ok(())
    }

    /// A call applied directly to an already-evaluated receiver value, e.g.
    /// `(list.first)(arg)` — routed through the universal `call` dispatch
    /// used for `Fn` values.
    fn paren_call_led(&mut self, line: u32) -> Result<(), String> {
        let mut argc = 0u8;
        if !self.check(&TokenKind::RParen) {
            loop {
                self.expression(Precedence::Condition)?;
                argc += 1;
                if !self.match_tok(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen)?;
        let id = self.methods.intern(&Signature::method("call", argc).render());
        self.emit_op(Op::Call(id, argc), line, -(argc as i32));
        Ok(())
    }

    /// `super(...)` and `super.name(...)`. A bare `super(...)` only makes
    /// sense inside a constructor's instance body (it delegates to the
    /// superclass's own constructor body, not its public static entry
    /// point — see `compile_constructor`); `super.name(...)` is an ordinary
    /// instance-method dispatch starting one class up the chain.
    fn super_nud(&mut self, line: u32) -> Result<(), String> {
        self.emit_op(Op::LoadLocal(0), line, 1);
        let explicit_name = if self.match_tok(&TokenKind::Dot) {
            Some(self.expect_ident()?)
        } else {
            None
        };
        let argc = self.parse_optional_call_args_with_block(line)?;
        let rendered = match explicit_name {
            Some(name) => Signature::method(name, argc).render(),
            None => {
                let ctor_name = self.current_ctor_name.clone().unwrap_or_else(|| "new".to_string());
                format!("init {}", Signature::constructor(ctor_name, argc).render())
            }
        };
        let id = self.methods.intern(&rendered);
        let super_const = self.cur().function.add_constant(Value::Null);
        self.emit_op(Op::Super(id, argc, super_const), line, -(argc as i32));
        Ok(())
    }

    fn list_literal(&mut self, line: u32) -> Result<(), String> {
        let mut count = 0u16;
        if !self.check(&TokenKind::RBracket) {
            loop {
                self.expression(Precedence::Condition)?;
                count += 1;
                if !self.match_tok(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RBracket)?;
        self.emit_op(Op::BuildList(count), line, 1 - count as i32);
        Ok(())
    }

    fn map_literal(&mut self, line: u32) -> Result<(), String> {
        let mut count = 0u16;
        if !self.check(&TokenKind::RBrace) {
            loop {
                self.expression(Precedence::Condition)?;
                self.expect(TokenKind::Colon)?;
                self.expression(Precedence::Assign)?;
                count += 1;
                if !self.match_tok(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RBrace)?;
        self.emit_op(Op::BuildMap(count), line, 1 - 2 * (count as i32));
        Ok(())
    }

    fn fn_literal_expr(&mut self, line: u32) -> Result<(), String> {
        self.expect(TokenKind::LParen)?;
        let mut params = Vec::new();
        if !self.check(&TokenKind::RParen) {
            loop {
                params.push(self.expect_ident()?);
                if !self.match_tok(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen)?;
        self.begin_function("<fn>".to_string(), false);
        for p in &params {
            self.cur().add_local(p.clone())?;
        }
        self.cur().function.arity = params.len() as u8;
        self.expect(TokenKind::LBrace)?;
        self.compile_statements_until_rbrace()?;
        self.emit_op(Op::PushNull, line, 1);
        self.emit_op(Op::Return, line, -1);
        self.finish_function(line);
        Ok(())
    }

    /// Trailing block-argument sugar: `thread.call { ... }` / `Fn.new { ... }`.
    /// Optional `|a, b|` parameter list, otherwise zero-arity.
    fn compile_block_fn_literal(&mut self, line: u32) -> Result<(), String> {
        self.expect(TokenKind::LBrace)?;
        let mut params = Vec::new();
        if self.match_tok(&TokenKind::Pipe) {
            loop {
                params.push(self.expect_ident()?);
                if !self.match_tok(&TokenKind::Comma) {
                    break;
                }
            }
            self.expect(TokenKind::Pipe)?;
        }
        self.begin_function("<block>".to_string(), false);
        for p in &params {
            self.cur().add_local(p.clone())?;
        }
        self.cur().function.arity = params.len() as u8;
        self.compile_statements_until_rbrace()?;
        self.emit_op(Op::PushNull, line, 1);
        self.emit_op(Op::Return, line, -1);
        self.finish_function(line);
        Ok(())
    }

    fn parse_optional_call_args_with_block(&mut self, line: u32) -> Result<u8, String> {
        let mut argc = 0u8;
        if self.match_tok(&TokenKind::LParen) {
            if !self.check(&TokenKind::RParen) {
                loop {
                    self.expression(Precedence::Condition)?;
                    argc += 1;
                    if !self.match_tok(&TokenKind::Comma) {
                        break;
                    }
                }
            }
            self.expect(TokenKind::RParen)?;
        }
        if self.check(&TokenKind::LBrace) {
            self.compile_block_fn_literal(line)?;
            argc += 1;
        }
        Ok(argc)
    }

    /// Bare identifier in call position: the universal `call` dispatch on
    /// whatever it resolves to, except for an un-bound lowercase name
    /// inside a class body, which dispatches `this.name(...)` directly
    /// (spec.md §4.2 resolution steps 1 and 6, collapsed — see DESIGN.md).
    fn call_sugar_on_name(&mut self, name: &str, line: u32) -> Result<(), String> {
        if let Some(slot) = self.cur().resolve_local(name) {
            self.emit_op(Op::LoadLocal(slot), line, 1);
            return self.finish_universal_call(line);
        }
        if let Some(idx) = self.resolve_upvalue(self.units.len() - 1, name)? {
            self.emit_op(Op::LoadUpvalue(idx), line, 1);
            return self.finish_universal_call(line);
        }
        if let Some(field_idx) = self.try_field(name) {
            self.emit_op(Op::LoadThisField(field_idx), line, 1);
            return self.finish_universal_call(line);
        }
        if self.current_class.is_some() && Token::starts_lowercase(name) {
            self.emit_op(Op::LoadLocal(0), line, 1);
            let argc = self.parse_call_args_parens(line)?;
            let id = self.methods.intern(&Signature::method(name, argc).render());
            self.emit_op(Op::Call(id, argc), line, -(argc as i32));
            return Ok(());
        }
        let fn_name = format!("Fn {name}");
        let idx = self.resolve_or_forward_declare_module_var(&fn_name, line);
        self.emit_op(Op::LoadModuleVar(idx), line, 1);
        self.finish_universal_call(line)
    }

    fn finish_universal_call(&mut self, line: u32) -> Result<(), String> {
        let argc = self.parse_call_args_parens(line)?;
        let id = self.methods.intern(&Signature::method("call", argc).render());
        self.emit_op(Op::Call(id, argc), line, -(argc as i32));
        Ok(())
    }

    fn parse_call_args_parens(&mut self, line: u32) -> Result<u8, String> {
        self.expect(TokenKind::LParen)?;
        let mut argc = 0u8;
        if !self.check(&TokenKind::RParen) {
            loop {
                self.expression(Precedence::Condition)?;
                argc += 1;
                if !self.match_tok(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen)?;
        if self.check(&TokenKind::LBrace) {
            self.compile_block_fn_literal(line)?;
            argc += 1;
        }
        Ok(argc)
    }

    /// Bare identifier resolution, spec.md §4.2 steps 2–5 and 7 (see
    /// `call_sugar_on_name` for the call-position steps 1/6).
    fn identifier_expr(&mut self, name: String, line: u32, can_assign: bool) -> Result<(), String> {
        if self.check(&TokenKind::LParen) {
            return self.call_sugar_on_name(&name, line);
        }

        if let Some(slot) = self.cur().resolve_local(&name) {
            if can_assign && self.match_tok(&TokenKind::Eq) {
                self.expression(Precedence::Assign)?;
                self.emit_op(Op::StoreLocal(slot), line, 0);
            } else {
                self.emit_op(Op::LoadLocal(slot), line, 1);
            }
            return Ok(());
        }
        if let Some(idx) = self.resolve_upvalue(self.units.len() - 1, &name)? {
            if can_assign && self.match_tok(&TokenKind::Eq) {
                self.expression(Precedence::Assign)?;
                self.emit_op(Op::StoreUpvalue(idx), line, 0);
            } else {
                self.emit_op(Op::LoadUpvalue(idx), line, 1);
            }
            return Ok(());
        }
        if let Some(field_idx) = self.try_field(&name) {
            if can_assign && self.match_tok(&TokenKind::Eq) {
                self.expression(Precedence::Assign)?;
                self.emit_op(Op::StoreThisField(field_idx), line, 0);
            } else {
                self.emit_op(Op::LoadThisField(field_idx), line, 1);
            }
            return Ok(());
        }

        let idx = self.resolve_or_forward_declare_module_var(&name, line);
        if can_assign && self.match_tok(&TokenKind::Eq) {
            self.expression(Precedence::Assign)?;
            self.emit_op(Op::StoreModuleVar(idx), line, 0);
        } else {
            self.emit_op(Op::LoadModuleVar(idx), line, 1);
        }
        Ok(())
    }
}

fn operator_method_name(kind: &TokenKind) -> Option<&'static str> {
    use TokenKind::*;
    Some(match kind {
        Plus => "+",
        Minus => "-",
        Star => "*",
        Slash => "/",
        Percent => "%",
        Lt => "<",
        LtEq => "<=",
        Gt => ">",
        GtEq => ">=",
        EqEq => "==",
        BangEq => "!=",
        Pipe => "|",
        Amp => "&",
        Caret => "^",
        ShiftLeft => "<<",
        ShiftRight => ">>",
        DotDot => "..",
        DotDotDot => "...",
        Is => "is",
        Bang => "!",
        Tilde => "~",
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_core::heap::Heap;
    use lumen_core::symbol::SymbolTable;

    fn compile(src: &str) -> Result<ObjFn, Diagnostics> {
        let mut heap = Heap::new();
        let mut methods = SymbolTable::new();
        let (module, _) = heap.manage(ObjData::Module(Module::new(None)), None);
        Compiler::new(&mut heap, &mut methods, module).compile_module(src)
    }

    #[test]
    fn compiles_fibonacci() {
        let f = compile("fun fib(n) { if (n<2) return n; return fib(n-1)+fib(n-2) }\nSystem.writeString_(fib(10).toString)").unwrap();
        assert!(!f.code.is_empty());
    }

    #[test]
    fn compiles_class_with_inheritance() {
        let src = r#"
            class A { new() { } greet() { return "a" } }
            class B < A { new() { super() } greet() { return super.greet() + "b" } }
            System.writeString_(B.new().greet())
        "#;
        compile(src).unwrap();
    }

    #[test]
    fn reports_undefined_variable_with_line() {
        let err = compile("System.writeString_(neverDefined)").unwrap_err();
        assert!(err.first().is_some());
    }

    #[test]
    fn compiles_closure_capture_and_map_list_literals() {
        compile("fun mk() { var i = 0; return Fn.new { i = i + 1; return i } }\nvar f = mk()").unwrap();
        compile(r#"var m = { "a": [1,2,3] }"#).unwrap();
    }

    #[test]
    fn compiles_break_in_nested_loop() {
        compile("for i in 1..3 { for j in 1..3 { if (j==2) break; System.writeString_(j.toString) } }").unwrap();
    }
}
