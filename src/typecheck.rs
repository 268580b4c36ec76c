//! Operator type checking for function bodies.
//!
//! The checker maintains the abstract value-type stack and control
//! stack that mirror what the interpreter will see at run time. Each
//! operator hook verifies the Wasm stack discipline and updates both
//! stacks; the code emitter additionally consults the checker's view
//! (label signatures, stack heights, reachability) when it computes
//! how many values a branch has to drop.
//!
//! Dead code after an unconditional transfer is stack-polymorphic:
//! once a label is marked unreachable its portion of the value stack
//! is discarded, and popping past the label's entry height yields a
//! wildcard that satisfies any expected type.

use crate::error::{Error, Result};
use crate::opcode::Opcode;
use crate::types::ValueType;

/// What kind of control scope a checker label was opened for.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LabelKind {
    Func,
    Block,
    Loop,
    If,
    Else,
}

/// One open control scope, as the checker sees it.
#[derive(Clone, Debug)]
pub struct CheckerLabel {
    /// The construct that opened this scope.
    pub kind: LabelKind,
    /// The scope's result signature.
    pub sig: Vec<ValueType>,
    /// Height of the value stack when the scope was opened.
    pub type_stack_limit: usize,
    /// Whether the rest of the scope is dead code.
    pub unreachable: bool,
}

impl CheckerLabel {
    /// The types a branch targeting this label must provide: nothing
    /// for a loop (a branch re-enters the scope), the result
    /// signature otherwise.
    pub fn br_types(&self) -> &[ValueType] {
        match self.kind {
            LabelKind::Loop => &[],
            _ => &self.sig,
        }
    }
}

/// The abstract stack machine driven by the translator.
#[derive(Default)]
pub struct TypeChecker {
    type_stack: Vec<ValueType>,
    label_stack: Vec<CheckerLabel>,
    br_table_sig: Option<Vec<ValueType>>,
}

impl TypeChecker {
    pub fn new() -> TypeChecker {
        TypeChecker::default()
    }

    /// Resets the checker and opens the implicit function scope with
    /// the function's result signature.
    pub fn begin_function(&mut self, results: &[ValueType]) {
        self.type_stack.clear();
        self.label_stack.clear();
        self.br_table_sig = None;
        self.push_label(LabelKind::Func, results);
    }

    /// The label `depth` steps below the innermost open scope.
    pub fn label(&self, depth: u32) -> Result<&CheckerLabel> {
        let len = self.label_stack.len();
        len.checked_sub(1 + depth as usize)
            .and_then(|i| self.label_stack.get(i))
            .ok_or_else(|| {
                Error::validation(format!("invalid depth: {depth} (max {})", len))
            })
    }

    /// Current height of the value-type stack.
    pub fn type_stack_size(&self) -> usize {
        self.type_stack.len()
    }

    /// Whether the current position is in dead code.
    pub fn is_unreachable(&self) -> bool {
        self.label_stack.last().map_or(true, |label| label.unreachable)
    }

    pub fn on_block(&mut self, sig: &[ValueType]) -> Result<()> {
        self.push_label(LabelKind::Block, sig);
        Ok(())
    }

    pub fn on_loop(&mut self, sig: &[ValueType]) -> Result<()> {
        self.push_label(LabelKind::Loop, sig);
        Ok(())
    }

    pub fn on_if(&mut self, sig: &[ValueType]) -> Result<()> {
        self.pop_and_check_1(ValueType::I32, "if")?;
        self.push_label(LabelKind::If, sig);
        Ok(())
    }

    pub fn on_else(&mut self) -> Result<()> {
        let (kind, sig) = self.top_label_parts()?;
        if kind != LabelKind::If {
            return Err(Error::validation("unexpected else"));
        }
        self.pop_and_check_signature(&sig, "if true branch")?;
        self.check_type_stack_end("if true branch")?;
        let label = self.top_label_mut()?;
        label.kind = LabelKind::Else;
        label.unreachable = false;
        let limit = label.type_stack_limit;
        self.type_stack.truncate(limit);
        Ok(())
    }

    pub fn on_end(&mut self) -> Result<()> {
        let (kind, sig) = self.top_label_parts()?;
        if kind == LabelKind::If && !sig.is_empty() {
            return Err(Error::validation(
                "if without else cannot have type signature",
            ));
        }
        let desc = match kind {
            LabelKind::Func => "function",
            LabelKind::Block => "block",
            LabelKind::Loop => "loop",
            LabelKind::If => "if",
            LabelKind::Else => "if false branch",
        };
        self.pop_and_check_signature(&sig, desc)?;
        self.check_type_stack_end(desc)?;
        let limit = self.top_label()?.type_stack_limit;
        self.type_stack.truncate(limit);
        self.label_stack.pop();
        self.type_stack.extend_from_slice(&sig);
        Ok(())
    }

    /// Closes the implicit function scope opened by
    /// [`begin_function`](Self::begin_function).
    pub fn end_function(&mut self) -> Result<()> {
        if self.top_label()?.kind != LabelKind::Func {
            return Err(Error::validation("unexpected end of function"));
        }
        self.on_end()
    }

    pub fn on_br(&mut self, depth: u32) -> Result<()> {
        let types = self.label(depth)?.br_types().to_vec();
        self.check_signature(&types, "br")?;
        self.set_unreachable();
        Ok(())
    }

    pub fn on_br_if(&mut self, depth: u32) -> Result<()> {
        self.pop_and_check_1(ValueType::I32, "br_if")?;
        let types = self.label(depth)?.br_types().to_vec();
        self.check_signature(&types, "br_if")?;
        Ok(())
    }

    pub fn begin_br_table(&mut self) -> Result<()> {
        self.br_table_sig = None;
        self.pop_and_check_1(ValueType::I32, "br_table")
    }

    /// Checks one `br_table` target. All targets of a table must
    /// agree on their branch signature.
    pub fn on_br_table_target(&mut self, depth: u32) -> Result<()> {
        let types = self.label(depth)?.br_types().to_vec();
        match &self.br_table_sig {
            Some(expected) if *expected != types => {
                return Err(Error::validation(
                    "br_table labels have inconsistent types",
                ));
            }
            Some(_) => {}
            None => self.br_table_sig = Some(types.clone()),
        }
        self.check_signature(&types, "br_table target")
    }

    pub fn end_br_table(&mut self) -> Result<()> {
        self.set_unreachable();
        Ok(())
    }

    pub fn on_call(&mut self, params: &[ValueType], results: &[ValueType]) -> Result<()> {
        self.pop_and_check_call(params, results, "call")
    }

    pub fn on_call_indirect(
        &mut self,
        params: &[ValueType],
        results: &[ValueType],
    ) -> Result<()> {
        self.pop_and_check_1(ValueType::I32, "call_indirect")?;
        self.pop_and_check_call(params, results, "call_indirect")
    }

    pub fn on_const(&mut self, ty: ValueType) -> Result<()> {
        self.type_stack.push(ty);
        Ok(())
    }

    pub fn on_get_local(&mut self, ty: ValueType) -> Result<()> {
        self.type_stack.push(ty);
        Ok(())
    }

    pub fn on_set_local(&mut self, ty: ValueType) -> Result<()> {
        self.pop_and_check_1(ty, "set_local")
    }

    pub fn on_tee_local(&mut self, ty: ValueType) -> Result<()> {
        self.pop_and_check_1(ty, "tee_local")?;
        self.type_stack.push(ty);
        Ok(())
    }

    pub fn on_get_global(&mut self, ty: ValueType) -> Result<()> {
        self.type_stack.push(ty);
        Ok(())
    }

    pub fn on_set_global(&mut self, ty: ValueType) -> Result<()> {
        self.pop_and_check_1(ty, "set_global")
    }

    pub fn on_drop(&mut self) -> Result<()> {
        self.drop_types(1, "drop")
    }

    pub fn on_select(&mut self) -> Result<()> {
        self.peek_and_check(0, ValueType::I32, "select")?;
        let ty = self.peek_type(1, "select")?;
        if let Some(expected) = ty {
            self.peek_and_check(2, expected, "select")?;
        }
        self.drop_types(3, "select")?;
        if let Some(ty) = ty {
            self.type_stack.push(ty);
        }
        Ok(())
    }

    pub fn on_unary(&mut self, opcode: Opcode) -> Result<()> {
        self.check_opcode(opcode)
    }

    pub fn on_binary(&mut self, opcode: Opcode) -> Result<()> {
        self.check_opcode(opcode)
    }

    pub fn on_compare(&mut self, opcode: Opcode) -> Result<()> {
        self.check_opcode(opcode)
    }

    pub fn on_convert(&mut self, opcode: Opcode) -> Result<()> {
        self.check_opcode(opcode)
    }

    pub fn on_load(&mut self, opcode: Opcode) -> Result<()> {
        self.check_opcode(opcode)
    }

    pub fn on_store(&mut self, opcode: Opcode) -> Result<()> {
        self.check_opcode(opcode)
    }

    pub fn on_current_memory(&mut self) -> Result<()> {
        self.check_opcode(Opcode::CurrentMemory)
    }

    pub fn on_grow_memory(&mut self) -> Result<()> {
        self.check_opcode(Opcode::GrowMemory)
    }

    pub fn on_return(&mut self) -> Result<()> {
        let depth = self.label_stack.len().saturating_sub(1) as u32;
        self.on_br(depth)
    }

    pub fn on_unreachable(&mut self) -> Result<()> {
        self.set_unreachable();
        Ok(())
    }

    fn push_label(&mut self, kind: LabelKind, sig: &[ValueType]) {
        self.label_stack.push(CheckerLabel {
            kind,
            sig: sig.to_vec(),
            type_stack_limit: self.type_stack.len(),
            unreachable: false,
        });
    }

    fn top_label(&self) -> Result<&CheckerLabel> {
        self.label_stack
            .last()
            .ok_or_else(|| Error::validation("control stack empty"))
    }

    fn top_label_mut(&mut self) -> Result<&mut CheckerLabel> {
        self.label_stack
            .last_mut()
            .ok_or_else(|| Error::validation("control stack empty"))
    }

    fn top_label_parts(&self) -> Result<(LabelKind, Vec<ValueType>)> {
        let label = self.top_label()?;
        Ok((label.kind, label.sig.clone()))
    }

    fn set_unreachable(&mut self) {
        if let Some(label) = self.label_stack.last_mut() {
            label.unreachable = true;
            let limit = label.type_stack_limit;
            self.type_stack.truncate(limit);
        }
    }

    /// The type `depth` values below the top of the stack; `None` is
    /// the wildcard produced by popping through dead code.
    fn peek_type(&self, depth: usize, desc: &str) -> Result<Option<ValueType>> {
        let label = self.top_label()?;
        if label.type_stack_limit + depth >= self.type_stack.len() {
            if label.unreachable {
                Ok(None)
            } else {
                Err(Error::validation(format!(
                    "type stack size too small at {desc}. got {}, expected at least {}",
                    self.type_stack.len() - label.type_stack_limit,
                    depth + 1
                )))
            }
        } else {
            Ok(Some(self.type_stack[self.type_stack.len() - depth - 1]))
        }
    }

    fn peek_and_check(&self, depth: usize, expected: ValueType, desc: &str) -> Result<()> {
        match self.peek_type(depth, desc)? {
            None => Ok(()),
            Some(actual) if actual == expected => Ok(()),
            Some(actual) => Err(Error::validation(format!(
                "type mismatch in {desc}, expected {expected} but got {actual}"
            ))),
        }
    }

    fn drop_types(&mut self, count: usize, desc: &str) -> Result<()> {
        let label = self.top_label()?;
        let limit = label.type_stack_limit;
        if limit + count > self.type_stack.len() {
            if label.unreachable {
                self.type_stack.truncate(limit);
                return Ok(());
            }
            return Err(Error::validation(format!(
                "type stack size too small at {desc}. got {}, expected at least {count}",
                self.type_stack.len() - limit
            )));
        }
        let new_len = self.type_stack.len() - count;
        self.type_stack.truncate(new_len);
        Ok(())
    }

    /// Checks that `sig` sits on top of the stack without consuming
    /// it.
    fn check_signature(&self, sig: &[ValueType], desc: &str) -> Result<()> {
        for (i, ty) in sig.iter().enumerate() {
            self.peek_and_check(sig.len() - i - 1, *ty, desc)?;
        }
        Ok(())
    }

    fn pop_and_check_signature(&mut self, sig: &[ValueType], desc: &str) -> Result<()> {
        self.check_signature(sig, desc)?;
        self.drop_types(sig.len(), desc)
    }

    fn pop_and_check_1(&mut self, expected: ValueType, desc: &str) -> Result<()> {
        self.peek_and_check(0, expected, desc)?;
        self.drop_types(1, desc)
    }

    fn pop_and_check_call(
        &mut self,
        params: &[ValueType],
        results: &[ValueType],
        desc: &str,
    ) -> Result<()> {
        self.pop_and_check_signature(params, desc)?;
        self.type_stack.extend_from_slice(results);
        Ok(())
    }

    fn check_opcode(&mut self, opcode: Opcode) -> Result<()> {
        let (params, results) = opcode.stack_signature().ok_or_else(|| {
            Error::validation(format!("{} is not a pure stack operator", opcode.name()))
        })?;
        self.pop_and_check_call(params, results, opcode.name())
    }

    fn check_type_stack_end(&self, desc: &str) -> Result<()> {
        let label = self.top_label()?;
        if self.type_stack.len() != label.type_stack_limit {
            return Err(Error::validation(format!(
                "type stack at end of {desc} is {}, expected 0",
                self.type_stack.len() - label.type_stack_limit
            )));
        }
        Ok(())
    }
}
