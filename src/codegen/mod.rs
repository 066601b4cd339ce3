//! The statement and expression code generator.
//!
//! [`GenContext`] carries every bit of state the generator needs: the
//! output stream, the descriptor pool, the register file, the temp slot
//! bitmap and the diagnostic queue. One context compiles one unit;
//! allocator state resets at every function boundary.
//!
//! # Example
//!
//! ```
//! # use px16_codegen::ast::{Expr, FuncDef, Stmt};
//! # use px16_codegen::codegen::{GenContext, HashedPolicy};
//! # use px16_codegen::runner::CompilerConfig;
//! let func = FuncDef {
//!     ident: "answer".into(),
//!     params: vec![],
//!     body: Stmt::Return(Some(Expr::int(42))),
//! };
//!
//! let config = CompilerConfig::default();
//! let policy = HashedPolicy;
//! let mut ctx = GenContext::new(&config, &policy);
//! ctx.emit_function(&func).expect("codegen failed");
//!
//! let (out, diags) = ctx.finish();
//! assert!(diags.is_empty());
//! assert!(out.resolve().is_ok());
//! ```

mod expr;
mod materialize;
mod regalloc;
mod value;

#[cfg(test)]
mod tests;

pub use regalloc::{EvictionPolicy, FixedPolicy, HashedPolicy, RegMask};
pub use value::{Place, VarId, VarPool, VarSlot};

use log::trace;

use std::collections::HashMap;

use crate::ast::{Expr, FuncDef, Ident, Stmt};
use crate::diag::{CodegenError, Diagnostics, Severity};
use crate::isa::{op, AddrMode, Cond, Insn, Reg, NUM_REGS};
use crate::output::{AsmOut, Label, RefKind};
use crate::runner::CompilerConfig;

use regalloc::{RegFile, TempSlots};

/// How parameters travel into a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallConv {
    /// No parameters at all.
    None,
    /// Up to [`NUM_REGS`] parameters in `R0` upward, each with a
    /// reserved stack slot as its home.
    Regs,
    /// Everything on the stack, first parameter closest to the frame
    /// base.
    Stack,
}

impl CallConv {
    /// The convention for a parameter count.
    pub fn of(n_args: usize) -> Self {
        if n_args > NUM_REGS {
            CallConv::Stack
        } else if n_args > 0 {
            CallConv::Regs
        } else {
            CallConv::None
        }
    }
}

/// Addressing constraints of one inline assembly operand.
#[derive(Debug, Clone, Copy, Default)]
pub struct IasmConstraint {
    pub allow_const: bool,
    pub allow_reg: bool,
    pub allow_mem: bool,
}

/// All state of the code generator.
pub struct GenContext<'a> {
    config: &'a CompilerConfig,
    pub(crate) policy: &'a dyn EvictionPolicy,
    pub(crate) out: AsmOut,
    pub(crate) diags: Diagnostics,
    pub(crate) pool: VarPool,
    pub(crate) regs: RegFile,
    pub(crate) temps: TempSlots,
    /// Current frame depth in words.
    pub(crate) stack_size: i32,
    /// Bumped by every flag clobbering emission; pins condition
    /// descriptors to the flag state they were set under.
    pub(crate) cond_generation: u64,
    /// The condition descriptor set under the current flag state, if
    /// any. Clobbering the flags forces it into a 0/1 word first.
    pub(crate) live_cond: Option<VarId>,
    /// Name of the function currently being generated.
    pub(crate) func: String,
    /// Live descriptor per named variable.
    pub(crate) vars: HashMap<Ident, VarId>,
    locals_base: i32,
    local_count: i32,
    strings: Vec<(Label, String)>,
}

impl<'a> GenContext<'a> {
    /// Create a fresh context for one compilation unit.
    pub fn new(config: &'a CompilerConfig, policy: &'a dyn EvictionPolicy) -> Self {
        GenContext {
            config,
            policy,
            out: AsmOut::new(),
            diags: Diagnostics::new(),
            pool: VarPool::new(),
            regs: RegFile::new(),
            temps: TempSlots::new(),
            stack_size: 0,
            cond_generation: 0,
            live_cond: None,
            func: String::new(),
            vars: HashMap::new(),
            locals_base: 0,
            local_count: 0,
            strings: Vec::new(),
        }
    }

    /// Is position independent code requested?
    pub fn pie(&self) -> bool {
        self.config.pie()
    }

    /// The stream generated so far.
    pub fn stream(&self) -> &AsmOut {
        &self.out
    }

    /// The diagnostics collected so far.
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diags
    }

    /// Tear the context apart into its results.
    pub fn finish(mut self) -> (AsmOut, Diagnostics) {
        self.emit_string_pool();
        (self.out, self.diags)
    }

    /// Generate one function: label, prologue, body, epilogue.
    pub fn emit_function(&mut self, func: &FuncDef) -> Result<(), CodegenError> {
        trace!("// function {}", func.ident);
        self.func = func.ident.clone();
        self.pool.clear();
        self.regs.clear();
        self.temps.clear();
        self.vars.clear();
        self.stack_size = 0;
        self.local_count = 0;
        self.live_cond = None;

        self.out.bind_label(&func.ident);

        let n_args = func.params.len();
        let n_locals = count_locals(&func.body);
        match CallConv::of(n_args) {
            CallConv::Regs => {
                trace!("// calling convention: registers");
                for (i, name) in func.params.iter().enumerate() {
                    let reg = Reg::gp(i);
                    let home = Place::Stack {
                        offset: i as i32 + 1,
                    };
                    let id = self
                        .pool
                        .alloc(Place::Reg(reg), Some(name.clone()), Some(home));
                    self.regs.occupy(reg, id);
                    self.vars.insert(name.clone(), id);
                }
                self.locals_base = n_args as i32;
                self.gen_stack_space((n_args + n_locals) as u16)?;
            }
            CallConv::Stack => {
                trace!("// calling convention: stack");
                for (i, name) in func.params.iter().enumerate() {
                    // The caller pushed these above our return slot; the
                    // first parameter sits closest to the frame base.
                    let place = Place::Stack {
                        offset: -((n_args - i) as i32),
                    };
                    let id =
                        self.pool
                            .alloc(place.clone(), Some(name.clone()), Some(place));
                    self.vars.insert(name.clone(), id);
                }
                self.locals_base = 0;
                self.gen_stack_space(n_locals as u16)?;
            }
            CallConv::None => {
                trace!("// calling convention: no parameters");
                self.locals_base = 0;
                self.gen_stack_space(n_locals as u16)?;
            }
        }

        let terminated = self.gen_stmt(&func.body)?;
        if !terminated {
            self.gen_return_value(None)?;
        }
        self.stack_size = 0;
        Ok(())
    }

    /// Generate one statement. Returns whether the statement definitely
    /// transfers control away (every path returns or jumps).
    pub(crate) fn gen_stmt(&mut self, stmt: &Stmt) -> Result<bool, CodegenError> {
        let terminated = match stmt {
            Stmt::Block(stmts) => {
                let mut terminated = false;
                for stmt in stmts {
                    let t = self.gen_stmt(stmt)?;
                    terminated = terminated || t;
                }
                terminated
            }
            Stmt::If {
                cond,
                then_branch,
                else_branch,
            } => self.gen_if(cond, then_branch, else_branch.as_deref())?,
            Stmt::While {
                cond,
                body,
                do_while,
            } => {
                self.gen_while(cond, body, *do_while)?;
                false
            }
            Stmt::Return(expr) => {
                let retval = match expr {
                    Some(expr) => {
                        let hint = self.pool.temp(Place::Reg(Reg::R0));
                        Some(self.gen_expr(expr, Some(hint))?)
                    }
                    None => None,
                };
                self.gen_return_value(retval)?;
                true
            }
            Stmt::Declare { ident, init } => {
                self.declare_local(ident, init.as_ref())?;
                false
            }
            Stmt::Expr(expr) => {
                let id = self.gen_expr(expr, None)?;
                self.release(id);
                false
            }
            Stmt::InlineAsm(_) => {
                self.diags.report(
                    None,
                    Severity::Warn,
                    "inline assembly is not lowered yet, no code emitted",
                );
                false
            }
        };
        debug_assert!(self.check_occupancy().is_ok());
        Ok(terminated)
    }

    fn declare_local(&mut self, ident: &str, init: Option<&Expr>) -> Result<(), CodegenError> {
        self.local_count += 1;
        let place = Place::Stack {
            offset: self.locals_base + self.local_count,
        };
        let id = self
            .pool
            .alloc(place.clone(), Some(ident.to_string()), Some(place));
        self.vars.insert(ident.to_string(), id);
        if let Some(init) = init {
            let value = self.gen_expr(init, Some(id))?;
            if value != id {
                self.gen_mov(id, value)?;
                self.release(value);
            }
        }
        Ok(())
    }

    fn gen_if(
        &mut self,
        cond: &Expr,
        then_branch: &Stmt,
        else_branch: Option<&Stmt>,
    ) -> Result<bool, CodegenError> {
        let hint = self.cond_hint();
        let cond_var = self.gen_expr(cond, Some(hint))?;
        let saved = self.stack_size;
        let result = if let Some(else_branch) = else_branch {
            let l_true = self.out.fresh_label();
            self.branch(cond_var, Some(&l_true), None)?;
            let else_terminated = self.gen_stmt(else_branch)?;
            if else_terminated {
                self.forget_frame_growth(saved);
            } else {
                self.balance_frame(saved);
            }
            let l_skip = if else_terminated {
                // A dead jump over the true arm would never execute.
                None
            } else {
                let l_skip = self.out.fresh_label();
                self.jump(&l_skip);
                Some(l_skip)
            };
            self.out.bind_label(&l_true);
            let then_terminated = self.gen_stmt(then_branch)?;
            if then_terminated {
                self.forget_frame_growth(saved);
            } else {
                self.balance_frame(saved);
            }
            if let Some(l_skip) = l_skip {
                self.out.bind_label(&l_skip);
            }
            then_terminated && else_terminated
        } else {
            let l_skip = self.out.fresh_label();
            self.branch(cond_var, None, Some(&l_skip))?;
            let terminated = self.gen_stmt(then_branch)?;
            if terminated {
                self.forget_frame_growth(saved);
            } else {
                self.balance_frame(saved);
            }
            self.out.bind_label(&l_skip);
            false
        };
        if cond_var != hint {
            self.release(cond_var);
        }
        Ok(result)
    }

    fn gen_while(&mut self, cond: &Expr, body: &Stmt, do_while: bool) -> Result<(), CodegenError> {
        let l_loop = self.out.fresh_label();
        let l_check = self.out.fresh_label();

        // A plain while checks its condition before the first iteration.
        if !do_while {
            self.jump(&l_check);
        }

        self.out.bind_label(&l_loop);
        let saved = self.stack_size;
        let terminated = self.gen_stmt(body)?;
        // Every iteration must leave the frame where it found it, or the
        // displacements drift.
        if terminated {
            self.forget_frame_growth(saved);
        } else {
            self.balance_frame(saved);
        }

        self.out.bind_label(&l_check);
        let hint = self.cond_hint();
        let cond_var = self.gen_expr(cond, Some(hint))?;
        self.balance_frame(saved);
        self.branch(cond_var, Some(&l_loop), None)?;
        if cond_var != hint {
            self.release(cond_var);
        }
        Ok(())
    }

    /// Emit the return sequence: value into `R0`, frame popped, saved
    /// program counter restored.
    pub(crate) fn gen_return_value(&mut self, retval: Option<VarId>) -> Result<(), CodegenError> {
        if let Some(retval) = retval {
            self.materialize_to_reg(retval, Reg::R0)?;
        }
        if self.stack_size > 0 {
            self.gen_stack_clear_keep_size(self.stack_size as u16)?;
        }
        trace!("  MOV PC, [ST]");
        self.out.emit_insn(Insn::RET);
        Ok(())
    }

    /// A fresh descriptor marking that the caller wants a condition.
    pub(crate) fn cond_hint(&mut self) -> VarId {
        self.pool.temp(Place::Cond {
            cond: Cond::Never,
            generation: self.cond_generation,
        })
    }

    /// Turn any descriptor into a branch condition.
    ///
    /// Conditions pass through (staleness checked); everything else is
    /// compared against one, unsigned `>= 1` meaning "non zero".
    pub(crate) fn var_to_cond(&mut self, var: VarId) -> Result<Cond, CodegenError> {
        if let Place::Cond { cond, generation } = self.pool.place(var) {
            self.check_condition(generation)?;
            if self.live_cond == Some(var) {
                self.live_cond = None;
            }
            return Ok(cond);
        }
        let hint = self.pool.temp(Place::Cond {
            cond: Cond::Uge,
            generation: self.cond_generation,
        });
        self.math1(op::CMP1, Some(hint), var)?;
        Ok(Cond::Uge)
    }

    /// Branch to `l_true` when the condition holds and to `l_false` when
    /// it does not. Either side may be absent for a fall through.
    pub(crate) fn branch(
        &mut self,
        cond_var: VarId,
        l_true: Option<&str>,
        l_false: Option<&str>,
    ) -> Result<(), CodegenError> {
        let cond = self.var_to_cond(cond_var)?;
        if let Some(label) = l_true {
            self.emit_branch(cond, label);
        }
        if let Some(label) = l_false {
            self.emit_branch(cond.invert(), label);
        }
        Ok(())
    }

    /// An unconditional jump.
    pub(crate) fn jump(&mut self, label: &str) {
        self.emit_branch(Cond::Always, label);
    }

    fn emit_branch(&mut self, cond: Cond, label: &str) {
        if self.pie() {
            trace!("  LEA{} PC, [PC~{}]", cond.suffix(), label);
            self.out.emit_insn(Insn {
                y: true,
                x: AddrMode::Pc,
                b: Reg::Imm,
                a: Reg::Pc,
                o: op::lea(cond),
            });
            self.out.emit_label_ref(label, 0, RefKind::OffsPtr);
        } else {
            trace!("  MOV{} PC, {}", cond.suffix(), label);
            self.out.emit_insn(Insn {
                y: false,
                x: AddrMode::Imm,
                b: Reg::Imm,
                a: Reg::Pc,
                o: op::mov(cond),
            });
            self.out.emit_label_ref(label, 0, RefKind::AbsPtr);
        }
    }

    /// Move a value to another descriptor's location.
    pub(crate) fn gen_mov(&mut self, dst: VarId, src: VarId) -> Result<(), CodegenError> {
        let dst_place = self.pool.place(dst);
        if dst_place.same(&self.pool.place(src)) {
            return Ok(());
        }
        if dst_place.is_cond() {
            let cond = self.var_to_cond(src)?;
            self.pool.get_mut(dst).place = Place::Cond {
                cond,
                generation: self.cond_generation,
            };
            return Ok(());
        }
        self.store_to_place(&dst_place, src)
    }

    /// Store `src` into a concrete place.
    pub(crate) fn store_to_place(&mut self, dst: &Place, src: VarId) -> Result<(), CodegenError> {
        match dst {
            Place::Reg(reg) => self.materialize_to_reg(src, *reg),
            // Condition destinations never get here, gen_mov short
            // circuits them and homes are never conditions. Constant
            // destinations are error placeholders and swallow the store.
            Place::Cond { .. } | Place::Const(_) => Ok(()),
            Place::Stack { offset } => {
                let (b, const_word) = self.store_operand(src, true)?;
                let disp = self.stack_size - offset;
                match const_word {
                    Some(word) => trace!("  MOV [ST+{}], 0x{:04x}", disp, word),
                    None => trace!("  MOV [ST+{}], {}", disp, b),
                }
                self.out.emit_insn(Insn {
                    y: true,
                    x: AddrMode::St,
                    b,
                    a: Reg::St,
                    o: op::mov(Cond::Always),
                });
                self.out.emit_word(disp as u16);
                if let Some(word) = const_word {
                    self.out.emit_word(word);
                }
                Ok(())
            }
            Place::Label { label, addend } => {
                let (b, const_word) = self.store_operand(src, true)?;
                let (mut insn, kind) = self.insn_label(false);
                insn.b = b;
                insn.o = op::mov(Cond::Always);
                trace!("  MOV [{}], {}", label, b);
                self.out.emit_insn(insn);
                self.out.emit_label_ref(label, *addend, kind);
                if let Some(word) = const_word {
                    self.out.emit_word(word);
                }
                Ok(())
            }
            Place::Ptr(inner) => {
                // Stores through a pointer need the data in a register,
                // even constants.
                let (src_reg, _) = self.store_operand(src, false)?;
                match self.pool.place(*inner) {
                    Place::Const(addr) => {
                        trace!("  MOV [0x{:04x}], {}", addr as u16, src_reg);
                        self.out.emit_insn(Insn {
                            y: true,
                            x: AddrMode::Mem,
                            b: src_reg,
                            a: Reg::Imm,
                            o: op::mov(Cond::Always),
                        });
                        self.out.emit_word(addr as u16);
                    }
                    Place::Reg(ptr_reg) => self.store_through_reg(ptr_reg, src_reg),
                    _ => {
                        let ptr_reg = self.promote_ptr_inner(*inner, Some(src_reg))?;
                        self.store_through_reg(ptr_reg, src_reg);
                    }
                }
                Ok(())
            }
        }
    }

    fn store_through_reg(&mut self, ptr_reg: Reg, src_reg: Reg) {
        trace!("  MOV [{}+0], {}", ptr_reg, src_reg);
        self.out.emit_insn(Insn {
            y: true,
            x: AddrMode::rel(ptr_reg),
            b: src_reg,
            a: Reg::Imm,
            o: op::mov(Cond::Always),
        });
        self.out.emit_word(0);
    }

    /// The `b` field for a store of `src`: the source register, or with
    /// `allow_const` the immediate marker plus the constant word.
    fn store_operand(
        &mut self,
        src: VarId,
        allow_const: bool,
    ) -> Result<(Reg, Option<u16>), CodegenError> {
        match self.pool.place(src) {
            Place::Const(value) if allow_const => Ok((Reg::Imm, Some(value as u16))),
            Place::Reg(reg) => Ok((reg, None)),
            _ => {
                let reg = self.pick_register(true)?;
                self.materialize_to_reg(src, reg)?;
                Ok((reg, None))
            }
        }
    }

    /// The flags are about to change: force the live condition (if one
    /// is still valid) into a real 0/1 word and advance the generation,
    /// invalidating every remaining condition descriptor.
    pub(crate) fn clobber_flags(&mut self) -> Result<(), CodegenError> {
        if let Some(id) = self.live_cond.take() {
            if let Place::Cond { generation, .. } = self.pool.place(id) {
                if generation == self.cond_generation {
                    let tmp = self.get_temp(1, true)?;
                    let place = self.pool.place(tmp);
                    self.store_to_place(&place, id)?;
                    self.pool.get_mut(id).place = place.clone();
                    if let Place::Reg(reg) = place {
                        self.regs.occupy(reg, id);
                    }
                }
            }
        }
        self.cond_generation += 1;
        Ok(())
    }

    /// Grow the frame by `num` words.
    pub(crate) fn gen_stack_space(&mut self, num: u16) -> Result<(), CodegenError> {
        if num == 0 {
            return Ok(());
        }
        self.clobber_flags()?;
        trace!("  SUB ST, {}", num);
        self.out.emit_insn(Insn::SUB_ST);
        self.out.emit_word(num);
        self.stack_size += num as i32;
        Ok(())
    }

    /// Shrink the frame by `num` words.
    pub(crate) fn gen_stack_clear(&mut self, num: u16) -> Result<(), CodegenError> {
        if num == 0 {
            return Ok(());
        }
        self.gen_stack_clear_keep_size(num)?;
        self.stack_size -= num as i32;
        Ok(())
    }

    /// Emit the pop without touching the tracked frame depth. Used by
    /// the return sequence, where later paths still need the full frame.
    fn gen_stack_clear_keep_size(&mut self, num: u16) -> Result<(), CodegenError> {
        self.clobber_flags()?;
        trace!("  ADD ST, {}", num);
        self.out.emit_insn(Insn::ADD_ST);
        self.out.emit_word(num);
        Ok(())
    }

    /// Pop whatever temp growth happened since `saved` so that every
    /// path through a conditionally executed region leaves the frame at
    /// the same depth. Flag preserving, like the growth itself.
    pub(crate) fn balance_frame(&mut self, saved: i32) {
        let delta = self.stack_size - saved;
        if delta > 0 {
            trace!("  LEA ST, [ST+{}]", delta);
            self.out.emit_insn(Insn {
                y: true,
                x: AddrMode::St,
                b: Reg::Imm,
                a: Reg::St,
                o: op::lea(Cond::Always),
            });
            self.out.emit_word(delta as u16);
        }
        self.stack_size = saved;
        self.temps.truncate_above(saved);
    }

    /// Forget region local growth without emitting the pop; used after
    /// an arm that definitely returned, where the pop would be dead.
    fn forget_frame_growth(&mut self, saved: i32) {
        self.stack_size = saved;
        self.temps.truncate_above(saved);
    }

    /// Grow the frame by one word without disturbing the flags; the
    /// temp slot machinery runs between a comparison and its consumer.
    pub(crate) fn grow_frame_quietly(&mut self) {
        trace!("  LEA ST, [ST-1]");
        self.out.emit_insn(Insn {
            y: true,
            x: AddrMode::St,
            b: Reg::Imm,
            a: Reg::St,
            o: op::lea(Cond::Always),
        });
        self.out.emit_word(-1_i32 as u16);
        self.stack_size += 1;
    }

    /// Render a descriptor as an inline assembly operand, converting it
    /// first when the constraint does not admit its current form.
    pub fn iasm_operand(
        &mut self,
        var: VarId,
        constraint: &IasmConstraint,
    ) -> Result<String, CodegenError> {
        let needs_change = match self.pool.place(var) {
            Place::Const(_) => !constraint.allow_const,
            Place::Reg(_) => !constraint.allow_reg,
            Place::Label { .. } => !constraint.allow_mem,
            _ => false,
        };
        if needs_change && constraint.allow_reg {
            let reg = self.pick_register(true)?;
            self.materialize_to_reg(var, reg)?;
            self.pool.get_mut(var).place = Place::Reg(reg);
            self.regs.occupy(reg, var);
        }
        let rendered = match self.pool.place(var) {
            Place::Const(value) => format!("0x{:04x}", value as u16),
            Place::Reg(reg) => reg.to_string(),
            Place::Label { label, .. } => format!("[{}]", label),
            Place::Stack { offset } => format!("[ST+{}]", self.stack_size - offset),
            _ => {
                self.diags.report(
                    None,
                    Severity::Warn,
                    "operand is not expressible in inline assembly",
                );
                String::new()
            }
        };
        Ok(rendered)
    }

    /// Register a string literal; its words are emitted after the code.
    pub(crate) fn add_string(&mut self, value: &str) -> Label {
        let label = format!(".S{}", self.strings.len());
        self.strings.push((label.clone(), value.to_string()));
        label
    }

    fn emit_string_pool(&mut self) {
        for (label, value) in std::mem::take(&mut self.strings) {
            self.out.bind_label(&label);
            for ch in value.chars() {
                self.out.emit_word(ch as u16);
            }
            self.out.emit_word(0);
        }
    }
}

/// Count the local declarations of a body so the prologue can reserve
/// their slots in one go.
fn count_locals(stmt: &Stmt) -> usize {
    match stmt {
        Stmt::Block(stmts) => stmts.iter().map(count_locals).sum(),
        Stmt::If {
            then_branch,
            else_branch,
            ..
        } => {
            count_locals(then_branch)
                + else_branch.as_deref().map(count_locals).unwrap_or(0)
        }
        Stmt::While { body, .. } => count_locals(body),
        Stmt::Declare { .. } => 1,
        _ => 0,
    }
}
