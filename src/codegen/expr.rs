//! Expression code generation.
//!
//! Expression generators take descriptors in and hand descriptors out.
//! An optional output hint tells the math routines where the caller
//! would like the result; a condition typed hint requests a condition
//! descriptor instead of a materialized 0/1 word.
//!
//! The two central routines are [`GenContext::math1`] and
//! [`GenContext::math2`]; everything else dispatches into them, into the
//! branching primitives, or into the call sequence.

use log::trace;

use crate::ast::{Expr, Op};
use crate::codegen::value::{Place, VarId};
use crate::codegen::GenContext;
use crate::diag::{CodegenError, Severity};
use crate::isa::{op, AddrMode, Cond, Insn, Reg, MEM_BITS, NUM_REGS};
use crate::output::RefKind;

/// Mnemonic of a math opcode for the trace log.
fn math_mnemonic(opcode: u8) -> &'static str {
    match opcode & !op::CARRY_CONT {
        op::ADD => "ADD",
        op::SUB => "SUB",
        op::AND => "AND",
        op::OR => "OR",
        op::XOR => "XOR",
        op::CMP => "CMP",
        op::INC => "INC",
        op::DEC => "DEC",
        op::SHL => "SHL",
        op::SHR => "SHR",
        op::CMP1 => "CMP1",
        op::NOT => "NOT",
        _ => "OP",
    }
}

/// The condition a comparison operator leaves behind.
fn comparison_cond(oper: Op, signed: bool) -> Cond {
    match oper {
        Op::Lt if signed => Cond::Slt,
        Op::Lt => Cond::Ult,
        Op::Le if signed => Cond::Sle,
        Op::Le => Cond::Ule,
        Op::Gt if signed => Cond::Sgt,
        Op::Gt => Cond::Ugt,
        Op::Ge if signed => Cond::Sge,
        Op::Ge => Cond::Uge,
        Op::Eq => Cond::Eq,
        _ => Cond::Ne,
    }
}

impl<'a> GenContext<'a> {
    /// Generate code for an expression, returning the descriptor holding
    /// its value.
    pub fn gen_expr(
        &mut self,
        expr: &Expr,
        out_hint: Option<VarId>,
    ) -> Result<VarId, CodegenError> {
        match expr {
            Expr::Int(value) => Ok(self.pool.temp(Place::Const(*value))),
            Expr::Str(value) => {
                // A string literal evaluates to the address of its words.
                let label = self.add_string(value);
                let var = self.pool.temp(Place::Label { label, addend: 0 });
                self.gen_expr_math1(Op::AddrOf, out_hint, var)
            }
            Expr::Ident(name) => self.gen_ident(name),
            Expr::Call { callee, args } => self.gen_call(callee, args),
            Expr::Index { array, index } => self.gen_index(array, index),
            Expr::Unary { op, operand } => {
                let a = self.gen_expr(operand, None)?;
                self.gen_expr_math1(*op, out_hint, a)
            }
            Expr::Binary { op, lhs, rhs } => match op {
                Op::Assign => self.gen_assign(lhs, rhs),
                Op::LogicAnd | Op::LogicOr => self.gen_logic(*op, lhs, rhs),
                _ => {
                    let a = self.gen_expr(lhs, None)?;
                    let b = self.gen_expr(rhs, None)?;
                    let result = self.gen_expr_math2(*op, out_hint, a, b)?;
                    if result != a {
                        self.release(a);
                    }
                    if result != b {
                        self.release(b);
                    }
                    Ok(result)
                }
            },
        }
    }

    fn gen_ident(&mut self, name: &str) -> Result<VarId, CodegenError> {
        match self.vars.get(name) {
            Some(&id) => Ok(id),
            None => {
                self.diags.report(
                    None,
                    Severity::Err,
                    format!("unknown identifier `{}`", name),
                );
                Ok(self.pool.temp(Place::Const(0)))
            }
        }
    }

    fn gen_index(&mut self, array: &Expr, index: &Expr) -> Result<VarId, CodegenError> {
        let base = self.gen_expr(array, None)?;
        let index = self.gen_expr(index, None)?;
        let addr = self.gen_expr_math2(Op::Add, None, base, index)?;
        Ok(self.pool.temp(Place::Ptr(addr)))
    }

    fn gen_assign(&mut self, lhs: &Expr, rhs: &Expr) -> Result<VarId, CodegenError> {
        let dst = self.gen_lvalue(lhs)?;
        let value = self.gen_expr(rhs, Some(dst))?;
        if value != dst {
            self.gen_mov(dst, value)?;
            self.release(value);
        }
        Ok(dst)
    }

    fn gen_lvalue(&mut self, expr: &Expr) -> Result<VarId, CodegenError> {
        match expr {
            Expr::Ident(name) => self.gen_ident(name),
            Expr::Unary {
                op: Op::Deref,
                operand,
            } => {
                let inner = self.gen_expr(operand, None)?;
                Ok(self.pool.temp(Place::Ptr(inner)))
            }
            Expr::Index { array, index } => self.gen_index(array, index),
            _ => {
                self.diags
                    .report(None, Severity::Err, "expression is not assignable");
                Ok(self.pool.temp(Place::Const(0)))
            }
        }
    }

    /// Unary operator dispatch.
    pub(crate) fn gen_expr_math1(
        &mut self,
        oper: Op,
        out_hint: Option<VarId>,
        a: VarId,
    ) -> Result<VarId, CodegenError> {
        match oper {
            Op::LogicNot => {
                if let Place::Cond { cond, generation } = self.pool.place(a) {
                    // Inverting a condition is free.
                    self.check_condition(generation)?;
                    self.pool.get_mut(a).place = Place::Cond {
                        cond: cond.invert(),
                        generation,
                    };
                    Ok(a)
                } else {
                    // Unsigned "< 1" is "== 0".
                    self.gen_comparison1(Op::Lt, false, out_hint, a)
                }
            }
            Op::Lt | Op::Le | Op::Gt | Op::Ge | Op::Eq | Op::Ne => {
                self.gen_comparison1(oper, true, out_hint, a)
            }
            Op::ShiftL => self.math1(op::SHL, out_hint, a),
            Op::ShiftR => self.math1(op::SHR, out_hint, a),
            Op::BitNot => self.math1(op::NOT, out_hint, a),
            Op::Deref => Ok(self.pool.temp(Place::Ptr(a))),
            Op::AddrOf => self.gen_addr_of(out_hint, a),
            Op::Add => self.math1(op::INC, out_hint, a),
            Op::Sub => self.math1(op::DEC, out_hint, a),
            _ => {
                self.diags.report(
                    None,
                    Severity::Err,
                    format!("operator `{}` has no unary form", oper),
                );
                Ok(self.pool.temp(Place::Const(0)))
            }
        }
    }

    /// Binary operator dispatch.
    pub(crate) fn gen_expr_math2(
        &mut self,
        oper: Op,
        out_hint: Option<VarId>,
        a: VarId,
        b: VarId,
    ) -> Result<VarId, CodegenError> {
        // Adding, subtracting, shifting by or comparing against a
        // constant one all have cheaper unary forms.
        let simplifiable = matches!(oper, Op::Add | Op::Sub)
            || oper.is_shift()
            || oper.is_comparison();
        if simplifiable && matches!(self.pool.place(b), Place::Const(1)) {
            return self.gen_expr_math1(oper, out_hint, a);
        }

        match oper {
            Op::Add => self.math2(op::ADD, out_hint, a, b),
            Op::Sub => self.math2(op::SUB, out_hint, a, b),
            Op::BitAnd => self.math2(op::AND, out_hint, a, b),
            Op::BitOr => self.math2(op::OR, out_hint, a, b),
            Op::BitXor => self.math2(op::XOR, out_hint, a, b),
            Op::Lt | Op::Le | Op::Gt | Op::Ge | Op::Eq | Op::Ne => {
                self.gen_comparison2(oper, out_hint, a, b)
            }
            Op::ShiftL | Op::ShiftR => self.gen_shift(oper, out_hint, a, b),
            Op::Index => {
                let addr = self.gen_expr_math2(Op::Add, None, a, b)?;
                Ok(self.pool.temp(Place::Ptr(addr)))
            }
            Op::Mul => self.emit_call_sequence("__px16_mul", &[a, b]),
            Op::Div => self.emit_call_sequence("__px16_div", &[a, b]),
            Op::Mod => self.emit_call_sequence("__px16_mod", &[a, b]),
            _ => {
                self.diags.report(
                    None,
                    Severity::Err,
                    format!("operator `{}` has no binary form", oper),
                );
                Ok(self.pool.temp(Place::Const(0)))
            }
        }
    }

    /// Compare a single operand against one and synthesize a condition.
    fn gen_comparison1(
        &mut self,
        oper: Op,
        signed: bool,
        out_hint: Option<VarId>,
        a: VarId,
    ) -> Result<VarId, CodegenError> {
        let output = match out_hint {
            Some(hint) if self.pool.place(hint).is_cond() => hint,
            _ => self.cond_hint(),
        };
        self.math1(op::CMP1, Some(output), a)?;
        self.pool.get_mut(output).place = Place::Cond {
            cond: comparison_cond(oper, signed),
            generation: self.cond_generation,
        };
        self.live_cond = Some(output);
        Ok(output)
    }

    /// Compare two operands and synthesize a condition.
    fn gen_comparison2(
        &mut self,
        oper: Op,
        out_hint: Option<VarId>,
        a: VarId,
        b: VarId,
    ) -> Result<VarId, CodegenError> {
        let output = match out_hint {
            Some(hint) if self.pool.place(hint).is_cond() => hint,
            _ => self.cond_hint(),
        };
        self.math2(op::CMP, Some(output), a, b)?;
        self.pool.get_mut(output).place = Place::Cond {
            cond: comparison_cond(oper, true),
            generation: self.cond_generation,
        };
        self.live_cond = Some(output);
        Ok(output)
    }

    /// Shifts by amounts other than one: unroll small constant counts,
    /// call the runtime helper otherwise.
    fn gen_shift(
        &mut self,
        oper: Op,
        out_hint: Option<VarId>,
        a: VarId,
        b: VarId,
    ) -> Result<VarId, CodegenError> {
        let opcode = if oper == Op::ShiftL { op::SHL } else { op::SHR };
        if let Place::Const(count) = self.pool.place(b) {
            if count == 0 {
                return Ok(a);
            }
            if (0..=MEM_BITS as i64).contains(&count) {
                let mut result = self.math1(opcode, out_hint, a)?;
                for _ in 1..count {
                    result = self.math1(opcode, Some(result), result)?;
                }
                return Ok(result);
            }
        }
        let helper = if oper == Op::ShiftL {
            "__px16_shl"
        } else {
            "__px16_shr"
        };
        self.emit_call_sequence(helper, &[a, b])
    }

    /// Short circuit `&&` and `||`, leaving a 0/1 word.
    fn gen_logic(&mut self, oper: Op, lhs: &Expr, rhs: &Expr) -> Result<VarId, CodegenError> {
        // A stack slot on purpose: a register result could be evicted
        // into a slot that only exists on one of the two paths.
        let out = self.get_temp(1, false)?;
        let l_done = self.out.fresh_label();
        let seed = if oper == Op::LogicAnd { 0 } else { 1 };

        let hint_a = self.cond_hint();
        let ca = self.gen_expr(lhs, Some(hint_a))?;
        let seed_var = self.pool.temp(Place::Const(seed));
        self.gen_mov(out, seed_var)?;
        if oper == Op::LogicAnd {
            // A false left side decides the answer.
            self.branch(ca, None, Some(&l_done))?;
        } else {
            // A true left side decides the answer.
            self.branch(ca, Some(&l_done), None)?;
        }
        if ca != hint_a {
            self.release(ca);
        }

        let saved = self.stack_size;
        let hint_b = self.cond_hint();
        let cb = self.gen_expr(rhs, Some(hint_b))?;
        // The result must be a clean 0/1, not the raw right hand value.
        let cb = if self.pool.place(cb).is_cond() {
            cb
        } else {
            let cond = self.var_to_cond(cb)?;
            if cb != hint_b {
                self.release(cb);
            }
            self.pool.temp(Place::Cond {
                cond,
                generation: self.cond_generation,
            })
        };
        self.gen_mov(out, cb)?;
        // The skipped right hand side may have grown the frame; both
        // paths must meet at the same depth.
        self.balance_frame(saved);

        self.out.bind_label(&l_done);
        Ok(out)
    }

    /// Take the address of a value.
    fn gen_addr_of(
        &mut self,
        out_hint: Option<VarId>,
        a: VarId,
    ) -> Result<VarId, CodegenError> {
        match self.pool.place(a) {
            Place::Label { label, addend } => {
                let reg = self.pick_register(true)?;
                let (mut insn, kind) = self.insn_label(true);
                insn.a = reg;
                insn.o = op::lea(Cond::Always);
                trace!("  LEA {}, [{}]", reg, label);
                self.out.emit_insn(insn);
                self.out.emit_label_ref(&label, addend, kind);
                let id = self.pool.temp(Place::Reg(reg));
                self.regs.occupy(reg, id);
                Ok(id)
            }
            Place::Stack { offset } => {
                let reg = self.pick_register(true)?;
                let disp = self.stack_size - offset;
                trace!("  LEA {}, [ST+{}]", reg, disp);
                self.out.emit_insn(Insn {
                    y: true,
                    x: AddrMode::St,
                    b: Reg::Imm,
                    a: reg,
                    o: op::lea(Cond::Always),
                });
                self.out.emit_word(disp as u16);
                let id = self.pool.temp(Place::Reg(reg));
                self.regs.occupy(reg, id);
                Ok(id)
            }
            _ => {
                if let Some(home) = self.pool.get(a).home.clone() {
                    // Write the current value back so the address stays
                    // meaningful.
                    self.store_to_place(&home, a)?;
                    let home_var = self.pool.temp(home);
                    self.gen_expr_math1(Op::AddrOf, out_hint, home_var)
                } else {
                    let tmp = self.get_temp(1, false)?;
                    self.gen_mov(tmp, a)?;
                    self.gen_expr_math1(Op::AddrOf, out_hint, tmp)
                }
            }
        }
    }

    /// Emit a unary math instruction per word of the operand.
    pub(crate) fn math1(
        &mut self,
        opcode: u8,
        out_hint: Option<VarId>,
        a: VarId,
    ) -> Result<VarId, CodegenError> {
        let mut a = a;
        let n_words = self.pool.place(a).words();
        let do_copy = !self.same_hint(out_hint, a) && opcode != op::CMP1;
        let output = match out_hint {
            Some(hint) if !do_copy => hint,
            _ => self.get_temp(n_words, true)?,
        };
        if do_copy {
            self.gen_mov(output, a)?;
            a = output;
        }

        // A pointer operand needs its address in a register.
        if let Place::Ptr(inner) = self.pool.place(a) {
            match self.pool.place(inner) {
                Place::Const(_) | Place::Reg(_) => {}
                _ => {
                    self.promote_ptr_inner(inner, None)?;
                }
            }
        }
        let norm = self.normalize_math_operand(a)?;
        if let Some(norm) = norm {
            a = norm;
        }
        self.clobber_flags()?;

        // SHR walks from the most significant word down; every other op
        // chains the carry upward.
        let indices: Vec<u16> = if opcode & !op::CARRY_CONT == op::SHR {
            (0..n_words).rev().collect()
        } else {
            (0..n_words).collect()
        };
        let mut opcode = opcode;
        for i in indices {
            self.emit_math_insn(opcode, a, i, Reg::R0)?;
            opcode |= op::CARRY_CONT;
        }

        if let Some(norm) = norm {
            self.release(norm);
        }
        Ok(output)
    }

    /// Emit a binary math instruction per word of the operands.
    pub(crate) fn math2(
        &mut self,
        opcode: u8,
        out_hint: Option<VarId>,
        a: VarId,
        b: VarId,
    ) -> Result<VarId, CodegenError> {
        let mut a = a;
        let n_words = self.pool.place(a).words();
        let do_copy = !self.same_hint(out_hint, a) && opcode != op::CMP;
        let output = match out_hint {
            Some(hint) if !do_copy => hint,
            _ => self.get_temp(n_words, true)?,
        };
        if do_copy {
            self.gen_mov(output, a)?;
            a = output;
        }

        let norm = self.normalize_math_operand(a)?;
        if let Some(norm) = norm {
            a = norm;
        }
        // A condition operand must be read before the flags change.
        let norm_b = match self.pool.place(b) {
            Place::Cond { .. } => {
                let tmp = self.get_temp(1, true)?;
                self.gen_mov(tmp, b)?;
                Some(tmp)
            }
            _ => None,
        };
        let b = norm_b.unwrap_or(b);
        self.clobber_flags()?;

        // The encodings need at least one register operand: convert `b`
        // whenever `a` stays in memory and `b` is not a register, and
        // always for operands with no direct addressing form.
        let a_is_reg = self.pool.place(a).is_reg();
        let b_place = self.pool.place(b);
        let conv_b = (!a_is_reg && !b_place.is_reg())
            || matches!(b_place, Place::Cond { .. } | Place::Ptr(_));
        let reg_b = if conv_b {
            Some(self.pick_register(true)?)
        } else {
            None
        };

        let mut opcode = opcode;
        for i in 0..n_words {
            if let Some(reg_b) = reg_b {
                self.materialize_part(b, reg_b, i)?;
            }
            match self.pool.place(a) {
                Place::Reg(ra) => {
                    let ra = ra.offset_by(i);
                    match (reg_b, self.pool.place(b)) {
                        (Some(rb), _) => {
                            trace!("  {} {}, {}", math_mnemonic(opcode), ra, rb);
                            self.out.emit_insn(Insn {
                                y: false,
                                x: AddrMode::Imm,
                                b: rb,
                                a: ra,
                                o: opcode,
                            });
                        }
                        (None, Place::Stack { offset }) => {
                            let disp = self.stack_size - offset + i as i32;
                            trace!("  {} {}, [ST+{}]", math_mnemonic(opcode), ra, disp);
                            self.out.emit_insn(Insn {
                                y: true,
                                x: AddrMode::St,
                                b: Reg::Imm,
                                a: ra,
                                o: opcode,
                            });
                            self.out.emit_word(disp as u16);
                        }
                        (None, Place::Label { label, addend }) => {
                            let (mut insn, kind) = self.insn_label(true);
                            insn.a = ra;
                            insn.o = opcode;
                            trace!("  {} {}, [{}]", math_mnemonic(opcode), ra, label);
                            self.out.emit_insn(insn);
                            self.out.emit_label_ref(&label, addend + i as i32, kind);
                        }
                        (None, Place::Const(value)) => {
                            let word = (value >> (MEM_BITS * i as u32)) as u16;
                            trace!("  {} {}, 0x{:04x}", math_mnemonic(opcode), ra, word);
                            self.out.emit_insn(Insn {
                                y: false,
                                x: AddrMode::Imm,
                                b: Reg::Imm,
                                a: ra,
                                o: opcode,
                            });
                            self.out.emit_word(word);
                        }
                        (None, Place::Reg(rb)) => {
                            let rb = rb.offset_by(i);
                            trace!("  {} {}, {}", math_mnemonic(opcode), ra, rb);
                            self.out.emit_insn(Insn {
                                y: false,
                                x: AddrMode::Imm,
                                b: rb,
                                a: ra,
                                o: opcode,
                            });
                        }
                        // Conditions and pointers were converted above.
                        (None, _) => {}
                    }
                }
                Place::Stack { offset } => {
                    let rb = self.math2_reg_operand(reg_b, b);
                    let disp = self.stack_size - offset + i as i32;
                    trace!("  {} [ST+{}], {}", math_mnemonic(opcode), disp, rb);
                    self.out.emit_insn(Insn {
                        y: false,
                        x: AddrMode::St,
                        b: rb,
                        a: Reg::Imm,
                        o: opcode,
                    });
                    self.out.emit_word(disp as u16);
                }
                Place::Label { label, addend } => {
                    let rb = self.math2_reg_operand(reg_b, b);
                    let (mut insn, kind) = self.insn_label(false);
                    insn.b = rb;
                    insn.o = opcode;
                    trace!("  {} [{}], {}", math_mnemonic(opcode), label, rb);
                    self.out.emit_insn(insn);
                    self.out.emit_label_ref(&label, addend + i as i32, kind);
                }
                // Everything else was copied or normalized into one of
                // the three encodable forms.
                _ => {}
            }
            opcode |= op::CARRY_CONT;
        }

        if let Some(norm) = norm {
            self.release(norm);
        }
        if let Some(norm_b) = norm_b {
            self.release(norm_b);
        }
        if let Some(hint) = out_hint {
            if self.pool.place(hint).is_cond() {
                // The operation set the flags; a non zero result reads
                // back as NE.
                self.pool.get_mut(hint).place = Place::Cond {
                    cond: Cond::Ne,
                    generation: self.cond_generation,
                };
                self.live_cond = Some(hint);
                return Ok(hint);
            }
        }
        Ok(output)
    }

    fn math2_reg_operand(&self, reg_b: Option<Reg>, b: VarId) -> Reg {
        match (reg_b, self.pool.place(b)) {
            (Some(reg), _) => reg,
            (None, Place::Reg(reg)) => reg,
            // The conversion rules above make this unreachable.
            (None, _) => Reg::R0,
        }
    }

    /// Emit one word of a unary math operation on `a`.
    fn emit_math_insn(
        &mut self,
        opcode: u8,
        a: VarId,
        i: u16,
        b_field: Reg,
    ) -> Result<(), CodegenError> {
        match self.pool.place(a) {
            Place::Reg(reg) => {
                let reg = reg.offset_by(i);
                trace!("  {} {}", math_mnemonic(opcode), reg);
                self.out.emit_insn(Insn {
                    y: false,
                    x: AddrMode::Imm,
                    b: b_field,
                    a: reg,
                    o: opcode,
                });
            }
            Place::Stack { offset } => {
                let disp = self.stack_size - offset + i as i32;
                trace!("  {} [ST+{}]", math_mnemonic(opcode), disp);
                self.out.emit_insn(Insn {
                    y: false,
                    x: AddrMode::St,
                    b: b_field,
                    a: Reg::Imm,
                    o: opcode,
                });
                self.out.emit_word(disp as u16);
            }
            Place::Label { label, addend } => {
                let (mut insn, kind) = self.insn_label(false);
                insn.o = opcode;
                trace!("  {} [{}]", math_mnemonic(opcode), label);
                self.out.emit_insn(insn);
                self.out.emit_label_ref(&label, addend + i as i32, kind);
            }
            Place::Ptr(inner) => match self.pool.place(inner) {
                Place::Const(addr) => {
                    let word = (addr as u16).wrapping_add(i);
                    trace!("  {} [0x{:04x}]", math_mnemonic(opcode), word);
                    self.out.emit_insn(Insn {
                        y: false,
                        x: AddrMode::Mem,
                        b: b_field,
                        a: Reg::Imm,
                        o: opcode,
                    });
                    self.out.emit_word(word);
                }
                Place::Reg(ptr_reg) if i != 0 => {
                    trace!("  {} [{}+{}]", math_mnemonic(opcode), ptr_reg, i);
                    self.out.emit_insn(Insn {
                        y: false,
                        x: AddrMode::rel(ptr_reg),
                        b: b_field,
                        a: Reg::Imm,
                        o: opcode,
                    });
                    self.out.emit_word(i);
                }
                Place::Reg(ptr_reg) => {
                    trace!("  {} [{}]", math_mnemonic(opcode), ptr_reg);
                    self.out.emit_insn(Insn {
                        y: false,
                        x: AddrMode::Mem,
                        b: b_field,
                        a: ptr_reg,
                        o: opcode,
                    });
                }
                // The caller promoted every other inner form.
                _ => {}
            },
            // Constants and conditions were normalized by the caller.
            Place::Const(_) | Place::Cond { .. } => {}
        }
        Ok(())
    }

    /// Copy an operand that has no math addressing form into a temp.
    fn normalize_math_operand(&mut self, a: VarId) -> Result<Option<VarId>, CodegenError> {
        match self.pool.place(a) {
            Place::Const(_) | Place::Cond { .. } => {
                let tmp = self.get_temp(1, true)?;
                self.gen_mov(tmp, a)?;
                Ok(Some(tmp))
            }
            _ => Ok(None),
        }
    }

    fn same_hint(&self, hint: Option<VarId>, a: VarId) -> bool {
        match hint {
            Some(hint) => self.pool.place(hint).same(&self.pool.place(a)),
            None => false,
        }
    }

    /// Generate a function call expression.
    fn gen_call(&mut self, callee: &Expr, args: &[Expr]) -> Result<VarId, CodegenError> {
        let name = match callee {
            Expr::Ident(name) => name.clone(),
            _ => {
                self.diags.report(
                    None,
                    Severity::Err,
                    "only direct calls to named functions are supported",
                );
                return Ok(self.pool.temp(Place::Const(0)));
            }
        };
        let mut arg_ids = Vec::with_capacity(args.len());
        for arg in args {
            arg_ids.push(self.gen_expr(arg, None)?);
        }
        self.emit_call_sequence(&name, &arg_ids)
    }

    /// Emit a complete call: caller saved registers spilled, arguments
    /// placed per the calling convention, `JSR`, stack cleanup, result
    /// in `R0`.
    pub(crate) fn emit_call_sequence(
        &mut self,
        callee: &str,
        args: &[VarId],
    ) -> Result<VarId, CodegenError> {
        // Flatten operands the materializer would need a register for,
        // so loading the argument registers below stays allocation free.
        let mut flat = Vec::with_capacity(args.len());
        for &arg in args {
            match self.pool.place(arg) {
                Place::Cond { .. } | Place::Ptr(_) => {
                    let tmp = self.get_temp(1, false)?;
                    self.gen_mov(tmp, arg)?;
                    flat.push(tmp);
                }
                _ => flat.push(arg),
            }
        }

        // All four registers are caller saved: spill every occupant to
        // its home or a temp. Argument descriptors living in registers
        // get rewritten along the way and stay readable.
        for i in 0..NUM_REGS {
            self.evict_register(Reg::gp(i))?;
        }

        let n = flat.len();
        if n <= NUM_REGS {
            for (i, &arg) in flat.iter().enumerate() {
                self.materialize_to_reg(arg, Reg::gp(i))?;
            }
        } else {
            self.gen_stack_space(n as u16)?;
            for (i, &arg) in flat.iter().enumerate() {
                // The callee sees its first parameter closest to the
                // frame base, one word above our return slot.
                let offset = self.stack_size - (n as i32 - 1 - i as i32);
                self.store_to_place(&Place::Stack { offset }, arg)?;
            }
        }

        // Whatever the callee does to the flags is gone on return.
        self.clobber_flags()?;
        if self.pie() {
            trace!("  JSR [PC~{}]", callee);
            self.out.emit_insn(Insn {
                y: true,
                x: AddrMode::Pc,
                b: Reg::Imm,
                a: Reg::Pc,
                o: op::JSR,
            });
            self.out.emit_label_ref(callee, 0, RefKind::OffsPtr);
        } else {
            trace!("  JSR {}", callee);
            self.out.emit_insn(Insn {
                y: false,
                x: AddrMode::Imm,
                b: Reg::Imm,
                a: Reg::Pc,
                o: op::JSR,
            });
            self.out.emit_label_ref(callee, 0, RefKind::AbsPtr);
        }

        if n > NUM_REGS {
            self.gen_stack_clear(n as u16)?;
        }
        for &arg in &flat {
            self.release(arg);
        }

        let result = self.pool.temp(Place::Reg(Reg::R0));
        self.regs.occupy(Reg::R0, result);
        Ok(result)
    }
}
