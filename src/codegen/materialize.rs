//! Moving values into registers.
//!
//! [`GenContext::materialize_part`] is the one place that knows how to
//! read every descriptor variant: it emits exactly one instruction per
//! word (conditions take two) with the `x`/`b` fields chosen to match
//! the source's addressing mode. Pointer operands whose inner descriptor
//! is neither a constant nor a register are first promoted into a
//! register, rewriting the inner descriptor in place.

use log::trace;

use crate::codegen::value::{Place, VarId};
use crate::codegen::GenContext;
use crate::diag::CodegenError;
use crate::isa::{op, AddrMode, Cond, Insn, Reg, MEM_BITS, NUM_REGS};
use crate::output::RefKind;

impl<'a> GenContext<'a> {
    /// Pick the memory addressing form for a label operand: PC relative
    /// under PIE, absolute otherwise. The caller fills in the opcode and
    /// the register side.
    pub(crate) fn insn_label(&self, y: bool) -> (Insn, RefKind) {
        if self.pie() {
            (
                Insn {
                    y,
                    x: AddrMode::Pc,
                    b: Reg::Imm,
                    a: Reg::Imm,
                    o: 0,
                },
                RefKind::OffsPtr,
            )
        } else {
            (
                Insn {
                    y,
                    x: AddrMode::Mem,
                    b: Reg::Imm,
                    a: Reg::Imm,
                    o: 0,
                },
                RefKind::AbsPtr,
            )
        }
    }

    /// Write the `index`th word of `val` into `dest_reg + index`.
    pub(crate) fn materialize_part(
        &mut self,
        val: VarId,
        dest_reg: Reg,
        index: u16,
    ) -> Result<(), CodegenError> {
        let dest = dest_reg.offset_by(index);
        match self.pool.place(val) {
            Place::Reg(reg) => {
                let src = reg.offset_by(index);
                if src == dest {
                    return Ok(());
                }
                trace!("  MOV {}, {}", dest, src);
                self.out.emit_insn(Insn {
                    y: false,
                    x: AddrMode::Imm,
                    b: src,
                    a: dest,
                    o: op::mov(Cond::Always),
                });
            }
            Place::Label { label, addend } => {
                let (mut insn, kind) = self.insn_label(true);
                insn.a = dest;
                insn.o = op::mov(Cond::Always);
                trace!("  MOV {}, [{}+{}]", dest, label, addend + index as i32);
                self.out.emit_insn(insn);
                self.out.emit_label_ref(&label, addend + index as i32, kind);
            }
            Place::Const(value) => {
                let word = (value >> (MEM_BITS * index as u32)) as u16;
                trace!("  MOV {}, 0x{:04x}", dest, word);
                self.out.emit_insn(Insn {
                    y: false,
                    x: AddrMode::Imm,
                    b: Reg::Imm,
                    a: dest,
                    o: op::mov(Cond::Always),
                });
                self.out.emit_word(word);
            }
            Place::Cond { cond, generation } => {
                self.check_condition(generation)?;
                if self.live_cond == Some(val) {
                    self.live_cond = None;
                }
                // Zero by default, one when the condition holds.
                trace!("  MOV {}, 0", dest);
                self.out.emit_insn(Insn {
                    y: false,
                    x: AddrMode::Imm,
                    b: Reg::Imm,
                    a: dest,
                    o: op::mov(Cond::Always),
                });
                self.out.emit_word(0);
                trace!("  MOV{} {}, 1", cond.suffix(), dest);
                self.out.emit_insn(Insn {
                    y: false,
                    x: AddrMode::Imm,
                    b: Reg::Imm,
                    a: dest,
                    o: op::mov(cond),
                });
                self.out.emit_word(1);
            }
            Place::Stack { offset } => {
                let disp = self.stack_size - offset + index as i32;
                trace!("  MOV {}, [ST+{}]", dest, disp);
                self.out.emit_insn(Insn {
                    y: true,
                    x: AddrMode::St,
                    b: Reg::St,
                    a: dest,
                    o: op::mov(Cond::Always),
                });
                self.out.emit_word(disp as u16);
            }
            Place::Ptr(inner) => match self.pool.place(inner) {
                Place::Const(addr) => {
                    let word = (addr as u16).wrapping_add(index);
                    trace!("  MOV {}, [0x{:04x}]", dest, word);
                    self.out.emit_insn(Insn {
                        y: true,
                        x: AddrMode::Mem,
                        b: Reg::Imm,
                        a: dest,
                        o: op::mov(Cond::Always),
                    });
                    self.out.emit_word(word);
                }
                Place::Reg(ptr_reg) => self.load_through_reg(ptr_reg, dest, index),
                _ => {
                    let ptr_reg = self.promote_ptr_inner(inner, Some(dest))?;
                    self.load_through_reg(ptr_reg, dest, index);
                }
            },
        }
        Ok(())
    }

    fn load_through_reg(&mut self, ptr_reg: Reg, dest: Reg, index: u16) {
        if index != 0 {
            trace!("  MOV {}, [{}+{}]", dest, ptr_reg, index);
            self.out.emit_insn(Insn {
                y: true,
                x: AddrMode::rel(ptr_reg),
                b: Reg::Imm,
                a: dest,
                o: op::mov(Cond::Always),
            });
            self.out.emit_word(index);
        } else {
            trace!("  MOV {}, [{}]", dest, ptr_reg);
            self.out.emit_insn(Insn {
                y: true,
                x: AddrMode::Mem,
                b: ptr_reg,
                a: dest,
                o: op::mov(Cond::Always),
            });
        }
    }

    /// Move a whole value into `dest` (and the following registers, for
    /// values wider than one word).
    pub(crate) fn materialize_to_reg(&mut self, val: VarId, dest: Reg) -> Result<(), CodegenError> {
        let n_words = self.pool.place(val).words();
        for index in 0..n_words {
            self.materialize_part(val, dest, index)?;
        }
        Ok(())
    }

    /// Load the address held by a pointer's inner descriptor into a
    /// register and rewrite the descriptor to live there.
    ///
    /// `avoid` excludes the register the caller is about to overwrite;
    /// landing the pointer there would clobber it before use.
    pub(crate) fn promote_ptr_inner(
        &mut self,
        inner: VarId,
        avoid: Option<Reg>,
    ) -> Result<Reg, CodegenError> {
        let reg = match avoid {
            Some(avoid) => self.pick_register_avoiding(avoid)?,
            None => self.pick_register(true)?,
        };
        self.materialize_to_reg(inner, reg)?;
        self.pool.get_mut(inner).place = Place::Reg(reg);
        self.regs.occupy(reg, inner);
        Ok(reg)
    }

    fn pick_register_avoiding(&mut self, avoid: Reg) -> Result<Reg, CodegenError> {
        let free = (0..NUM_REGS)
            .map(Reg::gp)
            .find(|reg| *reg != avoid && self.regs.is_free(*reg));
        if let Some(reg) = free {
            return Ok(reg);
        }
        let mut victim = self.policy.pick_victim(&self.func, self.stack_size);
        if victim == avoid {
            victim = Reg::gp((victim.index() + 1) % NUM_REGS);
        }
        self.evict_register(victim)?;
        Ok(victim)
    }

    /// Fail if the flags have been clobbered since the condition was set.
    pub(crate) fn check_condition(&self, generation: u64) -> Result<(), CodegenError> {
        if generation != self.cond_generation {
            return Err(CodegenError::StaleCondition {
                set: generation,
                now: self.cond_generation,
            });
        }
        Ok(())
    }
}
