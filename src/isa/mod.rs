//! The Pixie-16 instruction word model.
//!
//! Everything the generator needs to know about the target encoding lives
//! here: the 16-bit instruction layout, the register and addressing-mode
//! selectors, the opcode map and the condition codes.
//!
//! # Example
//!
//! ```
//! # use px16_codegen::isa::{Insn, AddrMode, Reg, op, Cond};
//! let insn = Insn {
//!     y: false,
//!     x: AddrMode::Imm,
//!     b: Reg::Imm,
//!     a: Reg::R0,
//!     o: op::mov(Cond::Always),
//! };
//!
//! assert_eq!(Insn::unpack(insn.pack()), insn);
//! ```

use enum_primitive::{
    enum_from_primitive, enum_from_primitive_impl, enum_from_primitive_impl_ty, FromPrimitive,
};
#[cfg(test)]
use proptest_derive::Arbitrary;

use std::fmt;

/// Size in bytes of a memory word.
pub const MEMW_BYTES: usize = 2;
/// Size in bytes of the CPU's standard word.
pub const WORD_BYTES: usize = 2;
/// Size in bytes of addresses (pointers, `size_t`).
pub const ADDR_BYTES: usize = 2;
/// Size in bytes of `char`. Pixie-16 is word addressed, so `char` fills a word.
pub const CHAR_BYTES: usize = 2;
/// Size in bytes of `short int`.
pub const SHORT_BYTES: usize = 2;
/// Size in bytes of `int`.
pub const INT_BYTES: usize = 2;
/// Size in bytes of `long int`.
pub const LONG_BYTES: usize = 4;
/// Number of bits in a memory word.
pub const MEM_BITS: u32 = 16;
/// Number of general purpose registers available to the allocator.
pub const NUM_REGS: usize = 4;

enum_from_primitive! {
    /// All register selectors encodable in the three bit `a`/`b` fields.
    ///
    /// `R0` through `R3` are the general purpose registers the allocator
    /// hands out. The remaining selectors address special registers or,
    /// for [`Reg::Imm`], mark that an immediate word follows the
    /// instruction.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(test, derive(Arbitrary))]
    pub enum Reg {
        R0 = 0,
        R1,
        R2,
        R3,
        /// Stack pointer.
        St,
        /// Flag register.
        Pf,
        /// Program counter.
        Pc,
        /// Immediate marker; not a real register.
        Imm,
    }
}

enum_from_primitive! {
    /// Addressing modes encodable in the three bit `x` field.
    ///
    /// | `x` | operand bytes come from |
    /// |-----|-------------------------|
    /// | 0-3 | memory at `Rn` plus a displacement word |
    /// | 4   | memory at `ST` plus a displacement word |
    /// | 5   | absolute memory, address in `b` or in a following word |
    /// | 6   | memory at `PC` plus a displacement word |
    /// | 7   | register direct, or an immediate word when `b` is `IMM` |
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(test, derive(Arbitrary))]
    pub enum AddrMode {
        Rel0 = 0,
        Rel1,
        Rel2,
        Rel3,
        St,
        Mem,
        Pc,
        Imm,
    }
}

enum_from_primitive! {
    /// The machine condition codes.
    ///
    /// Codes come in inversion pairs: flipping the lowest bit negates the
    /// condition, see [`Cond::invert`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(test, derive(Arbitrary))]
    pub enum Cond {
        Always = 0,
        Never,
        Eq,
        Ne,
        Ult,
        Uge,
        Ugt,
        Ule,
        Slt,
        Sge,
        Sgt,
        Sle,
        /// Carry set.
        Cs,
        /// Carry clear.
        Cc,
        /// Overflow set.
        Vs,
        /// Overflow clear.
        Vc,
    }
}

impl Reg {
    /// Get the nth general purpose register.
    ///
    /// # Example
    ///
    /// ```
    /// # use px16_codegen::isa::Reg;
    /// assert_eq!(Reg::gp(2), Reg::R2);
    /// ```
    pub fn gp(index: usize) -> Self {
        debug_assert!(index < NUM_REGS);
        Reg::from_usize(index).expect("infallible. Index is below NUM_REGS")
    }

    /// Index of a general purpose register.
    pub fn index(self) -> usize {
        debug_assert!(self.is_gp());
        self as usize
    }

    /// Is this one of the allocatable general purpose registers?
    pub const fn is_gp(self) -> bool {
        (self as usize) < NUM_REGS
    }

    /// The register `words` places after this one.
    ///
    /// Multi word values occupy register pairs, so the second word of a
    /// value homed in `R1` lives in `R2`.
    pub fn offset_by(self, words: u16) -> Self {
        Reg::from_u16(self as u16 + words).expect("infallible. Register selectors span 0..8")
    }
}

impl AddrMode {
    /// The register relative mode dereferencing the given general purpose
    /// register.
    pub fn rel(reg: Reg) -> Self {
        debug_assert!(reg.is_gp());
        AddrMode::from_u16(reg as u16).expect("infallible. GP register indices are valid modes")
    }
}

impl Cond {
    /// Negate the condition.
    ///
    /// # Example
    ///
    /// ```
    /// # use px16_codegen::isa::Cond;
    /// assert_eq!(Cond::Ult.invert(), Cond::Uge);
    /// assert_eq!(Cond::Uge.invert(), Cond::Ult);
    /// ```
    pub fn invert(self) -> Self {
        Cond::from_u8(self as u8 ^ 1).expect("infallible. Codes pair up by their lowest bit")
    }

    /// Mnemonic suffix for trace output, e.g. `".EQ"`.
    pub fn suffix(self) -> &'static str {
        match self {
            Cond::Always => "",
            Cond::Never => ".NV",
            Cond::Eq => ".EQ",
            Cond::Ne => ".NE",
            Cond::Ult => ".ULT",
            Cond::Uge => ".UGE",
            Cond::Ugt => ".UGT",
            Cond::Ule => ".ULE",
            Cond::Slt => ".SLT",
            Cond::Sge => ".SGE",
            Cond::Sgt => ".SGT",
            Cond::Sle => ".SLE",
            Cond::Cs => ".CS",
            Cond::Cc => ".CC",
            Cond::Vs => ".VS",
            Cond::Vc => ".VC",
        }
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Reg::R0 => "R0",
            Reg::R1 => "R1",
            Reg::R2 => "R2",
            Reg::R3 => "R3",
            Reg::St => "ST",
            Reg::Pf => "PF",
            Reg::Pc => "PC",
            Reg::Imm => "IMM",
        };
        write!(f, "{}", name)
    }
}

/// The opcode map for the six bit `o` field.
///
/// Binary math sits at the bottom, unary math above it; both families
/// reserve [`op::CARRY_CONT`] as the carry continuation modifier used for
/// the second and later words of a multi word operation. The data
/// movement families carry a [`Cond`] in their low nibble.
pub mod op {
    use super::Cond;

    /// Binary add, `a += operand`.
    pub const ADD: u8 = 0x00;
    /// Binary subtract, `a -= operand`.
    pub const SUB: u8 = 0x01;
    /// Bitwise and.
    pub const AND: u8 = 0x02;
    /// Bitwise or.
    pub const OR: u8 = 0x03;
    /// Bitwise xor.
    pub const XOR: u8 = 0x04;
    /// Compare, sets flags only.
    pub const CMP: u8 = 0x05;
    /// Push the return address and load `PC` from the operand.
    pub const JSR: u8 = 0x06;
    /// Carry continuation modifier for both math families.
    pub const CARRY_CONT: u8 = 0x08;
    /// Increment by one.
    pub const INC: u8 = 0x10;
    /// Decrement by one.
    pub const DEC: u8 = 0x11;
    /// Shift left by one.
    pub const SHL: u8 = 0x12;
    /// Shift right by one.
    pub const SHR: u8 = 0x13;
    /// Compare against one, sets flags only.
    pub const CMP1: u8 = 0x14;
    /// Bitwise complement.
    pub const NOT: u8 = 0x15;

    const MOV_FAMILY: u8 = 0x20;
    const LEA_FAMILY: u8 = 0x30;

    /// A conditional move. `mov(Cond::Always)` is the plain `MOV`.
    pub const fn mov(cond: Cond) -> u8 {
        MOV_FAMILY | cond as u8
    }

    /// A conditional load effective address.
    pub const fn lea(cond: Cond) -> u8 {
        LEA_FAMILY | cond as u8
    }
}

/// A single decoded instruction word.
///
/// Packing is pure bit juggling and total in both directions:
///
/// ```text
/// 0b1_010_110_001_000101
///   y -x- -b- -a- --o---
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Insn {
    /// Operand size / width flag.
    pub y: bool,
    /// Addressing mode.
    pub x: AddrMode,
    /// Source register or source selector.
    pub b: Reg,
    /// Destination register or primary selector.
    pub a: Reg,
    /// Opcode, six bits.
    pub o: u8,
}

impl Insn {
    /// The return instruction, `MOV PC, [ST]`. Pops the saved program
    /// counter.
    pub const RET: Insn = Insn {
        y: true,
        x: AddrMode::Mem,
        b: Reg::St,
        a: Reg::Pc,
        o: op::mov(Cond::Always),
    };

    /// `ADD ST, imm`; the immediate word follows.
    pub const ADD_ST: Insn = Insn {
        y: false,
        x: AddrMode::Imm,
        b: Reg::Imm,
        a: Reg::St,
        o: op::ADD,
    };

    /// `SUB ST, imm`; the immediate word follows.
    pub const SUB_ST: Insn = Insn {
        y: false,
        x: AddrMode::Imm,
        b: Reg::Imm,
        a: Reg::St,
        o: op::SUB,
    };

    /// Pack the instruction into a single machine word.
    ///
    /// # Example
    ///
    /// ```
    /// # use px16_codegen::isa::Insn;
    /// assert_eq!(Insn::RET.pack(), 0b1_101_100_110_100000);
    /// ```
    pub const fn pack(&self) -> u16 {
        (self.y as u16) << 15
            | ((self.x as u16) & 7) << 12
            | ((self.b as u16) & 7) << 9
            | ((self.a as u16) & 7) << 6
            | (self.o as u16) & 63
    }

    /// Unpack a machine word.
    pub fn unpack(word: u16) -> Self {
        Insn {
            y: word & 0x8000 != 0,
            x: AddrMode::from_u16((word & 0x7000) >> 12)
                .expect("infallible. Masked to three bits"),
            b: Reg::from_u16((word & 0x0e00) >> 9).expect("infallible. Masked to three bits"),
            a: Reg::from_u16((word & 0x01c0) >> 6).expect("infallible. Masked to three bits"),
            o: (word & 0x003f) as u8,
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        #[test]
        fn packing_is_invertible(
            y: bool,
            x: AddrMode,
            b: Reg,
            a: Reg,
            o in 0..64_u8,
        ) {
            let insn = Insn { y, x, b, a, o };
            assert_eq!(Insn::unpack(insn.pack()), insn);
        }

        #[test]
        fn unpacking_is_invertible(word: u16) {
            assert_eq!(Insn::unpack(word).pack(), word);
        }

        #[test]
        fn double_inversion_is_identity(cond: Cond) {
            assert_eq!(cond.invert().invert(), cond);
        }
    }

    #[test]
    fn field_placement_matches_the_layout() {
        let insn = Insn {
            y: true,
            x: AddrMode::St,
            b: Reg::R1,
            a: Reg::R3,
            o: op::CMP1,
        };
        assert_eq!(insn.pack(), 0b1_100_001_011_010100);
    }

    #[test]
    fn conditional_moves_carry_their_condition() {
        assert_eq!(op::mov(Cond::Always), 0x20);
        assert_eq!(op::mov(Cond::Ne), 0x23);
        assert_eq!(op::lea(Cond::Uge), 0x35);
    }

    #[test]
    fn inversion_flips_orderings() {
        assert_eq!(Cond::Eq.invert(), Cond::Ne);
        assert_eq!(Cond::Slt.invert(), Cond::Sge);
        assert_eq!(Cond::Sgt.invert(), Cond::Sle);
        assert_eq!(Cond::Always.invert(), Cond::Never);
    }

    #[test]
    fn register_pairs_step_upward() {
        assert_eq!(Reg::R1.offset_by(1), Reg::R2);
        assert_eq!(Reg::R0.offset_by(0), Reg::R0);
    }
}
