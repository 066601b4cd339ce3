//! Register and temp slot allocation.
//!
//! The register file tracks which general purpose registers are occupied
//! and by which descriptor. Temporary stack slots are tracked in a bitmap
//! with one symbolic label per slot word; the frame grows when the bitmap
//! runs out of contiguous space.
//!
//! Victim selection on a full register file is deterministic per function
//! so that repeated runs produce identical output; the choice sits behind
//! [`EvictionPolicy`] so tests can pin it.

use bitflags::bitflags;
use log::debug;

use crate::codegen::value::{Place, VarId};
use crate::codegen::GenContext;
use crate::diag::CodegenError;
use crate::isa::{Reg, NUM_REGS};
use crate::output::Label;

bitflags! {
    /// Occupancy mask over the general purpose registers.
    pub struct RegMask: u8 {
        const R0 = 0b0001;
        const R1 = 0b0010;
        const R2 = 0b0100;
        const R3 = 0b1000;
    }
}

/// Chooses the register to vacate when none are free.
pub trait EvictionPolicy {
    /// Pick a victim. `func` and `stack_size` describe the current
    /// generation point; a policy may ignore them but must be a pure
    /// function of its inputs.
    fn pick_victim(&self, func: &str, stack_size: i32) -> Reg;
}

/// The default policy: a hash of the function name and the current stack
/// depth. Not clever, but reproducible.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashedPolicy;

impl EvictionPolicy for HashedPolicy {
    fn pick_victim(&self, func: &str, stack_size: i32) -> Reg {
        let seed = func
            .bytes()
            .fold(stack_size as u32, |acc, b| acc.wrapping_add(b as u32));
        let pick = (seed.wrapping_mul(0x9E37_79B9) >> 28) as usize % NUM_REGS;
        Reg::gp(pick)
    }
}

/// Always evicts the same register. For tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedPolicy(pub Reg);

impl EvictionPolicy for FixedPolicy {
    fn pick_victim(&self, _func: &str, _stack_size: i32) -> Reg {
        self.0
    }
}

/// Occupancy state of the general purpose registers.
#[derive(Debug, Clone)]
pub(crate) struct RegFile {
    mask: RegMask,
    occupant: [Option<VarId>; NUM_REGS],
}

impl RegFile {
    pub(crate) fn new() -> Self {
        RegFile {
            mask: RegMask::empty(),
            occupant: [None; NUM_REGS],
        }
    }

    fn bit(reg: Reg) -> RegMask {
        RegMask::from_bits_truncate(1 << reg.index())
    }

    /// The lowest free general purpose register, if any.
    pub(crate) fn find_free(&self) -> Option<Reg> {
        (0..NUM_REGS)
            .map(Reg::gp)
            .find(|reg| !self.mask.contains(Self::bit(*reg)))
    }

    pub(crate) fn is_free(&self, reg: Reg) -> bool {
        !self.mask.contains(Self::bit(reg))
    }

    pub(crate) fn occupy(&mut self, reg: Reg, id: VarId) {
        self.mask.insert(Self::bit(reg));
        self.occupant[reg.index()] = Some(id);
    }

    pub(crate) fn free(&mut self, reg: Reg) {
        self.mask.remove(Self::bit(reg));
        self.occupant[reg.index()] = None;
    }

    pub(crate) fn occupant(&self, reg: Reg) -> Option<VarId> {
        self.occupant[reg.index()]
    }

    /// Iterate over the occupied registers.
    pub(crate) fn occupied(&self) -> impl Iterator<Item = (Reg, VarId)> + '_ {
        (0..NUM_REGS)
            .map(Reg::gp)
            .filter_map(move |reg| self.occupant(reg).map(|id| (reg, id)))
    }

    pub(crate) fn clear(&mut self) {
        *self = RegFile::new();
    }
}

/// The temp slot bitmap with one symbolic label per frame word.
#[derive(Debug, Clone, Default)]
pub(crate) struct TempSlots {
    used: Vec<bool>,
    labels: Vec<Label>,
    offsets: Vec<i32>,
}

impl TempSlots {
    pub(crate) fn new() -> Self {
        TempSlots::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.used.len()
    }

    /// First fit scan for `n` contiguous free slots.
    pub(crate) fn find_run(&self, n: usize) -> Option<usize> {
        let mut remaining = n;
        for (i, used) in self.used.iter().enumerate() {
            if *used {
                remaining = n;
            } else {
                remaining -= 1;
            }
            if remaining == 0 {
                return Some(i + 1 - n);
            }
        }
        None
    }

    pub(crate) fn claim(&mut self, start: usize, n: usize) {
        for slot in &mut self.used[start..start + n] {
            *slot = true;
        }
    }

    /// Record a freshly created slot; it starts out free.
    pub(crate) fn push(&mut self, label: Label, offset: i32) {
        self.used.push(false);
        self.labels.push(label);
        self.offsets.push(offset);
    }

    pub(crate) fn offset_of(&self, index: usize) -> i32 {
        self.offsets[index]
    }

    /// Free the slot holding the given frame offset, if it is a temp.
    pub(crate) fn release_offset(&mut self, offset: i32) {
        if let Some(index) = self.offsets.iter().position(|o| *o == offset) {
            self.used[index] = false;
        }
    }

    /// Drop every slot deeper than `offset`; the frame shrank past them
    /// and their descriptors are dead by the stack offset invariant.
    pub(crate) fn truncate_above(&mut self, offset: i32) {
        while self.offsets.last().map_or(false, |o| *o > offset) {
            self.used.pop();
            self.labels.pop();
            self.offsets.pop();
        }
    }

    pub(crate) fn clear(&mut self) {
        self.used.clear();
        self.labels.clear();
        self.offsets.clear();
    }
}

impl<'a> GenContext<'a> {
    /// Pick a register to use.
    ///
    /// Returns a free register when one exists. Otherwise, with `vacate`,
    /// the policy's victim is evicted (to its home location if it has
    /// one, to a fresh temp slot otherwise) and handed out; without
    /// `vacate` the allocator gives up.
    pub(crate) fn pick_register(&mut self, vacate: bool) -> Result<Reg, CodegenError> {
        if let Some(reg) = self.regs.find_free() {
            return Ok(reg);
        }
        if !vacate {
            return Err(CodegenError::NoFreeRegister);
        }
        let victim = self.policy.pick_victim(&self.func, self.stack_size);
        self.evict_register(victim)?;
        Ok(victim)
    }

    /// Move the occupant of `reg` out of the way and free the register.
    ///
    /// The occupant descriptor is rewritten in place, so every holder of
    /// its [`VarId`] sees the new location. A register without an
    /// occupant is already free.
    pub(crate) fn evict_register(&mut self, reg: Reg) -> Result<(), CodegenError> {
        let occupant = match self.regs.occupant(reg) {
            Some(id) => id,
            None => return Ok(()),
        };
        let target = match self.pool.get(occupant).home.clone() {
            Some(home) => home,
            None => {
                let tmp = self.get_temp(1, false)?;
                self.pool.place(tmp)
            }
        };
        debug!(
            "// vacate {}: spill to {:?}",
            reg, target
        );
        self.store_to_place(&target, occupant)?;
        self.pool.get_mut(occupant).place = target;
        self.regs.free(reg);
        Ok(())
    }

    /// Get a temporary location of `n_words` words.
    ///
    /// A free register is preferred for single word temps when
    /// `allow_reg` permits; otherwise the temp bitmap is scanned first
    /// fit and the frame grows when nothing fits.
    pub(crate) fn get_temp(&mut self, n_words: u16, allow_reg: bool) -> Result<VarId, CodegenError> {
        if n_words == 1 && allow_reg {
            if let Some(reg) = self.regs.find_free() {
                let id = self.pool.temp(Place::Reg(reg));
                self.regs.occupy(reg, id);
                return Ok(id);
            }
        }

        let n = n_words as usize;
        let start = match self.temps.find_run(n) {
            Some(start) => start,
            None => {
                for _ in 0..n {
                    self.push_temp_slot();
                }
                self.temps.len() - n
            }
        };
        self.temps.claim(start, n);
        // Word zero of a multi word temp lives in the newest slot of the
        // run; displacements grow toward the frame base.
        let offset = self.temps.offset_of(start + n - 1);
        Ok(self.pool.temp(Place::Stack { offset }))
    }

    fn push_temp_slot(&mut self) {
        let label = format!("{}.LT{:04x}", self.func, self.temps.len());
        debug!("// add temp slot {}", label);
        self.grow_frame_quietly();
        let offset = self.stack_size;
        self.temps.push(label, offset);
    }

    /// Give a temporary location back.
    ///
    /// Registers still owned by a named variable stay occupied; they are
    /// reclaimed through eviction when somebody needs them.
    pub(crate) fn release(&mut self, id: VarId) {
        match self.pool.place(id) {
            Place::Reg(reg) => {
                if self.pool.get(id).owner.is_none() && self.regs.occupant(reg) == Some(id) {
                    self.regs.free(reg);
                }
            }
            Place::Stack { offset } => self.temps.release_offset(offset),
            _ => {}
        }
    }

    /// Verify that every occupied register is claimed by a descriptor
    /// that actually lives there.
    pub(crate) fn check_occupancy(&self) -> Result<(), CodegenError> {
        for (reg, id) in self.regs.occupied() {
            match self.pool.get(id).place {
                Place::Reg(r) if r == reg => {}
                _ => return Err(CodegenError::OccupancyMismatch(reg)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashed_policy_is_deterministic() {
        let policy = HashedPolicy;
        let a = policy.pick_victim("f", 4);
        let b = policy.pick_victim("f", 4);
        assert_eq!(a, b);
        assert!(a.is_gp());
    }

    #[test]
    fn fixed_policy_ignores_its_inputs() {
        let policy = FixedPolicy(Reg::R2);
        assert_eq!(policy.pick_victim("f", 0), Reg::R2);
        assert_eq!(policy.pick_victim("g", 99), Reg::R2);
    }

    #[test]
    fn reg_file_hands_out_lowest_free_first() {
        let mut regs = RegFile::new();
        assert_eq!(regs.find_free(), Some(Reg::R0));
        regs.occupy(Reg::R0, VarId(0));
        regs.occupy(Reg::R1, VarId(1));
        assert_eq!(regs.find_free(), Some(Reg::R2));
        regs.free(Reg::R0);
        assert_eq!(regs.find_free(), Some(Reg::R0));
    }

    #[test]
    fn full_reg_file_has_no_free_register() {
        let mut regs = RegFile::new();
        for i in 0..NUM_REGS {
            regs.occupy(Reg::gp(i), VarId(i));
        }
        assert_eq!(regs.find_free(), None);
    }

    #[test]
    fn temp_runs_are_first_fit() {
        let mut temps = TempSlots::new();
        for i in 0..4 {
            temps.push(format!("f.LT{:04x}", i), i as i32 + 1);
        }
        temps.claim(0, 1);
        temps.claim(2, 1);
        assert_eq!(temps.find_run(1), Some(1));
        assert_eq!(temps.find_run(2), None);
        temps.release_offset(3);
        assert_eq!(temps.find_run(2), Some(1));
    }
}
