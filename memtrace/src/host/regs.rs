//! Scratch register reservation
//!
//! Instrumentation may only use a register after saving the application's
//! value to a spill slot, and must restore it before the next application
//! instruction. [`RegReservations`] hands out registers under a class
//! constraint and an allowed set; [`ScratchScope`] ties reservations to one
//! inserted sequence and restores everything when the sequence is closed.

#![allow(clippy::cast_possible_truncation)]

use log::warn;

use super::ilist::{InstrHandle, InstrList};
use super::isa::{Label, Meta, Reg, RegClass, RegSet};
use crate::domain::{HostError, SpillSlot};

pub const NUM_SPILL_SLOTS: usize = 8;

/// Order in which free registers are handed out. `rcx` comes last so a
/// general reservation does not take the counter register from a later
/// `Counter` request.
const PREFERENCE: [Reg; 15] = [
    Reg::Rbx,
    Reg::Rdx,
    Reg::Rsi,
    Reg::Rdi,
    Reg::R8,
    Reg::R9,
    Reg::R10,
    Reg::R11,
    Reg::R12,
    Reg::R13,
    Reg::R14,
    Reg::R15,
    Reg::Rax,
    Reg::Rbp,
    Reg::Rcx,
];

#[derive(Debug, Default)]
pub struct RegReservations {
    held: Vec<(Reg, SpillSlot)>,
    flags: Option<SpillSlot>,
    slots_in_use: [bool; NUM_SPILL_SLOTS],
}

impl RegReservations {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_reserved(&self, reg: Reg) -> bool {
        self.held.iter().any(|(r, _)| *r == reg)
    }

    fn take_slot(&mut self) -> Result<SpillSlot, HostError> {
        let index = self
            .slots_in_use
            .iter()
            .position(|used| !used)
            .ok_or(HostError::NoSpillSlot)?;
        self.slots_in_use[index] = true;
        Ok(SpillSlot(index as u8))
    }

    fn free_slot(&mut self, slot: SpillSlot) {
        if let Some(used) = self.slots_in_use.get_mut(usize::from(slot.0)) {
            *used = false;
        }
    }

    /// Reserves a register of `class` drawn from `allowed`, spilling its
    /// application value before `at`.
    ///
    /// # Errors
    /// `Conflict` when the only admissible register is already held,
    /// `NoFreeRegister` when no admissible register remains, `NoSpillSlot`
    /// when every spill slot is taken.
    pub fn reserve(
        &mut self,
        ilist: &mut InstrList,
        at: InstrHandle,
        class: RegClass,
        allowed: RegSet,
    ) -> Result<Reg, HostError> {
        let candidates: Vec<Reg> = PREFERENCE
            .iter()
            .copied()
            .filter(|r| class.admits(*r) && allowed.contains(*r))
            .collect();

        let Some(reg) = candidates.iter().copied().find(|r| !self.is_reserved(*r)) else {
            return Err(match candidates.as_slice() {
                [only] => HostError::Conflict(*only),
                _ => HostError::NoFreeRegister { class, at: ilist.position(at).unwrap_or(0) },
            });
        };

        let slot = self.take_slot()?;
        ilist.preinsert(at, Meta::Spill { reg, slot })?;
        self.held.push((reg, slot));
        Ok(reg)
    }

    /// Restores `reg` from its spill slot before `at`.
    ///
    /// # Errors
    /// `NotReserved` if `reg` is not held.
    pub fn unreserve(&mut self, ilist: &mut InstrList, at: InstrHandle, reg: Reg) -> Result<(), HostError> {
        let pos = self
            .held
            .iter()
            .position(|(r, _)| *r == reg)
            .ok_or(HostError::NotReserved(reg))?;
        let (_, slot) = self.held[pos];
        ilist.preinsert(at, Meta::Restore { reg, slot })?;
        self.held.remove(pos);
        self.free_slot(slot);
        Ok(())
    }

    /// Saves the arithmetic flags before `at`. Idempotent.
    ///
    /// # Errors
    /// `NoSpillSlot` when every spill slot is taken.
    pub fn reserve_flags(&mut self, ilist: &mut InstrList, at: InstrHandle) -> Result<(), HostError> {
        if self.flags.is_some() {
            return Ok(());
        }
        let slot = self.take_slot()?;
        ilist.preinsert(at, Meta::SaveFlags { slot })?;
        self.flags = Some(slot);
        Ok(())
    }

    /// Restores the flags saved by [`reserve_flags`](Self::reserve_flags). No-op if none.
    ///
    /// # Errors
    /// Propagates insertion failures.
    pub fn unreserve_flags(&mut self, ilist: &mut InstrList, at: InstrHandle) -> Result<(), HostError> {
        if let Some(slot) = self.flags {
            ilist.preinsert(at, Meta::RestoreFlags { slot })?;
            self.flags = None;
            self.free_slot(slot);
        }
        Ok(())
    }
}

// ============================================================================
// RAII Scope
// ============================================================================

/// Reservation scope for one inserted sequence.
///
/// Everything emitted through the scope lands before the anchor instruction,
/// in emission order. [`close`](Self::close) appends the restores; if the
/// scope is dropped without closing, the restores are still emitted.
pub struct ScratchScope<'a> {
    ilist: &'a mut InstrList,
    at: InstrHandle,
    regs: RegReservations,
    closed: bool,
}

impl<'a> ScratchScope<'a> {
    pub fn open(ilist: &'a mut InstrList, at: InstrHandle) -> Self {
        Self { ilist, at, regs: RegReservations::new(), closed: false }
    }

    /// # Errors
    /// See [`RegReservations::reserve`].
    pub fn acquire(&mut self, class: RegClass) -> Result<Reg, HostError> {
        self.acquire_from(class, RegSet::ALL)
    }

    /// # Errors
    /// See [`RegReservations::reserve`].
    pub fn acquire_from(&mut self, class: RegClass, allowed: RegSet) -> Result<Reg, HostError> {
        self.regs.reserve(self.ilist, self.at, class, allowed)
    }

    /// # Errors
    /// See [`RegReservations::reserve_flags`].
    pub fn save_flags(&mut self) -> Result<(), HostError> {
        self.regs.reserve_flags(self.ilist, self.at)
    }

    /// # Errors
    /// Propagates insertion failures.
    pub fn emit(&mut self, meta: Meta) -> Result<(), HostError> {
        self.ilist.preinsert(self.at, meta).map(|_| ())
    }

    pub fn new_label(&mut self) -> Label {
        self.ilist.new_label()
    }

    fn release(&mut self) -> Result<(), HostError> {
        self.closed = true;
        let held: Vec<Reg> = self.regs.held.iter().rev().map(|(r, _)| *r).collect();
        for reg in held {
            self.regs.unreserve(self.ilist, self.at, reg)?;
        }
        self.regs.unreserve_flags(self.ilist, self.at)
    }

    /// Emits the restores of every held register (newest first) and the flags.
    ///
    /// # Errors
    /// Propagates insertion failures.
    pub fn close(mut self) -> Result<(), HostError> {
        self.release()
    }
}

impl Drop for ScratchScope<'_> {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.release() {
                warn!("Failed to restore scratch registers: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::ilist::Node;
    use crate::host::isa::Instr;

    fn one_instr() -> (InstrList, InstrHandle) {
        let list = InstrList::from_app(vec![Instr::nop(0x100)]);
        let at = list.app_handles()[0];
        (list, at)
    }

    fn metas(list: &InstrList) -> Vec<Meta> {
        list.iter()
            .filter_map(|n| match n {
                Node::Meta(m) => Some(*m),
                Node::App(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_counter_class_returns_rcx() {
        let (mut list, at) = one_instr();
        let mut regs = RegReservations::new();
        let reg = regs.reserve(&mut list, at, RegClass::Counter, RegSet::ALL).unwrap();
        assert_eq!(reg, Reg::Rcx);
        assert_eq!(metas(&list), vec![Meta::Spill { reg: Reg::Rcx, slot: SpillSlot(0) }]);
    }

    #[test]
    fn test_counter_conflict() {
        let (mut list, at) = one_instr();
        let mut regs = RegReservations::new();
        regs.reserve(&mut list, at, RegClass::Counter, RegSet::ALL).unwrap();
        let err = regs.reserve(&mut list, at, RegClass::Counter, RegSet::ALL).unwrap_err();
        assert_eq!(err, HostError::Conflict(Reg::Rcx));
    }

    #[test]
    fn test_allowed_set_excluding_class_is_no_free_register() {
        let (mut list, at) = one_instr();
        let mut regs = RegReservations::new();
        let err = regs
            .reserve(&mut list, at, RegClass::Counter, RegSet::of(&[Reg::Rbx]))
            .unwrap_err();
        assert!(matches!(err, HostError::NoFreeRegister { class: RegClass::Counter, .. }));
    }

    #[test]
    fn test_spill_slots_exhaust() {
        let (mut list, at) = one_instr();
        let mut regs = RegReservations::new();
        for _ in 0..NUM_SPILL_SLOTS {
            regs.reserve(&mut list, at, RegClass::Any, RegSet::ALL).unwrap();
        }
        let err = regs.reserve(&mut list, at, RegClass::Any, RegSet::ALL).unwrap_err();
        assert_eq!(err, HostError::NoSpillSlot);
    }

    #[test]
    fn test_unreserve_unknown_register() {
        let (mut list, at) = one_instr();
        let mut regs = RegReservations::new();
        assert_eq!(regs.unreserve(&mut list, at, Reg::Rbx), Err(HostError::NotReserved(Reg::Rbx)));
    }

    #[test]
    fn test_scope_restores_in_reverse_order() {
        let (mut list, at) = one_instr();
        let mut scope = ScratchScope::open(&mut list, at);
        scope.save_flags().unwrap();
        let a = scope.acquire(RegClass::Counter).unwrap();
        let b = scope.acquire(RegClass::Any).unwrap();
        scope.close().unwrap();

        let emitted = metas(&list);
        assert_eq!(emitted.len(), 6);
        assert_eq!(emitted[3], Meta::Restore { reg: b, slot: SpillSlot(2) });
        assert_eq!(emitted[4], Meta::Restore { reg: a, slot: SpillSlot(1) });
        assert_eq!(emitted[5], Meta::RestoreFlags { slot: SpillSlot(0) });
    }

    #[test]
    fn test_dropped_scope_still_restores() {
        let (mut list, at) = one_instr();
        {
            let mut scope = ScratchScope::open(&mut list, at);
            scope.acquire(RegClass::Any).unwrap();
        }
        let emitted = metas(&list);
        assert!(matches!(emitted.last(), Some(Meta::Restore { reg: Reg::Rbx, .. })));
    }
}
