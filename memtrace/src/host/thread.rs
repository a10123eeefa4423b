//! Per-thread execution context
//!
//! Everything the host keeps for one application thread: architectural
//! state, spill slots, thread-local fields and the thread's address space.
//! Clients receive it as an explicit `&mut ThreadContext` in every hook.

use std::any::Any;

use super::isa::{Reg, NUM_GPRS};
use super::memory::AddressSpace;
use super::regs::NUM_SPILL_SLOTS;
use crate::domain::{HostError, SpillSlot, ThreadId, TlsIndex};

/// Arithmetic flags tracked by the CPU model
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    pub zf: bool,
    pub sf: bool,
    pub cf: bool,
}

impl Flags {
    /// Packs into the x86 `rflags` bit positions
    #[must_use]
    pub fn to_bits(self) -> u64 {
        u64::from(self.cf) | (u64::from(self.zf) << 6) | (u64::from(self.sf) << 7)
    }

    #[must_use]
    pub fn from_bits(bits: u64) -> Self {
        Self { cf: bits & 1 != 0, zf: bits & (1 << 6) != 0, sf: bits & (1 << 7) != 0 }
    }
}

/// Architectural register state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MachineState {
    pub regs: [u64; NUM_GPRS],
    pub flags: Flags,
}

impl MachineState {
    #[must_use]
    pub fn reg(&self, reg: Reg) -> u64 {
        self.regs[reg.index()]
    }

    pub fn set_reg(&mut self, reg: Reg, value: u64) {
        self.regs[reg.index()] = value;
    }
}

#[derive(Default)]
struct TlsField {
    /// Machine-visible word, read by `ReadTls`
    word: u64,
    data: Option<Box<dyn Any + Send>>,
}

pub struct ThreadContext {
    id: ThreadId,
    pub machine: MachineState,
    spill: [u64; NUM_SPILL_SLOTS],
    tls: Vec<TlsField>,
    memory: AddressSpace,
}

impl ThreadContext {
    #[must_use]
    pub fn new(id: ThreadId, memory: AddressSpace) -> Self {
        Self { id, machine: MachineState::default(), spill: [0; NUM_SPILL_SLOTS], tls: Vec::new(), memory }
    }

    #[must_use]
    pub fn id(&self) -> ThreadId {
        self.id
    }

    #[must_use]
    pub fn memory(&self) -> &AddressSpace {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut AddressSpace {
        &mut self.memory
    }

    /// # Errors
    /// `BadSpillSlot` if the slot index is out of range.
    pub fn spill_slot(&self, slot: SpillSlot) -> Result<u64, HostError> {
        self.spill.get(usize::from(slot.0)).copied().ok_or(HostError::BadSpillSlot(slot))
    }

    /// # Errors
    /// `BadSpillSlot` if the slot index is out of range.
    pub fn set_spill_slot(&mut self, slot: SpillSlot, value: u64) -> Result<(), HostError> {
        let cell = self.spill.get_mut(usize::from(slot.0)).ok_or(HostError::BadSpillSlot(slot))?;
        *cell = value;
        Ok(())
    }

    fn field_mut(&mut self, index: TlsIndex) -> &mut TlsField {
        if self.tls.len() <= index.0 {
            self.tls.resize_with(index.0 + 1, TlsField::default);
        }
        &mut self.tls[index.0]
    }

    /// # Errors
    /// `NoTlsField` if the field was never set on this thread.
    pub fn tls_word(&self, index: TlsIndex) -> Result<u64, HostError> {
        self.tls.get(index.0).map(|f| f.word).ok_or(HostError::NoTlsField(index.0))
    }

    pub fn set_tls_word(&mut self, index: TlsIndex, word: u64) {
        self.field_mut(index).word = word;
    }

    pub fn set_tls_data<T: Any + Send>(&mut self, index: TlsIndex, data: T) {
        self.field_mut(index).data = Some(Box::new(data));
    }

    #[must_use]
    pub fn tls_data<T: Any + Send>(&self, index: TlsIndex) -> Option<&T> {
        self.tls.get(index.0)?.data.as_ref()?.downcast_ref()
    }

    /// Typed TLS data together with the address space, borrowed disjointly
    pub fn tls_data_with_memory<T: Any + Send>(
        &mut self,
        index: TlsIndex,
    ) -> Option<(&mut T, &mut AddressSpace)> {
        let data = self.tls.get_mut(index.0)?.data.as_mut()?.downcast_mut()?;
        Some((data, &mut self.memory))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_bits_round_trip() {
        let flags = Flags { zf: true, sf: false, cf: true };
        assert_eq!(flags.to_bits(), 0x41);
        assert_eq!(Flags::from_bits(flags.to_bits()), flags);
    }

    #[test]
    fn test_tls_word_unset_is_error() {
        let ctx = ThreadContext::new(ThreadId(1), AddressSpace::new());
        assert_eq!(ctx.tls_word(TlsIndex(0)), Err(HostError::NoTlsField(0)));
    }

    #[test]
    fn test_typed_tls_data() {
        let mut ctx = ThreadContext::new(ThreadId(1), AddressSpace::new());
        ctx.set_tls_data(TlsIndex(2), 41u32);
        ctx.set_tls_word(TlsIndex(2), 0x1000);
        if let Some((value, _mem)) = ctx.tls_data_with_memory::<u32>(TlsIndex(2)) {
            *value += 1;
        }
        assert_eq!(ctx.tls_data::<u32>(TlsIndex(2)), Some(&42));
        assert_eq!(ctx.tls_data::<u64>(TlsIndex(2)), None);
        assert_eq!(ctx.tls_word(TlsIndex(2)), Ok(0x1000));
    }

    #[test]
    fn test_spill_slot_bounds() {
        let mut ctx = ThreadContext::new(ThreadId(1), AddressSpace::new());
        ctx.set_spill_slot(SpillSlot(0), 9).unwrap();
        assert_eq!(ctx.spill_slot(SpillSlot(0)), Ok(9));
        assert!(ctx.set_spill_slot(SpillSlot(200), 1).is_err());
    }
}
