//! Injection planner
//!
//! For each memory operand of an application instruction, inserts a fast
//! path in front of the instruction that appends one [`TraceRecord`] to the
//! thread's buffer:
//!
//! ```text
//!   spill  cursor(rcx), addr                 ; scratch reservation
//!   addr   <- effective address of operand   ; app registers still intact
//!   cursor <- [tls]                          ; header address
//!   cursor <- [cursor + CURSOR]
//!   [cursor + IS_WRITE]  <- w                ; 32-bit
//!   [cursor + ADDRESS]   <- addr
//!   [cursor + SIZE]      <- size
//!   [cursor + ORIGIN_PC] <- pc
//!   cursor <- cursor + RECORD_SIZE           ; lea, flags untouched
//!   addr   <- [tls]
//!   [addr + CURSOR] <- cursor
//!   addr   <- [addr + NEGATED_END]
//!   <overflow check>  -> divert | resume
//! divert:
//!   rcx <- &resume
//!   jmp trampoline
//! resume:
//!   restore addr, cursor
//! ```
//!
//! [`TraceRecord`]: memtrace_common::TraceRecord

#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]

use log::trace;
use memtrace_common::{ThreadBufferHeader, TraceRecord};

use super::operand_size::mem_operand_size_in_bytes;
use super::overflow::OverflowCheck;
use crate::domain::{AppPc, Direction, HostError, MemtraceError, TlsIndex};
use crate::host::ilist::{InstrHandle, InstrList, Node};
use crate::host::isa::{Instr, MemRef, Meta, Operand, RegClass, StoreWidth};
use crate::host::regs::ScratchScope;
use crate::trampoline::RESUME_REG;

/// One memory operand selected for recording
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedAccess {
    pub direction: Direction,
    /// Index into `srcs` (reads) or `dsts` (writes)
    pub operand_index: usize,
    pub mem: MemRef,
    pub size: u64,
}

/// Memory operands of `instr` in recording order: sources first, then
/// destinations, each in operand order. Non-memory operands are skipped.
#[must_use]
pub fn plan_accesses(instr: &Instr) -> Vec<PlannedAccess> {
    let mut planned = Vec::new();
    let mut collect = |ops: &[Operand], direction: Direction| {
        for (operand_index, op) in ops.iter().enumerate() {
            if let Some(mem) = op.as_mem() {
                planned.push(PlannedAccess {
                    direction,
                    operand_index,
                    mem: *mem,
                    size: mem_operand_size_in_bytes(instr, mem),
                });
            }
        }
    };
    if instr.reads_memory() {
        collect(&instr.srcs, Direction::Read);
    }
    if instr.writes_memory() {
        collect(&instr.dsts, Direction::Write);
    }
    planned
}

const fn field(offset: u32) -> i32 {
    offset as i32
}

pub struct InjectionPlanner {
    tls: TlsIndex,
    trampoline: u64,
    check: Box<dyn OverflowCheck>,
}

impl InjectionPlanner {
    #[must_use]
    pub fn new(tls: TlsIndex, trampoline: u64, check: Box<dyn OverflowCheck>) -> Self {
        Self { tls, trampoline, check }
    }

    #[must_use]
    pub fn check_name(&self) -> &'static str {
        self.check.name()
    }

    /// Instruments the instruction at `at`. Returns the number of fast paths
    /// inserted; meta instructions and instructions without an application
    /// address get none.
    ///
    /// # Errors
    /// `Instrumentation` when scratch registers cannot be reserved or code
    /// cannot be inserted.
    pub fn instrument_instr(&self, ilist: &mut InstrList, at: InstrHandle) -> Result<usize, MemtraceError> {
        let instr = match ilist.get(at) {
            Some(Node::App(instr)) => instr.clone(),
            Some(Node::Meta(_)) => return Ok(0),
            None => return Err(HostError::NoSuchInstr(at.index()).into()),
        };
        let Some(pc) = instr.app_pc else {
            return Ok(0);
        };

        let accesses = plan_accesses(&instr);
        for access in &accesses {
            self.emit_fast_path(ilist, at, pc, access)
                .map_err(|source| MemtraceError::Instrumentation { pc, source })?;
        }
        if !accesses.is_empty() {
            trace!("{pc}: {} fast path(s)", accesses.len());
        }
        Ok(accesses.len())
    }

    fn emit_fast_path(
        &self,
        ilist: &mut InstrList,
        at: InstrHandle,
        pc: AppPc,
        access: &PlannedAccess,
    ) -> Result<(), HostError> {
        let divert = ilist.new_label();
        let resume = ilist.new_label();
        let mut scope = ScratchScope::open(ilist, at);

        self.check.prepare(&mut scope)?;
        let cursor = scope.acquire(self.check.cursor_class())?;
        if cursor != RESUME_REG {
            return Err(HostError::Conflict(RESUME_REG));
        }
        let addr = scope.acquire(RegClass::Any)?;

        scope.emit(Meta::LoadEffectiveAddress { dst: addr, mem: access.mem })?;
        scope.emit(Meta::ReadTls { dst: cursor, index: self.tls })?;
        scope.emit(Meta::Load { dst: cursor, base: cursor, disp: field(ThreadBufferHeader::CURSOR_OFFSET) })?;

        scope.emit(Meta::StoreImm {
            base: cursor,
            disp: field(TraceRecord::IS_WRITE_OFFSET),
            imm: u64::from(access.direction.is_write()),
            width: StoreWidth::W32,
        })?;
        scope.emit(Meta::Store { base: cursor, disp: field(TraceRecord::ADDRESS_OFFSET), src: addr })?;
        scope.emit(Meta::StoreImm {
            base: cursor,
            disp: field(TraceRecord::SIZE_OFFSET),
            imm: access.size,
            width: StoreWidth::W64,
        })?;
        scope.emit(Meta::StoreImm {
            base: cursor,
            disp: field(TraceRecord::ORIGIN_PC_OFFSET),
            imm: pc.0,
            width: StoreWidth::W64,
        })?;

        scope.emit(Meta::Lea { dst: cursor, base: cursor, index: None, disp: TraceRecord::BYTE_SIZE as i32 })?;
        scope.emit(Meta::ReadTls { dst: addr, index: self.tls })?;
        scope.emit(Meta::Store { base: addr, disp: field(ThreadBufferHeader::CURSOR_OFFSET), src: cursor })?;
        scope.emit(Meta::Load { dst: addr, base: addr, disp: field(ThreadBufferHeader::NEGATED_END_OFFSET) })?;

        self.check.emit(&mut scope, cursor, addr, divert, resume)?;

        scope.emit(Meta::Label(divert))?;
        scope.emit(Meta::MovLabelAddr { dst: RESUME_REG, label: resume })?;
        scope.emit(Meta::JumpAbs { target: self.trampoline })?;
        scope.emit(Meta::Label(resume))?;
        scope.close()
    }
}
