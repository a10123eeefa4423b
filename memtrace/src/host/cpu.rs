//! Interpreter for translated fragments
//!
//! Executes application and meta instructions against a [`ThreadContext`].
//! Control leaves a fragment by falling off its end (block exit), or moves
//! between fragments through absolute and indirect jumps resolved by the
//! [`CodeCache`].

// Guest values are raw 64-bit words; widths are small.
#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]

use std::sync::Arc;

use log::trace;
use memtrace_common::PTR_SIZE;

use super::code_cache::{CodeCache, Fragment};
use super::ilist::Node;
use super::isa::{Instr, MemRef, Meta, Opcode, Operand, Reg, StoreWidth};
use super::thread::{Flags, ThreadContext};
use crate::domain::{CallbackId, HostError};

/// Routine invoked by a clean call
pub type CleanCallFn = dyn Fn(&mut ThreadContext) -> Result<(), HostError> + Send + Sync;

/// Registered clean-call targets
#[derive(Default, Clone)]
pub struct CallbackTable {
    entries: Vec<Arc<CleanCallFn>>,
}

impl CallbackTable {
    pub fn register(&mut self, f: Arc<CleanCallFn>) -> CallbackId {
        #[allow(clippy::cast_possible_truncation)]
        let id = CallbackId(self.entries.len() as u32);
        self.entries.push(f);
        id
    }

    /// # Errors
    /// `UnknownCallback`, or whatever the routine returns.
    pub fn invoke(&self, id: CallbackId, ctx: &mut ThreadContext) -> Result<(), HostError> {
        let f = self
            .entries
            .get(id.0 as usize)
            .ok_or(HostError::UnknownCallback(id.0))?;
        f(ctx)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecStats {
    pub app_instrs: u64,
    pub meta_instrs: u64,
    pub clean_calls: u64,
}

impl ExecStats {
    pub fn absorb(&mut self, other: ExecStats) {
        self.app_instrs += other.app_instrs;
        self.meta_instrs += other.meta_instrs;
        self.clean_calls += other.clean_calls;
    }
}

enum Flow {
    Next,
    Goto(usize),
    Transfer(u64),
}

pub struct Cpu<'a> {
    cache: &'a CodeCache,
    callbacks: &'a CallbackTable,
    step_limit: u64,
}

impl<'a> Cpu<'a> {
    pub const DEFAULT_STEP_LIMIT: u64 = 10_000_000;

    #[must_use]
    pub fn new(cache: &'a CodeCache, callbacks: &'a CallbackTable) -> Self {
        Self { cache, callbacks, step_limit: Self::DEFAULT_STEP_LIMIT }
    }

    #[must_use]
    pub fn with_step_limit(mut self, limit: u64) -> Self {
        self.step_limit = limit;
        self
    }

    /// Runs from `entry` until control falls off the end of a fragment.
    ///
    /// # Errors
    /// Faults, unresolvable code addresses, failed clean calls, or the step limit.
    pub fn run(&self, ctx: &mut ThreadContext, entry: u64) -> Result<ExecStats, HostError> {
        let mut stats = ExecStats::default();
        let mut steps = 0u64;
        let mut pc = entry;

        'fragments: loop {
            let (fragment, mut index) = self.cache.lookup(pc).ok_or(HostError::NoCodeAt(pc))?;
            while let Some(node) = fragment.nodes().get(index) {
                steps += 1;
                if steps > self.step_limit {
                    return Err(HostError::StepLimit(self.step_limit));
                }
                let flow = match node {
                    Node::App(instr) => {
                        stats.app_instrs += 1;
                        execute_app(ctx, instr)?;
                        Flow::Next
                    }
                    Node::Meta(meta) => {
                        stats.meta_instrs += 1;
                        self.execute_meta(ctx, &fragment, meta, &mut stats)?
                    }
                };
                match flow {
                    Flow::Next => index += 1,
                    Flow::Goto(target) => index = target,
                    Flow::Transfer(target) => {
                        trace!("transfer 0x{:x} -> 0x{target:x}", fragment.addr_of(index));
                        pc = target;
                        continue 'fragments;
                    }
                }
            }
            return Ok(stats);
        }
    }

    fn execute_meta(
        &self,
        ctx: &mut ThreadContext,
        fragment: &Fragment,
        meta: &Meta,
        stats: &mut ExecStats,
    ) -> Result<Flow, HostError> {
        let m = &mut ctx.machine;
        match *meta {
            Meta::Spill { reg, slot } => {
                let v = m.reg(reg);
                ctx.set_spill_slot(slot, v)?;
            }
            Meta::Restore { reg, slot } => {
                let v = ctx.spill_slot(slot)?;
                ctx.machine.set_reg(reg, v);
            }
            Meta::SaveFlags { slot } => {
                let bits = m.flags.to_bits();
                ctx.set_spill_slot(slot, bits)?;
            }
            Meta::RestoreFlags { slot } => {
                ctx.machine.flags = Flags::from_bits(ctx.spill_slot(slot)?);
            }
            Meta::LoadEffectiveAddress { dst, mem } => {
                let ea = effective_address(ctx, &mem);
                ctx.machine.set_reg(dst, ea);
            }
            Meta::ReadTls { dst, index } => {
                let word = ctx.tls_word(index)?;
                ctx.machine.set_reg(dst, word);
            }
            Meta::Load { dst, base, disp } => {
                let addr = offset(m.reg(base), disp);
                let v = ctx.memory().read_u64(addr)?;
                ctx.machine.set_reg(dst, v);
            }
            Meta::Store { base, disp, src } => {
                let addr = offset(m.reg(base), disp);
                let v = m.reg(src);
                ctx.memory_mut().write_u64(addr, v)?;
            }
            Meta::StoreImm { base, disp, imm, width } => {
                let addr = offset(m.reg(base), disp);
                let width = match width {
                    StoreWidth::W32 => 4,
                    StoreWidth::W64 => 8,
                };
                ctx.memory_mut().write_uint(addr, width, imm)?;
            }
            Meta::Lea { dst, base, index, disp } => {
                let mut v = offset(m.reg(base), disp);
                if let Some(index) = index {
                    v = v.wrapping_add(m.reg(index));
                }
                m.set_reg(dst, v);
            }
            Meta::TestZero { reg } => {
                let v = m.reg(reg);
                m.flags = Flags { zf: v == 0, sf: v >> 63 != 0, cf: false };
            }
            Meta::JumpIfRcxZero { target } => {
                if m.reg(Reg::Rcx) == 0 {
                    return Ok(Flow::Goto(fragment.label_index(target)?));
                }
            }
            Meta::JumpIfZf { target } => {
                if m.flags.zf {
                    return Ok(Flow::Goto(fragment.label_index(target)?));
                }
            }
            Meta::Jump { target } => return Ok(Flow::Goto(fragment.label_index(target)?)),
            Meta::Label(_) => {}
            Meta::MovLabelAddr { dst, label } => {
                let addr = fragment.addr_of(fragment.label_index(label)?);
                m.set_reg(dst, addr);
            }
            Meta::JumpAbs { target } => return Ok(Flow::Transfer(target)),
            Meta::JumpIndirect { reg } => return Ok(Flow::Transfer(m.reg(reg))),
            Meta::CleanCall { callback } => {
                let saved = ctx.machine;
                stats.clean_calls += 1;
                self.callbacks.invoke(callback, ctx)?;
                ctx.machine = saved;
            }
        }
        Ok(Flow::Next)
    }
}

fn offset(base: u64, disp: i32) -> u64 {
    base.wrapping_add_signed(i64::from(disp))
}

fn effective_address(ctx: &ThreadContext, mem: &MemRef) -> u64 {
    let m = &ctx.machine;
    let base = mem.base.map_or(0, |r| m.reg(r));
    let index = mem.index.map_or(0, |r| m.reg(r).wrapping_mul(u64::from(mem.scale)));
    base.wrapping_add(index).wrapping_add_signed(mem.disp)
}

fn scalar_width(mem: &MemRef) -> Result<usize, HostError> {
    match mem.size.bytes() {
        w @ (1 | 2 | 4 | 8) => Ok(w as usize),
        _ => Err(HostError::BadOperand("region operand used as scalar")),
    }
}

fn read_operand(ctx: &ThreadContext, op: &Operand) -> Result<u64, HostError> {
    match op {
        Operand::Reg(r) => Ok(ctx.machine.reg(*r)),
        #[allow(clippy::cast_sign_loss)]
        Operand::Imm(v) => Ok(*v as u64),
        Operand::Mem(mem) => ctx.memory().read_uint(effective_address(ctx, mem), scalar_width(mem)?),
    }
}

fn write_operand(ctx: &mut ThreadContext, op: &Operand, value: u64) -> Result<(), HostError> {
    match op {
        Operand::Reg(r) => {
            ctx.machine.set_reg(*r, value);
            Ok(())
        }
        Operand::Imm(_) => Err(HostError::BadOperand("immediate destination")),
        Operand::Mem(mem) => {
            let addr = effective_address(ctx, mem);
            ctx.memory_mut().write_uint(addr, scalar_width(mem)?, value)
        }
    }
}

fn operand<'i>(ops: &'i [Operand], i: usize, what: &'static str) -> Result<&'i Operand, HostError> {
    ops.get(i).ok_or(HostError::BadOperand(what))
}

/// Width in bytes of an arithmetic operation: the memory operand's size, else 8
fn arith_width(instr: &Instr) -> usize {
    instr
        .srcs
        .iter()
        .chain(&instr.dsts)
        .find_map(|op| op.as_mem().map(|m| m.size.bytes() as usize))
        .unwrap_or(8)
}

fn arith(opcode: Opcode, a: u64, b: u64, width: usize) -> (u64, Flags) {
    let bits = (width * 8).min(64);
    let mask = if bits == 64 { u64::MAX } else { (1u64 << bits) - 1 };
    let (a, b) = (a & mask, b & mask);
    let (res, cf) = match opcode {
        Opcode::Add => {
            let res = a.wrapping_add(b) & mask;
            (res, res < a)
        }
        _ => (a.wrapping_sub(b) & mask, a < b),
    };
    (res, Flags { zf: res == 0, sf: (res >> (bits - 1)) & 1 != 0, cf })
}

fn push(ctx: &mut ThreadContext, value: u64) -> Result<(), HostError> {
    let rsp = ctx.machine.reg(Reg::Rsp).wrapping_sub(PTR_SIZE);
    ctx.memory_mut().write_u64(rsp, value)?;
    ctx.machine.set_reg(Reg::Rsp, rsp);
    Ok(())
}

fn pop(ctx: &mut ThreadContext) -> Result<u64, HostError> {
    let rsp = ctx.machine.reg(Reg::Rsp);
    let value = ctx.memory().read_u64(rsp)?;
    ctx.machine.set_reg(Reg::Rsp, rsp.wrapping_add(PTR_SIZE));
    Ok(value)
}

fn execute_app(ctx: &mut ThreadContext, instr: &Instr) -> Result<(), HostError> {
    match instr.opcode {
        Opcode::Nop => {}
        Opcode::Mov => {
            let v = read_operand(ctx, operand(&instr.srcs, 0, "mov")?)?;
            write_operand(ctx, operand(&instr.dsts, 0, "mov")?, v)?;
        }
        Opcode::Add | Opcode::Sub | Opcode::Cmp => {
            let a = read_operand(ctx, operand(&instr.srcs, 0, "arith")?)?;
            let b = read_operand(ctx, operand(&instr.srcs, 1, "arith")?)?;
            let (res, flags) = arith(instr.opcode, a, b, arith_width(instr));
            if instr.opcode != Opcode::Cmp {
                write_operand(ctx, operand(&instr.dsts, 0, "arith")?, res)?;
            }
            ctx.machine.flags = flags;
        }
        Opcode::Setz => {
            let v = u64::from(ctx.machine.flags.zf);
            write_operand(ctx, operand(&instr.dsts, 0, "setz")?, v)?;
        }
        Opcode::Push => {
            let v = read_operand(ctx, operand(&instr.srcs, 0, "push")?)?;
            push(ctx, v)?;
        }
        Opcode::Pop => {
            let v = pop(ctx)?;
            write_operand(ctx, operand(&instr.dsts, 0, "pop")?, v)?;
        }
        Opcode::Enter => {
            let frame = read_operand(ctx, operand(&instr.srcs, 0, "enter")?)?;
            let nesting = read_operand(ctx, operand(&instr.srcs, 1, "enter")?)? & 0x1f;
            let saved_rbp = ctx.machine.reg(Reg::Rbp);
            push(ctx, saved_rbp)?;
            let frame_temp = ctx.machine.reg(Reg::Rsp);
            if nesting > 0 {
                let mut rbp = ctx.machine.reg(Reg::Rbp);
                for _ in 1..nesting {
                    rbp = rbp.wrapping_sub(PTR_SIZE);
                    let outer = ctx.memory().read_u64(rbp)?;
                    push(ctx, outer)?;
                }
                push(ctx, frame_temp)?;
            }
            ctx.machine.set_reg(Reg::Rbp, frame_temp);
            let rsp = ctx.machine.reg(Reg::Rsp).wrapping_sub(frame);
            ctx.machine.set_reg(Reg::Rsp, rsp);
        }
        Opcode::Leave => {
            ctx.machine.set_reg(Reg::Rsp, ctx.machine.reg(Reg::Rbp));
            let rbp = pop(ctx)?;
            ctx.machine.set_reg(Reg::Rbp, rbp);
        }
        Opcode::Movs | Opcode::Cmps => {
            let src = operand(&instr.srcs, 0, "string op")?;
            let size = src.as_mem().map_or(8, |m| m.size.bytes());
            let a = read_operand(ctx, src)?;
            if instr.opcode == Opcode::Movs {
                write_operand(ctx, operand(&instr.dsts, 0, "movs")?, a)?;
            } else {
                let b = read_operand(ctx, operand(&instr.srcs, 1, "cmps")?)?;
                #[allow(clippy::cast_possible_truncation)]
                let (_, flags) = arith(Opcode::Cmp, a, b, size as usize);
                ctx.machine.flags = flags;
            }
            for r in [Reg::Rsi, Reg::Rdi] {
                let v = ctx.machine.reg(r).wrapping_add(size);
                ctx.machine.set_reg(r, v);
            }
        }
        Opcode::Fxsave => {
            let mem = operand(&instr.dsts, 0, "fxsave")?
                .as_mem()
                .ok_or(HostError::BadOperand("fxsave"))?;
            #[allow(clippy::cast_possible_truncation)]
            let mut image = vec![0u8; mem.size.bytes() as usize];
            for (chunk, value) in image.chunks_exact_mut(8).zip(ctx.machine.regs) {
                chunk.copy_from_slice(&value.to_le_bytes());
            }
            let addr = effective_address(ctx, mem);
            ctx.memory_mut().write(addr, &image)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{SpillSlot, ThreadId};
    use crate::host::isa::{Label, OpSize};
    use crate::host::memory::{AddressSpace, Perms};

    const DATA: u64 = 0x1000_0000;

    fn context() -> ThreadContext {
        let mut mem = AddressSpace::new();
        mem.map(DATA, 0x1000, Perms::RW).unwrap();
        let mut ctx = ThreadContext::new(ThreadId(1), mem);
        ctx.machine.set_reg(Reg::Rsp, DATA + 0x800);
        ctx.machine.set_reg(Reg::Rbp, DATA + 0x800);
        ctx
    }

    fn run_nodes(ctx: &mut ThreadContext, nodes: Vec<Node>) -> Result<ExecStats, HostError> {
        let mut cache = CodeCache::new();
        let entry = cache.insert_block(0, nodes);
        let callbacks = CallbackTable::default();
        Cpu::new(&cache, &callbacks).run(ctx, entry)
    }

    #[test]
    fn test_mov_and_add_through_memory() {
        let mut ctx = context();
        ctx.machine.set_reg(Reg::Rbx, DATA);
        let slot = Operand::Mem(MemRef::base_disp(Reg::Rbx, 8, OpSize::B8));
        let nodes = vec![
            Node::App(Instr::mov(1, slot, Operand::Imm(40))),
            Node::App(Instr::add(2, slot, Operand::Imm(2))),
            Node::App(Instr::mov(3, Operand::Reg(Reg::Rax), slot)),
        ];
        let stats = run_nodes(&mut ctx, nodes).unwrap();
        assert_eq!(stats.app_instrs, 3);
        assert_eq!(ctx.machine.reg(Reg::Rax), 42);
    }

    #[test]
    fn test_sub_sets_zero_flag() {
        let mut ctx = context();
        ctx.machine.set_reg(Reg::Rax, 5);
        let nodes = vec![
            Node::App(Instr::sub(1, Operand::Reg(Reg::Rax), Operand::Imm(5))),
            Node::App(Instr::setz(2, Reg::Rdx)),
        ];
        run_nodes(&mut ctx, nodes).unwrap();
        assert!(ctx.machine.flags.zf);
        assert_eq!(ctx.machine.reg(Reg::Rdx), 1);
    }

    #[test]
    fn test_enter_leave_balance_stack() {
        let mut ctx = context();
        let before = ctx.machine;
        let nodes = vec![Node::App(Instr::enter(1, 32, 1)), Node::App(Instr::leave(2))];
        run_nodes(&mut ctx, nodes).unwrap();
        assert_eq!(ctx.machine.reg(Reg::Rsp), before.reg(Reg::Rsp));
        assert_eq!(ctx.machine.reg(Reg::Rbp), before.reg(Reg::Rbp));
    }

    #[test]
    fn test_movs_copies_and_advances() {
        let mut ctx = context();
        ctx.memory_mut().write_u64(DATA, 0xabcd).unwrap();
        ctx.machine.set_reg(Reg::Rsi, DATA);
        ctx.machine.set_reg(Reg::Rdi, DATA + 0x100);
        run_nodes(&mut ctx, vec![Node::App(Instr::movs(1, OpSize::B8))]).unwrap();
        assert_eq!(ctx.memory().read_u64(DATA + 0x100).unwrap(), 0xabcd);
        assert_eq!(ctx.machine.reg(Reg::Rsi), DATA + 8);
    }

    #[test]
    fn test_lea_preserves_flags_and_test_zero_does_not() {
        let mut ctx = context();
        ctx.machine.flags = Flags { zf: false, sf: true, cf: true };
        ctx.machine.set_reg(Reg::Rcx, 8);
        ctx.machine.set_reg(Reg::Rbx, u64::MAX - 7);
        let nodes = vec![Node::Meta(Meta::Lea { dst: Reg::Rcx, base: Reg::Rbx, index: Some(Reg::Rcx), disp: 0 })];
        run_nodes(&mut ctx, nodes).unwrap();
        assert_eq!(ctx.machine.reg(Reg::Rcx), 0);
        assert_eq!(ctx.machine.flags, Flags { zf: false, sf: true, cf: true });

        run_nodes(&mut ctx, vec![Node::Meta(Meta::TestZero { reg: Reg::Rcx })]).unwrap();
        assert_eq!(ctx.machine.flags, Flags { zf: true, sf: false, cf: false });
    }

    #[test]
    fn test_jump_if_rcx_zero_takes_branch() {
        let mut ctx = context();
        let skip = Label(0);
        let nodes = vec![
            Node::Meta(Meta::JumpIfRcxZero { target: skip }),
            Node::App(Instr::mov(1, Operand::Reg(Reg::Rax), Operand::Imm(1))),
            Node::Meta(Meta::Label(skip)),
        ];
        run_nodes(&mut ctx, nodes).unwrap();
        assert_eq!(ctx.machine.reg(Reg::Rax), 0);
    }

    #[test]
    fn test_clean_call_restores_machine_state() {
        let mut ctx = context();
        ctx.machine.set_reg(Reg::Rax, 7);
        let mut callbacks = CallbackTable::default();
        let id = callbacks.register(Arc::new(|ctx: &mut ThreadContext| {
            ctx.machine.set_reg(Reg::Rax, 0);
            ctx.machine.flags.zf = true;
            ctx.set_spill_slot(SpillSlot(7), 99)
        }));
        let mut cache = CodeCache::new();
        let entry = cache.insert_block(0, vec![Node::Meta(Meta::CleanCall { callback: id })]);
        let stats = Cpu::new(&cache, &callbacks).run(&mut ctx, entry).unwrap();
        assert_eq!(stats.clean_calls, 1);
        assert_eq!(ctx.machine.reg(Reg::Rax), 7);
        assert!(!ctx.machine.flags.zf);
    }

    #[test]
    fn test_unknown_callback_and_bad_transfer() {
        let mut ctx = context();
        let err = run_nodes(&mut ctx, vec![Node::Meta(Meta::CleanCall { callback: CallbackId(5) })]).unwrap_err();
        assert_eq!(err, HostError::UnknownCallback(5));
        let err = run_nodes(&mut ctx, vec![Node::Meta(Meta::JumpAbs { target: 0x42 })]).unwrap_err();
        assert_eq!(err, HostError::NoCodeAt(0x42));
    }

    #[test]
    fn test_step_limit() {
        let mut ctx = context();
        let top = Label(0);
        let mut cache = CodeCache::new();
        let entry = cache.insert_block(0, vec![Node::Meta(Meta::Label(top)), Node::Meta(Meta::Jump { target: top })]);
        let callbacks = CallbackTable::default();
        let err = Cpu::new(&cache, &callbacks).with_step_limit(100).run(&mut ctx, entry).unwrap_err();
        assert_eq!(err, HostError::StepLimit(100));
    }
}
