//! Synthetic application programs for the CLI and tests

use clap::ValueEnum;

use crate::domain::AppPc;
use crate::host::isa::{Instr, MemRef, OpSize, Opcode, Operand, Reg};
use crate::host::{BasicBlock, Program};

pub const DATA_BASE: u64 = 0x1000_0000;
pub const STACK_TOP: u64 = 0x2000_0000;
const STACK_SIZE: usize = 0x1_0000;
const CODE_BASE: u64 = 0x40_0000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum Workload {
    /// Load/store pairs plus a string move, walking two arrays
    #[default]
    Copy,
    /// push/pop and enter/leave frames
    Stack,
    /// Read-modify-write, compares, fxsave and a two-source add
    Mixed,
}

fn mem(addr: u64, size: OpSize) -> Operand {
    Operand::Mem(MemRef::absolute(addr, size))
}

/// Lays `instrs` out at 4-byte strides from `base`
fn at(base: u64, instrs: Vec<Instr>) -> Vec<Instr> {
    instrs
        .into_iter()
        .zip((base..).step_by(4))
        .map(|(mut instr, pc)| {
            instr.app_pc = Some(AppPc(pc));
            instr
        })
        .collect()
}

impl Workload {
    /// Memory references executed per iteration
    #[must_use]
    pub fn accesses_per_iteration(self) -> u64 {
        match self {
            Workload::Copy => 4,
            Workload::Stack => 5,
            Workload::Mixed => 8,
        }
    }

    #[must_use]
    pub fn program(self, iterations: u64) -> Program {
        match self {
            Workload::Copy => copy_program(iterations),
            Workload::Stack => stack_program(iterations),
            Workload::Mixed => mixed_program(iterations),
        }
    }
}

fn copy_program(iterations: u64) -> Program {
    // each iteration advances both pointers by 16 bytes
    let span = usize::try_from(iterations.saturating_mul(16)).unwrap_or(usize::MAX / 4) + 16;
    let src = DATA_BASE;
    let dst = DATA_BASE + span as u64;
    let rsi = || Operand::Mem(MemRef::base_disp(Reg::Rsi, 0, OpSize::B8));
    let rdi = || Operand::Mem(MemRef::base_disp(Reg::Rdi, 0, OpSize::B8));

    let instrs = at(
        CODE_BASE,
        vec![
            Instr::mov(0, Operand::Reg(Reg::Rax), rsi()),
            Instr::mov(0, rdi(), Operand::Reg(Reg::Rax)),
            Instr::add(0, Operand::Reg(Reg::Rsi), Operand::Imm(8)),
            Instr::add(0, Operand::Reg(Reg::Rdi), Operand::Imm(8)),
            Instr::movs(0, OpSize::B8),
        ],
    );
    Program {
        blocks: vec![BasicBlock { tag: CODE_BASE, instrs }],
        iterations,
        regions: vec![(DATA_BASE, span * 2)],
        registers: vec![(Reg::Rsi, src), (Reg::Rdi, dst)],
    }
}

fn stack_program(iterations: u64) -> Program {
    let frame_slot = Operand::Mem(MemRef::base_disp(Reg::Rbp, -16, OpSize::B8));
    let instrs = at(
        CODE_BASE + 0x100,
        vec![
            Instr::push(0, Operand::Reg(Reg::Rax)),
            Instr::pop(0, Operand::Reg(Reg::Rbx)),
            Instr::enter(0, 32, 1),
            Instr::mov(0, frame_slot, Operand::Reg(Reg::Rax)),
            Instr::leave(0),
        ],
    );
    Program {
        blocks: vec![BasicBlock { tag: CODE_BASE + 0x100, instrs }],
        iterations,
        regions: vec![(STACK_TOP - STACK_SIZE as u64, STACK_SIZE)],
        registers: vec![(Reg::Rsp, STACK_TOP - 0x100), (Reg::Rbp, STACK_TOP - 0x80), (Reg::Rax, 0x5a)],
    }
}

fn mixed_program(iterations: u64) -> Program {
    let d = DATA_BASE;
    let instrs = at(
        CODE_BASE + 0x200,
        vec![
            Instr::add(0, mem(d, OpSize::B8), Operand::Imm(1)),
            Instr::cmp(0, Operand::Reg(Reg::Rax), mem(d + 8, OpSize::B8)),
            Instr::fxsave(0, MemRef::absolute(d + 0x100, OpSize::B8)),
            Instr::setz(0, Reg::Rbx),
            Instr::mov(0, mem(d + 48, OpSize::B8), Operand::Reg(Reg::Rbx)),
            Instr::ternary(Opcode::Add, 0, mem(d + 24, OpSize::B4), mem(d + 32, OpSize::B4), mem(d + 40, OpSize::B4)),
        ],
    );
    Program {
        blocks: vec![BasicBlock { tag: CODE_BASE + 0x200, instrs }],
        iterations,
        regions: vec![(d, 0x1000)],
        registers: Vec::new(),
    }
}
