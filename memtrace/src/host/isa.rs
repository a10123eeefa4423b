//! Instruction-set model shared by the host and the instrumentation core
//!
//! Application instructions carry explicit source and destination operand
//! lists, so the planner can query "is operand *i* a memory reference" without
//! knowing each opcode. Binary operations use `srcs[0] op srcs[1] -> dsts[0]`.
//! Meta instructions are the ones injected by instrumentation.

use std::fmt;

use crate::domain::{AppPc, CallbackId, SpillSlot, TlsIndex};

// ============================================================================
// Registers
// ============================================================================

/// General-purpose registers (x86-64 naming and numbering)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

pub const NUM_GPRS: usize = 16;

impl Reg {
    pub const ALL: [Reg; NUM_GPRS] = [
        Reg::Rax,
        Reg::Rcx,
        Reg::Rdx,
        Reg::Rbx,
        Reg::Rsp,
        Reg::Rbp,
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
    ];

    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }

    #[must_use]
    pub fn from_index(index: u8) -> Option<Reg> {
        Reg::ALL.get(usize::from(index)).copied()
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Reg::Rax => "rax",
            Reg::Rcx => "rcx",
            Reg::Rdx => "rdx",
            Reg::Rbx => "rbx",
            Reg::Rsp => "rsp",
            Reg::Rbp => "rbp",
            Reg::Rsi => "rsi",
            Reg::Rdi => "rdi",
            Reg::R8 => "r8",
            Reg::R9 => "r9",
            Reg::R10 => "r10",
            Reg::R11 => "r11",
            Reg::R12 => "r12",
            Reg::R13 => "r13",
            Reg::R14 => "r14",
            Reg::R15 => "r15",
        }
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Constraint on which register a reservation may hand out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegClass {
    /// Any register except the stack pointer
    Any,
    /// The counter register, required by jump-if-rcx-zero
    Counter,
}

impl RegClass {
    #[must_use]
    pub fn admits(self, reg: Reg) -> bool {
        match self {
            RegClass::Any => reg != Reg::Rsp,
            RegClass::Counter => reg == Reg::Rcx,
        }
    }
}

/// Small bitset of registers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RegSet(u16);

impl RegSet {
    pub const EMPTY: RegSet = RegSet(0);
    pub const ALL: RegSet = RegSet(u16::MAX);

    #[must_use]
    pub fn of(regs: &[Reg]) -> Self {
        regs.iter().fold(Self::EMPTY, |set, &r| set.with(r))
    }

    #[must_use]
    pub fn with(self, reg: Reg) -> Self {
        RegSet(self.0 | (1 << reg.index()))
    }

    #[must_use]
    pub fn without(self, reg: Reg) -> Self {
        RegSet(self.0 & !(1 << reg.index()))
    }

    #[must_use]
    pub fn contains(self, reg: Reg) -> bool {
        self.0 & (1 << reg.index()) != 0
    }

    #[must_use]
    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = Reg> {
        Reg::ALL.into_iter().filter(move |r| self.contains(*r))
    }
}

// ============================================================================
// Operands
// ============================================================================

/// Width of a memory operand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpSize {
    B1,
    B2,
    B4,
    B8,
    /// Whole-region operand (e.g. an `fxsave` image)
    Region(u32),
}

impl OpSize {
    #[must_use]
    pub fn bytes(self) -> u64 {
        match self {
            OpSize::B1 => 1,
            OpSize::B2 => 2,
            OpSize::B4 => 4,
            OpSize::B8 => 8,
            OpSize::Region(n) => u64::from(n),
        }
    }
}

/// Memory reference: `[base + index * scale + disp]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemRef {
    pub base: Option<Reg>,
    pub index: Option<Reg>,
    pub scale: u8,
    pub disp: i64,
    pub size: OpSize,
}

impl MemRef {
    #[must_use]
    pub fn base_disp(base: Reg, disp: i64, size: OpSize) -> Self {
        Self { base: Some(base), index: None, scale: 1, disp, size }
    }

    #[must_use]
    pub fn indexed(base: Reg, index: Reg, scale: u8, disp: i64, size: OpSize) -> Self {
        Self { base: Some(base), index: Some(index), scale, disp, size }
    }

    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn absolute(addr: u64, size: OpSize) -> Self {
        Self { base: None, index: None, scale: 1, disp: addr as i64, size }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    Reg(Reg),
    Imm(i64),
    Mem(MemRef),
}

impl Operand {
    #[must_use]
    pub fn is_memory_reference(&self) -> bool {
        matches!(self, Operand::Mem(_))
    }

    #[must_use]
    pub fn as_mem(&self) -> Option<&MemRef> {
        match self {
            Operand::Mem(m) => Some(m),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_imm(&self) -> Option<i64> {
        match self {
            Operand::Imm(v) => Some(*v),
            _ => None,
        }
    }
}

// ============================================================================
// Application Instructions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Nop,
    Mov,
    Add,
    Sub,
    Cmp,
    Setz,
    Push,
    Pop,
    /// `enter frame_size, nesting`: pushes `nesting + 1` frame words
    Enter,
    Leave,
    Movs,
    Cmps,
    Fxsave,
}

/// A decoded application instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instr {
    pub opcode: Opcode,
    /// Original address; `None` for instructions the host synthesized
    pub app_pc: Option<AppPc>,
    pub srcs: Vec<Operand>,
    pub dsts: Vec<Operand>,
}

impl Instr {
    #[must_use]
    pub fn new(opcode: Opcode, pc: u64, srcs: Vec<Operand>, dsts: Vec<Operand>) -> Self {
        Self { opcode, app_pc: Some(AppPc(pc)), srcs, dsts }
    }

    #[must_use]
    pub fn nop(pc: u64) -> Self {
        Self::new(Opcode::Nop, pc, Vec::new(), Vec::new())
    }

    #[must_use]
    pub fn mov(pc: u64, dst: Operand, src: Operand) -> Self {
        Self::new(Opcode::Mov, pc, vec![src], vec![dst])
    }

    /// Two-operand form: `dst = dst + src`
    #[must_use]
    pub fn add(pc: u64, dst: Operand, src: Operand) -> Self {
        Self::new(Opcode::Add, pc, vec![dst, src], vec![dst])
    }

    /// Two-operand form: `dst = dst - src`
    #[must_use]
    pub fn sub(pc: u64, dst: Operand, src: Operand) -> Self {
        Self::new(Opcode::Sub, pc, vec![dst, src], vec![dst])
    }

    /// Three-operand form: `dst = a <op> b`
    #[must_use]
    pub fn ternary(opcode: Opcode, pc: u64, dst: Operand, a: Operand, b: Operand) -> Self {
        Self::new(opcode, pc, vec![a, b], vec![dst])
    }

    #[must_use]
    pub fn cmp(pc: u64, a: Operand, b: Operand) -> Self {
        Self::new(Opcode::Cmp, pc, vec![a, b], Vec::new())
    }

    #[must_use]
    pub fn setz(pc: u64, dst: Reg) -> Self {
        Self::new(Opcode::Setz, pc, Vec::new(), vec![Operand::Reg(dst)])
    }

    #[must_use]
    pub fn push(pc: u64, src: Operand) -> Self {
        Self::new(
            Opcode::Push,
            pc,
            vec![src, Operand::Reg(Reg::Rsp)],
            vec![Operand::Mem(MemRef::base_disp(Reg::Rsp, -8, OpSize::B8)), Operand::Reg(Reg::Rsp)],
        )
    }

    #[must_use]
    pub fn pop(pc: u64, dst: Operand) -> Self {
        Self::new(
            Opcode::Pop,
            pc,
            vec![Operand::Mem(MemRef::base_disp(Reg::Rsp, 0, OpSize::B8)), Operand::Reg(Reg::Rsp)],
            vec![dst, Operand::Reg(Reg::Rsp)],
        )
    }

    #[must_use]
    pub fn enter(pc: u64, frame_size: u16, nesting: u8) -> Self {
        Self::new(
            Opcode::Enter,
            pc,
            vec![
                Operand::Imm(i64::from(frame_size)),
                Operand::Imm(i64::from(nesting)),
                Operand::Reg(Reg::Rbp),
                Operand::Reg(Reg::Rsp),
            ],
            vec![
                Operand::Mem(MemRef::base_disp(Reg::Rsp, -8, OpSize::B8)),
                Operand::Reg(Reg::Rbp),
                Operand::Reg(Reg::Rsp),
            ],
        )
    }

    #[must_use]
    pub fn leave(pc: u64) -> Self {
        Self::new(
            Opcode::Leave,
            pc,
            vec![Operand::Mem(MemRef::base_disp(Reg::Rbp, 0, OpSize::B8)), Operand::Reg(Reg::Rbp)],
            vec![Operand::Reg(Reg::Rsp), Operand::Reg(Reg::Rbp)],
        )
    }

    /// Single-element string move `[rdi] = [rsi]`, advancing both pointers
    #[must_use]
    pub fn movs(pc: u64, size: OpSize) -> Self {
        Self::new(
            Opcode::Movs,
            pc,
            vec![
                Operand::Mem(MemRef::base_disp(Reg::Rsi, 0, size)),
                Operand::Reg(Reg::Rsi),
                Operand::Reg(Reg::Rdi),
            ],
            vec![
                Operand::Mem(MemRef::base_disp(Reg::Rdi, 0, size)),
                Operand::Reg(Reg::Rsi),
                Operand::Reg(Reg::Rdi),
            ],
        )
    }

    /// Single-element string compare of `[rsi]` with `[rdi]`
    #[must_use]
    pub fn cmps(pc: u64, size: OpSize) -> Self {
        Self::new(
            Opcode::Cmps,
            pc,
            vec![
                Operand::Mem(MemRef::base_disp(Reg::Rsi, 0, size)),
                Operand::Mem(MemRef::base_disp(Reg::Rdi, 0, size)),
                Operand::Reg(Reg::Rsi),
                Operand::Reg(Reg::Rdi),
            ],
            vec![Operand::Reg(Reg::Rsi), Operand::Reg(Reg::Rdi)],
        )
    }

    #[must_use]
    pub fn fxsave(pc: u64, dst: MemRef) -> Self {
        let dst = MemRef { size: OpSize::Region(FXSAVE_REGION_BYTES), ..dst };
        Self::new(Opcode::Fxsave, pc, Vec::new(), vec![Operand::Mem(dst)])
    }

    #[must_use]
    pub fn reads_memory(&self) -> bool {
        self.srcs.iter().any(Operand::is_memory_reference)
    }

    #[must_use]
    pub fn writes_memory(&self) -> bool {
        self.dsts.iter().any(Operand::is_memory_reference)
    }
}

/// Size of the `fxsave` register image
pub const FXSAVE_REGION_BYTES: u32 = 512;

// ============================================================================
// Meta (Injected) Instructions
// ============================================================================

/// Branch target inside one instruction list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(pub u32);

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Width of an immediate store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreWidth {
    W32,
    W64,
}

/// Instrumentation instruction. None of these touch flags except `TestZero`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Meta {
    Spill { reg: Reg, slot: SpillSlot },
    Restore { reg: Reg, slot: SpillSlot },
    SaveFlags { slot: SpillSlot },
    RestoreFlags { slot: SpillSlot },
    /// `dst = effective address of mem`, computed from application register values
    LoadEffectiveAddress { dst: Reg, mem: MemRef },
    ReadTls { dst: Reg, index: TlsIndex },
    Load { dst: Reg, base: Reg, disp: i32 },
    Store { base: Reg, disp: i32, src: Reg },
    StoreImm { base: Reg, disp: i32, imm: u64, width: StoreWidth },
    /// `dst = base + index + disp` without touching flags
    Lea { dst: Reg, base: Reg, index: Option<Reg>, disp: i32 },
    /// Sets ZF from `reg == 0`; clobbers the other flags
    TestZero { reg: Reg },
    JumpIfRcxZero { target: Label },
    JumpIfZf { target: Label },
    Jump { target: Label },
    Label(Label),
    /// Loads the code address of `label` into `dst`
    MovLabelAddr { dst: Reg, label: Label },
    JumpAbs { target: u64 },
    JumpIndirect { reg: Reg },
    /// Full context save, call of a registered routine, full context restore
    CleanCall { callback: CallbackId },
}
