//! Byte size of a memory operand as it will be recorded

use crate::host::isa::{Instr, MemRef, Opcode, Operand};

/// Only the low five bits of `enter`'s nesting immediate are used by the CPU.
const ENTER_NESTING_MASK: i64 = 0x1f;

/// Bytes moved by `mem` when executed as part of `instr`.
///
/// Most operands report their declared width. `enter` pushes one frame word
/// per nesting level plus the saved frame pointer, so its store operand
/// covers `width * (nesting + 1)` bytes. Region operands (`fxsave`) already
/// carry their full size.
#[must_use]
pub fn mem_operand_size_in_bytes(instr: &Instr, mem: &MemRef) -> u64 {
    match instr.opcode {
        Opcode::Enter => {
            let nesting = instr.srcs.get(1).and_then(Operand::as_imm).unwrap_or(0) & ENTER_NESTING_MASK;
            #[allow(clippy::cast_sign_loss)]
            let words = nesting as u64 + 1;
            mem.size.bytes() * words
        }
        _ => mem.size.bytes(),
    }
}
