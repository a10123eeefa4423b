//! Byte encoding for meta instructions placed in shared code images
//!
//! Only position-independent instructions can live in a shared image: no
//! labels, no block-relative addresses. Layout is one opcode byte followed by
//! fixed operands.

use super::isa::{Meta, Reg};
use crate::domain::{CallbackId, HostError, SpillSlot};

const OP_SPILL: u8 = 0x01;
const OP_RESTORE: u8 = 0x02;
const OP_SAVE_FLAGS: u8 = 0x03;
const OP_RESTORE_FLAGS: u8 = 0x04;
const OP_CLEAN_CALL: u8 = 0x10;
const OP_JUMP_INDIRECT: u8 = 0x20;

/// # Errors
/// `Unencodable` for instructions that reference labels or block addresses.
pub fn encode(meta: &Meta, out: &mut Vec<u8>) -> Result<(), HostError> {
    match *meta {
        Meta::Spill { reg, slot } => out.extend_from_slice(&[OP_SPILL, reg as u8, slot.0]),
        Meta::Restore { reg, slot } => out.extend_from_slice(&[OP_RESTORE, reg as u8, slot.0]),
        Meta::SaveFlags { slot } => out.extend_from_slice(&[OP_SAVE_FLAGS, slot.0]),
        Meta::RestoreFlags { slot } => out.extend_from_slice(&[OP_RESTORE_FLAGS, slot.0]),
        Meta::CleanCall { callback } => {
            out.push(OP_CLEAN_CALL);
            out.extend_from_slice(&callback.0.to_le_bytes());
        }
        Meta::JumpIndirect { reg } => out.extend_from_slice(&[OP_JUMP_INDIRECT, reg as u8]),
        other => return Err(HostError::Unencodable(format!("{other:?}"))),
    }
    Ok(())
}

/// Decodes a whole image back into instructions.
///
/// # Errors
/// `MalformedImage` with the offending byte offset.
pub fn decode(bytes: &[u8]) -> Result<Vec<Meta>, HostError> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        let start = pos;
        let bad = || HostError::MalformedImage(start);
        let byte = |i: usize| bytes.get(start + i).copied().ok_or_else(bad);
        let reg = |i: usize| byte(i).and_then(|b| Reg::from_index(b).ok_or_else(bad));

        let (meta, len) = match byte(0)? {
            OP_SPILL => (Meta::Spill { reg: reg(1)?, slot: SpillSlot(byte(2)?) }, 3),
            OP_RESTORE => (Meta::Restore { reg: reg(1)?, slot: SpillSlot(byte(2)?) }, 3),
            OP_SAVE_FLAGS => (Meta::SaveFlags { slot: SpillSlot(byte(1)?) }, 2),
            OP_RESTORE_FLAGS => (Meta::RestoreFlags { slot: SpillSlot(byte(1)?) }, 2),
            OP_CLEAN_CALL => {
                let id = bytes
                    .get(start + 1..start + 5)
                    .and_then(|b| b.try_into().ok())
                    .map(u32::from_le_bytes)
                    .ok_or_else(bad)?;
                (Meta::CleanCall { callback: CallbackId(id) }, 5)
            }
            OP_JUMP_INDIRECT => (Meta::JumpIndirect { reg: reg(1)? }, 2),
            _ => return Err(bad()),
        };
        out.push(meta);
        pos += len;
    }
    Ok(out)
}
