//! # Shared Data Layouts (Injected Code ↔ Collector)
//!
//! Defines the fixed-layout structures that injected fast-path code reads and
//! writes directly. All types use `#[repr(C)]` and export their field offsets
//! as constants: the planner emits stores at `base + OFFSET`, so the offsets
//! are part of the contract, not an implementation detail.
//!
//! ## Key Types
//!
//! - [`TraceRecord`] - One memory access, appended by the fast path
//! - [`ThreadBufferHeader`] - Per-thread cursor/base/end words read by the fast path
//!
//! The layouts assume a 64-bit pointer width and little-endian byte order.

#![cfg_attr(not(test), no_std)]

// ============================================================================
// Buffer Sizing Constants
// ============================================================================

/// Default number of records a thread buffer holds before it is flushed.
pub const DEFAULT_BUFFER_RECORDS: usize = 8192;

/// Size in bytes of one [`TraceRecord`].
pub const RECORD_SIZE: usize = core::mem::size_of::<TraceRecord>();

/// Pointer width of the traced program, in bytes.
pub const PTR_SIZE: u64 = 8;

/// Header line written at the top of every text-format log.
pub const TEXT_LOG_HEADER: &str =
    "Format: <instr address>,<(r)ead/(w)rite>,<data size>,<data address>";

// ============================================================================
// Trace Record
// ============================================================================

/// One recorded memory access.
///
/// **Memory Layout**: `#[repr(C)]`, 32 bytes, fields at fixed offsets:
///
/// | offset | field       | width |
/// |--------|-------------|-------|
/// | 0      | `is_write`  | 4     |
/// | 4      | padding     | 4     |
/// | 8      | `address`   | 8     |
/// | 16     | `size`      | 8     |
/// | 24     | `origin_pc` | 8     |
///
/// Injected code writes `is_write` as a full 32-bit word, which is why it is
/// not a `bool`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TraceRecord {
    /// Non-zero for a write, zero for a read
    pub is_write: u32,

    /// Padding to keep `address` 8-byte aligned
    #[allow(clippy::pub_underscore_fields)]
    pub _padding: u32,

    /// Effective address of the access
    pub address: u64,

    /// Bytes transferred (full region for whole-region operands)
    pub size: u64,

    /// Address of the instruction that performed the access
    pub origin_pc: u64,
}

impl TraceRecord {
    pub const IS_WRITE_OFFSET: u32 = 0;
    pub const ADDRESS_OFFSET: u32 = 8;
    pub const SIZE_OFFSET: u32 = 16;
    pub const ORIGIN_PC_OFFSET: u32 = 24;

    /// Byte size of a record, as a `u64` for address arithmetic.
    pub const BYTE_SIZE: u64 = RECORD_SIZE as u64;

    #[must_use]
    pub const fn new(is_write: bool, address: u64, size: u64, origin_pc: u64) -> Self {
        Self { is_write: is_write as u32, _padding: 0, address, size, origin_pc }
    }

    #[must_use]
    pub const fn is_write(&self) -> bool {
        self.is_write != 0
    }

    /// Encodes the record in its in-memory layout.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        let mut out = [0u8; RECORD_SIZE];
        out[0..4].copy_from_slice(&self.is_write.to_le_bytes());
        out[8..16].copy_from_slice(&self.address.to_le_bytes());
        out[16..24].copy_from_slice(&self.size.to_le_bytes());
        out[24..32].copy_from_slice(&self.origin_pc.to_le_bytes());
        out
    }

    /// Decodes a record from its in-memory layout.
    ///
    /// Returns `None` if `bytes` is shorter than [`RECORD_SIZE`].
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < RECORD_SIZE {
            return None;
        }
        let word = |off: usize| {
            let mut w = [0u8; 8];
            w.copy_from_slice(&bytes[off..off + 8]);
            u64::from_le_bytes(w)
        };
        let mut is_write = [0u8; 4];
        is_write.copy_from_slice(&bytes[0..4]);
        Some(Self {
            is_write: u32::from_le_bytes(is_write),
            _padding: 0,
            address: word(8),
            size: word(16),
            origin_pc: word(24),
        })
    }
}

// ============================================================================
// Thread Buffer Header
// ============================================================================

/// Machine-visible part of a thread's trace buffer.
///
/// The fast path reaches this header through the thread's TLS slot. It loads
/// `cursor`, stores through it, writes the advanced cursor back, then adds
/// `negated_end` to the cursor: the sum is zero exactly when the buffer is
/// full, which lets the overflow test use a jump-if-register-zero instead of a
/// flag-setting compare.
///
/// **Memory Layout**: `#[repr(C)]`, 24 bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ThreadBufferHeader {
    /// Next free record slot
    pub cursor: u64,

    /// First record slot
    pub base: u64,

    /// `-(base + capacity * RECORD_SIZE)` in two's complement
    pub negated_end: i64,
}

impl ThreadBufferHeader {
    pub const CURSOR_OFFSET: u32 = 0;
    pub const BASE_OFFSET: u32 = 8;
    pub const NEGATED_END_OFFSET: u32 = 16;

    pub const BYTE_SIZE: usize = core::mem::size_of::<Self>();

    /// Builds the header for an empty buffer of `capacity` records at `base`.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub const fn for_buffer(base: u64, capacity: usize) -> Self {
        let end = base.wrapping_add(capacity as u64 * TraceRecord::BYTE_SIZE);
        Self { cursor: base, base, negated_end: (end as i64).wrapping_neg() }
    }

    /// End address of the buffer (one past the last record slot).
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub const fn end(&self) -> u64 {
        self.negated_end.wrapping_neg() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_layout_is_fixed() {
        assert_eq!(RECORD_SIZE, 32);
        assert_eq!(core::mem::offset_of!(TraceRecord, is_write), TraceRecord::IS_WRITE_OFFSET as usize);
        assert_eq!(core::mem::offset_of!(TraceRecord, address), TraceRecord::ADDRESS_OFFSET as usize);
        assert_eq!(core::mem::offset_of!(TraceRecord, size), TraceRecord::SIZE_OFFSET as usize);
        assert_eq!(
            core::mem::offset_of!(TraceRecord, origin_pc),
            TraceRecord::ORIGIN_PC_OFFSET as usize
        );
    }

    #[test]
    fn test_header_layout_is_fixed() {
        assert_eq!(ThreadBufferHeader::BYTE_SIZE, 24);
        assert_eq!(
            core::mem::offset_of!(ThreadBufferHeader, negated_end),
            ThreadBufferHeader::NEGATED_END_OFFSET as usize
        );
    }

    #[test]
    fn test_record_bytes_match_layout() {
        let rec = TraceRecord::new(true, 0x1000, 8, 0x40_0000);
        let bytes = rec.to_bytes();
        assert_eq!(bytes[0], 1);
        assert_eq!(&bytes[8..16], &0x1000u64.to_le_bytes());
        assert_eq!(TraceRecord::from_bytes(&bytes), Some(rec));
        assert_eq!(TraceRecord::from_bytes(&bytes[..31]), None);
    }

    #[test]
    #[allow(clippy::cast_sign_loss)]
    fn test_negated_end_sums_to_zero_when_full() {
        let header = ThreadBufferHeader::for_buffer(0x2000_0000, 4);
        assert_eq!(header.end(), 0x2000_0000 + 4 * 32);
        let full_cursor = header.end();
        assert_eq!(full_cursor.wrapping_add(header.negated_end as u64), 0);
        assert_ne!(header.base.wrapping_add(header.negated_end as u64), 0);
    }
}
