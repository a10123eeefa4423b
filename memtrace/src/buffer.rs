//! Per-thread trace buffer
//!
//! Lives in the thread's address space: a [`ThreadBufferHeader`] (the part
//! injected code reads and writes) plus `capacity` record slots. The header
//! address is what the thread's TLS slot holds.
//!
//! Only the owning thread touches its buffer, so none of these operations
//! synchronize.

// Header words are raw 64-bit values shared with injected code.
#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap, clippy::cast_sign_loss)]

use memtrace_common::{ThreadBufferHeader, TraceRecord, RECORD_SIZE};

use crate::domain::{HostError, MemtraceError};
use crate::host::memory::{AddressSpace, Perms};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadTraceBuffer {
    header_addr: u64,
    base: u64,
    capacity: usize,
}

impl ThreadTraceBuffer {
    /// Allocates and initializes header and storage.
    ///
    /// # Errors
    /// `OutOfMemory` if either allocation fails.
    pub fn allocate(mem: &mut AddressSpace, capacity: usize) -> Result<Self, HostError> {
        let bytes = capacity
            .checked_mul(RECORD_SIZE)
            .filter(|b| *b > 0)
            .ok_or(HostError::OutOfMemory(usize::MAX))?;
        let header_addr = mem.alloc(ThreadBufferHeader::BYTE_SIZE, Perms::RW)?;
        let base = match mem.alloc(bytes, Perms::RW) {
            Ok(base) => base,
            Err(e) => {
                mem.unmap(header_addr)?;
                return Err(e);
            }
        };
        let buffer = Self { header_addr, base, capacity };
        buffer.write_header(mem, &ThreadBufferHeader::for_buffer(base, capacity))?;
        Ok(buffer)
    }

    fn field(&self, offset: u32) -> u64 {
        self.header_addr + u64::from(offset)
    }

    fn write_header(&self, mem: &mut AddressSpace, header: &ThreadBufferHeader) -> Result<(), HostError> {
        mem.write_u64(self.field(ThreadBufferHeader::CURSOR_OFFSET), header.cursor)?;
        mem.write_u64(self.field(ThreadBufferHeader::BASE_OFFSET), header.base)?;
        mem.write_u64(self.field(ThreadBufferHeader::NEGATED_END_OFFSET), header.negated_end as u64)
    }

    /// # Errors
    /// `Fault` if the header is no longer mapped.
    pub fn header(&self, mem: &AddressSpace) -> Result<ThreadBufferHeader, HostError> {
        Ok(ThreadBufferHeader {
            cursor: mem.read_u64(self.field(ThreadBufferHeader::CURSOR_OFFSET))?,
            base: mem.read_u64(self.field(ThreadBufferHeader::BASE_OFFSET))?,
            negated_end: mem.read_u64(self.field(ThreadBufferHeader::NEGATED_END_OFFSET))? as i64,
        })
    }

    /// Address stored in the thread's TLS slot
    #[must_use]
    pub fn header_addr(&self) -> u64 {
        self.header_addr
    }

    #[must_use]
    pub fn base(&self) -> u64 {
        self.base
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn end(&self) -> u64 {
        self.base + (self.capacity * RECORD_SIZE) as u64
    }

    /// # Errors
    /// `Fault` if the header is no longer mapped.
    pub fn cursor(&self, mem: &AddressSpace) -> Result<u64, HostError> {
        mem.read_u64(self.field(ThreadBufferHeader::CURSOR_OFFSET))
    }

    /// Records written since the last reset.
    ///
    /// # Errors
    /// `CorruptBuffer` if the cursor is outside the buffer or misaligned.
    pub fn pending(&self, mem: &AddressSpace) -> Result<usize, MemtraceError> {
        let cursor = self.cursor(mem)?;
        let aligned = cursor >= self.base && (cursor - self.base).is_multiple_of(RECORD_SIZE as u64);
        if !aligned || cursor > self.end() {
            return Err(MemtraceError::CorruptBuffer { cursor, base: self.base, end: self.end() });
        }
        Ok(((cursor - self.base) / RECORD_SIZE as u64) as usize)
    }

    /// Writes `record` at the cursor and advances it. No bounds check: the
    /// caller flushes when [`is_full`](Self::is_full) says so.
    ///
    /// # Errors
    /// `Fault` if the cursor points outside mapped storage.
    pub fn append(&self, mem: &mut AddressSpace, record: &TraceRecord) -> Result<(), HostError> {
        let cursor = self.cursor(mem)?;
        mem.write(cursor, &record.to_bytes())?;
        mem.write_u64(
            self.field(ThreadBufferHeader::CURSOR_OFFSET),
            cursor + TraceRecord::BYTE_SIZE,
        )
    }

    /// `cursor + negated_end == 0`
    ///
    /// # Errors
    /// `Fault` if the header is no longer mapped.
    pub fn is_full(&self, mem: &AddressSpace) -> Result<bool, HostError> {
        let header = self.header(mem)?;
        Ok(header.cursor.wrapping_add_signed(header.negated_end) == 0)
    }

    /// Materializes all pending records, oldest first, then resets.
    ///
    /// # Errors
    /// `CorruptBuffer` on a bad cursor, `Host` on inaccessible storage.
    pub fn drain(&self, mem: &mut AddressSpace) -> Result<Vec<TraceRecord>, MemtraceError> {
        let count = self.pending(mem)?;
        let mut raw = vec![0u8; count * RECORD_SIZE];
        mem.read(self.base, &mut raw)?;
        let records = raw
            .chunks_exact(RECORD_SIZE)
            .filter_map(TraceRecord::from_bytes)
            .collect();
        self.reset(mem)?;
        Ok(records)
    }

    /// Clears storage and moves the cursor back to the base.
    ///
    /// # Errors
    /// `Fault` if the buffer is no longer mapped.
    pub fn reset(&self, mem: &mut AddressSpace) -> Result<(), HostError> {
        mem.fill(self.base, self.capacity * RECORD_SIZE, 0)?;
        mem.write_u64(self.field(ThreadBufferHeader::CURSOR_OFFSET), self.base)
    }

    /// Unmaps header and storage.
    ///
    /// # Errors
    /// `NoSuchRegion` if already released.
    pub fn release(self, mem: &mut AddressSpace) -> Result<(), HostError> {
        mem.unmap(self.base)?;
        mem.unmap(self.header_addr)
    }
}
