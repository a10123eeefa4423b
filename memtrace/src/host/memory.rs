//! Per-thread address space
//!
//! A sorted set of non-overlapping regions, each with permissions. Accesses
//! must fall entirely inside one region; anything else is a fault. Storage is
//! allocated fallibly so that exhaustion surfaces as `OutOfMemory` instead of
//! an abort.

#![allow(clippy::cast_possible_truncation)]

use std::sync::Arc;

use super::exec_image::ExecImage;
use crate::domain::HostError;

pub const PAGE_SIZE: u64 = 4096;

/// Where client heap allocations start
pub const CLIENT_HEAP_BASE: u64 = 0x7000_0000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Perms {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
}

impl Perms {
    pub const R: Perms = Perms { read: true, write: false, exec: false };
    pub const RW: Perms = Perms { read: true, write: true, exec: false };
    pub const RX: Perms = Perms { read: true, write: false, exec: true };
}

#[derive(Debug)]
enum Backing {
    Owned(Vec<u8>),
    Image(Arc<ExecImage>),
}

#[derive(Debug)]
struct Region {
    base: u64,
    len: u64,
    perms: Perms,
    backing: Backing,
}

impl Region {
    fn end(&self) -> u64 {
        self.base + self.len
    }
}

#[derive(Debug)]
pub struct AddressSpace {
    regions: Vec<Region>,
    next_alloc: u64,
    owned_bytes: usize,
    limit: Option<usize>,
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

fn page_align(len: u64) -> u64 {
    len.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

impl AddressSpace {
    #[must_use]
    pub fn new() -> Self {
        Self { regions: Vec::new(), next_alloc: CLIENT_HEAP_BASE, owned_bytes: 0, limit: None }
    }

    /// Address space whose owned storage may not exceed `bytes`
    #[must_use]
    pub fn with_limit(bytes: usize) -> Self {
        Self { limit: Some(bytes), ..Self::new() }
    }

    fn overlaps(&self, base: u64, len: u64) -> bool {
        let end = base.saturating_add(len);
        self.regions.iter().any(|r| base < r.end() && r.base < end)
    }

    fn insert_region(&mut self, region: Region) {
        let pos = self.regions.partition_point(|r| r.base < region.base);
        self.regions.insert(pos, region);
    }

    fn zeroed(&self, len: usize) -> Result<Vec<u8>, HostError> {
        if let Some(limit) = self.limit {
            if self.owned_bytes.saturating_add(len) > limit {
                return Err(HostError::OutOfMemory(len));
            }
        }
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(len).map_err(|_| HostError::OutOfMemory(len))?;
        bytes.resize(len, 0);
        Ok(bytes)
    }

    /// Maps `len` zeroed bytes at a fixed address.
    ///
    /// # Errors
    /// `OutOfMemory` if storage cannot be obtained, `Mapping` on overlap.
    pub fn map(&mut self, base: u64, len: usize, perms: Perms) -> Result<u64, HostError> {
        if len == 0 || self.overlaps(base, len as u64) {
            return Err(HostError::Mapping(format!("cannot map {len} bytes at 0x{base:x}")));
        }
        let bytes = self.zeroed(len)?;
        self.owned_bytes += len;
        self.insert_region(Region { base, len: len as u64, perms, backing: Backing::Owned(bytes) });
        Ok(base)
    }

    /// Allocates `len` zeroed bytes on the client heap, page aligned.
    ///
    /// # Errors
    /// `OutOfMemory` if storage cannot be obtained.
    pub fn alloc(&mut self, len: usize, perms: Perms) -> Result<u64, HostError> {
        let base = self.next_alloc;
        self.map(base, len, perms)?;
        self.next_alloc = base + page_align(len as u64) + PAGE_SIZE;
        Ok(base)
    }

    /// Maps a shared, sealed code image read+execute at `base`.
    ///
    /// # Errors
    /// `Mapping` on overlap or if the image is still writable.
    pub fn map_image(&mut self, base: u64, image: Arc<ExecImage>) -> Result<(), HostError> {
        if !image.is_sealed() {
            return Err(HostError::Mapping("image is not sealed".to_string()));
        }
        let len = image.bytes().len().max(1) as u64;
        if self.overlaps(base, len) {
            return Err(HostError::Mapping(format!("image overlaps at 0x{base:x}")));
        }
        self.insert_region(Region { base, len, perms: Perms::RX, backing: Backing::Image(image) });
        Ok(())
    }

    /// Removes the region starting at `base`.
    ///
    /// # Errors
    /// `NoSuchRegion` if no region starts there.
    pub fn unmap(&mut self, base: u64) -> Result<(), HostError> {
        let pos = self
            .regions
            .iter()
            .position(|r| r.base == base)
            .ok_or(HostError::NoSuchRegion(base))?;
        let region = self.regions.remove(pos);
        if let Backing::Owned(bytes) = region.backing {
            self.owned_bytes -= bytes.len();
        }
        Ok(())
    }

    /// # Errors
    /// `NoSuchRegion` if no region starts at `base`.
    pub fn protect(&mut self, base: u64, perms: Perms) -> Result<(), HostError> {
        let region = self
            .regions
            .iter_mut()
            .find(|r| r.base == base)
            .ok_or(HostError::NoSuchRegion(base))?;
        region.perms = perms;
        Ok(())
    }

    #[must_use]
    pub fn is_mapped(&self, addr: u64) -> bool {
        self.regions.iter().any(|r| r.base <= addr && addr < r.end())
    }

    fn locate(&self, addr: u64, len: usize, access: &'static str) -> Result<(&Region, usize), HostError> {
        let fault = HostError::Fault { addr, len, access };
        let end = addr.checked_add(len as u64).ok_or_else(|| fault.clone())?;
        let region = self
            .regions
            .iter()
            .find(|r| r.base <= addr && end <= r.end())
            .ok_or(fault)?;
        Ok((region, (addr - region.base) as usize))
    }

    /// # Errors
    /// `Fault` if the range is unmapped or not readable.
    pub fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), HostError> {
        let (region, offset) = self.locate(addr, buf.len(), "read")?;
        if !region.perms.read {
            return Err(HostError::Fault { addr, len: buf.len(), access: "read" });
        }
        let src = match &region.backing {
            Backing::Owned(bytes) => &bytes[offset..offset + buf.len()],
            Backing::Image(image) => image
                .bytes()
                .get(offset..offset + buf.len())
                .ok_or(HostError::Fault { addr, len: buf.len(), access: "read" })?,
        };
        buf.copy_from_slice(src);
        Ok(())
    }

    /// # Errors
    /// `Fault` if the range is unmapped or not writable.
    pub fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), HostError> {
        let fault = HostError::Fault { addr, len: data.len(), access: "write" };
        let (region, offset) = self.locate(addr, data.len(), "write")?;
        if !region.perms.write {
            return Err(fault);
        }
        let base = region.base;
        let region = self
            .regions
            .iter_mut()
            .find(|r| r.base == base)
            .ok_or_else(|| fault.clone())?;
        match &mut region.backing {
            Backing::Owned(bytes) => {
                bytes[offset..offset + data.len()].copy_from_slice(data);
                Ok(())
            }
            Backing::Image(_) => Err(fault),
        }
    }

    /// Little-endian load of 1, 2, 4 or 8 bytes, zero-extended.
    ///
    /// # Errors
    /// `Fault` on bad access, `BadOperand` on an unsupported width.
    pub fn read_uint(&self, addr: u64, width: usize) -> Result<u64, HostError> {
        if !matches!(width, 1 | 2 | 4 | 8) {
            return Err(HostError::BadOperand("scalar load"));
        }
        let mut buf = [0u8; 8];
        self.read(addr, &mut buf[..width])?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Little-endian store of the low `width` bytes of `value`.
    ///
    /// # Errors
    /// `Fault` on bad access, `BadOperand` on an unsupported width.
    pub fn write_uint(&mut self, addr: u64, width: usize, value: u64) -> Result<(), HostError> {
        if !matches!(width, 1 | 2 | 4 | 8) {
            return Err(HostError::BadOperand("scalar store"));
        }
        self.write(addr, &value.to_le_bytes()[..width])
    }

    /// # Errors
    /// `Fault` on bad access.
    pub fn read_u64(&self, addr: u64) -> Result<u64, HostError> {
        self.read_uint(addr, 8)
    }

    /// # Errors
    /// `Fault` on bad access.
    pub fn write_u64(&mut self, addr: u64, value: u64) -> Result<(), HostError> {
        self.write_uint(addr, 8, value)
    }

    /// # Errors
    /// `Fault` on bad access.
    pub fn fill(&mut self, addr: u64, len: usize, byte: u8) -> Result<(), HostError> {
        let fault = HostError::Fault { addr, len, access: "write" };
        let (region, offset) = self.locate(addr, len, "write")?;
        if !region.perms.write {
            return Err(fault);
        }
        let base = region.base;
        match self.regions.iter_mut().find(|r| r.base == base).map(|r| &mut r.backing) {
            Some(Backing::Owned(bytes)) => {
                bytes[offset..offset + len].fill(byte);
                Ok(())
            }
            _ => Err(fault),
        }
    }

    /// Bytes of owned storage currently mapped
    #[must_use]
    pub fn owned_bytes(&self) -> usize {
        self.owned_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_is_zeroed_and_disjoint() {
        let mut mem = AddressSpace::new();
        let a = mem.alloc(100, Perms::RW).unwrap();
        let b = mem.alloc(100, Perms::RW).unwrap();
        assert_ne!(a, b);
        assert_eq!(mem.read_u64(a).unwrap(), 0);
        assert_eq!(mem.owned_bytes(), 200);
    }

    #[test]
    fn test_read_write_little_endian() {
        let mut mem = AddressSpace::new();
        let a = mem.alloc(16, Perms::RW).unwrap();
        mem.write_u64(a, 0x1122_3344_5566_7788).unwrap();
        assert_eq!(mem.read_uint(a, 1).unwrap(), 0x88);
        assert_eq!(mem.read_uint(a + 4, 4).unwrap(), 0x1122_3344);
    }

    #[test]
    fn test_out_of_bounds_faults() {
        let mut mem = AddressSpace::new();
        let a = mem.alloc(8, Perms::RW).unwrap();
        let err = mem.write_u64(a + 4, 1).unwrap_err();
        assert!(matches!(err, HostError::Fault { access: "write", .. }));
        assert!(mem.read_u64(0x10).is_err());
    }

    #[test]
    fn test_protect_blocks_writes() {
        let mut mem = AddressSpace::new();
        let a = mem.alloc(8, Perms::RW).unwrap();
        mem.protect(a, Perms::R).unwrap();
        assert!(mem.write_u64(a, 1).is_err());
        assert_eq!(mem.read_u64(a).unwrap(), 0);
    }

    #[test]
    fn test_limit_reports_out_of_memory() {
        let mut mem = AddressSpace::with_limit(64);
        mem.alloc(32, Perms::RW).unwrap();
        assert_eq!(mem.alloc(64, Perms::RW), Err(HostError::OutOfMemory(64)));
    }

    #[test]
    fn test_unmap_releases_storage() {
        let mut mem = AddressSpace::new();
        let a = mem.alloc(32, Perms::RW).unwrap();
        mem.unmap(a).unwrap();
        assert_eq!(mem.owned_bytes(), 0);
        assert!(!mem.is_mapped(a));
        assert_eq!(mem.unmap(a), Err(HostError::NoSuchRegion(a)));
    }

    #[test]
    fn test_fixed_map_overlap_rejected() {
        let mut mem = AddressSpace::new();
        mem.map(0x1000, 0x100, Perms::RW).unwrap();
        assert!(mem.map(0x1080, 0x100, Perms::RW).is_err());
    }
}
