//! Executable code image: mmap -> write -> mprotect(READ|EXEC) -> never written again.
//!
//! unsafe is confined to this file.
#![allow(unsafe_code)]

use std::ptr::{self, NonNull};

use crate::domain::HostError;

const PAGE: usize = 4096;

/// Page-granular anonymous mapping holding one generated code image
#[derive(Debug)]
pub struct ExecImage {
    ptr: NonNull<u8>,
    len: usize,
    capacity: usize,
    sealed: bool,
}

// SAFETY: the mapping is owned exclusively by this value. Mutation requires
// `&mut self` and is refused once sealed; after that the bytes are read-only.
unsafe impl Send for ExecImage {}
// SAFETY: shared access only reads the initialized prefix.
unsafe impl Sync for ExecImage {}

impl ExecImage {
    /// Maps a writable region of at least `capacity` bytes.
    ///
    /// # Errors
    /// `Mapping` if the kernel refuses the mapping.
    pub fn new(capacity: usize) -> Result<Self, HostError> {
        let capacity = capacity.max(1).div_ceil(PAGE) * PAGE;

        // SAFETY: anonymous private mapping, no fd, kernel picks the address.
        let raw = unsafe {
            libc::mmap(
                ptr::null_mut(),
                capacity,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(HostError::Mapping(std::io::Error::last_os_error().to_string()));
        }
        let ptr = NonNull::new(raw.cast::<u8>())
            .ok_or_else(|| HostError::Mapping("mmap returned null".to_string()))?;

        Ok(Self { ptr, len: 0, capacity, sealed: false })
    }

    /// Appends `bytes` to the image.
    ///
    /// # Errors
    /// `Mapping` if the image is sealed, `OutOfMemory` if it is full.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), HostError> {
        if self.sealed {
            return Err(HostError::Mapping("image is sealed".to_string()));
        }
        if self.len + bytes.len() > self.capacity {
            return Err(HostError::OutOfMemory(self.len + bytes.len()));
        }
        // SAFETY: the destination range lies inside the writable mapping and
        // cannot overlap `bytes`, which lives outside it.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.as_ptr().add(self.len), bytes.len());
        }
        self.len += bytes.len();
        Ok(())
    }

    /// Drops write permission and makes the image executable.
    ///
    /// # Errors
    /// `Mapping` if `mprotect` fails.
    pub fn seal(&mut self) -> Result<(), HostError> {
        if self.sealed {
            return Ok(());
        }
        // SAFETY: `ptr`/`capacity` describe exactly the mapping created in `new`.
        let rc = unsafe {
            libc::mprotect(
                self.ptr.as_ptr().cast::<libc::c_void>(),
                self.capacity,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if rc != 0 {
            return Err(HostError::Mapping(std::io::Error::last_os_error().to_string()));
        }
        self.sealed = true;
        Ok(())
    }

    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: the first `len` bytes were initialized by `write` and the
        // mapping stays readable until drop.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Drop for ExecImage {
    fn drop(&mut self) {
        // SAFETY: unmaps the region created in `new`; no borrows outlive self.
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast::<libc::c_void>(), self.capacity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_rounds_to_page() {
        let image = ExecImage::new(10).unwrap();
        assert_eq!(image.capacity(), PAGE);
        assert!(image.bytes().is_empty());
    }

    #[test]
    fn test_write_then_seal() {
        let mut image = ExecImage::new(64).unwrap();
        image.write(&[1, 2, 3]).unwrap();
        image.seal().unwrap();
        assert!(image.is_sealed());
        assert_eq!(image.bytes(), &[1, 2, 3]);
        assert!(image.write(&[4]).is_err());
    }

    #[test]
    fn test_overflowing_write_rejected() {
        let mut image = ExecImage::new(PAGE).unwrap();
        image.write(&vec![0u8; PAGE]).unwrap();
        assert_eq!(image.write(&[0]), Err(HostError::OutOfMemory(PAGE + 1)));
    }
}
