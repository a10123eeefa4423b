//! Shared out-of-line flush routine
//!
//! One image per session, entered from every fast path whose buffer just
//! filled:
//!
//! ```text
//! trampoline:
//!   clean call flush     ; full context save/restore around the handler
//!   jmp *rcx             ; back to the fast path's resume label
//! ```
//!
//! The fast path loads the resume address into [`RESUME_REG`] before jumping
//! here. The clean call preserves every register, so `rcx` still holds it
//! when the indirect jump executes.

use log::info;

use crate::domain::{CallbackId, HostError, MemtraceError};
use crate::host::encoding;
use crate::host::exec_image::ExecImage;
use crate::host::isa::{Meta, Reg};
use crate::host::Host;

/// Register carrying the resume address into the trampoline
pub const RESUME_REG: Reg = Reg::Rcx;

const IMAGE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushTrampoline {
    address: u64,
    len: usize,
}

impl FlushTrampoline {
    /// Instruction sequence of the trampoline body
    #[must_use]
    pub fn body(flush: CallbackId) -> [Meta; 2] {
        [Meta::CleanCall { callback: flush }, Meta::JumpIndirect { reg: RESUME_REG }]
    }

    /// Writes the trampoline into a fresh, still writable image.
    ///
    /// # Errors
    /// Mapping or encoding failures.
    pub fn build_image(flush: CallbackId) -> Result<ExecImage, HostError> {
        let mut bytes = Vec::new();
        for meta in &Self::body(flush) {
            encoding::encode(meta, &mut bytes)?;
        }
        let mut image = ExecImage::new(IMAGE_CAPACITY)?;
        image.write(&bytes)?;
        Ok(image)
    }

    /// Builds the image, seals it read+execute and installs it in `host`.
    ///
    /// # Errors
    /// `TrampolineAllocation` if any step fails.
    pub fn install(host: &mut Host, flush: CallbackId) -> Result<Self, MemtraceError> {
        let image = Self::build_image(flush).map_err(MemtraceError::TrampolineAllocation)?;
        let len = image.bytes().len();
        let address = host
            .install_shared_code(image)
            .map_err(MemtraceError::TrampolineAllocation)?;
        info!("flush trampoline: {len} bytes at 0x{address:x}");
        Ok(Self { address, len })
    }

    #[must_use]
    pub fn address(&self) -> u64 {
        self.address
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostCapabilities;

    #[test]
    fn test_image_decodes_to_body() {
        let image = FlushTrampoline::build_image(CallbackId(3)).unwrap();
        let decoded = encoding::decode(image.bytes()).unwrap();
        assert_eq!(decoded, FlushTrampoline::body(CallbackId(3)).to_vec());
    }

    #[test]
    fn test_install_seals_and_publishes() {
        let mut host = Host::new(HostCapabilities::default());
        let tramp = FlushTrampoline::install(&mut host, CallbackId(0)).unwrap();
        assert!(!tramp.is_empty());
        assert_eq!(host.shared_image(tramp.address()).map(<[u8]>::len), Some(tramp.len()));
    }
}
