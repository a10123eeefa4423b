//! In-process instrumentation host
//!
//! The tracer is a client of a dynamic binary instrumentation framework. This
//! module is that framework, reduced to what the client consumes:
//!
//! ## Surfaces
//!
//! - **Instruction stream**: decoded application instructions in basic
//!   blocks ([`isa`], [`ilist`]), with insert-before of meta instructions
//! - **Register reservation**: spill-slot-backed scratch registers ([`regs`])
//! - **Thread state**: registers, flags, TLS fields, address space ([`thread`], [`memory`])
//! - **Shared code**: sealed executable images reachable by address ([`exec_image`])
//! - **Lifecycle**: thread start, per-instruction insertion, thread end ([`runner`])
//!
//! Translated blocks are executed by the interpreter in [`cpu`], so injected
//! code really runs and its effects can be observed.

pub mod code_cache;
pub mod cpu;
pub mod encoding;
pub mod exec_image;
pub mod ilist;
pub mod isa;
pub mod memory;
pub mod regs;
pub mod runner;
pub mod thread;

use std::sync::Arc;

use log::debug;

use code_cache::Fragment;
use cpu::{CallbackTable, CleanCallFn};
use exec_image::ExecImage;
use ilist::Node;
use crate::domain::{CallbackId, HostError, TlsIndex};

pub use runner::{BasicBlock, InstrumentationClient, Program, ThreadRun};
pub use thread::ThreadContext;

/// Where shared code images are mapped in every thread
pub const SHARED_CODE_BASE: u64 = 0x7fff_0000_0000;
const SHARED_CODE_SPAN: u64 = 0x1_0000;

/// What the host can do for its clients
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCapabilities {
    /// A zero test that leaves the arithmetic flags untouched (lea + jrcxz)
    pub flag_safe_zero_test: bool,
}

impl Default for HostCapabilities {
    fn default() -> Self {
        Self { flag_safe_zero_test: true }
    }
}

struct SharedCode {
    address: u64,
    image: Arc<ExecImage>,
    fragment: Arc<Fragment>,
}

/// Session-wide host state. Registration needs `&mut`; running threads
/// only needs `&`, so one `Host` can drive many threads concurrently.
pub struct Host {
    capabilities: HostCapabilities,
    callbacks: CallbackTable,
    shared: Vec<SharedCode>,
    next_tls: usize,
    thread_memory_limit: Option<usize>,
    step_limit: u64,
}

impl Host {
    #[must_use]
    pub fn new(capabilities: HostCapabilities) -> Self {
        Self {
            capabilities,
            callbacks: CallbackTable::default(),
            shared: Vec::new(),
            next_tls: 0,
            thread_memory_limit: None,
            step_limit: cpu::Cpu::DEFAULT_STEP_LIMIT,
        }
    }

    /// Caps the storage each thread's address space may allocate
    #[must_use]
    pub fn with_thread_memory_limit(mut self, bytes: usize) -> Self {
        self.thread_memory_limit = Some(bytes);
        self
    }

    #[must_use]
    pub fn with_step_limit(mut self, steps: u64) -> Self {
        self.step_limit = steps;
        self
    }

    #[must_use]
    pub fn capabilities(&self) -> HostCapabilities {
        self.capabilities
    }

    pub fn register_tls_field(&mut self) -> TlsIndex {
        let index = TlsIndex(self.next_tls);
        self.next_tls += 1;
        index
    }

    pub fn register_clean_call(&mut self, f: Arc<CleanCallFn>) -> CallbackId {
        self.callbacks.register(f)
    }

    /// Seals `image` and makes it reachable at a fixed address in every thread.
    ///
    /// # Errors
    /// `Mapping` if sealing fails, `MalformedImage` if the bytes do not decode.
    pub fn install_shared_code(&mut self, mut image: ExecImage) -> Result<u64, HostError> {
        image.seal()?;
        let nodes = encoding::decode(image.bytes())?
            .into_iter()
            .map(Node::Meta)
            .collect();
        let address = self.shared.last().map_or(SHARED_CODE_BASE, |s| s.address + SHARED_CODE_SPAN);
        debug!("shared code: {} bytes at 0x{address:x}", image.bytes().len());
        self.shared.push(SharedCode {
            address,
            image: Arc::new(image),
            fragment: Arc::new(Fragment::new(address, nodes)),
        });
        Ok(address)
    }

    /// Removes the shared image at `address`. Its executable mapping is
    /// released once no thread maps it any more.
    ///
    /// # Errors
    /// `NoSuchRegion` if nothing is installed there.
    pub fn uninstall_shared_code(&mut self, address: u64) -> Result<(), HostError> {
        let index = self
            .shared
            .iter()
            .position(|s| s.address == address)
            .ok_or(HostError::NoSuchRegion(address))?;
        self.shared.remove(index);
        debug!("shared code at 0x{address:x} removed");
        Ok(())
    }

    /// Bytes of the shared image installed at `address`
    #[must_use]
    pub fn shared_image(&self, address: u64) -> Option<&[u8]> {
        self.shared.iter().find(|s| s.address == address).map(|s| s.image.bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::isa::Meta;

    fn image() -> ExecImage {
        let mut bytes = Vec::new();
        encoding::encode(&Meta::CleanCall { callback: CallbackId(0) }, &mut bytes).unwrap();
        let mut image = ExecImage::new(64).unwrap();
        image.write(&bytes).unwrap();
        image
    }

    #[test]
    fn test_shared_code_addresses_are_distinct() {
        let mut host = Host::new(HostCapabilities::default());
        let a = host.install_shared_code(image()).unwrap();
        let b = host.install_shared_code(image()).unwrap();
        assert_eq!(a, SHARED_CODE_BASE);
        assert_ne!(a, b);
    }

    #[test]
    fn test_uninstall_shared_code() {
        let mut host = Host::new(HostCapabilities::default());
        let addr = host.install_shared_code(image()).unwrap();
        host.uninstall_shared_code(addr).unwrap();
        assert!(host.shared_image(addr).is_none());
        assert_eq!(host.uninstall_shared_code(addr), Err(HostError::NoSuchRegion(addr)));
    }

    #[test]
    fn test_tls_fields_are_sequential() {
        let mut host = Host::new(HostCapabilities::default());
        assert_eq!(host.register_tls_field(), TlsIndex(0));
        assert_eq!(host.register_tls_field(), TlsIndex(1));
    }
}
