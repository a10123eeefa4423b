//! Structured error types for memtrace
//!
//! Using thiserror for automatic Display implementation and error chaining.

use super::types::{AppPc, SpillSlot, ThreadId};
use crate::host::isa::{Reg, RegClass};
use thiserror::Error;

/// Failures raised by the host instrumentation framework.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("Out of memory: cannot allocate {0} bytes")]
    OutOfMemory(usize),

    #[error("Memory fault at 0x{addr:x} ({len} bytes, {access})")]
    Fault { addr: u64, len: usize, access: &'static str },

    #[error("No mapped region starts at 0x{0:x}")]
    NoSuchRegion(u64),

    #[error("No free register of class {class:?} at instruction {at}")]
    NoFreeRegister { class: RegClass, at: usize },

    #[error("Register {0} is already reserved")]
    Conflict(Reg),

    #[error("Register {0} is not reserved")]
    NotReserved(Reg),

    #[error("All spill slots are in use")]
    NoSpillSlot,

    #[error("Spill slot {0} is out of range")]
    BadSpillSlot(SpillSlot),

    #[error("TLS field {0} is not registered")]
    NoTlsField(usize),

    #[error("Unknown label {0}")]
    UnknownLabel(u32),

    #[error("Instruction handle {0} is not in the list")]
    NoSuchInstr(usize),

    #[error("No code at address 0x{0:x}")]
    NoCodeAt(u64),

    #[error("Clean-call target {0} is not registered")]
    UnknownCallback(u32),

    #[error("Unsupported operand for {0}")]
    BadOperand(&'static str),

    #[error("Instruction cannot be encoded into a shared image: {0}")]
    Unencodable(String),

    #[error("Malformed code image at byte {0}")]
    MalformedImage(usize),

    #[error("Executable mapping failed: {0}")]
    Mapping(String),

    #[error("Execution exceeded {0} steps")]
    StepLimit(u64),

    #[error("Clean call failed: {0}")]
    CallbackFailed(String),
}

/// Failures raised while writing to a per-thread output sink.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Failed to open trace log {path}: {source}")]
    Open { path: String, source: std::io::Error },

    #[error("Failed to write trace batch: {0}")]
    Write(#[source] std::io::Error),

    #[error("Malformed trace log line {line}: {text}")]
    Parse { line: usize, text: String },

    #[error("Truncated binary trace log ({0} trailing bytes)")]
    Truncated(usize),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failures while exporting the session summary.
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Failed to serialize summary: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to write summary: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum MemtraceError {
    #[error("Failed to allocate trace buffer for {thread}: {source}")]
    BufferAllocation { thread: ThreadId, source: HostError },

    #[error("Failed to build flush trampoline: {0}")]
    TrampolineAllocation(HostError),

    #[error("Cannot instrument instruction at {pc}: {source}")]
    Instrumentation { pc: AppPc, source: HostError },

    #[error("Thread {thread} is {actual}, expected {expected}")]
    InvalidPhase { thread: ThreadId, expected: &'static str, actual: &'static str },

    #[error("Thread {0} has no trace state")]
    ThreadNotStarted(ThreadId),

    #[error("Trace buffer cursor 0x{cursor:x} outside [0x{base:x}, 0x{end:x}]")]
    CorruptBuffer { cursor: u64, base: u64, end: u64 },

    #[error("{0} thread(s) never reached finalize")]
    UnfinalizedThreads(u64),

    #[error("Session aborted: {0}")]
    SessionAborted(String),

    #[error("Global aggregate lock poisoned")]
    LockPoisoned,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Host(#[from] HostError),

    #[error(transparent)]
    Sink(#[from] SinkError),
}
