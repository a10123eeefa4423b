#![allow(dead_code)]

use memtrace::client::MemtraceClient;
use memtrace::config::TracerConfig;
use memtrace::domain::{MemtraceError, ThreadId};
use memtrace::flush::{read_binary_log, MemorySinks, SinkTarget, TraceFormat};
use memtrace::host::ilist::{InstrHandle, InstrList};
use memtrace::host::isa::{Instr, MemRef, OpSize, Operand, Reg};
use memtrace::host::{BasicBlock, Host, HostCapabilities, InstrumentationClient, Program, ThreadContext};
use memtrace_common::TraceRecord;

pub const DATA: u64 = 0x1000_0000;

/// Runs threads without injecting anything
pub struct NullClient;

impl InstrumentationClient for NullClient {
    fn on_thread_start(&self, _ctx: &mut ThreadContext) -> Result<(), MemtraceError> {
        Ok(())
    }

    fn instrument(&self, _ilist: &mut InstrList, _at: InstrHandle) -> Result<(), MemtraceError> {
        Ok(())
    }

    fn on_thread_end(&self, _ctx: &mut ThreadContext) -> Result<(), MemtraceError> {
        Ok(())
    }
}

pub fn memory_config(capacity: usize, sinks: &MemorySinks) -> TracerConfig {
    TracerConfig {
        buffer_records: capacity,
        format: TraceFormat::Binary,
        target: SinkTarget::Memory(sinks.clone()),
        prefer_flag_safe_test: true,
    }
}

pub fn session(capacity: usize, sinks: &MemorySinks) -> (Host, MemtraceClient) {
    let mut host = Host::new(HostCapabilities::default());
    let client = MemtraceClient::init(&mut host, memory_config(capacity, sinks)).unwrap();
    (host, client)
}

pub fn logged(sinks: &MemorySinks, thread: u64) -> Vec<TraceRecord> {
    read_binary_log(&sinks.contents(ThreadId(thread)).unwrap_or_default()).unwrap()
}

pub fn qword(addr: u64) -> Operand {
    Operand::Mem(MemRef::absolute(addr, OpSize::B8))
}

/// One block of `instrs`, run `iterations` times, with a data page at `data`
pub fn program_at(data: u64, instrs: Vec<Instr>, iterations: u64) -> Program {
    let tag = instrs.first().and_then(|i| i.app_pc).map_or(0x40_0000, |pc| pc.0);
    Program {
        blocks: vec![BasicBlock { tag, instrs }],
        iterations,
        regions: vec![(data, 0x1000)],
        registers: vec![(Reg::Rax, 0x1234)],
    }
}

pub fn program(instrs: Vec<Instr>, iterations: u64) -> Program {
    program_at(DATA, instrs, iterations)
}

/// `mov qword [DATA], rax`
pub fn store(pc: u64) -> Instr {
    Instr::mov(pc, qword(DATA), Operand::Reg(Reg::Rax))
}
