//! The tracing client: wires buffers, planner, trampoline and sinks into the
//! host's lifecycle hooks.
//!
//! ## Session
//!
//! 1. [`MemtraceClient::init`]: TLS field, flush clean call, trampoline
//! 2. Per thread: `on_thread_start` (buffer + sink), `instrument` per
//!    application instruction, `on_thread_end` (final flush + merge)
//! 3. [`MemtraceClient::shutdown`]: trampoline removed, summary returned

use std::sync::Arc;

use log::info;

use crate::buffer::ThreadTraceBuffer;
use crate::config::TracerConfig;
use crate::domain::{HostError, MemtraceError, TlsIndex};
use crate::export::SessionSummary;
use crate::flush::{finalize_thread, flush_thread, GlobalAggregate, ThreadTraceState};
use crate::host::cpu::CleanCallFn;
use crate::host::ilist::{InstrHandle, InstrList};
use crate::host::{Host, InstrumentationClient, ThreadContext};
use crate::instrument::{overflow, InjectionPlanner};
use crate::trampoline::FlushTrampoline;

pub struct MemtraceClient {
    config: TracerConfig,
    tls: TlsIndex,
    trampoline: FlushTrampoline,
    planner: InjectionPlanner,
    aggregate: Arc<GlobalAggregate>,
}

impl MemtraceClient {
    /// Registers the client's host resources.
    ///
    /// # Errors
    /// `InvalidConfig`, or `TrampolineAllocation` if the shared flush routine
    /// cannot be built.
    pub fn init(host: &mut Host, config: TracerConfig) -> Result<Self, MemtraceError> {
        config.validate()?;
        info!("Client memtrace is initializing");

        let tls = host.register_tls_field();
        let flush: Arc<CleanCallFn> = Arc::new(move |ctx: &mut ThreadContext| {
            flush_thread(ctx, tls)
                .map(|_| ())
                .map_err(|e| HostError::CallbackFailed(e.to_string()))
        });
        let flush_id = host.register_clean_call(flush);
        let trampoline = FlushTrampoline::install(host, flush_id)?;

        let check = overflow::select(host.capabilities(), config.prefer_flag_safe_test);
        let planner = InjectionPlanner::new(tls, trampoline.address(), check);
        info!(
            "buffer {} records, {:?} logs to {}, overflow check {}",
            config.buffer_records,
            config.format,
            config.target.describe(),
            planner.check_name()
        );

        Ok(Self { config, tls, trampoline, planner, aggregate: Arc::new(GlobalAggregate::new()) })
    }

    #[must_use]
    pub fn config(&self) -> &TracerConfig {
        &self.config
    }

    #[must_use]
    pub fn tls(&self) -> TlsIndex {
        self.tls
    }

    #[must_use]
    pub fn trampoline(&self) -> FlushTrampoline {
        self.trampoline
    }

    #[must_use]
    pub fn overflow_check(&self) -> &'static str {
        self.planner.check_name()
    }

    #[must_use]
    pub fn aggregate(&self) -> &GlobalAggregate {
        &self.aggregate
    }

    /// Session end: removes the trampoline and reports the totals.
    ///
    /// # Errors
    /// `SessionAborted` if a thread failed to start tracing,
    /// `UnfinalizedThreads` if a started thread never reached finalize.
    pub fn shutdown(self, host: &mut Host) -> Result<SessionSummary, MemtraceError> {
        host.uninstall_shared_code(self.trampoline.address())?;

        let snapshot = self.aggregate.snapshot()?;
        if let Some(reason) = snapshot.aborted {
            return Err(MemtraceError::SessionAborted(reason));
        }
        let unfinalized = snapshot.unfinalized();
        if unfinalized > 0 {
            return Err(MemtraceError::UnfinalizedThreads(unfinalized));
        }

        let summary = SessionSummary::from_snapshot(
            snapshot,
            self.config.format,
            self.config.buffer_records,
            self.planner.check_name(),
        );
        info!("{summary}");
        Ok(summary)
    }
}

impl InstrumentationClient for MemtraceClient {
    fn on_thread_start(&self, ctx: &mut ThreadContext) -> Result<(), MemtraceError> {
        if let Some(reason) = self.aggregate.aborted() {
            return Err(MemtraceError::SessionAborted(reason.to_string()));
        }
        let thread = ctx.id();
        let buffer = match ThreadTraceBuffer::allocate(ctx.memory_mut(), self.config.buffer_records) {
            Ok(buffer) => buffer,
            Err(source) => {
                let err = MemtraceError::BufferAllocation { thread, source };
                self.aggregate.abort(err.to_string());
                return Err(err);
            }
        };

        let sink = match self.config.target.open(self.config.format, thread) {
            Ok(sink) => sink,
            Err(e) => {
                buffer.release(ctx.memory_mut())?;
                return Err(e.into());
            }
        };

        ctx.set_tls_word(self.tls, buffer.header_addr());
        let mut state = ThreadTraceState::new(thread);
        state.activate(buffer, sink)?;
        ctx.set_tls_data(self.tls, state);
        self.aggregate.register_thread();
        info!("{thread}: tracing started");
        Ok(())
    }

    fn instrument(&self, ilist: &mut InstrList, at: InstrHandle) -> Result<(), MemtraceError> {
        self.planner.instrument_instr(ilist, at).map(|_| ())
    }

    fn on_thread_end(&self, ctx: &mut ThreadContext) -> Result<(), MemtraceError> {
        let thread = ctx.id();
        let stats = finalize_thread(ctx, self.tls, &self.aggregate)?;
        info!(
            "{thread}: {} memory references in {} flushes ({} write errors)",
            stats.records, stats.flushes, stats.write_errors
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use memtrace_common::TraceRecord;

    use super::*;
    use crate::flush::{read_binary_log, MemorySinks, SinkTarget, ThreadPhase, TraceFormat};
    use crate::host::isa::{Instr, MemRef, OpSize, Operand, Reg};
    use crate::host::{BasicBlock, HostCapabilities, Program};
    use crate::domain::ThreadId;

    const DATA: u64 = 0x1000_0000;

    fn config(capacity: usize, sinks: &MemorySinks) -> TracerConfig {
        TracerConfig {
            buffer_records: capacity,
            format: TraceFormat::Binary,
            target: SinkTarget::Memory(sinks.clone()),
            prefer_flag_safe_test: true,
        }
    }

    fn store_program(iterations: u64) -> Program {
        Program {
            blocks: vec![BasicBlock {
                tag: 0x40_0000,
                instrs: vec![Instr::mov(
                    0x40_0000,
                    Operand::Mem(MemRef::absolute(DATA, OpSize::B4)),
                    Operand::Reg(Reg::Rax),
                )],
            }],
            iterations,
            regions: vec![(DATA, 0x1000)],
            registers: Vec::new(),
        }
    }

    #[test]
    fn test_thread_lifecycle_records_every_access() {
        let sinks = MemorySinks::new();
        let mut host = Host::new(HostCapabilities::default());
        let client = MemtraceClient::init(&mut host, config(4, &sinks)).unwrap();

        let run = host.run_thread(&client, ThreadId(1), &store_program(10)).unwrap();
        let state = run.context.tls_data::<ThreadTraceState>(client.tls()).unwrap();
        assert_eq!(state.phase(), ThreadPhase::Closed);

        let records = read_binary_log(&sinks.contents(ThreadId(1)).unwrap()).unwrap();
        assert_eq!(records.len(), 10);
        assert!(records.iter().all(|r| *r == TraceRecord::new(true, DATA, 4, 0x40_0000)));

        let summary = client.shutdown(&mut host).unwrap();
        assert_eq!(summary.total_refs, 10);
        assert_eq!(summary.flushes, 3);
    }

    #[test]
    fn test_shutdown_removes_trampoline() {
        let sinks = MemorySinks::new();
        let mut host = Host::new(HostCapabilities::default());
        let client = MemtraceClient::init(&mut host, config(4, &sinks)).unwrap();
        let address = client.trampoline().address();
        assert!(host.shared_image(address).is_some());
        client.shutdown(&mut host).unwrap();
        assert!(host.shared_image(address).is_none());
    }

    #[test]
    fn test_overflow_check_follows_capabilities() {
        let sinks = MemorySinks::new();
        let mut host = Host::new(HostCapabilities { flag_safe_zero_test: false });
        let client = MemtraceClient::init(&mut host, config(4, &sinks)).unwrap();
        assert_eq!(client.overflow_check(), "test+jz (flags saved)");
    }

    #[test]
    fn test_unfinalized_thread_reported() {
        let sinks = MemorySinks::new();
        let mut host = Host::new(HostCapabilities::default());
        let client = MemtraceClient::init(&mut host, config(4, &sinks)).unwrap();
        let mut ctx = ThreadContext::new(ThreadId(5), crate::host::memory::AddressSpace::new());
        client.on_thread_start(&mut ctx).unwrap();

        assert!(matches!(client.shutdown(&mut host), Err(MemtraceError::UnfinalizedThreads(1))));
    }

    #[test]
    fn test_allocation_failure_refuses_later_threads() {
        let sinks = MemorySinks::new();
        let mut host = Host::new(HostCapabilities::default());
        let client = MemtraceClient::init(&mut host, config(8192, &sinks)).unwrap();

        let mut starved = ThreadContext::new(ThreadId(1), crate::host::memory::AddressSpace::with_limit(0x100));
        assert!(matches!(
            client.on_thread_start(&mut starved),
            Err(MemtraceError::BufferAllocation { .. })
        ));

        let mut healthy = ThreadContext::new(ThreadId(2), crate::host::memory::AddressSpace::new());
        assert!(matches!(client.on_thread_start(&mut healthy), Err(MemtraceError::SessionAborted(_))));
        assert!(healthy.tls_data::<ThreadTraceState>(client.tls()).is_none());

        assert!(matches!(client.shutdown(&mut host), Err(MemtraceError::SessionAborted(_))));
    }

    #[test]
    fn test_zero_capacity_rejected_at_init() {
        let sinks = MemorySinks::new();
        let mut host = Host::new(HostCapabilities::default());
        let result = MemtraceClient::init(&mut host, config(0, &sinks));
        assert!(matches!(result, Err(MemtraceError::InvalidConfig(_))));
    }
}
