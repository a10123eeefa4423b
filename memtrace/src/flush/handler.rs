//! Flush handler and per-thread trace state
//!
//! ## Lifecycle
//!
//! ```text
//! Uninitialized --activate--> Active --flush--> Flushing --> Active
//!                                    --finalize--> Finalizing --> Closed
//! ```
//!
//! Anything else is an `InvalidPhase` error. The state lives in the thread's
//! TLS field, so only the owning thread ever reaches it.

use std::fmt;

use log::{debug, warn};

use super::aggregator::{GlobalAggregate, ThreadStats};
use super::sink::TraceSink;
use crate::buffer::ThreadTraceBuffer;
use crate::domain::{MemtraceError, ThreadId, TlsIndex};
use crate::host::memory::AddressSpace;
use crate::host::ThreadContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadPhase {
    Uninitialized,
    Active,
    Flushing,
    Finalizing,
    Closed,
}

impl ThreadPhase {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            ThreadPhase::Uninitialized => "Uninitialized",
            ThreadPhase::Active => "Active",
            ThreadPhase::Flushing => "Flushing",
            ThreadPhase::Finalizing => "Finalizing",
            ThreadPhase::Closed => "Closed",
        }
    }
}

impl fmt::Display for ThreadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub struct ThreadTraceState {
    thread: ThreadId,
    phase: ThreadPhase,
    buffer: Option<ThreadTraceBuffer>,
    sink: Option<Box<dyn TraceSink>>,
    stats: ThreadStats,
}

impl ThreadTraceState {
    #[must_use]
    pub fn new(thread: ThreadId) -> Self {
        Self {
            thread,
            phase: ThreadPhase::Uninitialized,
            buffer: None,
            sink: None,
            stats: ThreadStats::new(thread),
        }
    }

    #[must_use]
    pub fn phase(&self) -> ThreadPhase {
        self.phase
    }

    #[must_use]
    pub fn stats(&self) -> ThreadStats {
        self.stats
    }

    #[must_use]
    pub fn buffer(&self) -> Option<&ThreadTraceBuffer> {
        self.buffer.as_ref()
    }

    fn expect_phase(&self, expected: ThreadPhase) -> Result<(), MemtraceError> {
        if self.phase == expected {
            Ok(())
        } else {
            Err(MemtraceError::InvalidPhase {
                thread: self.thread,
                expected: expected.name(),
                actual: self.phase.name(),
            })
        }
    }

    /// Takes ownership of the thread's buffer and sink.
    ///
    /// # Errors
    /// `InvalidPhase` unless `Uninitialized`.
    pub fn activate(&mut self, buffer: ThreadTraceBuffer, sink: Box<dyn TraceSink>) -> Result<(), MemtraceError> {
        self.expect_phase(ThreadPhase::Uninitialized)?;
        self.buffer = Some(buffer);
        self.sink = Some(sink);
        self.phase = ThreadPhase::Active;
        Ok(())
    }

    /// Drains the buffer into the sink and resets it. Returns the number of
    /// records drained; an empty buffer writes nothing and is not counted as
    /// a flush.
    ///
    /// A failing sink write is logged and counted, and the records are still
    /// counted as seen and discarded.
    ///
    /// # Errors
    /// `InvalidPhase` unless `Active`, `CorruptBuffer` or `Host` if the
    /// buffer cannot be read.
    pub fn flush(&mut self, mem: &mut AddressSpace) -> Result<usize, MemtraceError> {
        self.expect_phase(ThreadPhase::Active)?;
        self.phase = ThreadPhase::Flushing;
        let outcome = self.drain_to_sink(mem);
        self.phase = ThreadPhase::Active;
        outcome
    }

    fn drain_to_sink(&mut self, mem: &mut AddressSpace) -> Result<usize, MemtraceError> {
        let buffer = self.buffer.as_ref().ok_or(MemtraceError::ThreadNotStarted(self.thread))?;
        let records = buffer.drain(mem)?;
        if records.is_empty() {
            return Ok(0);
        }

        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.write_batch(&records) {
                warn!("{}: dropping {} records: {e}", self.thread, records.len());
                self.stats.write_errors += 1;
            }
        }
        self.stats.records += records.len() as u64;
        self.stats.flushes += 1;
        debug!("{}: flushed {} records ({} total)", self.thread, records.len(), self.stats.records);
        Ok(records.len())
    }

    /// Final flush, merge into `aggregate`, then release the buffer and
    /// close the sink. The buffer and sink are given up even when the merge
    /// fails; a failure to close the sink is only logged, since the counters
    /// are already merged.
    ///
    /// # Errors
    /// `InvalidPhase` unless `Active`; flush, merge and release failures.
    pub fn finalize(
        &mut self,
        mem: &mut AddressSpace,
        aggregate: &GlobalAggregate,
    ) -> Result<ThreadStats, MemtraceError> {
        self.flush(mem)?;
        self.phase = ThreadPhase::Finalizing;

        let merged = aggregate.merge(self.stats);
        let released = self.buffer.take().map_or(Ok(()), |buffer| buffer.release(mem));
        if let Some(mut sink) = self.sink.take() {
            if let Err(e) = sink.finish() {
                warn!("{}: failed to close trace log: {e}", self.thread);
            }
        }
        self.phase = ThreadPhase::Closed;

        merged?;
        released?;
        Ok(self.stats)
    }
}

/// Clean-call body: flushes the executing thread's buffer.
///
/// # Errors
/// `ThreadNotStarted` if the thread has no trace state, otherwise see
/// [`ThreadTraceState::flush`].
pub fn flush_thread(ctx: &mut ThreadContext, tls: TlsIndex) -> Result<usize, MemtraceError> {
    let thread = ctx.id();
    let (state, mem) = ctx
        .tls_data_with_memory::<ThreadTraceState>(tls)
        .ok_or(MemtraceError::ThreadNotStarted(thread))?;
    state.flush(mem)
}

/// Thread-exit body: final flush and merge.
///
/// # Errors
/// `ThreadNotStarted` if the thread has no trace state, otherwise see
/// [`ThreadTraceState::finalize`].
pub fn finalize_thread(
    ctx: &mut ThreadContext,
    tls: TlsIndex,
    aggregate: &GlobalAggregate,
) -> Result<ThreadStats, MemtraceError> {
    let thread = ctx.id();
    let (state, mem) = ctx
        .tls_data_with_memory::<ThreadTraceState>(tls)
        .ok_or(MemtraceError::ThreadNotStarted(thread))?;
    state.finalize(mem, aggregate)
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use memtrace_common::TraceRecord;

    use super::*;
    use crate::domain::SinkError;
    use crate::flush::reader::read_binary_log;
    use crate::flush::sink::{MemorySinks, SinkTarget, TraceFormat};

    struct BrokenSink;

    impl TraceSink for BrokenSink {
        fn write_batch(&mut self, _records: &[TraceRecord]) -> Result<(), SinkError> {
            Err(SinkError::Write(io::Error::other("disk full")))
        }

        fn finish(&mut self) -> Result<(), SinkError> {
            Ok(())
        }
    }

    /// Notes at close time whether the aggregate already holds the thread
    struct ClosingSink {
        aggregate: Arc<GlobalAggregate>,
        merged_before_close: Arc<AtomicBool>,
    }

    impl TraceSink for ClosingSink {
        fn write_batch(&mut self, _records: &[TraceRecord]) -> Result<(), SinkError> {
            Ok(())
        }

        fn finish(&mut self) -> Result<(), SinkError> {
            let merged = self.aggregate.snapshot().is_ok_and(|s| s.threads.len() == 1);
            self.merged_before_close.store(merged, Ordering::SeqCst);
            Ok(())
        }
    }

    fn record(i: u64) -> TraceRecord {
        TraceRecord::new(false, 0x2000 + i * 8, 8, 0x40_0000 + i)
    }

    fn active(mem: &mut AddressSpace, capacity: usize, sinks: &MemorySinks) -> ThreadTraceState {
        let mut state = ThreadTraceState::new(ThreadId(1));
        let buffer = ThreadTraceBuffer::allocate(mem, capacity).unwrap();
        let sink = SinkTarget::Memory(sinks.clone()).open(TraceFormat::Binary, ThreadId(1)).unwrap();
        state.activate(buffer, sink).unwrap();
        state
    }

    fn fill(state: &ThreadTraceState, mem: &mut AddressSpace, range: std::ops::Range<u64>) {
        let buffer = state.buffer().unwrap();
        for i in range {
            buffer.append(mem, &record(i)).unwrap();
        }
    }

    #[test]
    fn test_flush_writes_in_order_and_resets() {
        let mut mem = AddressSpace::new();
        let sinks = MemorySinks::new();
        let mut state = active(&mut mem, 4, &sinks);
        fill(&state, &mut mem, 0..3);

        assert_eq!(state.flush(&mut mem).unwrap(), 3);
        assert_eq!(state.buffer().unwrap().pending(&mem).unwrap(), 0);
        assert_eq!(state.phase(), ThreadPhase::Active);
        let logged = read_binary_log(&sinks.contents(ThreadId(1)).unwrap()).unwrap();
        assert_eq!(logged, (0..3).map(record).collect::<Vec<_>>());
    }

    #[test]
    fn test_empty_flush_is_idempotent() {
        let mut mem = AddressSpace::new();
        let sinks = MemorySinks::new();
        let mut state = active(&mut mem, 4, &sinks);

        assert_eq!(state.flush(&mut mem).unwrap(), 0);
        assert_eq!(state.flush(&mut mem).unwrap(), 0);
        assert_eq!(state.stats().flushes, 0);
        assert_eq!(sinks.contents(ThreadId(1)).unwrap_or_default().len(), 0);
    }

    #[test]
    fn test_sink_failure_still_resets() {
        let mut mem = AddressSpace::new();
        let mut state = ThreadTraceState::new(ThreadId(4));
        let buffer = ThreadTraceBuffer::allocate(&mut mem, 2).unwrap();
        state.activate(buffer, Box::new(BrokenSink)).unwrap();
        fill(&state, &mut mem, 0..2);

        assert_eq!(state.flush(&mut mem).unwrap(), 2);
        assert_eq!(state.stats().write_errors, 1);
        assert_eq!(state.stats().records, 2);
        assert_eq!(state.buffer().unwrap().pending(&mem).unwrap(), 0);
    }

    #[test]
    fn test_finalize_merges_and_releases() {
        let mut mem = AddressSpace::new();
        let sinks = MemorySinks::new();
        let aggregate = GlobalAggregate::new();
        let mut state = active(&mut mem, 2, &sinks);
        fill(&state, &mut mem, 0..2);
        state.flush(&mut mem).unwrap();
        fill(&state, &mut mem, 2..3);

        let stats = state.finalize(&mut mem, &aggregate).unwrap();
        assert_eq!(stats.records, 3);
        assert_eq!(stats.flushes, 2);
        assert_eq!(state.phase(), ThreadPhase::Closed);
        assert!(state.buffer().is_none());
        assert_eq!(mem.owned_bytes(), 0);
        assert_eq!(aggregate.snapshot().unwrap().total_refs, 3);
    }

    #[test]
    fn test_sink_closed_after_merge() {
        let mut mem = AddressSpace::new();
        let aggregate = Arc::new(GlobalAggregate::new());
        let merged_before_close = Arc::new(AtomicBool::new(false));
        let sink = ClosingSink {
            aggregate: Arc::clone(&aggregate),
            merged_before_close: Arc::clone(&merged_before_close),
        };
        let mut state = ThreadTraceState::new(ThreadId(3));
        state.activate(ThreadTraceBuffer::allocate(&mut mem, 2).unwrap(), Box::new(sink)).unwrap();

        state.finalize(&mut mem, &aggregate).unwrap();
        assert!(merged_before_close.load(Ordering::SeqCst));
    }

    #[test]
    fn test_failed_merge_still_releases() {
        let mut mem = AddressSpace::new();
        let sinks = MemorySinks::new();
        let aggregate = GlobalAggregate::new();
        aggregate.poison();
        let mut state = active(&mut mem, 2, &sinks);
        fill(&state, &mut mem, 0..1);

        assert!(matches!(state.finalize(&mut mem, &aggregate), Err(MemtraceError::LockPoisoned)));
        assert_eq!(state.phase(), ThreadPhase::Closed);
        assert!(state.buffer().is_none());
        assert_eq!(mem.owned_bytes(), 0);
        assert_eq!(read_binary_log(&sinks.contents(ThreadId(1)).unwrap()).unwrap(), vec![record(0)]);
    }

    #[test]
    fn test_invalid_transitions() {
        let mut mem = AddressSpace::new();
        let sinks = MemorySinks::new();
        let aggregate = GlobalAggregate::new();

        let mut fresh = ThreadTraceState::new(ThreadId(2));
        assert!(matches!(
            fresh.flush(&mut mem),
            Err(MemtraceError::InvalidPhase { expected: "Active", actual: "Uninitialized", .. })
        ));

        let mut state = active(&mut mem, 2, &sinks);
        state.finalize(&mut mem, &aggregate).unwrap();
        assert!(matches!(
            state.finalize(&mut mem, &aggregate),
            Err(MemtraceError::InvalidPhase { actual: "Closed", .. })
        ));
        let buffer = ThreadTraceBuffer::allocate(&mut mem, 1).unwrap();
        assert!(state.activate(buffer, Box::new(BrokenSink)).is_err());
    }

    #[test]
    fn test_flush_thread_without_state() {
        let mut ctx = ThreadContext::new(ThreadId(9), AddressSpace::new());
        assert!(matches!(
            flush_thread(&mut ctx, TlsIndex(0)),
            Err(MemtraceError::ThreadNotStarted(ThreadId(9)))
        ));
    }
}
