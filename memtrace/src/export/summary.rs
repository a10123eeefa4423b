use std::fmt;
use std::io::Write;

use serde::Serialize;

use crate::domain::ExportError;
use crate::flush::aggregator::{AggregateSnapshot, ThreadStats};
use crate::flush::sink::TraceFormat;

/// Totals of a finished session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub total_refs: u64,
    pub threads: u64,
    pub flushes: u64,
    pub write_errors: u64,
    pub format: TraceFormat,
    pub buffer_records: usize,
    pub overflow_check: &'static str,
    /// Sorted by thread id
    pub per_thread: Vec<ThreadStats>,
}

impl SessionSummary {
    #[must_use]
    pub fn from_snapshot(
        snapshot: AggregateSnapshot,
        format: TraceFormat,
        buffer_records: usize,
        overflow_check: &'static str,
    ) -> Self {
        let mut per_thread = snapshot.threads;
        per_thread.sort_by_key(|t| t.thread);
        Self {
            total_refs: snapshot.total_refs,
            threads: per_thread.len() as u64,
            flushes: snapshot.flushes,
            write_errors: snapshot.write_errors,
            format,
            buffer_records,
            overflow_check,
            per_thread,
        }
    }
}

impl fmt::Display for SessionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Instrumentation results:\n  saw {} memory references", self.total_refs)
    }
}

/// Writes a [`SessionSummary`] as pretty-printed JSON
pub struct SummaryExporter<W: Write> {
    writer: W,
}

impl<W: Write> SummaryExporter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// # Errors
    /// Serialization or I/O failure.
    pub fn export(mut self, summary: &SessionSummary) -> Result<(), ExportError> {
        serde_json::to_writer_pretty(&mut self.writer, summary)?;
        writeln!(self.writer)?;
        self.writer.flush()?;
        Ok(())
    }
}
