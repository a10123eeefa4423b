//! Per-thread output sinks
//!
//! Each thread owns exactly one sink for its whole life. A batch is written
//! with a single `write_all`, so threads sharing stdout never interleave
//! inside a batch.
//!
//! ## Formats
//!
//! - **Text**: a header line, then `0x<pc>,<r|w>,<size>,0x<addr>` per record
//! - **Binary**: records in their in-memory layout, 32 bytes each

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use clap::ValueEnum;
use memtrace_common::{TraceRecord, RECORD_SIZE, TEXT_LOG_HEADER};
use serde::Serialize;

use crate::domain::{Direction, SinkError, ThreadId};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceFormat {
    #[default]
    Text,
    Binary,
}

pub trait TraceSink: Send {
    /// Writes `records` in order.
    ///
    /// # Errors
    /// Any I/O failure of the underlying writer.
    fn write_batch(&mut self, records: &[TraceRecord]) -> Result<(), SinkError>;

    /// Flushes buffered output. The sink is not written again afterwards.
    ///
    /// # Errors
    /// Any I/O failure of the underlying writer.
    fn finish(&mut self) -> Result<(), SinkError>;
}

/// One text log line, newline included
#[must_use]
pub fn format_text_record(record: &TraceRecord) -> String {
    format!(
        "0x{:016x},{},{},0x{:016x}\n",
        record.origin_pc,
        Direction::from(record.is_write()).as_char(),
        record.size,
        record.address
    )
}

pub struct TextSink<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> TextSink<W> {
    /// Wraps `writer` and emits the format header.
    ///
    /// # Errors
    /// If the header cannot be written.
    pub fn new(mut writer: W) -> Result<Self, SinkError> {
        writer.write_all(format!("{TEXT_LOG_HEADER}\n").as_bytes()).map_err(SinkError::Write)?;
        Ok(Self { writer })
    }
}

impl<W: Write + Send> TraceSink for TextSink<W> {
    fn write_batch(&mut self, records: &[TraceRecord]) -> Result<(), SinkError> {
        let mut text = String::with_capacity(records.len() * 48);
        for record in records {
            text.push_str(&format_text_record(record));
        }
        self.writer.write_all(text.as_bytes()).map_err(SinkError::Write)
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        self.writer.flush().map_err(SinkError::Write)
    }
}

pub struct BinarySink<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> BinarySink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W: Write + Send> TraceSink for BinarySink<W> {
    fn write_batch(&mut self, records: &[TraceRecord]) -> Result<(), SinkError> {
        let mut bytes = Vec::with_capacity(records.len() * RECORD_SIZE);
        for record in records {
            bytes.extend_from_slice(&record.to_bytes());
        }
        self.writer.write_all(&bytes).map_err(SinkError::Write)
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        self.writer.flush().map_err(SinkError::Write)
    }
}

// ============================================================================
// In-Memory Sinks
// ============================================================================

/// Writes of each thread, in order
type ThreadLogs = BTreeMap<ThreadId, Vec<Vec<u8>>>;

/// Per-thread byte logs kept in memory, shared between the session and
/// whoever inspects the output afterwards. Every write is kept as its own
/// chunk, so a sink's batches stay visible.
#[derive(Debug, Clone, Default)]
pub struct MemorySinks {
    logs: Arc<Mutex<ThreadLogs>>,
}

impl MemorySinks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes written so far by `thread`
    #[must_use]
    pub fn contents(&self, thread: ThreadId) -> Option<Vec<u8>> {
        self.logs.lock().ok()?.get(&thread).map(|chunks| chunks.concat())
    }

    /// Bytes written so far by `thread`, one entry per write
    #[must_use]
    pub fn writes(&self, thread: ThreadId) -> Vec<Vec<u8>> {
        self.logs
            .lock()
            .ok()
            .and_then(|logs| logs.get(&thread).cloned())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn threads(&self) -> Vec<ThreadId> {
        self.logs.lock().map(|logs| logs.keys().copied().collect()).unwrap_or_default()
    }

    fn writer(&self, thread: ThreadId) -> MemoryWriter {
        MemoryWriter { logs: Arc::clone(&self.logs), thread }
    }
}

struct MemoryWriter {
    logs: Arc<Mutex<ThreadLogs>>,
    thread: ThreadId,
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut logs = self
            .logs
            .lock()
            .map_err(|_| io::Error::other("memory sink lock poisoned"))?;
        logs.entry(self.thread).or_default().push(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// One stream shared by every thread, the in-process counterpart of stdout.
/// Each batch lands with a single write, so batches never interleave.
#[derive(Debug, Clone, Default)]
pub struct SharedLog {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl SharedLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.bytes.lock().map(|b| b.clone()).unwrap_or_default()
    }
}

impl Write for SharedLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut bytes = self
            .bytes
            .lock()
            .map_err(|_| io::Error::other("shared log lock poisoned"))?;
        bytes.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ============================================================================
// Sink Targets
// ============================================================================

/// Where per-thread logs go
#[derive(Debug, Clone)]
pub enum SinkTarget {
    /// One file per thread, `memtrace.<pid>.<tid>.log`
    Directory(PathBuf),
    /// Every thread into standard output, one write per batch
    Stdout,
    Memory(MemorySinks),
    /// Every thread into one in-process stream
    Shared(SharedLog),
}

impl Default for SinkTarget {
    fn default() -> Self {
        SinkTarget::Directory(PathBuf::from("."))
    }
}

#[must_use]
pub fn log_file_name(pid: u32, thread: ThreadId) -> String {
    format!("memtrace.{pid}.{}.log", thread.0)
}

/// Path of `thread`'s log under `dir` for the current process
#[must_use]
pub fn log_path(dir: &Path, thread: ThreadId) -> PathBuf {
    dir.join(log_file_name(std::process::id(), thread))
}

fn wrap<W: Write + Send + 'static>(writer: W, format: TraceFormat) -> Result<Box<dyn TraceSink>, SinkError> {
    Ok(match format {
        TraceFormat::Text => Box::new(TextSink::new(writer)?),
        TraceFormat::Binary => Box::new(BinarySink::new(writer)),
    })
}

impl SinkTarget {
    /// Opens `thread`'s sink.
    ///
    /// # Errors
    /// `Open` if the log file cannot be created, `Write` if the header fails.
    pub fn open(&self, format: TraceFormat, thread: ThreadId) -> Result<Box<dyn TraceSink>, SinkError> {
        match self {
            SinkTarget::Directory(dir) => {
                let path = log_path(dir, thread);
                let file = File::create(&path).map_err(|source| SinkError::Open {
                    path: path.display().to_string(),
                    source,
                })?;
                wrap(BufWriter::new(file), format)
            }
            SinkTarget::Stdout => wrap(io::stdout(), format),
            SinkTarget::Memory(sinks) => wrap(sinks.writer(thread), format),
            SinkTarget::Shared(log) => wrap(log.clone(), format),
        }
    }

    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            SinkTarget::Directory(dir) => dir.display().to_string(),
            SinkTarget::Stdout => "stdout".to_string(),
            SinkTarget::Memory(_) => "memory".to_string(),
            SinkTarget::Shared(_) => "shared stream".to_string(),
        }
    }
}
