//! Draining thread buffers to their sinks and aggregating totals

pub mod aggregator;
pub mod handler;
pub mod reader;
pub mod sink;

pub use aggregator::{AggregateSnapshot, GlobalAggregate, ThreadStats};
pub use handler::{finalize_thread, flush_thread, ThreadPhase, ThreadTraceState};
pub use reader::{read_binary_log, read_log_file, read_text_log};
pub use sink::{MemorySinks, SharedLog, SinkTarget, TraceFormat, TraceSink};
