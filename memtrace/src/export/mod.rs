//! Session summary export
//!
//! The summary printed at session end, and its JSON form for `--export`.

pub mod summary;

pub use summary::{SessionSummary, SummaryExporter};
