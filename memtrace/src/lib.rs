//! # memtrace - Memory Access Tracer
//!
//! A client for a dynamic binary instrumentation host that records every
//! memory reference an application thread makes. For each memory operand it
//! inserts a short inline fast path that appends a 32-byte record to a
//! per-thread buffer; when the buffer fills, the fast path diverts to a
//! shared trampoline that flushes the buffer to the thread's log and resumes.
//!
//! ## Architecture Overview
//!
//! ```text
//!   application instruction
//!            │ host insertion event
//!            ▼
//!   ┌──────────────────┐   fast path    ┌────────────────────┐
//!   │ InjectionPlanner │ ─────────────▶ │ ThreadTraceBuffer  │
//!   └──────────────────┘  (inline code) └─────────┬──────────┘
//!                                                 │ full
//!                                                 ▼
//!                                        ┌────────────────────┐
//!                                        │  FlushTrampoline   │ clean call
//!                                        └─────────┬──────────┘
//!                                                  ▼
//!   ┌──────────────────┐  thread exit   ┌────────────────────┐
//!   │ GlobalAggregate  │ ◀───────────── │ flush handler/sink │
//!   └──────────────────┘                └────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`host`]: the instrumentation framework the tracer runs on: ISA model,
//!   instruction lists, register reservation, address spaces, interpreter
//! - [`instrument`]: operand selection, operand sizing and fast-path emission
//! - [`buffer`]: the per-thread record buffer and its machine-visible header
//! - [`trampoline`]: the shared out-of-line flush routine
//! - [`flush`]: flush handler, per-thread state machine, sinks, log readers
//!   and the global aggregate
//! - [`client`]: lifecycle hooks tying the above together
//! - [`config`], [`cli`], [`export`], [`workload`]: session configuration,
//!   command line, summary export and synthetic programs
//! - [`domain`]: newtypes and error enums

pub mod buffer;
pub mod cli;
pub mod client;
pub mod config;
pub mod domain;
pub mod export;
pub mod flush;
pub mod host;
pub mod instrument;
pub mod trampoline;
pub mod workload;
