//! Process-wide totals
//!
//! Threads touch the aggregate twice: an atomic increment when they start,
//! and one locked merge when they finalize. Flushes never take the lock.
//! A fatal thread-start failure aborts the whole session; the first reason
//! recorded is kept.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

use log::{debug, error};
use serde::Serialize;

use crate::domain::{MemtraceError, ThreadId};

/// Lifetime counters of one thread, merged at finalize
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ThreadStats {
    pub thread: u64,
    pub records: u64,
    pub flushes: u64,
    pub write_errors: u64,
}

impl ThreadStats {
    #[must_use]
    pub fn new(thread: ThreadId) -> Self {
        Self { thread: thread.0, ..Self::default() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateSnapshot {
    pub total_refs: u64,
    pub flushes: u64,
    pub write_errors: u64,
    pub threads_started: u64,
    /// Finalized threads, in merge order
    pub threads: Vec<ThreadStats>,
    pub aborted: Option<String>,
}

impl AggregateSnapshot {
    #[must_use]
    pub fn unfinalized(&self) -> u64 {
        self.threads_started.saturating_sub(self.threads.len() as u64)
    }
}

#[derive(Debug, Default)]
struct Totals {
    total_refs: u64,
    flushes: u64,
    write_errors: u64,
    threads: Vec<ThreadStats>,
}

#[derive(Debug, Default)]
pub struct GlobalAggregate {
    totals: Mutex<Totals>,
    started: AtomicU64,
    aborted: OnceLock<String>,
}

impl GlobalAggregate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts a thread that will later have to [`merge`](Self::merge).
    pub fn register_thread(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    /// Marks the session as failed. Later calls keep the first reason.
    pub fn abort(&self, reason: String) {
        error!("session aborted: {reason}");
        let _ = self.aborted.set(reason);
    }

    #[must_use]
    pub fn aborted(&self) -> Option<&str> {
        self.aborted.get().map(String::as_str)
    }

    /// Folds a finished thread's counters into the totals.
    ///
    /// # Errors
    /// `LockPoisoned` if another thread panicked while merging.
    pub fn merge(&self, stats: ThreadStats) -> Result<(), MemtraceError> {
        let mut totals = self.totals.lock().map_err(|_| MemtraceError::LockPoisoned)?;
        totals.total_refs += stats.records;
        totals.flushes += stats.flushes;
        totals.write_errors += stats.write_errors;
        totals.threads.push(stats);
        debug!("merged TID:{} ({} refs), total now {}", stats.thread, stats.records, totals.total_refs);
        Ok(())
    }

    /// Leaves the totals lock poisoned, as after a panic during a merge.
    #[cfg(test)]
    pub(crate) fn poison(&self) {
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _totals = self.totals.lock();
            panic!("merge interrupted");
        }));
    }

    /// # Errors
    /// `LockPoisoned` if another thread panicked while merging.
    pub fn snapshot(&self) -> Result<AggregateSnapshot, MemtraceError> {
        let totals = self.totals.lock().map_err(|_| MemtraceError::LockPoisoned)?;
        Ok(AggregateSnapshot {
            total_refs: totals.total_refs,
            flushes: totals.flushes,
            write_errors: totals.write_errors,
            threads_started: self.started.load(Ordering::Relaxed),
            threads: totals.threads.clone(),
            aborted: self.aborted.get().cloned(),
        })
    }
}
