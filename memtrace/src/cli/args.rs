//! CLI argument definitions

use clap::Parser;
use std::path::PathBuf;

use crate::flush::sink::TraceFormat;
use crate::workload::Workload;

#[derive(Parser, Debug)]
#[command(
    name = "memtrace",
    about = "Record every memory access of instrumented threads",
    after_help = "\
EXAMPLES:
    memtrace                                   4 threads, text logs in the current directory
    memtrace --format binary --output-dir out  Packed 32-byte records per thread
    memtrace --capacity 2 --threads 1 --verify Tiny buffer, check logs against the totals
    memtrace --stdout --threads 1 --iterations 3"
)]
pub struct Args {
    /// Records per thread buffer before a flush
    #[arg(short, long, default_value_t = memtrace_common::DEFAULT_BUFFER_RECORDS)]
    pub capacity: usize,

    /// Per-thread log format
    #[arg(short, long, value_enum, default_value_t = TraceFormat::Text)]
    pub format: TraceFormat,

    /// Directory for memtrace.<pid>.<tid>.log files
    #[arg(short, long, value_name = "DIR", default_value = ".", conflicts_with = "stdout")]
    pub output_dir: PathBuf,

    /// Write every thread's log to stdout instead of files
    #[arg(long)]
    pub stdout: bool,

    /// Number of application threads to run
    #[arg(short, long, default_value_t = 4)]
    pub threads: u64,

    /// Times each thread runs its program
    #[arg(short, long, default_value_t = 1000)]
    pub iterations: u64,

    /// Program every thread runs
    #[arg(short, long, value_enum, default_value_t = Workload::Copy)]
    pub workload: Workload,

    /// Always save flags around the overflow test instead of using lea + jrcxz
    #[arg(long)]
    pub no_flag_safe_test: bool,

    /// Export the session summary as JSON
    #[arg(long, value_name = "FILE")]
    pub export: Option<PathBuf>,

    /// Read every log back and check it against the recorded totals
    #[arg(long, conflicts_with = "stdout")]
    pub verify: bool,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,
}
