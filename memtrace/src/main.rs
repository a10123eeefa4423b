//! # memtrace - Main Entry Point
//!
//! Runs a synthetic workload on several application threads under the
//! tracer, one OS thread per application thread, then prints the session
//! totals. With `--verify` every per-thread log is read back and checked
//! against the counts the tracer merged.

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::bounded;
use log::{info, warn};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use memtrace::cli::Args;
use memtrace::client::MemtraceClient;
use memtrace::config::TracerConfig;
use memtrace::domain::ThreadId;
use memtrace::export::{SessionSummary, SummaryExporter};
use memtrace::flush::sink::log_path;
use memtrace::flush::{read_log_file, SinkTarget, TraceFormat};
use memtrace::host::{Host, HostCapabilities, Program};

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let msg = format!("{err:#}").to_lowercase();
    if msg.contains("invalid configuration") {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

/// What a worker sends back when its thread is done
enum WorkerReport {
    Finished { id: ThreadId, app_instrs: u64, clean_calls: u64 },
    Failed { id: ThreadId, error: String },
}

fn run_threads(host: &Host, client: &MemtraceClient, program: &Program, threads: u64) -> Vec<String> {
    let capacity = usize::try_from(threads).unwrap_or(usize::MAX).max(1);
    let (tx, rx) = bounded(capacity);
    let mut failures = Vec::new();

    std::thread::scope(|s| {
        for n in 1..=threads {
            let tx = tx.clone();
            s.spawn(move || {
                let id = ThreadId(n);
                let report = match host.run_thread(client, id, program) {
                    Ok(run) => WorkerReport::Finished {
                        id,
                        app_instrs: run.stats.app_instrs,
                        clean_calls: run.stats.clean_calls,
                    },
                    Err(e) => WorkerReport::Failed { id, error: e.to_string() },
                };
                // Receiver outlives every worker inside the scope
                let _ = tx.send(report);
            });
        }
        drop(tx);

        for report in &rx {
            match report {
                WorkerReport::Finished { id, app_instrs, clean_calls } => {
                    info!("{id}: {app_instrs} app instructions, {clean_calls} flush calls");
                }
                WorkerReport::Failed { id, error } => {
                    warn!("{id} failed: {error}");
                    failures.push(format!("{id}: {error}"));
                }
            }
        }
    });
    failures
}

fn verify_logs(dir: &Path, format: TraceFormat, summary: &SessionSummary, expected_total: u64) -> Result<()> {
    for stats in &summary.per_thread {
        let path = log_path(dir, ThreadId(stats.thread));
        let records = read_log_file(&path, format)
            .with_context(|| format!("Failed to read back {}", path.display()))?;
        if stats.write_errors == 0 && records.len() as u64 != stats.records {
            anyhow::bail!(
                "{}: log holds {} records, tracer counted {}",
                path.display(),
                records.len(),
                stats.records
            );
        }
    }
    if summary.total_refs != expected_total {
        anyhow::bail!("traced {} references, workload executed {expected_total}", summary.total_refs);
    }
    Ok(())
}

fn run() -> Result<()> {
    let args = Args::parse();

    let target = if args.stdout {
        SinkTarget::Stdout
    } else {
        SinkTarget::Directory(args.output_dir.clone())
    };
    let config = TracerConfig {
        buffer_records: args.capacity,
        format: args.format,
        target,
        prefer_flag_safe_test: !args.no_flag_safe_test,
    };

    let mut host = Host::new(HostCapabilities::default());
    let client = MemtraceClient::init(&mut host, config).context("Failed to initialize tracer")?;
    let program = args.workload.program(args.iterations);

    if !args.quiet && !args.stdout {
        println!("memtrace v{}", env!("CARGO_PKG_VERSION"));
        println!(
            "workload: {:?}, {} thread(s) x {} iteration(s)",
            args.workload, args.threads, args.iterations
        );
        println!("buffer: {} records, overflow check: {}", args.capacity, client.overflow_check());
        println!("logs: {} ({:?})", args.output_dir.display(), args.format);
    }

    let failures = run_threads(&host, &client, &program, args.threads);
    let summary = client.shutdown(&mut host).context("Session did not shut down cleanly")?;
    println!("{summary}");

    if let Some(ref export_path) = args.export {
        let file = File::create(export_path)
            .with_context(|| format!("Failed to create {}", export_path.display()))?;
        SummaryExporter::new(BufWriter::new(file))
            .export(&summary)
            .context("Failed to export summary")?;
        if !args.quiet {
            println!("export: {}", export_path.display());
        }
    }

    if !failures.is_empty() {
        anyhow::bail!("{} thread(s) failed; first: {}", failures.len(), failures[0]);
    }

    if args.verify {
        let expected = program.memory_operand_count() * args.threads;
        verify_logs(&args.output_dir, args.format, &summary, expected)?;
        if !args.quiet {
            println!("verify: {} log(s) match", summary.per_thread.len());
        }
    }
    Ok(())
}
