//! Entry point: parses the CLI, builds the shared runtime-independent
//! pieces (TLS connector, compiled arbitrary commands, the fd limit
//! bump), spawns one worker OS thread per `--threads`, and merges their
//! `RunStats` once every thread has finished or Ctrl-C fired. Grounded
//! on `memtier_benchmark.cpp`'s `main`: parse config, `setrlimit`, spawn
//! one thread per shard group, join, then print/write results — the
//! libevent dispatch loop each C++ thread ran becomes `worker::spawn`'s
//! own single-threaded Tokio runtime.

mod client;
mod cluster;
mod config;
mod connection;
mod diagnostics;
mod errors;
mod objgen;
mod output;
mod protocol;
mod rate_limiter;
mod stats;
mod tls;
mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use config::CliArgs;
use output::RunReport;
use worker::Progress;

const PROGRESS_POLL_INTERVAL: Duration = Duration::from_secs(1);

fn main() {
    let config = match CliArgs::parse().into_config() {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .compact()
        .init();

    diagnostics::install_panic_hook();
    diagnostics::raise_fd_limit(&config);

    let tls_connector = if config.tls.enabled {
        match tls::build_connector(&config.tls) {
            Ok(connector) => Some(Arc::new(connector)),
            Err(e) => {
                eprintln!("error: {e}");
                std::process::exit(1);
            }
        }
    } else {
        None
    };

    let arbitrary = match config
        .arbitrary_commands
        .iter()
        .map(protocol::compile_arbitrary)
        .collect::<Result<Vec<_>, _>>()
    {
        Ok(compiled) => Arc::new(compiled),
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(
        threads = config.threads,
        clients_per_thread = config.clients_per_thread,
        endpoint = ?config.endpoint,
        "starting run"
    );

    let interrupt = Arc::new(AtomicBool::new(false));
    spawn_ctrlc_watcher(interrupt.clone());

    let mut handles = Vec::with_capacity(config.threads as usize);
    let mut progresses = Vec::with_capacity(config.threads as usize);
    for thread_index in 0..config.threads {
        let progress = Arc::new(Progress::default());
        let handle = worker::spawn(
            thread_index,
            config.clone(),
            tls_connector.clone(),
            arbitrary.clone(),
            interrupt.clone(),
            progress.clone(),
        );
        handles.push(handle);
        progresses.push(progress);
    }

    while handles.iter().any(|h| !h.is_finished()) {
        std::thread::sleep(PROGRESS_POLL_INTERVAL);
        let total_ops: u64 = progresses.iter().map(|p| p.ops()).sum();
        tracing::debug!(total_ops, "progress");
    }

    let mut merged = stats::RunStats::new();
    let mut verified_keys = 0u64;
    let mut verify_errors = 0u64;
    let mut fatal = false;
    for handle in handles {
        match handle.join() {
            Ok(outcome) => {
                merged.merge(&outcome.stats);
                verified_keys += outcome.verified_keys;
                verify_errors += outcome.verify_errors;
                fatal |= outcome.fatal;
            }
            Err(_) => {
                tracing::error!("worker thread panicked");
                fatal = true;
            }
        }
    }

    if config.verify {
        tracing::info!(verified_keys, verify_errors, "verification complete");
    }

    let report = RunReport::new(&config, &merged);
    print_summary(&report);

    let output_rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build output runtime");
    if let Err(e) = output_rt.block_on(output::write_all(&report)) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }

    std::process::exit(if fatal { 1 } else { 0 });
}

fn print_summary(report: &RunReport<'_>) {
    let t = &report.totals;
    println!(
        "ops/sec: {:.2}  (set {:.2}, get {:.2}, wait {:.2})",
        t.ops_sec, t.ops_sec_set, t.ops_sec_get, t.ops_sec_wait
    );
    println!("bytes/sec: {:.2}", t.bytes_sec);
    println!("avg latency (ms): {:.3}", t.latency_ms);
    if t.moved_sec > 0.0 || t.ask_sec > 0.0 {
        println!("moved/sec: {:.2}  ask/sec: {:.2}", t.moved_sec, t.ask_sec);
    }
}

/// Watches for Ctrl-C on its own small runtime and trips `interrupt`
/// once. Kept off the worker threads' runtimes entirely — each of those
/// is dedicated to one client group's event loop (§5).
fn spawn_ctrlc_watcher(interrupt: Arc<AtomicBool>) {
    std::thread::Builder::new()
        .name("rrb-ctrlc".into())
        .spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build ctrl-c runtime");
            rt.block_on(async {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("received interrupt, stopping worker threads");
                    interrupt.store(true, Ordering::Relaxed);
                }
            });
        })
        .expect("failed to spawn ctrl-c watcher thread");
}
