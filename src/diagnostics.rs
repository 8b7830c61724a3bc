//! Process-wide diagnostics, §4.K: the panic hook and the file-descriptor
//! limit bump. Grounded on `run_stats.cpp`/`main.cpp`'s use of
//! `setrlimit(RLIMIT_NOFILE, ...)` before spawning worker threads, and
//! on the ambient `tracing` logging already used everywhere else in the
//! engine.

use crate::config::Config;

/// Installs a panic hook that logs through `tracing` before the default
/// hook prints to stderr, so a worker-thread panic shows up in whatever
/// structured log sink the run is configured with.
pub fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!(panic = %info, "worker thread panicked");
        default_hook(info);
    }));
}

/// Raises `RLIMIT_NOFILE` to cover every socket this run can open:
/// `threads * clients_per_thread` shard connections plus ten descriptors
/// of headroom per thread for stdio, log files and output sinks.
///
/// Only ever raises the limit; if the current hard limit is already
/// lower than the target, the run proceeds with whatever the OS allows
/// and `--clients`/`--threads` will simply hit `EMFILE` earlier.
pub fn raise_fd_limit(config: &Config) {
    let needed = config.threads as u64 * config.clients_per_thread as u64 + 10 * config.threads as u64 + 10;
    match rlimit::getrlimit(rlimit::Resource::NOFILE) {
        Ok((soft, hard)) if soft < needed => {
            let target = needed.min(hard);
            if let Err(e) = rlimit::setrlimit(rlimit::Resource::NOFILE, target, hard) {
                tracing::warn!(error = %e, requested = needed, "could not raise RLIMIT_NOFILE");
            } else {
                tracing::debug!(from = soft, to = target, "raised RLIMIT_NOFILE");
            }
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "could not read RLIMIT_NOFILE"),
    }
}
