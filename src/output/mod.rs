//! Output frontends, §4.L. Each one is optional and independent — a run
//! writes to whichever combination of `--csv`/`--json`/`--hdr-log-path`/
//! `--statsd`/`--graphite` the configuration names, after every worker
//! thread's `RunStats` has been folded into a single grand total.

mod csv;
mod graphite;
mod hdr_log;
mod json;
mod statsd;

use crate::config::Config;
use crate::errors::EngineError;
use crate::stats::{RunStats, Totals};

/// Everything the frontends need, gathered once at the end of a run.
pub struct RunReport<'a> {
    pub config: &'a Config,
    pub stats: &'a RunStats,
    pub totals: Totals,
}

impl<'a> RunReport<'a> {
    pub fn new(config: &'a Config, stats: &'a RunStats) -> Self {
        Self { config, stats, totals: stats.summarize() }
    }

    /// Identifies this run in metric names sent to StatsD/Graphite.
    /// Derived from the target rather than configured separately — there
    /// is no dedicated `--label` flag.
    fn run_label(&self) -> String {
        match &self.config.endpoint {
            crate::config::Endpoint::Tcp { host, port } => format!("{host}_{port}"),
            crate::config::Endpoint::Unix { path } => path.replace('/', "_"),
        }
    }
}

/// Writes every frontend this run's configuration names. Stops at the
/// first failure — partial output from the remaining frontends isn't
/// worth writing once one has already failed.
pub async fn write_all(report: &RunReport<'_>) -> Result<(), EngineError> {
    if let Some(path) = &report.config.csv_path {
        csv::write(report, path)?;
    }
    if let Some(path) = &report.config.json_path {
        json::write(report, path)?;
    }
    if let Some(path) = &report.config.hdr_log_path {
        hdr_log::write(report, path)?;
    }
    if let Some(addr) = &report.config.statsd_addr {
        statsd::send(report, addr).await?;
    }
    if let Some(addr) = &report.config.graphite_addr {
        graphite::send(report, addr).await?;
    }
    Ok(())
}
