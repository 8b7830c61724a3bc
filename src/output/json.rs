//! JSON frontend, §4.L "JSON". One object per run: the configuration
//! that produced it, wall-clock run information, and a `Totals` block
//! per operation kind plus the grand total — mirroring the nested
//! sections a `redis-benchmark`-style JSON report uses.

use std::fs::File;
use std::time::SystemTime;

use serde::Serialize;

use super::RunReport;
use crate::config::Config;
use crate::errors::EngineError;
use crate::stats::{PercentileSet, Totals};

#[derive(Serialize)]
struct RunInformation {
    duration_secs: f64,
    timestamp_unix: u64,
}

#[derive(Serialize)]
struct OpReport {
    totals: Totals,
    percentiles: PercentileSet,
}

#[derive(Serialize)]
struct JsonReport<'a> {
    configuration: &'a Config,
    run_information: RunInformation,
    sets: OpReport,
    gets: OpReport,
    waits: OpReport,
    totals: &'a Totals,
}

pub fn write(report: &RunReport<'_>, path: &str) -> Result<(), EngineError> {
    let timestamp_unix =
        SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);

    let doc = JsonReport {
        configuration: report.config,
        run_information: RunInformation { duration_secs: report.stats.duration().as_secs_f64(), timestamp_unix },
        sets: OpReport {
            totals: Totals {
                ops_sec: report.totals.ops_sec_set,
                bytes_sec: report.totals.bytes_sec_set,
                latency_ms: report.totals.latency_set_ms,
                ops: report.totals.ops_set,
                ..Default::default()
            },
            percentiles: report.stats.set_percentiles(),
        },
        gets: OpReport {
            totals: Totals {
                ops_sec: report.totals.ops_sec_get,
                bytes_sec: report.totals.bytes_sec_get,
                latency_ms: report.totals.latency_get_ms,
                ops: report.totals.ops_get,
                ..Default::default()
            },
            percentiles: report.stats.get_percentiles(),
        },
        waits: OpReport {
            totals: Totals {
                ops_sec: report.totals.ops_sec_wait,
                latency_ms: report.totals.latency_wait_ms,
                ops: report.totals.ops_wait,
                ..Default::default()
            },
            percentiles: report.stats.wait_percentiles(),
        },
        totals: &report.totals,
    };

    let file = File::create(path).map_err(|e| EngineError::Output(e.to_string()))?;
    serde_json::to_writer_pretty(file, &doc).map_err(|e| EngineError::Output(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CliArgs;
    use clap::Parser;

    #[test]
    fn writes_valid_json() {
        let cfg = CliArgs::parse_from(["bench", "-n", "1"]).into_config().unwrap();
        let stats = crate::stats::RunStats::new();
        let report = super::super::RunReport::new(&cfg, &stats);
        let path = std::env::temp_dir().join("rrb-json-test.json");
        write(&report, path.to_str().unwrap()).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let _: serde_json::Value = serde_json::from_str(&text).unwrap();
        std::fs::remove_file(&path).ok();
    }
}
