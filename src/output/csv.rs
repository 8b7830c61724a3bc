//! CSV frontend, §4.L "CSV". A per-second time series followed by three
//! latency-CDF sections (GET/SET/WAIT), the same two-part shape classic
//! `redis-benchmark`-style tools write: a row per wall-clock second,
//! then a percentile curve per operation kind.

use std::fs::File;

use super::RunReport;
use crate::errors::EngineError;

fn csv_err(e: csv::Error) -> EngineError {
    EngineError::Output(e.to_string())
}

fn io_err(e: std::io::Error) -> EngineError {
    EngineError::Output(e.to_string())
}

pub fn write(report: &RunReport<'_>, path: &str) -> Result<(), EngineError> {
    let file = File::create(path).map_err(io_err)?;
    let mut w = csv::Writer::from_writer(file);

    w.write_record([
        "Second",
        "SET Ops/sec",
        "SET Bytes/sec",
        "GET Ops/sec",
        "GET Bytes/sec",
        "GET Hits/sec",
        "GET Misses/sec",
        "WAIT Ops/sec",
        "Moved/sec",
        "Ask/sec",
    ])
    .map_err(csv_err)?;

    for s in report.stats.one_second_series() {
        w.write_record([
            s.second.to_string(),
            s.ops_set.to_string(),
            s.bytes_set.to_string(),
            s.ops_get.to_string(),
            s.bytes_get.to_string(),
            s.get_hits.to_string(),
            s.get_misses.to_string(),
            s.ops_wait.to_string(),
            (s.moved_get + s.moved_set).to_string(),
            (s.ask_get + s.ask_set).to_string(),
        ])
        .map_err(csv_err)?;
    }

    write_cdf_section(&mut w, "GET", report.stats.get_cdf())?;
    write_cdf_section(&mut w, "SET", report.stats.set_cdf())?;
    write_cdf_section(&mut w, "WAIT", report.stats.wait_cdf())?;

    w.flush().map_err(io_err)?;
    Ok(())
}

fn write_cdf_section(
    w: &mut csv::Writer<File>,
    label: &str,
    points: Vec<(f64, u64)>,
) -> Result<(), EngineError> {
    w.write_record(["", ""]).map_err(csv_err)?;
    w.write_record([format!("{label} Percentile"), format!("{label} Latency (us)")]).map_err(csv_err)?;
    for (percentile, value_us) in points {
        w.write_record([format!("{percentile:.4}"), value_us.to_string()]).map_err(csv_err)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CliArgs;
    use clap::Parser;

    #[test]
    fn writes_header_and_empty_series_without_error() {
        let cfg = CliArgs::parse_from(["bench", "-n", "1"]).into_config().unwrap();
        let stats = crate::stats::RunStats::new();
        let report = super::super::RunReport::new(&cfg, &stats);
        let path = std::env::temp_dir().join("rrb-csv-test.csv");
        write(&report, path.to_str().unwrap()).unwrap();
        std::fs::remove_file(&path).ok();
    }
}
