//! HDR interval log frontend, §4.L "HDR log". Writes the plain-text
//! percentile-distribution format HdrHistogram's own command-line tools
//! (`HistogramLogProcessor`, `hdr-plot`) consume: a legend line per
//! section, then `value percentile totalCount 1/(1-percentile)` rows.
//! One section per operation kind.

use std::fs::File;
use std::io::Write;

use super::RunReport;
use crate::errors::EngineError;

fn io_err(e: std::io::Error) -> EngineError {
    EngineError::Output(e.to_string())
}

pub fn write(report: &RunReport<'_>, path: &str) -> Result<(), EngineError> {
    let mut file = File::create(path).map_err(io_err)?;

    write_section(&mut file, "GET", report.stats.get_distribution())?;
    write_section(&mut file, "SET", report.stats.set_distribution())?;
    write_section(&mut file, "WAIT", report.stats.wait_distribution())?;

    Ok(())
}

fn write_section(file: &mut File, label: &str, rows: Vec<(u64, f64, u64)>) -> Result<(), EngineError> {
    writeln!(file, "#[{label}]").map_err(io_err)?;
    writeln!(file, "       Value     Percentile   TotalCount  1/(1-Percentile)").map_err(io_err)?;
    for (value_us, percentile, cumulative_count) in rows {
        let fraction = percentile / 100.0;
        let inverse = if fraction >= 1.0 { f64::INFINITY } else { 1.0 / (1.0 - fraction) };
        writeln!(file, "{value_us:12} {fraction:14.6} {cumulative_count:12} {inverse:14.2}").map_err(io_err)?;
    }
    writeln!(file).map_err(io_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CliArgs;
    use clap::Parser;

    #[test]
    fn writes_a_section_per_op_kind() {
        let cfg = CliArgs::parse_from(["bench", "-n", "1"]).into_config().unwrap();
        let stats = crate::stats::RunStats::new();
        let report = super::super::RunReport::new(&cfg, &stats);
        let path = std::env::temp_dir().join("rrb-hdr-test.log");
        write(&report, path.to_str().unwrap()).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("#[GET]"));
        assert!(text.contains("#[SET]"));
        assert!(text.contains("#[WAIT]"));
        std::fs::remove_file(&path).ok();
    }
}
