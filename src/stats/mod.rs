//! Run statistics, §4.H. Grounded on `run_stats.h`/`run_stats.cpp`'s
//! `one_second_stats`/`totals`/`run_stats` trio. The original keeps
//! latency in a `std::map<float, int>` bucketed by rounded millisecond;
//! this keeps the same per-second/total-run shape but records latency in
//! `hdrhistogram::Histogram`s instead, the way the teacher's own
//! `MetricsCollector` does it — full percentile resolution instead of a
//! handful of rounded buckets.

mod percentiles;

pub use percentiles::PercentileSet;

use std::time::{Duration, Instant};

use hdrhistogram::Histogram;
use serde::Serialize;

/// Per-second counters, one instance per wall-clock second of the run.
#[derive(Debug, Clone, Serialize)]
pub struct OneSecondStats {
    pub second: u32,
    pub bytes_get: u64,
    pub bytes_set: u64,
    pub ops_get: u64,
    pub ops_set: u64,
    pub ops_wait: u64,
    pub get_hits: u64,
    pub get_misses: u64,
    pub moved_get: u64,
    pub moved_set: u64,
    pub ask_get: u64,
    pub ask_set: u64,
    pub total_get_latency_us: u64,
    pub total_set_latency_us: u64,
    pub total_wait_latency_us: u64,
}

impl OneSecondStats {
    pub fn new(second: u32) -> Self {
        Self {
            second,
            bytes_get: 0,
            bytes_set: 0,
            ops_get: 0,
            ops_set: 0,
            ops_wait: 0,
            get_hits: 0,
            get_misses: 0,
            moved_get: 0,
            moved_set: 0,
            ask_get: 0,
            ask_set: 0,
            total_get_latency_us: 0,
            total_set_latency_us: 0,
            total_wait_latency_us: 0,
        }
    }

    pub fn merge(&mut self, other: &OneSecondStats) {
        self.bytes_get += other.bytes_get;
        self.bytes_set += other.bytes_set;
        self.ops_get += other.ops_get;
        self.ops_set += other.ops_set;
        self.ops_wait += other.ops_wait;
        self.get_hits += other.get_hits;
        self.get_misses += other.get_misses;
        self.moved_get += other.moved_get;
        self.moved_set += other.moved_set;
        self.ask_get += other.ask_get;
        self.ask_set += other.ask_set;
        self.total_get_latency_us += other.total_get_latency_us;
        self.total_set_latency_us += other.total_set_latency_us;
        self.total_wait_latency_us += other.total_wait_latency_us;
    }
}

/// Summary across the whole run, §4.H "Totals".
#[derive(Debug, Clone, Default, Serialize)]
pub struct Totals {
    pub ops_sec_set: f64,
    pub ops_sec_get: f64,
    pub ops_sec_wait: f64,
    pub ops_sec: f64,

    pub hits_sec: f64,
    pub misses_sec: f64,

    pub moved_sec_set: f64,
    pub moved_sec_get: f64,
    pub moved_sec: f64,

    pub ask_sec_set: f64,
    pub ask_sec_get: f64,
    pub ask_sec: f64,

    pub bytes_sec_set: f64,
    pub bytes_sec_get: f64,
    pub bytes_sec: f64,

    pub latency_set_ms: f64,
    pub latency_get_ms: f64,
    pub latency_wait_ms: f64,
    pub latency_ms: f64,

    pub bytes: u64,
    pub ops_set: u64,
    pub ops_get: u64,
    pub ops_wait: u64,
    pub ops: u64,
}

impl Totals {
    pub fn add(&mut self, other: &Totals) {
        self.ops_sec_set += other.ops_sec_set;
        self.ops_sec_get += other.ops_sec_get;
        self.ops_sec_wait += other.ops_sec_wait;
        self.ops_sec += other.ops_sec;
        self.hits_sec += other.hits_sec;
        self.misses_sec += other.misses_sec;
        self.moved_sec_set += other.moved_sec_set;
        self.moved_sec_get += other.moved_sec_get;
        self.moved_sec += other.moved_sec;
        self.ask_sec_set += other.ask_sec_set;
        self.ask_sec_get += other.ask_sec_get;
        self.ask_sec += other.ask_sec;
        self.bytes_sec_set += other.bytes_sec_set;
        self.bytes_sec_get += other.bytes_sec_get;
        self.bytes_sec += other.bytes_sec;
        self.latency_set_ms += other.latency_set_ms;
        self.latency_get_ms += other.latency_get_ms;
        self.latency_wait_ms += other.latency_wait_ms;
        self.latency_ms += other.latency_ms;
        self.bytes += other.bytes;
        self.ops_set += other.ops_set;
        self.ops_get += other.ops_get;
        self.ops_wait += other.ops_wait;
        self.ops += other.ops;
    }

    fn scale(&mut self, n: f64) {
        self.ops_sec_set /= n;
        self.ops_sec_get /= n;
        self.ops_sec_wait /= n;
        self.ops_sec /= n;
        self.hits_sec /= n;
        self.misses_sec /= n;
        self.moved_sec_set /= n;
        self.moved_sec_get /= n;
        self.moved_sec /= n;
        self.ask_sec_set /= n;
        self.ask_sec_get /= n;
        self.ask_sec /= n;
        self.bytes_sec_set /= n;
        self.bytes_sec_get /= n;
        self.bytes_sec /= n;
        self.latency_set_ms /= n;
        self.latency_get_ms /= n;
        self.latency_wait_ms /= n;
        self.latency_ms /= n;
    }
}

/// One client's complete run statistics: a rolling array of per-second
/// buckets plus HDR histograms for latency percentiles.
pub struct RunStats {
    start_time: Option<Instant>,
    end_time: Option<Instant>,
    seconds: Vec<OneSecondStats>,
    cur: OneSecondStats,
    get_hist: Histogram<u64>,
    set_hist: Histogram<u64>,
    wait_hist: Histogram<u64>,
}

impl RunStats {
    pub fn new() -> Self {
        Self {
            start_time: None,
            end_time: None,
            seconds: Vec::new(),
            cur: OneSecondStats::new(0),
            get_hist: Histogram::new(3).expect("histogram creation"),
            set_hist: Histogram::new(3).expect("histogram creation"),
            wait_hist: Histogram::new(3).expect("histogram creation"),
        }
    }

    pub fn set_start_time(&mut self, t: Instant) {
        self.start_time = Some(t);
    }

    pub fn set_end_time(&mut self, t: Instant) {
        self.end_time = Some(t);
    }

    pub fn start_time(&self) -> Option<Instant> {
        self.start_time
    }

    fn roll_to(&mut self, elapsed: Duration) {
        let second = elapsed.as_secs() as u32;
        if second != self.cur.second {
            let finished = std::mem::replace(&mut self.cur, OneSecondStats::new(second));
            self.seconds.push(finished);
        }
    }

    pub fn update_get_op(&mut self, elapsed: Duration, bytes: u64, latency_us: u64, hits: u64, misses: u64) {
        self.roll_to(elapsed);
        self.cur.bytes_get += bytes;
        self.cur.ops_get += 1;
        self.cur.get_hits += hits;
        self.cur.get_misses += misses;
        self.cur.total_get_latency_us += latency_us;
        let _ = self.get_hist.record(latency_us);
    }

    pub fn update_set_op(&mut self, elapsed: Duration, bytes: u64, latency_us: u64) {
        self.roll_to(elapsed);
        self.cur.bytes_set += bytes;
        self.cur.ops_set += 1;
        self.cur.total_set_latency_us += latency_us;
        let _ = self.set_hist.record(latency_us);
    }

    pub fn update_wait_op(&mut self, elapsed: Duration, latency_us: u64) {
        self.roll_to(elapsed);
        self.cur.ops_wait += 1;
        self.cur.total_wait_latency_us += latency_us;
        let _ = self.wait_hist.record(latency_us);
    }

    pub fn update_moved_get_op(&mut self, elapsed: Duration) {
        self.roll_to(elapsed);
        self.cur.moved_get += 1;
    }

    pub fn update_moved_set_op(&mut self, elapsed: Duration) {
        self.roll_to(elapsed);
        self.cur.moved_set += 1;
    }

    pub fn update_ask_get_op(&mut self, elapsed: Duration) {
        self.roll_to(elapsed);
        self.cur.ask_get += 1;
    }

    pub fn update_ask_set_op(&mut self, elapsed: Duration) {
        self.roll_to(elapsed);
        self.cur.ask_set += 1;
    }

    pub fn duration(&self) -> Duration {
        match (self.start_time, self.end_time) {
            (Some(s), Some(e)) => e.saturating_duration_since(s),
            _ => Duration::ZERO,
        }
    }

    /// Folds the current (not-yet-rolled) second into the series before a
    /// summary is computed, same role as the original draining
    /// `m_cur_stats` implicitly via `m_stats` at shutdown.
    fn finalized_seconds(&self) -> Vec<OneSecondStats> {
        let mut out = self.seconds.clone();
        if self.cur.ops_get + self.cur.ops_set + self.cur.ops_wait > 0 {
            out.push(self.cur.clone());
        }
        out
    }

    pub fn summarize(&self) -> Totals {
        let seconds = self.finalized_seconds();
        let mut totals = OneSecondStats::new(0);
        for s in &seconds {
            totals.merge(s);
        }

        let duration_us = self.duration().as_micros().max(1) as f64;
        let mut result = Totals::default();

        result.ops_set = totals.ops_set;
        result.ops_get = totals.ops_get;
        result.ops_wait = totals.ops_wait;
        result.ops = totals.ops_get + totals.ops_set + totals.ops_wait;
        result.bytes = totals.bytes_get + totals.bytes_set;

        result.ops_sec_set = totals.ops_set as f64 / duration_us * 1_000_000.0;
        result.latency_set_ms = if totals.ops_set > 0 {
            (totals.total_set_latency_us as f64 / totals.ops_set as f64) / 1000.0
        } else {
            0.0
        };
        result.bytes_sec_set = (totals.bytes_set as f64 / 1024.0) / duration_us * 1_000_000.0;
        result.moved_sec_set = totals.moved_set as f64 / duration_us * 1_000_000.0;
        result.ask_sec_set = totals.ask_set as f64 / duration_us * 1_000_000.0;

        result.ops_sec_get = totals.ops_get as f64 / duration_us * 1_000_000.0;
        result.latency_get_ms = if totals.ops_get > 0 {
            (totals.total_get_latency_us as f64 / totals.ops_get as f64) / 1000.0
        } else {
            0.0
        };
        result.bytes_sec_get = (totals.bytes_get as f64 / 1024.0) / duration_us * 1_000_000.0;
        result.moved_sec_get = totals.moved_get as f64 / duration_us * 1_000_000.0;
        result.ask_sec_get = totals.ask_get as f64 / duration_us * 1_000_000.0;

        result.ops_sec_wait = totals.ops_wait as f64 / duration_us * 1_000_000.0;
        result.latency_wait_ms = if totals.ops_wait > 0 {
            (totals.total_wait_latency_us as f64 / totals.ops_wait as f64) / 1000.0
        } else {
            0.0
        };

        result.hits_sec = totals.get_hits as f64 / duration_us * 1_000_000.0;
        result.misses_sec = totals.get_misses as f64 / duration_us * 1_000_000.0;
        result.moved_sec = result.moved_sec_set + result.moved_sec_get;
        result.ask_sec = result.ask_sec_set + result.ask_sec_get;
        result.bytes_sec = result.bytes_sec_set + result.bytes_sec_get;
        result.ops_sec = result.ops_sec_set + result.ops_sec_get + result.ops_sec_wait;
        result.latency_ms = if result.ops > 0 {
            (totals.total_get_latency_us + totals.total_set_latency_us + totals.total_wait_latency_us) as f64
                / result.ops as f64
                / 1000.0
        } else {
            0.0
        };

        result
    }

    /// Merges another client's stats into this one, matching
    /// `run_stats::merge` — same-second buckets are added, new seconds
    /// are appended and the series is re-sorted.
    pub fn merge(&mut self, other: &RunStats) {
        for other_sec in other.seconds.iter().chain(std::iter::once(&other.cur)) {
            if other_sec.ops_get + other_sec.ops_set + other_sec.ops_wait == 0 {
                continue;
            }
            match self.seconds.iter_mut().find(|s| s.second == other_sec.second) {
                Some(existing) => existing.merge(other_sec),
                None => self.seconds.push(other_sec.clone()),
            }
        }
        self.seconds.sort_by_key(|s| s.second);

        self.get_hist.add(&other.get_hist).ok();
        self.set_hist.add(&other.set_hist).ok();
        self.wait_hist.add(&other.wait_hist).ok();

        self.start_time = match (self.start_time, other.start_time) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, None) => a,
            (None, b) => b,
        };
        self.end_time = match (self.end_time, other.end_time) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, None) => a,
            (None, b) => b,
        };
    }

    pub fn get_percentiles(&self) -> PercentileSet {
        PercentileSet::from_histogram(&self.get_hist)
    }

    pub fn set_percentiles(&self) -> PercentileSet {
        PercentileSet::from_histogram(&self.set_hist)
    }

    pub fn wait_percentiles(&self) -> PercentileSet {
        PercentileSet::from_histogram(&self.wait_hist)
    }

    pub fn one_second_series(&self) -> &[OneSecondStats] {
        &self.seconds
    }

    /// Latency CDF points `(percentile, value_us)` for the CSV
    /// frontend's per-kind distribution sections, §4.L.
    pub fn get_cdf(&self) -> Vec<(f64, u64)> {
        cdf_points(&self.get_hist)
    }

    pub fn set_cdf(&self) -> Vec<(f64, u64)> {
        cdf_points(&self.set_hist)
    }

    pub fn wait_cdf(&self) -> Vec<(f64, u64)> {
        cdf_points(&self.wait_hist)
    }

    /// Full distribution rows `(value_us, percentile, cumulative_count)`
    /// for the HDR interval log frontend, §4.L "HDR log".
    pub fn get_distribution(&self) -> Vec<(u64, f64, u64)> {
        distribution_rows(&self.get_hist)
    }

    pub fn set_distribution(&self) -> Vec<(u64, f64, u64)> {
        distribution_rows(&self.set_hist)
    }

    pub fn wait_distribution(&self) -> Vec<(u64, f64, u64)> {
        distribution_rows(&self.wait_hist)
    }
}

fn distribution_rows(hist: &Histogram<u64>) -> Vec<(u64, f64, u64)> {
    if hist.len() == 0 {
        return Vec::new();
    }
    let mut cumulative = 0u64;
    hist.iter_quantiles(1)
        .map(|v| {
            cumulative += v.count_since_last_iteration();
            (v.value_iterated_to(), v.percentile(), cumulative)
        })
        .collect()
}

fn cdf_points(hist: &Histogram<u64>) -> Vec<(f64, u64)> {
    if hist.len() == 0 {
        return Vec::new();
    }
    hist.iter_quantiles(1).map(|v| (v.percentile(), v.value_iterated_to())).collect()
}

/// Averages a set of completed totals across N clients, matching
/// `run_stats::aggregate_average` (used for the per-client-group report
/// row, as opposed to `merge`'s full-series union used for the grand
/// total).
pub fn aggregate_average(all: &[Totals]) -> Totals {
    let mut sum = Totals::default();
    for t in all {
        sum.add(t);
    }
    if !all.is_empty() {
        sum.scale(all.len() as f64);
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_is_commutative_on_totals() {
        let mut a = RunStats::new();
        a.set_start_time(Instant::now());
        a.update_set_op(Duration::from_secs(0), 10, 500);
        a.update_get_op(Duration::from_secs(0), 20, 300, 1, 0);
        a.set_end_time(Instant::now() + Duration::from_secs(1));

        let mut b = RunStats::new();
        b.set_start_time(Instant::now());
        b.update_set_op(Duration::from_secs(0), 15, 700);
        b.set_end_time(Instant::now() + Duration::from_secs(1));

        let mut ab = RunStats::new();
        ab.set_start_time(a.start_time.unwrap());
        ab.update_set_op(Duration::from_secs(0), 10, 500);
        ab.update_get_op(Duration::from_secs(0), 20, 300, 1, 0);
        ab.set_end_time(a.end_time.unwrap());
        ab.merge(&b);

        let mut ba = RunStats::new();
        ba.set_start_time(b.start_time.unwrap());
        ba.update_set_op(Duration::from_secs(0), 15, 700);
        ba.set_end_time(b.end_time.unwrap());
        ba.merge(&a);

        assert_eq!(ab.summarize().ops, ba.summarize().ops);
        assert_eq!(ab.summarize().bytes, ba.summarize().bytes);
    }

    #[test]
    fn summarize_divides_by_actual_duration() {
        let mut stats = RunStats::new();
        let start = Instant::now();
        stats.set_start_time(start);
        for _ in 0..100 {
            stats.update_get_op(Duration::from_millis(0), 10, 100, 1, 0);
        }
        stats.set_end_time(start + Duration::from_secs(1));
        let totals = stats.summarize();
        assert_eq!(totals.ops_get, 100);
        assert!((totals.ops_sec_get - 100.0).abs() < 1.0);
    }

    #[test]
    fn empty_stats_do_not_divide_by_zero() {
        let stats = RunStats::new();
        let totals = stats.summarize();
        assert_eq!(totals.ops, 0);
        assert_eq!(totals.latency_ms, 0.0);
    }

    #[test]
    fn aggregate_average_divides_each_field_by_client_count() {
        let mut a = Totals::default();
        a.ops_sec = 100.0;
        let mut b = Totals::default();
        b.ops_sec = 300.0;
        let avg = aggregate_average(&[a, b]);
        assert_eq!(avg.ops_sec, 200.0);
    }
}
