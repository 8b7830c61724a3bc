//! Token-bucket request throttling, §4.G. Grounded on `rate_limiter.h`'s
//! fixed-frequency token bucket: instead of handing out one token per
//! request at an arbitrary rate, the bucket refills at a constant 50 Hz
//! and each refill grants enough tokens to average out to the requested
//! rate over one second.

use std::time::{Duration, Instant};

const REFILL_HZ: u64 = 50;

/// Per-connection token bucket. `Connection::request_tokens` is the
/// balance; `fill_pipeline` only generates a request while tokens remain
/// (wired in by the caller, not by this type), and `tick` tops the
/// balance back up once per refill interval.
pub struct RateLimiter {
    requests_per_interval: u32,
    interval: Duration,
    next_refill: Instant,
}

impl RateLimiter {
    /// `rate` is the target requests/sec for the connection this bucket
    /// governs. Per §4.G: `requests_per_interval = ceil(rate / 50)`,
    /// and the refill interval shrinks to match so the achieved rate
    /// still averages out to `rate` even though only whole tokens are
    /// granted per tick.
    pub fn new(rate: u64, now: Instant) -> Self {
        let rate = rate.max(1);
        let requests_per_interval = ((rate + REFILL_HZ - 1) / REFILL_HZ) as u32;
        let ticks_per_sec = rate as f64 / requests_per_interval as f64;
        let interval_us = 1_000_000.0 / ticks_per_sec;
        Self {
            requests_per_interval,
            interval: Duration::from_micros(interval_us.round() as u64),
            next_refill: now,
        }
    }

    /// Grants `requests_per_interval` tokens onto `balance` for every
    /// refill interval that has elapsed since the last call, without
    /// letting the balance run away during a stall (e.g. the worker
    /// thread was blocked on I/O for several interval lengths).
    pub fn tick(&mut self, now: Instant, balance: &mut u32) {
        while now >= self.next_refill {
            *balance = balance.saturating_add(self.requests_per_interval);
            self.next_refill += self.interval;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_per_interval_rounds_up_to_whole_tokens() {
        let now = Instant::now();
        let limiter = RateLimiter::new(120, now);
        assert_eq!(limiter.requests_per_interval, 3);
    }

    #[test]
    fn single_low_rate_still_grants_one_token_per_interval() {
        let now = Instant::now();
        let limiter = RateLimiter::new(10, now);
        assert_eq!(limiter.requests_per_interval, 1);
    }

    #[test]
    fn tick_grants_tokens_once_interval_elapses() {
        let now = Instant::now();
        let mut limiter = RateLimiter::new(100, now);
        let mut balance = 0u32;
        limiter.tick(now, &mut balance);
        assert_eq!(balance, 0);
        let later = now + limiter.interval + Duration::from_micros(1);
        limiter.tick(later, &mut balance);
        assert_eq!(balance, limiter.requests_per_interval);
    }

    #[test]
    fn tick_catches_up_after_a_long_stall() {
        let now = Instant::now();
        let mut limiter = RateLimiter::new(100, now);
        let mut balance = 0u32;
        let stalled = now + limiter.interval * 5;
        limiter.tick(stalled, &mut balance);
        assert_eq!(balance, limiter.requests_per_interval * 5);
    }
}
