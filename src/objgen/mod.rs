//! Deterministic key/value generation, §4.A.
//!
//! Grounded on `obj_gen.cpp`'s `object_generator`/`gaussian_noise`: the
//! polar Box-Muller rejection sampler and the per-kind sequential cursors
//! are carried over faithfully. Zipf has no literal counterpart in the
//! original generator (that codebase predates it); it's built the way the
//! retrieval pack's own Zipfian load generators do, via `zipf::ZipfDistribution`.

use rand::distributions::Distribution as _;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use zipf::ZipfDistribution;

use crate::config::{Config, KeyDistribution, SizePolicy};
use crate::errors::ConfigError;

/// Which cursor/strategy a single `get_key`/`get_object` call should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IteratorKind {
    SetSeq,
    GetSeq,
    UniformRandom,
    Gaussian,
    Zipf,
}

/// One generated key/value/expiry triple.
#[derive(Debug, Clone)]
pub struct Object {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub expiry: u32,
}

/// Per-kind sequential cursor, wrapping within `[key_min, key_max]`.
#[derive(Debug, Clone, Copy, Default)]
struct SeqCursor {
    next: u64,
}

pub struct ObjectGenerator {
    key_prefix: String,
    key_min: u64,
    key_max: u64,
    distribution: KeyDistribution,
    data_size: SizePolicy,
    expiry_min: u32,
    expiry_max: u32,
    random_data: bool,

    set_cursor: SeqCursor,
    get_cursor: SeqCursor,

    rng: StdRng,
    zipf: Option<ZipfDistribution>,

    value_buffer: Vec<u8>,
    value_mutation_pos: usize,

    seed: u64,
}

impl ObjectGenerator {
    pub fn from_config(cfg: &Config, client_index: u32) -> Result<Self, ConfigError> {
        if cfg.key_range.min >= cfg.key_range.max {
            return Err(ConfigError::EmptyKeyRange {
                min: cfg.key_range.min,
                max: cfg.key_range.max,
            });
        }

        let seed = if cfg.distinct_client_seed {
            cfg.random_seed.wrapping_add(client_index as u64)
        } else {
            cfg.random_seed
        };

        let span = (cfg.key_range.max - cfg.key_range.min + 1) as usize;
        let zipf = match &cfg.key_distribution {
            KeyDistribution::Zipf { s } => Some(
                ZipfDistribution::new(span.max(1), *s)
                    .map_err(|_| ConfigError::Other("invalid zipf exponent".into()))?,
            ),
            _ => None,
        };

        let largest_value = cfg.data_size.largest().max(1) as usize;

        Ok(Self {
            key_prefix: cfg.key_prefix.clone(),
            key_min: cfg.key_range.min,
            key_max: cfg.key_range.max,
            distribution: cfg.key_distribution.clone(),
            data_size: cfg.data_size.clone(),
            expiry_min: cfg.expiry_range.min as u32,
            expiry_max: cfg.expiry_range.max as u32,
            random_data: true,
            set_cursor: SeqCursor { next: cfg.key_range.min },
            get_cursor: SeqCursor { next: cfg.key_range.min },
            rng: StdRng::seed_from_u64(seed),
            zipf,
            value_buffer: vec![b'x'; largest_value],
            value_mutation_pos: 0,
            seed,
        })
    }

    /// Assign this generator a disjoint `[min, max]` sub-range, used by
    /// the Parallel key distribution so each client owns a contiguous
    /// slice of the key space (§8 property 7).
    pub fn restrict_range(&mut self, min: u64, max: u64) {
        self.key_min = min;
        self.key_max = max;
        self.set_cursor.next = min;
        self.get_cursor.next = min;
    }

    pub fn clone_independent(&self, client_index: u32, distinct_seed: bool) -> Self {
        let seed = if distinct_seed {
            self.seed.wrapping_add(client_index as u64)
        } else {
            self.seed
        };
        Self {
            key_prefix: self.key_prefix.clone(),
            key_min: self.key_min,
            key_max: self.key_max,
            distribution: self.distribution.clone(),
            data_size: self.data_size.clone(),
            expiry_min: self.expiry_min,
            expiry_max: self.expiry_max,
            random_data: self.random_data,
            set_cursor: self.set_cursor,
            get_cursor: self.get_cursor,
            rng: StdRng::seed_from_u64(seed),
            zipf: self.zipf.clone(),
            value_buffer: self.value_buffer.clone(),
            value_mutation_pos: 0,
            seed,
        }
    }

    fn format_key(&self, index: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.key_prefix.len() + 20);
        key.extend_from_slice(self.key_prefix.as_bytes());
        key.extend_from_slice(index.to_string().as_bytes());
        key
    }

    fn advance_seq(cursor: &mut SeqCursor, min: u64, max: u64) -> u64 {
        let idx = cursor.next;
        cursor.next = if cursor.next >= max { min } else { cursor.next + 1 };
        idx
    }

    /// Uniform `u64` in `[min, max]` inclusive.
    pub fn random_range(&mut self, min: u64, max: u64) -> u64 {
        if min >= max {
            return min;
        }
        self.rng.gen_range(min..=max)
    }

    /// Polar Box-Muller, rejecting samples outside `[min, max]`.
    pub fn gaussian(&mut self, min: u64, max: u64, stddev: f64, median: f64) -> u64 {
        loop {
            let (mut u, mut v, mut s);
            loop {
                u = self.rng.gen::<f64>() * 2.0 - 1.0;
                v = self.rng.gen::<f64>() * 2.0 - 1.0;
                s = u * u + v * v;
                if s < 1.0 && s != 0.0 {
                    break;
                }
            }
            let mul = (-2.0 * s.ln() / s).sqrt();
            let val = median + u * mul * stddev;
            if val >= min as f64 && val <= max as f64 {
                return val.round() as u64;
            }
        }
    }

    fn zipf_index(&mut self) -> u64 {
        let rank = match &mut self.zipf {
            Some(z) => z.sample(&mut self.rng) as u64,
            None => 0,
        };
        self.key_min + rank.min(self.key_max - self.key_min)
    }

    fn key_index(&mut self, iter: IteratorKind) -> u64 {
        match iter {
            IteratorKind::SetSeq => Self::advance_seq(&mut self.set_cursor, self.key_min, self.key_max),
            IteratorKind::GetSeq => Self::advance_seq(&mut self.get_cursor, self.key_min, self.key_max),
            IteratorKind::UniformRandom => self.random_range(self.key_min, self.key_max),
            IteratorKind::Gaussian => {
                if let KeyDistribution::Gaussian { stddev, median } = self.distribution {
                    self.gaussian(self.key_min, self.key_max, stddev, median)
                } else {
                    self.random_range(self.key_min, self.key_max)
                }
            }
            IteratorKind::Zipf => self.zipf_index(),
        }
    }

    pub fn get_key(&mut self, iter: IteratorKind) -> (Vec<u8>, u64) {
        let idx = self.key_index(iter);
        (self.format_key(idx), idx)
    }

    fn size_for(&mut self, key_index: u64) -> usize {
        match &self.data_size {
            SizePolicy::Fixed(v) => *v as usize,
            SizePolicy::Range(min, max) => self.rng.gen_range(*min..=*max) as usize,
            SizePolicy::Weighted(list) => {
                let total: u32 = list.items.iter().map(|(_, w)| *w).sum();
                let mut pick = self.rng.gen_range(0..total.max(1));
                for (size, weight) in &list.items {
                    if pick < *weight {
                        return *size as usize;
                    }
                    pick -= *weight;
                }
                list.items.last().map(|(s, _)| *s as usize).unwrap_or(1)
            }
            SizePolicy::Sweep(min, max) => {
                let span = (self.key_max - self.key_min).max(1);
                let frac = (key_index.saturating_sub(self.key_min)) as f64 / span as f64;
                (*min as f64 + frac * (*max as f64 - *min as f64)).round() as usize
            }
        }
        .max(1)
    }

    fn value_for(&mut self, size: usize) -> Vec<u8> {
        if size > self.value_buffer.len() {
            self.value_buffer.resize(size, b'x');
        }
        if self.random_data {
            let pos = self.value_mutation_pos % self.value_buffer.len().max(1);
            self.value_buffer[pos] = self.rng.gen::<u8>();
            self.value_mutation_pos = self.value_mutation_pos.wrapping_add(1);
        }
        self.value_buffer[..size].to_vec()
    }

    pub fn get_object(&mut self, iter: IteratorKind) -> Object {
        let (key, idx) = self.get_key(iter);
        let size = self.size_for(idx);
        let value = self.value_for(size);
        let expiry = if self.expiry_max > 0 {
            self.rng.gen_range(self.expiry_min..=self.expiry_max)
        } else {
            0
        };
        Object { key, value, expiry }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigRange;

    fn base_config() -> Config {
        let args = crate::config::CliArgs {
            uri: None,
            host: "127.0.0.1".into(),
            port: 6379,
            unix_socket: None,
            protocol: crate::config::Protocol::Resp2,
            tls: false,
            cert: None,
            key: None,
            cacert: None,
            sni: None,
            threads: 1,
            clients_per_thread: 1,
            pipeline: 1,
            requests: Some(10),
            test_time_secs: None,
            ratio: "1:1".into(),
            wait_ratio: "0:0".into(),
            wait_slaves: "0:0".into(),
            wait_timeout: "0:0".into(),
            key_prefix: "key:".into(),
            key_range: "0:9".into(),
            key_distribution: "sequential".into(),
            data_size: 8,
            data_size_range: None,
            data_size_list: None,
            random_data: false,
            expiry_range: "0:0".into(),
            rate_limit: None,
            reconnect_interval: None,
            reconnect_on_error: false,
            reconnect_backoff_factor: 1.0,
            max_reconnect_attempts: 0,
            connect_timeout_secs: None,
            arbitrary_commands: vec![],
            cluster_mode: false,
            scan_incremental: false,
            multi_key_get: None,
            auth: None,
            select_db: 0,
            distinct_client_seed: false,
            random_seed: 1,
            verify: false,
            csv: None,
            json_out: None,
            hdr_log: None,
            statsd: None,
            graphite: None,
        };
        args.into_config().unwrap()
    }

    #[test]
    fn sequential_wraps_within_range() {
        let cfg = base_config();
        let mut gen = ObjectGenerator::from_config(&cfg, 0).unwrap();
        let mut seen = Vec::new();
        for _ in 0..12 {
            let (_, idx) = gen.get_key(IteratorKind::SetSeq);
            seen.push(idx);
        }
        assert_eq!(&seen[0..10], &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert_eq!(seen[10], 0);
        assert_eq!(seen[11], 1);
    }

    #[test]
    fn key_formatting_uses_prefix_and_decimal_index() {
        let cfg = base_config();
        let mut gen = ObjectGenerator::from_config(&cfg, 0).unwrap();
        let (key, idx) = gen.get_key(IteratorKind::SetSeq);
        assert_eq!(key, format!("key:{idx}").into_bytes());
    }

    #[test]
    fn uniform_stays_in_range() {
        let cfg = base_config();
        let mut gen = ObjectGenerator::from_config(&cfg, 0).unwrap();
        for _ in 0..500 {
            let v = gen.random_range(cfg.key_range.min, cfg.key_range.max);
            assert!(v >= cfg.key_range.min && v <= cfg.key_range.max);
        }
    }

    #[test]
    fn gaussian_rejects_out_of_range() {
        let cfg = base_config();
        let mut gen = ObjectGenerator::from_config(&cfg, 0).unwrap();
        for _ in 0..500 {
            let v = gen.gaussian(0, 9, 2.0, 5.0);
            assert!(v <= 9);
        }
    }

    #[test]
    fn empty_key_range_is_rejected() {
        let mut args_cfg = base_config();
        args_cfg.key_range = ConfigRange { min: 5, max: 5 };
        assert!(ObjectGenerator::from_config(&args_cfg, 0).is_err());
    }

    #[test]
    fn parallel_restrict_range_confines_cursor() {
        let cfg = base_config();
        let mut gen = ObjectGenerator::from_config(&cfg, 0).unwrap();
        gen.restrict_range(3, 5);
        let mut seen = Vec::new();
        for _ in 0..6 {
            let (_, idx) = gen.get_key(IteratorKind::SetSeq);
            seen.push(idx);
        }
        assert_eq!(seen, vec![3, 4, 5, 3, 4, 5]);
    }

    #[test]
    fn weighted_size_picks_from_list_only() {
        let mut cfg = base_config();
        cfg.data_size = SizePolicy::Weighted(crate::config::WeightList {
            items: vec![(16, 1), (64, 1)],
        });
        let mut gen = ObjectGenerator::from_config(&cfg, 0).unwrap();
        for _ in 0..50 {
            let obj = gen.get_object(IteratorKind::SetSeq);
            assert!(obj.value.len() == 16 || obj.value.len() == 64);
        }
    }
}
