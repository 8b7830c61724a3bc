//! A client drives one OS-thread-local group of connections: it decides
//! what request goes out next (the SET:GET:WAIT ratio mix), and folds
//! every response into `RunStats`. Grounded on `client.h`/`client.cpp`'s
//! `client`/`verify_client`. `connections_manager`'s virtual interface
//! doesn't become a Rust trait object — the only two implementations
//! (plain and cluster-aware) are modeled as `Client` plus `ClusterClient`
//! wrapping it, matching the closed-enum choice already made for
//! `Protocol` (§REDESIGN FLAGS).

use std::time::{Duration, Instant};

use crate::config::Config;
use crate::connection::{Connection, PendingRequest, RequestType};
use crate::errors::EngineError;
use crate::objgen::{IteratorKind, Object, ObjectGenerator};
use crate::protocol::{CompiledCommand, ParsedResponse};
use crate::stats::RunStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientMode {
    Load,
    Verify,
}

pub(crate) fn set_iter_kind(cfg: &Config) -> IteratorKind {
    use crate::config::KeyDistribution::*;
    match cfg.key_distribution {
        Uniform => IteratorKind::UniformRandom,
        Gaussian { .. } => IteratorKind::Gaussian,
        Zipf { .. } => IteratorKind::Zipf,
        Sequential | Parallel => IteratorKind::SetSeq,
    }
}

pub(crate) fn get_iter_kind(cfg: &Config) -> IteratorKind {
    use crate::config::KeyDistribution::*;
    match cfg.key_distribution {
        Uniform => IteratorKind::UniformRandom,
        Gaussian { .. } => IteratorKind::Gaussian,
        Zipf { .. } => IteratorKind::Zipf,
        Sequential | Parallel => IteratorKind::GetSeq,
    }
}

/// Which kind of request the SET:GET:WAIT ratio mix says comes next.
/// `None` means the ratio counters just rolled over and produced
/// nothing this call — the caller retries immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Set,
    Get,
    Wait,
    None,
}

/// One outstanding verify-mode comparison: the key/value the generator
/// produced when the matching SET would have been issued.
#[derive(Debug, Clone)]
struct PendingVerify {
    key: Vec<u8>,
    expected: Vec<u8>,
}

pub struct Client {
    pub connections: Vec<Connection>,
    pub obj_gen: ObjectGenerator,
    pub config: std::sync::Arc<Config>,
    pub stats: RunStats,
    pub arbitrary: Vec<CompiledCommand>,

    mode: ClientMode,
    set_ratio_count: u32,
    get_ratio_count: u32,
    tot_set_ops: u64,
    tot_wait_ops: u64,

    reqs_generated: u64,
    reqs_processed: u64,

    verified_keys: u64,
    errors: u64,
    verify_inflight: std::collections::VecDeque<PendingVerify>,
    finished_override: bool,
}

impl Client {
    pub fn new(
        connections: Vec<Connection>,
        obj_gen: ObjectGenerator,
        config: std::sync::Arc<Config>,
        arbitrary: Vec<CompiledCommand>,
        mode: ClientMode,
    ) -> Self {
        Self {
            connections,
            obj_gen,
            config,
            stats: RunStats::new(),
            arbitrary,
            mode,
            set_ratio_count: 0,
            get_ratio_count: 0,
            tot_set_ops: 0,
            tot_wait_ops: 0,
            reqs_generated: 0,
            reqs_processed: 0,
            verified_keys: 0,
            errors: 0,
            verify_inflight: std::collections::VecDeque::new(),
            finished_override: false,
        }
    }

    pub fn reqs_generated(&self) -> u64 {
        self.reqs_generated
    }

    pub fn reqs_processed(&self) -> u64 {
        self.reqs_processed
    }

    pub fn verified_keys(&self) -> u64 {
        self.verified_keys
    }

    pub fn mode(&self) -> ClientMode {
        self.mode
    }

    /// Bumps the generated-request counter without sending anything.
    /// Used by callers (the cluster routing layer) that build and push
    /// the request onto a connection themselves.
    pub fn note_request_generated(&mut self) {
        self.reqs_generated += 1;
    }

    /// Records a verify-mode SET's key/value so the matching GET can be
    /// checked against it later. Used by callers that issue the SET
    /// themselves instead of going through `create_request`.
    pub fn record_verify_expectation(&mut self, key: Vec<u8>, expected: Vec<u8>) {
        self.verify_inflight.push_back(PendingVerify { key, expected });
    }

    pub fn verify_errors(&self) -> u64 {
        self.errors
    }

    pub fn finished(&self) -> bool {
        if self.finished_override {
            return true;
        }
        match self.config.requests {
            Some(n) => self.reqs_processed >= n,
            None => false,
        }
    }

    pub fn set_start_time(&mut self) {
        if self.stats.start_time().is_none() {
            self.stats.set_start_time(Instant::now());
        }
    }

    pub fn set_end_time(&mut self) {
        self.stats.set_end_time(Instant::now());
    }

    /// Forces `finished()` true immediately, regardless of `--requests`/
    /// `--test-time`. Used by Ctrl-C handling to stop every client's
    /// event loop without waiting for its normal completion condition.
    pub fn interrupt(&mut self) {
        self.finished_override = true;
        self.set_end_time();
    }

    /// Don't exceed `--requests`: a connection with nothing left to send
    /// and nothing pending can be retired.
    pub fn hold_pipeline(&self, conn_id: usize) -> bool {
        if let Some(n) = self.config.requests {
            if self.reqs_generated >= n && self.connections[conn_id].pipeline_len() == 0 {
                return true;
            }
        }
        if let Some(interval) = self.config.reconnect_interval {
            if interval > 0 && self.connections[conn_id].reqs_since_connect() >= interval - 1 {
                return true;
            }
        }
        if self.config.rate_limit.is_some() && self.connections[conn_id].request_tokens == 0 {
            return true;
        }
        false
    }

    /// Advances the SET:GET:WAIT ratio counters and returns which kind
    /// of request comes next, without generating or sending anything.
    /// Split out of `create_request` so the cluster routing layer can
    /// reuse the same ratio mix while picking its own key/connection.
    pub fn next_op_kind(&mut self, cfg: &Config) -> OpKind {
        if cfg.wait_ratio.b != 0
            && (self.tot_wait_ops == 0
                || (self.tot_set_ops / self.tot_wait_ops.max(1)) as f64
                    > (cfg.wait_ratio.a as f64 / cfg.wait_ratio.b as f64))
        {
            self.tot_wait_ops += 1;
            return OpKind::Wait;
        }

        if self.set_ratio_count < cfg.ratio.a {
            self.set_ratio_count += 1;
            self.tot_set_ops += 1;
            return OpKind::Set;
        }

        if self.get_ratio_count < cfg.ratio.b {
            return OpKind::Get;
        }

        self.set_ratio_count = 0;
        self.get_ratio_count = 0;
        OpKind::None
    }

    /// Generates and sends the next request for `conn_id`, per the
    /// wait/set/get ratio mix. A no-op when the ratio counters have
    /// nothing left for this round (caller overlaps them and retries).
    pub fn create_request(&mut self, conn_id: usize) {
        let cfg = self.config.clone();
        match self.next_op_kind(&cfg) {
            OpKind::Wait => {
                let num_slaves = self.obj_gen.random_range(cfg.wait_slaves.min, cfg.wait_slaves.max) as u32;
                let median = ((cfg.wait_timeout_ms.max as f64 - cfg.wait_timeout_ms.min as f64) / 2.0)
                    + cfg.wait_timeout_ms.min as f64;
                let timeout = if let crate::config::KeyDistribution::Gaussian { stddev, .. } = cfg.key_distribution {
                    self.obj_gen.gaussian(cfg.wait_timeout_ms.min, cfg.wait_timeout_ms.max, stddev, median) as u32
                } else {
                    self.obj_gen.random_range(cfg.wait_timeout_ms.min, cfg.wait_timeout_ms.max) as u32
                };
                if self.connections[conn_id].send_wait(num_slaves, timeout).is_ok() {
                    self.reqs_generated += 1;
                }
            }
            OpKind::Set => self.create_set_or_verify_get(conn_id, &cfg),
            OpKind::Get => self.create_get(conn_id, &cfg),
            OpKind::None => {}
        }
    }

    fn create_set_or_verify_get(&mut self, conn_id: usize, cfg: &Config) {
        let obj: Object = self.obj_gen.get_object(set_iter_kind(cfg));
        match self.mode {
            ClientMode::Load => {
                self.connections[conn_id].send_set(&obj.key, &obj.value, obj.expiry);
                self.reqs_generated += 1;
            }
            ClientMode::Verify => {
                self.verify_inflight.push_back(PendingVerify { key: obj.key.clone(), expected: obj.value });
                self.connections[conn_id].send_get(&obj.key);
                self.reqs_generated += 1;
            }
        }
    }

    fn create_get(&mut self, conn_id: usize, cfg: &Config) {
        let iter = get_iter_kind(cfg);
        if let Some(n) = cfg.multi_key_get {
            let remaining = cfg.ratio.b - self.get_ratio_count;
            let keys_count = remaining.min(n);
            let keys: Vec<Vec<u8>> = (0..keys_count).map(|_| self.obj_gen.get_key(iter).0).collect();
            match self.mode {
                ClientMode::Load => {
                    self.send_multi_get(conn_id, &keys);
                }
                ClientMode::Verify => {
                    self.reqs_processed += 1;
                }
            }
            self.get_ratio_count += keys_count;
        } else {
            let (key, _) = self.obj_gen.get_key(iter);
            match self.mode {
                ClientMode::Load => {
                    self.connections[conn_id].send_get(&key);
                    self.reqs_generated += 1;
                }
                ClientMode::Verify => {
                    self.reqs_processed += 1;
                }
            }
            self.get_ratio_count += 1;
        }
    }

    fn send_multi_get(&mut self, conn_id: usize, keys: &[Vec<u8>]) {
        let conn = &mut self.connections[conn_id];
        let before = conn.write_buf_len();
        let (protocol, write_buf) = conn.protocol_and_write_buf_mut();
        if protocol.encode_multi_get(write_buf, keys).is_ok() {
            let size = conn.write_buf_len() - before;
            conn.push_external_req(RequestType::Get, size, keys.len() as u32);
            self.reqs_generated += 1;
        }
    }

    pub fn create_arbitrary_request(&mut self, command_index: usize, conn_id: usize) {
        let cmd = &self.arbitrary[command_index];
        let key_count = cmd.args.iter().filter(|a| matches!(a, crate::protocol::ArgKind::Key)).count() as u32;
        let (key, _) = if key_count > 0 {
            self.obj_gen.get_key(set_iter_kind(&self.config))
        } else {
            (Vec::new(), 0)
        };
        let data = if cmd.args.iter().any(|a| matches!(a, crate::protocol::ArgKind::Data)) {
            self.obj_gen.get_object(set_iter_kind(&self.config)).value
        } else {
            Vec::new()
        };
        self.connections[conn_id].send_arbitrary(command_index, cmd, &key, &data, key_count);
        self.reqs_generated += 1;
    }

    /// Folds one completed response into stats (load mode) or the
    /// verify comparison (verify mode).
    pub fn handle_response(&mut self, _conn_id: usize, now: Instant, req: &PendingRequest, resp: &ParsedResponse) {
        let latency = now.saturating_duration_since(req.sent_time);
        let latency_us = latency.as_micros() as u64;
        let total_len = (req.size + resp.total_len) as u64;
        let test_elapsed = match self.stats.start_time() {
            Some(start) => now.saturating_duration_since(start),
            None => Duration::ZERO,
        };

        match self.mode {
            ClientMode::Verify if req.kind == RequestType::Get => {
                self.reqs_processed += 1;
                let Some(expected) = self.verify_inflight.pop_front() else { return };
                if resp.is_error || resp.value.as_deref() != Some(expected.expected.as_slice()) {
                    self.errors += 1;
                } else {
                    self.verified_keys += 1;
                }
                let _ = expected.key;
            }
            _ => match req.kind {
                RequestType::Get => {
                    let hits = resp.hits as u64;
                    let misses = (req.keys as u64).saturating_sub(hits);
                    self.stats.update_get_op(test_elapsed, total_len, latency_us, hits, misses);
                    self.reqs_processed += 1;
                }
                RequestType::Set => {
                    self.stats.update_set_op(test_elapsed, total_len, latency_us);
                    self.reqs_processed += 1;
                }
                RequestType::Wait => {
                    self.stats.update_wait_op(test_elapsed, latency_us);
                    self.reqs_processed += 1;
                }
                RequestType::Arbitrary(_) => {
                    self.reqs_processed += 1;
                }
                _ => {}
            },
        }
    }

    /// Drives one connection's setup/fill/flush/read/process cycle once.
    /// Returns once there is nothing further this connection can do
    /// without waiting on the network (mirrors `fill_pipeline` + the
    /// read-ready branch of `handle_event`).
    pub async fn pump_connection(&mut self, conn_id: usize) -> Result<(), EngineError> {
        self.fill_pipeline(conn_id)?;
        self.connections[conn_id].flush().await?;
        Ok(())
    }

    pub fn fill_pipeline(&mut self, conn_id: usize) -> Result<(), EngineError> {
        let pipeline_cap = self.config.pipeline as usize;
        loop {
            if self.finished() {
                break;
            }
            if self.connections[conn_id].pipeline_len() >= pipeline_cap {
                break;
            }
            if !self.connections[conn_id].is_setup_done() {
                self.connections[conn_id].queue_setup_commands(&self.config)?;
                break;
            }
            if self.hold_pipeline(conn_id) {
                break;
            }
            if self.config.arbitrary_commands.is_empty() {
                self.create_request(conn_id);
            } else {
                let idx = (self.reqs_generated as usize) % self.arbitrary.len();
                self.create_arbitrary_request(idx, conn_id);
            }
        }
        Ok(())
    }

    /// Processes whatever responses are already buffered for `conn_id`,
    /// then triggers a reconnect if `reconnect_interval` says it's time
    /// (mirrors `process_response`'s tail).
    pub fn process_connection(&mut self, conn_id: usize) -> Result<bool, EngineError> {
        let completed = self.connections[conn_id].process_responses()?;
        let now = Instant::now();
        let mut any_handled = false;
        for (req, resp) in completed {
            if matches!(req.kind, RequestType::ClusterSlots) {
                continue;
            }
            self.handle_response(conn_id, now, &req, &resp);
            any_handled = true;
        }

        if let Some(interval) = self.config.reconnect_interval {
            if interval > 0 && any_handled && self.connections[conn_id].resps_since_connect() >= interval {
                return Ok(true);
            }
        }
        if self.finished() {
            self.set_end_time();
        }
        Ok(false)
    }
}
