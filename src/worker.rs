//! Worker thread / client group, §4.F. Grounded on `client.cpp`'s
//! per-thread `event_base` loop: this crate gives every worker OS thread
//! its own single-threaded Tokio runtime instead of a libevent base, and
//! generalizes "one connection per thread" to "`clients_per_thread`
//! clients per thread", each owning its own shard connection(s).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::select_all;
use tokio_rustls::TlsConnector;

use crate::client::{Client, ClientMode};
use crate::cluster::ClusterClient;
use crate::config::{Config, KeyDistribution};
use crate::connection::{protocol_for_config, Connection};
use crate::errors::EngineError;
use crate::objgen::ObjectGenerator;
use crate::protocol::CompiledCommand;
use crate::rate_limiter::RateLimiter;
use crate::stats::RunStats;

/// How many times the main thread lets a worker's client group rebuild
/// itself from scratch after its event loop breaks, §4.I/§7.
pub const MAX_THREAD_RESTARTS: u32 = 5;

const TICK_INTERVAL: Duration = Duration::from_millis(20);

/// Approximate, unsynchronized op counter the main thread polls for the
/// live progress line, §4.F. Never consulted for final results — those
/// come from the `RunStats` each thread hands back on join.
#[derive(Default)]
pub struct Progress {
    ops: AtomicU64,
}

impl Progress {
    pub fn ops(&self) -> u64 {
        self.ops.load(Ordering::Relaxed)
    }
}

pub struct WorkerOutcome {
    pub stats: RunStats,
    pub reqs_processed: u64,
    pub verified_keys: u64,
    pub verify_errors: u64,
    pub restarts: u32,
    /// Set when the client group exhausted its restart budget without
    /// ever completing cleanly — the run as a whole should exit non-zero.
    pub fatal: bool,
}

/// Spawns one worker OS thread running its own current-thread Tokio
/// runtime. `thread_index` identifies this thread for per-client key
/// range partitioning and log context.
pub fn spawn(
    thread_index: u32,
    config: Arc<Config>,
    tls_connector: Option<Arc<TlsConnector>>,
    arbitrary: Arc<Vec<CompiledCommand>>,
    interrupt: Arc<AtomicBool>,
    progress: Arc<Progress>,
) -> std::thread::JoinHandle<WorkerOutcome> {
    std::thread::Builder::new()
        .name(format!("rrb-worker-{thread_index}"))
        .spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build worker runtime");
            rt.block_on(run_with_restarts(thread_index, config, tls_connector, arbitrary, interrupt, progress))
        })
        .expect("failed to spawn worker thread")
}

async fn run_with_restarts(
    thread_index: u32,
    config: Arc<Config>,
    tls_connector: Option<Arc<TlsConnector>>,
    arbitrary: Arc<Vec<CompiledCommand>>,
    interrupt: Arc<AtomicBool>,
    progress: Arc<Progress>,
) -> WorkerOutcome {
    let mut restarts = 0u32;
    loop {
        match run_once(thread_index, &config, tls_connector.as_ref(), &arbitrary, &interrupt, &progress).await {
            Ok(outcome) => return outcome,
            Err(e) => {
                if interrupt.load(Ordering::Relaxed) {
                    tracing::debug!(thread = thread_index, error = %e, "worker loop broke during shutdown");
                    return WorkerOutcome {
                        stats: RunStats::new(),
                        reqs_processed: 0,
                        verified_keys: 0,
                        verify_errors: 0,
                        restarts,
                        fatal: false,
                    };
                }
                restarts += 1;
                tracing::warn!(thread = thread_index, error = %e, restarts, "worker event loop broke, rebuilding client group");
                if restarts > MAX_THREAD_RESTARTS {
                    tracing::error!(thread = thread_index, "exhausted restart budget, giving up on this thread");
                    return WorkerOutcome {
                        stats: RunStats::new(),
                        reqs_processed: 0,
                        verified_keys: 0,
                        verify_errors: 0,
                        restarts,
                        fatal: true,
                    };
                }
            }
        }
    }
}

async fn run_once(
    thread_index: u32,
    config: &Arc<Config>,
    tls_connector: Option<&Arc<TlsConnector>>,
    arbitrary: &Arc<Vec<CompiledCommand>>,
    interrupt: &Arc<AtomicBool>,
    progress: &Arc<Progress>,
) -> Result<WorkerOutcome, EngineError> {
    let mut clients = Vec::with_capacity(config.clients_per_thread as usize);
    for local_index in 0..config.clients_per_thread {
        let client_index = thread_index * config.clients_per_thread + local_index;
        clients.push(build_client(client_index, config, tls_connector, arbitrary.as_ref().clone()).await?);
    }

    let results = futures::future::join_all(
        clients.into_iter().map(|client| run_client(client, config.clone(), interrupt.clone(), progress.clone())),
    )
    .await;

    let mut merged = RunStats::new();
    let mut reqs_processed = 0u64;
    let mut verified_keys = 0u64;
    let mut verify_errors = 0u64;
    for result in results {
        let (stats, processed, keys, errors) = result?;
        merged.merge(&stats);
        reqs_processed += processed;
        verified_keys += keys;
        verify_errors += errors;
    }

    Ok(WorkerOutcome { stats: merged, reqs_processed, verified_keys, verify_errors, restarts: 0, fatal: false })
}

/// A plain `Client` or a `ClusterClient` wrapping one, unified behind the
/// handful of operations the event loop drives. Kept as an enum rather
/// than a shared trait for the same reason `Protocol` is (§REDESIGN
/// FLAGS) — exactly two implementations, known at compile time, with
/// genuinely different `process_connection` signatures.
enum ClientKind {
    Plain(Client),
    Cluster(ClusterClient),
}

impl ClientKind {
    fn num_connections(&self) -> usize {
        match self {
            ClientKind::Plain(c) => c.connections.len(),
            ClientKind::Cluster(c) => c.client.connections.len(),
        }
    }

    fn finished(&self) -> bool {
        match self {
            ClientKind::Plain(c) => c.finished(),
            ClientKind::Cluster(c) => c.client.finished(),
        }
    }

    fn set_start_time(&mut self) {
        match self {
            ClientKind::Plain(c) => c.set_start_time(),
            ClientKind::Cluster(c) => c.client.set_start_time(),
        }
    }

    fn interrupt(&mut self) {
        match self {
            ClientKind::Plain(c) => c.interrupt(),
            ClientKind::Cluster(c) => c.client.interrupt(),
        }
    }

    async fn pump(&mut self, conn_id: usize) -> Result<(), EngineError> {
        match self {
            ClientKind::Plain(c) => c.pump_connection(conn_id).await,
            ClientKind::Cluster(c) => c.pump_connection(conn_id).await,
        }
    }

    /// Processes whatever responses are buffered for `conn_id`. Returns
    /// `true` when `reconnect_interval` says this connection should now
    /// gracefully reconnect — a cluster client never does, since cluster
    /// mode rejects that flag up front.
    async fn process(&mut self, conn_id: usize) -> Result<bool, EngineError> {
        match self {
            ClientKind::Plain(c) => c.process_connection(conn_id),
            ClientKind::Cluster(c) => c.process_connection(conn_id).await.map(|_| false),
        }
    }

    async fn wait_readable(&self, conn_id: usize) -> Result<(), EngineError> {
        match self {
            ClientKind::Plain(c) => c.connections[conn_id].wait_readable().await,
            ClientKind::Cluster(c) => c.client.connections[conn_id].wait_readable().await,
        }
    }

    fn connection(&self, conn_id: usize) -> &Connection {
        match self {
            ClientKind::Plain(c) => &c.connections[conn_id],
            ClientKind::Cluster(c) => &c.client.connections[conn_id],
        }
    }

    fn connection_mut(&mut self, conn_id: usize) -> &mut Connection {
        match self {
            ClientKind::Plain(c) => &mut c.connections[conn_id],
            ClientKind::Cluster(c) => &mut c.client.connections[conn_id],
        }
    }

    fn reqs_processed(&self) -> u64 {
        match self {
            ClientKind::Plain(c) => c.reqs_processed(),
            ClientKind::Cluster(c) => c.client.reqs_processed(),
        }
    }

    fn verified_keys(&self) -> u64 {
        match self {
            ClientKind::Plain(c) => c.verified_keys(),
            ClientKind::Cluster(c) => c.client.verified_keys(),
        }
    }

    fn verify_errors(&self) -> u64 {
        match self {
            ClientKind::Plain(c) => c.verify_errors(),
            ClientKind::Cluster(c) => c.client.verify_errors(),
        }
    }

    fn into_stats(self) -> RunStats {
        match self {
            ClientKind::Plain(c) => c.stats,
            ClientKind::Cluster(c) => c.client.stats,
        }
    }
}

/// Builds one client's object generator, shard connection and (if
/// `--cluster-mode`) cluster wrapper, then performs the initial
/// `connect()` — `prepare()` in §4.F's terms.
async fn build_client(
    client_index: u32,
    config: &Arc<Config>,
    tls_connector: Option<&Arc<TlsConnector>>,
    arbitrary: Vec<CompiledCommand>,
) -> Result<ClientKind, EngineError> {
    let mut obj_gen = ObjectGenerator::from_config(config, client_index).map_err(|e| EngineError::SetupFailed {
        conn_id: client_index as usize,
        step: "object_generator",
        detail: e.to_string(),
    })?;

    if config.key_distribution == KeyDistribution::Parallel {
        let total_clients = (config.threads * config.clients_per_thread).max(1) as u64;
        let span = config.key_range.max - config.key_range.min + 1;
        let per_client = (span / total_clients).max(1);
        let min = config.key_range.min + client_index as u64 * per_client;
        let max = if client_index as u64 + 1 >= total_clients {
            config.key_range.max
        } else {
            (min + per_client - 1).min(config.key_range.max)
        };
        obj_gen.restrict_range(min, max);
    }

    let protocol = protocol_for_config(config, config.verify);
    let mut conn = Connection::new(0, protocol, config.endpoint.clone());

    if let Some(connector) = tls_connector {
        let sni = config
            .tls
            .sni
            .clone()
            .unwrap_or_else(|| match &config.endpoint {
                crate::config::Endpoint::Tcp { host, .. } => host.clone(),
                crate::config::Endpoint::Unix { .. } => String::new(),
            });
        conn.set_tls(connector.clone(), sni);
    }

    conn.connect(&config.endpoint, config.connect_timeout).await?;

    let mode = if config.verify { ClientMode::Verify } else { ClientMode::Load };
    let client = Client::new(vec![conn], obj_gen, config.clone(), arbitrary, mode);

    if config.cluster_mode {
        Ok(ClientKind::Cluster(ClusterClient::new(client)))
    } else {
        Ok(ClientKind::Plain(client))
    }
}

/// Drives one client's event loop until it finishes, is interrupted, or
/// hits an error the reconnect supervisor can't absorb. The latter
/// propagates out so `run_once` can fail the whole client group, per
/// §4.I's "rebuilds the client group from scratch" restart policy.
async fn run_client(
    mut client: ClientKind,
    config: Arc<Config>,
    interrupt: Arc<AtomicBool>,
    progress: Arc<Progress>,
) -> Result<(RunStats, u64, u64, u64), EngineError> {
    let mut rate_limiters: Vec<Option<RateLimiter>> = match config.rate_limit {
        Some(rate) => {
            let now = Instant::now();
            (0..client.num_connections()).map(|_| Some(RateLimiter::new(rate, now))).collect()
        }
        None => Vec::new(),
    };

    client.set_start_time();
    let mut tick = tokio::time::interval(TICK_INTERVAL);

    loop {
        if interrupt.load(Ordering::Relaxed) {
            client.interrupt();
            break;
        }
        if client.finished() {
            break;
        }

        let n = client.num_connections();
        if n == 0 {
            break;
        }
        while rate_limiters.len() < n {
            rate_limiters.push(config.rate_limit.map(|rate| RateLimiter::new(rate, Instant::now())));
        }

        for conn_id in 0..n {
            if let Err(e) = client.pump(conn_id).await {
                handle_fault(&mut client, conn_id, &config, e).await?;
            }
        }

        let n = client.num_connections();
        let reads: Vec<_> = (0..n).map(|id| Box::pin(client.wait_readable(id))).collect();

        // The select! arms only produce an owned `Event` — neither arm
        // touches `client` directly, since the losing branch's pending
        // futures (still borrowing `client` through `reads`) stay alive
        // for the whole statement, not just until a winner is picked.
        enum Event {
            Readable(usize, Result<(), EngineError>),
            Tick,
        }
        let event = tokio::select! {
            (result, idx, _rest) = select_all(reads) => Event::Readable(idx, result),
            _ = tick.tick() => Event::Tick,
        };

        match event {
            Event::Readable(idx, Ok(())) => match client.process(idx).await {
                Ok(true) => {
                    if let Err(e) = graceful_reconnect(&mut client, idx, &config).await {
                        handle_fault(&mut client, idx, &config, e).await?;
                    }
                }
                Ok(false) => {}
                Err(e) => handle_fault(&mut client, idx, &config, e).await?,
            },
            Event::Readable(idx, Err(e)) => handle_fault(&mut client, idx, &config, e).await?,
            Event::Tick => {
                let now = Instant::now();
                for (idx, limiter) in rate_limiters.iter_mut().enumerate() {
                    if let Some(limiter) = limiter {
                        if idx < client.num_connections() {
                            let conn = client.connection_mut(idx);
                            limiter.tick(now, &mut conn.request_tokens);
                        }
                    }
                }
            }
        }

        progress.ops.store(client.reqs_processed(), Ordering::Relaxed);
    }

    let reqs_processed = client.reqs_processed();
    let verified_keys = client.verified_keys();
    let verify_errors = client.verify_errors();
    Ok((client.into_stats(), reqs_processed, verified_keys, verify_errors))
}

/// Handles a connection-level fault per §7's taxonomy: connection/timeout/
/// TLS errors go through the reconnect supervisor when enabled, otherwise
/// (and for parse/setup failures, which are never recoverable in place)
/// bubble up so the caller restarts the whole client group.
async fn handle_fault(client: &mut ClientKind, conn_id: usize, config: &Config, err: EngineError) -> Result<(), EngineError> {
    match &err {
        EngineError::Connection { .. } | EngineError::ConnectTimeout { .. } | EngineError::Tls(..) if config.reconnect_on_error => {
            reconnect_with_backoff(client, conn_id, config).await
        }
        _ => Err(err),
    }
}

async fn reconnect_with_backoff(client: &mut ClientKind, conn_id: usize, config: &Config) -> Result<(), EngineError> {
    client.connection_mut(conn_id).disconnect();
    let endpoint = client.connection(conn_id).endpoint.clone();
    loop {
        let delay = client.connection_mut(conn_id).next_backoff(config.reconnect_backoff_factor, config.max_reconnect_attempts);
        let Some(delay) = delay else {
            return Err(EngineError::Connection {
                conn_id,
                source: std::io::Error::new(std::io::ErrorKind::Other, "reconnect attempts exhausted"),
            });
        };
        tokio::time::sleep(delay).await;
        match client.connection_mut(conn_id).connect(&endpoint, config.connect_timeout).await {
            Ok(()) => {
                client.connection_mut(conn_id).reset_backoff();
                return Ok(());
            }
            Err(_) => continue,
        }
    }
}

async fn graceful_reconnect(client: &mut ClientKind, conn_id: usize, config: &Config) -> Result<(), EngineError> {
    let endpoint = client.connection(conn_id).endpoint.clone();
    client.connection_mut(conn_id).disconnect();
    client.connection_mut(conn_id).connect(&endpoint, config.connect_timeout).await
}
