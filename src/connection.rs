//! One shard connection: socket, pipeline, parser state and the
//! reconnect/backoff state machine, §4.C. Grounded on
//! `shard_connection.h`/`shard_connection.cpp`. libevent's `bufferevent`
//! plus its read/event callbacks become a `TcpStream` wrapped in a
//! `BytesMut` read/write buffer pair driven from `Client::run`'s
//! `tokio::select!` loop instead of a per-process event base.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::config::{Config, Endpoint};
use crate::errors::EngineError;
use crate::protocol::{ParsedResponse, Protocol};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    InProgress,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupState {
    None,
    Sent,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Set,
    Get,
    Wait,
    Arbitrary(usize),
    Auth,
    SelectDb,
    ClusterSlots,
    Hello,
}

/// One in-flight request, kept in the pipeline until its response arrives.
/// Mirrors `request`/`arbitrary_request` — the verify variant's extra key/
/// value fields live in `crate::verify` instead of here, since only the
/// verify-mode request path needs them.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub kind: RequestType,
    pub sent_time: Instant,
    pub size: usize,
    pub keys: u32,
}

enum Sock {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
    // Boxed: a TlsStream carries its own session state and is
    // considerably larger than a bare TcpStream/UnixStream.
    Tls(Box<TlsStream<TcpStream>>),
}

impl Sock {
    async fn read_buf(&mut self, buf: &mut BytesMut) -> std::io::Result<usize> {
        match self {
            Sock::Tcp(s) => s.read_buf(buf).await,
            #[cfg(unix)]
            Sock::Unix(s) => s.read_buf(buf).await,
            Sock::Tls(s) => s.read_buf(buf).await,
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Sock::Tcp(s) => s.write_all(buf).await,
            #[cfg(unix)]
            Sock::Unix(s) => s.write_all(buf).await,
            Sock::Tls(s) => s.write_all(buf).await,
        }
    }

    fn readable(&self) -> tokio::io::Interest {
        tokio::io::Interest::READABLE
    }

    async fn ready(&self, interest: tokio::io::Interest) -> std::io::Result<tokio::io::Ready> {
        match self {
            Sock::Tcp(s) => s.ready(interest).await,
            #[cfg(unix)]
            Sock::Unix(s) => s.ready(interest).await,
            // TLS record framing means a readable TCP socket doesn't
            // guarantee a full decrypted record is buffered; this only
            // avoids polling while the underlying stream is fully idle.
            Sock::Tls(s) => s.get_ref().0.ready(interest).await,
        }
    }
}

pub struct Connection {
    pub id: usize,
    pub state: ConnectionState,
    pub endpoint: Endpoint,

    sock: Option<Sock>,
    read_buf: BytesMut,
    write_buf: BytesMut,

    pub protocol: Protocol,
    pipeline: VecDeque<PendingRequest>,
    pending_resp: i64,

    auth_state: SetupState,
    db_state: SetupState,
    hello_state: SetupState,
    cluster_slots_state: SetupState,

    pub request_tokens: u32,
    reqs_since_connect: u64,
    resps_since_connect: u64,

    reconnect_attempts: u32,
    current_backoff: f64,
    pub reconnecting: bool,

    tls: Option<(Arc<TlsConnector>, String)>,
}

impl Connection {
    pub fn new(id: usize, protocol: Protocol, endpoint: Endpoint) -> Self {
        Self {
            id,
            state: ConnectionState::Disconnected,
            endpoint,
            sock: None,
            read_buf: BytesMut::with_capacity(16 * 1024),
            write_buf: BytesMut::with_capacity(16 * 1024),
            protocol,
            pipeline: VecDeque::new(),
            pending_resp: 0,
            auth_state: SetupState::None,
            db_state: SetupState::None,
            hello_state: SetupState::None,
            cluster_slots_state: SetupState::None,
            request_tokens: 0,
            reqs_since_connect: 0,
            resps_since_connect: 0,
            reconnect_attempts: 0,
            current_backoff: 1.0,
            reconnecting: false,
            tls: None,
        }
    }

    /// Arms this connection to negotiate TLS on its next `connect()`.
    /// `sni` is the hostname sent in the ClientHello and checked against
    /// the server certificate.
    pub fn set_tls(&mut self, connector: Arc<TlsConnector>, sni: String) {
        self.tls = Some((connector, sni));
    }

    pub fn set_cluster_slots_dirty(&mut self) {
        self.cluster_slots_state = SetupState::None;
    }

    pub fn cluster_slots_state(&self) -> SetupState {
        self.cluster_slots_state
    }

    pub fn pipeline_len(&self) -> usize {
        self.pipeline.len()
    }

    pub async fn connect(&mut self, endpoint: &Endpoint, connect_timeout: Option<Duration>) -> Result<(), EngineError> {
        self.state = ConnectionState::InProgress;
        let fut = self.open_socket(endpoint);
        let sock = match connect_timeout {
            Some(d) => tokio::time::timeout(d, fut).await.map_err(|_| EngineError::ConnectTimeout {
                conn_id: self.id,
                secs: d.as_secs(),
            })??,
            None => fut.await?,
        };

        self.sock = Some(sock);
        self.state = ConnectionState::Connected;
        self.read_buf.clear();
        self.write_buf.clear();
        self.pipeline.clear();
        self.pending_resp = 0;
        self.reqs_since_connect = 0;
        self.resps_since_connect = 0;
        Ok(())
    }

    async fn open_socket(&self, endpoint: &Endpoint) -> Result<Sock, EngineError> {
        match endpoint {
            Endpoint::Tcp { host, port } => {
                let tcp = TcpStream::connect((host.as_str(), *port))
                    .await
                    .map_err(|e| EngineError::Connection { conn_id: self.id, source: e })?;
                match &self.tls {
                    Some((connector, sni)) => {
                        let tls_stream = crate::tls::connect(connector, tcp, sni, self.id).await?;
                        Ok(Sock::Tls(Box::new(tls_stream)))
                    }
                    None => Ok(Sock::Tcp(tcp)),
                }
            }
            #[cfg(unix)]
            Endpoint::Unix { path } => UnixStream::connect(path)
                .await
                .map(Sock::Unix)
                .map_err(|e| EngineError::Connection { conn_id: self.id, source: e }),
            #[cfg(not(unix))]
            Endpoint::Unix { .. } => Err(EngineError::Connection {
                conn_id: self.id,
                source: std::io::Error::new(std::io::ErrorKind::Unsupported, "unix sockets unsupported on this platform"),
            }),
        }
    }

    pub fn disconnect(&mut self) {
        self.sock = None;
        self.state = ConnectionState::Disconnected;
        self.auth_state = SetupState::None;
        self.db_state = SetupState::None;
        self.hello_state = SetupState::None;
        self.cluster_slots_state = SetupState::None;
        self.pipeline.clear();
        self.pending_resp = 0;
    }

    fn push_req(&mut self, kind: RequestType, size: usize, keys: u32) {
        self.pipeline.push_back(PendingRequest { kind, sent_time: Instant::now(), size, keys });
        self.pending_resp += 1;
        self.reqs_since_connect += 1;
        if self.request_tokens > 0 {
            self.request_tokens -= 1;
        }
    }

    /// Count of requests generated on this connection since the last
    /// `connect()`, used by `hold_pipeline`'s reconnect-boundary check.
    pub fn reqs_since_connect(&self) -> u64 {
        self.reqs_since_connect
    }

    /// Count of responses processed on this connection since the last
    /// `connect()`, used to detect the `reconnect_interval`-th response.
    pub fn resps_since_connect(&self) -> u64 {
        self.resps_since_connect
    }

    pub fn is_setup_done(&self) -> bool {
        self.auth_state == SetupState::Done
            && self.db_state == SetupState::Done
            && self.hello_state == SetupState::Done
            && self.cluster_slots_state == SetupState::Done
    }

    /// Queues whichever setup commands haven't been sent yet, one at a
    /// time (mirrors `send_conn_setup_commands`: auth, then db select,
    /// then HELLO, then CLUSTER SLOTS, one round trip each).
    pub fn queue_setup_commands(&mut self, config: &Config) -> Result<(), EngineError> {
        if self.auth_state == SetupState::None {
            if let Some(auth) = &config.auth {
                self.protocol.encode_auth(&mut self.write_buf, auth)?;
                self.push_req(RequestType::Auth, 0, 0);
                self.auth_state = SetupState::Sent;
            } else {
                self.auth_state = SetupState::Done;
            }
        }
        if self.db_state == SetupState::None {
            if config.select_db != 0 {
                self.protocol.encode_select(&mut self.write_buf, config.select_db)?;
                self.push_req(RequestType::SelectDb, 0, 0);
                self.db_state = SetupState::Sent;
            } else {
                self.db_state = SetupState::Done;
            }
        }
        if self.hello_state == SetupState::None {
            if matches!(self.protocol, Protocol::Resp { resp3: true, .. }) {
                self.protocol.encode_hello(&mut self.write_buf)?;
                self.push_req(RequestType::Hello, 0, 0);
                self.hello_state = SetupState::Sent;
            } else {
                self.hello_state = SetupState::Done;
            }
        }
        if self.cluster_slots_state == SetupState::None {
            if config.cluster_mode {
                set_keep_value(&mut self.protocol, true);
                self.protocol.encode_cluster_slots(&mut self.write_buf)?;
                self.push_req(RequestType::ClusterSlots, 0, 0);
                self.cluster_slots_state = SetupState::Sent;
            } else {
                self.cluster_slots_state = SetupState::Done;
            }
        }
        Ok(())
    }

    pub fn send_set(&mut self, key: &[u8], value: &[u8], expiry: u32) {
        let before = self.write_buf.len();
        self.protocol.encode_set(&mut self.write_buf, key, value, expiry);
        let size = self.write_buf.len() - before;
        self.push_req(RequestType::Set, size, 1);
    }

    pub fn send_get(&mut self, key: &[u8]) {
        let before = self.write_buf.len();
        self.protocol.encode_get(&mut self.write_buf, key);
        let size = self.write_buf.len() - before;
        self.push_req(RequestType::Get, size, 1);
    }

    pub fn write_buf_len(&self) -> usize {
        self.write_buf.len()
    }

    pub fn write_buf_mut(&mut self) -> &mut BytesMut {
        &mut self.write_buf
    }

    pub fn protocol_and_write_buf_mut(&mut self) -> (&Protocol, &mut BytesMut) {
        (&self.protocol, &mut self.write_buf)
    }

    /// Used by multi-get: the caller already wrote the encoded command
    /// straight into `write_buf_mut()` and only needs the pipeline
    /// bookkeeping `push_req` otherwise does for it.
    pub fn push_external_req(&mut self, kind: RequestType, size: usize, keys: u32) {
        self.push_req(kind, size, keys);
    }

    pub fn send_wait(&mut self, num_slaves: u32, timeout_ms: u32) -> Result<(), EngineError> {
        let before = self.write_buf.len();
        self.protocol.encode_wait(&mut self.write_buf, num_slaves, timeout_ms)?;
        let size = self.write_buf.len() - before;
        self.push_req(RequestType::Wait, size, 0);
        Ok(())
    }

    pub fn send_arbitrary(
        &mut self,
        index: usize,
        cmd: &crate::protocol::CompiledCommand,
        key: &[u8],
        data: &[u8],
        keys: u32,
    ) {
        let before = self.write_buf.len();
        self.protocol.encode_arbitrary(&mut self.write_buf, cmd, key, data);
        let size = self.write_buf.len() - before;
        self.push_req(RequestType::Arbitrary(index), size, keys);
    }

    pub async fn flush(&mut self) -> Result<(), EngineError> {
        if self.write_buf.is_empty() {
            return Ok(());
        }
        let Some(sock) = self.sock.as_mut() else { return Ok(()) };
        sock.write_all(&self.write_buf).await.map_err(|e| EngineError::Connection { conn_id: self.id, source: e })?;
        self.write_buf.clear();
        Ok(())
    }

    pub async fn wait_readable(&self) -> Result<(), EngineError> {
        let Some(sock) = self.sock.as_ref() else {
            std::future::pending::<()>().await;
            unreachable!()
        };
        sock.ready(sock.readable())
            .await
            .map(|_| ())
            .map_err(|e| EngineError::Connection { conn_id: self.id, source: e })
    }

    pub async fn read_some(&mut self) -> Result<usize, EngineError> {
        let Some(sock) = self.sock.as_mut() else { return Ok(0) };
        let n = sock
            .read_buf(&mut self.read_buf)
            .await
            .map_err(|e| EngineError::Connection { conn_id: self.id, source: e })?;
        Ok(n)
    }

    /// Drains every complete response currently buffered. Setup-command
    /// responses (auth/select/hello/cluster slots) are consumed here and
    /// turned into state transitions; everything else is handed back to
    /// the caller paired with its original request so stats/cluster
    /// routing can be applied by the owner.
    pub fn process_responses(&mut self) -> Result<Vec<(PendingRequest, ParsedResponse)>, EngineError> {
        let mut out = Vec::new();
        let id = self.id;
        let mut setup_error: Option<EngineError> = None;
        self.protocol.parse_all(&mut self.read_buf, id, |resp| {
            if setup_error.is_some() {
                return;
            }
            let Some(req) = self.pipeline.pop_front() else { return };
            self.pending_resp -= 1;
            self.resps_since_connect += 1;
            match req.kind {
                RequestType::Auth => {
                    if resp.is_error {
                        setup_error = Some(EngineError::SetupFailed { conn_id: id, step: "authenticate", detail: resp.status.clone() });
                    } else {
                        self.auth_state = SetupState::Done;
                    }
                }
                RequestType::SelectDb => {
                    if resp.status != "+OK" && resp.status != "OK" {
                        setup_error = Some(EngineError::SetupFailed { conn_id: id, step: "select_db", detail: resp.status.clone() });
                    } else {
                        self.db_state = SetupState::Done;
                    }
                }
                RequestType::Hello => {
                    if resp.is_error {
                        setup_error = Some(EngineError::SetupFailed { conn_id: id, step: "hello", detail: resp.status.clone() });
                    } else {
                        self.hello_state = SetupState::Done;
                    }
                }
                RequestType::ClusterSlots => {
                    self.cluster_slots_state = SetupState::Done;
                    out.push((req, resp));
                }
                _ => out.push((req, resp)),
            }
        })?;
        if out.iter().any(|(req, _)| matches!(req.kind, RequestType::ClusterSlots)) {
            set_keep_value(&mut self.protocol, false);
        }
        if let Some(e) = setup_error {
            return Err(e);
        }
        Ok(out)
    }

    pub fn done_waiting(&self) -> bool {
        self.pending_resp == 0 && self.write_buf.is_empty()
    }

    pub fn reset_backoff(&mut self) {
        self.reconnect_attempts = 0;
        self.current_backoff = 1.0;
        self.reconnecting = false;
    }

    /// Computes the next reconnect delay and bumps the attempt counter,
    /// or returns `None` once `max_attempts` is exhausted (caller should
    /// then signal a thread restart). Ported from `attempt_reconnect`'s
    /// backoff multiplication.
    pub fn next_backoff(&mut self, backoff_factor: f64, max_attempts: u32) -> Option<Duration> {
        if max_attempts != 0 && self.reconnect_attempts >= max_attempts {
            return None;
        }
        self.reconnect_attempts += 1;
        if backoff_factor > 0.0 {
            self.current_backoff *= backoff_factor;
        }
        self.reconnecting = true;
        Some(Duration::from_secs_f64(self.current_backoff))
    }
}

/// Builds the wire codec matching `config.protocol`. `RedisDefault`
/// behaves exactly like `Resp2` — no `HELLO` is ever sent for it, so the
/// server stays on whatever dialect it speaks by default.
pub fn protocol_for_config(config: &Config, keep_value: bool) -> Protocol {
    use crate::config::Protocol as CfgProtocol;
    match config.protocol {
        CfgProtocol::Resp2 | CfgProtocol::RedisDefault => Protocol::resp2(keep_value),
        CfgProtocol::Resp3 => Protocol::resp3(keep_value),
        CfgProtocol::MemcacheText => Protocol::memcache_text(keep_value),
        CfgProtocol::MemcacheBinary => Protocol::memcache_binary(keep_value),
    }
}

fn set_keep_value(protocol: &mut Protocol, keep: bool) {
    match protocol {
        Protocol::Resp { keep_value, .. } => *keep_value = keep,
        Protocol::MemcacheText { keep_value, .. } => *keep_value = keep,
        Protocol::MemcacheBinary { keep_value, .. } => *keep_value = keep,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_connection_needs_setup_when_auth_configured() {
        let conn = Connection::new(0, Protocol::resp2(false), Endpoint::Tcp { host: "127.0.0.1".into(), port: 6379 });
        assert!(!conn.is_setup_done());
    }

    #[test]
    fn pipeline_tracks_pending_count() {
        let mut conn = Connection::new(0, Protocol::resp2(false), Endpoint::Tcp { host: "127.0.0.1".into(), port: 6379 });
        conn.auth_state = SetupState::Done;
        conn.db_state = SetupState::Done;
        conn.hello_state = SetupState::Done;
        conn.cluster_slots_state = SetupState::Done;
        assert!(conn.is_setup_done());
        conn.send_get(b"k");
        assert_eq!(conn.pipeline_len(), 1);
        assert!(!conn.done_waiting());
    }

    #[test]
    fn backoff_multiplies_and_stops_at_max_attempts() {
        let mut conn = Connection::new(0, Protocol::resp2(false), Endpoint::Tcp { host: "127.0.0.1".into(), port: 6379 });
        let d1 = conn.next_backoff(2.0, 2).unwrap();
        let d2 = conn.next_backoff(2.0, 2).unwrap();
        assert!(d2 > d1);
        assert!(conn.next_backoff(2.0, 2).is_none());
    }
}
