//! StatsD frontend, §4.L "StatsD". One UDP datagram per metric, fired
//! and forgotten — StatsD is inherently best-effort and a dropped
//! datagram shouldn't fail the run.

use tokio::net::UdpSocket;

use super::RunReport;
use crate::errors::EngineError;

async fn send_line(socket: &UdpSocket, addr: &str, line: &str) -> Result<(), EngineError> {
    socket.send_to(line.as_bytes(), addr).await.map_err(|e| EngineError::Output(e.to_string()))?;
    Ok(())
}

pub async fn send(report: &RunReport<'_>, addr: &str) -> Result<(), EngineError> {
    let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(|e| EngineError::Output(e.to_string()))?;
    let prefix = format!("rust-redis-bench.{}", report.run_label());
    let t = &report.totals;

    let metrics: &[(&str, f64, &str)] = &[
        ("ops_per_sec", t.ops_sec, "g"),
        ("set_ops_per_sec", t.ops_sec_set, "g"),
        ("get_ops_per_sec", t.ops_sec_get, "g"),
        ("wait_ops_per_sec", t.ops_sec_wait, "g"),
        ("bytes_per_sec", t.bytes_sec, "g"),
        ("hits_per_sec", t.hits_sec, "g"),
        ("misses_per_sec", t.misses_sec, "g"),
        ("moved_per_sec", t.moved_sec, "g"),
        ("ask_per_sec", t.ask_sec, "g"),
        ("latency_ms", t.latency_ms, "g"),
        ("set_latency_ms", t.latency_set_ms, "g"),
        ("get_latency_ms", t.latency_get_ms, "g"),
        ("wait_latency_ms", t.latency_wait_ms, "g"),
    ];

    for (name, value, kind) in metrics {
        let line = format!("{prefix}.{name}:{value}|{kind}");
        send_line(&socket, addr, &line).await?;
    }
    Ok(())
}
