//! Graphite frontend, §4.L "Graphite". Posts the run's totals as a
//! Graphite event (`POST /events/`) rather than plaintext carbon lines,
//! matching how the rest of the engine reaches external HTTP sinks
//! (`reqwest`, already pulled in for this and nothing else).

use serde::Serialize;

use super::RunReport;
use crate::errors::EngineError;

#[derive(Serialize)]
struct GraphiteEvent {
    what: String,
    tags: Vec<String>,
    data: String,
}

pub async fn send(report: &RunReport<'_>, addr: &str) -> Result<(), EngineError> {
    let t = &report.totals;
    let data = format!(
        "ops/sec={:.2} set_ops/sec={:.2} get_ops/sec={:.2} bytes/sec={:.2} latency_ms={:.3}",
        t.ops_sec, t.ops_sec_set, t.ops_sec_get, t.bytes_sec, t.latency_ms
    );
    let event = GraphiteEvent {
        what: format!("rust-redis-bench run: {}", report.run_label()),
        tags: vec!["rust-redis-bench".to_string(), report.run_label()],
        data,
    };

    let url = format!("http://{addr}/events/");
    let client = reqwest::Client::new();
    let resp = client.post(&url).json(&event).send().await.map_err(|e| EngineError::Output(e.to_string()))?;

    if !resp.status().is_success() {
        return Err(EngineError::Output(format!("graphite returned {}", resp.status())));
    }
    Ok(())
}
