//! Gateway process supervision: start/stop the `picoclaw gateway` child and
//! report its status with incremental logs.

use super::logbuffer::LogBuffer;
use super::LauncherState;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use futures_util::StreamExt;
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::codec::{FramedRead, LinesCodec};

/// Cap on a single captured log line.
const MAX_LOG_LINE_BYTES: usize = 1024 * 1024;

/// Health probe timeout against the gateway.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

/// Locate the gateway executable: prefer a sibling of the launcher binary,
/// fall back to `$PATH`.
fn locate_gateway_binary() -> PathBuf {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let mut candidate = dir.join("picoclaw");
            if cfg!(windows) {
                candidate.set_extension("exe");
            }
            if candidate.is_file() {
                return candidate;
            }
        }
    }
    PathBuf::from("picoclaw")
}

/// POST /api/process/start
pub async fn handle_start(State(state): State<Arc<LauncherState>>) -> impl IntoResponse {
    let binary = locate_gateway_binary();
    let mut cmd = tokio::process::Command::new(&binary);
    cmd.arg("gateway")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());

    // Clear old logs and bump the run id before the new process writes.
    state.logs.reset();

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            tracing::error!("Failed to start picoclaw gateway: {e}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": format!("Failed to start gateway: {e}")})),
            );
        }
    };

    let pid = child.id().unwrap_or_default();

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(scan_pipe(stdout, Arc::clone(&state.logs)));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(scan_pipe(stderr, Arc::clone(&state.logs)));
    }

    // Reap the child so it never lingers as a zombie.
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => tracing::info!("Gateway process exited: {status}"),
            Err(e) => tracing::warn!("Gateway process wait failed: {e}"),
        }
    });

    tracing::info!("Started picoclaw gateway (pid {pid}) from {}", binary.display());
    (StatusCode::OK, Json(json!({"status": "ok", "pid": pid})))
}

/// Append each line of a child pipe to the shared ring buffer.
async fn scan_pipe<R>(pipe: R, logs: Arc<LogBuffer>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = FramedRead::new(pipe, LinesCodec::new_with_max_length(MAX_LOG_LINE_BYTES));
    while let Some(line) = lines.next().await {
        match line {
            Ok(line) => logs.append(line),
            Err(e) => {
                tracing::debug!("log scanner stopped: {e}");
                return;
            }
        }
    }
}

/// POST /api/process/stop — absence of a process is not an error.
pub async fn handle_stop() -> impl IntoResponse {
    let result = stop_gateway_processes().await;
    match result {
        Ok(()) => (StatusCode::OK, Json(json!({"status": "ok"}))),
        Err(e) => {
            tracing::warn!("Failed to stop gateway (perhaps not running?): {e}");
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ok",
                    "msg": "Stop command executed, but returned error (process might not be running).",
                    "error": e.to_string(),
                })),
            )
        }
    }
}

#[cfg(unix)]
async fn stop_gateway_processes() -> anyhow::Result<()> {
    let status = tokio::process::Command::new("pkill")
        .args(["-f", "picoclaw gateway"])
        .status()
        .await?;
    if !status.success() {
        anyhow::bail!("pkill exited with {status}");
    }
    Ok(())
}

#[cfg(windows)]
async fn stop_gateway_processes() -> anyhow::Result<()> {
    let script = "Get-WmiObject Win32_Process | Where-Object { $_.CommandLine -match 'picoclaw.*gateway' } | ForEach-Object { Stop-Process $_.ProcessId -Force }";
    let status = tokio::process::Command::new("powershell")
        .args(["-Command", script])
        .status()
        .await?;
    if !status.success() {
        anyhow::bail!("powershell exited with {status}");
    }
    Ok(())
}

#[derive(serde::Deserialize, Default)]
pub struct StatusQuery {
    #[serde(default)]
    log_offset: Option<usize>,
    #[serde(default)]
    log_run_id: Option<i64>,
}

/// GET /api/process/status — probe the gateway `/health`, merge its body into
/// the response, and attach incremental logs.
pub async fn handle_status(
    State(state): State<Arc<LauncherState>>,
    Query(query): Query<StatusQuery>,
) -> Json<Value> {
    let cfg = crate::config::load_config(&state.config_path).unwrap_or_default();
    let mut host = cfg.gateway.host;
    if host.is_empty() || host == "0.0.0.0" {
        host = "127.0.0.1".into();
    }
    let url = format!("http://{host}:{}/health", cfg.gateway.port);

    let mut data = Map::new();
    let client = reqwest::Client::new();
    match client.get(&url).timeout(HEALTH_TIMEOUT).send().await {
        Err(e) => {
            data.insert("process_status".into(), json!("stopped"));
            data.insert("error".into(), json!(e.to_string()));
        }
        Ok(resp) if !resp.status().is_success() => {
            data.insert("process_status".into(), json!("error"));
            data.insert("status_code".into(), json!(resp.status().as_u16()));
        }
        Ok(resp) => match resp.json::<Map<String, Value>>().await {
            Ok(health) => {
                for (k, v) in health {
                    data.insert(k, v);
                }
                data.insert("process_status".into(), json!("running"));
            }
            Err(_) => {
                data.insert("process_status".into(), json!("error"));
                data.insert("error".into(), json!("invalid response from gateway"));
            }
        },
    }

    append_log_data(&state.logs, &query, &mut data);
    Json(Value::Object(data))
}

/// Populate `logs`, `log_total`, `log_run_id` and `log_source` from the ring,
/// honoring the client's incremental-read cursor. A run-id mismatch restarts
/// the client from offset zero.
fn append_log_data(logs: &LogBuffer, query: &StatusQuery, data: &mut Map<String, Value>) {
    let run_id = logs.run_id();

    // Run id zero means this launcher never started a gateway.
    if run_id == 0 {
        data.insert("logs".into(), json!(Vec::<String>::new()));
        data.insert("log_total".into(), json!(0));
        data.insert("log_run_id".into(), json!(0));
        data.insert("log_source".into(), json!("none"));
        return;
    }

    let client_run_id = query.log_run_id.unwrap_or(-1);
    let offset = if client_run_id == run_id as i64 {
        query.log_offset.unwrap_or(0)
    } else {
        0
    };

    let (lines, total, run_id) = logs.lines_since(offset);
    data.insert("logs".into(), json!(lines));
    data.insert("log_total".into(), json!(total));
    data.insert("log_run_id".into(), json!(run_id));
    data.insert("log_source".into(), json!("launcher"));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(offset: usize, run_id: i64) -> StatusQuery {
        StatusQuery {
            log_offset: Some(offset),
            log_run_id: Some(run_id),
        }
    }

    #[test]
    fn no_run_reports_no_source() {
        let logs = LogBuffer::new(200);
        let mut data = Map::new();
        append_log_data(&logs, &StatusQuery::default(), &mut data);
        assert_eq!(data["log_source"], "none");
        assert_eq!(data["log_total"], 0);
        assert_eq!(data["logs"], json!([]));
    }

    #[test]
    fn run_id_mismatch_restarts_from_zero() {
        let logs = LogBuffer::new(200);
        logs.reset(); // run 1 begins
        logs.append("A");
        logs.append("B");

        // Client thinks it is on run 0 at offset 5: offset is ignored.
        let mut data = Map::new();
        append_log_data(&logs, &query(5, 0), &mut data);
        assert_eq!(data["logs"], json!(["A", "B"]));
        assert_eq!(data["log_total"], 2);
        assert_eq!(data["log_run_id"], 1);
        assert_eq!(data["log_source"], "launcher");
    }

    #[test]
    fn matching_run_id_reads_incrementally() {
        let logs = LogBuffer::new(200);
        logs.reset();
        logs.append("A");
        logs.append("B");
        logs.append("C");

        let mut data = Map::new();
        append_log_data(&logs, &query(2, 1), &mut data);
        assert_eq!(data["logs"], json!(["C"]));
        assert_eq!(data["log_total"], 3);
    }

    #[tokio::test]
    async fn scan_pipe_appends_lines() {
        let logs = Arc::new(LogBuffer::new(10));
        let (mut tx, rx) = tokio::io::duplex(256);
        let scanner = tokio::spawn(scan_pipe(rx, Arc::clone(&logs)));

        use tokio::io::AsyncWriteExt;
        tx.write_all(b"line one\nline two\n").await.unwrap();
        drop(tx);
        scanner.await.unwrap();

        let (lines, total, _) = logs.lines_since(0);
        assert_eq!(lines, vec!["line one", "line two"]);
        assert_eq!(total, 2);
    }
}
