//! WebSocket Logs Integration Tests

use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use overseer::actors::event_bus;
use overseer::api;
use overseer::config::WorkerConfig;
use overseer::{AppState, Config};

struct TestServer {
    addr: SocketAddr,
    state: Arc<AppState>,
    log_file: PathBuf,
    _temp_dir: tempfile::TempDir,
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn start_test_server(script: &str) -> TestServer {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
    let log_file = temp_dir.path().join("app.log");
    std::fs::File::create(&log_file).expect("Failed to create log file");

    let mut config = Config::new(
        &log_file,
        WorkerConfig::new("sh")
            .arg("-c")
            .arg(script)
            .output_file(&log_file),
    );
    config.tailer.poll_interval = Duration::from_millis(50);
    config.tailer.from_start = true;
    config.supervisor.startup_grace = Duration::from_millis(200);
    config.supervisor.stop_timeout = Duration::from_secs(3);

    let state = AppState::start(config)
        .await
        .expect("Failed to start app state");
    let app = api::app(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind listener");
    let addr = listener.local_addr().expect("Failed to get addr");

    let handle = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .await
            .expect("Server failed");
    });

    TestServer {
        addr,
        state,
        log_file,
        _temp_dir: temp_dir,
        handle,
    }
}

fn ws_url(addr: SocketAddr, path: &str) -> String {
    format!("ws://{addr}{path}")
}

async fn recv_json(
    ws: &mut (impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin),
) -> Value {
    let timeout_duration = Duration::from_secs(5);
    loop {
        match timeout(timeout_duration, ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                return serde_json::from_str(&text).expect("Invalid JSON");
            }
            Ok(Some(Ok(Message::Close(_)))) => panic!("Connection closed"),
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(e))) => panic!("Frame error: {e:?}"),
            Ok(None) => panic!("Stream ended"),
            Err(_) => panic!("Timeout waiting for frame"),
        }
    }
}

/// Next frame that is not a `status_update`.
async fn recv_non_status(
    ws: &mut (impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin),
) -> Value {
    loop {
        let value = recv_json(ws).await;
        if value["type"] != "status_update" {
            return value;
        }
    }
}

async fn wait_for_ingested(state: &AppState, expected: u64) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let stats = event_bus::stats(state.bus()).await.expect("bus unavailable");
        if stats.total_ingested >= expected {
            assert_eq!(stats.total_ingested, expected);
            return;
        }
        assert!(Instant::now() < deadline, "only {} records ingested", stats.total_ingested);
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

fn append_line(path: &PathBuf, line: &str) {
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(path)
        .expect("Failed to open log file");
    writeln!(file, "{line}").expect("Failed to append line");
}

#[cfg(unix)]
#[tokio::test]
async fn test_worker_logs_reach_viewer_end_to_end() {
    let server = start_test_server(
        "echo 'INFO: one'; echo 'INFO: two'; echo 'INFO: three'; echo 'ERROR: four'; sleep 30",
    )
    .await;

    server
        .state
        .supervisor()
        .start()
        .await
        .expect("Failed to start worker");
    wait_for_ingested(&server.state, 4).await;

    let (mut ws, _) = connect_async(ws_url(server.addr, "/ws/logs?history=2"))
        .await
        .expect("Failed to connect WebSocket");

    let connected = recv_json(&mut ws).await;
    assert_eq!(connected["type"], "connected");
    assert!(connected["session_id"].is_string());

    let third = recv_non_status(&mut ws).await;
    assert_eq!(third["type"], "new_log");
    assert_eq!(third["sequence"], 3);
    assert_eq!(third["level"], "INFO");
    assert_eq!(third["message"], "three");

    let fourth = recv_non_status(&mut ws).await;
    assert_eq!(fourth["type"], "new_log");
    assert_eq!(fourth["sequence"], 4);
    assert_eq!(fourth["level"], "ERROR");

    let loaded = recv_non_status(&mut ws).await;
    assert_eq!(loaded["type"], "history_loaded");
    assert_eq!(loaded["count"], 2);

    // Nothing else is logged, so only status frames may arrive.
    let quiet_until = Instant::now() + Duration::from_millis(500);
    while let Ok(frame) = tokio::time::timeout_at(quiet_until, ws.next()).await {
        if let Some(Ok(Message::Text(text))) = frame {
            let value: Value = serde_json::from_str(&text).expect("Invalid JSON");
            assert_eq!(value["type"], "status_update", "unexpected frame {value}");
        }
    }

    append_line(&server.log_file, "INFO: five");
    let fifth = recv_non_status(&mut ws).await;
    assert_eq!(fifth["type"], "new_log");
    assert_eq!(fifth["sequence"], 5);
    assert_eq!(fifth["message"], "five");

    ws.close(None).await.ok();
    server.state.shutdown().await;
}

#[tokio::test]
async fn test_logs_ws_initial_level_filter() {
    let server = start_test_server("sleep 30").await;
    append_line(&server.log_file, "INFO: routine");
    append_line(&server.log_file, "ERROR: broken pipe");
    wait_for_ingested(&server.state, 2).await;

    let (mut ws, _) = connect_async(ws_url(server.addr, "/ws/logs?history=10&levels=ERROR"))
        .await
        .expect("Failed to connect WebSocket");

    assert_eq!(recv_json(&mut ws).await["type"], "connected");
    let replayed = recv_non_status(&mut ws).await;
    assert_eq!(replayed["sequence"], 2);
    assert_eq!(recv_non_status(&mut ws).await["count"], 1);

    append_line(&server.log_file, "INFO: skipped");
    append_line(&server.log_file, "CRITICAL: gone");
    append_line(&server.log_file, "ERROR: again");
    let live = recv_non_status(&mut ws).await;
    assert_eq!(live["type"], "new_log");
    assert_eq!(live["sequence"], 5);
    assert_eq!(live["message"], "again");

    server.state.shutdown().await;
}

#[tokio::test]
async fn test_logs_ws_commands() {
    let server = start_test_server("sleep 30").await;
    let (mut ws, _) = connect_async(ws_url(server.addr, "/ws/logs?history=0"))
        .await
        .expect("Failed to connect WebSocket");

    assert_eq!(recv_json(&mut ws).await["type"], "connected");
    assert_eq!(recv_non_status(&mut ws).await["type"], "history_loaded");

    ws.send(Message::Text(json!({"type": "ping"}).to_string().into()))
        .await
        .unwrap();
    assert_eq!(recv_non_status(&mut ws).await["type"], "pong");

    ws.send(Message::Text(
        json!({"type": "set_filters", "levels": ["WARNING"]})
            .to_string()
            .into(),
    ))
    .await
    .unwrap();
    // Ping again so the filter change is known to be applied before logging.
    ws.send(Message::Text(json!({"type": "ping"}).to_string().into()))
        .await
        .unwrap();
    assert_eq!(recv_non_status(&mut ws).await["type"], "pong");

    append_line(&server.log_file, "INFO: hidden");
    append_line(&server.log_file, "WARNING: disk almost full");
    let warning = recv_non_status(&mut ws).await;
    assert_eq!(warning["type"], "new_log");
    assert_eq!(warning["level"], "WARNING");
    assert_eq!(warning["sequence"], 2);

    ws.send(Message::Text(
        json!({"type": "request_history", "lines_count": 5})
            .to_string()
            .into(),
    ))
    .await
    .unwrap();
    let replayed = recv_non_status(&mut ws).await;
    assert_eq!(replayed["sequence"], 2);
    let loaded = recv_non_status(&mut ws).await;
    assert_eq!(loaded["type"], "history_loaded");
    assert_eq!(loaded["count"], 1);

    ws.send(Message::Text("not json".into())).await.unwrap();
    let error = recv_non_status(&mut ws).await;
    assert_eq!(error["type"], "error");
    assert!(error["message"].as_str().unwrap().contains("invalid command"));

    server.state.shutdown().await;
}

#[tokio::test]
async fn test_logs_ws_session_is_listed_and_removed() {
    let server = start_test_server("sleep 30").await;
    let (mut ws, _) = connect_async(ws_url(server.addr, "/ws/logs"))
        .await
        .expect("Failed to connect WebSocket");
    let connected = recv_json(&mut ws).await;
    assert_eq!(server.state.sessions().len(), 1);
    assert_eq!(
        server.state.sessions().list()[0].id,
        connected["session_id"].as_str().unwrap()
    );

    ws.close(None).await.unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while !server.state.sessions().is_empty() {
        assert!(Instant::now() < deadline, "session was not removed on close");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    server.state.shutdown().await;
}
