//! Logs API Integration Tests

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::Value;
use shared_types::LevelFilter;
use tower::ServiceExt;

use overseer::api;
use overseer::config::WorkerConfig;
use overseer::{AppState, Config};

async fn setup_test_app() -> (axum::Router, Arc<AppState>, tempfile::TempDir) {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
    let log_file = temp_dir.path().join("app.log");

    let mut config = Config::new(&log_file, WorkerConfig::new("true"));
    config.tailer.poll_interval = Duration::from_millis(50);

    let state = AppState::start(config)
        .await
        .expect("Failed to start app state");
    (api::app(state.clone()), state, temp_dir)
}

async fn json_response(app: &axum::Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(req).await.expect("Request failed");
    let status = response.status();
    let body = response
        .into_body()
        .collect()
        .await
        .expect("Failed to read body")
        .to_bytes();
    let value: Value = serde_json::from_slice(&body).expect("Invalid JSON response");
    (status, value)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn seed(state: &AppState) {
    let publisher = state.publisher();
    publisher.publish_line("2024-05-01 10:00:00.000 | INFO     | bot.main:run:10 - service started");
    publisher.publish_line("2024-05-01 10:00:01.000 | WARNING  | bot.main:run:11 - slow reply");
    publisher.publish_line("2024-05-01 10:00:02.000 | ERROR    | bot.main:run:12 - reply failed: timeout");
    publisher.publish_line("");
    publisher.publish_line("2024-05-01 10:00:03.000 | INFO     | bot.main:run:13 - reply sent");
}

#[tokio::test]
async fn test_recent_returns_newest_in_order() {
    let (app, state, _temp_dir) = setup_test_app().await;
    seed(&state);

    let (status, body) = json_response(&app, get("/api/logs/recent?limit=2")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 2);
    let logs = body["logs"].as_array().unwrap();
    assert_eq!(logs[0]["sequence"], 3);
    assert_eq!(logs[0]["level"], "ERROR");
    assert_eq!(logs[0]["category"], "error");
    assert_eq!(logs[1]["sequence"], 4);
    assert_eq!(logs[1]["message"], "reply sent");

    state.shutdown().await;
}

#[tokio::test]
async fn test_recent_filters() {
    let (app, state, _temp_dir) = setup_test_app().await;
    seed(&state);

    let (_, body) = json_response(&app, get("/api/logs/recent?level=ERROR,WARNING")).await;
    assert_eq!(body["count"], 2);
    let sequences: Vec<u64> = body["logs"]
        .as_array()
        .unwrap()
        .iter()
        .map(|l| l["sequence"].as_u64().unwrap())
        .collect();
    assert_eq!(sequences, vec![2, 3]);

    let (_, body) = json_response(&app, get("/api/logs/recent?keyword=REPLY")).await;
    assert_eq!(body["count"], 3);

    let (_, body) = json_response(&app, get("/api/logs/recent?category=error")).await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["logs"][0]["message"], "reply failed: timeout");

    state.shutdown().await;
}

#[tokio::test]
async fn test_recent_time_range() {
    let (app, state, _temp_dir) = setup_test_app().await;
    seed(&state);

    let (_, body) = json_response(&app, get("/api/logs/recent")).await;
    let stamps: Vec<String> = body["logs"]
        .as_array()
        .unwrap()
        .iter()
        .map(|l| l["timestamp"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(stamps.len(), 4);

    let uri = format!("/api/logs/recent?since={}&until={}", stamps[1], stamps[2]);
    let (status, body) = json_response(&app, get(&uri)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 2);
    assert_eq!(body["logs"][0]["sequence"], 2);
    assert_eq!(body["logs"][1]["sequence"], 3);

    let uri = format!("/api/logs/recent?since={}&level=INFO", stamps[1]);
    let (_, body) = json_response(&app, get(&uri)).await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["logs"][0]["message"], "reply sent");

    state.shutdown().await;
}

#[tokio::test]
async fn test_stats_summarize_ingestion() {
    let (app, state, _temp_dir) = setup_test_app().await;
    seed(&state);

    let (status, body) = json_response(&app, get("/api/logs/stats")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_ingested"], 4);
    assert_eq!(body["last_sequence"], 4);
    assert_eq!(body["history_len"], 4);
    assert_eq!(body["history_capacity"], 1000);
    assert_eq!(body["level_counts"]["INFO"], 2);
    assert_eq!(body["level_counts"]["ERROR"], 1);
    assert_eq!(body["recent_errors"][0]["sequence"], 3);
    assert_eq!(body["rejected_lines"], 0);
    assert_eq!(body["subscriber_count"], 0);
    assert!(body["tailer"]["path"]
        .as_str()
        .unwrap()
        .ends_with("app.log"));

    state.shutdown().await;
}

#[tokio::test]
async fn test_sessions_lists_connected_viewers() {
    let (app, state, _temp_dir) = setup_test_app().await;

    let (_, body) = json_response(&app, get("/api/sessions")).await;
    assert_eq!(body["count"], 0);

    let session = state
        .sessions()
        .connect(Some(0), LevelFilter::parse_csv("ERROR"))
        .await
        .unwrap();

    let (status, body) = json_response(&app, get("/api/sessions")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert_eq!(body["sessions"][0]["id"], session.id());
    assert_eq!(body["sessions"][0]["levels"][0], "ERROR");
    assert_eq!(body["sessions"][0]["paused"], false);

    drop(session);
    let (_, body) = json_response(&app, get("/api/sessions")).await;
    assert_eq!(body["count"], 0);

    state.shutdown().await;
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_system_reports_host_usage() {
    let (app, state, _temp_dir) = setup_test_app().await;

    let (status, body) = json_response(&app, get("/api/system")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["cpu_count"].as_u64().unwrap() >= 1);
    let cpu = body["cpu_percent"].as_f64().unwrap();
    assert!((0.0..=100.0).contains(&cpu));
    let total = body["memory_total"].as_u64().unwrap();
    assert!(total > 0);
    assert!(body["memory_available"].as_u64().unwrap() <= total);
    assert!(body["disk_total"].as_u64().unwrap() >= body["disk_used"].as_u64().unwrap());
    assert!(body["uptime_secs"].is_u64());

    state.shutdown().await;
}
