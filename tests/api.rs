//! HTTP surface, driven in-process through the router.
#![cfg(unix)]

use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use runledger::config::AppConfig;
use runledger::Services;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

async fn app(dir: &TempDir) -> (Router, Services) {
    let toml = format!(
        r#"
[storage]
db_path = "{}"

[activity]
path = "{}"

[runner]
stop_grace_ms = 300

[[jobs]]
id = "hello"
name = "Say hello"
command = ["sh", "-c", "echo hello"]

[[jobs]]
id = "wait"
command = ["sh", "-c", "exec sleep 30"]

[[jobs]]
id = "needs-input"
command = ["sh", "-c", "echo \"$1\"", "needs-input"]
accepts_input = true
section = "tests"
"#,
        dir.path().join("ledger.db").display(),
        dir.path().join("activity.jsonl").display(),
    );
    let services = Services::build(&AppConfig::parse(&toml).unwrap())
        .await
        .unwrap();
    (runledger::api::router(services.app_state()), services)
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn wait_idle(app: &Router, job: &str) {
    for _ in 0..100 {
        let (_, body) = call(app, "GET", &format!("/api/v1/jobs/{job}/status"), None).await;
        if body["data"]["running"] == json!(false) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("job {job} never finished");
}

#[tokio::test]
async fn test_health_and_job_listing() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _) = app(&dir).await;

    let (status, body) = call(&app, "GET", "/api/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "ok");

    let (status, body) = call(&app, "GET", "/api/v1/jobs", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["meta"]["total"], 3);
    assert_eq!(body["meta"]["sections"], json!(["commands", "tests"]));
    assert_eq!(body["data"][0]["id"], "hello");
    assert_eq!(body["data"][0]["running"], false);

    let (status, _) = call(&app, "GET", "/nowhere", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_run_then_read_execution_and_logs() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _) = app(&dir).await;

    let (status, body) = call(&app, "POST", "/api/v1/jobs/hello/run", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let id = body["data"]["execution_id"].as_i64().unwrap();
    wait_idle(&app, "hello").await;

    let (status, body) = call(&app, "GET", &format!("/api/v1/executions/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "completed");
    assert_eq!(body["data"]["triggered_by"], "manual");

    let (_, body) = call(&app, "GET", &format!("/api/v1/executions/{id}/logs"), None).await;
    assert_eq!(body["data"][0]["content"], "hello");
    assert_eq!(body["data"][0]["line_number"], 1);

    let (_, body) = call(&app, "GET", "/api/v1/jobs/hello/output", None).await;
    assert_eq!(body["data"]["running"], false);
    assert_eq!(body["data"]["lines"].as_array().unwrap().len(), 2);

    let (_, body) = call(&app, "GET", "/api/v1/stats", None).await;
    assert_eq!(body["data"]["total_executions"], 1);

    let (status, _) = call(&app, "GET", "/api/v1/executions/9999", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_run_errors_map_to_status_codes() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _) = app(&dir).await;

    let (status, body) = call(&app, "POST", "/api/v1/jobs/ghost/run", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"]["message"].as_str().unwrap().contains("ghost"));

    let (status, _) = call(&app, "POST", "/api/v1/jobs/needs-input/run", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(
        &app,
        "POST",
        "/api/v1/jobs/needs-input/run",
        Some(json!({ "input": "x" })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    wait_idle(&app, "needs-input").await;

    let (status, _) = call(&app, "POST", "/api/v1/jobs/wait/run", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let (status, _) = call(&app, "POST", "/api/v1/jobs/wait/run", None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (_, body) = call(&app, "GET", "/api/v1/executions/active", None).await;
    assert_eq!(body["meta"]["total"], 1);

    let (status, _) = call(
        &app,
        "POST",
        "/api/v1/jobs/wait/stop",
        Some(json!({ "reason": "enough" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(&app, "POST", "/api/v1/jobs/wait/stop", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_schedule_crud() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _) = app(&dir).await;

    let (status, body) = call(
        &app,
        "POST",
        "/api/v1/schedules",
        Some(json!({ "job_id": "hello", "interval_type": "minutes", "interval_value": 15 })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["interval_value"], 15);
    assert_eq!(body["data"]["enabled"], true);

    let (status, _) = call(
        &app,
        "POST",
        "/api/v1/schedules",
        Some(json!({ "job_id": "hello", "interval_type": "minutes", "interval_value": 0 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(&app, "POST", "/api/v1/schedules/hello/disable", None).await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = call(&app, "GET", "/api/v1/schedules/hello", None).await;
    assert_eq!(body["data"]["enabled"], false);

    let (status, body) = call(
        &app,
        "PUT",
        "/api/v1/schedules/hello",
        Some(json!({ "interval_type": "days", "interval_value": 1 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["interval_type"], "days");

    let (_, body) = call(&app, "GET", "/api/v1/schedules", None).await;
    assert_eq!(body["meta"]["total"], 1);

    let (status, _) = call(&app, "DELETE", "/api/v1/schedules/hello", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(&app, "DELETE", "/api/v1/schedules/hello", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_queue_endpoints() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _) = app(&dir).await;

    let (status, _) = call(&app, "POST", "/api/v1/queue/start", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, first) = call(
        &app,
        "POST",
        "/api/v1/queue",
        Some(json!({ "job_id": "hello" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let (_, second) = call(
        &app,
        "POST",
        "/api/v1/queue",
        Some(json!({ "job_id": "needs-input", "input": "abc" })),
    )
    .await;
    let first_id = first["data"]["id"].as_str().unwrap().to_string();
    let second_id = second["data"]["id"].as_str().unwrap().to_string();

    let (_, body) = call(
        &app,
        "PUT",
        "/api/v1/queue/order",
        Some(json!({ "ids": [second_id, first_id] })),
    )
    .await;
    assert_eq!(body["data"][0]["job_id"], "needs-input");

    let (status, _) = call(&app, "DELETE", &format!("/api/v1/queue/{first_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(&app, "DELETE", &format!("/api/v1/queue/{first_id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, body) = call(&app, "GET", "/api/v1/queue", None).await;
    assert_eq!(body["data"]["items"].as_array().unwrap().len(), 1);
    assert_eq!(body["data"]["running"], false);
}

#[tokio::test]
async fn test_activity_feed() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _) = app(&dir).await;

    call(&app, "POST", "/api/v1/jobs/hello/run", None).await;
    wait_idle(&app, "hello").await;

    // Completion is appended just after the live state clears.
    let mut newest = Value::Null;
    for _ in 0..50 {
        let (status, body) = call(&app, "GET", "/api/v1/activity?limit=1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["meta"]["total"], 1);
        newest = body["data"][0]["action_type"].clone();
        if newest == "job_complete" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(newest, "job_complete");
}
