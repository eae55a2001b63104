//! API route definitions.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use super::state::AppState;
use super::ApiError;
use crate::ledger::{Interval, IntervalUnit, Trigger};
use crate::supervisor::{RunOptions, DEFAULT_STOP_REASON};

type ApiResult = Result<Json<Value>, ApiError>;

const DEFAULT_OUTPUT_LINES: usize = 100;
const DEFAULT_LOG_LIMIT: u32 = 100;
const DEFAULT_HISTORY_LIMIT: u32 = 50;
const DEFAULT_ACTIVITY_LIMIT: usize = 100;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/jobs", get(list_jobs))
        .route("/jobs/{id}/status", get(job_status))
        .route("/jobs/{id}/run", post(run_job))
        .route("/jobs/{id}/stop", post(stop_job))
        .route("/jobs/{id}/output", get(job_output).delete(clear_job_output))
        .route("/jobs/{id}/logs", get(job_logs))
        .route("/executions", get(list_executions))
        .route("/executions/active", get(active_executions))
        .route("/executions/{id}", get(get_execution))
        .route("/executions/{id}/logs", get(execution_logs))
        .route("/stats", get(stats))
        .route("/queue", get(queue_snapshot).post(queue_add))
        .route("/queue/order", put(queue_reorder))
        .route("/queue/start", post(queue_start))
        .route("/queue/stop", post(queue_stop))
        .route("/queue/{item_id}", delete(queue_remove))
        .route("/schedules", get(list_schedules).post(add_schedule))
        .route(
            "/schedules/{job_id}",
            get(get_schedule).put(update_schedule).delete(remove_schedule),
        )
        .route("/schedules/{job_id}/enable", post(enable_schedule))
        .route("/schedules/{job_id}/disable", post(disable_schedule))
        .route("/activity", get(activity))
}

fn envelope(data: impl serde::Serialize) -> Json<Value> {
    Json(json!({
        "data": data,
        "meta": { "timestamp": Utc::now().to_rfc3339() }
    }))
}

fn listing<T: serde::Serialize>(items: Vec<T>) -> Json<Value> {
    let total = items.len();
    Json(json!({
        "data": items,
        "meta": { "total": total, "timestamp": Utc::now().to_rfc3339() }
    }))
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<u32>,
}

async fn health() -> Json<Value> {
    envelope(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

async fn list_jobs(State(state): State<AppState>) -> Json<Value> {
    let running = state.supervisor.running().await;
    let jobs: Vec<Value> = state
        .catalog
        .list()
        .iter()
        .map(|job| {
            let mut entry = json!(job);
            entry["running"] = json!(running.iter().any(|r| r.job_id == job.id));
            entry
        })
        .collect();
    Json(json!({
        "data": jobs,
        "meta": {
            "total": jobs.len(),
            "sections": state.catalog.sections(),
            "timestamp": Utc::now().to_rfc3339()
        }
    }))
}

async fn job_status(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    known_job(&state, &id)?;
    Ok(envelope(state.reconciler.status(&id).await?))
}

#[derive(Debug, Default, Deserialize)]
struct RunRequest {
    #[serde(default)]
    input: Option<String>,
    #[serde(default)]
    dry_run: bool,
}

async fn run_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<RunRequest>>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let job = known_job(&state, &id)?.clone();
    let req = body.map(|Json(b)| b).unwrap_or_default();
    let input = req.input.map(|i| i.trim().to_string()).filter(|i| !i.is_empty());
    if job.accepts_input && input.is_none() {
        return Err(ApiError::BadRequest(format!("job {id} requires an input value")));
    }

    let handle = state
        .supervisor
        .run(
            &job,
            RunOptions {
                input,
                dry_run: req.dry_run,
                trigger: Trigger::Manual,
            },
        )
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        envelope(json!({
            "job_id": handle.job_id,
            "execution_id": handle.execution_id,
            "pid": handle.pid,
            "started_at": handle.started_at,
        })),
    ))
}

#[derive(Debug, Default, Deserialize)]
struct StopRequest {
    reason: Option<String>,
}

async fn stop_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<StopRequest>>,
) -> ApiResult {
    known_job(&state, &id)?;
    let reason = body
        .and_then(|Json(b)| b.reason)
        .unwrap_or_else(|| DEFAULT_STOP_REASON.to_string());
    state.supervisor.stop(&id, &reason).await?;
    Ok(envelope(json!({ "job_id": id, "stopped": true })))
}

#[derive(Debug, Deserialize)]
struct OutputQuery {
    lines: Option<usize>,
}

async fn job_output(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<OutputQuery>,
) -> ApiResult {
    known_job(&state, &id)?;
    let lines = state
        .supervisor
        .output(&id, q.lines.unwrap_or(DEFAULT_OUTPUT_LINES))
        .await;
    let progress = state.reconciler.progress(&id).await;
    let running = state.supervisor.is_running(&id).await;
    Ok(envelope(json!({
        "job_id": id,
        "running": running,
        "lines": lines,
        "progress": progress,
    })))
}

async fn clear_job_output(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    known_job(&state, &id)?;
    state.supervisor.clear_output(&id).await;
    let removed = state.ledger.clear_job_logs(&id).await?;
    Ok(envelope(json!({ "job_id": id, "removed_log_lines": removed })))
}

async fn job_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<LimitQuery>,
) -> ApiResult {
    known_job(&state, &id)?;
    let lines = state
        .ledger
        .job_logs(&id, q.limit.unwrap_or(DEFAULT_LOG_LIMIT))
        .await?;
    Ok(listing(lines))
}

fn known_job<'a>(
    state: &'a AppState,
    id: &str,
) -> Result<&'a crate::catalog::JobDefinition, ApiError> {
    state
        .catalog
        .get(id)
        .ok_or_else(|| ApiError::NotFound(format!("unknown job {id}")))
}

// ---------------------------------------------------------------------------
// Executions
// ---------------------------------------------------------------------------

async fn list_executions(State(state): State<AppState>, Query(q): Query<LimitQuery>) -> ApiResult {
    let rows = state
        .ledger
        .recent_executions(q.limit.unwrap_or(DEFAULT_HISTORY_LIMIT))
        .await?;
    Ok(listing(rows))
}

async fn active_executions(State(state): State<AppState>) -> ApiResult {
    Ok(listing(state.ledger.active_executions().await?))
}

async fn get_execution(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    let exec = state
        .ledger
        .execution(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("execution {id} not found")))?;
    Ok(envelope(exec))
}

async fn execution_logs(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(q): Query<LimitQuery>,
) -> ApiResult {
    let logs = state
        .ledger
        .execution_logs(id, q.limit.unwrap_or(u32::MAX))
        .await?;
    Ok(listing(logs))
}

async fn stats(State(state): State<AppState>) -> ApiResult {
    Ok(envelope(state.ledger.stats().await?))
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

async fn queue_snapshot(State(state): State<AppState>) -> Json<Value> {
    envelope(state.queue.snapshot().await)
}

#[derive(Debug, Deserialize)]
struct QueueAddRequest {
    job_id: String,
    #[serde(default)]
    input: Option<String>,
}

async fn queue_add(
    State(state): State<AppState>,
    Json(req): Json<QueueAddRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let item = state.queue.add(&req.job_id, req.input).await?;
    Ok((StatusCode::CREATED, envelope(item)))
}

async fn queue_remove(State(state): State<AppState>, Path(item_id): Path<String>) -> ApiResult {
    state.queue.remove(&item_id).await?;
    Ok(envelope(json!({ "removed": item_id })))
}

#[derive(Debug, Deserialize)]
struct ReorderRequest {
    ids: Vec<String>,
}

async fn queue_reorder(
    State(state): State<AppState>,
    Json(req): Json<ReorderRequest>,
) -> Json<Value> {
    listing(state.queue.reorder(&req.ids).await)
}

async fn queue_start(State(state): State<AppState>) -> ApiResult {
    state.queue.start().await?;
    Ok(envelope(state.queue.snapshot().await))
}

async fn queue_stop(State(state): State<AppState>) -> Json<Value> {
    state.queue.stop();
    envelope(state.queue.snapshot().await)
}

// ---------------------------------------------------------------------------
// Schedules
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ScheduleRequest {
    #[serde(default)]
    job_id: Option<String>,
    interval_type: IntervalUnit,
    interval_value: u32,
    #[serde(default)]
    next_run: Option<DateTime<Utc>>,
}

impl ScheduleRequest {
    fn interval(&self) -> Interval {
        Interval::new(self.interval_type, self.interval_value)
    }
}

async fn list_schedules(State(state): State<AppState>) -> ApiResult {
    Ok(listing(state.scheduler.list().await?))
}

async fn get_schedule(State(state): State<AppState>, Path(job_id): Path<String>) -> ApiResult {
    let job = state
        .scheduler
        .get(&job_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("job {job_id} has no schedule")))?;
    Ok(envelope(job))
}

async fn add_schedule(
    State(state): State<AppState>,
    Json(req): Json<ScheduleRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let job_id = req
        .job_id
        .clone()
        .ok_or_else(|| ApiError::BadRequest("job_id is required".to_string()))?;
    let job = state
        .scheduler
        .add(&job_id, req.interval(), req.next_run)
        .await?;
    Ok((StatusCode::CREATED, envelope(job)))
}

async fn update_schedule(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Json(req): Json<ScheduleRequest>,
) -> ApiResult {
    let job = state
        .scheduler
        .update_schedule(&job_id, req.interval(), req.next_run)
        .await?;
    Ok(envelope(job))
}

async fn remove_schedule(State(state): State<AppState>, Path(job_id): Path<String>) -> ApiResult {
    state.scheduler.remove(&job_id).await?;
    Ok(envelope(json!({ "removed": job_id })))
}

async fn enable_schedule(State(state): State<AppState>, Path(job_id): Path<String>) -> ApiResult {
    state.scheduler.enable(&job_id).await?;
    Ok(envelope(json!({ "job_id": job_id, "enabled": true })))
}

async fn disable_schedule(State(state): State<AppState>, Path(job_id): Path<String>) -> ApiResult {
    state.scheduler.disable(&job_id).await?;
    Ok(envelope(json!({ "job_id": job_id, "enabled": false })))
}

// ---------------------------------------------------------------------------
// Activity
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ActivityQuery {
    limit: Option<usize>,
}

async fn activity(State(state): State<AppState>, Query(q): Query<ActivityQuery>) -> Json<Value> {
    listing(
        state
            .activity
            .recent(q.limit.unwrap_or(DEFAULT_ACTIVITY_LIMIT))
            .await,
    )
}
