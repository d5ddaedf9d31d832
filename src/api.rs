use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_stream::stream;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::ai::GenerateParams;
use crate::error::ApiError;
use crate::events::{EVENT_END, EVENT_ERROR, EVENT_HELLO};
use crate::sink::SavedJd;
use crate::state::AppState;
use crate::stream as genstream;
use crate::tasks::{self, SimThenGenerateJob, TaskStatus, wait_percent};

pub const DEFAULT_USER_ID: &str = "demo-user";

const SYNC_WAIT_POLL: Duration = Duration::from_millis(500);

fn default_prequeue_count() -> usize {
    10
}

fn default_min_sec() -> f64 {
    3.0
}

fn default_max_sec() -> f64 {
    5.0
}

fn default_mode() -> String {
    "sync".to_owned()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SimOptions {
    #[serde(default)]
    pub fixed_sec: Option<f64>,
    #[serde(default = "default_min_sec")]
    pub min_sec: f64,
    #[serde(default = "default_max_sec")]
    pub max_sec: f64,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            fixed_sec: None,
            min_sec: default_min_sec(),
            max_sec: default_max_sec(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SimThenGenerateRequest {
    #[serde(default = "default_prequeue_count")]
    pub prequeue_count: usize,
    #[serde(default)]
    pub sim: SimOptions,
    pub jd: GenerateParams,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub wait_timeout_sec: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitQuery {
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub callback_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StateQuery {
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TaskStatusResponse {
    pub task_id: String,
    pub status: TaskStatus,
    pub progress: f64,
    pub prequeue_done: usize,
    pub prequeue_total: usize,
    pub remaining_ahead: usize,
    pub eta_seconds: f64,
    pub wait_percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saved_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub links: HashMap<String, String>,
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

fn validate(req: &SimThenGenerateRequest) -> Result<(), ApiError> {
    if req.prequeue_count > 200 {
        return Err(ApiError::bad_request("prequeue_count must be at most 200"));
    }
    if req.sim.min_sec < 0.0 || req.sim.max_sec < 0.0 {
        return Err(ApiError::bad_request("sim intervals must be non-negative"));
    }
    if req.sim.fixed_sec.is_some_and(|v| v < 0.0) {
        return Err(ApiError::bad_request("sim.fixed_sec must be non-negative"));
    }
    if req.wait_timeout_sec.is_some_and(|v| v < 1.0) {
        return Err(ApiError::bad_request("wait_timeout_sec must be at least 1"));
    }
    Ok(())
}

/// Enqueues `prequeue_count` simulated waits for the user, then either
/// blocks until generation completes (`mode=sync`) or hands back a task id
/// to poll or stream (`mode=async`).
pub async fn sim_then_generate(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SubmitQuery>,
    Json(req): Json<SimThenGenerateRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    validate(&req)?;
    let user_id = req
        .user_id
        .clone()
        .unwrap_or_else(|| DEFAULT_USER_ID.to_owned());

    let payload = json!({
        "simulate_only": true,
        "sim_fixed_sec": req.sim.fixed_sec,
        "sim_min_sec": req.sim.min_sec,
        "sim_max_sec": req.sim.max_sec,
    });
    let mut request_ids = Vec::with_capacity(req.prequeue_count);
    for _ in 0..req.prequeue_count {
        let (rid, _pos) = state.queue.enqueue(&user_id, payload.clone());
        request_ids.push(rid);
    }

    match query.mode.as_str() {
        "sync" => {
            wait_all_finished(&state, &request_ids, req.wait_timeout_sec).await?;

            let markdown = genstream::collect_generation(&state.streamer, &req.jd)
                .await
                .map_err(ApiError::internal)?;
            let fallback = format!("{} {}", req.jd.company_code, req.jd.job_code);
            let title = genstream::title_from_markdown(&markdown, &fallback);
            let meta = json!({
                "company_code": req.jd.company_code,
                "job_code": req.jd.job_code,
                "language": req.jd.language,
                "style_source": req.jd.style_source,
                "model": req.jd.model,
            });
            let saved_id = state
                .sink_dyn()
                .save(&uuid::Uuid::new_v4().to_string(), &title, &markdown, &meta)
                .await
                .map_err(ApiError::internal)?;

            Ok((
                StatusCode::OK,
                Json(json!({
                    "company_code": req.jd.company_code,
                    "job_code": req.jd.job_code,
                    "markdown": markdown,
                    "saved_id": saved_id,
                })),
            ))
        }
        "async" => {
            let task_id = state.tasks.create(&user_id, query.stream);

            let mut links = HashMap::new();
            links.insert(
                "status".to_owned(),
                format!("/api/llm/queue/tasks/{task_id}/status"),
            );
            if query.stream {
                links.insert(
                    "stream".to_owned(),
                    format!("/api/llm/queue/tasks/{task_id}/stream"),
                );
            } else {
                links.insert(
                    "result".to_owned(),
                    format!("/api/llm/queue/tasks/{task_id}/result"),
                );
            }

            tasks::spawn_sim_then_generate(
                state.clone(),
                SimThenGenerateJob {
                    task_id: task_id.clone(),
                    user_id,
                    request_ids,
                    params: req.jd,
                    callback_url: query.callback_url,
                },
            );

            Ok((
                StatusCode::ACCEPTED,
                Json(json!({
                    "task_id": task_id,
                    "status": "accepted",
                    "links": links,
                })),
            ))
        }
        other => Err(ApiError::bad_request(format!(
            "invalid mode: {other} (expected sync|async)"
        ))),
    }
}

async fn wait_all_finished(
    state: &Arc<AppState>,
    request_ids: &[String],
    timeout_sec: Option<f64>,
) -> Result<(), ApiError> {
    let started = Instant::now();
    loop {
        let done = request_ids
            .iter()
            .filter(|rid| {
                state
                    .queue
                    .engine()
                    .status(rid)
                    .is_none_or(|it| it.status.is_terminal())
            })
            .count();
        if done == request_ids.len() {
            return Ok(());
        }
        if let Some(timeout) = timeout_sec {
            if started.elapsed().as_secs_f64() > timeout {
                return Err(ApiError::gateway_timeout("simulation wait timeout"));
            }
        }
        tokio::time::sleep(SYNC_WAIT_POLL).await;
    }
}

/// Wait 0–90%, generation 90–99%, done 100%.
fn task_progress(status: TaskStatus, pre_done: usize, pre_total: usize) -> f64 {
    let q_progress = if pre_total > 0 {
        round1((pre_done as f64 / pre_total as f64) * 90.0)
    } else {
        0.0
    };
    match status {
        TaskStatus::Generating => (q_progress + 5.0).clamp(90.0, 99.0),
        TaskStatus::Finished => 100.0,
        _ => q_progress,
    }
}

pub async fn task_status(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskStatusResponse>, ApiError> {
    let rec = state
        .tasks
        .get(&task_id)
        .ok_or_else(|| ApiError::not_found("unknown task_id"))?;

    let progress = task_progress(rec.status, rec.pre_done, rec.pre_total);

    let repo = state.queue.engine().repo();
    let queued = repo.user_queue_ids(&rec.user_id).len();
    let inflight = repo.inflight_count_user(&rec.user_id);
    let (baseline, active) = state.progress.observe(&rec.user_id, queued, inflight);

    let per_user_parallel = state.queue.engine().config().max_inflight_per_user.max(1);
    let avg = state.queue.avg_for(&rec.user_id);
    let eta_seconds = round1((queued as f64 / per_user_parallel as f64) * avg);

    let mut links = HashMap::new();
    links.insert(
        "queue_state".to_owned(),
        format!("/api/llm/queue/state?user_id={}", rec.user_id),
    );
    if rec.stream_mode {
        links.insert(
            "stream".to_owned(),
            format!("/api/llm/queue/tasks/{task_id}/stream"),
        );
    } else {
        links.insert(
            "result".to_owned(),
            format!("/api/llm/queue/tasks/{task_id}/result"),
        );
    }

    Ok(Json(TaskStatusResponse {
        task_id: rec.task_id,
        status: rec.status,
        progress,
        prequeue_done: rec.pre_done,
        prequeue_total: rec.pre_total,
        remaining_ahead: queued,
        eta_seconds,
        wait_percent: wait_percent(baseline, active),
        saved_id: rec.saved_id,
        error: rec.error,
        links,
    }))
}

pub async fn task_result(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let rec = state
        .tasks
        .get(&task_id)
        .ok_or_else(|| ApiError::not_found("unknown task_id"))?;

    if rec.stream_mode {
        return Err(ApiError::bad_request(
            "stream task: consume /stream instead of /result",
        ));
    }

    match rec.status {
        TaskStatus::Finished => rec
            .result
            .map(Json)
            .ok_or_else(|| ApiError::internal("task finished but result missing")),
        TaskStatus::Failed => Err(ApiError::failed_dependency(
            rec.error.unwrap_or_else(|| "task failed".to_owned()),
        )),
        status => Err(ApiError::conflict(format!(
            "task not finished (status={})",
            status.as_str()
        ))),
    }
}

/// Live task events as SSE. Subscribers connected before the task reaches
/// a terminal state see the full remainder of the stream; late subscribers
/// get a synthesized terminal frame from the task record.
pub async fn task_stream(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Response, ApiError> {
    let rec = state
        .tasks
        .get(&task_id)
        .ok_or_else(|| ApiError::not_found("unknown task_id"))?;
    if !rec.stream_mode {
        return Err(ApiError::bad_request(
            "not a stream task: poll /status and fetch /result",
        ));
    }

    let mut sub = state.hub.subscribe(&task_id);
    // Re-read after subscribing; a terminal event published in between
    // would otherwise be lost to this subscriber.
    let rec = state
        .tasks
        .get(&task_id)
        .ok_or_else(|| ApiError::not_found("unknown task_id"))?;

    let events = stream! {
        let hello = json!({
            "task_id": rec.task_id,
            "status": rec.status.as_str(),
            "ts": Utc::now().timestamp_millis(),
        });
        yield Ok::<Event, Infallible>(
            Event::default().event(EVENT_HELLO).data(hello.to_string()),
        );

        if rec.status.is_terminal() {
            let (event, data) = match rec.status {
                TaskStatus::Failed => (
                    EVENT_ERROR,
                    json!({
                        "message": rec.error.clone().unwrap_or_else(|| "task failed".to_owned()),
                        "ts": Utc::now().timestamp_millis(),
                    }),
                ),
                _ => (
                    EVENT_END,
                    json!({
                        "saved_id": rec.saved_id,
                        "title": rec.result.as_ref().and_then(|r| r.get("title")).cloned(),
                        "markdown": rec.result.as_ref().and_then(|r| r.get("markdown")).cloned(),
                        "ts": Utc::now().timestamp_millis(),
                    }),
                ),
            };
            yield Ok::<Event, Infallible>(Event::default().event(event).data(data.to_string()));
            return;
        }

        while let Some(ev) = sub.rx.recv().await {
            let terminal = ev.event == EVENT_END || ev.event == EVENT_ERROR;
            let data = ev.data.to_string();
            yield Ok::<Event, Infallible>(Event::default().event(&ev.event).data(data));
            if terminal {
                break;
            }
        }
    };

    Ok(Sse::new(events)
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(10))
                .text("ping"),
        )
        .into_response())
}

/// Queue diagnostics: config, snapshot, per-user summary, and the caller's
/// own wait estimate.
pub async fn queue_state(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StateQuery>,
) -> Json<Value> {
    let user_id = query
        .user_id
        .unwrap_or_else(|| DEFAULT_USER_ID.to_owned());

    let cfg = state.queue.engine().config();
    let snap = state.queue.snapshot();
    let capacity_left = cfg.max_inflight_global.saturating_sub(snap.inflight_global);

    let repo = state.queue.engine().repo();
    let queued = repo.user_queue_ids(&user_id).len();
    let inflight = repo.inflight_count_user(&user_id);
    let (baseline, active) = state.progress.observe(&user_id, queued, inflight);

    let per_user_parallel = cfg.max_inflight_per_user.max(1);
    let avg = state.queue.avg_for(&user_id);
    let eta_seconds = round1((queued as f64 / per_user_parallel as f64) * avg);

    Json(json!({
        "config": {
            "global_limit": cfg.max_inflight_global,
            "per_user_limit": cfg.max_inflight_per_user,
            "admit_batch_size": cfg.admit_batch_size,
            "queued_ttl_sec": cfg.queued_ttl_sec,
            "eta_window": cfg.eta_window,
        },
        "snapshot": serde_json::to_value(&snap).unwrap_or_else(|_| json!({})),
        "service_summary": state.queue.service_summary(),
        "capacity_left": capacity_left,
        "user_id": user_id,
        "remaining_ahead": queued,
        "eta_seconds": eta_seconds,
        "wait_percent": wait_percent(baseline, active),
    }))
}

pub async fn get_jd(
    State(state): State<Arc<AppState>>,
    Path(jd_id): Path<i64>,
) -> Result<Json<SavedJd>, ApiError> {
    state
        .sink
        .get(jd_id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found("JD not found"))
}

pub async fn get_latest_jd(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SavedJd>, ApiError> {
    state
        .sink
        .latest()
        .map(Json)
        .ok_or_else(|| ApiError::not_found("No generated JD"))
}
