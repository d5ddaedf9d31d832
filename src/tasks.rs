use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::ai::GenerateParams;
use crate::events::{EVENT_END, EVENT_ERROR, EVENT_PROGRESS, EVENT_QUEUE, EVENT_STATUS};
use crate::state::AppState;
use crate::stream;

const PREQUEUE_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Waiting,
    Generating,
    Finished,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Finished | TaskStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Waiting => "waiting",
            TaskStatus::Generating => "generating",
            TaskStatus::Finished => "finished",
            TaskStatus::Failed => "failed",
        }
    }
}

/// One simulate-then-generate job: a pre-queue wait phase followed by the
/// actual generation.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub user_id: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub saved_id: Option<i64>,
    pub result: Option<Value>,
    pub pre_total: usize,
    pub pre_done: usize,
    pub stream_mode: bool,
}

/// Memory map of tasks; all mutation is shallow field updates under the
/// mutex.
#[derive(Default)]
pub struct TaskStore {
    inner: Mutex<HashMap<String, TaskRecord>>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, user_id: &str, stream_mode: bool) -> String {
        let task_id = uuid::Uuid::new_v4().to_string();
        let record = TaskRecord {
            task_id: task_id.clone(),
            user_id: user_id.to_owned(),
            status: TaskStatus::Queued,
            created_at: Utc::now(),
            finished_at: None,
            error: None,
            saved_id: None,
            result: None,
            pre_total: 0,
            pre_done: 0,
            stream_mode,
        };
        self.inner
            .lock()
            .expect("task store lock poisoned")
            .insert(task_id.clone(), record);
        task_id
    }

    pub fn get(&self, task_id: &str) -> Option<TaskRecord> {
        self.inner
            .lock()
            .expect("task store lock poisoned")
            .get(task_id)
            .cloned()
    }

    pub fn update<F>(&self, task_id: &str, mutate: F) -> bool
    where
        F: FnOnce(&mut TaskRecord),
    {
        let mut inner = self.inner.lock().expect("task store lock poisoned");
        match inner.get_mut(task_id) {
            Some(record) => {
                mutate(record);
                true
            }
            None => false,
        }
    }
}

struct BaselineCtx {
    baseline_total: usize,
}

/// Remembers, per user, the largest amount of work observed at once so the
/// displayed wait percent never moves backwards when the queue grows
/// mid-task. The context resets once the user's queue drains.
#[derive(Default)]
pub struct ProgressTracker {
    inner: Mutex<HashMap<String, BaselineCtx>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns (baseline_total, active_now); (0, 0) once the queue drained.
    pub fn observe(&self, user_id: &str, queued: usize, inflight: usize) -> (usize, usize) {
        let active = queued + inflight;
        let mut inner = self.inner.lock().expect("progress tracker lock poisoned");

        if active == 0 {
            inner.remove(user_id);
            return (0, 0);
        }

        let ctx = inner
            .entry(user_id.to_owned())
            .or_insert(BaselineCtx {
                baseline_total: active,
            });
        let completed_so_far = ctx.baseline_total.saturating_sub(active);
        ctx.baseline_total = ctx.baseline_total.max(active + completed_so_far);
        (ctx.baseline_total, active)
    }
}

pub fn wait_percent(baseline_total: usize, active_now: usize) -> f64 {
    if baseline_total == 0 {
        return if active_now > 0 { 0.0 } else { 100.0 };
    }
    let completed = baseline_total.saturating_sub(active_now);
    let percent = (completed as f64 / baseline_total as f64) * 100.0;
    (percent.min(100.0) * 10.0).round() / 10.0
}

/// Everything the background orchestration needs to carry.
pub struct SimThenGenerateJob {
    pub task_id: String,
    pub user_id: String,
    pub request_ids: Vec<String>,
    pub params: GenerateParams,
    pub callback_url: Option<String>,
}

pub fn spawn_sim_then_generate(state: Arc<AppState>, job: SimThenGenerateJob) {
    tokio::spawn(async move {
        run_sim_then_generate(state, job, PREQUEUE_POLL).await;
    });
}

/// Drives one task to a terminal state. Every failure is recovered into
/// the task record plus one `error` event; nothing escapes.
pub async fn run_sim_then_generate(
    state: Arc<AppState>,
    job: SimThenGenerateJob,
    poll: Duration,
) {
    let task_id = job.task_id.clone();
    if let Err(err) = drive(&state, &job, poll).await {
        let message = err.to_string();
        tracing::warn!(%task_id, error = %message, "task failed");
        state.tasks.update(&task_id, |t| {
            t.status = TaskStatus::Failed;
            t.finished_at = Some(Utc::now());
            t.error = Some(message.clone());
        });
        state
            .hub
            .publish(&task_id, EVENT_ERROR, json!({ "message": message }));
        state.hub.remove_task(&task_id);
    }
}

async fn drive(state: &Arc<AppState>, job: &SimThenGenerateJob, poll: Duration) -> Result<()> {
    let task_id = &job.task_id;
    let pre_total = job.request_ids.len();

    state.tasks.update(task_id, |t| {
        t.status = TaskStatus::Waiting;
        t.pre_total = pre_total;
        t.pre_done = 0;
    });
    state
        .hub
        .publish(task_id, EVENT_STATUS, json!({ "status": "waiting" }));

    // Pre-queue phase: poll until every simulated request is terminal.
    loop {
        let pre_done = job
            .request_ids
            .iter()
            .filter(|rid| {
                state
                    .queue
                    .engine()
                    .status(rid)
                    .is_none_or(|it| it.status.is_terminal())
            })
            .count();
        let percent = if pre_total > 0 {
            ((pre_done as f64 / pre_total as f64) * 1000.0).round() / 10.0
        } else {
            0.0
        };

        state.tasks.update(task_id, |t| t.pre_done = pre_done);
        state.hub.publish(
            task_id,
            EVENT_PROGRESS,
            json!({
                "phase": "prequeue",
                "pre_total": pre_total,
                "pre_done": pre_done,
                "percent": percent,
            }),
        );

        let my = state.queue.my_status(&job.user_id, None);
        let (baseline, active) =
            state
                .progress
                .observe(&job.user_id, my.queue_len_user, my.in_progress_user);
        state.hub.publish(
            task_id,
            EVENT_QUEUE,
            json!({
                "remaining_ahead": my.queue_len_user,
                "eta_seconds": my.eta_seconds,
                "wait_percent": wait_percent(baseline, active),
            }),
        );

        if pre_done == pre_total {
            break;
        }
        tokio::time::sleep(poll).await;
    }

    state
        .tasks
        .update(task_id, |t| t.status = TaskStatus::Generating);
    state
        .hub
        .publish(task_id, EVENT_STATUS, json!({ "status": "generating" }));

    let sink = state.sink_dyn();
    let outcome =
        stream::bridge_generation(&state.hub, &state.streamer, &sink, task_id, &job.params)
            .await?;

    let result = json!({
        "company_code": job.params.company_code,
        "job_code": job.params.job_code,
        "markdown": outcome.markdown,
        "saved_id": outcome.saved_id,
        "title": outcome.title,
    });
    state.tasks.update(task_id, |t| {
        t.status = TaskStatus::Finished;
        t.finished_at = Some(Utc::now());
        t.saved_id = Some(outcome.saved_id);
        t.result = Some(result);
    });
    state.hub.publish(
        task_id,
        EVENT_END,
        json!({
            "saved_id": outcome.saved_id,
            "title": outcome.title,
            "markdown": outcome.markdown,
        }),
    );
    state.hub.remove_task(task_id);

    if let Some(url) = &job.callback_url {
        notify_webhook(state, url, task_id, outcome.saved_id, &job.params).await;
    }
    Ok(())
}

async fn notify_webhook(
    state: &Arc<AppState>,
    url: &str,
    task_id: &str,
    saved_id: i64,
    params: &GenerateParams,
) {
    let body = json!({
        "task_id": task_id,
        "status": "finished",
        "saved_id": saved_id,
        "company_code": params.company_code,
        "job_code": params.job_code,
    });
    let sent = state
        .http
        .post(url)
        .timeout(Duration::from_secs(10))
        .json(&body)
        .send()
        .await;
    if let Err(err) = sent {
        tracing::warn!(?err, %task_id, "webhook notification failed");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use super::{
        ProgressTracker, SimThenGenerateJob, TaskStatus, TaskStore, run_sim_then_generate,
        wait_percent,
    };
    use crate::ai::{GenerateParams, ScriptedStreamer};
    use crate::state::AppState;

    fn params() -> GenerateParams {
        serde_json::from_value(json!({"company_code": "ACME", "job_code": "backend"}))
            .expect("deserialize params")
    }

    fn sim_payload() -> serde_json::Value {
        json!({"simulate_only": true, "sim_fixed_sec": 0.05})
    }

    #[test]
    fn task_store_creates_and_updates_records() {
        let store = TaskStore::new();
        let tid = store.create("alice", true);

        let rec = store.get(&tid).expect("record exists");
        assert_eq!(rec.status, TaskStatus::Queued);
        assert!(rec.stream_mode);
        assert_eq!(rec.pre_total, 0);

        assert!(store.update(&tid, |t| {
            t.status = TaskStatus::Waiting;
            t.pre_total = 3;
        }));
        let rec = store.get(&tid).expect("record exists");
        assert_eq!(rec.status, TaskStatus::Waiting);
        assert_eq!(rec.pre_total, 3);

        assert!(!store.update("missing", |_| {}));
        assert!(store.get("missing").is_none());
    }

    #[test]
    fn baseline_expands_when_work_arrives_mid_task() {
        let tracker = ProgressTracker::new();

        // Five jobs observed, two complete.
        let (base, active) = tracker.observe("u", 5, 0);
        assert_eq!((base, active), (5, 5));
        let (base, active) = tracker.observe("u", 1, 2);
        assert_eq!((base, active), (5, 3));
        assert_eq!(wait_percent(base, active), 40.0);

        // Three more arrive: active(6) exceeds the old baseline(5), so the
        // baseline grows to cover completed + active.
        let (base, active) = tracker.observe("u", 4, 2);
        assert_eq!((base, active), (6, 6));

        // From here the percent climbs monotonically as work drains.
        let mut last = wait_percent(base, active);
        for (queued, inflight) in [(3, 2), (1, 2), (0, 1), (0, 0)] {
            let (base, active) = tracker.observe("u", queued, inflight);
            let p = wait_percent(base, active);
            assert!(p >= last, "percent regressed: {p} < {last}");
            last = p;
        }
        assert_eq!(last, 100.0);
    }

    #[test]
    fn baseline_resets_once_the_queue_drains() {
        let tracker = ProgressTracker::new();
        tracker.observe("u", 3, 1);
        assert_eq!(tracker.observe("u", 0, 0), (0, 0));
        // A fresh burst starts a fresh baseline.
        assert_eq!(tracker.observe("u", 2, 0), (2, 2));
    }

    #[test]
    fn wait_percent_boundaries() {
        assert_eq!(wait_percent(0, 0), 100.0);
        assert_eq!(wait_percent(0, 3), 0.0);
        assert_eq!(wait_percent(4, 4), 0.0);
        assert_eq!(wait_percent(4, 1), 75.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stream_task_runs_prequeue_then_generation() {
        let state = AppState::for_tests(Arc::new(ScriptedStreamer::new(&[
            "# Title\n",
            "Body ",
            "text.",
        ])));
        state.worker.start();

        let mut request_ids = Vec::new();
        for _ in 0..2 {
            let (rid, _) = state.queue.enqueue("alice", sim_payload());
            request_ids.push(rid);
        }
        let task_id = state.tasks.create("alice", true);
        let mut sub = state.hub.subscribe(&task_id);

        run_sim_then_generate(
            state.clone(),
            SimThenGenerateJob {
                task_id: task_id.clone(),
                user_id: "alice".to_owned(),
                request_ids,
                params: params(),
                callback_url: None,
            },
            Duration::from_millis(50),
        )
        .await;
        state.worker.stop();

        let rec = state.tasks.get(&task_id).expect("task exists");
        assert_eq!(rec.status, TaskStatus::Finished);
        assert_eq!(rec.saved_id, Some(1));
        assert_eq!(rec.pre_done, 2);
        let result = rec.result.expect("result recorded");
        assert_eq!(result["markdown"], "# Title\nBody text.");
        assert_eq!(result["title"], "Title");

        // Event order: status(waiting), progress…, status(generating),
        // start, deltas in emission order, exactly one end.
        let mut events = Vec::new();
        while let Some(ev) = sub.rx.recv().await {
            events.push(ev);
        }
        assert_eq!(events[0].event, "status");
        assert_eq!(events[0].data["status"], "waiting");

        let progress_count = events.iter().filter(|e| e.event == "progress").count();
        assert!(progress_count >= 1, "expected at least one progress event");
        assert!(events.iter().any(|e| e.event == "queue"));

        let generating_idx = events
            .iter()
            .position(|e| e.event == "status" && e.data["status"] == "generating")
            .expect("generating status event");
        let deltas: Vec<&str> = events
            .iter()
            .filter(|e| e.event == "delta")
            .map(|e| e.data["text"].as_str().expect("delta text"))
            .collect();
        assert_eq!(deltas, vec!["# Title\n", "Body ", "text."]);
        let first_delta_idx = events
            .iter()
            .position(|e| e.event == "delta")
            .expect("delta events");
        assert!(generating_idx < first_delta_idx);
        let start_idx = events
            .iter()
            .position(|e| e.event == "start")
            .expect("start event");
        assert!(start_idx < first_delta_idx);

        let ends: Vec<_> = events.iter().filter(|e| e.event == "end").collect();
        assert_eq!(ends.len(), 1);
        assert_eq!(ends[0].data["title"], "Title");
        assert_eq!(ends[0].data["markdown"], "# Title\nBody text.");
        assert!(ends[0].data["saved_id"].is_i64());
        assert_eq!(events.last().expect("nonempty").event, "end");

        let saved = state.sink.get(1).expect("sink row");
        assert_eq!(saved.markdown, "# Title\nBody text.");
    }

    #[tokio::test]
    async fn zero_prequeue_emits_one_progress_then_generates() {
        let state = AppState::for_tests(Arc::new(ScriptedStreamer::new(&["# T\n"])));
        let task_id = state.tasks.create("alice", true);
        let mut sub = state.hub.subscribe(&task_id);

        run_sim_then_generate(
            state.clone(),
            SimThenGenerateJob {
                task_id: task_id.clone(),
                user_id: "alice".to_owned(),
                request_ids: Vec::new(),
                params: params(),
                callback_url: None,
            },
            Duration::from_millis(10),
        )
        .await;

        let mut progress = Vec::new();
        while let Some(ev) = sub.rx.recv().await {
            if ev.event == "progress" {
                progress.push(ev.data.clone());
            }
        }
        assert_eq!(progress.len(), 1);
        assert_eq!(progress[0]["pre_total"], 0);
        assert_eq!(progress[0]["pre_done"], 0);
        assert_eq!(progress[0]["percent"], 0.0);

        let rec = state.tasks.get(&task_id).expect("task exists");
        assert_eq!(rec.status, TaskStatus::Finished);
    }

    #[tokio::test]
    async fn failed_generation_publishes_exactly_one_error_and_no_end() {
        let state = AppState::for_tests(Arc::new(ScriptedStreamer::failing_after(
            &["partial "],
            "provider disconnected",
        )));
        let task_id = state.tasks.create("alice", true);
        let mut sub = state.hub.subscribe(&task_id);

        run_sim_then_generate(
            state.clone(),
            SimThenGenerateJob {
                task_id: task_id.clone(),
                user_id: "alice".to_owned(),
                request_ids: Vec::new(),
                params: params(),
                callback_url: None,
            },
            Duration::from_millis(10),
        )
        .await;

        let rec = state.tasks.get(&task_id).expect("task exists");
        assert_eq!(rec.status, TaskStatus::Failed);
        assert!(
            rec.error
                .as_deref()
                .is_some_and(|e| e.contains("provider disconnected"))
        );
        assert!(rec.saved_id.is_none());

        let mut events = Vec::new();
        while let Some(ev) = sub.rx.recv().await {
            events.push(ev);
        }
        let errors: Vec<_> = events.iter().filter(|e| e.event == "error").collect();
        assert_eq!(errors.len(), 1);
        assert!(!events.iter().any(|e| e.event == "end"));
        assert_eq!(events.last().expect("nonempty").event, "error");
    }
}
