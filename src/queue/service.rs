use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};

use crate::queue::engine::QueueEngine;
use crate::queue::models::{MyStatus, QueueSnapshot};

pub const DEFAULT_AVG_FINISH_SEC: f64 = 20.0;
pub const DEFAULT_EMA_ALPHA: f64 = 0.2;

/// Per-user exponential moving average of finish durations.
pub struct EmaStore {
    default: f64,
    alpha: f64,
    by_user: Mutex<HashMap<String, f64>>,
}

impl EmaStore {
    pub fn new(default: f64, alpha: f64) -> Self {
        Self {
            default,
            alpha,
            by_user: Mutex::new(HashMap::new()),
        }
    }

    pub fn update(&self, user_id: &str, sample: f64) -> f64 {
        let mut by_user = self.by_user.lock().expect("ema lock poisoned");
        let value = by_user.entry(user_id.to_owned()).or_insert(self.default);
        *value = self.alpha * sample + (1.0 - self.alpha) * *value;
        *value
    }

    pub fn get(&self, user_id: &str) -> f64 {
        self.sample_for(user_id).unwrap_or(self.default)
    }

    /// The smoothed value only if the user has ever reported a sample.
    pub fn sample_for(&self, user_id: &str) -> Option<f64> {
        let by_user = self.by_user.lock().expect("ema lock poisoned");
        by_user.get(user_id).copied()
    }
}

/// Thin convenience layer over the engine: position lookup, per-user ETA,
/// and the diagnostic summary. The engine keeps the global average; this
/// façade keeps the per-user EMA.
pub struct QueueService {
    engine: Arc<QueueEngine>,
    ema: EmaStore,
}

impl QueueService {
    pub fn new(engine: Arc<QueueEngine>) -> Self {
        Self {
            engine,
            ema: EmaStore::new(DEFAULT_AVG_FINISH_SEC, DEFAULT_EMA_ALPHA),
        }
    }

    pub fn engine(&self) -> &Arc<QueueEngine> {
        &self.engine
    }

    /// Enqueues and returns (request_id, zero-based position in the user's
    /// queue).
    pub fn enqueue(&self, user_id: &str, payload: Value) -> (String, usize) {
        let req = self.engine.enqueue(user_id, payload);
        let pos = self.position_in_user(user_id, &req.request_id);
        (req.request_id, pos)
    }

    /// Reports completion to the engine and folds the duration into the
    /// user's EMA. An explicit `duration_sec` (wall time measured by the
    /// executor) wins over the engine's own computation.
    pub fn finish(
        &self,
        request_id: &str,
        duration_sec: Option<f64>,
        ok: bool,
        reason: Option<&str>,
    ) {
        let user_id = self.engine.status(request_id).map(|it| it.user_id);
        let result = self.engine.finish(request_id, ok, reason);

        if let (Some(user_id), Some(result)) = (user_id, result) {
            // Idempotent re-finishes report no duration; skip those so the
            // EMA is updated once per execution.
            let sample = match result.duration_sec {
                Some(engine_dur) => Some(duration_sec.unwrap_or(engine_dur)),
                None => None,
            };
            if let Some(sample) = sample {
                self.ema.update(&user_id, sample);
            }
        }
    }

    pub fn my_status(&self, user_id: &str, request_id: Option<&str>) -> MyStatus {
        let cfg = self.engine.config();
        let repo = self.engine.repo();

        let in_progress_user = repo.inflight_count_user(user_id);
        let in_progress_global = repo.inflight_count_global();
        let queue_ids = repo.user_queue_ids(user_id);
        let queue_len_user = queue_ids.len();

        // Not in the queue means already admitted or terminal: position 0.
        let position_in_user = request_id
            .and_then(|rid| queue_ids.iter().position(|id| id == rid))
            .unwrap_or(0);

        let avg = self.avg_for(user_id);
        let per_user_parallel = cfg.max_inflight_per_user.max(1);
        let eta = (position_in_user as f64 / per_user_parallel as f64) * avg;

        MyStatus {
            per_user_limit: cfg.max_inflight_per_user,
            global_limit: cfg.max_inflight_global,
            in_progress_user,
            in_progress_global,
            queue_len_user,
            position_in_user,
            eta_seconds: round1(eta),
        }
    }

    /// Best single-item duration estimate for a user: their own EMA when a
    /// sample exists, else the global average, else the default.
    pub fn avg_for(&self, user_id: &str) -> f64 {
        self.ema
            .sample_for(user_id)
            .or_else(|| self.engine.avg_finish_sec())
            .unwrap_or(DEFAULT_AVG_FINISH_SEC)
    }

    pub fn ema(&self) -> &EmaStore {
        &self.ema
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        self.engine.snapshot()
    }

    /// Per-user overview for the diagnostics endpoint.
    pub fn service_summary(&self) -> Value {
        let snap = self.engine.snapshot();
        let mut summary = serde_json::Map::new();
        for uw in &snap.per_user {
            summary.insert(
                uw.user_id.clone(),
                json!({
                    "in_progress": uw.inflight,
                    "queue_len": uw.queued,
                    "ema_latency": round2(self.ema.get(&uw.user_id)),
                }),
            );
        }
        summary.insert(
            "_global".to_owned(),
            json!({
                "in_progress": snap.inflight_global,
                "users": snap.per_user.len(),
            }),
        );
        Value::Object(summary)
    }

    fn position_in_user(&self, user_id: &str, request_id: &str) -> usize {
        self.engine
            .repo()
            .user_queue_ids(user_id)
            .iter()
            .position(|id| id == request_id)
            .unwrap_or(0)
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
