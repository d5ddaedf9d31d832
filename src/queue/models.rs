use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle of a queued request. Transitions are monotonic:
/// queued → inflight → finished|failed, or queued → canceled|expired.
/// Terminal states never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Queued,
    Inflight,
    Finished,
    Failed,
    Canceled,
    Expired,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Finished | Status::Failed | Status::Canceled | Status::Expired
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Queued => "queued",
            Status::Inflight => "inflight",
            Status::Finished => "finished",
            Status::Failed => "failed",
            Status::Canceled => "canceled",
            Status::Expired => "expired",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Admission policy caps, immutable per engine instance.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_inflight_global: usize,
    pub max_inflight_per_user: usize,
}

/// One queued unit of work for a user. The payload is opaque to the queue;
/// only the executor interprets it.
#[derive(Debug, Clone, Serialize)]
pub struct QueueItem {
    pub request_id: String,
    pub user_id: String,
    pub payload: Value,
    pub status: Status,
    /// Round-robin placeholder; admission currently ignores it.
    pub priority: i32,
    pub enqueued_at: DateTime<Utc>,
    pub admitted_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub fail_reason: Option<String>,
    pub eta_sec: Option<f64>,
}

impl QueueItem {
    pub fn new(request_id: String, user_id: String, payload: Value) -> Self {
        Self {
            request_id,
            user_id,
            payload,
            status: Status::Queued,
            priority: 0,
            enqueued_at: Utc::now(),
            admitted_at: None,
            finished_at: None,
            fail_reason: None,
            eta_sec: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AdmitResult {
    pub admitted: Vec<QueueItem>,
    pub capacity_left: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FinishResult {
    pub request_id: String,
    pub status: Status,
    pub duration_sec: Option<f64>,
}

/// Per-user slice of a snapshot. Expired items are folded into `failed`
/// here; the snapshot totals keep them distinct.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UserWindow {
    pub user_id: String,
    pub queued: usize,
    pub inflight: usize,
    pub finished: usize,
    pub failed: usize,
    pub canceled: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub ts: DateTime<Utc>,
    pub totals: HashMap<String, usize>,
    pub inflight_global: usize,
    pub per_user: Vec<UserWindow>,
    pub avg_finish_sec: Option<f64>,
}

/// What a user sees when polling their own place in line.
#[derive(Debug, Clone, Serialize)]
pub struct MyStatus {
    pub per_user_limit: usize,
    pub global_limit: usize,
    pub in_progress_user: usize,
    pub in_progress_global: usize,
    pub queue_len_user: usize,
    pub position_in_user: usize,
    pub eta_seconds: f64,
}
