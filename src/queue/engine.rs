use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::Value;

use crate::config::QueueConfig;
use crate::queue::metrics::QueueMetrics;
use crate::queue::models::{
    AdmitResult, FinishResult, Limits, QueueItem, QueueSnapshot, Status,
};
use crate::queue::repo::InMemoryQueueRepo;
use crate::queue::scheduler::RoundRobinScheduler;

pub const REASON_TTL_EXPIRED: &str = "ttl_expired";

/// Request state machine plus ETA bookkeeping. Composes the repository and
/// the scheduler; owns the TTL policy and the sliding window of recent
/// finish durations.
pub struct QueueEngine {
    repo: InMemoryQueueRepo,
    scheduler: RoundRobinScheduler,
    config: QueueConfig,
    metrics: Arc<dyn QueueMetrics>,
    eta_samples: Mutex<VecDeque<f64>>,
}

impl QueueEngine {
    pub fn new(config: QueueConfig, metrics: Arc<dyn QueueMetrics>) -> Self {
        Self {
            repo: InMemoryQueueRepo::new(),
            scheduler: RoundRobinScheduler::new(),
            config,
            metrics,
            eta_samples: Mutex::new(VecDeque::new()),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn repo(&self) -> &InMemoryQueueRepo {
        &self.repo
    }

    /// Accepts unconditionally; admission control happens later.
    pub fn enqueue(&self, user_id: &str, payload: Value) -> QueueItem {
        let item = QueueItem::new(
            uuid::Uuid::new_v4().to_string(),
            user_id.to_owned(),
            payload,
        );
        let snapshot = item.clone();
        self.repo.add(item);
        self.metrics.observe_enqueue(user_id);
        snapshot
    }

    /// Runs the TTL sweep, then asks the scheduler for the next batch.
    /// Every admitted item carries the current global average as its ETA.
    pub fn admit(&self) -> AdmitResult {
        self.expire_queued();

        let limits = Limits {
            max_inflight_global: self.config.max_inflight_global,
            max_inflight_per_user: self.config.max_inflight_per_user,
        };
        let ids =
            self.scheduler
                .select_admissions(&self.repo, limits, self.config.admit_batch_size);

        let eta = self.avg_finish_sec();
        let mut admitted = Vec::with_capacity(ids.len());
        for rid in &ids {
            if let Some(item) = self.repo.mark_admitted(rid, eta) {
                if item.status == Status::Inflight {
                    self.metrics.observe_admit(&item.user_id);
                    admitted.push(item);
                }
            }
        }

        let capacity_left = self
            .config
            .max_inflight_global
            .saturating_sub(self.repo.inflight_count_global());
        AdmitResult {
            admitted,
            capacity_left,
        }
    }

    /// Reports an execution outcome. Idempotent on terminal records (no
    /// duration, no sample, no metric). Successful finishes feed the ETA
    /// window; failures do not pollute the average.
    pub fn finish(&self, request_id: &str, ok: bool, reason: Option<&str>) -> Option<FinishResult> {
        let (item, changed) = self.repo.mark_finished(request_id, ok, reason)?;

        let mut duration_sec = None;
        if changed {
            if let (Some(admitted_at), Some(finished_at)) = (item.admitted_at, item.finished_at) {
                let dur = finished_at
                    .signed_duration_since(admitted_at)
                    .num_milliseconds() as f64
                    / 1000.0;
                duration_sec = Some(dur);
                if ok {
                    self.push_eta_sample(dur);
                }
            }
            self.metrics.observe_finish(&item.user_id, ok, duration_sec);
        }

        Some(FinishResult {
            request_id: request_id.to_owned(),
            status: item.status,
            duration_sec,
        })
    }

    /// Only meaningful on queued items; anything else is untouched.
    pub fn cancel(&self, request_id: &str, reason: &str) -> Option<Status> {
        self.repo.cancel(request_id, reason).map(|it| it.status)
    }

    pub fn status(&self, request_id: &str) -> Option<QueueItem> {
        self.repo.get(request_id)
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let snap = self.repo.stats_snapshot(self.avg_finish_sec());
        self.metrics.gauge_inflight_global(snap.inflight_global);
        snap
    }

    pub fn avg_finish_sec(&self) -> Option<f64> {
        let samples = self.eta_samples.lock().expect("eta window lock poisoned");
        if samples.is_empty() {
            return None;
        }
        Some(samples.iter().sum::<f64>() / samples.len() as f64)
    }

    /// Expires every queue head older than the TTL. The only path by which
    /// a queued item becomes terminal without admission.
    fn expire_queued(&self) {
        let ttl_us = self.config.queued_ttl_sec as i64 * 1_000_000;
        let now = Utc::now();

        for user_id in self.repo.list_user_ids() {
            loop {
                let Some(rid) = self.repo.peek_user_queue(&user_id) else {
                    break;
                };
                let Some(item) = self.repo.get(&rid) else {
                    break;
                };
                let age_us = now
                    .signed_duration_since(item.enqueued_at)
                    .num_microseconds()
                    .unwrap_or(i64::MAX);
                if age_us > ttl_us {
                    self.repo.expire(&rid, REASON_TTL_EXPIRED);
                    self.metrics.observe_expire(&user_id);
                    continue;
                }
                break;
            }
        }
    }

    fn push_eta_sample(&self, dur: f64) {
        let mut samples = self.eta_samples.lock().expect("eta window lock poisoned");
        samples.push_back(dur);
        while samples.len() > self.config.eta_window {
            samples.pop_front();
        }
    }

    #[cfg(test)]
    pub(crate) fn push_eta_sample_for_test(&self, dur: f64) {
        self.push_eta_sample(dur);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use super::QueueEngine;
    use crate::config::QueueConfig;
    use crate::queue::metrics::NoopQueueMetrics;
    use crate::queue::models::Status;

    fn engine_with(
        max_inflight_global: usize,
        max_inflight_per_user: usize,
        queued_ttl_sec: u64,
    ) -> QueueEngine {
        let config = QueueConfig {
            max_inflight_global,
            max_inflight_per_user,
            queued_ttl_sec,
            ..QueueConfig::default()
        };
        QueueEngine::new(config, Arc::new(NoopQueueMetrics))
    }

    #[test]
    fn enqueue_admit_finish_walks_the_state_machine() {
        let engine = engine_with(4, 2, 1800);
        let req = engine.enqueue("alice", json!({"simulate_only": true}));
        assert_eq!(req.status, Status::Queued);

        let res = engine.admit();
        assert_eq!(res.admitted.len(), 1);
        assert_eq!(res.admitted[0].request_id, req.request_id);
        assert_eq!(res.capacity_left, 3);

        let fin = engine
            .finish(&req.request_id, true, None)
            .expect("request exists");
        assert_eq!(fin.status, Status::Finished);
        assert!(fin.duration_sec.is_some());

        let item = engine.status(&req.request_id).expect("request exists");
        assert_eq!(item.status, Status::Finished);
    }

    #[test]
    fn zero_global_cap_never_admits() {
        let engine = engine_with(0, 2, 1800);
        for _ in 0..5 {
            engine.enqueue("alice", json!({}));
        }
        let res = engine.admit();
        assert!(res.admitted.is_empty());
        assert_eq!(res.capacity_left, 0);
    }

    #[test]
    fn per_user_cap_holds_in_one_admit_batch() {
        let engine = engine_with(4, 2, 1800);
        for _ in 0..10 {
            engine.enqueue("alice", json!({}));
        }
        let res = engine.admit();
        assert_eq!(res.admitted.len(), 2);
        assert_eq!(engine.repo().inflight_count_user("alice"), 2);

        // Nothing frees up, so a second tick admits nothing more.
        assert!(engine.admit().admitted.is_empty());
    }

    #[tokio::test]
    async fn zero_ttl_expires_queued_items_on_the_next_tick() {
        let engine = engine_with(4, 2, 0);
        let a = engine.enqueue("alice", json!({}));
        let b = engine.enqueue("alice", json!({}));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let res = engine.admit();
        assert!(res.admitted.is_empty());
        assert_eq!(
            engine.status(&a.request_id).expect("exists").status,
            Status::Expired
        );
        assert_eq!(
            engine.status(&b.request_id).expect("exists").status,
            Status::Expired
        );
    }

    #[tokio::test]
    async fn ttl_expiry_leaves_inflight_items_alone() {
        let engine = engine_with(4, 2, 1);
        let first = engine.enqueue("alice", json!({}));
        let res = engine.admit();
        assert_eq!(res.admitted.len(), 1);

        let second = engine.enqueue("alice", json!({}));
        tokio::time::sleep(Duration::from_millis(1100)).await;
        engine.admit();

        assert_eq!(
            engine.status(&first.request_id).expect("exists").status,
            Status::Inflight
        );
        assert_eq!(
            engine.status(&second.request_id).expect("exists").status,
            Status::Expired
        );
    }

    #[test]
    fn eta_window_averages_only_successful_finishes() {
        let engine = engine_with(8, 8, 1800);
        assert_eq!(engine.avg_finish_sec(), None);

        engine.push_eta_sample_for_test(2.0);
        engine.push_eta_sample_for_test(4.0);
        assert_eq!(engine.avg_finish_sec(), Some(3.0));

        // A failed finish must not contribute a sample.
        let req = engine.enqueue("alice", json!({}));
        engine.admit();
        engine.finish(&req.request_id, false, Some("boom"));
        assert_eq!(engine.avg_finish_sec(), Some(3.0));
    }

    #[test]
    fn eta_window_is_bounded() {
        let config = QueueConfig {
            eta_window: 3,
            ..QueueConfig::default()
        };
        let engine = QueueEngine::new(config, Arc::new(NoopQueueMetrics));
        for dur in [1.0, 2.0, 3.0, 10.0] {
            engine.push_eta_sample_for_test(dur);
        }
        // Oldest sample evicted: mean of [2, 3, 10].
        assert_eq!(engine.avg_finish_sec(), Some(5.0));
    }

    #[test]
    fn admitted_items_carry_the_current_average_as_eta() {
        let engine = engine_with(4, 2, 1800);
        engine.push_eta_sample_for_test(6.0);
        let req = engine.enqueue("alice", json!({}));
        let res = engine.admit();
        assert_eq!(res.admitted[0].eta_sec, Some(6.0));
        assert_eq!(
            engine.status(&req.request_id).expect("exists").eta_sec,
            Some(6.0)
        );
    }

    #[test]
    fn finish_is_idempotent_on_terminal_records() {
        let engine = engine_with(4, 2, 1800);
        let req = engine.enqueue("alice", json!({}));
        engine.admit();
        engine.finish(&req.request_id, true, None);
        let before = engine.snapshot();

        let again = engine
            .finish(&req.request_id, false, Some("late"))
            .expect("request exists");
        assert_eq!(again.status, Status::Finished);
        assert_eq!(again.duration_sec, None);

        let after = engine.snapshot();
        assert_eq!(before.totals, after.totals);
        assert_eq!(before.avg_finish_sec, after.avg_finish_sec);
    }

    #[test]
    fn cancel_only_touches_queued_items() {
        let engine = engine_with(4, 2, 1800);
        let queued = engine.enqueue("alice", json!({}));
        let status = engine
            .cancel(&queued.request_id, "client_cancel")
            .expect("request exists");
        assert_eq!(status, Status::Canceled);

        let running = engine.enqueue("alice", json!({}));
        engine.admit();
        let status = engine
            .cancel(&running.request_id, "client_cancel")
            .expect("request exists");
        assert_eq!(status, Status::Inflight);
    }
}
