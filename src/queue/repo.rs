use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::Utc;

use crate::queue::models::{QueueItem, QueueSnapshot, Status, UserWindow};

#[derive(Default)]
struct UserQueues {
    queued: VecDeque<String>,
    inflight: usize,
}

#[derive(Default)]
struct RepoInner {
    items: HashMap<String, QueueItem>,
    by_user: HashMap<String, UserQueues>,
}

/// Single-process, in-memory request store. Owns every request record and
/// the per-user FIFOs; all mutation goes through this API. A multi-worker
/// deployment would swap this for a shared store.
#[derive(Default)]
pub struct InMemoryQueueRepo {
    inner: Mutex<RepoInner>,
}

impl InMemoryQueueRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, item: QueueItem) {
        let mut inner = self.inner.lock().expect("queue repo lock poisoned");
        let user_id = item.user_id.clone();
        let request_id = item.request_id.clone();
        inner.items.insert(request_id.clone(), item);
        inner
            .by_user
            .entry(user_id)
            .or_default()
            .queued
            .push_back(request_id);
    }

    pub fn get(&self, request_id: &str) -> Option<QueueItem> {
        let inner = self.inner.lock().expect("queue repo lock poisoned");
        inner.items.get(request_id).cloned()
    }

    /// queued → inflight. Any other current state is returned unchanged.
    /// `eta_sec` is the admission-time estimate stamped onto the record.
    pub fn mark_admitted(&self, request_id: &str, eta_sec: Option<f64>) -> Option<QueueItem> {
        let mut inner = self.inner.lock().expect("queue repo lock poisoned");
        let item = inner.items.get_mut(request_id)?;
        if item.status != Status::Queued {
            return Some(item.clone());
        }
        item.status = Status::Inflight;
        item.admitted_at = Some(Utc::now());
        item.eta_sec = eta_sec;
        let user_id = item.user_id.clone();
        let snapshot = item.clone();
        inner.by_user.entry(user_id).or_default().inflight += 1;
        Some(snapshot)
    }

    /// inflight → finished|failed. A still-queued item may also be finished
    /// (rejected before admission); it is pulled out of the FIFO so it can
    /// never be admitted afterwards. Terminal records are returned as-is
    /// with `changed = false` so callers never double-count a finish.
    pub fn mark_finished(
        &self,
        request_id: &str,
        ok: bool,
        reason: Option<&str>,
    ) -> Option<(QueueItem, bool)> {
        let mut inner = self.inner.lock().expect("queue repo lock poisoned");
        let item = inner.items.get_mut(request_id)?;
        if item.status.is_terminal() {
            return Some((item.clone(), false));
        }

        let was_inflight = item.status == Status::Inflight;
        item.status = if ok { Status::Finished } else { Status::Failed };
        item.finished_at = Some(Utc::now());
        item.fail_reason = if ok {
            None
        } else {
            Some(reason.unwrap_or("failed").to_owned())
        };
        let user_id = item.user_id.clone();
        let snapshot = item.clone();

        if let Some(uq) = inner.by_user.get_mut(&user_id) {
            if was_inflight {
                if uq.inflight > 0 {
                    uq.inflight -= 1;
                }
            } else {
                uq.queued.retain(|id| id != request_id);
            }
        }
        Some((snapshot, true))
    }

    /// queued → canceled; removes the item from its user FIFO.
    pub fn cancel(&self, request_id: &str, reason: &str) -> Option<QueueItem> {
        self.terminate_queued(request_id, Status::Canceled, reason)
    }

    /// queued → expired; the TTL sweep is the only caller.
    pub fn expire(&self, request_id: &str, reason: &str) -> Option<QueueItem> {
        self.terminate_queued(request_id, Status::Expired, reason)
    }

    fn terminate_queued(
        &self,
        request_id: &str,
        status: Status,
        reason: &str,
    ) -> Option<QueueItem> {
        let mut inner = self.inner.lock().expect("queue repo lock poisoned");
        let item = inner.items.get_mut(request_id)?;
        if item.status != Status::Queued {
            return Some(item.clone());
        }
        item.status = status;
        item.fail_reason = Some(reason.to_owned());
        let user_id = item.user_id.clone();
        let snapshot = item.clone();
        if let Some(uq) = inner.by_user.get_mut(&user_id) {
            uq.queued.retain(|id| id != request_id);
        }
        Some(snapshot)
    }

    pub fn peek_user_queue(&self, user_id: &str) -> Option<String> {
        let inner = self.inner.lock().expect("queue repo lock poisoned");
        inner
            .by_user
            .get(user_id)
            .and_then(|uq| uq.queued.front().cloned())
    }

    pub fn dequeue_for_user(&self, user_id: &str) -> Option<String> {
        let mut inner = self.inner.lock().expect("queue repo lock poisoned");
        inner
            .by_user
            .get_mut(user_id)
            .and_then(|uq| uq.queued.pop_front())
    }

    pub fn inflight_count_global(&self) -> usize {
        let inner = self.inner.lock().expect("queue repo lock poisoned");
        inner
            .items
            .values()
            .filter(|it| it.status == Status::Inflight)
            .count()
    }

    pub fn inflight_count_user(&self, user_id: &str) -> usize {
        let inner = self.inner.lock().expect("queue repo lock poisoned");
        inner.by_user.get(user_id).map_or(0, |uq| uq.inflight)
    }

    /// Users with queued or inflight work, in insertion-agnostic but stable
    /// (sorted) order so the scheduler rotation is deterministic.
    pub fn list_user_ids(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("queue repo lock poisoned");
        let mut ids: Vec<String> = inner
            .by_user
            .iter()
            .filter(|(_, uq)| !uq.queued.is_empty() || uq.inflight > 0)
            .map(|(u, _)| u.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn user_queue_ids(&self, user_id: &str) -> Vec<String> {
        let inner = self.inner.lock().expect("queue repo lock poisoned");
        inner
            .by_user
            .get(user_id)
            .map(|uq| uq.queued.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn stats_snapshot(&self, avg_finish_sec: Option<f64>) -> QueueSnapshot {
        let inner = self.inner.lock().expect("queue repo lock poisoned");
        let mut totals: HashMap<String, usize> = HashMap::new();
        let mut per_user: HashMap<String, UserWindow> = HashMap::new();

        for item in inner.items.values() {
            *totals.entry(item.status.as_str().to_owned()).or_default() += 1;
            let uw = per_user
                .entry(item.user_id.clone())
                .or_insert_with(|| UserWindow {
                    user_id: item.user_id.clone(),
                    ..UserWindow::default()
                });
            match item.status {
                Status::Queued => uw.queued += 1,
                Status::Inflight => uw.inflight += 1,
                Status::Finished => uw.finished += 1,
                Status::Failed | Status::Expired => uw.failed += 1,
                Status::Canceled => uw.canceled += 1,
            }
        }

        let inflight_global = totals.get(Status::Inflight.as_str()).copied().unwrap_or(0);
        let mut per_user: Vec<UserWindow> = per_user.into_values().collect();
        per_user.sort_by(|a, b| a.user_id.cmp(&b.user_id));

        QueueSnapshot {
            ts: Utc::now(),
            totals,
            inflight_global,
            per_user,
            avg_finish_sec,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::InMemoryQueueRepo;
    use crate::queue::models::{QueueItem, Status};

    fn enqueue(repo: &InMemoryQueueRepo, rid: &str, user: &str) {
        repo.add(QueueItem::new(rid.to_owned(), user.to_owned(), json!({})));
    }

    #[test]
    fn fifo_order_per_user_survives_interleaved_users() {
        let repo = InMemoryQueueRepo::new();
        enqueue(&repo, "a1", "alice");
        enqueue(&repo, "b1", "bob");
        enqueue(&repo, "a2", "alice");

        assert_eq!(repo.peek_user_queue("alice").as_deref(), Some("a1"));
        assert_eq!(repo.dequeue_for_user("alice").as_deref(), Some("a1"));
        assert_eq!(repo.dequeue_for_user("alice").as_deref(), Some("a2"));
        assert_eq!(repo.dequeue_for_user("alice"), None);
        assert_eq!(repo.dequeue_for_user("bob").as_deref(), Some("b1"));
    }

    #[test]
    fn admitted_then_finished_updates_inflight_counters() {
        let repo = InMemoryQueueRepo::new();
        enqueue(&repo, "r1", "alice");
        repo.dequeue_for_user("alice");

        let item = repo.mark_admitted("r1", Some(4.5)).expect("record exists");
        assert_eq!(item.status, Status::Inflight);
        assert!(item.admitted_at.is_some());
        assert_eq!(item.eta_sec, Some(4.5));
        assert_eq!(repo.inflight_count_user("alice"), 1);
        assert_eq!(repo.inflight_count_global(), 1);

        let (item, changed) = repo.mark_finished("r1", true, None).expect("record exists");
        assert!(changed);
        assert_eq!(item.status, Status::Finished);
        assert!(item.finished_at.is_some());
        assert_eq!(repo.inflight_count_user("alice"), 0);
        assert_eq!(repo.inflight_count_global(), 0);
    }

    #[test]
    fn finishing_a_queued_item_removes_it_from_the_fifo() {
        let repo = InMemoryQueueRepo::new();
        enqueue(&repo, "r1", "alice");
        enqueue(&repo, "r2", "alice");

        let (item, changed) = repo
            .mark_finished("r1", false, Some("rejected"))
            .expect("record exists");
        assert!(changed);
        assert_eq!(item.status, Status::Failed);
        assert_eq!(repo.inflight_count_user("alice"), 0);
        assert_eq!(repo.user_queue_ids("alice"), vec!["r2".to_owned()]);
    }

    #[test]
    fn cancel_is_idempotent_and_terminal_states_are_immutable() {
        let repo = InMemoryQueueRepo::new();
        enqueue(&repo, "r1", "alice");

        let first = repo.cancel("r1", "client_cancel").expect("record exists");
        assert_eq!(first.status, Status::Canceled);
        assert_eq!(first.fail_reason.as_deref(), Some("client_cancel"));

        let second = repo.cancel("r1", "again").expect("record exists");
        assert_eq!(second.status, Status::Canceled);
        assert_eq!(second.fail_reason.as_deref(), Some("client_cancel"));

        let (finished, changed) = repo.mark_finished("r1", true, None).expect("record exists");
        assert!(!changed);
        assert_eq!(finished.status, Status::Canceled);
        let admitted = repo.mark_admitted("r1", None).expect("record exists");
        assert_eq!(admitted.status, Status::Canceled);
    }

    #[test]
    fn expire_is_a_distinct_terminal_state() {
        let repo = InMemoryQueueRepo::new();
        enqueue(&repo, "r1", "alice");

        let item = repo.expire("r1", "ttl_expired").expect("record exists");
        assert_eq!(item.status, Status::Expired);
        assert!(repo.user_queue_ids("alice").is_empty());

        let snap = repo.stats_snapshot(None);
        assert_eq!(snap.totals.get("expired"), Some(&1));
        // Per-user windows fold expired into failed.
        assert_eq!(snap.per_user[0].failed, 1);
        assert_eq!(snap.per_user[0].canceled, 0);
    }

    #[test]
    fn snapshot_totals_account_for_every_request_ever_created() {
        let repo = InMemoryQueueRepo::new();
        enqueue(&repo, "r1", "alice");
        enqueue(&repo, "r2", "alice");
        enqueue(&repo, "r3", "bob");
        enqueue(&repo, "r4", "bob");

        repo.dequeue_for_user("alice");
        repo.mark_admitted("r1", None);
        repo.mark_finished("r1", true, None);
        repo.cancel("r2", "client_cancel");
        repo.dequeue_for_user("bob");
        repo.mark_admitted("r3", None);

        let snap = repo.stats_snapshot(Some(1.5));
        let total: usize = snap.totals.values().sum();
        assert_eq!(total, 4);
        assert_eq!(snap.inflight_global, 1);
        assert_eq!(snap.avg_finish_sec, Some(1.5));

        let again = repo.stats_snapshot(Some(1.5));
        assert_eq!(again.totals, snap.totals);
        assert_eq!(again.inflight_global, snap.inflight_global);
    }

    #[test]
    fn list_user_ids_skips_drained_users() {
        let repo = InMemoryQueueRepo::new();
        enqueue(&repo, "r1", "alice");
        enqueue(&repo, "r2", "bob");
        assert_eq!(repo.list_user_ids(), vec!["alice", "bob"]);

        repo.cancel("r1", "client_cancel");
        assert_eq!(repo.list_user_ids(), vec!["bob"]);
    }
}
