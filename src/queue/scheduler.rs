use std::collections::HashMap;
use std::sync::Mutex;

use crate::queue::models::Limits;
use crate::queue::repo::InMemoryQueueRepo;

/// Round-robin fair-share admission policy.
///
/// Walks users in rotation, taking at most one queued item per user per
/// round while the per-user inflight cap (including admissions granted in
/// this same pass) and the global capacity allow. Stateless apart from the
/// last-served cursor, which decides where the next rotation starts.
#[derive(Default)]
pub struct RoundRobinScheduler {
    cursor: Mutex<Option<String>>,
}

impl RoundRobinScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the request ids to admit now, in admission order. The caller
    /// is responsible for actually marking them admitted.
    pub fn select_admissions(
        &self,
        repo: &InMemoryQueueRepo,
        limits: Limits,
        batch_max: usize,
    ) -> Vec<String> {
        let capacity = limits
            .max_inflight_global
            .saturating_sub(repo.inflight_count_global())
            .min(batch_max);
        if capacity == 0 {
            return Vec::new();
        }

        let user_ids = repo.list_user_ids();
        if user_ids.is_empty() {
            return Vec::new();
        }

        let mut cursor = self.cursor.lock().expect("scheduler cursor lock poisoned");
        let mut rotation = rotate_after(&user_ids, cursor.as_deref());

        let mut admitted: Vec<String> = Vec::new();
        // Admissions granted within this pass, counted against the per-user
        // cap before the repo reflects them.
        let mut granted: HashMap<String, usize> = HashMap::new();

        while admitted.len() < capacity && !rotation.is_empty() {
            let mut next_rotation = Vec::with_capacity(rotation.len());
            let mut any_granted = false;

            for user_id in &rotation {
                if admitted.len() >= capacity {
                    break;
                }
                let pending = granted.get(user_id).copied().unwrap_or(0);
                if repo.inflight_count_user(user_id) + pending >= limits.max_inflight_per_user {
                    // Capped for the rest of this pass; inflight only drops
                    // when someone finishes, which happens outside admit.
                    continue;
                }
                let Some(request_id) = repo.dequeue_for_user(user_id) else {
                    continue;
                };
                admitted.push(request_id);
                *granted.entry(user_id.clone()).or_default() += 1;
                *cursor = Some(user_id.clone());
                any_granted = true;
                if repo.peek_user_queue(user_id).is_some() {
                    next_rotation.push(user_id.clone());
                }
            }

            if !any_granted {
                break;
            }
            rotation = next_rotation;
        }

        admitted
    }
}

fn rotate_after(user_ids: &[String], cursor: Option<&str>) -> Vec<String> {
    let Some(cursor) = cursor else {
        return user_ids.to_vec();
    };
    let Some(idx) = user_ids.iter().position(|u| u == cursor) else {
        return user_ids.to_vec();
    };
    let start = (idx + 1) % user_ids.len();
    let mut rotated = Vec::with_capacity(user_ids.len());
    rotated.extend_from_slice(&user_ids[start..]);
    rotated.extend_from_slice(&user_ids[..start]);
    rotated
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::RoundRobinScheduler;
    use crate::queue::models::{Limits, QueueItem};
    use crate::queue::repo::InMemoryQueueRepo;

    fn enqueue(repo: &InMemoryQueueRepo, rid: &str, user: &str) {
        repo.add(QueueItem::new(rid.to_owned(), user.to_owned(), json!({})));
    }

    fn admit_all(repo: &InMemoryQueueRepo, ids: &[String]) {
        for rid in ids {
            repo.mark_admitted(rid, None);
        }
    }

    #[test]
    fn zero_capacity_admits_nothing() {
        let repo = InMemoryQueueRepo::new();
        enqueue(&repo, "r1", "alice");
        let scheduler = RoundRobinScheduler::new();

        let limits = Limits {
            max_inflight_global: 0,
            max_inflight_per_user: 2,
        };
        assert!(scheduler.select_admissions(&repo, limits, 64).is_empty());
    }

    #[test]
    fn round_robin_alternates_between_backlogged_users() {
        let repo = InMemoryQueueRepo::new();
        for i in 0..3 {
            enqueue(&repo, &format!("a{i}"), "alice");
            enqueue(&repo, &format!("b{i}"), "bob");
        }
        let scheduler = RoundRobinScheduler::new();
        let limits = Limits {
            max_inflight_global: 6,
            max_inflight_per_user: 3,
        };

        let ids = scheduler.select_admissions(&repo, limits, 64);
        assert_eq!(ids, vec!["a0", "b0", "a1", "b1", "a2", "b2"]);
    }

    #[test]
    fn per_user_cap_holds_within_a_single_batch() {
        let repo = InMemoryQueueRepo::new();
        for i in 0..10 {
            enqueue(&repo, &format!("a{i}"), "alice");
        }
        let scheduler = RoundRobinScheduler::new();
        let limits = Limits {
            max_inflight_global: 4,
            max_inflight_per_user: 2,
        };

        let ids = scheduler.select_admissions(&repo, limits, 64);
        assert_eq!(ids, vec!["a0", "a1"]);
    }

    #[test]
    fn batch_max_bounds_the_pass() {
        let repo = InMemoryQueueRepo::new();
        for i in 0..8 {
            enqueue(&repo, &format!("a{i}"), "alice");
        }
        let scheduler = RoundRobinScheduler::new();
        let limits = Limits {
            max_inflight_global: 16,
            max_inflight_per_user: 16,
        };

        let ids = scheduler.select_admissions(&repo, limits, 3);
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn cursor_rotation_starts_after_the_last_served_user() {
        let repo = InMemoryQueueRepo::new();
        enqueue(&repo, "a0", "alice");
        enqueue(&repo, "b0", "bob");
        enqueue(&repo, "c0", "carol");
        enqueue(&repo, "a1", "alice");

        let scheduler = RoundRobinScheduler::new();
        let limits = Limits {
            max_inflight_global: 16,
            max_inflight_per_user: 1,
        };

        // First pass serves alice, bob, carol (one each, cap 1).
        let first = scheduler.select_admissions(&repo, limits, 1);
        assert_eq!(first, vec!["a0"]);
        admit_all(&repo, &first);
        repo.mark_finished("a0", true, None);

        // Cursor sits on alice, so bob goes first even though alice has work.
        let second = scheduler.select_admissions(&repo, limits, 1);
        assert_eq!(second, vec!["b0"]);
    }

    #[test]
    fn strict_alternation_with_per_user_cap_one() {
        let repo = InMemoryQueueRepo::new();
        for i in 0..4 {
            enqueue(&repo, &format!("a{i}"), "alice");
            enqueue(&repo, &format!("b{i}"), "bob");
        }
        let scheduler = RoundRobinScheduler::new();
        let limits = Limits {
            max_inflight_global: 4,
            max_inflight_per_user: 1,
        };

        let mut order: Vec<String> = Vec::new();
        // Drain the whole backlog, finishing every admission between passes.
        loop {
            let ids = scheduler.select_admissions(&repo, limits, 64);
            if ids.is_empty() {
                break;
            }
            admit_all(&repo, &ids);
            for rid in &ids {
                repo.mark_finished(rid, true, None);
            }
            order.extend(ids);
        }

        assert_eq!(order.len(), 8);
        for pair in order.chunks(2) {
            let users: Vec<char> = pair.iter().map(|id| id.chars().next().unwrap()).collect();
            assert!(
                users.contains(&'a') && users.contains(&'b'),
                "expected alternation, got {order:?}"
            );
        }
    }

    #[test]
    fn fairness_window_bound_over_continuous_backlog() {
        let repo = InMemoryQueueRepo::new();
        for i in 0..20 {
            enqueue(&repo, &format!("a{i}"), "alice");
            enqueue(&repo, &format!("b{i}"), "bob");
        }
        let scheduler = RoundRobinScheduler::new();
        let limits = Limits {
            max_inflight_global: 2,
            max_inflight_per_user: 2,
        };

        let mut a_count = 0i64;
        let mut b_count = 0i64;
        for _ in 0..10 {
            let ids = scheduler.select_admissions(&repo, limits, 64);
            admit_all(&repo, &ids);
            for rid in &ids {
                if rid.starts_with('a') {
                    a_count += 1;
                } else {
                    b_count += 1;
                }
                repo.mark_finished(rid, true, None);
            }
            // Both users stay backlogged; admission counts may differ by at
            // most the number of backlogged users.
            assert!((a_count - b_count).abs() <= 2, "unfair split {a_count}/{b_count}");
        }
    }
}
