use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::queue::metrics::QueueMetrics;

pub const EVENT_START: &str = "start";
pub const EVENT_STATUS: &str = "status";
pub const EVENT_PROGRESS: &str = "progress";
pub const EVENT_QUEUE: &str = "queue";
pub const EVENT_DELTA: &str = "delta";
pub const EVENT_END: &str = "end";
pub const EVENT_ERROR: &str = "error";
pub const EVENT_HELLO: &str = "hello";

const DEFAULT_BUFFER: usize = 1000;

#[derive(Debug, Clone)]
pub struct TaskEvent {
    pub event: String,
    pub data: Value,
}

struct SubscriberSlot {
    id: u64,
    tx: mpsc::Sender<TaskEvent>,
}

pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<TaskEvent>,
}

/// Per-task event fan-out. Producers never wait for a consumer: a full
/// subscriber buffer drops that message for that subscriber only, and
/// closed subscribers are pruned on the next publish.
pub struct EventHub {
    subscribers: Mutex<HashMap<String, Vec<SubscriberSlot>>>,
    next_id: AtomicU64,
    dropped: AtomicU64,
    buffer: usize,
    metrics: Arc<dyn QueueMetrics>,
}

impl EventHub {
    pub fn new(metrics: Arc<dyn QueueMetrics>) -> Self {
        Self::with_buffer(DEFAULT_BUFFER, metrics)
    }

    pub fn with_buffer(buffer: usize, metrics: Arc<dyn QueueMetrics>) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            buffer: buffer.max(1),
            metrics,
        }
    }

    pub fn subscribe(&self, task_id: &str) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);
        let mut subs = self.subscribers.lock().expect("event hub lock poisoned");
        subs.entry(task_id.to_owned())
            .or_default()
            .push(SubscriberSlot { id, tx });
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, task_id: &str, subscriber_id: u64) {
        let mut subs = self.subscribers.lock().expect("event hub lock poisoned");
        if let Some(slots) = subs.get_mut(task_id) {
            slots.retain(|s| s.id != subscriber_id);
            if slots.is_empty() {
                subs.remove(task_id);
            }
        }
    }

    /// Delivers to every current subscriber of the task. A monotonic `ts`
    /// (ms since epoch, server clock) is stamped into the payload.
    pub fn publish(&self, task_id: &str, event: &str, data: Value) {
        let mut data = data;
        if let Value::Object(map) = &mut data {
            map.insert("ts".to_owned(), Value::from(Utc::now().timestamp_millis()));
        }
        let event = TaskEvent {
            event: event.to_owned(),
            data,
        };

        let mut subs = self.subscribers.lock().expect("event hub lock poisoned");
        let Some(slots) = subs.get_mut(task_id) else {
            return;
        };
        slots.retain(|slot| match slot.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                self.metrics.observe_dropped_event();
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
        if slots.is_empty() {
            subs.remove(task_id);
        }
    }

    /// Drops every subscriber channel of a task, ending their streams once
    /// drained. Called after the terminal event went out.
    pub fn remove_task(&self, task_id: &str) {
        let mut subs = self.subscribers.lock().expect("event hub lock poisoned");
        subs.remove(task_id);
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self, task_id: &str) -> usize {
        let subs = self.subscribers.lock().expect("event hub lock poisoned");
        subs.get(task_id).map_or(0, Vec::len)
    }
}
