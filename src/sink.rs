use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// Where finished generations go. The queue core never reads back through
/// this interface; it only needs the id the sink hands out.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn save(&self, task_id: &str, title: &str, markdown: &str, meta: &Value) -> Result<i64>;
}

#[derive(Debug, Clone, Serialize)]
pub struct SavedJd {
    pub id: i64,
    pub task_id: String,
    pub title: String,
    pub markdown: String,
    pub meta: Value,
    pub created_at: DateTime<Utc>,
}

/// Process-local sink. Rows live as long as the process; ids are monotonic
/// starting at 1.
#[derive(Default)]
pub struct MemorySink {
    next_id: AtomicI64,
    rows: Mutex<Vec<SavedJd>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: i64) -> Option<SavedJd> {
        let rows = self.rows.lock().expect("sink lock poisoned");
        rows.iter().find(|r| r.id == id).cloned()
    }

    pub fn latest(&self) -> Option<SavedJd> {
        let rows = self.rows.lock().expect("sink lock poisoned");
        rows.last().cloned()
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn save(&self, task_id: &str, title: &str, markdown: &str, meta: &Value) -> Result<i64> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let row = SavedJd {
            id,
            task_id: task_id.to_owned(),
            title: title.to_owned(),
            markdown: markdown.to_owned(),
            meta: meta.clone(),
            created_at: Utc::now(),
        };
        self.rows.lock().expect("sink lock poisoned").push(row);
        Ok(id)
    }
}
