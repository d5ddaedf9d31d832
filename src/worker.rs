use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use async_trait::async_trait;
use rand::RngExt;
use serde_json::Value;
use tokio::task::AbortHandle;

use crate::queue::QueueService;
use crate::queue::models::QueueItem;

const IDLE_INTERVAL: Duration = Duration::from_millis(200);

/// Runs one admitted payload. Implementations may block for as long as the
/// work takes; the worker measures wall time and reports the outcome.
#[async_trait]
pub trait PayloadExecutor: Send + Sync {
    async fn execute(&self, payload: &Value) -> Result<()>;
}

/// Executor for the simulated pre-queue: sleeps a fixed or uniformly
/// sampled interval. Anything that is not a simulation is rejected.
pub struct SimExecutor;

#[async_trait]
impl PayloadExecutor for SimExecutor {
    async fn execute(&self, payload: &Value) -> Result<()> {
        if !payload
            .get("simulate_only")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            bail!("simulation-only queue");
        }

        let delay = match payload.get("sim_fixed_sec").and_then(Value::as_f64) {
            Some(fixed) => fixed.max(0.0),
            None => {
                let min = payload
                    .get("sim_min_sec")
                    .and_then(Value::as_f64)
                    .unwrap_or(5.0)
                    .max(0.0);
                let max = payload
                    .get("sim_max_sec")
                    .and_then(Value::as_f64)
                    .unwrap_or(10.0)
                    .max(min);
                if max > min {
                    rand::rng().random_range(min..=max)
                } else {
                    min
                }
            }
        };

        tokio::time::sleep(Duration::from_secs_f64(delay)).await;
        Ok(())
    }
}

/// Background coordinator: keeps asking the engine to admit and spawns one
/// executor task per admitted item, decoupling enqueue from execution.
pub struct WorkerRuntime {
    queue: Arc<QueueService>,
    executor: Arc<dyn PayloadExecutor>,
    handle: Mutex<Option<AbortHandle>>,
}

impl WorkerRuntime {
    pub fn new(queue: Arc<QueueService>, executor: Arc<dyn PayloadExecutor>) -> Self {
        Self {
            queue,
            executor,
            handle: Mutex::new(None),
        }
    }

    pub fn start(self: &Arc<Self>) {
        let mut guard = self.handle.lock().expect("worker handle lock poisoned");
        if guard.is_some() {
            return;
        }
        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            this.run_loop().await;
        });
        *guard = Some(task.abort_handle());
    }

    /// Aborts the coordinator. Executors already spawned finish naturally
    /// and still report through the queue service.
    pub fn stop(&self) {
        let mut guard = self.handle.lock().expect("worker handle lock poisoned");
        if let Some(handle) = guard.take() {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        let guard = self.handle.lock().expect("worker handle lock poisoned");
        guard.is_some()
    }

    async fn run_loop(self: Arc<Self>) {
        loop {
            let result = self.queue.engine().admit();
            if result.admitted.is_empty() {
                tokio::time::sleep(IDLE_INTERVAL).await;
                continue;
            }
            for item in result.admitted {
                let queue = Arc::clone(&self.queue);
                let executor = Arc::clone(&self.executor);
                tokio::spawn(run_one(queue, executor, item));
            }
        }
    }
}

async fn run_one(queue: Arc<QueueService>, executor: Arc<dyn PayloadExecutor>, item: QueueItem) {
    let started = Instant::now();
    let result = executor.execute(&item.payload).await;
    let elapsed = started.elapsed().as_secs_f64();

    match result {
        Ok(()) => queue.finish(&item.request_id, Some(elapsed), true, None),
        Err(err) => {
            tracing::warn!(?err, request_id = %item.request_id, "payload execution failed");
            queue.finish(&item.request_id, Some(elapsed), false, Some(&err.to_string()));
        }
    }
}
