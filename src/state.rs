use std::sync::Arc;

use anyhow::{Context, Result};

use crate::ai::{self, GenerationStreamer};
use crate::config::AppConfig;
use crate::events::EventHub;
use crate::queue::engine::QueueEngine;
use crate::queue::metrics::build_metrics;
use crate::queue::QueueService;
use crate::sink::{MemorySink, ResultSink};
use crate::tasks::{ProgressTracker, TaskStore};
use crate::worker::{PayloadExecutor, SimExecutor, WorkerRuntime};

/// The one lifecycle-owned runtime value. Everything mutable hangs off
/// this; handlers and background loops share it behind an `Arc`.
pub struct AppState {
    pub config: AppConfig,
    pub http: reqwest::Client,
    pub queue: Arc<QueueService>,
    pub worker: Arc<WorkerRuntime>,
    pub tasks: TaskStore,
    pub hub: EventHub,
    pub progress: ProgressTracker,
    pub sink: Arc<MemorySink>,
    pub streamer: Arc<dyn GenerationStreamer>,
}

impl AppState {
    pub fn build(config: AppConfig) -> Result<Arc<Self>> {
        let metrics = build_metrics(config.queue.metrics_backend)?;
        let engine = Arc::new(QueueEngine::new(config.queue.clone(), metrics.clone()));
        let queue = Arc::new(QueueService::new(engine));

        let executor: Arc<dyn PayloadExecutor> = Arc::new(SimExecutor);
        let worker = Arc::new(WorkerRuntime::new(queue.clone(), executor));

        let http = reqwest::Client::builder()
            .user_agent("JdLoom")
            .build()
            .context("failed to build http client")?;
        let streamer = ai::make_streamer(&config, http.clone());

        Ok(Arc::new(Self {
            config,
            http,
            queue,
            worker,
            tasks: TaskStore::new(),
            hub: EventHub::new(metrics),
            progress: ProgressTracker::new(),
            sink: Arc::new(MemorySink::new()),
            streamer,
        }))
    }

    pub fn sink_dyn(&self) -> Arc<dyn ResultSink> {
        self.sink.clone()
    }

    #[cfg(test)]
    pub fn for_tests(streamer: Arc<dyn GenerationStreamer>) -> Arc<Self> {
        use std::net::SocketAddr;

        use crate::config::QueueConfig;
        use crate::queue::metrics::NoopQueueMetrics;

        let config = AppConfig {
            bind_addr: "127.0.0.1:58080"
                .parse::<SocketAddr>()
                .expect("parse bind addr"),
            public_base_url: url::Url::parse("http://127.0.0.1:58080")
                .expect("parse public base url"),
            queue: QueueConfig::default(),
            ai: None,
        };
        let metrics: Arc<dyn crate::queue::metrics::QueueMetrics> = Arc::new(NoopQueueMetrics);
        let engine = Arc::new(QueueEngine::new(config.queue.clone(), metrics.clone()));
        let queue = Arc::new(QueueService::new(engine));
        let executor: Arc<dyn PayloadExecutor> = Arc::new(SimExecutor);
        let worker = Arc::new(WorkerRuntime::new(queue.clone(), executor));

        Arc::new(Self {
            config,
            http: reqwest::Client::new(),
            queue,
            worker,
            tasks: TaskStore::new(),
            hub: EventHub::new(metrics),
            progress: ProgressTracker::new(),
            sink: Arc::new(MemorySink::new()),
            streamer,
        })
    }
}
