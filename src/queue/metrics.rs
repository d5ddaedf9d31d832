use std::sync::Arc;

use anyhow::{Context, Result};
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};

use crate::config::MetricsBackend;

/// Observability sink for the queue core. Implementations must be cheap:
/// every call sits on the admission or finish path.
pub trait QueueMetrics: Send + Sync {
    fn observe_enqueue(&self, user_id: &str);
    fn observe_admit(&self, user_id: &str);
    fn observe_finish(&self, user_id: &str, success: bool, duration_sec: Option<f64>);
    fn gauge_inflight_global(&self, n: usize);
    fn observe_expire(&self, user_id: &str);
    fn observe_dropped_event(&self);
}

pub struct NoopQueueMetrics;

impl QueueMetrics for NoopQueueMetrics {
    fn observe_enqueue(&self, _user_id: &str) {}
    fn observe_admit(&self, _user_id: &str) {}
    fn observe_finish(&self, _user_id: &str, _success: bool, _duration_sec: Option<f64>) {}
    fn gauge_inflight_global(&self, _n: usize) {}
    fn observe_expire(&self, _user_id: &str) {}
    fn observe_dropped_event(&self) {}
}

pub struct PromQueueMetrics {
    enqueued: IntCounterVec,
    admitted: IntCounterVec,
    finished: IntCounterVec,
    inflight_gauge: IntGauge,
    expired: IntCounterVec,
    dropped_events: IntCounter,
    latency: Histogram,
}

impl PromQueueMetrics {
    pub fn register(registry: &Registry) -> Result<Self> {
        let enqueued = IntCounterVec::new(
            Opts::new("queue_enqueued_total", "Total enqueued items"),
            &["user"],
        )?;
        let admitted = IntCounterVec::new(
            Opts::new("queue_admitted_total", "Total admitted items"),
            &["user"],
        )?;
        let finished = IntCounterVec::new(
            Opts::new("queue_finished_total", "Total finished items by status"),
            &["user", "status"],
        )?;
        let inflight_gauge =
            IntGauge::new("queue_inflight_global", "Current global inflight")?;
        let expired = IntCounterVec::new(
            Opts::new("queue_expired_total", "Total expired items"),
            &["user"],
        )?;
        let dropped_events = IntCounter::new(
            "queue_dropped_events_total",
            "Events dropped on slow subscribers",
        )?;
        let latency = Histogram::with_opts(
            HistogramOpts::new(
                "queue_duration_seconds",
                "Duration from admit to finish in seconds",
            )
            .buckets(vec![
                0.1, 0.3, 1.0, 3.0, 5.0, 10.0, 20.0, 30.0, 60.0, 120.0, 300.0,
            ]),
        )?;

        registry
            .register(Box::new(enqueued.clone()))
            .context("register queue_enqueued_total")?;
        registry
            .register(Box::new(admitted.clone()))
            .context("register queue_admitted_total")?;
        registry
            .register(Box::new(finished.clone()))
            .context("register queue_finished_total")?;
        registry
            .register(Box::new(inflight_gauge.clone()))
            .context("register queue_inflight_global")?;
        registry
            .register(Box::new(expired.clone()))
            .context("register queue_expired_total")?;
        registry
            .register(Box::new(dropped_events.clone()))
            .context("register queue_dropped_events_total")?;
        registry
            .register(Box::new(latency.clone()))
            .context("register queue_duration_seconds")?;

        Ok(Self {
            enqueued,
            admitted,
            finished,
            inflight_gauge,
            expired,
            dropped_events,
            latency,
        })
    }
}

impl QueueMetrics for PromQueueMetrics {
    fn observe_enqueue(&self, user_id: &str) {
        self.enqueued.with_label_values(&[user_id]).inc();
    }

    fn observe_admit(&self, user_id: &str) {
        self.admitted.with_label_values(&[user_id]).inc();
    }

    fn observe_finish(&self, user_id: &str, success: bool, duration_sec: Option<f64>) {
        let status = if success { "success" } else { "failed" };
        self.finished.with_label_values(&[user_id, status]).inc();
        if let Some(dur) = duration_sec {
            self.latency.observe(dur);
        }
    }

    fn gauge_inflight_global(&self, n: usize) {
        self.inflight_gauge.set(n as i64);
    }

    fn observe_expire(&self, user_id: &str) {
        self.expired.with_label_values(&[user_id]).inc();
    }

    fn observe_dropped_event(&self) {
        self.dropped_events.inc();
    }
}

pub fn build_metrics(backend: MetricsBackend) -> Result<Arc<dyn QueueMetrics>> {
    match backend {
        MetricsBackend::Noop => Ok(Arc::new(NoopQueueMetrics)),
        MetricsBackend::Prom => Ok(Arc::new(PromQueueMetrics::register(
            prometheus::default_registry(),
        )?)),
    }
}
