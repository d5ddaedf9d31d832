//! Fair-share request queue: per-user FIFOs, round-robin admission under
//! global and per-user concurrency caps, TTL expiry, and ETA estimation.

pub mod engine;
pub mod metrics;
pub mod models;
pub mod repo;
pub mod scheduler;
pub mod service;

pub use engine::QueueEngine;
pub use models::Status;
pub use service::QueueService;
