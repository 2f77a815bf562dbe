//! GroupMQ - Group-Aware Job Queue
//!
//! A Redis-backed job queue with:
//! - Per-group FIFO ordering with fair round-robin across groups
//! - Group concurrency caps and sliding-window rate limits
//! - Delayed jobs, priorities and LIFO insertion
//! - Retries with fixed, exponential or custom backoff
//! - Parent jobs that wait for their children
//! - Stalled-job recovery through lock tokens
//! - Lifecycle events in process and on a Redis stream
//!
//! Every state transition runs as a single Lua script, so any number of
//! producers and workers can share a queue without races.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                            Queue                               │
//! │                                                                │
//! │  add() ──┬─► delayed (zset) ──promote──┐                       │
//! │          │                             ▼                       │
//! │          ├─► group backlogs ──┐   ┌─────────┐   ┌───────────┐  │
//! │          │   (zset per group) ├──►│  wait   │◄──│prioritized│  │
//! │          │        ▲           │   │ (list)  │   │  (zset)   │  │
//! │          │   one representative   └────┬────┘   └───────────┘  │
//! │          │   per group in wait         │                       │
//! │          └─────────────────────────────┼──────────────► …     │
//! │                                        ▼                       │
//! │                                   ┌─────────┐                  │
//! │   Worker ──claim──────────────────│ active  │──lock per job    │
//! │     │                             │ (list)  │                  │
//! │     │ process()                   └────┬────┘                  │
//! │     ▼                                  │                       │
//! │  ┌───────────┐   ┌────────┐   ┌────────┴───────────┐           │
//! │  │ completed │   │ failed │   │  waiting-children  │           │
//! │  │  (zset)   │   │ (zset) │   │      (zset)        │           │
//! │  └───────────┘   └────────┘   └────────────────────┘           │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use groupmq::{FnProcessor, JobOptions, ProcessorOutput, Queue, Worker, WorkerOptions};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let queue = Queue::connect("redis://127.0.0.1:6379", "video").await?;
//!
//! // Jobs in the same group run in order; groups round-robin fairly.
//! queue
//!     .add(
//!         "transcode",
//!         json!({"file": "intro.mp4"}),
//!         JobOptions::default().in_group("tenant-1"),
//!     )
//!     .await?;
//!
//! let processor = Arc::new(FnProcessor::new(|job: &mut groupmq::Job| {
//!     Box::pin(async move {
//!         let file: String = job.data["file"].as_str().unwrap_or_default().into();
//!         // ... transcode ...
//!         Ok(ProcessorOutput::value(json!({"transcoded": file})))
//!     })
//! }));
//!
//! let worker = Worker::new(queue.store().clone(), processor, WorkerOptions::default())?;
//! worker.run().await?;
//! ```

pub mod backoff;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod group;
pub mod job;
pub mod metrics;
pub mod options;
pub mod queue;
pub mod redis;
pub mod worker;

pub use backoff::{BackoffDecision, BackoffOptions, CustomBackoff};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{GroupMqConfig, QueueSettings, RedisConfig, WorkerSettings};
pub use error::{ProcessError, QueueError, QueueResult};
pub use events::{EventEmitter, QueueEvent};
pub use group::{GroupCounts, GroupInfo, GroupPolicy, GroupRateLimit, GroupStatus, GroupsSnapshot};
pub use job::{Job, JobState};
pub use metrics::{register_metrics, GroupMetrics, JobMetrics, WorkerMetrics};
pub use options::{GroupOptions, JobOptions, ParentOptions, RetentionPolicy, MAX_PRIORITY};
pub use queue::{JobCounts, NewJob, Queue};
pub use redis::{create_pool, JobStore, RedisKeys};
pub use worker::{
    FnProcessor, JobProcessor, ProcessorOutput, TtlPolicy, Worker, WorkerOptions, WorkerStats,
};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::{ProcessError, QueueError, QueueResult};
    pub use crate::events::QueueEvent;
    pub use crate::group::GroupStatus;
    pub use crate::job::{Job, JobState};
    pub use crate::options::JobOptions;
    pub use crate::queue::{NewJob, Queue};
    pub use crate::worker::{JobProcessor, ProcessorOutput, Worker, WorkerOptions};
}
