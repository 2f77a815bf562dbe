//! Typed lifecycle events.
//!
//! The [`EventEmitter`] lives on the job store, so queues and workers sharing
//! a store publish into one channel; subscribers get every event produced
//! after the subscription was opened. The same transitions are also appended
//! by the scripts to a capped Redis stream for cross-process consumers.

use serde_json::Value;
use tokio::sync::broadcast;

/// Default buffer size for an emitter channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// A state transition observed by the queue or a worker.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Added { job_id: String, name: String },
    /// The job became claimable (first placement, retry or stalled recovery).
    Waiting { job_id: String },
    Delayed { job_id: String, until_ms: i64 },
    /// A delayed job was promoted ahead of its due time.
    Promoted { job_id: String },
    Active { job_id: String },
    WaitingChildren { job_id: String },
    Completed { job_id: String, return_value: Value },
    Failed { job_id: String, reason: String },
    /// An active job lost its lock and was recovered.
    Stalled { job_id: String },
    GroupPaused { group_id: String },
    GroupResumed { group_id: String },
    GroupRateLimited { group_id: String, until_ms: i64 },
}

/// Broadcast fan-out for [`QueueEvent`]s.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<QueueEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Open a subscription; events published before this call are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn emit(&self, event: QueueEvent) {
        // A send with no subscribers is not an error.
        let _ = self.tx.send(event);
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
