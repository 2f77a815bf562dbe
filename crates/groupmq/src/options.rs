//! Per-job options supplied at add time.

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffOptions;
use crate::error::{QueueError, QueueResult};

/// Upper bound for job priority. 0 is the default and the most urgent;
/// larger values are scheduled later.
pub const MAX_PRIORITY: u32 = 1 << 21;

/// How many stack frames a job retains across failed attempts.
pub const DEFAULT_STACK_TRACE_LIMIT: usize = 10;

/// Retention policy for finished jobs.
///
/// Accepts three JSON shapes: a bool (`true` removes the job record,
/// `false` keeps everything), a bare number (keep that many most recent
/// records), or an object with optional `count` and `age` (seconds).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RetentionPolicy {
    Flag(bool),
    Count(u64),
    Spec {
        #[serde(default)]
        count: Option<u64>,
        #[serde(default)]
        age: Option<u64>,
    },
}

impl RetentionPolicy {
    /// Number of finished records to keep: -1 keeps all, 0 removes the
    /// record as soon as the job finishes.
    pub(crate) fn keep_count(&self) -> i64 {
        match self {
            Self::Flag(true) => 0,
            Self::Flag(false) => -1,
            Self::Count(n) => *n as i64,
            Self::Spec { count, .. } => count.map_or(-1, |c| c as i64),
        }
    }

    /// Maximum age in seconds for finished records, if bounded.
    pub(crate) fn max_age_secs(&self) -> Option<u64> {
        match self {
            Self::Spec { age, .. } => *age,
            _ => None,
        }
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::Flag(false)
    }
}

/// Group membership for a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupOptions {
    /// Group identifier. Jobs sharing it are processed one at a time
    /// unless the group's concurrency says otherwise.
    pub id: String,

    /// Persisted concurrency cap for the whole group. Overrides the
    /// worker's default for this group.
    #[serde(default)]
    pub concurrency: Option<u32>,
}

impl GroupOptions {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            concurrency: None,
        }
    }
}

/// Dependency link to a parent job in the same queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentOptions {
    /// Id of the parent job.
    pub id: String,
}

/// Options accepted by [`Queue::add`](crate::queue::Queue::add).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    /// Custom job id. Generated from a counter when absent.
    pub job_id: Option<String>,

    /// Initial delay in milliseconds before the job becomes claimable.
    pub delay: u64,

    /// Priority within the queue or group. 0 is most urgent.
    pub priority: u32,

    /// Newest-first ordering instead of the default oldest-first.
    pub lifo: bool,

    /// Total number of attempts including the first one.
    pub attempts: u32,

    /// Backoff applied between failed attempts.
    pub backoff: Option<BackoffOptions>,

    /// Group this job belongs to.
    pub group: Option<GroupOptions>,

    /// Parent job this job is a dependency of.
    pub parent: Option<ParentOptions>,

    /// Propagate a terminal failure of this job to its parent.
    pub fail_parent_on_failure: bool,

    /// Stack frames retained across failed attempts, newest first.
    pub stack_trace_limit: usize,

    /// Retention for completed jobs.
    pub remove_on_complete: RetentionPolicy,

    /// Retention for failed jobs.
    pub remove_on_fail: RetentionPolicy,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            job_id: None,
            delay: 0,
            priority: 0,
            lifo: false,
            attempts: 1,
            backoff: None,
            group: None,
            parent: None,
            fail_parent_on_failure: false,
            stack_trace_limit: DEFAULT_STACK_TRACE_LIMIT,
            remove_on_complete: RetentionPolicy::default(),
            remove_on_fail: RetentionPolicy::default(),
        }
    }
}

impl JobOptions {
    pub fn validate(&self) -> QueueResult<()> {
        if self.attempts == 0 {
            return Err(QueueError::Validation(
                "attempts must be at least 1".to_string(),
            ));
        }
        if self.priority > MAX_PRIORITY {
            return Err(QueueError::Validation(format!(
                "priority must be between 0 and {}",
                MAX_PRIORITY
            )));
        }
        if let Some(id) = &self.job_id {
            if id.is_empty() {
                return Err(QueueError::Validation(
                    "custom job id must not be empty".to_string(),
                ));
            }
        }
        if let Some(group) = &self.group {
            if group.id.is_empty() {
                return Err(QueueError::Validation(
                    "group id must not be empty".to_string(),
                ));
            }
            if group.concurrency == Some(0) {
                return Err(QueueError::Validation(
                    "group concurrency must be at least 1".to_string(),
                ));
            }
        }
        if let Some(parent) = &self.parent {
            if parent.id.is_empty() {
                return Err(QueueError::Validation(
                    "parent job id must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn in_group(mut self, id: impl Into<String>) -> Self {
        self.group = Some(GroupOptions::new(id));
        self
    }

    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay = delay_ms;
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffOptions) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn with_job_id(mut self, id: impl Into<String>) -> Self {
        self.job_id = Some(id.into());
        self
    }

    pub fn with_parent(mut self, id: impl Into<String>) -> Self {
        self.parent = Some(ParentOptions { id: id.into() });
        self
    }
}
