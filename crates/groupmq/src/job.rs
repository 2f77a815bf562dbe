//! Job handle and lifecycle transitions.
//!
//! A [`Job`] is a detached view over the Redis job hash plus the lock token
//! the worker claimed it with. Transition methods drive the server-side
//! state machine; the lock token travels with every call that requires the
//! job to be active.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::backoff::{self, BackoffDecision, CustomBackoff};
use crate::error::{ProcessError, QueueError, QueueResult};
use crate::options::JobOptions;
use crate::redis::{FinishTarget, JobStore};

/// Multiplier used to pack a due timestamp and a job-id tail into one
/// delayed-set score. `score / 4096` recovers the due timestamp.
pub const DELAY_SCORE_FACTOR: i64 = 0x1000;

/// Score under which a delayed job is due at `now`: jobs are promotable
/// while their score is below `(now + 1) * 4096`.
pub fn delayed_score(due_ms: i64, job_id: &str) -> i64 {
    due_ms * DELAY_SCORE_FACTOR + numeric_tail(job_id)
}

/// Tie-break component of a delayed score. Non-numeric ids contribute 0.
pub fn numeric_tail(job_id: &str) -> i64 {
    job_id
        .parse::<u64>()
        .map(|n| (n % DELAY_SCORE_FACTOR as u64) as i64)
        .unwrap_or(0)
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    Waiting,
    Paused,
    Delayed,
    Active,
    WaitingChildren,
    Completed,
    Failed,
    /// The job is gone or its state cannot be determined.
    Unknown,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Paused => "paused",
            Self::Delayed => "delayed",
            Self::Active => "active",
            Self::WaitingChildren => "waiting-children",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        }
    }

    /// Whether the state is terminal.
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl From<&str> for JobState {
    fn from(value: &str) -> Self {
        match value {
            "waiting" => Self::Waiting,
            "paused" => Self::Paused,
            "delayed" => Self::Delayed,
            "active" => Self::Active,
            "waiting-children" => Self::WaitingChildren,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inserts the newest frame at the front and drops frames beyond the limit.
pub(crate) fn push_stack_frame(stack: &mut Vec<String>, frame: &str, limit: usize) {
    stack.insert(0, frame.to_string());
    stack.truncate(limit);
}

/// A job fetched from the store.
pub struct Job {
    store: Arc<JobStore>,
    token: Option<String>,
    discarded: bool,

    /// Job id, either generated or caller-supplied.
    pub id: String,

    /// Name given at add time.
    pub name: String,

    /// Payload.
    pub data: Value,

    /// Options the job was added with.
    pub opts: JobOptions,

    /// Milliseconds since epoch when the job was added.
    pub timestamp: i64,

    /// Remaining initial delay in milliseconds.
    pub delay: u64,

    /// Priority. 0 is most urgent.
    pub priority: u32,

    /// Group the job belongs to, if any.
    pub group_id: Option<String>,

    /// Queue-wide ordering sequence assigned at add time.
    pub seq: u64,

    /// Newest-first ordering flag.
    pub lifo: bool,

    /// Attempts started so far, including the current one while active.
    pub attempts_made: u32,

    /// Times the job was reclaimed after a worker stalled.
    pub stalled_count: u32,

    /// When the latest attempt started.
    pub processed_on: Option<i64>,

    /// When the job reached a terminal state.
    pub finished_on: Option<i64>,

    /// Value returned by a successful handler.
    pub return_value: Option<Value>,

    /// Message from the most recent failure.
    pub failed_reason: Option<String>,

    /// Failure frames, newest first, bounded by `opts.stack_trace_limit`.
    pub stacktrace: Vec<String>,

    /// Id of the parent job in this queue, if any.
    pub parent_id: Option<String>,
}

impl Job {
    pub(crate) fn from_hash(
        store: Arc<JobStore>,
        id: String,
        fields: HashMap<String, String>,
    ) -> QueueResult<Self> {
        let opts: JobOptions = match fields.get("opts") {
            Some(raw) => serde_json::from_str(raw)?,
            None => JobOptions::default(),
        };
        let data = match fields.get("data") {
            Some(raw) => serde_json::from_str(raw)?,
            None => Value::Null,
        };
        let stacktrace = match fields.get("stacktrace") {
            Some(raw) if !raw.is_empty() => serde_json::from_str(raw)?,
            _ => Vec::new(),
        };
        let return_value = match fields.get("return_value") {
            Some(raw) if !raw.is_empty() => Some(serde_json::from_str(raw)?),
            _ => None,
        };

        Ok(Self {
            store,
            token: None,
            discarded: false,
            name: fields.get("name").cloned().unwrap_or_default(),
            data,
            timestamp: parse_field(&fields, "timestamp").unwrap_or(0),
            delay: parse_field(&fields, "delay").unwrap_or(0),
            priority: parse_field(&fields, "priority").unwrap_or(0),
            group_id: fields.get("gid").filter(|g| !g.is_empty()).cloned(),
            seq: parse_field(&fields, "pseq").unwrap_or(0),
            lifo: fields.get("lifo").map(String::as_str) == Some("1"),
            attempts_made: parse_field(&fields, "attempts_made").unwrap_or(0),
            stalled_count: parse_field(&fields, "stalled_count").unwrap_or(0),
            processed_on: parse_field(&fields, "processed_on"),
            finished_on: parse_field(&fields, "finished_on"),
            return_value,
            failed_reason: fields.get("failed_reason").filter(|r| !r.is_empty()).cloned(),
            stacktrace,
            parent_id: fields.get("parent").filter(|p| !p.is_empty()).cloned(),
            opts,
            id,
        })
    }

    pub(crate) fn set_token(&mut self, token: String) {
        self.token = Some(token);
    }

    /// Lock token held by this handle, when claimed by a worker.
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn is_grouped(&self) -> bool {
        self.group_id.is_some()
    }

    /// Deserializes the payload into a concrete type. Malformed payloads
    /// surface as unrecoverable processing errors.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, ProcessError> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp)
    }

    pub fn processed_at(&self) -> Option<DateTime<Utc>> {
        self.processed_on.and_then(DateTime::from_timestamp_millis)
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_on.and_then(DateTime::from_timestamp_millis)
    }

    /// Resolves the job's current state from the store.
    pub async fn state(&self) -> QueueResult<JobState> {
        self.store.get_job_state(&self.id).await
    }

    /// Marks the job so the next failure is terminal regardless of the
    /// retry budget.
    pub fn discard(&mut self) {
        self.discarded = true;
    }

    /// Completes the job, storing the handler's return value.
    pub async fn move_to_completed(&mut self, return_value: Value) -> QueueResult<()> {
        let token = self.require_token()?.to_string();
        let prop = serde_json::to_string(&return_value)?;
        self.store
            .finish_job(
                &self.id,
                &token,
                FinishTarget::Completed,
                &prop,
                None,
                self.opts.remove_on_complete.keep_count(),
                self.opts.remove_on_complete.max_age_secs(),
            )
            .await?;
        self.return_value = Some(return_value);
        self.finished_on = Some(self.store.clock().now_ms());
        self.token = None;
        Ok(())
    }

    /// Records a failed attempt and decides where the job goes next:
    /// terminal failure, an immediate retry, or a delayed retry.
    pub async fn move_to_failed(
        &mut self,
        error: &ProcessError,
        custom_backoff: Option<&CustomBackoff>,
    ) -> QueueResult<JobState> {
        let token = self.require_token()?.to_string();
        self.failed_reason = Some(error.message().to_string());
        push_stack_frame(&mut self.stacktrace, error.message(), self.opts.stack_trace_limit);

        let exhausted = self.attempts_made >= self.opts.attempts.max(1);
        if error.is_unrecoverable() || self.discarded || exhausted {
            return self.finish_failed(&token, error.message().to_string()).await;
        }

        let decision = backoff::compute(
            self.opts.backoff.as_ref(),
            self.attempts_made,
            error,
            custom_backoff,
        );
        match decision {
            None => {
                self.finish_failed(&token, "custom backoff strategy is not configured".to_string())
                    .await
            }
            Some(BackoffDecision::DontRetry) => {
                self.finish_failed(&token, error.message().to_string()).await
            }
            Some(BackoffDecision::RetryIn(delay_ms)) => {
                let stack = serde_json::to_string(&self.stacktrace)?;
                if delay_ms == 0 {
                    self.store
                        .retry_job(&self.id, &token, error.message(), &stack)
                        .await?;
                    self.token = None;
                    Ok(JobState::Waiting)
                } else {
                    self.store
                        .delay_job(&self.id, &token, delay_ms, Some(error.message()), Some(&stack))
                        .await?;
                    self.token = None;
                    Ok(JobState::Delayed)
                }
            }
        }
    }

    /// Postpones the active job by `delay_ms` without recording a failure.
    pub async fn move_to_delayed(&mut self, delay_ms: u64) -> QueueResult<()> {
        let token = self.require_token()?.to_string();
        self.store.delay_job(&self.id, &token, delay_ms, None, None).await?;
        self.token = None;
        Ok(())
    }

    /// Parks the job until its pending children finish. Returns `false`
    /// when no children are pending, in which case the job stays active
    /// and keeps its lock.
    pub async fn move_to_waiting_children(&mut self) -> QueueResult<bool> {
        let token = self.require_token()?.to_string();
        let moved = self.store.move_to_waiting_children(&self.id, &token).await?;
        if moved {
            self.token = None;
        }
        Ok(moved)
    }

    /// Promotes the job out of the delayed set ahead of its due time.
    pub async fn promote(&mut self) -> QueueResult<()> {
        self.store.promote_job(&self.id).await?;
        self.delay = 0;
        Ok(())
    }

    /// Pushes the lock expiry `duration_ms` into the future.
    pub async fn extend_lock(&self, duration_ms: u64) -> QueueResult<()> {
        let token = self.require_token()?;
        self.store.extend_lock(&self.id, token, duration_ms).await
    }

    async fn finish_failed(&mut self, token: &str, reason: String) -> QueueResult<JobState> {
        let stack = serde_json::to_string(&self.stacktrace)?;
        self.store
            .finish_job(
                &self.id,
                token,
                FinishTarget::Failed,
                &reason,
                Some(&stack),
                self.opts.remove_on_fail.keep_count(),
                self.opts.remove_on_fail.max_age_secs(),
            )
            .await?;
        self.failed_reason = Some(reason);
        self.finished_on = Some(self.store.clock().now_ms());
        self.token = None;
        Ok(JobState::Failed)
    }

    fn require_token(&self) -> QueueResult<&str> {
        self.token
            .as_deref()
            .ok_or_else(|| QueueError::LockMissing(self.id.clone()))
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("group_id", &self.group_id)
            .field("attempts_made", &self.attempts_made)
            .field("locked", &self.token.is_some())
            .finish_non_exhaustive()
    }
}

fn parse_field<T: std::str::FromStr>(fields: &HashMap<String, String>, key: &str) -> Option<T> {
    fields.get(key).and_then(|raw| raw.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delayed_score_encoding() {
        assert_eq!(delayed_score(1_000, "5"), 1_000 * 4096 + 5);
        assert_eq!(delayed_score(1_000, "4097"), 1_000 * 4096 + 1);
        // The due timestamp survives the packing.
        assert_eq!(delayed_score(987_654, "123") / DELAY_SCORE_FACTOR, 987_654);
    }

    #[test]
    fn test_numeric_tail_of_custom_ids() {
        assert_eq!(numeric_tail("42"), 42);
        assert_eq!(numeric_tail("4096"), 0);
        assert_eq!(numeric_tail("invoice-9"), 0);
        assert_eq!(numeric_tail(""), 0);
    }

    #[test]
    fn test_state_string_mapping() {
        for state in [
            JobState::Waiting,
            JobState::Paused,
            JobState::Delayed,
            JobState::Active,
            JobState::WaitingChildren,
            JobState::Completed,
            JobState::Failed,
        ] {
            assert_eq!(JobState::from(state.as_str()), state);
        }
        assert_eq!(JobState::from("nonsense"), JobState::Unknown);
        assert_eq!(JobState::WaitingChildren.to_string(), "waiting-children");
        assert!(JobState::Completed.is_finished());
        assert!(!JobState::Active.is_finished());
    }

    #[test]
    fn test_stack_frames_newest_first_and_bounded() {
        let mut stack = Vec::new();
        for i in 0..5 {
            push_stack_frame(&mut stack, &format!("frame-{i}"), 3);
        }
        assert_eq!(stack, vec!["frame-4", "frame-3", "frame-2"]);

        let mut empty_limit = vec!["old".to_string()];
        push_stack_frame(&mut empty_limit, "new", 0);
        assert!(empty_limit.is_empty());
    }
}
