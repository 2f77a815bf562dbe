//! Error types for the queue engine.

use thiserror::Error;

/// Result type alias for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors raised by queue, worker and job operations.
#[derive(Error, Debug)]
pub enum QueueError {
    /// Rejected before any store interaction.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("job {0} not found")]
    JobNotFound(String),

    /// The job's lock key has expired or was never taken.
    #[error("missing lock for job {0}")]
    LockMissing(String),

    /// The lock is held under a different token.
    #[error("lock token mismatch for job {0}")]
    LockMismatch(String),

    #[error("job {id} is not in the {expected} state")]
    JobNotInState { id: String, expected: &'static str },

    #[error("job {0} already exists")]
    DuplicateJobId(String),

    #[error("cannot obliterate a queue with active jobs")]
    ActiveJobsPresent,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("connection pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    #[error("configuration error: {0}")]
    Configuration(String),

    /// A script returned a code outside its documented contract.
    #[error("unexpected response code {code} from {op}")]
    UnexpectedCode { op: &'static str, code: i64 },
}

impl QueueError {
    /// Map a script return code onto the matching fault.
    ///
    /// `expected` names the state the operation required, for `-3` replies.
    pub(crate) fn from_code(
        code: i64,
        op: &'static str,
        job_id: &str,
        expected: &'static str,
    ) -> Self {
        match code {
            -1 => Self::JobNotFound(job_id.to_string()),
            -2 => Self::LockMissing(job_id.to_string()),
            -3 => Self::JobNotInState {
                id: job_id.to_string(),
                expected,
            },
            -6 => Self::LockMismatch(job_id.to_string()),
            -7 => Self::DuplicateJobId(job_id.to_string()),
            -8 => Self::ActiveJobsPresent,
            _ => Self::UnexpectedCode { op, code },
        }
    }

    /// Whether the error is a transient infrastructure failure worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Redis(_) | Self::Pool(_))
    }

    /// Whether the error reports a lost race on job state rather than a fault
    /// in the caller or the infrastructure.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::JobNotFound(_)
                | Self::LockMissing(_)
                | Self::LockMismatch(_)
                | Self::JobNotInState { .. }
                | Self::DuplicateJobId(_)
        )
    }
}

/// Error reported by a job handler.
///
/// Processing errors are retryable by default; [`ProcessError::unrecoverable`]
/// marks a failure that must bypass the retry policy and fail the job
/// terminally.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct ProcessError {
    message: String,
    unrecoverable: bool,
}

impl ProcessError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            unrecoverable: false,
        }
    }

    pub fn unrecoverable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            unrecoverable: true,
        }
    }

    pub fn is_unrecoverable(&self) -> bool {
        self.unrecoverable
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<serde_json::Error> for ProcessError {
    fn from(err: serde_json::Error) -> Self {
        // Deserialization failures are deterministic.
        Self::unrecoverable(format!("payload error: {err}"))
    }
}
